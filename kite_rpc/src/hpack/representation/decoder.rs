// Copyright (c) 2024 Kite RPC Contributors.
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use core::cmp::Ordering;

use crate::error::ErrorCode;
use crate::hpack::integer::IntegerDecoder;
use crate::hpack::representation::{Name, PrefixBit, Representation};
use crate::huffman::HuffmanDecoder;
use crate::Http2Error;

/// Decoder of header field representations. Each call to `decode` tries to
/// produce one `Representation`; once `buf` is exhausted it returns `None`
/// and the caller must `save` the intermediate state for the next slice.
pub(crate) struct ReprDecoder<'a> {
    /// The byte stream still to be decoded.
    buf: &'a [u8],
    /// The state left over from the previous `decode` call.
    state: Option<ReprDecodeState>,
}

impl<'a> ReprDecoder<'a> {
    /// Creates a new `ReprDecoder` whose `state` is empty.
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, state: None }
    }

    /// Loads state from a holder.
    pub(crate) fn load(&mut self, holder: &mut ReprDecStateHolder) {
        self.state = holder.state.take();
    }

    /// Tries to decode the next `Representation` out of `self.buf`.
    pub(crate) fn decode(&mut self) -> Result<Option<Representation>, Http2Error> {
        // If the buffer is exhausted, leave the state unchanged.
        if self.buf.is_empty() {
            return Ok(None);
        }

        match self
            .state
            .take()
            .unwrap_or_else(|| ReprDecodeState::Index(Index::new()))
            .decode(&mut self.buf)
        {
            // Not enough bytes for a complete representation; the caller
            // must `save` and resume with the next slice.
            DecResult::NeedMore(state) => {
                self.state = Some(state);
                Ok(None)
            }
            DecResult::Decoded(repr) => Ok(Some(repr)),
            DecResult::Error(error) => Err(error),
        }
    }

    /// Saves the current state to a holder.
    pub(crate) fn save(self, holder: &mut ReprDecStateHolder) {
        holder.state = self.state
    }
}

/// Holder of the intermediate decode state between input slices.
pub(crate) struct ReprDecStateHolder {
    state: Option<ReprDecodeState>,
}

impl ReprDecStateHolder {
    pub(crate) fn new() -> Self {
        Self { state: None }
    }

    /// `true` when no representation is partially decoded, i.e. the header
    /// block ended on a representation boundary.
    pub(crate) fn is_empty(&self) -> bool {
        self.state.is_none()
    }
}

macro_rules! state_def {
    ($name: ident, $decoded: ty, $($state: ident),* $(,)?) => {
        pub(crate) enum $name {
            $(
                $state($state),
            )*
        }

        impl $name {
            fn decode(self, buf: &mut &[u8]) -> DecResult<$decoded, $name> {
                match self {
                    $(
                        Self::$state(state) => state.decode(buf),
                    )*
                }
            }
        }

        $(
            impl From<$state> for $name {
                fn from(s: $state) -> Self {
                    Self::$state(s)
                }
            }
        )*
    }
}

// Representation decoding state diagram:
//
//                    ┌ `Index` ─ `IndexInner` ┬ `FirstByte`
//                    │                        └ `TrailingBytes`
//                    │
// `ReprDecodeState`  ┼ `NameString`  ┐                 ┌ `LengthFirstByte`
//                    │               ├ `LiteralString` ┼ `LengthTrailingBytes`
//                    └ `ValueString` ┘                 ├ `AsciiStringBytes`
//                                                      └ `HuffmanStringBytes`

state_def!(
    ReprDecodeState,
    Representation,
    Index,
    NameString,
    ValueString
);

state_def!(IndexInner, (PrefixBit, usize), FirstByte, TrailingBytes);

state_def!(
    LiteralString,
    Vec<u8>,
    LengthFirstByte,
    LengthTrailingBytes,
    AsciiStringBytes,
    HuffmanStringBytes,
);

/// `Index` decodes the leading prefix-and-index part of a representation.
pub(crate) struct Index {
    inner: IndexInner,
}

impl Index {
    fn new() -> Self {
        Self::from_inner(FirstByte.into())
    }

    fn from_inner(inner: IndexInner) -> Self {
        Self { inner }
    }

    fn decode(self, buf: &mut &[u8]) -> DecResult<Representation, ReprDecodeState> {
        match self.inner.decode(buf) {
            // RFC7541-6.1: the index value of 0 is not used; it must be
            // treated as a decoding error in an indexed representation.
            DecResult::Decoded((PrefixBit::INDEXED, 0)) => {
                Http2Error::Connection(ErrorCode::CompressionError).into()
            }
            DecResult::Decoded((PrefixBit::INDEXED, index)) => {
                DecResult::Decoded(Representation::Indexed { index })
            }
            DecResult::Decoded((PrefixBit::SIZE_UPDATE, max_size)) => {
                DecResult::Decoded(Representation::SizeUpdate { max_size })
            }
            DecResult::Decoded((repr, 0)) => NameString::new(repr).decode(buf),
            DecResult::Decoded((repr, index)) => {
                ValueString::new(repr, Name::Index(index)).decode(buf)
            }
            DecResult::NeedMore(inner) => DecResult::NeedMore(Index::from_inner(inner).into()),
            DecResult::Error(e) => e.into(),
        }
    }
}

/// `NameString` decodes the literal name of a "new name" representation.
pub(crate) struct NameString {
    repr: PrefixBit,
    inner: LiteralString,
}

impl NameString {
    fn new(repr: PrefixBit) -> Self {
        Self::from_inner(repr, LengthFirstByte.into())
    }

    fn from_inner(repr: PrefixBit, inner: LiteralString) -> Self {
        Self { repr, inner }
    }

    fn decode(self, buf: &mut &[u8]) -> DecResult<Representation, ReprDecodeState> {
        match self.inner.decode(buf) {
            DecResult::Decoded(octets) => {
                ValueString::new(self.repr, Name::Literal(octets)).decode(buf)
            }
            DecResult::NeedMore(inner) => {
                DecResult::NeedMore(Self::from_inner(self.repr, inner).into())
            }
            DecResult::Error(e) => e.into(),
        }
    }
}

/// `ValueString` decodes the literal value string of a representation.
pub(crate) struct ValueString {
    repr: PrefixBit,
    name: Name,
    inner: LiteralString,
}

impl ValueString {
    fn new(repr: PrefixBit, name: Name) -> Self {
        Self::from_inner(repr, name, LengthFirstByte.into())
    }

    fn from_inner(repr: PrefixBit, name: Name, inner: LiteralString) -> Self {
        Self { repr, name, inner }
    }

    fn decode(self, buf: &mut &[u8]) -> DecResult<Representation, ReprDecodeState> {
        match (self.repr, self.inner.decode(buf)) {
            (PrefixBit::LITERAL_WITH_INDEXING, DecResult::Decoded(value)) => {
                DecResult::Decoded(Representation::LiteralWithIndexing {
                    name: self.name,
                    value,
                })
            }
            (PrefixBit::LITERAL_WITHOUT_INDEXING, DecResult::Decoded(value)) => {
                DecResult::Decoded(Representation::LiteralWithoutIndexing {
                    name: self.name,
                    value,
                })
            }
            (_, DecResult::Decoded(value)) => {
                DecResult::Decoded(Representation::LiteralNeverIndexed {
                    name: self.name,
                    value,
                })
            }
            (_, DecResult::NeedMore(inner)) => {
                DecResult::NeedMore(Self::from_inner(self.repr, self.name, inner).into())
            }
            (_, DecResult::Error(e)) => e.into(),
        }
    }
}

/// `FirstByte` decodes the first octet of the prefixed index.
pub(crate) struct FirstByte;

impl FirstByte {
    fn decode(self, buf: &mut &[u8]) -> DecResult<(PrefixBit, usize), IndexInner> {
        if buf.is_empty() {
            return DecResult::NeedMore(self.into());
        }

        let byte = buf[0];
        let repr = PrefixBit::from_u8(byte);
        let mask = repr.prefix_index_mask();

        *buf = &buf[1..];
        match IntegerDecoder::first_byte(byte, mask.0) {
            Ok(idx) => DecResult::Decoded((repr, idx)),
            Err(int) => TrailingBytes::new(repr, int).decode(buf),
        }
    }
}

/// `TrailingBytes` decodes the continuation octets of the prefixed index.
pub(crate) struct TrailingBytes {
    repr: PrefixBit,
    index: IntegerDecoder,
}

impl TrailingBytes {
    fn new(repr: PrefixBit, index: IntegerDecoder) -> Self {
        Self { repr, index }
    }

    fn decode(mut self, buf: &mut &[u8]) -> DecResult<(PrefixBit, usize), IndexInner> {
        loop {
            if buf.is_empty() {
                return DecResult::NeedMore(self.into());
            }

            let byte = buf[0];
            *buf = &buf[1..];
            match self.index.next_byte(byte) {
                Ok(None) => {}
                Ok(Some(index)) => return DecResult::Decoded((self.repr, index)),
                Err(e) => return e.into(),
            }
        }
    }
}

/// `LengthFirstByte` decodes the first octet of a string length, whose high
/// bit selects Huffman coding.
pub(crate) struct LengthFirstByte;

impl LengthFirstByte {
    fn decode(self, buf: &mut &[u8]) -> DecResult<Vec<u8>, LiteralString> {
        if buf.is_empty() {
            return DecResult::NeedMore(self.into());
        }

        let byte = buf[0];
        *buf = &buf[1..];
        match (
            IntegerDecoder::first_byte(byte, 0x7f),
            (byte & 0x80) == 0x80,
        ) {
            (Ok(len), true) => HuffmanStringBytes::new(len).decode(buf),
            (Ok(len), false) => AsciiStringBytes::new(len).decode(buf),
            (Err(int), huffman) => LengthTrailingBytes::new(huffman, int).decode(buf),
        }
    }
}

/// `LengthTrailingBytes` decodes the continuation octets of a string length.
pub(crate) struct LengthTrailingBytes {
    is_huffman: bool,
    length: IntegerDecoder,
}

impl LengthTrailingBytes {
    fn new(is_huffman: bool, length: IntegerDecoder) -> Self {
        Self { is_huffman, length }
    }

    fn decode(mut self, buf: &mut &[u8]) -> DecResult<Vec<u8>, LiteralString> {
        loop {
            if buf.is_empty() {
                return DecResult::NeedMore(self.into());
            }

            let byte = buf[0];
            *buf = &buf[1..];
            match (self.length.next_byte(byte), self.is_huffman) {
                (Ok(None), _) => {}
                (Err(e), _) => return e.into(),
                (Ok(Some(length)), true) => return HuffmanStringBytes::new(length).decode(buf),
                (Ok(Some(length)), false) => return AsciiStringBytes::new(length).decode(buf),
            }
        }
    }
}

/// `AsciiStringBytes` collects the octets of an uncoded string literal.
pub(crate) struct AsciiStringBytes {
    octets: Vec<u8>,
    length: usize,
}

impl AsciiStringBytes {
    fn new(length: usize) -> Self {
        Self {
            octets: Vec::new(),
            length,
        }
    }

    fn decode(mut self, buf: &mut &[u8]) -> DecResult<Vec<u8>, LiteralString> {
        match (buf.len() + self.octets.len()).cmp(&self.length) {
            Ordering::Greater | Ordering::Equal => {
                let pos = self.length - self.octets.len();
                self.octets.extend_from_slice(&buf[..pos]);
                *buf = &buf[pos..];
                DecResult::Decoded(self.octets)
            }
            Ordering::Less => {
                self.octets.extend_from_slice(buf);
                *buf = &buf[buf.len()..];
                DecResult::NeedMore(self.into())
            }
        }
    }
}

/// `HuffmanStringBytes` feeds the octets of a Huffman-coded string literal
/// through the incremental Huffman decoder.
pub(crate) struct HuffmanStringBytes {
    huffman: HuffmanDecoder,
    read: usize,
    length: usize,
}

impl HuffmanStringBytes {
    fn new(length: usize) -> Self {
        Self {
            huffman: HuffmanDecoder::new(),
            read: 0,
            length,
        }
    }

    fn decode(mut self, buf: &mut &[u8]) -> DecResult<Vec<u8>, LiteralString> {
        match (buf.len() + self.read).cmp(&self.length) {
            Ordering::Greater | Ordering::Equal => {
                let pos = self.length - self.read;
                if self.huffman.decode(&buf[..pos]).is_err() {
                    return Http2Error::Connection(ErrorCode::CompressionError).into();
                }
                *buf = &buf[pos..];
                match self.huffman.finish() {
                    Ok(vec) => DecResult::Decoded(vec),
                    Err(_) => Http2Error::Connection(ErrorCode::CompressionError).into(),
                }
            }
            Ordering::Less => {
                if self.huffman.decode(buf).is_err() {
                    return Http2Error::Connection(ErrorCode::CompressionError).into();
                }
                self.read += buf.len();
                *buf = &buf[buf.len()..];
                DecResult::NeedMore(self.into())
            }
        }
    }
}

/// Possible outcomes of one decoding step.
enum DecResult<D, S> {
    /// A `D` was produced; the caller may continue for the next one.
    Decoded(D),

    /// More bytes are needed; `S` is the state to resume from.
    NeedMore(S),

    /// A decoding error.
    Error(Http2Error),
}

impl<D, S> From<Http2Error> for DecResult<D, S> {
    fn from(e: Http2Error) -> Self {
        DecResult::Error(e)
    }
}

#[cfg(test)]
mod ut_repr_decoder {
    use super::*;
    use crate::test_util::decode;

    /// UT test cases for `ReprDecoder`.
    ///
    /// # Brief
    /// 1. Creates a `ReprDecoder`.
    /// 2. Calls `ReprDecoder::decode()` over the RFC7541 appendix examples.
    /// 3. Checks if the test results are correct.
    #[test]
    fn ut_repr_decoder() {
        rfc7541_test_cases();

        macro_rules! inner_test_case {
            ($decoder: expr, $pat: ident => $name: expr) => {
                match $decoder.decode() {
                    Ok(Some(Representation::$pat { index })) => assert_eq!($name, index),
                    _ => panic!("ReprDecoder::decode() failed!"),
                }
            };
            ($decoder: expr, $pat: ident, $kind: ident => $name: expr, $value: expr) => {
                match $decoder.decode() {
                    Ok(Some(Representation::$pat {
                        name: Name::$kind(n),
                        value: v,
                    })) => {
                        assert_eq!($name, n);
                        assert_eq!($value, v);
                    }
                    _ => panic!("ReprDecoder::decode() failed!"),
                }
            };
        }

        macro_rules! repr_test_case {
            ($octets: literal, $({ $pat: ident $(, $kind: ident)? => $first: expr $(, $second: expr)?} $(,)?)*) => {
                let slice = decode($octets).unwrap();
                let mut decoder = ReprDecoder::new(&slice);
                $(
                    inner_test_case!(decoder, $pat $(, $kind)? => $first $(, $second)?);
                )*
            }
        }

        /// The following test cases are from RFC7541.
        fn rfc7541_test_cases() {
            // C.2.1. Literal Header Field with Indexing
            repr_test_case!(
                "400a637573746f6d2d6b65790d637573746f6d2d686561646572",
                { LiteralWithIndexing, Literal => b"custom-key".to_vec(), b"custom-header".to_vec() }
            );

            // C.2.2. Literal Header Field without Indexing
            repr_test_case!(
                "040c2f73616d706c652f70617468",
                { LiteralWithoutIndexing, Index => 4, b"/sample/path".to_vec() }
            );

            // C.2.3. Literal Header Field Never Indexed
            repr_test_case!(
                "100870617373776f726406736563726574",
                { LiteralNeverIndexed, Literal => b"password".to_vec(), b"secret".to_vec() }
            );

            // C.2.4. Indexed Header Field
            repr_test_case!(
                "82",
                { Indexed => 2 }
            );

            // C.3.2. Second Request
            repr_test_case!(
                "828684be58086e6f2d6361636865",
                { Indexed => 2 },
                { Indexed => 6 },
                { Indexed => 4 },
                { Indexed => 62 },
                { LiteralWithIndexing, Index => 24, b"no-cache".to_vec() }
            );

            // C.4.3. Third Request
            repr_test_case!(
                "828785bf408825a849e95ba97d7f8925a849e95bb8e8b4bf",
                { Indexed => 2 },
                { Indexed => 7 },
                { Indexed => 5 },
                { Indexed => 63 },
                { LiteralWithIndexing, Literal => b"custom-key".to_vec(), b"custom-value".to_vec() }
            );

            // C.5.1. First Response
            repr_test_case!(
                "4803333032580770726976617465611d\
                4d6f6e2c203231204f63742032303133\
                2032303a31333a323120474d546e1768\
                747470733a2f2f7777772e6578616d70\
                6c652e636f6d",
                { LiteralWithIndexing, Index => 8, b"302".to_vec() },
                { LiteralWithIndexing, Index => 24, b"private".to_vec() },
                { LiteralWithIndexing, Index => 33, b"Mon, 21 Oct 2013 20:13:21 GMT".to_vec() },
                { LiteralWithIndexing, Index => 46, b"https://www.example.com".to_vec() }
            );

            // C.6.2. Second Response
            repr_test_case!(
                "4883640effc1c0bf",
                { LiteralWithIndexing, Index => 8, b"307".to_vec() },
                { Indexed => 65 },
                { Indexed => 64 },
                { Indexed => 63 }
            );
        }
    }

    /// UT test cases for decoding across slice boundaries.
    ///
    /// # Brief
    /// 1. Splits an encoded representation into single bytes.
    /// 2. Saves and reloads the decode state between slices.
    /// 3. Checks the final representation.
    #[test]
    fn ut_repr_decoder_segmented() {
        let bytes = decode("040c2f73616d706c652f70617468").unwrap();
        let mut holder = ReprDecStateHolder::new();
        for (i, chunk) in bytes.chunks(1).enumerate() {
            let mut decoder = ReprDecoder::new(chunk);
            decoder.load(&mut holder);
            match decoder.decode() {
                Ok(Some(Representation::LiteralWithoutIndexing {
                    name: Name::Index(n),
                    value,
                })) => {
                    assert_eq!(i, bytes.len() - 1);
                    assert_eq!(n, 4);
                    assert_eq!(value, b"/sample/path".to_vec());
                    return;
                }
                Ok(None) => decoder.save(&mut holder),
                _ => panic!("ReprDecoder::decode() failed!"),
            }
        }
        panic!("representation never completed!");
    }
}
