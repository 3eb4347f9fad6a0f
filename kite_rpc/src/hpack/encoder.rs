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

use crate::hpack::representation::{ReprEncStateHolder, ReprEncoder};
use crate::hpack::table::DynamicTable;
use crate::metadata::MetadataList;

/// Encoder implementation of [`HPACK`].
///
/// [`HPACK`]: https://httpwg.org/specs/rfc7541.html
///
/// For every element the encoder picks the cheapest representation the
/// tables allow: a full index match, a name-only match with a literal
/// value, or a fully literal field. Sensitive elements are always emitted
/// as never-indexed literals. Encoding is segmentable: `encode` fills the
/// given slice and parks the rest until the next call.
pub struct HpackEncoder {
    table: DynamicTable,
    holder: ReprEncStateHolder,
    use_huffman: bool,
}

impl HpackEncoder {
    /// Creates an `HpackEncoder` with the given dynamic table budget and
    /// Huffman preference.
    pub fn new(max_size: usize, use_huffman: bool) -> Self {
        Self {
            table: DynamicTable::with_max_size(max_size),
            holder: ReprEncStateHolder::new(),
            use_huffman,
        }
    }

    /// Applies the peer's SETTINGS_HEADER_TABLE_SIZE. The local budget only
    /// ever shrinks toward the peer's limit; staying at or below it keeps
    /// both tables evicting in step without a size-update instruction.
    pub fn update_max_dynamic_table_size(&mut self, max_size: usize) {
        if max_size < self.table.max_size() {
            self.table.update_size(max_size);
        }
    }

    /// Sets the metadata list to be encoded.
    pub fn set_metadata(&mut self, list: MetadataList) {
        self.holder.set_list(list)
    }

    /// Encodes the previously set metadata into `dst`, returning the number
    /// of bytes written. Call repeatedly with fresh slices until
    /// `is_finished` reports completion.
    pub fn encode(&mut self, dst: &mut [u8]) -> usize {
        let mut encoder = ReprEncoder::new(&mut self.table);
        encoder.load(&mut self.holder);
        let size = encoder.encode(dst, self.use_huffman);
        if size == dst.len() {
            encoder.save(&mut self.holder);
        }
        size
    }

    /// Checks whether the previously set metadata is fully encoded.
    pub fn is_finished(&self) -> bool {
        self.holder.is_empty()
    }
}

#[cfg(test)]
mod ut_hpack_encoder {
    use super::*;
    use crate::metadata::SharedInterner;
    use crate::test_util::decode;

    macro_rules! hpack_test_cases {
        ($enc: expr, $len: expr, $res: literal, $size: expr, [ $(($k: literal, $v: literal)),* $(,)? ] $(,)?) => {
            let interner = SharedInterner::new();
            let encoder = $enc;
            let mut buf = [0u8; $len];
            let list = interner.list_from_pairs([$(($k, $v)),*]);
            encoder.set_metadata(list);
            let cur = encoder.encode(&mut buf);
            assert!(encoder.is_finished());
            assert_eq!(cur, $len);
            assert_eq!(buf.as_slice(), decode($res).unwrap().as_slice());
            assert_eq!(encoder.table.curr_size(), $size);
        }
    }

    /// UT test cases for `HpackEncoder` over the RFC7541 appendix examples.
    ///
    /// # Brief
    /// 1. Creates an `HpackEncoder`.
    /// 2. Encodes the example metadata lists.
    /// 3. Checks the octets and the dynamic table size.
    #[test]
    fn ut_hpack_encoder() {
        // C.2.1. Literal Header Field with Indexing
        hpack_test_cases!(
            &mut HpackEncoder::new(4096, false),
            26,
            "400a637573746f6d2d6b65790d637573746f6d2d686561646572",
            55,
            [("custom-key", "custom-header")],
        );

        // C.2.4. Indexed Header Field
        hpack_test_cases!(
            &mut HpackEncoder::new(4096, false),
            1,
            "82",
            0,
            [(":method", "GET")],
        );

        // C.3. Request Examples without Huffman Coding
        {
            let mut encoder = HpackEncoder::new(4096, false);
            // C.3.1. First Request
            hpack_test_cases!(
                &mut encoder,
                20,
                "828684410f7777772e6578616d706c652e636f6d",
                57,
                [
                    (":method", "GET"),
                    (":scheme", "http"),
                    (":path", "/"),
                    (":authority", "www.example.com"),
                ],
            );

            // C.3.2. Second Request
            hpack_test_cases!(
                &mut encoder,
                14,
                "828684be58086e6f2d6361636865",
                110,
                [
                    (":method", "GET"),
                    (":scheme", "http"),
                    (":path", "/"),
                    (":authority", "www.example.com"),
                    ("cache-control", "no-cache"),
                ],
            );

            // C.3.3. Third Request
            hpack_test_cases!(
                &mut encoder,
                29,
                "828785bf400a637573746f6d2d6b65790c637573746f6d2d76616c7565",
                164,
                [
                    (":method", "GET"),
                    (":scheme", "https"),
                    (":path", "/index.html"),
                    (":authority", "www.example.com"),
                    ("custom-key", "custom-value"),
                ],
            );
        }

        // C.5. Response Examples without Huffman Coding
        {
            let mut encoder = HpackEncoder::new(256, false);
            // C.5.1. First Response
            hpack_test_cases!(
                &mut encoder,
                70,
                "4803333032580770726976617465611d\
                4d6f6e2c203231204f63742032303133\
                2032303a31333a323120474d546e1768\
                747470733a2f2f7777772e6578616d70\
                6c652e636f6d",
                222,
                [
                    (":status", "302"),
                    ("cache-control", "private"),
                    ("date", "Mon, 21 Oct 2013 20:13:21 GMT"),
                    ("location", "https://www.example.com"),
                ],
            );

            // C.5.2. Second Response
            hpack_test_cases!(
                &mut encoder,
                8,
                "4803333037c1c0bf",
                222,
                [
                    (":status", "307"),
                    ("cache-control", "private"),
                    ("date", "Mon, 21 Oct 2013 20:13:21 GMT"),
                    ("location", "https://www.example.com"),
                ],
            );
        }
    }

    /// UT test cases for the round-trip property.
    ///
    /// # Brief
    /// 1. Encodes a metadata list with dynamic-table state already built up.
    /// 2. Decodes the result with a matching decoder.
    /// 3. Checks byte-for-byte equality of the key/value sequence.
    #[test]
    fn ut_hpack_round_trip() {
        use crate::hpack::HpackDecoder;

        let interner = SharedInterner::new();
        let mut encoder = HpackEncoder::new(4096, true);
        let mut decoder = HpackDecoder::with_max_size(4096, 16 << 20, SharedInterner::new());

        for _ in 0..3 {
            let list = interner.list_from_pairs([
                (":method", "POST"),
                (":path", "/svc/Method"),
                ("content-type", "application/grpc"),
                ("user-agent", "kite-rpc/1.0"),
            ]);
            encoder.set_metadata(list.clone());
            let mut buf = [0u8; 256];
            let size = encoder.encode(&mut buf);
            assert!(encoder.is_finished());

            decoder.decode(&buf[..size]).unwrap();
            let decoded = decoder.finish().unwrap();
            assert_eq!(decoded.len(), list.len());
            for (a, b) in decoded.iter().zip(list.iter()) {
                assert_eq!(a.key(), b.key());
                assert_eq!(a.value(), b.value());
            }
        }
    }

    /// UT test cases for `HpackEncoder::update_max_dynamic_table_size`.
    ///
    /// # Brief
    /// 1. Fills the table, then applies a smaller peer limit.
    /// 2. Checks the table evicts down to the new budget and never grows
    ///    back above it.
    #[test]
    fn ut_hpack_encoder_update_table_size() {
        let interner = SharedInterner::new();
        let mut encoder = HpackEncoder::new(4096, false);
        encoder.set_metadata(interner.list_from_pairs([("custom-key", "custom-header")]));
        let mut buf = [0u8; 64];
        encoder.encode(&mut buf);
        assert_eq!(encoder.table.curr_size(), 55);

        encoder.update_max_dynamic_table_size(40);
        assert_eq!(encoder.table.curr_size(), 0);
        assert_eq!(encoder.table.max_size(), 40);

        encoder.update_max_dynamic_table_size(4096);
        assert_eq!(encoder.table.max_size(), 40);
    }
}
