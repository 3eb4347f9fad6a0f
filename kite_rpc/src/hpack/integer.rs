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

//! [Integer Representation] of HPACK.
//!
//! [Integer Representation]: https://httpwg.org/specs/rfc7541.html#integer.representation
//!
//! Integers represent name indexes, field indexes and string lengths. A
//! representation starts anywhere within an octet and always finishes at
//! the end of one.

use core::cmp::Ordering;

use crate::error::ErrorCode;
use crate::Http2Error;

/// `IntegerDecoder` implementation according to `Pseudocode to decode an
/// integer I` in `RFC7541 section-5.1`.
///
/// # Pseudocode
/// ```text
/// decode I from the next N bits
/// if I < 2^N - 1, return I
/// else
///     M = 0
///     repeat
///         B = next octet
///         I = I + (B & 127) * 2^M
///         M = M + 7
///     while B & 128 == 128
///     return I
/// ```
pub(crate) struct IntegerDecoder {
    index: usize,
    shift: u32,
}

impl IntegerDecoder {
    /// Calculates an integer based on the incoming first byte and prefix
    /// mask. If no continuation bytes follow, returns the result directly,
    /// otherwise returns the decoder itself.
    pub(crate) fn first_byte(byte: u8, mask: u8) -> Result<usize, Self> {
        let index = byte & mask;
        match index.cmp(&mask) {
            Ordering::Less => Ok(index as usize),
            _ => Err(Self {
                index: index as usize,
                shift: 1,
            }),
        }
    }

    /// Continues computing the integer with the next byte of input. Returns
    /// `Ok(Some(index))` once the result is complete, `Ok(None)` while more
    /// bytes are needed, and `Err` on overflow.
    pub(crate) fn next_byte(&mut self, byte: u8) -> Result<Option<usize>, Http2Error> {
        self.index = 1usize
            .checked_shl(self.shift - 1)
            .and_then(|res| res.checked_mul((byte & 0x7f) as usize))
            .and_then(|res| res.checked_add(self.index))
            .ok_or(Http2Error::Connection(ErrorCode::CompressionError))?;
        self.shift += 7;
        match (byte & 0x80) == 0x00 {
            true => Ok(Some(self.index)),
            false => Ok(None),
        }
    }
}

/// `IntegerEncoder` implementation according to `Pseudocode to represent an
/// integer I` in `RFC7541 section-5.1`.
///
/// # Pseudocode
/// ```text
/// if I < 2^N - 1, encode I on N bits
/// else
///     encode (2^N - 1) on N bits
///     I = I - (2^N - 1)
///     while I >= 128
///          encode (I % 128 + 128) on 8 bits
///          I = I / 128
///     encode I on 8 bits
/// ```
pub(crate) struct IntegerEncoder {
    i: usize,
    mask: u8,
    pre: u8,
    state: IntegerEncodeState,
}

enum IntegerEncodeState {
    First,
    Other,
    Finish,
}

impl IntegerEncoder {
    /// Creates a new `IntegerEncoder`.
    pub(crate) fn new(i: usize, mask: u8, pre: u8) -> Self {
        Self {
            i,
            mask,
            pre,
            state: IntegerEncodeState::First,
        }
    }

    /// Gets the next byte of the integer. Returns `None` once all bytes have
    /// been produced.
    pub(crate) fn next_byte(&mut self) -> Option<u8> {
        match self.state {
            IntegerEncodeState::First => {
                if self.i < self.mask as usize {
                    self.state = IntegerEncodeState::Finish;
                    return Some(self.pre | (self.i as u8));
                }
                self.i -= self.mask as usize;
                self.state = IntegerEncodeState::Other;
                Some(self.pre | self.mask)
            }
            IntegerEncodeState::Other => Some(if self.i >= 128 {
                let res = (self.i & 0x7f) as u8;
                self.i >>= 7;
                res | 0x80
            } else {
                self.state = IntegerEncodeState::Finish;
                (self.i & 0x7f) as u8
            }),
            IntegerEncodeState::Finish => None,
        }
    }

    /// Checks if the calculation is over.
    pub(crate) fn is_finish(&self) -> bool {
        matches!(self.state, IntegerEncodeState::Finish)
    }
}
