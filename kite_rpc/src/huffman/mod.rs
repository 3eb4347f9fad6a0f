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

//! [Huffman coding] for HPACK string literals.
//!
//! [Huffman coding]: https://www.rfc-editor.org/rfc/rfc7541.html#ref-HUFFMAN
//!
//! The code is the canonical table of RFC 7541 Appendix B, generated from
//! statistics over a large sample of HTTP headers. Encoding packs codes into
//! a 64-bit accumulator; decoding walks a binary trie built once from the
//! same table, so the two directions can never disagree about the code.

mod consts;

use core::cmp::Ordering;
use std::sync::OnceLock;

use consts::HUFFMAN_CODE;

/// Huffman-encodes `src`, appending the code bytes to `dst`. The final
/// partial byte, if any, is padded with the most significant bits of the
/// EOS symbol (all ones).
pub(crate) fn huffman_encode(src: &[u8], dst: &mut Vec<u8>) {
    // `state` accumulates result bits from the high end; `unfilled` is the
    // number of low bits still unused. Whenever the accumulator fills, its
    // eight bytes are flushed and the overflow bits restart it.
    let mut state = 0u64;
    let mut unfilled = 64u32;

    for byte in src.iter() {
        let (nbits, code) = HUFFMAN_CODE[*byte as usize];
        let nbits = nbits as u32;
        let code = code as u64;
        match unfilled.cmp(&nbits) {
            Ordering::Greater => {
                state |= code << (unfilled - nbits);
                unfilled -= nbits;
            }
            Ordering::Equal => {
                state |= code;
                dst.extend_from_slice(&state.to_be_bytes());
                state = 0;
                unfilled = 64;
            }
            Ordering::Less => {
                // The low `unfilled` bits of the code complete the
                // accumulator; the remaining high bits restart it.
                let overflow = nbits - unfilled;
                state |= code >> overflow;
                dst.extend_from_slice(&state.to_be_bytes());
                state = code << (64 - overflow);
                unfilled = 64 - overflow;
            }
        }
    }

    if unfilled != 64 {
        // EOS-prefix padding for the last partial byte.
        state |= u64::MAX >> (64 - unfilled);
        let filled_bytes = (8 - (unfilled / 8)) as usize;
        dst.extend_from_slice(&state.to_be_bytes()[..filled_bytes]);
    }
}

const EOS: u16 = 256;
const NO_NODE: u16 = u16::MAX;

struct DecodeNode {
    children: [u16; 2],
    symbol: Option<u16>,
}

struct DecodeTree {
    nodes: Vec<DecodeNode>,
}

impl DecodeTree {
    fn build() -> Self {
        let mut nodes = vec![DecodeNode {
            children: [NO_NODE; 2],
            symbol: None,
        }];
        for (symbol, (nbits, code)) in HUFFMAN_CODE.iter().enumerate() {
            let mut node = 0usize;
            for depth in (0..*nbits).rev() {
                let bit = ((code >> depth) & 1) as usize;
                let next = nodes[node].children[bit];
                node = if next == NO_NODE {
                    nodes.push(DecodeNode {
                        children: [NO_NODE; 2],
                        symbol: None,
                    });
                    let idx = nodes.len() - 1;
                    nodes[node].children[bit] = idx as u16;
                    idx
                } else {
                    next as usize
                };
            }
            nodes[node].symbol = Some(symbol as u16);
        }
        Self { nodes }
    }
}

fn decode_tree() -> &'static DecodeTree {
    static TREE: OnceLock<DecodeTree> = OnceLock::new();
    TREE.get_or_init(DecodeTree::build)
}

/// Decodes a complete Huffman-coded string in one call, appending the
/// literal bytes to `dst`.
pub(crate) fn huffman_decode(src: &[u8], dst: &mut Vec<u8>) -> Result<(), HuffmanDecodeError> {
    let mut decoder = HuffmanDecoder::new();
    decoder.decode(src)?;
    *dst = decoder.finish()?;
    Ok(())
}

/// Incremental Huffman decoder: the coded string may arrive in arbitrary
/// slices across multiple `decode` calls; `finish` validates the padding
/// and yields the literal bytes.
pub(crate) struct HuffmanDecoder {
    node: u16,
    // Bits consumed since the last emitted symbol, and whether all of them
    // were ones. Up to seven all-ones bits are legal EOS-prefix padding.
    pending_bits: u8,
    pending_all_ones: bool,
    vec: Vec<u8>,
}

impl HuffmanDecoder {
    /// Creates a new, empty `HuffmanDecoder`.
    pub(crate) fn new() -> Self {
        Self {
            node: 0,
            pending_bits: 0,
            pending_all_ones: true,
            vec: Vec::new(),
        }
    }

    /// Decodes the next slice of the coded string.
    pub(crate) fn decode(&mut self, src: &[u8]) -> Result<(), HuffmanDecodeError> {
        let tree = decode_tree();
        for byte in src.iter() {
            for depth in (0..8).rev() {
                let bit = ((byte >> depth) & 1) as usize;
                let next = tree.nodes[self.node as usize].children[bit];
                if next == NO_NODE {
                    return Err(HuffmanDecodeError::InvalidHuffmanCode);
                }
                self.pending_bits = self.pending_bits.saturating_add(1);
                self.pending_all_ones &= bit == 1;
                match tree.nodes[next as usize].symbol {
                    // RFC7541-5.2: a decoded EOS symbol is a decoding error.
                    Some(EOS) => return Err(HuffmanDecodeError::InvalidHuffmanCode),
                    Some(symbol) => {
                        self.vec.push(symbol as u8);
                        self.node = 0;
                        self.pending_bits = 0;
                        self.pending_all_ones = true;
                    }
                    None => self.node = next,
                }
            }
        }
        Ok(())
    }

    /// Finishes decoding and returns the literal bytes. Trailing bits are
    /// accepted only as a short (less than one octet) all-ones EOS prefix.
    pub(crate) fn finish(self) -> Result<Vec<u8>, HuffmanDecodeError> {
        if self.pending_bits != 0 && !(self.pending_bits < 8 && self.pending_all_ones) {
            return Err(HuffmanDecodeError::InvalidHuffmanCode);
        }
        Ok(self.vec)
    }
}

/// Possible errors of Huffman decoding.
#[derive(Debug)]
pub(crate) enum HuffmanDecodeError {
    InvalidHuffmanCode,
}

#[cfg(test)]
mod ut_huffman {
    use super::{huffman_decode, huffman_encode, HuffmanDecoder};
    use crate::test_util::decode;

    /// UT test cases for `huffman_encode`.
    ///
    /// # Brief
    /// 1. Calls `huffman_encode`, passing in the specified parameters.
    /// 2. Checks if the test results are correct.
    #[test]
    fn ut_huffman_encode() {
        rfc7541_test_cases();

        macro_rules! huffman_test_case {
            ($ctn: expr, $res: expr $(,)?) => {
                let mut vec = Vec::new();
                huffman_encode($ctn.as_bytes(), &mut vec);
                assert_eq!(vec, decode($res).unwrap())
            };
        }

        /// The following test cases are from RFC7541.
        fn rfc7541_test_cases() {
            // C.4.1 First Request
            huffman_test_case!("www.example.com", "f1e3c2e5f23a6ba0ab90f4ff");

            // C.4.2 Second Request
            huffman_test_case!("no-cache", "a8eb10649cbf");

            // C.4.3 Third Request
            huffman_test_case!("custom-value", "25a849e95bb8e8b4bf");

            // C.6.1 First Response
            huffman_test_case!("302", "6402");
            huffman_test_case!("private", "aec3771a4b");
            huffman_test_case!(
                "Mon, 21 Oct 2013 20:13:21 GMT",
                "d07abe941054d444a8200595040b8166e082a62d1bff"
            );
            huffman_test_case!(
                "https://www.example.com",
                "9d29ad171863c78f0b97c8e9ae82ae43d3"
            );

            // C.6.2 Second Response
            huffman_test_case!("307", "640eff");

            // C.6.3 Third Response
            huffman_test_case!("gzip", "9bd9ab");
            huffman_test_case!(
                "foo=ASDJKHQKBZXOQWEOPIUAXQWEOIU; max-age=3600; version=1",
                "94e7821dd7f2e6c7b335dfdfcd5b3960d5af27087f3672c1ab270fb5291f9587316065c003ed4ee5b1063d5007",
            );
        }
    }

    /// UT test cases for `huffman_decode`.
    ///
    /// # Brief
    /// 1. Calls `huffman_decode`, passing in the specified parameters.
    /// 2. Checks if the test results are correct.
    #[test]
    fn ut_huffman_decode() {
        rfc7541_test_cases();

        macro_rules! huffman_test_case {
            ($ctn: expr, $res: expr $(,)?) => {
                let mut vec = Vec::new();
                huffman_decode(decode($ctn).unwrap().as_slice(), &mut vec).unwrap();
                assert_eq!(vec.as_slice(), $res.as_bytes())
            };
        }

        /// The following test cases are from RFC7541.
        fn rfc7541_test_cases() {
            huffman_test_case!("f1e3c2e5f23a6ba0ab90f4ff", "www.example.com");
            huffman_test_case!("a8eb10649cbf", "no-cache");
            huffman_test_case!("25a849e95bb8e8b4bf", "custom-value");
            huffman_test_case!("6402", "302");
            huffman_test_case!("aec3771a4b", "private");
            huffman_test_case!(
                "d07abe941054d444a8200595040b8166e082a62d1bff",
                "Mon, 21 Oct 2013 20:13:21 GMT"
            );
            huffman_test_case!(
                "9d29ad171863c78f0b97c8e9ae82ae43d3",
                "https://www.example.com",
            );
            huffman_test_case!("640eff", "307");
            huffman_test_case!("9bd9ab", "gzip");
            huffman_test_case!(
                "94e7821dd7f2e6c7b335dfdfcd5b3960d5af27087f3672c1ab270fb5291f9587316065c003ed4ee5b1063d5007",
                "foo=ASDJKHQKBZXOQWEOPIUAXQWEOIU; max-age=3600; version=1"
            );
        }
    }

    /// UT test cases for round-tripping every byte value.
    ///
    /// # Brief
    /// 1. Encodes a string containing all 256 byte values.
    /// 2. Decodes the result and compares with the input.
    #[test]
    fn ut_huffman_round_trip_all_bytes() {
        let src: Vec<u8> = (0u8..=255).collect();
        let mut coded = Vec::new();
        huffman_encode(&src, &mut coded);
        let mut out = Vec::new();
        huffman_decode(&coded, &mut out).unwrap();
        assert_eq!(out, src);
    }

    /// UT test cases for `HuffmanDecoder` over segmented input.
    ///
    /// # Brief
    /// 1. Creates a `HuffmanDecoder`.
    /// 2. Feeds the coded string in single-byte slices, with blanks mixed in.
    /// 3. Checks if the test results are correct.
    #[test]
    fn ut_huffman_decoder_segmented() {
        macro_rules! huffman_test_case {
            ($content: expr, $result: expr) => {{
                let mut decoder = HuffmanDecoder::new();
                for cont in $content.iter() {
                    let bytes = decode(cont).unwrap();
                    assert!(decoder.decode(&bytes).is_ok());
                }
                assert_eq!(decoder.finish().unwrap(), $result.as_bytes());
            }};
        }

        huffman_test_case!(["a8", "eb", "10", "64", "9c", "bf"], "no-cache");
        huffman_test_case!(
            ["", "", "a8", "", "eb", "10", "", "64", "9c", "", "bf", ""],
            "no-cache"
        );
    }

    /// UT test cases for invalid padding.
    ///
    /// # Brief
    /// 1. Decodes a string ending in eight padding bits.
    /// 2. Checks that `finish` reports an error.
    #[test]
    fn ut_huffman_invalid_padding() {
        // "no-cache" followed by a full octet of ones.
        let bytes = decode("a8eb10649cbfff").unwrap();
        let mut decoder = HuffmanDecoder::new();
        assert!(decoder.decode(&bytes).is_ok());
        assert!(decoder.finish().is_err());
    }
}
