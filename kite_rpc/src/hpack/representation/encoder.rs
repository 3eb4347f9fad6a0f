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

use crate::hpack::integer::IntegerEncoder;
use crate::hpack::representation::PrefixIndexMask;
use crate::hpack::table::{DynamicTable, TableIndex, TableSearcher};
use crate::huffman::huffman_encode;
use crate::metadata::{Metadata, MetadataList};

/// Encoder of header field representations. The encode interface supports
/// segmented writing: when the output slice fills up, the unfinished state
/// is saved and encoding resumes into the next slice.
pub(crate) struct ReprEncoder<'a> {
    table: &'a mut DynamicTable,
    iter: Option<std::vec::IntoIter<Metadata>>,
    state: Option<ReprEncodeState>,
}

impl<'a> ReprEncoder<'a> {
    /// Creates a new, empty `ReprEncoder`.
    pub(crate) fn new(table: &'a mut DynamicTable) -> Self {
        Self {
            table,
            iter: None,
            state: None,
        }
    }

    /// Loads states from a holder.
    pub(crate) fn load(&mut self, holder: &mut ReprEncStateHolder) {
        self.iter = holder.iter.take();
        self.state = holder.state.take();
    }

    /// Saves the current state to a holder.
    pub(crate) fn save(self, holder: &mut ReprEncStateHolder) {
        holder.iter = self.iter;
        holder.state = self.state;
    }

    /// Encodes the remaining elements into `dst`, returning the number of
    /// bytes written. Encoding is complete only when both the iterator and
    /// the state are exhausted; if `dst` fills up first, callers must `save`
    /// and continue with a fresh slice.
    pub(crate) fn encode(&mut self, dst: &mut [u8], use_huffman: bool) -> usize {
        if dst.is_empty() {
            return 0;
        }

        // `cur` records the current write position in `dst`.
        let mut cur = 0;

        // An unfinished representation from the previous slice goes first.
        if let Some(state) = self.state.take() {
            match state.encode(&mut dst[cur..]) {
                Ok(size) => cur += size,
                Err(state) => {
                    self.state = Some(state);
                    return dst.len();
                }
            }
        }

        if let Some(mut iter) = self.iter.take() {
            while let Some(elem) = iter.next() {
                let result = if elem.is_sensitive() {
                    // Never-indexed elements stay fully literal and out of
                    // every compression table.
                    NeverIndexedWithName::new(
                        elem.key().to_vec(),
                        elem.value().to_vec(),
                        use_huffman,
                    )
                    .encode(&mut dst[cur..])
                } else {
                    let searcher = TableSearcher::new(self.table);
                    match searcher.index(elem.key(), elem.value()) {
                        Some(TableIndex::Field(index)) => {
                            Indexed::new(index).encode(&mut dst[cur..])
                        }
                        Some(TableIndex::Name(index)) => {
                            // The index refers to the table before insertion,
                            // matching what the decoder resolves against.
                            self.table.update(elem.clone());
                            Indexing::new(index, elem.value().to_vec(), use_huffman)
                                .encode(&mut dst[cur..])
                        }
                        None => {
                            self.table.update(elem.clone());
                            IndexingWithName::new(
                                elem.key().to_vec(),
                                elem.value().to_vec(),
                                use_huffman,
                            )
                            .encode(&mut dst[cur..])
                        }
                    }
                };
                match result {
                    Ok(size) => cur += size,
                    Err(state) => {
                        self.state = Some(state);
                        self.iter = Some(iter);
                        return dst.len();
                    }
                }
            }
        }
        cur
    }
}

/// Holder of the intermediate results of a `ReprEncoder`.
pub(crate) struct ReprEncStateHolder {
    iter: Option<std::vec::IntoIter<Metadata>>,
    state: Option<ReprEncodeState>,
}

impl ReprEncStateHolder {
    /// Creates a new, empty `ReprEncStateHolder`.
    pub(crate) fn new() -> Self {
        Self {
            iter: None,
            state: None,
        }
    }

    /// Sets the metadata list to be encoded.
    pub(crate) fn set_list(&mut self, list: MetadataList) {
        self.iter = Some(list.into_iter())
    }

    /// `true` once everything previously set has been encoded.
    pub(crate) fn is_empty(&self) -> bool {
        self.iter.is_none() && self.state.is_none()
    }
}

/// Possible in-flight representation states.
pub(crate) enum ReprEncodeState {
    Indexed(Indexed),
    Indexing(Indexing),
    IndexingWithName(IndexingWithName),
    NeverIndexedWithName(NeverIndexedWithName),
}

impl ReprEncodeState {
    fn encode(self, dst: &mut [u8]) -> Result<usize, Self> {
        match self {
            Self::Indexed(s) => s.encode(dst),
            Self::Indexing(s) => s.encode(dst),
            Self::IndexingWithName(s) => s.encode(dst),
            Self::NeverIndexedWithName(s) => s.encode(dst),
        }
    }
}

pub(crate) struct Indexed {
    index: Integer,
}

impl Indexed {
    fn from(index: Integer) -> Self {
        Self { index }
    }

    fn new(index: usize) -> Self {
        Self {
            index: Integer::index(index, PrefixIndexMask::INDEXED.0, 0x80),
        }
    }

    fn encode(self, dst: &mut [u8]) -> Result<usize, ReprEncodeState> {
        self.index
            .encode(dst)
            .map_err(|e| ReprEncodeState::Indexed(Indexed::from(e)))
    }
}

pub(crate) struct Indexing {
    inner: IndexAndValue,
}

impl Indexing {
    fn new(index: usize, value: Vec<u8>, is_huffman: bool) -> Self {
        Self {
            inner: IndexAndValue::new()
                .set_index(index, PrefixIndexMask::LITERAL_WITH_INDEXING.0, 0x40)
                .set_value(value, is_huffman),
        }
    }

    fn from(inner: IndexAndValue) -> Self {
        Self { inner }
    }

    fn encode(self, dst: &mut [u8]) -> Result<usize, ReprEncodeState> {
        self.inner
            .encode(dst)
            .map_err(|e| ReprEncodeState::Indexing(Indexing::from(e)))
    }
}

pub(crate) struct IndexingWithName {
    inner: NameAndValue,
}

impl IndexingWithName {
    fn new(name: Vec<u8>, value: Vec<u8>, is_huffman: bool) -> Self {
        Self {
            inner: NameAndValue::new()
                .set_index(PrefixIndexMask::LITERAL_WITH_INDEXING.0, 0x40)
                .set_name_and_value(name, value, is_huffman),
        }
    }

    fn from(inner: NameAndValue) -> Self {
        Self { inner }
    }

    fn encode(self, dst: &mut [u8]) -> Result<usize, ReprEncodeState> {
        self.inner
            .encode(dst)
            .map_err(|e| ReprEncodeState::IndexingWithName(IndexingWithName::from(e)))
    }
}

pub(crate) struct NeverIndexedWithName {
    inner: NameAndValue,
}

impl NeverIndexedWithName {
    fn new(name: Vec<u8>, value: Vec<u8>, is_huffman: bool) -> Self {
        Self {
            inner: NameAndValue::new()
                .set_index(PrefixIndexMask::LITERAL_NEVER_INDEXED.0, 0x10)
                .set_name_and_value(name, value, is_huffman),
        }
    }

    fn from(inner: NameAndValue) -> Self {
        Self { inner }
    }

    fn encode(self, dst: &mut [u8]) -> Result<usize, ReprEncodeState> {
        self.inner
            .encode(dst)
            .map_err(|e| ReprEncodeState::NeverIndexedWithName(NeverIndexedWithName::from(e)))
    }
}

macro_rules! check_and_encode {
    ($item: expr, $dst: expr, $cur: expr, $self: expr) => {{
        if let Some(i) = $item.take() {
            match i.encode($dst) {
                Ok(len) => $cur += len,
                Err(e) => {
                    $item = Some(e);
                    return Err($self);
                }
            };
        }
    }};
}

pub(crate) struct IndexAndValue {
    index: Option<Integer>,
    value_length: Option<Integer>,
    value_octets: Option<Octets>,
}

impl IndexAndValue {
    fn new() -> Self {
        Self {
            index: None,
            value_length: None,
            value_octets: None,
        }
    }

    fn set_index(mut self, index: usize, mask: u8, pre: u8) -> Self {
        self.index = Some(Integer::index(index, mask, pre));
        self
    }

    fn set_value(mut self, value: Vec<u8>, is_huffman: bool) -> Self {
        let octets = Octets::new(value, is_huffman);
        self.value_length = Some(Integer::length(octets.len(), is_huffman));
        self.value_octets = Some(octets);
        self
    }

    fn encode(mut self, dst: &mut [u8]) -> Result<usize, Self> {
        let mut cur = 0;
        check_and_encode!(self.index, &mut dst[cur..], cur, self);
        check_and_encode!(self.value_length, &mut dst[cur..], cur, self);
        check_and_encode!(self.value_octets, &mut dst[cur..], cur, self);
        Ok(cur)
    }
}

pub(crate) struct NameAndValue {
    index: Option<Integer>,
    name_length: Option<Integer>,
    name_octets: Option<Octets>,
    value_length: Option<Integer>,
    value_octets: Option<Octets>,
}

impl NameAndValue {
    fn new() -> Self {
        Self {
            index: None,
            name_length: None,
            name_octets: None,
            value_length: None,
            value_octets: None,
        }
    }

    fn set_index(mut self, mask: u8, pre: u8) -> Self {
        self.index = Some(Integer::index(0, mask, pre));
        self
    }

    fn set_name_and_value(mut self, name: Vec<u8>, value: Vec<u8>, is_huffman: bool) -> Self {
        let name_octets = Octets::new(name, is_huffman);
        self.name_length = Some(Integer::length(name_octets.len(), is_huffman));
        self.name_octets = Some(name_octets);
        let value_octets = Octets::new(value, is_huffman);
        self.value_length = Some(Integer::length(value_octets.len(), is_huffman));
        self.value_octets = Some(value_octets);
        self
    }

    fn encode(mut self, dst: &mut [u8]) -> Result<usize, Self> {
        let mut cur = 0;
        check_and_encode!(self.index, &mut dst[cur..], cur, self);
        check_and_encode!(self.name_length, &mut dst[cur..], cur, self);
        check_and_encode!(self.name_octets, &mut dst[cur..], cur, self);
        check_and_encode!(self.value_length, &mut dst[cur..], cur, self);
        check_and_encode!(self.value_octets, &mut dst[cur..], cur, self);
        Ok(cur)
    }
}

pub(crate) struct Integer {
    int: IntegerEncoder,
}

impl Integer {
    fn index(index: usize, mask: u8, pre: u8) -> Self {
        Self {
            int: IntegerEncoder::new(index, mask, pre),
        }
    }

    fn length(length: usize, is_huffman: bool) -> Self {
        Self {
            int: IntegerEncoder::new(length, 0x7f, if is_huffman { 0x80 } else { 0 }),
        }
    }

    fn encode(mut self, dst: &mut [u8]) -> Result<usize, Self> {
        let mut cur = 0;
        while !self.int.is_finish() {
            let dst = &mut dst[cur..];
            if dst.is_empty() {
                return Err(self);
            }
            dst[0] = self.int.next_byte().unwrap();
            cur += 1;
        }
        Ok(cur)
    }
}

pub(crate) struct Octets {
    src: Vec<u8>,
    idx: usize,
}

impl Octets {
    fn new(src: Vec<u8>, is_huffman: bool) -> Self {
        if is_huffman {
            let mut dst = Vec::with_capacity(src.len());
            huffman_encode(src.as_slice(), &mut dst);
            Self { src: dst, idx: 0 }
        } else {
            Self { src, idx: 0 }
        }
    }

    fn len(&self) -> usize {
        self.src.len()
    }

    fn encode(mut self, dst: &mut [u8]) -> Result<usize, Self> {
        let input_len = self.src.len() - self.idx;
        let output_len = dst.len();

        if input_len == 0 {
            return Ok(0);
        }

        match output_len.cmp(&input_len) {
            Ordering::Greater | Ordering::Equal => {
                dst[..input_len].copy_from_slice(&self.src[self.idx..]);
                Ok(input_len)
            }
            Ordering::Less => {
                dst.copy_from_slice(&self.src[self.idx..self.idx + output_len]);
                self.idx += output_len;
                Err(self)
            }
        }
    }
}
