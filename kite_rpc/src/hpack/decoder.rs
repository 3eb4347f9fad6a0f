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

use core::mem::take;

use crate::error::ErrorCode;
use crate::hpack::representation::{Name, ReprDecStateHolder, ReprDecoder, Representation};
use crate::hpack::table::{DynamicTable, TableEntry, TableSearcher};
use crate::metadata::{Metadata, MetadataList, SharedInterner};
use crate::Http2Error;

/// Decoder implementation of [`HPACK`].
///
/// [`HPACK`]: https://httpwg.org/specs/rfc7541.html
///
/// One header block may span several input slices (HEADERS plus any number
/// of CONTINUATION fragments): `decode` is called per slice and `finish`
/// closes the block, yielding the ordered metadata list. Decoding is
/// strictly sequential per connection, since the dynamic table state is a
/// function of decode order.
pub struct HpackDecoder {
    header_list_size: usize,
    // The size cap a dynamic table size update may not exceed, i.e. the
    // value this endpoint advertised as SETTINGS_HEADER_TABLE_SIZE.
    table_size_cap: usize,
    table: DynamicTable,
    interner: SharedInterner,
    lines: MetadataLines,
    holder: ReprDecStateHolder,
}

// Accumulates decoded lines and their accounted octet length.
struct MetadataLines {
    list: MetadataList,
    header_size: usize,
}

impl HpackDecoder {
    /// Creates an `HpackDecoder` with the given table budget, header-list
    /// limit and connection interner.
    pub fn with_max_size(
        header_table_size: usize,
        max_header_list_size: usize,
        interner: SharedInterner,
    ) -> Self {
        Self {
            header_list_size: max_header_list_size,
            table_size_cap: header_table_size,
            table: DynamicTable::with_max_size(header_table_size),
            interner,
            lines: MetadataLines {
                list: MetadataList::new(),
                header_size: 0,
            },
            holder: ReprDecStateHolder::new(),
        }
    }

    /// Decodes the next slice of the current header block.
    pub fn decode(&mut self, buf: &[u8]) -> Result<(), Http2Error> {
        let mut decoder = ReprDecoder::new(buf);
        decoder.load(&mut self.holder);

        let mut updater = Updater {
            table: &mut self.table,
            interner: &self.interner,
            lines: &mut self.lines,
            header_list_size: self.header_list_size,
            table_size_cap: self.table_size_cap,
        };
        loop {
            match decoder.decode()? {
                Some(repr) => updater.update(repr)?,
                // The slice is exhausted; park the intermediate state until
                // the next fragment arrives.
                None => {
                    decoder.save(&mut self.holder);
                    return Ok(());
                }
            }
        }
    }

    /// Ends the current header block and returns its metadata. A block that
    /// stops in the middle of a representation is a compression error.
    pub fn finish(&mut self) -> Result<MetadataList, Http2Error> {
        if !self.holder.is_empty() {
            return Err(Http2Error::Connection(ErrorCode::CompressionError));
        }
        self.lines.header_size = 0;
        Ok(take(&mut self.lines.list))
    }

    /// Updates the SETTINGS_MAX_HEADER_LIST_SIZE limit.
    pub fn update_header_list_size(&mut self, size: usize) {
        self.header_list_size = size;
    }

    /// Updates the advertised SETTINGS_HEADER_TABLE_SIZE. The new value
    /// bounds subsequent dynamic table size updates from the peer.
    pub fn update_header_table_size(&mut self, size: usize) {
        self.table_size_cap = size;
        if size < self.table.max_size() {
            self.table.update_size(size);
        }
    }
}

/// Applies decoded representations to the dynamic table and the output
/// metadata list.
struct Updater<'a> {
    table: &'a mut DynamicTable,
    interner: &'a SharedInterner,
    lines: &'a mut MetadataLines,
    header_list_size: usize,
    table_size_cap: usize,
}

impl<'a> Updater<'a> {
    fn update(&mut self, repr: Representation) -> Result<(), Http2Error> {
        match repr {
            Representation::Indexed { index } => self.update_indexed(index),
            Representation::LiteralWithIndexing { name, value } => {
                let elem = self.intern_literal(name, value, false)?;
                self.check_header_list_size(&elem)?;
                self.table.update(elem.clone());
                self.lines.list.push(elem);
                Ok(())
            }
            Representation::LiteralWithoutIndexing { name, value } => {
                let elem = self.intern_literal(name, value, false)?;
                self.check_header_list_size(&elem)?;
                self.lines.list.push(elem);
                Ok(())
            }
            Representation::LiteralNeverIndexed { name, value } => {
                let elem = self.intern_literal(name, value, true)?;
                self.check_header_list_size(&elem)?;
                self.lines.list.push(elem);
                Ok(())
            }
            Representation::SizeUpdate { max_size } => {
                // RFC7541-4.2: a size update must occur at the beginning of
                // a header block and may not exceed the advertised limit.
                // Any ambiguity is resolved as a connection error.
                if !self.lines.list.is_empty() || self.lines.header_size != 0 {
                    return Err(Http2Error::Connection(ErrorCode::CompressionError));
                }
                if max_size > self.table_size_cap {
                    return Err(Http2Error::Connection(ErrorCode::CompressionError));
                }
                self.table.update_size(max_size);
                Ok(())
            }
        }
    }

    fn update_indexed(&mut self, index: usize) -> Result<(), Http2Error> {
        let searcher = TableSearcher::new(self.table);
        let entry = searcher
            .entry(index)
            .ok_or(Http2Error::Connection(ErrorCode::CompressionError))?;
        let elem = match entry {
            TableEntry::Dynamic(elem) => elem,
            entry => self.interner.intern(entry.key(), entry.value()),
        };
        self.check_header_list_size(&elem)?;
        self.lines.list.push(elem);
        Ok(())
    }

    fn intern_literal(
        &mut self,
        name: Name,
        value: Vec<u8>,
        sensitive: bool,
    ) -> Result<Metadata, Http2Error> {
        let key: Vec<u8> = match name {
            Name::Index(index) => {
                let searcher = TableSearcher::new(self.table);
                let entry = searcher
                    .entry(index)
                    .ok_or(Http2Error::Connection(ErrorCode::CompressionError))?;
                entry.key().to_vec()
            }
            Name::Literal(octets) => octets,
        };
        let elem = if sensitive {
            self.interner.intern_sensitive(&key, &value)
        } else {
            self.interner.intern(&key, &value)
        };
        Ok(elem)
    }

    fn check_header_list_size(&mut self, elem: &Metadata) -> Result<(), Http2Error> {
        self.lines.header_size += elem.accounted_size();
        if self.lines.header_size > self.header_list_size {
            Err(Http2Error::Connection(ErrorCode::EnhanceYourCalm))
        } else {
            Ok(())
        }
    }
}
