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

use std::collections::VecDeque;

use crate::metadata::Metadata;

/// `TableSearcher` resolves indices and finds matches across the static and
/// dynamic tables. Indices 1 through 61 address the static table; indices
/// from 62 upward address the dynamic table relative to its newest entry.
pub(crate) struct TableSearcher<'a> {
    dynamic: &'a DynamicTable,
}

/// One resolved table entry: either a predefined static pair or a live
/// dynamic-table element.
pub(crate) enum TableEntry {
    Static(&'static str, &'static str),
    Dynamic(Metadata),
}

impl TableEntry {
    pub(crate) fn key(&self) -> &[u8] {
        match self {
            TableEntry::Static(k, _) => k.as_bytes(),
            TableEntry::Dynamic(elem) => elem.key(),
        }
    }

    pub(crate) fn value(&self) -> &[u8] {
        match self {
            TableEntry::Static(_, v) => v.as_bytes(),
            TableEntry::Dynamic(elem) => elem.value(),
        }
    }
}

impl<'a> TableSearcher<'a> {
    pub(crate) fn new(dynamic: &'a DynamicTable) -> Self {
        Self { dynamic }
    }

    /// Resolves a wire index to its entry. A reference to an evicted or
    /// out-of-range index yields `None`, which callers must treat as a
    /// fatal connection error.
    pub(crate) fn entry(&self, index: usize) -> Option<TableEntry> {
        if (1..=STATIC_TABLE_LEN).contains(&index) {
            StaticTable::field(index).map(|(k, v)| TableEntry::Static(k, v))
        } else {
            self.dynamic
                .field(index.wrapping_sub(STATIC_TABLE_LEN + 1))
                .map(TableEntry::Dynamic)
        }
    }

    /// Searches both tables for the best index for `(key, value)`: a full
    /// match wins over a name-only match, the static table wins over the
    /// dynamic table within each class.
    pub(crate) fn index(&self, key: &[u8], value: &[u8]) -> Option<TableIndex> {
        match (
            StaticTable::index(key, value),
            self.dynamic.index(key, value),
        ) {
            (f @ Some(TableIndex::Field(_)), _) => f,
            (_, Some(TableIndex::Field(i))) => Some(TableIndex::Field(i + STATIC_TABLE_LEN + 1)),
            (n @ Some(TableIndex::Name(_)), _) => n,
            (_, Some(TableIndex::Name(i))) => Some(TableIndex::Name(i + STATIC_TABLE_LEN + 1)),
            _ => None,
        }
    }
}

pub(crate) enum TableIndex {
    /// Index of a full `(name, value)` match.
    Field(usize),
    /// Index of a name-only match.
    Name(usize),
}

/// The [`Dynamic Table`][dynamic_table] of HPACK.
///
/// [dynamic_table]: https://httpwg.org/specs/rfc7541.html#dynamic.table
///
/// A first-in, first-out list of metadata elements: the newest entry has the
/// lowest index, the oldest the highest, and indices shift as entries are
/// inserted and evicted. Entries are interned handles, so table residency
/// keeps the underlying bytes alive until the entry is evicted and every
/// other holder is gone. The table may contain duplicate entries. Its total
/// accounted size is strictly bounded; insertion evicts from the oldest end
/// until the new entry fits.
pub(crate) struct DynamicTable {
    queue: VecDeque<Metadata>,
    curr_size: usize,
    max_size: usize,
}

impl DynamicTable {
    /// Creates a `DynamicTable` with the given size budget.
    pub(crate) fn with_max_size(max_size: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            curr_size: 0,
            max_size,
        }
    }

    pub(crate) fn curr_size(&self) -> usize {
        self.curr_size
    }

    pub(crate) fn max_size(&self) -> usize {
        self.max_size
    }

    /// Gets the element at the given 0-based dynamic index (0 is newest).
    pub(crate) fn field(&self, index: usize) -> Option<Metadata> {
        self.queue.get(index).cloned()
    }

    /// Inserts an element, evicting from the oldest end to fit. An element
    /// larger than the whole budget empties the table and is not inserted;
    /// that is not an error, the element is simply not referenceable.
    pub(crate) fn update(&mut self, elem: Metadata) {
        // RFC7541-4.1: an entry is accounted as the length of its name and
        // value plus 32 octets of estimated overhead.
        self.curr_size += elem.accounted_size();
        self.queue.push_front(elem);
        self.fit_size();
    }

    /// Updates the table's size budget, evicting as needed.
    pub(crate) fn update_size(&mut self, max_size: usize) {
        self.max_size = max_size;
        self.fit_size();
    }

    fn fit_size(&mut self) {
        while self.curr_size > self.max_size {
            match self.queue.pop_back() {
                Some(evicted) => self.curr_size -= evicted.accounted_size(),
                None => break,
            }
        }
    }

    /// Tries to get the best index for `(key, value)` in this table.
    fn index(&self, key: &[u8], value: &[u8]) -> Option<TableIndex> {
        let mut name_index = None;
        for (n, elem) in self.queue.iter().enumerate() {
            match (elem.key() == key, elem.value() == value, &name_index) {
                (true, true, _) => return Some(TableIndex::Field(n)),
                (true, false, None) => name_index = Some(TableIndex::Name(n)),
                _ => {}
            }
        }
        name_index
    }
}

pub(crate) const STATIC_TABLE_LEN: usize = 61;

/// The [`Static Table`][static_table] of HPACK: a predefined list of 61
/// header fields, addressed by indices 1 through 61.
///
/// [static_table]: https://httpwg.org/specs/rfc7541.html#static.table
struct StaticTable;

static STATIC_TABLE: [(&str, &str); STATIC_TABLE_LEN] = [
    (":authority", ""),
    (":method", "GET"),
    (":method", "POST"),
    (":path", "/"),
    (":path", "/index.html"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "200"),
    (":status", "204"),
    (":status", "206"),
    (":status", "304"),
    (":status", "400"),
    (":status", "404"),
    (":status", "500"),
    ("accept-charset", ""),
    ("accept-encoding", "gzip, deflate"),
    ("accept-language", ""),
    ("accept-ranges", ""),
    ("accept", ""),
    ("access-control-allow-origin", ""),
    ("age", ""),
    ("allow", ""),
    ("authorization", ""),
    ("cache-control", ""),
    ("content-disposition", ""),
    ("content-encoding", ""),
    ("content-language", ""),
    ("content-length", ""),
    ("content-location", ""),
    ("content-range", ""),
    ("content-type", ""),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("expect", ""),
    ("expires", ""),
    ("from", ""),
    ("host", ""),
    ("if-match", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("if-range", ""),
    ("if-unmodified-since", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("max-forwards", ""),
    ("proxy-authenticate", ""),
    ("proxy-authorization", ""),
    ("range", ""),
    ("referer", ""),
    ("refresh", ""),
    ("retry-after", ""),
    ("server", ""),
    ("set-cookie", ""),
    ("strict-transport-security", ""),
    ("transfer-encoding", ""),
    ("user-agent", ""),
    ("vary", ""),
    ("via", ""),
    ("www-authenticate", ""),
];

impl StaticTable {
    /// Gets the `(name, value)` pair at the given 1-based index.
    fn field(index: usize) -> Option<(&'static str, &'static str)> {
        STATIC_TABLE.get(index.wrapping_sub(1)).copied()
    }

    /// Tries to get the best static index for `(key, value)`: the matching
    /// full entry if one exists, otherwise the first entry with the same
    /// name.
    fn index(key: &[u8], value: &[u8]) -> Option<TableIndex> {
        let mut name_index = None;
        for (n, (k, v)) in STATIC_TABLE.iter().enumerate() {
            if k.as_bytes() == key {
                if v.as_bytes() == value {
                    return Some(TableIndex::Field(n + 1));
                }
                if name_index.is_none() {
                    name_index = Some(TableIndex::Name(n + 1));
                }
            }
        }
        name_index
    }
}
