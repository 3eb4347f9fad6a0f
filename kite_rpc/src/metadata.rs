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

//! Connection-scoped metadata elements and their interner.
//!
//! RPC metadata keys and values (fixed protocol headers above all) repeat
//! across many calls on one connection. The interner deduplicates the byte
//! pairs so that every table entry, pending frame and user handle referring
//! to the same `(key, value)` shares one reference-counted instance.
//! Equality of two handles from the same interner is a pointer comparison.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

/// An interned `(key, value)` metadata pair.
///
/// Handles are cheap to clone (one atomic increment) and are released by
/// dropping them; the backing storage is freed once the last table entry,
/// queued frame or user handle is gone.
#[derive(Clone)]
pub struct Metadata {
    inner: Arc<Inner>,
}

struct Inner {
    key: Box<[u8]>,
    value: Box<[u8]>,
    sensitive: bool,
}

impl Metadata {
    /// Returns the key bytes.
    pub fn key(&self) -> &[u8] {
        &self.inner.key
    }

    /// Returns the value bytes.
    pub fn value(&self) -> &[u8] {
        &self.inner.value
    }

    /// Whether this element was marked never-indexed on the wire. Sensitive
    /// elements are re-encoded as never-indexed literals and are kept out of
    /// compression tables.
    pub fn is_sensitive(&self) -> bool {
        self.inner.sensitive
    }

    /// Size of the element under the compression table accounting rule:
    /// key length + value length + 32 octets of per-entry overhead.
    pub fn accounted_size(&self) -> usize {
        self.inner.key.len() + self.inner.value.len() + 32
    }
}

impl PartialEq for Metadata {
    fn eq(&self, other: &Self) -> bool {
        // Handles from one interner compare by pointer; byte comparison is
        // the fallback for handles from different connections.
        Arc::ptr_eq(&self.inner, &other.inner)
            || (self.inner.key == other.inner.key && self.inner.value == other.inner.value)
    }
}

impl Eq for Metadata {}

impl fmt::Debug for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metadata")
            .field("key", &String::from_utf8_lossy(&self.inner.key))
            .field("value", &String::from_utf8_lossy(&self.inner.value))
            .finish()
    }
}

/// An ordered sequence of metadata elements, as carried by one header block.
///
/// Order is significant: it is the order the elements appeared on the wire
/// (or will appear, for outgoing metadata).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetadataList {
    elems: Vec<Metadata>,
}

impl MetadataList {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self { elems: Vec::new() }
    }

    /// Appends an element at the end of the list.
    pub fn push(&mut self, elem: Metadata) {
        self.elems.push(elem);
    }

    /// Returns the number of elements.
    pub fn len(&self) -> usize {
        self.elems.len()
    }

    /// Checks whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    /// Iterates over the elements in order.
    pub fn iter(&self) -> core::slice::Iter<'_, Metadata> {
        self.elems.iter()
    }

    /// Returns the value of the first element with the given key.
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.elems
            .iter()
            .find(|e| e.key() == key)
            .map(|e| e.value())
    }
}

impl IntoIterator for MetadataList {
    type Item = Metadata;
    type IntoIter = std::vec::IntoIter<Metadata>;

    fn into_iter(self) -> Self::IntoIter {
        self.elems.into_iter()
    }
}

impl FromIterator<Metadata> for MetadataList {
    fn from_iter<T: IntoIterator<Item = Metadata>>(iter: T) -> Self {
        Self {
            elems: iter.into_iter().collect(),
        }
    }
}

/// The interner table. Holds weak references only, so that dropping the last
/// strong handle frees the bytes; dead slots are swept once the map has grown
/// past twice its size at the previous sweep.
pub struct MetadataInterner {
    map: HashMap<Box<[u8]>, Weak<Inner>>,
    sweep_at: usize,
}

const INITIAL_SWEEP_THRESHOLD: usize = 64;

impl MetadataInterner {
    /// Creates an empty interner.
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
            sweep_at: INITIAL_SWEEP_THRESHOLD,
        }
    }

    /// Interns a `(key, value)` pair, returning the existing handle if the
    /// bytes are already present.
    pub fn intern(&mut self, key: &[u8], value: &[u8]) -> Metadata {
        self.intern_inner(key, value, false)
    }

    /// Interns a pair that must stay out of compression tables and be
    /// re-encoded as a never-indexed literal.
    pub fn intern_sensitive(&mut self, key: &[u8], value: &[u8]) -> Metadata {
        self.intern_inner(key, value, true)
    }

    fn intern_inner(&mut self, key: &[u8], value: &[u8], sensitive: bool) -> Metadata {
        let slot = combined_key(key, value, sensitive);
        if let Some(weak) = self.map.get(slot.as_slice()) {
            if let Some(inner) = weak.upgrade() {
                return Metadata { inner };
            }
        }
        let inner = Arc::new(Inner {
            key: key.into(),
            value: value.into(),
            sensitive,
        });
        self.map.insert(slot.into(), Arc::downgrade(&inner));
        if self.map.len() >= self.sweep_at {
            self.sweep();
        }
        Metadata { inner }
    }

    /// Removes slots whose element has been fully released.
    fn sweep(&mut self) {
        self.map.retain(|_, weak| weak.strong_count() > 0);
        self.sweep_at = (self.map.len() * 2).max(INITIAL_SWEEP_THRESHOLD);
    }

    /// Number of live or not-yet-swept slots, for diagnostics.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Checks whether the interner holds no slots.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Default for MetadataInterner {
    fn default() -> Self {
        Self::new()
    }
}

// Map key: 4-byte key length prefix, then key bytes, value bytes and the
// sensitivity marker. The prefix keeps ("ab", "c") distinct from ("a", "bc").
fn combined_key(key: &[u8], value: &[u8], sensitive: bool) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + key.len() + value.len() + 1);
    buf.extend_from_slice(&(key.len() as u32).to_be_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
    buf.push(sensitive as u8);
    buf
}

/// A clonable, connection-owned handle to one [`MetadataInterner`], shared
/// by the header-compression encode and decode sides. Each operation locks
/// for the duration of one intern only.
#[derive(Clone)]
pub struct SharedInterner {
    inner: Arc<Mutex<MetadataInterner>>,
}

impl SharedInterner {
    /// Creates a fresh interner handle.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetadataInterner::new())),
        }
    }

    /// Interns a `(key, value)` pair.
    pub fn intern(&self, key: &[u8], value: &[u8]) -> Metadata {
        self.inner.lock().unwrap().intern(key, value)
    }

    /// Interns a never-indexed `(key, value)` pair.
    pub fn intern_sensitive(&self, key: &[u8], value: &[u8]) -> Metadata {
        self.inner.lock().unwrap().intern_sensitive(key, value)
    }

    /// Builds a [`MetadataList`] from `(key, value)` string pairs, interning
    /// every element.
    pub fn list_from_pairs<'a, I>(&self, pairs: I) -> MetadataList
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut guard = self.inner.lock().unwrap();
        pairs
            .into_iter()
            .map(|(k, v)| guard.intern(k.as_bytes(), v.as_bytes()))
            .collect()
    }
}

impl Default for SharedInterner {
    fn default() -> Self {
        Self::new()
    }
}
