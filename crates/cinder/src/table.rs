//! Open-addressed hash table keyed by interned strings.
//!
//! Keys are heap ids of interned strings, so key comparison is a plain id
//! compare. Every entry caches its key's FNV-1a hash, which keeps probing
//! free of heap lookups and lets the interner search by raw bytes.
//!
//! Deletion uses tombstones: a slot with no key but a `true` value. Probe
//! sequences skip tombstones when searching and reuse the first one seen
//! when inserting. Tombstones count toward the load factor, so a table
//! churned by deletions still resizes (and the resize drops them).

use crate::{heap::HeapId, value::Value};

/// Grow once `count + 1` exceeds three quarters of capacity.
const MAX_LOAD_NUM: usize = 3;
const MAX_LOAD_DEN: usize = 4;

const MIN_CAPACITY: usize = 8;

#[derive(Debug, Clone, Copy)]
struct Entry {
    key: Option<HeapId>,
    hash: u32,
    value: Value,
}

impl Entry {
    const EMPTY: Self = Self {
        key: None,
        hash: 0,
        value: Value::Nil,
    };

    fn is_tombstone(&self) -> bool {
        self.key.is_none() && matches!(self.value, Value::Bool(true))
    }
}

/// Linear-probed table mapping interned strings to values.
#[derive(Debug, Clone, Default)]
pub(crate) struct Table {
    /// Live entries plus tombstones.
    count: usize,
    /// Always empty or a power of two.
    entries: Vec<Entry>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up `key`. `hash` must be the key string's hash.
    pub fn get(&self, key: HeapId, hash: u32) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let entry = &self.entries[self.find_slot(key, hash)];
        if entry.key == Some(key) { Some(entry.value) } else { None }
    }

    /// Inserts or replaces `key`. Returns true when the key was not present.
    pub fn set(&mut self, key: HeapId, hash: u32, value: Value) -> bool {
        if (self.count + 1) * MAX_LOAD_DEN > self.entries.len() * MAX_LOAD_NUM {
            self.grow();
        }
        let slot = self.find_slot(key, hash);
        let entry = &mut self.entries[slot];
        let is_new = entry.key.is_none();
        // A reused tombstone was already counted when it was a live entry.
        if is_new && matches!(entry.value, Value::Nil) {
            self.count += 1;
        }
        *entry = Entry {
            key: Some(key),
            hash,
            value,
        };
        is_new
    }

    /// Removes `key`, leaving a tombstone. Returns true if it was present.
    pub fn delete(&mut self, key: HeapId, hash: u32) -> bool {
        if self.count == 0 {
            return false;
        }
        let slot = self.find_slot(key, hash);
        let entry = &mut self.entries[slot];
        if entry.key != Some(key) {
            return false;
        }
        *entry = Entry {
            key: None,
            hash: 0,
            value: Value::Bool(true),
        };
        true
    }

    /// Copies every live entry of `other` into this table.
    pub fn add_all(&mut self, other: &Self) {
        for entry in &other.entries {
            if let Some(key) = entry.key {
                self.set(key, entry.hash, entry.value);
            }
        }
    }

    /// Searches by raw bytes for the interner. `str_bytes` maps a key id to
    /// its string's bytes.
    pub fn find_string<'h>(&self, hash: u32, bytes: &[u8], str_bytes: impl Fn(HeapId) -> &'h [u8]) -> Option<HeapId> {
        if self.count == 0 {
            return None;
        }
        let mask = self.entries.len() - 1;
        let mut index = hash as usize & mask;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None if !entry.is_tombstone() => return None,
                Some(key) if entry.hash == hash && str_bytes(key) == bytes => return Some(key),
                _ => {}
            }
            index = (index + 1) & mask;
        }
    }

    /// Tombstones every entry whose key fails `is_marked`. Used by the
    /// collector to weak-clean the intern table before sweeping.
    pub fn remove_unmarked(&mut self, is_marked: impl Fn(HeapId) -> bool) {
        for entry in &mut self.entries {
            if let Some(key) = entry.key
                && !is_marked(key)
            {
                *entry = Entry {
                    key: None,
                    hash: 0,
                    value: Value::Bool(true),
                };
            }
        }
    }

    /// Iterates live entries in probe order.
    pub fn iter(&self) -> impl Iterator<Item = (HeapId, Value)> + '_ {
        self.entries.iter().filter_map(|e| e.key.map(|k| (k, e.value)))
    }

    /// Approximate memory footprint, for the collector's accounting.
    pub fn byte_size(&self) -> usize {
        self.entries.capacity() * size_of::<Entry>()
    }

    /// Index of the entry for `key`: either its current slot or the slot an
    /// insert should use (the first tombstone on the probe path, if any).
    fn find_slot(&self, key: HeapId, hash: u32) -> usize {
        let mask = self.entries.len() - 1;
        let mut index = hash as usize & mask;
        let mut tombstone = None;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None => {
                    if entry.is_tombstone() {
                        tombstone.get_or_insert(index);
                    } else {
                        return tombstone.unwrap_or(index);
                    }
                }
                Some(k) if k == key => return index,
                Some(_) => {}
            }
            index = (index + 1) & mask;
        }
    }

    /// Doubles capacity and reinserts live entries, dropping tombstones.
    fn grow(&mut self) {
        let new_capacity = (self.entries.len() * 2).max(MIN_CAPACITY);
        let old = std::mem::replace(&mut self.entries, vec![Entry::EMPTY; new_capacity]);
        self.count = 0;
        let mask = new_capacity - 1;
        for entry in old {
            if entry.key.is_none() {
                continue;
            }
            let mut index = entry.hash as usize & mask;
            while self.entries[index].key.is_some() {
                index = (index + 1) & mask;
            }
            self.entries[index] = entry;
            self.count += 1;
        }
    }
}
