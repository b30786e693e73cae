//! HPACK header table (RFC 7541 §2.3). Index space `1..=61` is the fixed
//! static table; `62..` walks the dynamic table starting from its most
//! recently inserted entry.

use std::collections::VecDeque;

use crate::error::HpackError;

pub const STATIC_TABLE_LEN: usize = 61;

/// RFC 7541 Appendix A.
pub const STATIC_TABLE: [(&str, &str); STATIC_TABLE_LEN] = [
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

/// Per-entry accounting overhead (RFC 7541 §4.1): 32 bytes on top of the
/// literal name/value lengths.
pub const ENTRY_OVERHEAD: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub name: Box<str>,
    pub value: Box<str>,
}

impl Entry {
    fn size(&self) -> usize {
        self.name.len() + self.value.len() + ENTRY_OVERHEAD
    }
}

/// The dynamic table: a FIFO of entries bounded by `max_size`, newest at the
/// front (so that index `62` is always the most recently inserted entry).
#[derive(Debug, Clone)]
pub struct DynamicTable {
    entries: VecDeque<Entry>,
    size: usize,
    max_size: usize,
}

impl DynamicTable {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            size: 0,
            max_size,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert a new entry at the front, evicting from the tail until the
    /// size invariant holds. An entry larger than the whole
    /// table is simply not stored, per RFC 7541 §4.4.
    pub fn insert(&mut self, name: impl Into<Box<str>>, value: impl Into<Box<str>>) {
        let entry = Entry {
            name: name.into(),
            value: value.into(),
        };
        let entry_size = entry.size();
        if entry_size > self.max_size {
            self.entries.clear();
            self.size = 0;
            return;
        }
        self.evict_to_fit(self.max_size - entry_size);
        self.size += entry_size;
        self.entries.push_front(entry);
    }

    /// Update the maximum size (triggered by a dynamic table size update
    /// instruction, itself bounded by the peer's SETTINGS_HEADER_TABLE_SIZE).
    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
        self.evict_to_fit(max_size);
    }

    fn evict_to_fit(&mut self, budget: usize) {
        while self.size > budget {
            match self.entries.pop_back() {
                Some(entry) => self.size -= entry.size(),
                None => {
                    self.size = 0;
                    break;
                }
            }
        }
    }

    /// Look up dynamic-table index `idx` where `idx` is already relative to
    /// the dynamic table (i.e. `full_index - STATIC_TABLE_LEN`), 1-based.
    fn get(&self, idx: usize) -> Option<&Entry> {
        if idx == 0 {
            return None;
        }
        self.entries.get(idx - 1)
    }

    /// Iterate front-to-back (most recently inserted first), matching
    /// dynamic index order — used by the encoder's linear name/value search.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|e| (&*e.name, &*e.value))
    }
}

/// Combined view over the static and dynamic tables, addressed by the single
/// HPACK index space.
pub struct HeaderTable<'a> {
    dynamic: &'a DynamicTable,
}

impl<'a> HeaderTable<'a> {
    pub fn new(dynamic: &'a DynamicTable) -> Self {
        Self { dynamic }
    }

    pub fn lookup(&self, index: u64) -> Result<(&'a str, &'a str), HpackError> {
        if index == 0 {
            return Err(HpackError::InvalidIndex(index));
        }
        let index = index as usize;
        if index <= STATIC_TABLE_LEN {
            let (name, value) = STATIC_TABLE[index - 1];
            return Ok((name, value));
        }
        let dynamic_idx = index - STATIC_TABLE_LEN;
        match self.dynamic.get(dynamic_idx) {
            Some(entry) => Ok((&entry.name, &entry.value)),
            None => Err(HpackError::InvalidIndex(index as u64)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_table_first_and_last() {
        assert_eq!(STATIC_TABLE[0], (":authority", ""));
        assert_eq!(STATIC_TABLE[STATIC_TABLE_LEN - 1], ("www-authenticate", ""));
    }

    #[test]
    fn dynamic_table_fifo_order() {
        let mut table = DynamicTable::new(4096);
        table.insert("custom-key", "value-1");
        table.insert("custom-key", "value-2");
        let view = HeaderTable::new(&table);
        assert_eq!(
            view.lookup(STATIC_TABLE_LEN as u64 + 1).unwrap(),
            ("custom-key", "value-2")
        );
        assert_eq!(
            view.lookup(STATIC_TABLE_LEN as u64 + 2).unwrap(),
            ("custom-key", "value-1")
        );
    }

    #[test]
    fn dynamic_table_evicts_to_fit() {
        let mut table = DynamicTable::new(64);
        table.insert("a", "1"); // size = 1 + 1 + 32 = 34
        table.insert("b", "2"); // size = 34, total would be 68 > 64, evicts "a"
        assert_eq!(table.len(), 1);
        let view = HeaderTable::new(&table);
        assert_eq!(view.lookup(STATIC_TABLE_LEN as u64 + 1).unwrap(), ("b", "2"));
    }

    #[test]
    fn resize_smaller_evicts_tail() {
        let mut table = DynamicTable::new(4096);
        table.insert("a", "1");
        table.insert("b", "2");
        table.set_max_size(34);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn oversized_entry_is_dropped_not_stored() {
        let mut table = DynamicTable::new(32);
        table.insert("a", "1");
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn lookup_out_of_range_errors() {
        let table = DynamicTable::new(4096);
        let view = HeaderTable::new(&table);
        assert!(view.lookup(0).is_err());
        assert!(view.lookup(STATIC_TABLE_LEN as u64 + 1).is_err());
    }
}
