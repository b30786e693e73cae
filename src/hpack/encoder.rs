//! HPACK encoder: the sending side's mirror of `Decoder`. Maintains its own
//! dynamic table so that indexed references stay consistent with what the
//! peer has observed.

use bytes::BytesMut;

use super::integer;
use super::string;
use super::table::{DynamicTable, STATIC_TABLE, STATIC_TABLE_LEN};

pub struct Encoder {
    dynamic_table: DynamicTable,
}

impl Encoder {
    pub fn new(max_dynamic_table_size: usize) -> Self {
        Self {
            dynamic_table: DynamicTable::new(max_dynamic_table_size),
        }
    }

    /// Emit a Dynamic Table Size Update instruction and apply it locally.
    /// Sent once, ahead of the header block it governs (RFC 7541 §6.3).
    pub fn set_max_dynamic_table_size(&mut self, max_size: usize, buf: &mut BytesMut) {
        integer::encode(max_size as u64, 5, 0x20, buf);
        self.dynamic_table.set_max_size(max_size);
    }

    /// Encode one header field with incremental indexing: reuse a static or
    /// dynamic table index when we have an exact match, otherwise emit a
    /// literal and add it to the dynamic table.
    pub fn encode_field(&mut self, name: &str, value: &str, buf: &mut BytesMut) {
        if let Some(index) = self.find_exact(name, value) {
            integer::encode(index, 7, 0x80, buf);
            return;
        }
        self.encode_literal(name, value, 0x40, 6, buf);
        self.dynamic_table.insert(name.to_string(), value.to_string());
    }

    /// Encode a literal field without adding it to the dynamic table.
    /// Used for highly variable values where indexing would only waste
    /// table space, and for sensitive values below.
    pub fn encode_field_no_index(&mut self, name: &str, value: &str, buf: &mut BytesMut) {
        self.encode_literal(name, value, 0x00, 4, buf);
    }

    /// Encode a literal field flagged "never indexed" — intermediaries must
    /// not cache it either, which we use for `authorization` and cookies.
    pub fn encode_field_never_indexed(&mut self, name: &str, value: &str, buf: &mut BytesMut) {
        self.encode_literal(name, value, 0x10, 4, buf);
    }

    fn encode_literal(&self, name: &str, value: &str, opcode: u8, prefix_bits: u8, buf: &mut BytesMut) {
        match self.find_name_index(name) {
            Some(index) => integer::encode(index, prefix_bits, opcode, buf),
            None => {
                buf.extend_from_slice(&[opcode]);
                string::encode(name, buf);
            }
        }
        string::encode(value, buf);
    }

    fn find_exact(&self, name: &str, value: &str) -> Option<u64> {
        for (i, &(n, v)) in STATIC_TABLE.iter().enumerate() {
            if n == name && v == value {
                return Some((i + 1) as u64);
            }
        }
        self.dynamic_table
            .iter()
            .position(|(n, v)| n == name && v == value)
            .map(|i| (STATIC_TABLE_LEN + i + 1) as u64)
    }

    fn find_name_index(&self, name: &str) -> Option<u64> {
        for (i, &(n, _)) in STATIC_TABLE.iter().enumerate() {
            if n == name {
                return Some((i + 1) as u64);
            }
        }
        self.dynamic_table
            .iter()
            .position(|(n, _)| n == name)
            .map(|i| (STATIC_TABLE_LEN + i + 1) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uses_static_table_for_known_pair() {
        let mut encoder = Encoder::new(4096);
        let mut buf = BytesMut::new();
        encoder.encode_field(":method", "GET", &mut buf);
        assert_eq!(&buf[..], &[0x82]);
    }

    #[test]
    fn reuses_dynamic_entry_on_second_encode() {
        let mut encoder = Encoder::new(4096);
        let mut buf = BytesMut::new();
        encoder.encode_field("x-trace-id", "abc123", &mut buf);
        let first_len = buf.len();
        encoder.encode_field("x-trace-id", "abc123", &mut buf);
        let second_part_len = buf.len() - first_len;
        // A second, indexed encode of the same exact pair is a single byte.
        assert_eq!(second_part_len, 1);
    }

    #[test]
    fn never_indexed_field_is_not_added_to_table() {
        let mut encoder = Encoder::new(4096);
        let mut buf = BytesMut::new();
        encoder.encode_field_never_indexed("authorization", "Bearer secret", &mut buf);
        assert_eq!(encoder.dynamic_table.len(), 0);
    }
}
