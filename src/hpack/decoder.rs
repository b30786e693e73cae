//! HPACK decoder: turns a header block fragment into an ordered list of
//! `(name, value)` pairs, maintaining the connection's dynamic table across
//! calls.

use bytes::Buf;

use super::integer;
use super::string;
use super::table::{DynamicTable, HeaderTable};
use crate::error::HpackError;

pub struct Decoder {
    dynamic_table: DynamicTable,
    max_dynamic_table_size: usize,
}

impl Decoder {
    pub fn new(max_dynamic_table_size: usize) -> Self {
        Self {
            dynamic_table: DynamicTable::new(max_dynamic_table_size),
            max_dynamic_table_size,
        }
    }

    /// Update the ceiling a dynamic table size update instruction may not
    /// exceed — driven by our own SETTINGS_HEADER_TABLE_SIZE.
    /// Takes effect the next time the peer sends a size update; it does not
    /// retroactively shrink the table we're already tracking.
    pub fn set_max_dynamic_table_size(&mut self, max_size: usize) {
        self.max_dynamic_table_size = max_size;
    }

    /// Decode a complete header block (the concatenation of all HEADERS /
    /// CONTINUATION frame payloads for one block). Returns the fields in
    /// wire order, pseudo-headers first as required; a regular header
    /// appearing before a pseudo-header is rejected.
    pub fn decode_block(&mut self, mut block: &[u8]) -> Result<Vec<(String, String)>, HpackError> {
        let mut fields = Vec::new();
        let mut seen_regular_header = false;

        while block.has_remaining() {
            let first = block.chunk()[0];
            if first & 0x80 != 0 {
                // Indexed Header Field (RFC 7541 §6.1).
                block.advance(1);
                let index = integer::decode(first & 0x7f, 7, &mut block)?;
                let (name, value) = {
                    let view = HeaderTable::new(&self.dynamic_table);
                    let (name, value) = view.lookup(index)?;
                    (name.to_string(), value.to_string())
                };
                Self::track_pseudo_order(&name, &mut seen_regular_header)?;
                fields.push((name, value));
            } else if first & 0x40 != 0 {
                // Literal Header Field with Incremental Indexing (§6.2.1).
                let (name, value) = self.decode_literal(first, 6, &mut block)?;
                Self::track_pseudo_order(&name, &mut seen_regular_header)?;
                self.dynamic_table.insert(name.clone(), value.clone());
                fields.push((name, value));
            } else if first & 0x20 != 0 {
                // Dynamic Table Size Update (§6.3).
                block.advance(1);
                let new_size = integer::decode(first & 0x1f, 5, &mut block)? as usize;
                if new_size > self.max_dynamic_table_size {
                    return Err(HpackError::TableSizeUpdateTooLarge);
                }
                self.dynamic_table.set_max_size(new_size);
            } else {
                // Literal Header Field without Indexing (§6.2.2) or Never
                // Indexed (§6.2.3) — both are decoded identically; only the
                // encoder side cares about the "never indexed" distinction.
                let (name, value) = self.decode_literal(first, 4, &mut block)?;
                Self::track_pseudo_order(&name, &mut seen_regular_header)?;
                fields.push((name, value));
            }
        }

        Ok(fields)
    }

    fn track_pseudo_order(name: &str, seen_regular_header: &mut bool) -> Result<(), HpackError> {
        if name.starts_with(':') {
            if *seen_regular_header {
                return Err(HpackError::PseudoHeaderAfterRegular);
            }
        } else {
            *seen_regular_header = true;
        }
        Ok(())
    }

    /// Shared decode path for the three literal representations; `first` is
    /// the not-yet-consumed first byte, `prefix_bits` the size of its index
    /// prefix (6 for incremental indexing, 4 for the other two).
    fn decode_literal(
        &self,
        first: u8,
        prefix_bits: u8,
        block: &mut &[u8],
    ) -> Result<(String, String), HpackError> {
        let prefix_mask = (1u8 << prefix_bits) - 1;
        let index_prefix = first & prefix_mask;
        block.advance(1);
        let index = integer::decode(index_prefix, prefix_bits, block)?;
        let name = if index == 0 {
            string::decode(block)?
        } else {
            let view = HeaderTable::new(&self.dynamic_table);
            view.lookup(index)?.0.to_string()
        };
        let value = string::decode(block)?;
        Ok((name, value))
    }
}

#[cfg(test)]
mod tests {
    use bytes::{BufMut, BytesMut};

    use super::*;
    use crate::hpack::encoder::Encoder;

    #[test]
    fn decodes_static_indexed_field() {
        let mut decoder = Decoder::new(4096);
        // Index 2 = (":method", "GET").
        let block = [0x82u8];
        let fields = decoder.decode_block(&block).unwrap();
        assert_eq!(fields, vec![(":method".to_string(), "GET".to_string())]);
    }

    #[test]
    fn round_trips_through_encoder() {
        let mut encoder = Encoder::new(4096);
        let mut decoder = Decoder::new(4096);
        let mut buf = BytesMut::new();
        encoder.encode_field(":path", "/v1/widgets", &mut buf);
        encoder.encode_field("x-custom", "value", &mut buf);
        let fields = decoder.decode_block(&buf).unwrap();
        assert_eq!(
            fields,
            vec![
                (":path".to_string(), "/v1/widgets".to_string()),
                ("x-custom".to_string(), "value".to_string()),
            ]
        );
    }

    #[test]
    fn pseudo_after_regular_is_rejected() {
        let mut encoder = Encoder::new(4096);
        let mut decoder = Decoder::new(4096);
        let mut buf = BytesMut::new();
        encoder.encode_field("x-custom", "value", &mut buf);
        encoder.encode_field_no_index(":path", "/late", &mut buf);
        assert!(decoder.decode_block(&buf).is_err());
    }

    #[test]
    fn table_size_update_above_ceiling_is_rejected() {
        let mut decoder = Decoder::new(100);
        let mut buf = BytesMut::new();
        integer::encode(9999, 5, 0x20, &mut buf);
        assert!(decoder.decode_block(&buf).is_err());
    }

    #[test]
    fn table_size_update_within_ceiling_is_applied() {
        let mut decoder = Decoder::new(4096);
        let mut buf = BytesMut::new();
        integer::encode(256, 5, 0x20, &mut buf);
        decoder.decode_block(&buf).unwrap();
        assert_eq!(decoder.dynamic_table.max_size(), 256);
    }
}
