//! HPACK string literal representation (RFC 7541 §5.2): a Huffman flag
//! bit, a 7-bit-prefixed length, then either raw bytes or a Huffman-coded
//! payload.

use bytes::{Buf, BufMut, BytesMut};

use super::{huffman, integer};
use crate::error::HpackError;

const HUFFMAN_FLAG: u8 = 0x80;

/// Encode `value`, choosing Huffman coding only when it is strictly shorter
/// than the raw representation.
pub fn encode(value: &str, buf: &mut BytesMut) {
    let huffman_len = huffman::encoded_len(value.as_bytes());
    if huffman_len < value.len() {
        integer::encode(huffman_len as u64, 7, HUFFMAN_FLAG, buf);
        huffman::encode(value.as_bytes(), buf);
    } else {
        integer::encode(value.len() as u64, 7, 0, buf);
        buf.put_slice(value.as_bytes());
    }
}

/// Decode a string literal from the front of `buf`, returning owned bytes
/// decoded as UTF-8 (invalid UTF-8 is rejected as a decode error; header
/// field values on the wire are expected to be visible ASCII or UTF-8).
pub fn decode(buf: &mut impl Buf) -> Result<String, HpackError> {
    if !buf.has_remaining() {
        return Err(HpackError::UnexpectedEndOfBlock);
    }
    let first = buf.chunk()[0];
    let huffman_coded = first & HUFFMAN_FLAG != 0;
    let prefix_value = first & 0x7f;
    buf.advance(1);
    let len = integer::decode(prefix_value, 7, buf)? as usize;
    if buf.remaining() < len {
        return Err(HpackError::UnexpectedEndOfBlock);
    }
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    if huffman_coded {
        let decoded = huffman::decode(&raw)?;
        String::from_utf8(decoded).map_err(|_| HpackError::HuffmanDecodingError)
    } else {
        String::from_utf8(raw).map_err(|_| HpackError::HuffmanDecodingError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: &str) {
        let mut buf = BytesMut::new();
        encode(value, &mut buf);
        let mut cursor = &buf[..];
        let decoded = decode(&mut cursor).unwrap();
        assert_eq!(decoded, value);
        assert!(cursor.is_empty());
    }

    #[test]
    fn round_trips_plain_and_huffman_friendly() {
        round_trip("www.example.com");
        round_trip("");
        round_trip("custom-key");
        round_trip("a very, very long header value that repeats itself a lot a lot a lot");
    }

    #[test]
    fn truncated_input_errors() {
        let mut buf = BytesMut::new();
        integer::encode(50, 7, 0, &mut buf);
        buf.put_slice(b"short");
        let mut cursor = &buf[..];
        assert!(decode(&mut cursor).is_err());
    }
}
