//! HPACK integer representation (RFC 7541 §5.1).

use bytes::{Buf, BufMut, BytesMut};

use crate::error::HpackError;

/// Encode `value` using an N-bit prefix (`prefix_bits` in `1..=8`), OR-ing the
/// low bits of the first byte into `first_byte_prefix` (the already-shifted
/// leading bits, e.g. `0b1000_0000` for an indexed field).
pub fn encode(value: u64, prefix_bits: u8, first_byte_prefix: u8, buf: &mut BytesMut) {
    debug_assert!((1..=8).contains(&prefix_bits));
    let max_prefix = (1u64 << prefix_bits) - 1;
    if value < max_prefix {
        buf.put_u8(first_byte_prefix | value as u8);
        return;
    }
    buf.put_u8(first_byte_prefix | max_prefix as u8);
    let mut remainder = value - max_prefix;
    while remainder >= 128 {
        buf.put_u8(((remainder % 128) as u8) | 0x80);
        remainder /= 128;
    }
    buf.put_u8(remainder as u8);
}

/// Decode an integer given the first byte already masked down to its
/// prefix bits (`prefix_value`), reading continuation bytes from `buf` if
/// the prefix was saturated.
pub fn decode(prefix_value: u8, prefix_bits: u8, buf: &mut impl Buf) -> Result<u64, HpackError> {
    let max_prefix = (1u64 << prefix_bits) - 1;
    let mut value = prefix_value as u64;
    if value < max_prefix {
        return Ok(value);
    }
    let mut m = 0u32;
    loop {
        if !buf.has_remaining() {
            return Err(HpackError::UnexpectedEndOfBlock);
        }
        let byte = buf.get_u8();
        let continuation = byte & 0x80 != 0;
        let digit = (byte & 0x7f) as u64;
        value = value
            .checked_add(digit.checked_shl(m).ok_or(HpackError::IntegerOverflow)?)
            .ok_or(HpackError::IntegerOverflow)?;
        if value > u32::MAX as u64 {
            return Err(HpackError::IntegerOverflow);
        }
        if !continuation {
            break;
        }
        m += 7;
        if m > 35 {
            return Err(HpackError::IntegerOverflow);
        }
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: u64, prefix_bits: u8) {
        let mut buf = BytesMut::new();
        encode(value, prefix_bits, 0, &mut buf);
        let first = buf[0];
        let mut rest = buf.split_off(1);
        let max_prefix = (1u64 << prefix_bits) - 1;
        let prefix_value = (first as u64).min(max_prefix) as u8;
        let decoded = decode(prefix_value, prefix_bits, &mut rest).unwrap();
        assert_eq!(decoded, value, "prefix_bits={prefix_bits}");
    }

    #[test]
    fn rfc7541_example_c_1_1() {
        // 10 fits in a 5-bit prefix
        let mut buf = BytesMut::new();
        encode(10, 5, 0, &mut buf);
        assert_eq!(&buf[..], &[10]);
    }

    #[test]
    fn rfc7541_example_c_1_2() {
        // 1337 needs continuation bytes with a 5-bit prefix
        let mut buf = BytesMut::new();
        encode(1337, 5, 0, &mut buf);
        assert_eq!(&buf[..], &[31, 154, 10]);
    }

    #[test]
    fn rfc7541_example_c_1_3() {
        let mut buf = BytesMut::new();
        encode(42, 8, 0, &mut buf);
        assert_eq!(&buf[..], &[42]);
    }

    #[test]
    fn round_trips_various() {
        for bits in 1..=8u8 {
            for value in [0u64, 1, 30, 127, 128, 1337, 100_000, 5_000_000] {
                round_trip(value, bits);
            }
        }
    }

    #[test]
    fn overflow_is_rejected() {
        let mut buf = BytesMut::new();
        // A prefix-saturated byte followed by an absurd number of continuation bytes.
        buf.put_u8(0xff);
        for _ in 0..10 {
            buf.put_u8(0xff);
        }
        buf.put_u8(0x7f);
        let mut cursor = &buf[1..];
        assert!(decode(0x7f, 7, &mut cursor).is_err());
    }
}
