use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::FrameError;
use crate::frame::{FrameResult, FrameType};

pub const HEADER_LEN: usize = 9;

/// The 9-byte frame header common to every HTTP/2 frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub kind: u8,
    pub flags: u8,
    pub stream_id: u32,
}

impl FrameHeader {
    pub fn new(length: u32, kind: u8, flags: u8, stream_id: u32) -> Self {
        debug_assert!(length <= 0x00ff_ffff);
        debug_assert!(stream_id & 0x8000_0000 == 0);
        Self {
            length,
            kind,
            flags,
            stream_id,
        }
    }

    pub fn frame_type(&self) -> FrameType {
        FrameType::from_byte(self.kind)
    }

    /// Decode a 9-byte header. Panics if `bytes.len() != HEADER_LEN`; callers
    /// buffer until a complete header is available first.
    pub fn decode(bytes: &[u8]) -> Self {
        assert_eq!(bytes.len(), HEADER_LEN);
        let length = u32::from(bytes[0]) << 16 | u32::from(bytes[1]) << 8 | u32::from(bytes[2]);
        let kind = bytes[3];
        let flags = bytes[4];
        // top bit of the 4-byte stream id is reserved and must be cleared on read.
        let stream_id = u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]) & 0x7fff_ffff;
        Self {
            length,
            kind,
            flags,
            stream_id,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(HEADER_LEN);
        buf.put_u8((self.length >> 16) as u8);
        buf.put_u8((self.length >> 8) as u8);
        buf.put_u8(self.length as u8);
        buf.put_u8(self.kind);
        buf.put_u8(self.flags);
        buf.put_u32(self.stream_id & 0x7fff_ffff);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN);
        self.encode(&mut buf);
        buf.freeze()
    }
}

/// Checks a declared frame length against the negotiated max, applying the
/// leniency allowed before our SETTINGS has been ACKed.
pub fn check_frame_size(length: u32, max_frame_size: u32, settings_acked: bool) -> FrameResult<()> {
    if settings_acked && length > max_frame_size {
        return Err(FrameError::FrameSizeError);
    }
    Ok(())
}

/// Strips PADDED-flag padding from a frame payload, returning the unpadded
/// slice. `pad_length >= payload.len()` is a PROTOCOL_ERROR.
pub fn strip_padding(mut payload: Bytes) -> FrameResult<Bytes> {
    if payload.is_empty() {
        return Err(FrameError::ProtocolError("PADDED frame has no pad-length byte".into()));
    }
    let pad_len = payload[0] as usize;
    payload.advance(1);
    if pad_len >= payload.len() + 1 {
        return Err(FrameError::ProtocolError(
            "pad length exceeds frame payload".into(),
        ));
    }
    if pad_len > payload.len() {
        return Err(FrameError::ProtocolError(
            "pad length exceeds remaining payload".into(),
        ));
    }
    let content_len = payload.len() - pad_len;
    Ok(payload.split_to(content_len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = FrameHeader::new(12345, 0x1, 0x4, 7);
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_LEN);
        let decoded = FrameHeader::decode(&buf);
        assert_eq!(decoded, header);
    }

    #[test]
    fn header_clears_reserved_bit() {
        let mut raw = [0u8; HEADER_LEN];
        raw[5] = 0x80; // reserved bit set
        raw[8] = 0x01;
        let decoded = FrameHeader::decode(&raw);
        assert_eq!(decoded.stream_id, 1);
    }

    #[test]
    fn padding_strip() {
        let payload = Bytes::from_static(&[2, b'h', b'i', 0, 0]);
        let stripped = strip_padding(payload).unwrap();
        assert_eq!(&stripped[..], b"hi");
    }

    #[test]
    fn padding_too_large_is_protocol_error() {
        let payload = Bytes::from_static(&[5, b'h', b'i']);
        assert!(strip_padding(payload).is_err());
    }
}
