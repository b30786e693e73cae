//! Length-prefixed gRPC message framing over DATA frames.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::status::Status;

const FRAME_HEADER_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Identity,
    Gzip,
    Deflate,
}

impl Codec {
    pub fn name(self) -> &'static str {
        match self {
            Codec::Identity => "identity",
            Codec::Gzip => "gzip",
            Codec::Deflate => "deflate",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "identity" => Some(Codec::Identity),
            "gzip" => Some(Codec::Gzip),
            "deflate" => Some(Codec::Deflate),
            _ => None,
        }
    }

    pub fn compress(self, data: &[u8]) -> Bytes {
        match self {
            Codec::Identity => Bytes::copy_from_slice(data),
            Codec::Gzip => {
                use flate2::write::GzEncoder;
                use flate2::Compression;
                use std::io::Write;
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(data).expect("in-memory write");
                Bytes::from(encoder.finish().expect("in-memory finish"))
            }
            Codec::Deflate => {
                use flate2::write::DeflateEncoder;
                use flate2::Compression;
                use std::io::Write;
                let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(data).expect("in-memory write");
                Bytes::from(encoder.finish().expect("in-memory finish"))
            }
        }
    }

    pub fn decompress(self, data: &[u8]) -> Result<Bytes, Status> {
        match self {
            Codec::Identity => Ok(Bytes::copy_from_slice(data)),
            Codec::Gzip => {
                use flate2::read::GzDecoder;
                use std::io::Read;
                let mut decoder = GzDecoder::new(data);
                let mut out = Vec::new();
                decoder
                    .read_to_end(&mut out)
                    .map_err(|e| Status::internal(format!("gzip decompression failed: {e}")))?;
                Ok(Bytes::from(out))
            }
            Codec::Deflate => {
                use flate2::read::DeflateDecoder;
                use std::io::Read;
                let mut decoder = DeflateDecoder::new(data);
                let mut out = Vec::new();
                decoder
                    .read_to_end(&mut out)
                    .map_err(|e| Status::internal(format!("deflate decompression failed: {e}")))?;
                Ok(Bytes::from(out))
            }
        }
    }
}

/// Encode one gRPC message: 1-byte compressed-flag + 4-byte BE length +
/// payload. `payload` is already compressed by the caller if
/// `compressed` is true.
pub fn encode_message(payload: &[u8], compressed: bool, out: &mut BytesMut) {
    out.put_u8(compressed as u8);
    out.put_u32(payload.len() as u32);
    out.put_slice(payload);
}

/// Incremental message reassembler: DATA frame payloads may split a message
/// (or pack several) arbitrarily; feed bytes in as they arrive and drain
/// complete messages out.
#[derive(Default)]
pub struct MessageReassembler {
    buffer: BytesMut,
    max_message_size: usize,
}

pub struct RawMessage {
    pub compressed: bool,
    pub payload: Bytes,
}

impl MessageReassembler {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_message_size,
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Pop one complete message if the buffer holds enough bytes.
    /// `length > max_message_size` is rejected with `RESOURCE_EXHAUSTED`
    /// as soon as the length prefix is known, without
    /// waiting for the full payload to arrive.
    pub fn try_take(&mut self) -> Result<Option<RawMessage>, Status> {
        if self.buffer.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let compressed = self.buffer[0] != 0;
        let length = u32::from_be_bytes([self.buffer[1], self.buffer[2], self.buffer[3], self.buffer[4]]) as usize;
        if length > self.max_message_size {
            return Err(Status::resource_exhausted(format!(
                "message length {length} exceeds max_message_size {}",
                self.max_message_size
            )));
        }
        if self.buffer.len() < FRAME_HEADER_LEN + length {
            return Ok(None);
        }
        self.buffer.advance(FRAME_HEADER_LEN);
        let payload = self.buffer.split_to(length).freeze();
        Ok(Some(RawMessage { compressed, payload }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_single_message() {
        let mut encoded = BytesMut::new();
        encode_message(b"hello", false, &mut encoded);
        let mut reassembler = MessageReassembler::new(4 * 1024 * 1024);
        reassembler.feed(&encoded);
        let msg = reassembler.try_take().unwrap().unwrap();
        assert!(!msg.compressed);
        assert_eq!(&msg.payload[..], b"hello");
        assert!(reassembler.try_take().unwrap().is_none());
    }

    #[test]
    fn reassembles_across_arbitrary_split_points() {
        let mut encoded = BytesMut::new();
        encode_message(b"a longer payload than one chunk", false, &mut encoded);
        let mut reassembler = MessageReassembler::new(4 * 1024 * 1024);
        for chunk in encoded.chunks(3) {
            reassembler.feed(chunk);
        }
        let msg = reassembler.try_take().unwrap().unwrap();
        assert_eq!(&msg.payload[..], b"a longer payload than one chunk");
    }

    #[test]
    fn oversized_length_is_rejected_eagerly() {
        let mut reassembler = MessageReassembler::new(10);
        let mut header = BytesMut::new();
        header.put_u8(0);
        header.put_u32(1000);
        reassembler.feed(&header);
        assert!(reassembler.try_take().is_err());
    }

    #[test]
    fn gzip_round_trips() {
        let data = b"some payload bytes to compress";
        let compressed = Codec::Gzip.compress(data);
        let decompressed = Codec::Gzip.decompress(&compressed).unwrap();
        assert_eq!(&decompressed[..], data);
    }
}
