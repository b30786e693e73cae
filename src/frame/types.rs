use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::FrameError;
use crate::frame::header::{check_frame_size, strip_padding, FrameHeader, HEADER_LEN};
use crate::frame::{FrameResult, FrameType, Http2ErrorCode, SettingsFrame};

/// A decoded HTTP/2 frame. HEADERS/CONTINUATION carry the *raw* header-block
/// fragment — HPACK decoding happens once in the connection runtime after
/// all CONTINUATION fragments for a block have been concatenated.
#[derive(Debug, Clone)]
pub enum Frame {
    Data {
        stream_id: u32,
        end_stream: bool,
        /// Total bytes consumed from the flow-control window, including any
        /// padding that was present on the wire.
        flow_control_len: usize,
        payload: Bytes,
    },
    Headers {
        stream_id: u32,
        end_stream: bool,
        end_headers: bool,
        header_block_fragment: Bytes,
    },
    Priority {
        stream_id: u32,
    },
    RstStream {
        stream_id: u32,
        error_code: Http2ErrorCode,
    },
    Settings {
        ack: bool,
        settings: SettingsFrame,
    },
    PushPromise {
        stream_id: u32,
    },
    Ping {
        ack: bool,
        payload: [u8; 8],
    },
    GoAway {
        last_stream_id: u32,
        error_code: Http2ErrorCode,
        debug_data: Bytes,
    },
    WindowUpdate {
        stream_id: u32,
        increment: u32,
    },
    Continuation {
        stream_id: u32,
        end_headers: bool,
        header_block_fragment: Bytes,
    },
    Unknown {
        kind: u8,
        stream_id: u32,
    },
}

impl Frame {
    pub fn stream_id(&self) -> u32 {
        match self {
            Frame::Data { stream_id, .. }
            | Frame::Headers { stream_id, .. }
            | Frame::Priority { stream_id }
            | Frame::RstStream { stream_id, .. }
            | Frame::PushPromise { stream_id }
            | Frame::WindowUpdate { stream_id, .. }
            | Frame::Continuation { stream_id, .. }
            | Frame::Unknown { stream_id, .. } => *stream_id,
            Frame::Settings { .. } | Frame::Ping { .. } => 0,
            Frame::GoAway { .. } => 0,
        }
    }

    /// Decode a frame body given its already-parsed header and full payload
    /// (the caller has already read exactly `header.length` bytes).
    pub fn decode(header: &FrameHeader, payload: Bytes, max_frame_size: u32, settings_acked: bool) -> FrameResult<Self> {
        check_frame_size(header.length, max_frame_size, settings_acked)?;
        let flags = header.flags;
        match header.frame_type() {
            FrameType::Data => {
                let flow_control_len = payload.len();
                let padded = flags & 0x8 != 0;
                let content = if padded { strip_padding(payload)? } else { payload };
                Ok(Frame::Data {
                    stream_id: header.stream_id,
                    end_stream: flags & 0x1 != 0,
                    flow_control_len,
                    payload: content,
                })
            }
            FrameType::Headers => {
                let padded = flags & 0x8 != 0;
                let mut content = if padded { strip_padding(payload)? } else { payload };
                if flags & 0x20 != 0 {
                    // PRIORITY flag: 5 bytes of stream-dependency info we accept
                    // but ignore.
                    if content.len() < 5 {
                        return Err(FrameError::ProtocolError("HEADERS priority fields truncated".into()));
                    }
                    content.advance(5);
                }
                Ok(Frame::Headers {
                    stream_id: header.stream_id,
                    end_stream: flags & 0x1 != 0,
                    end_headers: flags & 0x4 != 0,
                    header_block_fragment: content,
                })
            }
            FrameType::Priority => {
                if header.length != 5 {
                    return Err(FrameError::FrameSizeError);
                }
                Ok(Frame::Priority {
                    stream_id: header.stream_id,
                })
            }
            FrameType::RstStream => {
                if header.length != 4 {
                    return Err(FrameError::FrameSizeError);
                }
                let mut buf = payload;
                let code = buf.get_u32();
                Ok(Frame::RstStream {
                    stream_id: header.stream_id,
                    error_code: Http2ErrorCode::from_u32(code),
                })
            }
            FrameType::Settings => {
                let ack = flags & 0x1 != 0;
                if ack && header.length != 0 {
                    return Err(FrameError::FrameSizeError);
                }
                let settings = if ack {
                    SettingsFrame::default()
                } else {
                    SettingsFrame::decode(&payload)?
                };
                Ok(Frame::Settings { ack, settings })
            }
            FrameType::PushPromise => Ok(Frame::PushPromise {
                stream_id: header.stream_id,
            }),
            FrameType::Ping => {
                if header.length != 8 {
                    return Err(FrameError::FrameSizeError);
                }
                if header.stream_id != 0 {
                    return Err(FrameError::ProtocolError("PING on non-zero stream".into()));
                }
                let mut arr = [0u8; 8];
                arr.copy_from_slice(&payload[..8]);
                Ok(Frame::Ping {
                    ack: flags & 0x1 != 0,
                    payload: arr,
                })
            }
            FrameType::GoAway => {
                if header.length < 8 {
                    return Err(FrameError::FrameSizeError);
                }
                let mut buf = payload;
                let last_stream_id = buf.get_u32() & 0x7fff_ffff;
                let error_code = Http2ErrorCode::from_u32(buf.get_u32());
                Ok(Frame::GoAway {
                    last_stream_id,
                    error_code,
                    debug_data: buf,
                })
            }
            FrameType::WindowUpdate => {
                if header.length != 4 {
                    return Err(FrameError::FrameSizeError);
                }
                let mut buf = payload;
                let increment = buf.get_u32() & 0x7fff_ffff;
                if increment == 0 {
                    return Err(FrameError::ProtocolError("WINDOW_UPDATE increment of 0".into()));
                }
                Ok(Frame::WindowUpdate {
                    stream_id: header.stream_id,
                    increment,
                })
            }
            FrameType::Continuation => Ok(Frame::Continuation {
                stream_id: header.stream_id,
                end_headers: flags & 0x4 != 0,
                header_block_fragment: payload,
            }),
            FrameType::Unknown(kind) => Ok(Frame::Unknown {
                kind,
                stream_id: header.stream_id,
            }),
        }
    }

    /// Encode this frame to the wire, header included.
    pub fn encode(&self) -> Bytes {
        let (kind, flags, stream_id, payload): (u8, u8, u32, Bytes) = match self {
            Frame::Data {
                stream_id,
                end_stream,
                payload,
                ..
            } => (
                FrameType::Data.to_byte(),
                if *end_stream { 0x1 } else { 0 },
                *stream_id,
                payload.clone(),
            ),
            Frame::Headers {
                stream_id,
                end_stream,
                end_headers,
                header_block_fragment,
            } => {
                let mut flags = 0u8;
                if *end_stream {
                    flags |= 0x1;
                }
                if *end_headers {
                    flags |= 0x4;
                }
                (
                    FrameType::Headers.to_byte(),
                    flags,
                    *stream_id,
                    header_block_fragment.clone(),
                )
            }
            Frame::RstStream {
                stream_id,
                error_code,
            } => {
                let mut buf = BytesMut::with_capacity(4);
                buf.put_u32(*error_code as u32);
                (FrameType::RstStream.to_byte(), 0, *stream_id, buf.freeze())
            }
            Frame::Settings { ack, settings } => (
                FrameType::Settings.to_byte(),
                if *ack { 0x1 } else { 0 },
                0,
                if *ack { Bytes::new() } else { settings.encode() },
            ),
            Frame::Ping { ack, payload } => (
                FrameType::Ping.to_byte(),
                if *ack { 0x1 } else { 0 },
                0,
                Bytes::copy_from_slice(payload),
            ),
            Frame::GoAway {
                last_stream_id,
                error_code,
                debug_data,
            } => {
                let mut buf = BytesMut::with_capacity(8 + debug_data.len());
                buf.put_u32(*last_stream_id & 0x7fff_ffff);
                buf.put_u32(*error_code as u32);
                buf.extend_from_slice(debug_data);
                (FrameType::GoAway.to_byte(), 0, 0, buf.freeze())
            }
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => {
                let mut buf = BytesMut::with_capacity(4);
                buf.put_u32(*increment & 0x7fff_ffff);
                (
                    FrameType::WindowUpdate.to_byte(),
                    0,
                    *stream_id,
                    buf.freeze(),
                )
            }
            Frame::Continuation {
                stream_id,
                end_headers,
                header_block_fragment,
            } => (
                FrameType::Continuation.to_byte(),
                if *end_headers { 0x4 } else { 0 },
                *stream_id,
                header_block_fragment.clone(),
            ),
            Frame::Priority { stream_id } => {
                (FrameType::Priority.to_byte(), 0, *stream_id, Bytes::new())
            }
            Frame::PushPromise { stream_id } => {
                (FrameType::PushPromise.to_byte(), 0, *stream_id, Bytes::new())
            }
            Frame::Unknown { kind, stream_id } => (*kind, 0, *stream_id, Bytes::new()),
        };

        let header = FrameHeader::new(payload.len() as u32, kind, flags, stream_id);
        let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
        header.encode(&mut out);
        out.extend_from_slice(&payload);
        out.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Setting;

    fn round_trip(frame: Frame) {
        let encoded = frame.encode();
        let header = FrameHeader::decode(&encoded[..HEADER_LEN]);
        let payload = Bytes::copy_from_slice(&encoded[HEADER_LEN..]);
        let decoded = Frame::decode(&header, payload, MAX_FRAME_SIZE_TEST, true).unwrap();
        assert_eq!(format!("{decoded:?}"), format!("{frame:?}"));
    }

    const MAX_FRAME_SIZE_TEST: u32 = 16_777_215;

    #[test]
    fn ping_round_trip() {
        round_trip(Frame::Ping {
            ack: false,
            payload: *b"12345678",
        });
    }

    #[test]
    fn settings_ack_round_trip() {
        round_trip(Frame::Settings {
            ack: true,
            settings: SettingsFrame::default(),
        });
    }

    #[test]
    fn settings_round_trip() {
        round_trip(Frame::Settings {
            ack: false,
            settings: SettingsFrame::new(vec![Setting::InitialWindowSize(1000)]),
        });
    }

    #[test]
    fn window_update_round_trip() {
        round_trip(Frame::WindowUpdate {
            stream_id: 3,
            increment: 500,
        });
    }

    #[test]
    fn goaway_round_trip() {
        round_trip(Frame::GoAway {
            last_stream_id: 9,
            error_code: Http2ErrorCode::NoError,
            debug_data: Bytes::new(),
        });
    }

    #[test]
    fn headers_padded_decode() {
        // pad length byte = 2, then "hi", then 2 pad bytes
        let payload = Bytes::from_static(&[2, b'h', b'i', 0, 0]);
        let header = FrameHeader::new(payload.len() as u32, FrameType::Headers.to_byte(), 0x8 | 0x4 | 0x1, 1);
        let decoded = Frame::decode(&header, payload, MAX_FRAME_SIZE_TEST, true).unwrap();
        match decoded {
            Frame::Headers {
                header_block_fragment,
                end_headers,
                end_stream,
                ..
            } => {
                assert_eq!(&header_block_fragment[..], b"hi");
                assert!(end_headers);
                assert!(end_stream);
            }
            _ => panic!("expected headers frame"),
        }
    }

    #[test]
    fn frame_too_large_after_ack_is_error() {
        let payload = Bytes::from(vec![0u8; 100]);
        let header = FrameHeader::new(100, FrameType::Data.to_byte(), 0, 1);
        assert!(Frame::decode(&header, payload, 50, true).is_err());
    }

    #[test]
    fn window_update_zero_increment_is_protocol_error() {
        let mut buf = BytesMut::new();
        buf.put_u32(0);
        let header = FrameHeader::new(4, FrameType::WindowUpdate.to_byte(), 0, 1);
        assert!(Frame::decode(&header, buf.freeze(), MAX_FRAME_SIZE_TEST, true).is_err());
    }
}
