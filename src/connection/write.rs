//! The connection's single writer task: the only place that touches the
//! HPACK `Encoder`, mirroring the read side's exclusive ownership of the
//! `Decoder`.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::frame::{Frame, Http2ErrorCode, SettingsFrame, MIN_MAX_FRAME_SIZE};
use crate::hpack::Encoder;

/// Everything the read loop (and the per-RPC response forwarders it spawns)
/// can ask the writer to put on the wire. Headers are encoded here, not by
/// the caller, so that HPACK's dynamic table stays consistent regardless of
/// which task produced the header list.
pub enum WriteCommand {
    Headers {
        stream_id: u32,
        end_stream: bool,
        headers: Vec<(String, String)>,
    },
    Data {
        stream_id: u32,
        end_stream: bool,
        payload: Bytes,
    },
    RstStream {
        stream_id: u32,
        error_code: Http2ErrorCode,
    },
    Settings(SettingsFrame),
    SettingsAck,
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
    /// Applies a SETTINGS_HEADER_TABLE_SIZE change the peer sent us, ahead of
    /// the next header block the encoder builds (RFC 7541 §6.3).
    SetHeaderTableSize(usize),
}

/// Drains `rx` until every sender has dropped (i.e. the connection is
/// tearing down), encoding and writing one frame per command.
pub async fn run_writer<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<WriteCommand>,
    mut encoder: Encoder,
    remote_max_frame_size: std::sync::Arc<std::sync::atomic::AtomicU32>,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut pending_table_resize: Option<usize> = None;

    while let Some(command) = rx.recv().await {
        match command {
            WriteCommand::Headers {
                stream_id,
                end_stream,
                headers,
            } => {
                let mut block = BytesMut::new();
                if let Some(new_size) = pending_table_resize.take() {
                    encoder.set_max_dynamic_table_size(new_size, &mut block);
                }
                for (name, value) in &headers {
                    // High-cardinality values aren't worth a dynamic table slot.
                    if name == "grpc-message" || name.starts_with("grpc-status-details") {
                        encoder.encode_field_no_index(name, value, &mut block);
                    } else {
                        encoder.encode_field(name, value, &mut block);
                    }
                }
                let max_frame_size = remote_max_frame_size.load(std::sync::atomic::Ordering::Acquire);
                write_header_block(&mut writer, stream_id, end_stream, block.freeze(), max_frame_size).await?;
            }
            WriteCommand::Data {
                stream_id,
                end_stream,
                payload,
            } => {
                let frame = Frame::Data {
                    stream_id,
                    end_stream,
                    flow_control_len: payload.len(),
                    payload,
                };
                writer.write_all(&frame.encode()).await?;
            }
            WriteCommand::RstStream { stream_id, error_code } => {
                writer
                    .write_all(&Frame::RstStream { stream_id, error_code }.encode())
                    .await?;
            }
            WriteCommand::Settings(settings) => {
                writer.write_all(&Frame::Settings { ack: false, settings }.encode()).await?;
            }
            WriteCommand::SettingsAck => {
                writer
                    .write_all(
                        &Frame::Settings {
                            ack: true,
                            settings: SettingsFrame::default(),
                        }
                        .encode(),
                    )
                    .await?;
            }
            WriteCommand::Ping { ack, payload } => {
                writer.write_all(&Frame::Ping { ack, payload }.encode()).await?;
            }
            WriteCommand::GoAway {
                last_stream_id,
                error_code,
                debug_data,
            } => {
                writer
                    .write_all(
                        &Frame::GoAway {
                            last_stream_id,
                            error_code,
                            debug_data,
                        }
                        .encode(),
                    )
                    .await?;
            }
            WriteCommand::WindowUpdate { stream_id, increment } => {
                writer
                    .write_all(&Frame::WindowUpdate { stream_id, increment }.encode())
                    .await?;
            }
            WriteCommand::SetHeaderTableSize(new_size) => {
                pending_table_resize = Some(new_size);
            }
        }
        writer.flush().await?;
    }
    Ok(())
}

/// Split an HPACK-encoded header block into one HEADERS frame followed by as
/// many CONTINUATION frames as needed to respect `max_frame_size`.
async fn write_header_block<W: AsyncWrite + Unpin>(
    writer: &mut W,
    stream_id: u32,
    end_stream: bool,
    block: Bytes,
    max_frame_size: u32,
) -> std::io::Result<()> {
    let max = (max_frame_size.max(MIN_MAX_FRAME_SIZE)) as usize;
    if block.len() <= max {
        let frame = Frame::Headers {
            stream_id,
            end_stream,
            end_headers: true,
            header_block_fragment: block,
        };
        return writer.write_all(&frame.encode()).await;
    }

    let mut remaining = block;
    let first = remaining.split_to(max);
    writer
        .write_all(
            &Frame::Headers {
                stream_id,
                end_stream,
                end_headers: false,
                header_block_fragment: first,
            }
            .encode(),
        )
        .await?;

    while remaining.len() > max {
        let chunk = remaining.split_to(max);
        writer
            .write_all(
                &Frame::Continuation {
                    stream_id,
                    end_headers: false,
                    header_block_fragment: chunk,
                }
                .encode(),
            )
            .await?;
    }

    writer
        .write_all(
            &Frame::Continuation {
                stream_id,
                end_headers: true,
                header_block_fragment: remaining,
            }
            .encode(),
        )
        .await
}
