//! Per-connection runtime.
//!
//! A TCP connection's lifecycle splits across tasks: one task owns the
//! socket's read half and drives the HTTP/2 demultiplexing state machine
//! ([`run`] below), a second task ([`write::run_writer`]) owns the write
//! half and the HPACK encoder exclusively, and short-lived per-RPC tasks
//! talk to both only through the channels in [`crate::adapters`] and the
//! `write_tx` queue.

mod write;

pub use write::WriteCommand;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use bytes::{Bytes, BytesMut};
use fnv::FnvHashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{mpsc, Notify};

use crate::adapters::{self, Receiver, Sender};
use crate::config::ServerConfig;
use crate::context::{CancellationHandle, Deadline, PeerInfo, RequestContext};
use crate::deadline::DeadlineScheduler;
use crate::dispatcher::{DispatchOutcome, Dispatcher};
use crate::frame::{
    CONNECTION_PREFACE, Frame, FrameHeader, Http2ErrorCode, Setting, SettingsFrame, DEFAULT_MAX_FRAME_SIZE, HEADER_LEN,
};
use crate::grpc::{
    encode_message, extract_request_metadata, has_trailers_te, parse_path, validate_content_type, validate_http_method,
    Codec as GrpcCodec, MessageReassembler,
};
use crate::hpack::{Decoder, Encoder};
use crate::registry::MethodPattern;
use crate::registry::ServiceRegistry;
use crate::status::Status;
use crate::stream::{HeaderList, Stream, StreamEvent, StreamTable};
use crate::{debug_log, debug_warn};

/// Why the read loop stopped demultiplexing frames and needs to tell the
/// peer via GOAWAY before the writer drains and the connection closes.
struct Terminate {
    code: Http2ErrorCode,
    message: String,
}

impl Terminate {
    fn protocol(message: impl Into<String>) -> Self {
        Self {
            code: Http2ErrorCode::ProtocolError,
            message: message.into(),
        }
    }
}

struct ConnState {
    streams: StreamTable,
    flow: crate::flow_control::FlowController,
}

/// State shared between the read loop and every per-RPC task it spawns.
struct Shared {
    state: Mutex<ConnState>,
    remote_max_frame_size: AtomicU32,
    write_tx: mpsc::Sender<WriteCommand>,
    /// Woken on WINDOW_UPDATE and SETTINGS_INITIAL_WINDOW_SIZE so forwarders
    /// blocked in [`send_data_flow_controlled`] can recheck their window.
    write_notify: Notify,
}

/// Accumulates HEADERS + CONTINUATION* fragments until END_HEADERS.
struct PendingHeaderBlock {
    stream_id: u32,
    end_stream: bool,
    buffer: BytesMut,
}

/// Everything the read loop keeps about a stream whose headers it has fully
/// parsed but whose dispatch isn't finished yet.
struct InboundEntry {
    cancellation: CancellationHandle,
    kind: InboundKind,
}

enum InboundKind {
    /// Unary / server-streaming: the single request message is buffered
    /// until `end_stream`, then dispatch starts.
    Buffered {
        ctx: RequestContext,
        path: String,
        pattern: MethodPattern,
        reassembler: MessageReassembler,
        compression: GrpcCodec,
        response_compression: GrpcCodec,
        content_type: String,
        /// Held until dispatch spawns its handler task at `end_stream`,
        /// then moved into that task; released when it finishes.
        permit: tokio::sync::OwnedSemaphorePermit,
    },
    /// Client-streaming / bidi-streaming: dispatch already started at
    /// headers-complete time; DATA frames feed `message_tx` as they
    /// reassemble into complete messages.
    Streaming {
        message_tx: adapters::Sender<Bytes>,
        reassembler: MessageReassembler,
        compression: GrpcCodec,
    },
    /// Headers were already answered (unimplemented, refused, malformed);
    /// further DATA for this stream is discarded.
    Rejected,
}

/// Drive one accepted connection to completion: preface, SETTINGS exchange,
/// frame demultiplexing, and per-RPC dispatch, until the peer goes away, a
/// protocol violation forces a GOAWAY, or `shutdown` fires.
pub async fn serve<S>(
    stream: S,
    peer: PeerInfo,
    config: Arc<ServerConfig>,
    registry: Arc<RwLock<ServiceRegistry>>,
    dispatcher: Arc<Dispatcher>,
    shutdown: Arc<Notify>,
) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);

    let mut preface = [0u8; 24];
    if reader.read_exact(&mut preface).await.is_err() || &preface != CONNECTION_PREFACE {
        debug_warn!("connection from {peer} closed before a valid preface arrived");
        return Ok(());
    }

    let (write_tx, write_rx) = mpsc::channel::<WriteCommand>(config.max_concurrent_streams as usize * 4 + 16);
    let remote_max_frame_size = Arc::new(AtomicU32::new(DEFAULT_MAX_FRAME_SIZE));
    let encoder = Encoder::new(config.header_table_size as usize);
    let writer_task = tokio::spawn(write::run_writer(writer, write_rx, encoder, Arc::clone(&remote_max_frame_size)));

    let shared = Arc::new(Shared {
        state: Mutex::new(ConnState {
            streams: StreamTable::new(),
            flow: crate::flow_control::FlowController::new(config.initial_window_size),
        }),
        remote_max_frame_size: AtomicU32::new(DEFAULT_MAX_FRAME_SIZE),
        write_tx,
        write_notify: Notify::new(),
    });

    let local_settings = SettingsFrame::new(vec![
        Setting::HeaderTableSize(config.header_table_size),
        Setting::EnablePush(false),
        Setting::MaxConcurrentStreams(config.max_concurrent_streams),
        Setting::InitialWindowSize(config.initial_window_size),
        Setting::MaxFrameSize(config.max_frame_size),
    ]);
    let _ = shared.write_tx.send(WriteCommand::Settings(local_settings)).await;

    let mut driver = ConnectionDriver {
        shared: Arc::clone(&shared),
        decoder: Decoder::new(config.header_table_size as usize),
        inbound: FnvHashMap::default(),
        pending_header_block: None,
        deadlines: DeadlineScheduler::new(),
        local_max_frame_size: config.max_frame_size,
        config,
        registry,
        dispatcher,
        peer,
        settings_acked: false,
        draining: false,
    };

    let result = driver.run(&mut reader, shutdown).await;

    if let Err(terminate) = result {
        let last_stream_id = driver.shared.state.lock().unwrap().streams.ids().max().unwrap_or(0);
        let _ = driver
            .shared
            .write_tx
            .send(WriteCommand::GoAway {
                last_stream_id,
                error_code: terminate.code,
                debug_data: Bytes::from(terminate.message),
            })
            .await;
    }

    drop(driver);
    let _ = writer_task.await;
    Ok(())
}

struct ConnectionDriver {
    shared: Arc<Shared>,
    decoder: Decoder,
    inbound: FnvHashMap<u32, InboundEntry>,
    pending_header_block: Option<PendingHeaderBlock>,
    deadlines: DeadlineScheduler,
    config: Arc<ServerConfig>,
    registry: Arc<RwLock<ServiceRegistry>>,
    dispatcher: Arc<Dispatcher>,
    peer: PeerInfo,
    settings_acked: bool,
    /// Our own advertised SETTINGS_MAX_FRAME_SIZE; incoming frames are
    /// checked against this, not the peer's.
    local_max_frame_size: u32,
    draining: bool,
}

impl ConnectionDriver {
    async fn run<R>(&mut self, reader: &mut R, shutdown: Arc<Notify>) -> Result<(), Terminate>
    where
        R: AsyncRead + Unpin,
    {
        let mut header_buf = [0u8; HEADER_LEN];
        loop {
            let sleep = match self.deadlines.next_wakeup() {
                Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)),
                None => tokio::time::sleep(std::time::Duration::from_secs(3_600)),
            };
            tokio::pin!(sleep);

            tokio::select! {
                biased;

                _ = shutdown.notified(), if !self.draining => {
                    self.begin_drain().await;
                }

                result = reader.read_exact(&mut header_buf) => {
                    if result.is_err() {
                        return Ok(());
                    }
                    let header = FrameHeader::decode(&header_buf);
                    if self.settings_acked && header.length > self.local_max_frame_size {
                        return Err(Terminate {
                            code: Http2ErrorCode::FrameSizeError,
                            message: "frame exceeds our advertised SETTINGS_MAX_FRAME_SIZE".into(),
                        });
                    }
                    let mut payload = vec![0u8; header.length as usize];
                    if reader.read_exact(&mut payload).await.is_err() {
                        return Ok(());
                    }
                    let remote_max = self.shared.remote_max_frame_size.load(Ordering::Acquire);
                    let frame = match Frame::decode(&header, Bytes::from(payload), remote_max.max(self.local_max_frame_size), self.settings_acked) {
                        Ok(frame) => frame,
                        Err(err) => {
                            return Err(Terminate::protocol(format!("frame decode error: {err}")));
                        }
                    };
                    self.handle_frame(frame).await?;
                }

                _ = &mut sleep, if self.deadlines.next_wakeup().is_some() => {
                    for expired in self.deadlines.poll_expired() {
                        self.inbound.remove(&expired.stream_id);
                        let _ = self.shared.write_tx.send(WriteCommand::RstStream {
                            stream_id: expired.stream_id,
                            error_code: Http2ErrorCode::Cancel,
                        }).await;
                    }
                }
            }

            if self.draining {
                let state = self.shared.state.lock().unwrap();
                if state.streams.is_empty() {
                    return Ok(());
                }
            }
        }
    }

    async fn begin_drain(&mut self) {
        self.draining = true;
        let last_stream_id = self.shared.state.lock().unwrap().streams.ids().max().unwrap_or(0);
        debug_log!("connection from {} entering graceful drain at stream {last_stream_id}", self.peer);
        let _ = self
            .shared
            .write_tx
            .send(WriteCommand::GoAway {
                last_stream_id,
                error_code: Http2ErrorCode::NoError,
                debug_data: Bytes::new(),
            })
            .await;
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<(), Terminate> {
        match (&self.pending_header_block, &frame) {
            (Some(pending), Frame::Continuation { stream_id, .. }) if *stream_id == pending.stream_id => {}
            (Some(_), _) => {
                return Err(Terminate::protocol("expected a CONTINUATION frame to follow HEADERS"));
            }
            _ => {}
        }

        match frame {
            Frame::Settings { ack, settings } => self.handle_settings(ack, settings).await,
            Frame::Ping { ack, payload } => {
                self.handle_ping(ack, payload).await;
                Ok(())
            }
            Frame::GoAway {
                last_stream_id,
                error_code,
                ..
            } => {
                debug_log!("peer sent GOAWAY last_stream_id={last_stream_id} error={error_code:?}, draining in-flight streams");
                if !self.draining {
                    self.draining = true;
                }
                Ok(())
            }
            Frame::WindowUpdate { stream_id, increment } => self.handle_window_update(stream_id, increment).await,
            Frame::Headers {
                stream_id,
                end_stream,
                end_headers,
                header_block_fragment,
            } => self.handle_headers_frame(stream_id, end_stream, end_headers, header_block_fragment).await,
            Frame::Continuation {
                stream_id,
                end_headers,
                header_block_fragment,
            } => self.handle_continuation_frame(stream_id, end_headers, header_block_fragment).await,
            Frame::Data {
                stream_id,
                end_stream,
                flow_control_len,
                payload,
            } => self.handle_data_frame(stream_id, end_stream, flow_control_len, payload).await,
            Frame::RstStream { stream_id, error_code } => {
                self.handle_rst_stream(stream_id, error_code);
                Ok(())
            }
            Frame::PushPromise { .. } => {
                // PUSH_PROMISE received server-side is fatal.
                Err(Terminate::protocol("received PUSH_PROMISE on a server connection"))
            }
            Frame::Priority { .. } | Frame::Unknown { .. } => Ok(()),
        }
    }

    async fn handle_settings(&mut self, ack: bool, settings: SettingsFrame) -> Result<(), Terminate> {
        if ack {
            return Ok(());
        }
        for setting in &settings.settings {
            match *setting {
                Setting::HeaderTableSize(size) => {
                    self.decoder.set_max_dynamic_table_size(size as usize);
                    let _ = self.shared.write_tx.send(WriteCommand::SetHeaderTableSize(size as usize)).await;
                }
                Setting::InitialWindowSize(new_initial) => {
                    let mut state = self.shared.state.lock().unwrap();
                    for stream in state.streams.values_mut() {
                        stream.send_window.adjust_initial(new_initial);
                    }
                }
                Setting::MaxFrameSize(size) => {
                    self.shared
                        .remote_max_frame_size
                        .store(size.max(crate::frame::MIN_MAX_FRAME_SIZE), Ordering::Release);
                }
                _ => {}
            }
        }
        self.settings_acked = true;
        let _ = self.shared.write_tx.send(WriteCommand::SettingsAck).await;
        self.shared.write_notify.notify_waiters();
        Ok(())
    }

    async fn handle_ping(&mut self, ack: bool, payload: [u8; 8]) {
        if !ack {
            let _ = self.shared.write_tx.send(WriteCommand::Ping { ack: true, payload }).await;
        }
    }

    async fn handle_window_update(&mut self, stream_id: u32, increment: u32) -> Result<(), Terminate> {
        let mut state = self.shared.state.lock().unwrap();
        let result = if stream_id == 0 {
            state.flow.conn_send.apply_increment(increment)
        } else if let Some(stream) = state.streams.get_mut(stream_id) {
            stream.send_window.apply_increment(increment)
        } else {
            Ok(())
        };
        drop(state);

        match result {
            Ok(()) => {
                self.shared.write_notify.notify_waiters();
                Ok(())
            }
            Err(crate::error::GrpcRuntimeError::StreamProtocol(code, message)) => {
                if stream_id == 0 {
                    Err(Terminate { code, message })
                } else {
                    let _ = self.shared.write_tx.send(WriteCommand::RstStream { stream_id, error_code: code }).await;
                    Ok(())
                }
            }
            Err(_) => Ok(()),
        }
    }

    fn handle_rst_stream(&mut self, stream_id: u32, error_code: Http2ErrorCode) {
        debug_log!("stream {stream_id} reset by peer: {error_code:?}");
        if let Some(entry) = self.inbound.remove(&stream_id) {
            entry.cancellation.cancel();
        }
        self.deadlines.remove(stream_id);
        let mut state = self.shared.state.lock().unwrap();
        if let Some(stream) = state.streams.get_mut(stream_id) {
            let _ = stream.apply(StreamEvent::RecvReset);
            state.streams.remove(stream_id);
        }
    }

    async fn handle_headers_frame(
        &mut self,
        stream_id: u32,
        end_stream: bool,
        end_headers: bool,
        fragment: Bytes,
    ) -> Result<(), Terminate> {
        if stream_id == 0 || stream_id % 2 == 0 {
            return Err(Terminate::protocol("client opened a stream with an invalid id"));
        }
        let already_open = {
            let state = self.shared.state.lock().unwrap();
            state.streams.get(stream_id).is_some()
        };
        if !already_open {
            let state = self.shared.state.lock().unwrap();
            if stream_id <= state.streams.last_peer_stream_id {
                return Err(Terminate::protocol("stream id is not monotonically increasing"));
            }
        }

        if end_headers {
            self.finish_header_block(stream_id, end_stream, fragment).await
        } else {
            self.pending_header_block = Some(PendingHeaderBlock {
                stream_id,
                end_stream,
                buffer: BytesMut::from(&fragment[..]),
            });
            Ok(())
        }
    }

    async fn handle_continuation_frame(
        &mut self,
        stream_id: u32,
        end_headers: bool,
        fragment: Bytes,
    ) -> Result<(), Terminate> {
        match &mut self.pending_header_block {
            Some(pending) if pending.stream_id == stream_id => pending.buffer.extend_from_slice(&fragment),
            _ => return Err(Terminate::protocol("unexpected CONTINUATION frame")),
        }
        if end_headers {
            let pending = self.pending_header_block.take().expect("checked above");
            self.finish_header_block(pending.stream_id, pending.end_stream, pending.buffer.freeze())
                .await
        } else {
            Ok(())
        }
    }

    /// HPACK-decode a complete header block, validate it, and either reject
    /// the stream with a gRPC status or begin dispatch.
    async fn finish_header_block(&mut self, stream_id: u32, end_stream: bool, block: Bytes) -> Result<(), Terminate> {
        let fields = match self.decoder.decode_block(&block) {
            Ok(fields) => fields,
            Err(err) => return Err(Terminate {
                code: Http2ErrorCode::CompressionError,
                message: format!("HPACK decode error: {err}"),
            }),
        };

        let mut http_method = None;
        let mut path = None;
        let mut authority = self.peer.to_string();
        let mut headers = HeaderList::new();
        for (name, value) in fields {
            match name.as_str() {
                ":method" => http_method = Some(value),
                ":path" => path = Some(value),
                ":authority" => authority = value,
                ":scheme" => {}
                other => headers.push(other.to_string(), value),
            }
        }

        if !validate_http_method(http_method.as_deref()) {
            // Not a gRPC error at all yet: no trailers, just refuse the stream.
            let _ = self
                .shared
                .write_tx
                .send(WriteCommand::RstStream {
                    stream_id,
                    error_code: Http2ErrorCode::RefusedStream,
                })
                .await;
            return Ok(());
        }
        let Some(path) = path else {
            let _ = self
                .shared
                .write_tx
                .send(WriteCommand::RstStream {
                    stream_id,
                    error_code: Http2ErrorCode::RefusedStream,
                })
                .await;
            return Ok(());
        };
        if let Err(status) = validate_content_type(headers.get("content-type")) {
            self.finalize_without_body(stream_id, status, "application/grpc".to_string()).await;
            return Ok(());
        }
        // Mirror the request's content-type variant in the response.
        let content_type = headers.get("content-type").unwrap_or("application/grpc").to_string();
        if !has_trailers_te(&headers) {
            debug_warn!("request for {path} on stream {stream_id} is missing 'te: trailers'");
        }

        if self.draining {
            let _ = self
                .shared
                .write_tx
                .send(WriteCommand::RstStream {
                    stream_id,
                    error_code: Http2ErrorCode::RefusedStream,
                })
                .await;
            return Ok(());
        }

        {
            let mut state = self.shared.state.lock().unwrap();
            if state.streams.len() as u32 >= self.config.max_concurrent_streams {
                drop(state);
                let _ = self
                    .shared
                    .write_tx
                    .send(WriteCommand::RstStream {
                        stream_id,
                        error_code: Http2ErrorCode::RefusedStream,
                    })
                    .await;
                return Ok(());
            }
            let mut stream = Stream::new(stream_id, self.config.initial_window_size);
            if let Err(err) = stream.apply(StreamEvent::RecvHeaders { end_stream }) {
                drop(state);
                return Err(status_protocol_to_terminate(err));
            }
            stream.request_headers = headers.clone();
            state.streams.insert(stream);
        }

        let parsed_path = match parse_path(&path) {
            Ok(parsed) => parsed,
            Err(status) => {
                self.finalize_without_body(stream_id, status, content_type).await;
                return Ok(());
            }
        };

        let deadline = headers.get("grpc-timeout").and_then(crate::context::parse_grpc_timeout).map(Deadline::from_timeout);
        let request_metadata = extract_request_metadata(&headers);
        let ctx = RequestContext::new(path.clone(), authority, self.peer.clone(), request_metadata, deadline);
        let cancellation = ctx.cancellation_handle();
        if let Some(deadline) = deadline {
            self.deadlines.register(stream_id, deadline.instant(), cancellation.clone());
        }

        let pattern = {
            let registry = self.registry.read().expect("registry lock poisoned");
            registry.lookup(&path).map(|(_, method)| method.pattern())
        };
        let Some(pattern) = pattern else {
            debug_log!("{} {}: no such method ({})", parsed_path.service, parsed_path.method, path);
            self.finalize_without_body(stream_id, Status::unimplemented(format!("Method not found: {path}")), content_type)
                .await;
            return Ok(());
        };

        let request_compression = headers
            .get("grpc-encoding")
            .and_then(GrpcCodec::from_name)
            .unwrap_or(GrpcCodec::Identity);
        let response_compression = if self.config.compression_enabled {
            request_compression
        } else {
            GrpcCodec::Identity
        };

        // Dispatcher-wide admission: gate on `max_concurrent_requests`
        // independent of the per-connection stream count.
        let Some(permit) = self.dispatcher.try_admit() else {
            self.finalize_without_body(
                stream_id,
                Status::unavailable("server is handling too many concurrent requests"),
                content_type,
            )
            .await;
            return Ok(());
        };

        let entry = match pattern {
            MethodPattern::Unary | MethodPattern::ServerStreaming => InboundEntry {
                cancellation,
                kind: InboundKind::Buffered {
                    ctx,
                    path,
                    pattern,
                    reassembler: MessageReassembler::new(self.config.max_message_size),
                    compression: request_compression,
                    response_compression,
                    content_type,
                    permit,
                },
            },
            MethodPattern::ClientStreaming | MethodPattern::BidiStreaming => {
                let message_tx = self.spawn_streaming_dispatch(
                    stream_id,
                    ctx,
                    path,
                    pattern,
                    response_compression,
                    cancellation.clone(),
                    content_type,
                    permit,
                );
                InboundEntry {
                    cancellation,
                    kind: InboundKind::Streaming {
                        message_tx,
                        reassembler: MessageReassembler::new(self.config.max_message_size),
                        compression: request_compression,
                    },
                }
            }
        };
        self.inbound.insert(stream_id, entry);

        if end_stream {
            self.finish_stream_body(stream_id).await;
        }
        Ok(())
    }

    async fn handle_data_frame(
        &mut self,
        stream_id: u32,
        end_stream: bool,
        flow_control_len: usize,
        payload: Bytes,
    ) -> Result<(), Terminate> {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.flow.conn_recv.consume_recv(flow_control_len as u32);
            match state.streams.get_mut(stream_id) {
                Some(stream) => {
                    stream.recv_window.consume_recv(flow_control_len as u32);
                    if let Err(err) = stream.apply(StreamEvent::RecvData { end_stream }) {
                        drop(state);
                        self.inbound.remove(&stream_id);
                        self.deadlines.remove(stream_id);
                        let _ = self
                            .shared
                            .write_tx
                            .send(WriteCommand::RstStream {
                                stream_id,
                                error_code: Http2ErrorCode::StreamClosed,
                            })
                            .await;
                        let _ = err;
                        return Ok(());
                    }
                }
                None => return Ok(()),
            }

            if state.flow.conn_recv.should_emit_window_update() {
                let increment = state.flow.conn_recv.take_window_update();
                drop(state);
                let _ = self.shared.write_tx.send(WriteCommand::WindowUpdate { stream_id: 0, increment }).await;
            } else {
                let mut state = self.shared.state.lock().unwrap();
                let stream_increment = state
                    .streams
                    .get_mut(stream_id)
                    .filter(|stream| stream.recv_window.should_emit_window_update())
                    .map(|stream| stream.recv_window.take_window_update());
                drop(state);
                if let Some(increment) = stream_increment {
                    let _ = self.shared.write_tx.send(WriteCommand::WindowUpdate { stream_id, increment }).await;
                }
            }
        }

        match self.inbound.get_mut(&stream_id) {
            Some(entry) => match &mut entry.kind {
                InboundKind::Buffered { reassembler, .. } => reassembler.feed(&payload),
                InboundKind::Streaming {
                    message_tx,
                    reassembler,
                    compression,
                } => {
                    reassembler.feed(&payload);
                    loop {
                        match reassembler.try_take() {
                            Ok(Some(message)) => {
                                let decoded = if message.compressed {
                                    compression.decompress(&message.payload)
                                } else {
                                    Ok(message.payload)
                                };
                                match decoded {
                                    Ok(bytes) => {
                                        if message_tx.send(bytes).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(_) => break,
                                }
                            }
                            Ok(None) => break,
                            Err(_) => break,
                        }
                    }
                }
                InboundKind::Rejected => {}
            },
            None => {}
        }

        if end_stream {
            self.finish_stream_body(stream_id).await;
        }
        Ok(())
    }

    /// Called once the request's `end_stream` has been observed: take the
    /// buffered message and start dispatch (Unary/ServerStreaming), or just
    /// close the streaming sender to signal clean end-of-input.
    async fn finish_stream_body(&mut self, stream_id: u32) {
        self.deadlines.remove(stream_id);
        let Some(entry) = self.inbound.remove(&stream_id) else { return };
        match entry.kind {
            InboundKind::Buffered {
                ctx,
                path,
                pattern,
                mut reassembler,
                compression,
                response_compression,
                content_type,
                permit,
            } => {
                let message = match reassembler.try_take() {
                    Ok(Some(message)) => message,
                    Ok(None) => {
                        self.finalize_without_body(
                            stream_id,
                            Status::invalid_argument("request ended with no complete message"),
                            content_type,
                        )
                        .await;
                        return;
                    }
                    Err(status) => {
                        self.finalize_without_body(stream_id, status, content_type).await;
                        return;
                    }
                };
                let payload = if message.compressed {
                    match compression.decompress(&message.payload) {
                        Ok(payload) => payload,
                        Err(status) => {
                            self.finalize_without_body(stream_id, status, content_type).await;
                            return;
                        }
                    }
                } else {
                    message.payload
                };

                match pattern {
                    MethodPattern::Unary => {
                        let dispatcher = Arc::clone(&self.dispatcher);
                        let shared = Arc::clone(&self.shared);
                        tokio::spawn(async move {
                            let _permit = permit;
                            let outcome = dispatcher.dispatch_unary(ctx, &path, &[], payload).await;
                            if let DispatchOutcome::Unary { response, status } = outcome {
                                let headers = ResponseHeaders::new(content_type);
                                send_unary_response(&shared, stream_id, &headers, response, status, response_compression).await;
                            }
                        });
                    }
                    MethodPattern::ServerStreaming => {
                        let dispatcher = Arc::clone(&self.dispatcher);
                        let shared = Arc::clone(&self.shared);
                        let headers = ResponseHeaders::new(content_type);
                        let capacity = self.config.max_queued_requests.max(1);
                        let (resp_tx, resp_rx) = adapters::channel::<Bytes>(capacity, ctx.cancellation_handle());
                        let forwarder_shared = Arc::clone(&shared);
                        let forwarder_headers = Arc::clone(&headers);
                        tokio::spawn(forward_streaming_response(forwarder_shared, stream_id, resp_rx, forwarder_headers, response_compression));
                        tokio::spawn(async move {
                            let _permit = permit;
                            let outcome = dispatcher.dispatch_server_streaming(ctx, &path, &[], payload, resp_tx).await;
                            if let DispatchOutcome::ServerStreaming { status } = outcome {
                                send_trailers(&shared.write_tx, stream_id, &headers, status).await;
                            }
                        });
                    }
                    MethodPattern::ClientStreaming | MethodPattern::BidiStreaming => unreachable!(
                        "client/bidi streaming methods dispatch at headers-complete time, never buffered"
                    ),
                }
            }
            InboundKind::Streaming { message_tx, .. } => drop(message_tx),
            InboundKind::Rejected => {}
        }
    }

    /// A request was already answered before its body needed inspecting
    /// (bad path, unknown method, decode failure): emit a trailers-only
    /// response and mark the stream rejected so further DATA is ignored.
    async fn finalize_without_body(&mut self, stream_id: u32, status: Status, content_type: String) {
        let headers = ResponseHeaders::new(content_type);
        send_trailers(&self.shared.write_tx, stream_id, &headers, status).await;
        apply_send_event(&self.shared, stream_id, StreamEvent::SendHeaders { end_stream: true });
        if let Some(entry) = self.inbound.get_mut(&stream_id) {
            entry.kind = InboundKind::Rejected;
        }
    }

    /// Start a client-streaming or bidi-streaming handler immediately,
    /// since requests of this shape need to begin consuming the inbound
    /// message stream before `end_stream` arrives.
    fn spawn_streaming_dispatch(
        &self,
        stream_id: u32,
        ctx: RequestContext,
        path: String,
        pattern: MethodPattern,
        response_compression: GrpcCodec,
        cancellation: CancellationHandle,
        content_type: String,
        permit: tokio::sync::OwnedSemaphorePermit,
    ) -> adapters::Sender<Bytes> {
        let capacity = self.config.max_queued_requests.max(1);
        let (message_tx, message_rx) = adapters::channel::<Bytes>(capacity, cancellation.clone());
        let dispatcher = Arc::clone(&self.dispatcher);
        let shared = Arc::clone(&self.shared);

        match pattern {
            MethodPattern::ClientStreaming => {
                tokio::spawn(async move {
                    let _permit = permit;
                    let outcome = dispatcher.dispatch_client_streaming(ctx, &path, &[], message_rx).await;
                    if let DispatchOutcome::ClientStreaming { response, status } = outcome {
                        let headers = ResponseHeaders::new(content_type);
                        send_unary_response(&shared, stream_id, &headers, response, status, response_compression).await;
                    }
                });
            }
            MethodPattern::BidiStreaming => {
                let headers = ResponseHeaders::new(content_type);
                let (resp_tx, resp_rx) = adapters::channel::<Bytes>(capacity, cancellation);
                let forwarder_shared = Arc::clone(&shared);
                let forwarder_headers = Arc::clone(&headers);
                tokio::spawn(forward_streaming_response(forwarder_shared, stream_id, resp_rx, forwarder_headers, response_compression));
                tokio::spawn(async move {
                    let _permit = permit;
                    let outcome = dispatcher.dispatch_bidi_streaming(ctx, &path, &[], message_rx, resp_tx).await;
                    if let DispatchOutcome::BidiStreaming { status } = outcome {
                        send_trailers(&shared.write_tx, stream_id, &headers, status).await;
                    }
                });
            }
            MethodPattern::Unary | MethodPattern::ServerStreaming => {
                unreachable!("only client/bidi streaming methods start dispatch eagerly")
            }
        }

        message_tx
    }
}

fn status_protocol_to_terminate(err: crate::error::GrpcRuntimeError) -> Terminate {
    match err {
        crate::error::GrpcRuntimeError::StreamProtocol(code, message) => Terminate { code, message },
        other => Terminate::protocol(other.to_string()),
    }
}

/// Record an outbound HEADERS/DATA send against the stream's own state
/// machine, removing it from the table once it reaches `Closed`. Failures here are bookkeeping-only and never themselves torn down
/// the connection; the frame has already been queued for the wire.
fn apply_send_event(shared: &Shared, stream_id: u32, event: StreamEvent) {
    let mut state = shared.state.lock().unwrap();
    if let Some(stream) = state.streams.get_mut(stream_id) {
        let _ = stream.apply(event);
        if stream.state.is_closed() {
            state.streams.remove(stream_id);
        }
    }
}

/// Tracks whether the response-open HEADERS frame has gone out yet, and the
/// `content-type` variant it must carry when it does — mirroring the
/// request's own variant.
struct ResponseHeaders {
    sent: AtomicBool,
    content_type: String,
}

impl ResponseHeaders {
    fn new(content_type: String) -> Arc<Self> {
        Arc::new(Self {
            sent: AtomicBool::new(false),
            content_type,
        })
    }
}

fn response_open_headers(content_type: &str) -> Vec<(String, String)> {
    vec![
        (":status".to_string(), "200".to_string()),
        ("content-type".to_string(), content_type.to_string()),
    ]
}

fn status_trailers(status: &Status) -> Vec<(String, String)> {
    let mut trailers = vec![("grpc-status".to_string(), (status.code() as u32).to_string())];
    if !status.message().is_empty() {
        trailers.push(("grpc-message".to_string(), Status::encode_message(status.message())));
    }
    if let Some(details) = status.details() {
        use base64::engine::general_purpose::STANDARD_NO_PAD;
        use base64::Engine;
        trailers.push(("grpc-status-details-bin".to_string(), STANDARD_NO_PAD.encode(details)));
    }
    trailers
}

/// Send the one HEADERS frame a streaming response needs before its first
/// DATA frame, if it hasn't gone out yet.
async fn ensure_headers_sent(shared: &Shared, stream_id: u32, headers: &ResponseHeaders) {
    if !headers.sent.swap(true, Ordering::AcqRel) {
        let _ = shared
            .write_tx
            .send(WriteCommand::Headers {
                stream_id,
                end_stream: false,
                headers: response_open_headers(&headers.content_type),
            })
            .await;
        apply_send_event(shared, stream_id, StreamEvent::SendHeaders { end_stream: false });
    }
}

/// Send trailers, combining them with the response-open headers into a
/// single trailers-only HEADERS frame if no headers went out yet.
async fn send_trailers(write_tx: &mpsc::Sender<WriteCommand>, stream_id: u32, headers: &Arc<ResponseHeaders>, status: Status) {
    let trailers = status_trailers(&status);
    let already_sent = headers.sent.swap(true, Ordering::AcqRel);
    let out = if already_sent {
        trailers
    } else {
        let mut combined = response_open_headers(&headers.content_type);
        combined.extend(trailers);
        combined
    };
    let _ = write_tx
        .send(WriteCommand::Headers {
            stream_id,
            end_stream: true,
            headers: out,
        })
        .await;
}

async fn send_unary_response(
    shared: &Arc<Shared>,
    stream_id: u32,
    headers: &Arc<ResponseHeaders>,
    response: Bytes,
    status: Status,
    response_compression: GrpcCodec,
) {
    if status.is_ok() {
        ensure_headers_sent(shared, stream_id, headers).await;
        let compressed = !matches!(response_compression, GrpcCodec::Identity);
        let payload = if compressed {
            response_compression.compress(&response)
        } else {
            response
        };
        let mut framed = BytesMut::new();
        encode_message(&payload, compressed, &mut framed);
        send_data_flow_controlled(shared, stream_id, framed.freeze()).await;
    }
    send_trailers(&shared.write_tx, stream_id, headers, status).await;
    apply_send_event(shared, stream_id, StreamEvent::SendHeaders { end_stream: true });
}

/// Forwards a server-streaming or bidi-streaming handler's outgoing
/// messages onto the wire, chunked and gated by flow control. Exits on the
/// first clean end-of-stream or cancellation.
async fn forward_streaming_response(
    shared: Arc<Shared>,
    stream_id: u32,
    mut receiver: Receiver<Bytes>,
    headers: Arc<ResponseHeaders>,
    response_compression: GrpcCodec,
) {
    loop {
        match receiver.next().await {
            Ok(Some(message)) => {
                ensure_headers_sent(&shared, stream_id, &headers).await;
                let compressed = !matches!(response_compression, GrpcCodec::Identity);
                let payload = if compressed {
                    response_compression.compress(&message)
                } else {
                    message
                };
                let mut framed = BytesMut::new();
                encode_message(&payload, compressed, &mut framed);
                send_data_flow_controlled(&shared, stream_id, framed.freeze()).await;
            }
            Ok(None) => break,
            Err(_) => break,
        }
    }
}

/// Send `payload` as one or more DATA frames, splitting on the connection
/// window, the stream's own window, and the peer's SETTINGS_MAX_FRAME_SIZE
///, waiting on `write_notify` whenever the
/// budget is momentarily exhausted.
async fn send_data_flow_controlled(shared: &Arc<Shared>, stream_id: u32, mut payload: Bytes) {
    while !payload.is_empty() {
        let sendable = {
            let mut state = shared.state.lock().unwrap();
            let max_frame = shared.remote_max_frame_size.load(Ordering::Acquire);
            let stream_available = state.streams.get(stream_id).map(|s| s.send_window.available()).unwrap_or(0);
            let n = state.flow.sendable_now(payload.len() as u32, stream_available, max_frame);
            if n > 0 {
                state.flow.conn_send.consume_send(n);
                if let Some(stream) = state.streams.get_mut(stream_id) {
                    stream.send_window.consume_send(n);
                }
            }
            n
        };
        if sendable == 0 {
            shared.write_notify.notified().await;
            if shared.state.lock().unwrap().streams.get(stream_id).is_none() {
                return;
            }
            continue;
        }
        let chunk = payload.split_to(sendable as usize);
        apply_send_event(shared, stream_id, StreamEvent::SendData { end_stream: false });
        if shared
            .write_tx
            .send(WriteCommand::Data {
                stream_id,
                end_stream: false,
                payload: chunk,
            })
            .await
            .is_err()
        {
            return;
        }
    }
}
