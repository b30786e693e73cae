//! Request dispatcher: path lookup, pattern verification,
//! interceptor chain invocation, payload decode/encode via the external
//! codec collaborator.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::adapters::{Receiver, Sender};
use crate::codec::{BoxMessage, MessageCodec};
use crate::context::RequestContext;
use crate::interceptor::{compose, Interceptor, MethodInfo};
use crate::registry::{Handler, MethodPattern, ServiceRegistry};
use crate::status::Status;

pub struct Dispatcher {
    registry: Arc<std::sync::RwLock<ServiceRegistry>>,
    codec: Arc<dyn MessageCodec>,
    global_interceptors: Vec<Arc<dyn Interceptor>>,
    /// Caps the number of RPCs dispatched at once, independent of the
    /// per-connection `max_concurrent_streams` bound. Acquired before a
    /// handler task is spawned, released when that task finishes.
    admission: Arc<Semaphore>,
}

/// What a dispatched unary call needs and produces; streaming variants are
/// modeled similarly but take/return channel endpoints instead.
pub enum DispatchOutcome {
    Unary { response: Bytes, status: Status },
    ServerStreaming { status: Status },
    ClientStreaming { response: Bytes, status: Status },
    BidiStreaming { status: Status },
}

impl Dispatcher {
    pub fn new(
        registry: Arc<std::sync::RwLock<ServiceRegistry>>,
        codec: Arc<dyn MessageCodec>,
        global_interceptors: Vec<Arc<dyn Interceptor>>,
        max_concurrent_requests: usize,
    ) -> Self {
        Self {
            registry,
            codec,
            global_interceptors,
            admission: Arc::new(Semaphore::new(max_concurrent_requests)),
        }
    }

    /// Try to admit one more in-flight RPC without blocking. Returns `None`
    /// when `max_concurrent_requests` are already in flight; the caller
    /// should fail the RPC with `UNAVAILABLE` rather than spawn a handler.
    pub fn try_admit(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.admission).try_acquire_owned().ok()
    }

    fn lookup(&self, path: &str) -> Result<(String, crate::registry::MethodDescriptor), Status> {
        let registry = self.registry.read().expect("registry lock poisoned");
        let (service, method) = registry
            .lookup(path)
            .ok_or_else(|| Status::unimplemented(format!("Method not found: {path}")))?;
        Ok((service.fully_qualified_name.clone(), method.clone()))
    }

    /// Dispatch a unary RPC.
    pub async fn dispatch_unary(
        &self,
        ctx: RequestContext,
        path: &str,
        service_interceptors: &[Arc<dyn Interceptor>],
        request_bytes: Bytes,
    ) -> DispatchOutcome {
        let (service_name, method) = match self.lookup(path) {
            Ok(v) => v,
            Err(status) => return DispatchOutcome::Unary { response: Bytes::new(), status },
        };
        let Handler::Unary(handler) = method.handler.clone() else {
            return DispatchOutcome::Unary {
                response: Bytes::new(),
                status: Status::unimplemented(format!("method is not {}", MethodPattern::Unary)),
            };
        };

        let codec = Arc::clone(&self.codec);
        let input_type = method.input_type_name.clone();
        let output_type = method.output_type_name.clone();
        let response_slot: Arc<std::sync::Mutex<Option<Bytes>>> = Arc::new(std::sync::Mutex::new(None));
        let response_slot_for_handler = Arc::clone(&response_slot);

        let info = MethodInfo {
            service_name,
            method_name: method.name.clone(),
            pattern: MethodPattern::Unary,
        };

        let wrapped: Arc<dyn Fn(RequestContext) -> crate::registry::BoxFuture<'static, Status> + Send + Sync> =
            Arc::new(move |ctx| {
                let handler = Arc::clone(&handler);
                let codec = Arc::clone(&codec);
                let input_type = input_type.clone();
                let output_type = output_type.clone();
                let request_bytes = request_bytes.clone();
                let response_slot = Arc::clone(&response_slot_for_handler);
                Box::pin(async move {
                    let decoded: BoxMessage = match codec.decode(&input_type, &request_bytes) {
                        Ok(msg) => msg,
                        Err(status) => return status,
                    };
                    let (response, status) = handler(ctx, decoded).await;
                    if status.is_ok() {
                        match codec.encode(&output_type, response.as_ref()) {
                            Ok(bytes) => *response_slot.lock().unwrap() = Some(bytes),
                            Err(status) => return status,
                        }
                    }
                    status
                })
            });

        let chain = compose_with_globals(&self.global_interceptors, service_interceptors, info, wrapped);
        let status = chain(ctx).await;
        let response = response_slot.lock().unwrap().take().unwrap_or_default();
        DispatchOutcome::Unary { response, status }
    }

    /// Dispatch a server-streaming RPC.
    pub async fn dispatch_server_streaming(
        &self,
        ctx: RequestContext,
        path: &str,
        service_interceptors: &[Arc<dyn Interceptor>],
        request_bytes: Bytes,
        sender: Sender<Bytes>,
    ) -> DispatchOutcome {
        let (service_name, method) = match self.lookup(path) {
            Ok(v) => v,
            Err(status) => return DispatchOutcome::ServerStreaming { status },
        };
        let Handler::ServerStreaming(handler) = method.handler.clone() else {
            return DispatchOutcome::ServerStreaming {
                status: Status::unimplemented(format!("method is not {}", MethodPattern::ServerStreaming)),
            };
        };

        let codec = Arc::clone(&self.codec);
        let input_type = method.input_type_name.clone();
        let output_type = method.output_type_name.clone();
        let info = MethodInfo {
            service_name,
            method_name: method.name.clone(),
            pattern: MethodPattern::ServerStreaming,
        };

        let wrapped: Arc<dyn Fn(RequestContext) -> crate::registry::BoxFuture<'static, Status> + Send + Sync> =
            Arc::new(move |ctx| {
                let handler = Arc::clone(&handler);
                let codec = Arc::clone(&codec);
                let input_type = input_type.clone();
                let output_type = output_type.clone();
                let request_bytes = request_bytes.clone();
                let sender = clone_erased_sender(&sender, Arc::clone(&codec), output_type.clone());
                Box::pin(async move {
                    let decoded: BoxMessage = match codec.decode(&input_type, &request_bytes) {
                        Ok(msg) => msg,
                        Err(status) => return status,
                    };
                    handler(ctx, decoded, sender).await
                })
            });

        let chain = compose_with_globals(&self.global_interceptors, service_interceptors, info, wrapped);
        let status = chain(ctx).await;
        DispatchOutcome::ServerStreaming { status }
    }

    /// Dispatch a client-streaming RPC.
    pub async fn dispatch_client_streaming(
        &self,
        ctx: RequestContext,
        path: &str,
        service_interceptors: &[Arc<dyn Interceptor>],
        receiver: Receiver<Bytes>,
    ) -> DispatchOutcome {
        let (service_name, method) = match self.lookup(path) {
            Ok(v) => v,
            Err(status) => {
                return DispatchOutcome::ClientStreaming {
                    response: Bytes::new(),
                    status,
                }
            }
        };
        let Handler::ClientStreaming(handler) = method.handler.clone() else {
            return DispatchOutcome::ClientStreaming {
                response: Bytes::new(),
                status: Status::unimplemented(format!("method is not {}", MethodPattern::ClientStreaming)),
            };
        };

        let codec = Arc::clone(&self.codec);
        let input_type = method.input_type_name.clone();
        let output_type = method.output_type_name.clone();
        let info = MethodInfo {
            service_name,
            method_name: method.name.clone(),
            pattern: MethodPattern::ClientStreaming,
        };
        let response_slot: Arc<std::sync::Mutex<Option<Bytes>>> = Arc::new(std::sync::Mutex::new(None));
        let response_slot_for_handler = Arc::clone(&response_slot);
        let receiver = std::sync::Mutex::new(Some(receiver));

        let wrapped: Arc<dyn Fn(RequestContext) -> crate::registry::BoxFuture<'static, Status> + Send + Sync> =
            Arc::new(move |ctx| {
                let handler = Arc::clone(&handler);
                let codec = Arc::clone(&codec);
                let output_type = output_type.clone();
                let input_type = input_type.clone();
                let receiver = receiver.lock().unwrap().take().expect("client stream dispatched twice");
                let erased_receiver = decode_erased_receiver(receiver, Arc::clone(&codec), input_type);
                let response_slot = Arc::clone(&response_slot_for_handler);
                Box::pin(async move {
                    let (response, status) = handler(ctx, erased_receiver).await;
                    if status.is_ok() {
                        match codec.encode(&output_type, response.as_ref()) {
                            Ok(bytes) => *response_slot.lock().unwrap() = Some(bytes),
                            Err(status) => return status,
                        }
                    }
                    status
                })
            });

        let chain = compose_with_globals(&self.global_interceptors, service_interceptors, info, wrapped);
        let status = chain(ctx).await;
        let response = response_slot.lock().unwrap().take().unwrap_or_default();
        DispatchOutcome::ClientStreaming { response, status }
    }

    /// Dispatch a bidi-streaming RPC.
    pub async fn dispatch_bidi_streaming(
        &self,
        ctx: RequestContext,
        path: &str,
        service_interceptors: &[Arc<dyn Interceptor>],
        receiver: Receiver<Bytes>,
        sender: Sender<Bytes>,
    ) -> DispatchOutcome {
        let (service_name, method) = match self.lookup(path) {
            Ok(v) => v,
            Err(status) => return DispatchOutcome::BidiStreaming { status },
        };
        let Handler::BidiStreaming(handler) = method.handler.clone() else {
            return DispatchOutcome::BidiStreaming {
                status: Status::unimplemented(format!("method is not {}", MethodPattern::BidiStreaming)),
            };
        };

        let codec = Arc::clone(&self.codec);
        let input_type = method.input_type_name.clone();
        let output_type = method.output_type_name.clone();
        let info = MethodInfo {
            service_name,
            method_name: method.name.clone(),
            pattern: MethodPattern::BidiStreaming,
        };
        let receiver = std::sync::Mutex::new(Some(receiver));

        let wrapped: Arc<dyn Fn(RequestContext) -> crate::registry::BoxFuture<'static, Status> + Send + Sync> =
            Arc::new(move |ctx| {
                let handler = Arc::clone(&handler);
                let codec = Arc::clone(&codec);
                let input_type = input_type.clone();
                let output_type = output_type.clone();
                let receiver = receiver.lock().unwrap().take().expect("bidi stream dispatched twice");
                let erased_receiver = decode_erased_receiver(receiver, Arc::clone(&codec), input_type);
                let erased_sender = clone_erased_sender(&sender, Arc::clone(&codec), output_type);
                Box::pin(async move { handler(ctx, erased_receiver, erased_sender).await })
            });

        let chain = compose_with_globals(&self.global_interceptors, service_interceptors, info, wrapped);
        let status = chain(ctx).await;
        DispatchOutcome::BidiStreaming { status }
    }
}

/// Bridge a wire-facing `Receiver<Bytes>` into the `Receiver<BoxMessage>` the
/// erased handler expects, decoding each incoming message through the codec.
/// A decode failure ends the erased stream early rather than propagating a
/// per-message error.
fn decode_erased_receiver(
    mut receiver: Receiver<Bytes>,
    codec: Arc<dyn MessageCodec>,
    input_type: String,
) -> Receiver<BoxMessage> {
    let cancellation = receiver.cancellation();
    let (erased_tx, erased_rx) = tokio::sync::mpsc::channel::<BoxMessage>(1);
    tokio::spawn(async move {
        loop {
            match receiver.next().await {
                Ok(Some(bytes)) => match codec.decode(&input_type, &bytes) {
                    Ok(decoded) => {
                        if erased_tx.send(decoded).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                },
                _ => break,
            }
        }
    });
    Receiver::new(erased_rx, cancellation)
}

/// Bridge a `Sender<Bytes>` (wire-facing) into the `Sender<BoxMessage>` the
/// erased handler expects, encoding each outgoing message through the codec.
fn clone_erased_sender(
    sender: &Sender<Bytes>,
    codec: Arc<dyn MessageCodec>,
    output_type: String,
) -> Sender<BoxMessage> {
    let cancellation = sender.cancellation();
    let (erased_tx, mut erased_rx) = tokio::sync::mpsc::channel::<BoxMessage>(1);
    let wire_tx = sender.clone();
    tokio::spawn(async move {
        while let Some(message) = erased_rx.recv().await {
            let encoded = match codec.encode(&output_type, message.as_ref()) {
                Ok(bytes) => bytes,
                Err(_) => break,
            };
            if wire_tx.send(encoded).await.is_err() {
                break;
            }
        }
    });
    Sender::new(erased_tx, cancellation)
}

fn compose_with_globals(
    global_interceptors: &[Arc<dyn Interceptor>],
    service_interceptors: &[Arc<dyn Interceptor>],
    info: MethodInfo,
    handler: Arc<dyn Fn(RequestContext) -> crate::registry::BoxFuture<'static, Status> + Send + Sync>,
) -> crate::interceptor::Next {
    // Service-specific interceptors are applied innermost, global outermost
    //: compose service interceptors first around the
    // handler, then wrap that chain with the global ones.
    let inner = compose(service_interceptors, info.clone(), handler);
    compose(global_interceptors, info, Arc::new(move |ctx| inner(ctx)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::PeerInfo;
    use crate::registry::ServiceBuilder;
    use crate::stream::HeaderList;
    use std::any::Any;

    struct BytesCodec;
    impl MessageCodec for BytesCodec {
        fn decode(&self, _type_name: &str, bytes: &[u8]) -> Result<BoxMessage, Status> {
            Ok(Box::new(Bytes::copy_from_slice(bytes)))
        }
        fn encode(&self, _type_name: &str, message: &(dyn Any + Send + Sync)) -> Result<Bytes, Status> {
            message
                .downcast_ref::<Bytes>()
                .cloned()
                .ok_or_else(|| Status::internal("unexpected message type"))
        }
    }

    fn dummy_context(path: &str) -> RequestContext {
        RequestContext::new(
            path.to_string(),
            "localhost".into(),
            PeerInfo {
                address: "127.0.0.1".parse().unwrap(),
                port: 1234,
                certificate: None,
            },
            HeaderList::new(),
            None,
        )
    }

    #[tokio::test]
    async fn unknown_method_is_unimplemented() {
        let registry = Arc::new(std::sync::RwLock::new(ServiceRegistry::new()));
        let dispatcher = Dispatcher::new(registry, Arc::new(BytesCodec), vec![], 1_000);
        let outcome = dispatcher
            .dispatch_unary(
                dummy_context("/test.Unknown/X"),
                "/test.Unknown/X",
                &[],
                Bytes::new(),
            )
            .await;
        match outcome {
            DispatchOutcome::Unary { status, .. } => {
                assert_eq!(status.code(), crate::status::Code::Unimplemented);
                // Seed scenario S2 requires the wire-encoded
                // trailer to read exactly
                // `Method%20not%20found%3A%20%2Ftest.Unknown%2FX`.
                assert_eq!(status.message(), "Method not found: /test.Unknown/X");
                assert_eq!(
                    Status::encode_message(status.message()),
                    "Method%20not%20found%3A%20%2Ftest.Unknown%2FX"
                );
            }
            _ => panic!("expected unary outcome"),
        }
    }

    #[tokio::test]
    async fn unary_echo_round_trip() {
        let mut registry = ServiceRegistry::new();
        let service = ServiceBuilder::new("test.Greeter")
            .unary(
                "Hello",
                "test.HelloRequest",
                "test.HelloResponse",
                |_ctx, req: Bytes| async move { (req, Status::ok()) },
            )
            .build();
        registry.register(service).unwrap();
        let registry = Arc::new(std::sync::RwLock::new(registry));
        let dispatcher = Dispatcher::new(registry, Arc::new(BytesCodec), vec![], 1_000);
        let outcome = dispatcher
            .dispatch_unary(
                dummy_context("/test.Greeter/Hello"),
                "/test.Greeter/Hello",
                &[],
                Bytes::from_static(b"hello"),
            )
            .await;
        match outcome {
            DispatchOutcome::Unary { response, status } => {
                assert!(status.is_ok());
                assert_eq!(&response[..], b"hello");
            }
            _ => panic!("expected unary outcome"),
        }
    }

    #[tokio::test]
    async fn client_streaming_aggregates_into_single_response() {
        let mut registry = ServiceRegistry::new();
        let service = ServiceBuilder::new("test.Uploader")
            .client_streaming(
                "Upload",
                "test.Chunk",
                "test.UploadSummary",
                |_ctx, mut receiver: crate::adapters::Receiver<Bytes>| async move {
                    let mut total = Vec::new();
                    loop {
                        match receiver.next().await {
                            Ok(Some(chunk)) => total.extend_from_slice(&chunk),
                            _ => break,
                        }
                    }
                    (Bytes::from(total), Status::ok())
                },
            )
            .build();
        registry.register(service).unwrap();
        let registry = Arc::new(std::sync::RwLock::new(registry));
        let dispatcher = Dispatcher::new(registry, Arc::new(BytesCodec), vec![], 1_000);

        let (tx, rx) = crate::adapters::channel::<Bytes>(4, test_cancellation());
        tx.send(Bytes::from_static(b"ab")).await.unwrap();
        tx.send(Bytes::from_static(b"cd")).await.unwrap();
        drop(tx);

        let outcome = dispatcher
            .dispatch_client_streaming(dummy_context("/test.Uploader/Upload"), "/test.Uploader/Upload", &[], rx)
            .await;
        match outcome {
            DispatchOutcome::ClientStreaming { response, status } => {
                assert!(status.is_ok());
                assert_eq!(&response[..], b"abcd");
            }
            _ => panic!("expected client-streaming outcome"),
        }
    }

    #[tokio::test]
    async fn bidi_streaming_echoes_each_inbound_message() {
        let mut registry = ServiceRegistry::new();
        let service = ServiceBuilder::new("test.Echoer")
            .bidi_streaming(
                "Echo",
                "test.Chunk",
                "test.Chunk",
                |_ctx,
                 mut receiver: crate::adapters::Receiver<Bytes>,
                 sender: crate::adapters::Sender<Bytes>| async move {
                    loop {
                        match receiver.next().await {
                            Ok(Some(chunk)) => {
                                if sender.send(chunk).await.is_err() {
                                    break;
                                }
                            }
                            _ => break,
                        }
                    }
                    Status::ok()
                },
            )
            .build();
        registry.register(service).unwrap();
        let registry = Arc::new(std::sync::RwLock::new(registry));
        let dispatcher = Dispatcher::new(registry, Arc::new(BytesCodec), vec![], 1_000);

        let cancellation = test_cancellation();
        let (in_tx, in_rx) = crate::adapters::channel::<Bytes>(4, cancellation.clone());
        let (out_tx, mut out_rx) = crate::adapters::channel::<Bytes>(4, cancellation);
        in_tx.send(Bytes::from_static(b"ping")).await.unwrap();
        drop(in_tx);

        let outcome = dispatcher
            .dispatch_bidi_streaming(dummy_context("/test.Echoer/Echo"), "/test.Echoer/Echo", &[], in_rx, out_tx)
            .await;
        match outcome {
            DispatchOutcome::BidiStreaming { status } => assert!(status.is_ok()),
            _ => panic!("expected bidi-streaming outcome"),
        }
        assert_eq!(out_rx.next().await.unwrap(), Some(Bytes::from_static(b"ping")));
    }

    fn test_cancellation() -> crate::context::CancellationHandle {
        dummy_context("/test.Greeter/Hello").cancellation_handle()
    }
}
