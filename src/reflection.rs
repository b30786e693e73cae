//! Server reflection service.
//!
//! Grounded on `grpc.reflection.v1alpha.ServerReflection`: one bidi-streaming
//! method over the service registry's `file_descriptor_protos`. Unlike `Health`, unknown requests yield an error
//! *response*, not a stream-level status.

use std::sync::{Arc, RwLock};

use bytes::Bytes;

use crate::adapters::{Receiver, Sender};
use crate::context::RequestContext;
use crate::registry::{ServiceBuilder, ServiceDescriptor, ServiceRegistry};
use crate::status::{Code, Status};

#[derive(Debug, Clone)]
pub enum ReflectionRequestKind {
    ListServices,
    FileContainingSymbol(String),
    FileByFilename(String),
}

#[derive(Debug, Clone)]
pub struct ServerReflectionRequest {
    pub kind: ReflectionRequestKind,
}

#[derive(Debug, Clone)]
pub enum ServerReflectionResponse {
    ListServicesResponse(Vec<String>),
    FileDescriptorResponse(Vec<Bytes>),
    ErrorResponse { code: i32, message: String },
}

/// Serves `ServerReflectionInfo` against a live [`ServiceRegistry`]. Reads
/// the registry at call time, so it naturally reflects whatever was frozen
/// in at server start.
pub struct ReflectionService {
    registry: Arc<RwLock<ServiceRegistry>>,
}

impl ReflectionService {
    pub fn new(registry: Arc<RwLock<ServiceRegistry>>) -> Self {
        Self { registry }
    }

    fn handle(&self, request: ServerReflectionRequest) -> ServerReflectionResponse {
        let registry = self.registry.read().expect("registry lock poisoned");
        match request.kind {
            ReflectionRequestKind::ListServices => {
                ServerReflectionResponse::ListServicesResponse(registry.service_names().map(str::to_string).collect())
            }
            ReflectionRequestKind::FileContainingSymbol(symbol) => {
                let service_name = symbol.rsplit_once('.').map(|(service, _)| service).unwrap_or(&symbol);
                match registry.service(service_name) {
                    Some(service) if !service.file_descriptor_protos.is_empty() => {
                        ServerReflectionResponse::FileDescriptorResponse(service.file_descriptor_protos.clone())
                    }
                    _ => ServerReflectionResponse::ErrorResponse {
                        code: Code::NotFound as i32,
                        message: format!("symbol not found: {symbol}"),
                    },
                }
            }
            ReflectionRequestKind::FileByFilename(filename) => {
                // Service descriptors don't carry their source filename separately
                // from their proto bytes in this runtime; match against any service whose stored file
                // descriptor set is non-empty and whose fully-qualified name
                // matches the requested filename's stem, which is how single-file
                // services are typically named.
                for name in registry.service_names() {
                    if let Some(service) = registry.service(name) {
                        if !service.file_descriptor_protos.is_empty() && filename.contains(name) {
                            return ServerReflectionResponse::FileDescriptorResponse(
                                service.file_descriptor_protos.clone(),
                            );
                        }
                    }
                }
                ServerReflectionResponse::ErrorResponse {
                    code: Code::NotFound as i32,
                    message: format!("file not found: {filename}"),
                }
            }
        }
    }

    async fn serve(
        &self,
        mut receiver: Receiver<ServerReflectionRequest>,
        sender: Sender<ServerReflectionResponse>,
    ) -> Status {
        loop {
            match receiver.next().await {
                Ok(Some(request)) => {
                    let response = self.handle(request);
                    if sender.send(response).await.is_err() {
                        return Status::ok();
                    }
                }
                Ok(None) => return Status::ok(),
                Err(_) => return Status::cancelled("reflection stream was cancelled"),
            }
        }
    }

    /// Build the `grpc.reflection.v1alpha.ServerReflection` service
    /// descriptor for registration.
    pub fn build_service(self: &Arc<Self>) -> ServiceDescriptor {
        let this = Arc::clone(self);
        ServiceBuilder::new("grpc.reflection.v1alpha.ServerReflection")
            .bidi_streaming(
                "ServerReflectionInfo",
                "grpc.reflection.v1alpha.ServerReflectionRequest",
                "grpc.reflection.v1alpha.ServerReflectionResponse",
                move |_ctx: RequestContext,
                      receiver: Receiver<ServerReflectionRequest>,
                      sender: Sender<ServerReflectionResponse>| {
                    let this = Arc::clone(&this);
                    async move { this.serve(receiver, sender).await }
                },
            )
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ServiceBuilder as SB;

    fn registry_with_greeter() -> Arc<RwLock<ServiceRegistry>> {
        let mut registry = ServiceRegistry::new();
        let service = SB::new("test.Greeter")
            .with_file_descriptor_proto(Bytes::from_static(b"fake-descriptor-bytes"))
            .unary("Hello", "test.Req", "test.Resp", |_ctx, req: Bytes| async move {
                (req, Status::ok())
            })
            .build();
        registry.register(service).unwrap();
        Arc::new(RwLock::new(registry))
    }

    #[test]
    fn list_services_reports_registered_names() {
        let reflection = ReflectionService::new(registry_with_greeter());
        let response = reflection.handle(ServerReflectionRequest {
            kind: ReflectionRequestKind::ListServices,
        });
        match response {
            ServerReflectionResponse::ListServicesResponse(names) => {
                assert_eq!(names, vec!["test.Greeter".to_string()]);
            }
            _ => panic!("expected ListServicesResponse"),
        }
    }

    #[test]
    fn file_containing_symbol_finds_owning_service() {
        let reflection = ReflectionService::new(registry_with_greeter());
        let response = reflection.handle(ServerReflectionRequest {
            kind: ReflectionRequestKind::FileContainingSymbol("test.Greeter.Hello".into()),
        });
        match response {
            ServerReflectionResponse::FileDescriptorResponse(blobs) => {
                assert_eq!(blobs, vec![Bytes::from_static(b"fake-descriptor-bytes")]);
            }
            _ => panic!("expected FileDescriptorResponse"),
        }
    }

    #[test]
    fn unknown_symbol_yields_error_response_not_panic() {
        let reflection = ReflectionService::new(registry_with_greeter());
        let response = reflection.handle(ServerReflectionRequest {
            kind: ReflectionRequestKind::FileContainingSymbol("test.Unknown.Method".into()),
        });
        assert!(matches!(response, ServerReflectionResponse::ErrorResponse { .. }));
    }

    #[tokio::test]
    async fn serve_echoes_list_services_over_the_stream() {
        let reflection = Arc::new(ReflectionService::new(registry_with_greeter()));
        let cancellation = {
            let ctx = RequestContext::new(
                "/grpc.reflection.v1alpha.ServerReflection/ServerReflectionInfo".into(),
                "localhost".into(),
                crate::context::PeerInfo {
                    address: "127.0.0.1".parse().unwrap(),
                    port: 1234,
                    certificate: None,
                },
                crate::stream::HeaderList::new(),
                None,
            );
            ctx.cancellation_handle()
        };
        let (req_tx, req_rx) = crate::adapters::channel::<ServerReflectionRequest>(4, cancellation.clone());
        let (resp_tx, mut resp_rx) = crate::adapters::channel::<ServerReflectionResponse>(4, cancellation);

        req_tx
            .send(ServerReflectionRequest {
                kind: ReflectionRequestKind::ListServices,
            })
            .await
            .unwrap();
        drop(req_tx);

        let handle = tokio::spawn(async move { reflection.serve(req_rx, resp_tx).await });
        let response = resp_rx.next().await.unwrap().unwrap();
        assert!(matches!(response, ServerReflectionResponse::ListServicesResponse(_)));
        assert!(handle.await.unwrap().is_ok());
    }
}
