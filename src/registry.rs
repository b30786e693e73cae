//! Service/method registry and fluent registration API.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;

use crate::adapters::{Receiver, Sender};
use crate::codec::{BoxMessage, MessageCodec};
use crate::context::RequestContext;
use crate::status::Status;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodPattern {
    Unary,
    ServerStreaming,
    ClientStreaming,
    BidiStreaming,
}

impl std::fmt::Display for MethodPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MethodPattern::Unary => "unary",
            MethodPattern::ServerStreaming => "server-streaming",
            MethodPattern::ClientStreaming => "client-streaming",
            MethodPattern::BidiStreaming => "bidi-streaming",
        };
        f.write_str(name)
    }
}

type UnaryFn = Arc<dyn Fn(RequestContext, BoxMessage) -> BoxFuture<'static, (BoxMessage, Status)> + Send + Sync>;
type ServerStreamingFn =
    Arc<dyn Fn(RequestContext, BoxMessage, Sender<BoxMessage>) -> BoxFuture<'static, Status> + Send + Sync>;
type ClientStreamingFn =
    Arc<dyn Fn(RequestContext, Receiver<BoxMessage>) -> BoxFuture<'static, (BoxMessage, Status)> + Send + Sync>;
type BidiStreamingFn = Arc<
    dyn Fn(RequestContext, Receiver<BoxMessage>, Sender<BoxMessage>) -> BoxFuture<'static, Status> + Send + Sync,
>;

/// A registered handler, type-erased to `BoxMessage` at its boundary so that
/// methods of different request/response types share one registry entry
/// shape.
#[derive(Clone)]
pub enum Handler {
    Unary(UnaryFn),
    ServerStreaming(ServerStreamingFn),
    ClientStreaming(ClientStreamingFn),
    BidiStreaming(BidiStreamingFn),
}

impl Handler {
    pub fn pattern(&self) -> MethodPattern {
        match self {
            Handler::Unary(_) => MethodPattern::Unary,
            Handler::ServerStreaming(_) => MethodPattern::ServerStreaming,
            Handler::ClientStreaming(_) => MethodPattern::ClientStreaming,
            Handler::BidiStreaming(_) => MethodPattern::BidiStreaming,
        }
    }
}

/// `{name, pattern, input_type_name, output_type_name, handler}`. Pattern is immutable after registration.
#[derive(Clone)]
pub struct MethodDescriptor {
    pub name: String,
    pub input_type_name: String,
    pub output_type_name: String,
    pub handler: Handler,
}

impl MethodDescriptor {
    pub fn pattern(&self) -> MethodPattern {
        self.handler.pattern()
    }
}

/// `{fully_qualified_name, mapping method_name -> MethodDescriptor, optional
/// file descriptors for reflection}`.
#[derive(Clone)]
pub struct ServiceDescriptor {
    pub fully_qualified_name: String,
    pub methods: HashMap<String, MethodDescriptor>,
    pub file_descriptor_protos: Vec<Bytes>,
}

/// Builds one `ServiceDescriptor` fluently, mirroring a generated gRPC
/// service-registration surface.
pub struct ServiceBuilder {
    fully_qualified_name: String,
    methods: HashMap<String, MethodDescriptor>,
    file_descriptor_protos: Vec<Bytes>,
}

impl ServiceBuilder {
    pub fn new(fully_qualified_name: impl Into<String>) -> Self {
        Self {
            fully_qualified_name: fully_qualified_name.into(),
            methods: HashMap::new(),
            file_descriptor_protos: Vec::new(),
        }
    }

    pub fn with_file_descriptor_proto(mut self, bytes: Bytes) -> Self {
        self.file_descriptor_protos.push(bytes);
        self
    }

    pub fn unary<Req, Resp, F, Fut>(
        mut self,
        method_name: impl Into<String>,
        input_type_name: impl Into<String>,
        output_type_name: impl Into<String>,
        handler: F,
    ) -> Self
    where
        Req: Send + Sync + 'static,
        Resp: Send + Sync + 'static,
        F: Fn(RequestContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = (Resp, Status)> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: UnaryFn = Arc::new(move |ctx, req| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let req = match req.downcast::<Req>() {
                    Ok(req) => *req,
                    Err(_) => {
                        return (
                            Box::new(()) as BoxMessage,
                            Status::internal("request type mismatch at dispatch"),
                        )
                    }
                };
                let (resp, status) = handler(ctx, req).await;
                (Box::new(resp) as BoxMessage, status)
            })
        });
        self.insert(method_name, input_type_name, output_type_name, Handler::Unary(erased))
    }

    pub fn server_streaming<Req, Resp, F, Fut>(
        mut self,
        method_name: impl Into<String>,
        input_type_name: impl Into<String>,
        output_type_name: impl Into<String>,
        handler: F,
    ) -> Self
    where
        Req: Send + Sync + 'static,
        Resp: Send + Sync + 'static,
        F: Fn(RequestContext, Req, Sender<Resp>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Status> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: ServerStreamingFn = Arc::new(move |ctx, req, sender| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let req = match req.downcast::<Req>() {
                    Ok(req) => *req,
                    Err(_) => return Status::internal("request type mismatch at dispatch"),
                };
                let typed_sender = retype_sender(sender);
                handler(ctx, req, typed_sender).await
            })
        });
        self.insert(
            method_name,
            input_type_name,
            output_type_name,
            Handler::ServerStreaming(erased),
        )
    }

    pub fn client_streaming<Req, Resp, F, Fut>(
        mut self,
        method_name: impl Into<String>,
        input_type_name: impl Into<String>,
        output_type_name: impl Into<String>,
        handler: F,
    ) -> Self
    where
        Req: Send + Sync + 'static,
        Resp: Send + Sync + 'static,
        F: Fn(RequestContext, Receiver<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = (Resp, Status)> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: ClientStreamingFn = Arc::new(move |ctx, receiver| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let typed_receiver = retype_receiver::<Req>(receiver);
                let (resp, status) = handler(ctx, typed_receiver).await;
                (Box::new(resp) as BoxMessage, status)
            })
        });
        self.insert(
            method_name,
            input_type_name,
            output_type_name,
            Handler::ClientStreaming(erased),
        )
    }

    pub fn bidi_streaming<Req, Resp, F, Fut>(
        mut self,
        method_name: impl Into<String>,
        input_type_name: impl Into<String>,
        output_type_name: impl Into<String>,
        handler: F,
    ) -> Self
    where
        Req: Send + Sync + 'static,
        Resp: Send + Sync + 'static,
        F: Fn(RequestContext, Receiver<Req>, Sender<Resp>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Status> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: BidiStreamingFn = Arc::new(move |ctx, receiver, sender| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let typed_receiver = retype_receiver::<Req>(receiver);
                let typed_sender = retype_sender(sender);
                handler(ctx, typed_receiver, typed_sender).await
            })
        });
        self.insert(
            method_name,
            input_type_name,
            output_type_name,
            Handler::BidiStreaming(erased),
        )
    }

    fn insert(
        mut self,
        method_name: impl Into<String>,
        input_type_name: impl Into<String>,
        output_type_name: impl Into<String>,
        handler: Handler,
    ) -> Self {
        let name = method_name.into();
        self.methods.insert(
            name.clone(),
            MethodDescriptor {
                name,
                input_type_name: input_type_name.into(),
                output_type_name: output_type_name.into(),
                handler,
            },
        );
        self
    }

    pub fn build(self) -> ServiceDescriptor {
        ServiceDescriptor {
            fully_qualified_name: self.fully_qualified_name,
            methods: self.methods,
            file_descriptor_protos: self.file_descriptor_protos,
        }
    }
}

/// Re-type an erased `BoxMessage` channel back to `T` at the handler
/// boundary. Values flowing through were placed there by this same
/// registration closure, so the downcast is infallible in practice; a
/// mismatch degrades to a clean end-of-stream rather than a panic.
fn retype_receiver<T: Send + Sync + 'static>(mut erased: Receiver<BoxMessage>) -> Receiver<T> {
    let cancellation = erased.cancellation();
    let (typed_tx, typed_rx) = tokio::sync::mpsc::channel::<T>(1);
    tokio::spawn(async move {
        loop {
            match erased.next().await {
                Ok(Some(boxed)) => match boxed.downcast::<T>() {
                    Ok(value) => {
                        if typed_tx.send(*value).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                },
                _ => break,
            }
        }
    });
    Receiver::new(typed_rx, cancellation)
}

fn retype_sender<T: Send + Sync + 'static>(erased: Sender<BoxMessage>) -> Sender<T> {
    let cancellation = erased.cancellation();
    let (typed_tx, mut typed_rx) = tokio::sync::mpsc::channel::<T>(1);
    tokio::spawn(async move {
        while let Some(value) = typed_rx.recv().await {
            if erased.send(Box::new(value)).await.is_err() {
                break;
            }
        }
    });
    Sender::new(typed_tx, cancellation)
}

/// `{services, path_index}`. Registration is
/// rejected once the registry is frozen.
pub struct ServiceRegistry {
    services: HashMap<String, Arc<ServiceDescriptor>>,
    path_index: HashMap<String, (Arc<ServiceDescriptor>, String)>,
    frozen: bool,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            services: HashMap::new(),
            path_index: HashMap::new(),
            frozen: false,
        }
    }

    /// Register a service, failing if a service of the same name already
    /// exists or the registry is frozen.
    pub fn register(&mut self, service: ServiceDescriptor) -> Result<(), Status> {
        if self.frozen {
            return Err(Status::failed_precondition("registry is frozen; server already running"));
        }
        if self.services.contains_key(&service.fully_qualified_name) {
            return Err(Status::already_exists(format!(
                "service already registered: {}",
                service.fully_qualified_name
            )));
        }
        let service = Arc::new(service);
        for method_name in service.methods.keys() {
            let path = format!("/{}/{}", service.fully_qualified_name, method_name);
            self.path_index
                .insert(path, (Arc::clone(&service), method_name.clone()));
        }
        self.services.insert(service.fully_qualified_name.clone(), service);
        Ok(())
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn lookup(&self, path: &str) -> Option<(&Arc<ServiceDescriptor>, &MethodDescriptor)> {
        let (service, method_name) = self.path_index.get(path)?;
        service.methods.get(method_name).map(|method| (service, method))
    }

    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    pub fn service(&self, name: &str) -> Option<&Arc<ServiceDescriptor>> {
        self.services.get(name)
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_context() -> RequestContext {
        RequestContext::new(
            "/test.Greeter/Hello".into(),
            "localhost".into(),
            crate::context::PeerInfo {
                address: "127.0.0.1".parse().unwrap(),
                port: 1234,
                certificate: None,
            },
            crate::stream::HeaderList::new(),
            None,
        )
    }

    #[tokio::test]
    async fn unary_round_trip_through_erased_handler() {
        let service = ServiceBuilder::new("test.Greeter")
            .unary(
                "Hello",
                "test.HelloRequest",
                "test.HelloResponse",
                |_ctx, req: String| async move { (format!("hello {req}"), Status::ok()) },
            )
            .build();

        let method = &service.methods["Hello"];
        let Handler::Unary(handler) = &method.handler else {
            panic!("expected unary handler");
        };
        let (resp, status) = handler(dummy_context(), Box::new("world".to_string())).await;
        assert!(status.is_ok());
        assert_eq!(*resp.downcast::<String>().unwrap(), "hello world");
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = ServiceRegistry::new();
        let build = || {
            ServiceBuilder::new("test.Greeter")
                .unary("Hello", "Req", "Resp", |_ctx, req: String| async move {
                    (req, Status::ok())
                })
                .build()
        };
        registry.register(build()).unwrap();
        assert!(registry.register(build()).is_err());
    }

    #[test]
    fn path_index_matches_registered_method() {
        let mut registry = ServiceRegistry::new();
        let service = ServiceBuilder::new("test.Greeter")
            .unary("Hello", "Req", "Resp", |_ctx, req: String| async move {
                (req, Status::ok())
            })
            .build();
        registry.register(service).unwrap();
        assert!(registry.lookup("/test.Greeter/Hello").is_some());
        assert!(registry.lookup("/test.Greeter/Missing").is_none());
    }

    #[test]
    fn registration_after_freeze_is_rejected() {
        let mut registry = ServiceRegistry::new();
        registry.freeze();
        let service = ServiceBuilder::new("test.Greeter")
            .unary("Hello", "Req", "Resp", |_ctx, req: String| async move {
                (req, Status::ok())
            })
            .build();
        assert!(registry.register(service).is_err());
    }
}
