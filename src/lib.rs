//! A from-scratch gRPC-over-HTTP/2 server runtime.
//!
//! No `tonic`/`h2`/`hyper` underneath: the frame codec, HPACK codec, stream
//! state machine, connection runtime, and gRPC framing are all implemented
//! in this crate. Protocol Buffers encoding is treated as an external
//! collaborator (see [`codec::MessageCodec`]) rather than a direct
//! dependency, so the embedding application supplies its own generated
//! types and wires them in through [`registry::ServiceBuilder`].
//!
//! Start at [`server::ServerBuilder`] to assemble and run a server; the
//! [`prelude`] module re-exports the surface most applications need.

pub mod adapters;
pub mod codec;
pub mod config;
pub mod connection;
pub mod context;
pub mod deadline;
pub mod debug;
pub mod dispatcher;
pub mod error;
pub mod flow_control;
pub mod frame;
pub mod grpc;
pub mod health;
pub mod hpack;
pub mod interceptor;
pub mod reflection;
pub mod registry;
pub mod server;
pub mod status;
pub mod stream;
pub mod tls;

/// Convenience re-exports for the common case of standing up a server with
/// a handful of services.
pub mod prelude {
    pub use crate::adapters::{Receiver, Sender, StreamError};
    pub use crate::codec::{BoxMessage, MessageCodec};
    pub use crate::config::{ServerConfig, ServerConfigBuilder, TlsConfig};
    pub use crate::context::{PeerInfo, RequestContext};
    pub use crate::health::{HealthCheckRequest, HealthCheckResponse, HealthService, ServingStatus};
    pub use crate::interceptor::{
        Interceptor, LogSink, LoggingInterceptor, MetricsInterceptor, MetricsSink, MethodInfo, RecoveryInterceptor,
        TimeoutInterceptor,
    };
    pub use crate::reflection::{ReflectionService, ServerReflectionRequest, ServerReflectionResponse};
    pub use crate::registry::{ServiceBuilder, ServiceDescriptor};
    pub use crate::server::{Server, ServerBuilder};
    pub use crate::status::{Code, Status};
}
