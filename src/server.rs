//! Server lifecycle.
//!
//! A fluent builder resolves every knob before `build()`. The accept loop
//! is `TcpListener::bind` then `tokio::select!` between `listener.accept()`
//! and a shutdown signal; idle/keepalive timeouts are enforced inside
//! [`crate::connection::serve`] per connection rather than in the accept
//! loop itself.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;

use crate::codec::MessageCodec;
use crate::config::{ServerConfig, TlsConfig};
use crate::connection;
use crate::context::PeerInfo;
use crate::debug_warn;
use crate::dispatcher::Dispatcher;
use crate::health::HealthService;
use crate::interceptor::Interceptor;
use crate::reflection::ReflectionService;
use crate::registry::{ServiceDescriptor, ServiceRegistry};
use crate::status::Status;
use crate::tls::{RustlsAcceptor, ServerConnectionStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Draining,
}

/// Accumulates service registrations, interceptors, and configuration before
/// resolving them into a runnable [`Server`].
pub struct ServerBuilder {
    config: ServerConfig,
    registry: ServiceRegistry,
    codec: Arc<dyn MessageCodec>,
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl ServerBuilder {
    /// A message codec is mandatory: the runtime never decodes bytes itself.
    pub fn new(codec: Arc<dyn MessageCodec>) -> Self {
        Self {
            config: ServerConfig::builder().build(),
            registry: ServiceRegistry::new(),
            codec,
            interceptors: Vec::new(),
        }
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Register one service's descriptor. Rejects a duplicate fully
    /// qualified name.
    pub fn register(mut self, service: ServiceDescriptor) -> Result<Self, Status> {
        self.registry.register(service)?;
        Ok(self)
    }

    /// Append a global interceptor, outermost-first in invocation order.
    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Resolve the registry (auto-registering health/reflection per
    /// `enable_health_check`/`enable_reflection`), construct the dispatcher
    /// and TLS acceptor, and hand back a server ready to [`Server::start`].
    pub fn build(mut self) -> Result<Arc<Server>, Status> {
        let health = if self.config.enable_health_check {
            let health = Arc::new(HealthService::new());
            self.registry.register(health.build_service())?;
            Some(health)
        } else {
            None
        };

        let registry = Arc::new(RwLock::new(self.registry));

        let reflection = if self.config.enable_reflection {
            let reflection = Arc::new(ReflectionService::new(Arc::clone(&registry)));
            registry
                .write()
                .expect("registry lock poisoned")
                .register(reflection.build_service())?;
            Some(reflection)
        } else {
            None
        };

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            self.codec,
            self.interceptors,
            self.config.max_concurrent_requests,
        ));

        let tls_acceptor = self
            .config
            .tls
            .as_ref()
            .map(RustlsAcceptor::new)
            .transpose()
            .map_err(|err| Status::invalid_argument(format!("invalid TLS configuration: {err}")))?;

        Ok(Arc::new(Server {
            config: Arc::new(self.config),
            registry,
            dispatcher,
            health,
            reflection,
            state: Mutex::new(LifecycleState::Stopped),
            shutdown: Arc::new(Notify::new()),
            connections: Arc::new(Mutex::new(Vec::new())),
            accept_task: Mutex::new(None),
            tls_acceptor: RwLock::new(tls_acceptor),
        }))
    }
}

/// A running (or not-yet-started) server instance. Exposes `start`,
/// `stop(force, timeout)`, and `reload_tls`. Always handed out behind an
/// `Arc` since the accept loop and every connection task hold a clone of
/// the parts they need.
pub struct Server {
    config: Arc<ServerConfig>,
    registry: Arc<RwLock<ServiceRegistry>>,
    dispatcher: Arc<Dispatcher>,
    health: Option<Arc<HealthService>>,
    reflection: Option<Arc<ReflectionService>>,
    state: Mutex<LifecycleState>,
    shutdown: Arc<Notify>,
    connections: Arc<Mutex<Vec<JoinHandle<()>>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    tls_acceptor: RwLock<Option<RustlsAcceptor>>,
}

impl Server {
    /// The health service this server auto-registered, if
    /// `enable_health_check` was set, for the embedding application to drive
    /// with [`HealthService::set_serving_status`].
    pub fn health(&self) -> Option<Arc<HealthService>> {
        self.health.clone()
    }

    pub fn reflection(&self) -> Option<Arc<ReflectionService>> {
        self.reflection.clone()
    }

    /// Bind and start accepting connections, freezing the registry so no
    /// further services can be registered once live.
    pub async fn start(self: &Arc<Self>, addr: SocketAddr) -> std::io::Result<SocketAddr> {
        {
            let mut state = self.state.lock().expect("state lock poisoned");
            if *state != LifecycleState::Stopped {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "server is already started",
                ));
            }
            *state = LifecycleState::Starting;
        }

        self.registry.write().expect("registry lock poisoned").freeze();

        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let this = Arc::clone(self);
        let shutdown = Arc::clone(&self.shutdown);
        let accept_task = tokio::spawn(async move { this.run_accept_loop(listener, shutdown).await });
        *self.accept_task.lock().expect("accept task lock poisoned") = Some(accept_task);

        *self.state.lock().expect("state lock poisoned") = LifecycleState::Running;
        Ok(local_addr)
    }

    /// The accept loop proper: bind is already done by [`Self::start`], this
    /// races `listener.accept()` against the shared shutdown signal in a
    /// `tokio::select!`. The signal is shared by every connection so that
    /// stopping also wakes each one into its own graceful drain.
    async fn run_accept_loop(self: Arc<Self>, listener: TcpListener, shutdown: Arc<Notify>) {
        let admission = Arc::new(Semaphore::new(self.config.max_connections));
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, remote_addr) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            debug_warn!("accept() failed: {err}");
                            continue;
                        }
                    };
                    let Ok(permit) = Arc::clone(&admission).try_acquire_owned() else {
                        debug_warn!("dropping connection from {remote_addr}: max_connections reached");
                        drop(stream);
                        continue;
                    };
                    self.spawn_connection(stream, remote_addr, permit);
                }
                _ = shutdown.notified() => break,
            }
        }
    }

    fn spawn_connection(
        self: &Arc<Self>,
        stream: TcpStream,
        remote_addr: SocketAddr,
        permit: tokio::sync::OwnedSemaphorePermit,
    ) {
        let config = Arc::clone(&self.config);
        let registry = Arc::clone(&self.registry);
        let dispatcher = Arc::clone(&self.dispatcher);
        let shutdown = Arc::clone(&self.shutdown);
        let tls_acceptor = self.tls_acceptor.read().expect("tls lock poisoned").clone();

        let handle = tokio::spawn(async move {
            let _permit = permit;
            let connection_stream = match tls_acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => ServerConnectionStream::Tls(Box::new(tls_stream)),
                    Err(err) => {
                        debug_warn!("TLS handshake with {remote_addr} failed: {err}");
                        return;
                    }
                },
                None => ServerConnectionStream::Plain(stream),
            };

            let peer = PeerInfo {
                address: remote_addr.ip(),
                port: remote_addr.port(),
                certificate: connection_stream.peer_certificate(),
            };

            if let Err(err) = connection::serve(connection_stream, peer, config, registry, dispatcher, shutdown).await
            {
                debug_warn!("connection from {remote_addr} ended with error: {err}");
            }
        });

        let mut connections = self.connections.lock().expect("connections lock poisoned");
        connections.retain(|handle| !handle.is_finished());
        connections.push(handle);
    }

    /// Stop accepting new connections and either wait up to `timeout` for
    /// in-flight streams to drain (graceful) or abort every connection task
    /// immediately (`force`).
    pub async fn stop(&self, force: bool, timeout: Duration) -> std::io::Result<()> {
        {
            let mut state = self.state.lock().expect("state lock poisoned");
            if *state == LifecycleState::Stopped {
                return Ok(());
            }
            *state = LifecycleState::Draining;
        }

        // Wakes the accept loop (stops taking new connections) and every
        // connection currently parked on its own `shutdown.notified()`
        // branch, each of which answers with GOAWAY and its own drain.
        self.shutdown.notify_waiters();

        if let Some(accept_task) = self.accept_task.lock().expect("accept task lock poisoned").take() {
            let _ = accept_task.await;
        }

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.connections.lock().expect("connections lock poisoned"));

        if force {
            for handle in &handles {
                handle.abort();
            }
            for handle in handles {
                let _ = handle.await;
            }
        } else {
            let deadline = tokio::time::Instant::now() + timeout;
            for mut handle in handles {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if tokio::time::timeout(remaining, &mut handle).await.is_err() {
                    debug_warn!("connection did not drain within {timeout:?}; aborting");
                    handle.abort();
                }
            }
        }

        *self.state.lock().expect("state lock poisoned") = LifecycleState::Stopped;
        Ok(())
    }

    /// Swap in freshly loaded TLS material. Only valid while running;
    /// existing connections keep whatever acceptor they negotiated with,
    /// only subsequently accepted sockets see the new certificate.
    pub fn reload_tls(&self, tls: TlsConfig) -> std::io::Result<()> {
        if *self.state.lock().expect("state lock poisoned") != LifecycleState::Running {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "reload_tls requires a running server",
            ));
        }
        let acceptor = RustlsAcceptor::new(&tls)?;
        *self.tls_acceptor.write().expect("tls lock poisoned") = Some(acceptor);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Status;
    use std::any::Any;
    use bytes::Bytes;

    struct BytesCodec;

    impl MessageCodec for BytesCodec {
        fn decode(&self, _type_name: &str, bytes: &[u8]) -> Result<crate::codec::BoxMessage, Status> {
            Ok(Box::new(Bytes::copy_from_slice(bytes)))
        }

        fn encode(&self, _type_name: &str, message: &(dyn Any + Send + Sync)) -> Result<Bytes, Status> {
            message
                .downcast_ref::<Bytes>()
                .cloned()
                .ok_or_else(|| Status::internal("unexpected message type"))
        }
    }

    fn echo_service() -> ServiceDescriptor {
        crate::registry::ServiceBuilder::new("test.Echo")
            .unary("Say", "test.Req", "test.Resp", |_ctx, req: Bytes| async move {
                (req, Status::ok())
            })
            .build()
    }

    #[test]
    fn builder_auto_registers_health_and_reflection_by_default() {
        let server = ServerBuilder::new(Arc::new(BytesCodec))
            .register(echo_service())
            .unwrap()
            .build()
            .unwrap();
        assert!(server.health().is_some());
        assert!(server.reflection().is_some());
        let registry = server.registry.read().unwrap();
        assert!(registry.lookup("/grpc.health.v1.Health/Check").is_some());
        assert!(registry
            .lookup("/grpc.reflection.v1alpha.ServerReflection/ServerReflectionInfo")
            .is_some());
    }

    #[test]
    fn builder_honors_disabled_ambient_services() {
        let config = ServerConfig::builder()
            .enable_health_check(false)
            .enable_reflection(false)
            .build();
        let server = ServerBuilder::new(Arc::new(BytesCodec))
            .config(config)
            .register(echo_service())
            .unwrap()
            .build()
            .unwrap();
        assert!(server.health().is_none());
        assert!(server.reflection().is_none());
    }

    #[tokio::test]
    async fn start_binds_and_stop_is_idempotent() {
        let server = ServerBuilder::new(Arc::new(BytesCodec)).build().unwrap();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let bound = server.start(addr).await.unwrap();
        assert_ne!(bound.port(), 0);

        server.stop(false, Duration::from_millis(200)).await.unwrap();
        // Stopping twice must not panic or hang.
        server.stop(false, Duration::from_millis(200)).await.unwrap();
    }

    #[tokio::test]
    async fn reload_tls_rejects_when_not_running() {
        let server = ServerBuilder::new(Arc::new(BytesCodec)).build().unwrap();
        let result = server.reload_tls(TlsConfig::new(Vec::new(), Vec::new()));
        assert!(result.is_err());
    }
}
