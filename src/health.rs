//! Health checking service: a service-name -> status map, `Check` resolves
//! it once, `Watch` is a server-streaming RPC that replays the current
//! value and then every subsequent change until the client cancels. The
//! empty service name is just another key in the same map, holding the
//! overall server status.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::watch;

use crate::adapters::Sender;
use crate::context::RequestContext;
use crate::registry::{ServiceBuilder, ServiceDescriptor};
use crate::status::Status;

/// `{UNKNOWN, SERVING, NOT_SERVING, SERVICE_UNKNOWN}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServingStatus {
    Unknown,
    Serving,
    NotServing,
    ServiceUnknown,
}

#[derive(Debug, Clone)]
pub struct HealthCheckRequest {
    pub service: String,
}

#[derive(Debug, Clone)]
pub struct HealthCheckResponse {
    pub status: ServingStatus,
}

struct Entry {
    tx: watch::Sender<ServingStatus>,
}

/// `Check(service)`/`Watch(service)` over a mutex-protected map. `watch::Sender` doubles as both the
/// current-value cell and the change notifier here.
pub struct HealthService {
    entries: Mutex<HashMap<String, Entry>>,
}

impl HealthService {
    pub fn new() -> Self {
        let mut entries = HashMap::new();
        entries.insert(
            String::new(),
            Entry {
                tx: watch::channel(ServingStatus::Serving).0,
            },
        );
        Self {
            entries: Mutex::new(entries),
        }
    }

    /// Set (and create if absent) a service's serving status, waking any
    /// `Watch` streams subscribed to it.
    pub fn set_serving_status(&self, service: &str, status: ServingStatus) {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(service) {
            Some(entry) => {
                let _ = entry.tx.send(status);
            }
            None => {
                entries.insert(service.to_string(), Entry { tx: watch::channel(status).0 });
            }
        }
    }

    /// Remove a service entry entirely, as `SERVICE_UNKNOWN` behaves for
    /// any subsequent `Check`/`Watch` (a service that was never registered).
    pub fn clear_status(&self, service: &str) {
        self.entries.lock().unwrap().remove(service);
    }

    fn watch_receiver(&self, service: &str) -> Option<watch::Receiver<ServingStatus>> {
        self.entries.lock().unwrap().get(service).map(|entry| entry.tx.subscribe())
    }

    async fn check(&self, request: HealthCheckRequest) -> (HealthCheckResponse, Status) {
        match self.watch_receiver(&request.service) {
            Some(rx) => (
                HealthCheckResponse {
                    status: *rx.borrow(),
                },
                Status::ok(),
            ),
            None => (
                HealthCheckResponse {
                    status: ServingStatus::ServiceUnknown,
                },
                Status::not_found(format!("unknown service: {}", request.service)),
            ),
        }
    }

    async fn watch(
        &self,
        request: HealthCheckRequest,
        sender: Sender<HealthCheckResponse>,
    ) -> Status {
        let Some(mut rx) = self.watch_receiver(&request.service) else {
            return Status::not_found(format!("unknown service: {}", request.service));
        };
        loop {
            let status = *rx.borrow();
            if sender.send(HealthCheckResponse { status }).await.is_err() {
                return Status::ok();
            }
            if rx.changed().await.is_err() {
                return Status::ok();
            }
        }
    }

    /// Build the health-check service descriptor for registration.
    pub fn build_service(self: &std::sync::Arc<Self>) -> ServiceDescriptor {
        let for_check = std::sync::Arc::clone(self);
        let for_watch = std::sync::Arc::clone(self);
        ServiceBuilder::new("grpc.health.v1.Health")
            .unary(
                "Check",
                "grpc.health.v1.HealthCheckRequest",
                "grpc.health.v1.HealthCheckResponse",
                move |_ctx: RequestContext, req: HealthCheckRequest| {
                    let service = std::sync::Arc::clone(&for_check);
                    async move { service.check(req).await }
                },
            )
            .server_streaming(
                "Watch",
                "grpc.health.v1.HealthCheckRequest",
                "grpc.health.v1.HealthCheckResponse",
                move |_ctx: RequestContext, req: HealthCheckRequest, sender: Sender<HealthCheckResponse>| {
                    let service = std::sync::Arc::clone(&for_watch);
                    async move { service.watch(req, sender).await }
                },
            )
            .build()
    }
}

impl Default for HealthService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_service_check_is_not_found() {
        let health = HealthService::new();
        let (_, status) = health
            .check(HealthCheckRequest {
                service: "test.Greeter".into(),
            })
            .await;
        assert_eq!(status.code(), crate::status::Code::NotFound);
    }

    #[tokio::test]
    async fn overall_status_defaults_to_serving() {
        let health = HealthService::new();
        let (resp, status) = health.check(HealthCheckRequest { service: String::new() }).await;
        assert!(status.is_ok());
        assert_eq!(resp.status, ServingStatus::Serving);
    }

    #[tokio::test]
    async fn set_then_check_reflects_new_status() {
        let health = HealthService::new();
        health.set_serving_status("test.Greeter", ServingStatus::NotServing);
        let (resp, status) = health
            .check(HealthCheckRequest {
                service: "test.Greeter".into(),
            })
            .await;
        assert!(status.is_ok());
        assert_eq!(resp.status, ServingStatus::NotServing);
    }

    #[tokio::test]
    async fn watch_emits_current_then_subsequent_changes() {
        let health = std::sync::Arc::new(HealthService::new());
        health.set_serving_status("test.Greeter", ServingStatus::Serving);

        let cancellation = {
            let ctx = RequestContext::new(
                "/grpc.health.v1.Health/Watch".into(),
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
        let (tx, mut rx) = crate::adapters::channel::<HealthCheckResponse>(4, cancellation);

        let watcher = std::sync::Arc::clone(&health);
        let handle = tokio::spawn(async move {
            watcher
                .watch(
                    HealthCheckRequest {
                        service: "test.Greeter".into(),
                    },
                    tx,
                )
                .await
        });

        let first = rx.next().await.unwrap().unwrap();
        assert_eq!(first.status, ServingStatus::Serving);

        health.set_serving_status("test.Greeter", ServingStatus::NotServing);
        let second = rx.next().await.unwrap().unwrap();
        assert_eq!(second.status, ServingStatus::NotServing);

        drop(rx);
        let _ = handle.await;
    }
}
