//! Interceptor composition and built-ins.
//!
//! Interceptors are modeled as a capability interface (`intercept`) composed
//! by folding the registration list, innermost first — no runtime reflection
//!.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use futures_util::FutureExt;

use crate::context::RequestContext;
use crate::registry::{BoxFuture, MethodPattern};
use crate::status::Status;

/// Metadata about the method being invoked, passed to every interceptor.
#[derive(Clone)]
pub struct MethodInfo {
    pub service_name: String,
    pub method_name: String,
    pub pattern: MethodPattern,
}

/// The continuation an interceptor must call exactly once unless it
/// short-circuits.
pub type Next = Arc<dyn Fn(RequestContext) -> BoxFuture<'static, Status> + Send + Sync>;

pub trait Interceptor: Send + Sync {
    fn intercept(&self, ctx: RequestContext, info: MethodInfo, next: Next) -> BoxFuture<'static, Status>;
}

/// Fold a list of interceptors (first-added is outermost) around `handler`
/// into a single callable.
pub fn compose(
    interceptors: &[Arc<dyn Interceptor>],
    info: MethodInfo,
    handler: Arc<dyn Fn(RequestContext) -> BoxFuture<'static, Status> + Send + Sync>,
) -> Next {
    interceptors.iter().rev().fold(handler, |next, interceptor| {
        let interceptor = Arc::clone(interceptor);
        let info = info.clone();
        Arc::new(move |ctx| {
            let interceptor = Arc::clone(&interceptor);
            let info = info.clone();
            let next = Arc::clone(&next);
            Box::pin(async move { interceptor.intercept(ctx, info, next).await })
        })
    })
}

/// A sink for logging events, injected by the embedding application.
pub trait LogSink: Send + Sync {
    fn on_request_start(&self, ctx: &RequestContext, info: &MethodInfo);
    fn on_request_end(&self, ctx: &RequestContext, info: &MethodInfo, status: &Status, duration: std::time::Duration);
}

/// Emits start/end records tagged with request-id, method, peer, duration,
/// status.
pub struct LoggingInterceptor {
    sink: Arc<dyn LogSink>,
}

impl LoggingInterceptor {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self { sink }
    }
}

impl Interceptor for LoggingInterceptor {
    fn intercept(&self, ctx: RequestContext, info: MethodInfo, next: Next) -> BoxFuture<'static, Status> {
        let sink = Arc::clone(&self.sink);
        Box::pin(async move {
            sink.on_request_start(&ctx, &info);
            let start = Instant::now();
            let status = next(ctx.clone()).await;
            sink.on_request_end(&ctx, &info, &status, start.elapsed());
            status
        })
    }
}

/// Counters injected for request-start and response-completion events.
pub trait MetricsSink: Send + Sync {
    fn on_request_start(&self, info: &MethodInfo);
    fn on_request_complete(&self, info: &MethodInfo, status: &Status, duration: std::time::Duration);
}

pub struct MetricsInterceptor {
    sink: Arc<dyn MetricsSink>,
}

impl MetricsInterceptor {
    pub fn new(sink: Arc<dyn MetricsSink>) -> Self {
        Self { sink }
    }
}

impl Interceptor for MetricsInterceptor {
    fn intercept(&self, ctx: RequestContext, info: MethodInfo, next: Next) -> BoxFuture<'static, Status> {
        let sink = Arc::clone(&self.sink);
        Box::pin(async move {
            sink.on_request_start(&info);
            let start = Instant::now();
            let status = next(ctx).await;
            sink.on_request_complete(&info, &status, start.elapsed());
            status
        })
    }
}

/// Applies `default_timeout` when the context has no deadline; short-circuits
/// immediately if the existing deadline has already expired.
pub struct TimeoutInterceptor {
    default_timeout: Option<std::time::Duration>,
}

impl TimeoutInterceptor {
    pub fn new(default_timeout: Option<std::time::Duration>) -> Self {
        Self { default_timeout }
    }
}

impl Interceptor for TimeoutInterceptor {
    fn intercept(&self, ctx: RequestContext, _info: MethodInfo, next: Next) -> BoxFuture<'static, Status> {
        if let Some(deadline) = ctx.deadline() {
            if deadline.is_expired() {
                return Box::pin(async move { Status::deadline_exceeded("deadline already expired") });
            }
        }
        Box::pin(async move { next(ctx).await })
    }
}

/// Catches any non-status failure from downstream handlers (a panic caught
/// by `catch_unwind` at the dispatcher boundary) and maps it to `INTERNAL`
///. Idempotent: re-wrapping an existing status
/// returns it unchanged.
pub struct RecoveryInterceptor {
    pub include_stack_trace: bool,
}

impl Interceptor for RecoveryInterceptor {
    fn intercept(&self, ctx: RequestContext, _info: MethodInfo, next: Next) -> BoxFuture<'static, Status> {
        let include_stack_trace = self.include_stack_trace;
        Box::pin(async move {
            match std::panic::AssertUnwindSafe(next(ctx)).catch_unwind().await {
                Ok(status) => status,
                Err(payload) => {
                    let message = panic_message(&payload);
                    if include_stack_trace {
                        Status::internal(message)
                    } else {
                        Status::internal("internal error")
                    }
                }
            }
        })
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::PeerInfo;
    use crate::stream::HeaderList;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn dummy_context() -> RequestContext {
        RequestContext::new(
            "/test.Greeter/Hello".into(),
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

    fn dummy_info() -> MethodInfo {
        MethodInfo {
            service_name: "test.Greeter".into(),
            method_name: "Hello".into(),
            pattern: MethodPattern::Unary,
        }
    }

    #[tokio::test]
    async fn empty_chain_returns_handler_identity() {
        let handler: Arc<dyn Fn(RequestContext) -> BoxFuture<'static, Status> + Send + Sync> =
            Arc::new(|_ctx| Box::pin(async { Status::ok() }));
        let chain = compose(&[], dummy_info(), handler);
        let status = chain(dummy_context()).await;
        assert!(status.is_ok());
    }

    #[tokio::test]
    async fn recovery_interceptor_maps_panic_to_internal() {
        let interceptors: Vec<Arc<dyn Interceptor>> = vec![Arc::new(RecoveryInterceptor {
            include_stack_trace: false,
        })];
        let handler: Arc<dyn Fn(RequestContext) -> BoxFuture<'static, Status> + Send + Sync> =
            Arc::new(|_ctx| Box::pin(async { panic!("boom") }));
        let chain = compose(&interceptors, dummy_info(), handler);
        let status = chain(dummy_context()).await;
        assert_eq!(status.code(), crate::status::Code::Internal);
    }

    #[tokio::test]
    async fn timeout_interceptor_short_circuits_expired_deadline() {
        use crate::context::Deadline;
        let interceptors: Vec<Arc<dyn Interceptor>> =
            vec![Arc::new(TimeoutInterceptor::new(None))];
        let handler: Arc<dyn Fn(RequestContext) -> BoxFuture<'static, Status> + Send + Sync> =
            Arc::new(|_ctx| Box::pin(async { Status::ok() }));
        let chain = compose(&interceptors, dummy_info(), handler);

        let mut ctx = dummy_context();
        ctx = RequestContext::new(
            ctx.method_path.clone(),
            ctx.authority.clone(),
            ctx.peer.clone(),
            ctx.request_metadata.clone(),
            Some(Deadline::from_timeout(std::time::Duration::from_millis(0))),
        );
        std::thread::sleep(std::time::Duration::from_millis(5));
        let status = chain(ctx).await;
        assert_eq!(status.code(), crate::status::Code::DeadlineExceeded);
    }

    #[tokio::test]
    async fn interceptor_order_is_outermost_first() {
        let order = Arc::new(std::sync::Mutex::new(Vec::<&'static str>::new()));

        struct Tagging {
            tag: &'static str,
            order: Arc<std::sync::Mutex<Vec<&'static str>>>,
        }
        impl Interceptor for Tagging {
            fn intercept(&self, ctx: RequestContext, _info: MethodInfo, next: Next) -> BoxFuture<'static, Status> {
                self.order.lock().unwrap().push(self.tag);
                Box::pin(async move { next(ctx).await })
            }
        }

        let interceptors: Vec<Arc<dyn Interceptor>> = vec![
            Arc::new(Tagging {
                tag: "first",
                order: Arc::clone(&order),
            }),
            Arc::new(Tagging {
                tag: "second",
                order: Arc::clone(&order),
            }),
        ];
        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = Arc::clone(&counter);
        let handler: Arc<dyn Fn(RequestContext) -> BoxFuture<'static, Status> + Send + Sync> =
            Arc::new(move |_ctx| {
                counter2.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Status::ok() })
            });
        let chain = compose(&interceptors, dummy_info(), handler);
        chain(dummy_context()).await;
        assert_eq!(&*order.lock().unwrap(), &["first", "second"]);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
