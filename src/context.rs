//! Request-scoped context. Created once per RPC on HEADERS receipt.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::stream::HeaderList;

/// Parse a `grpc-timeout` header value into a [`Duration`].
/// Malformed input is treated as "no deadline parsed", matching real-world
/// client leniency rather than a hard rejection.
pub fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    if value.is_empty() || value.len() > 9 {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    if digits.is_empty() {
        return None;
    }
    let amount: u64 = digits.parse().ok()?;
    let nanos_per_unit: u64 = match unit {
        "H" => 3_600_000_000_000,
        "M" => 60_000_000_000,
        "S" => 1_000_000_000,
        "m" => 1_000_000,
        "u" => 1_000,
        "n" => 1,
        _ => return None,
    };
    let nanos = amount.checked_mul(nanos_per_unit)?;
    Some(Duration::from_nanos(nanos))
}

/// Format a [`Duration`] back into a `grpc-timeout` value, picking the
/// coarsest unit that represents it exactly, falling back to nanoseconds.
pub fn format_grpc_timeout(duration: Duration) -> String {
    let nanos = duration.as_nanos() as u64;
    let units: [(u64, &str); 6] = [
        (3_600_000_000_000, "H"),
        (60_000_000_000, "M"),
        (1_000_000_000, "S"),
        (1_000_000, "m"),
        (1_000, "u"),
        (1, "n"),
    ];
    for (scale, suffix) in units {
        if nanos % scale == 0 {
            let amount = nanos / scale;
            if amount > 0 && amount < 100_000_000 {
                return format!("{amount}{suffix}");
            }
        }
    }
    format!("{nanos}n")
}

/// Peer connection metadata: address, port, and an optional client
/// certificate when mutual TLS was negotiated.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub address: std::net::IpAddr,
    pub port: u16,
    pub certificate: Option<Vec<u8>>,
}

impl std::fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn from_timeout(timeout: Duration) -> Self {
        Self {
            at: Instant::now() + timeout,
        }
    }

    /// Duration until this deadline fires; may be negative, represented
    /// here by `Duration::ZERO` with `is_expired` reporting true.
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }

    pub fn instant(&self) -> Instant {
        self.at
    }
}

/// Request-scoped context: deadline, cancellation, metadata, peer info
///. Cheaply cloneable; the cancellation flag is shared so that
/// the connection's deadline scheduler can flip it from another task.
#[derive(Clone)]
pub struct RequestContext {
    pub request_id: Uuid,
    pub method_path: String,
    pub authority: String,
    pub peer: PeerInfo,
    pub request_metadata: HeaderList,
    deadline: Option<Deadline>,
    cancelled: Arc<AtomicBool>,
}

impl RequestContext {
    pub fn new(
        method_path: String,
        authority: String,
        peer: PeerInfo,
        request_metadata: HeaderList,
        deadline: Option<Deadline>,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            method_path,
            authority,
            peer,
            request_metadata,
            deadline,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn deadline(&self) -> Option<Deadline> {
        self.deadline
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.remaining())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
            || self.deadline.map(|d| d.is_expired()).unwrap_or(false)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// A cloneable handle a deadline scheduler can hold without pinning the
    /// whole context in memory.
    pub fn cancellation_handle(&self) -> CancellationHandle {
        CancellationHandle {
            cancelled: Arc::clone(&self.cancelled),
        }
    }
}

#[derive(Clone)]
pub struct CancellationHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancellationHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_unit() {
        assert_eq!(parse_grpc_timeout("100m"), Some(Duration::from_millis(100)));
        assert_eq!(parse_grpc_timeout("1S"), Some(Duration::from_secs(1)));
        assert_eq!(parse_grpc_timeout("5H"), Some(Duration::from_secs(5 * 3600)));
        assert_eq!(parse_grpc_timeout("10n"), Some(Duration::from_nanos(10)));
    }

    #[test]
    fn rejects_malformed_values() {
        assert_eq!(parse_grpc_timeout(""), None);
        assert_eq!(parse_grpc_timeout("abc"), None);
        assert_eq!(parse_grpc_timeout("-5S"), None);
        assert_eq!(parse_grpc_timeout("5X"), None);
    }

    #[test]
    fn format_round_trips_within_unit_resolution() {
        let duration = Duration::from_millis(100);
        let formatted = format_grpc_timeout(duration);
        let reparsed = parse_grpc_timeout(&formatted).unwrap();
        assert_eq!(reparsed, duration);
    }

    #[test]
    fn deadline_expiry_is_observable() {
        let deadline = Deadline::from_timeout(Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert!(deadline.is_expired());
    }

    #[test]
    fn cancellation_handle_shares_state_with_context() {
        let ctx = RequestContext::new(
            "/test.Greeter/Hello".into(),
            "localhost".into(),
            PeerInfo {
                address: "127.0.0.1".parse().unwrap(),
                port: 1234,
                certificate: None,
            },
            HeaderList::new(),
            None,
        );
        let handle = ctx.cancellation_handle();
        assert!(!ctx.is_cancelled());
        handle.cancel();
        assert!(ctx.is_cancelled());
    }
}
