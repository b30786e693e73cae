//! Per-connection deadline scheduler.
//!
//! One scheduler per connection, driven from the connection's read task
//! with a `tokio::select!` over the next wakeup and new registrations,
//! rather than a `tokio::time::sleep` per stream, which would mean one
//! timer task per in-flight RPC.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Instant;

use fnv::FnvHashMap;

use crate::context::CancellationHandle;

/// A stream whose deadline fired. The connection runtime reacts by
/// cancelling the handler (already done by the time this is yielded) and
/// emitting `RST_STREAM(CANCEL)` if the stream is still open.
pub struct Expired {
    pub stream_id: u32,
}

/// Min-heap of `(deadline, stream_id)` plus the handle needed to flip the
/// shared cancellation flag when a deadline fires. `stream_id` breaks ties
/// and lets a single scheduler track many streams on one connection.
pub struct DeadlineScheduler {
    heap: BinaryHeap<Reverse<(Instant, u32)>>,
    handles: FnvHashMap<u32, CancellationHandle>,
}

impl DeadlineScheduler {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            handles: FnvHashMap::default(),
        }
    }

    /// Register a stream's deadline. Replaces any existing entry for the
    /// same `stream_id` (the old heap entry becomes a stale tombstone,
    /// skipped in `poll_expired` because it no longer matches `handles`).
    pub fn register(&mut self, stream_id: u32, at: Instant, handle: CancellationHandle) {
        self.heap.push(Reverse((at, stream_id)));
        self.handles.insert(stream_id, handle);
    }

    /// Drop a stream's deadline tracking, e.g. on stream completion. Leaves
    /// a stale heap entry behind; harmless since `poll_expired` checks
    /// `handles` before acting.
    pub fn remove(&mut self, stream_id: u32) {
        self.handles.remove(&stream_id);
    }

    /// The instant this scheduler next needs to be polled, for a caller to
    /// race against in `tokio::select!` via `tokio::time::sleep_until`.
    pub fn next_wakeup(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse((at, _))| *at)
    }

    /// Pop every deadline that has fired, cancelling its handle and
    /// returning the stream ids so the caller can emit `RST_STREAM`.
    pub fn poll_expired(&mut self) -> Vec<Expired> {
        let now = Instant::now();
        let mut expired = Vec::new();
        while let Some(Reverse((at, stream_id))) = self.heap.peek().copied() {
            if at > now {
                break;
            }
            self.heap.pop();
            if let Some(handle) = self.handles.remove(&stream_id) {
                handle.cancel();
                expired.push(Expired { stream_id });
            }
        }
        expired
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl Default for DeadlineScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{PeerInfo, RequestContext};
    use crate::stream::HeaderList;
    use std::time::Duration;

    fn handle() -> CancellationHandle {
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
        .cancellation_handle()
    }

    #[test]
    fn expired_entries_are_drained_and_cancel_their_handle() {
        let mut scheduler = DeadlineScheduler::new();
        let h = handle();
        scheduler.register(1, Instant::now(), h.clone());
        std::thread::sleep(Duration::from_millis(5));

        let expired = scheduler.poll_expired();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].stream_id, 1);
        assert!(h.is_cancelled());
        assert!(scheduler.is_empty());
    }

    #[test]
    fn future_deadlines_are_not_yet_expired() {
        let mut scheduler = DeadlineScheduler::new();
        scheduler.register(1, Instant::now() + Duration::from_secs(60), handle());
        assert!(scheduler.poll_expired().is_empty());
        assert!(scheduler.next_wakeup().is_some());
    }

    #[test]
    fn removed_stream_does_not_fire() {
        let mut scheduler = DeadlineScheduler::new();
        scheduler.register(1, Instant::now(), handle());
        scheduler.remove(1);
        assert!(scheduler.poll_expired().is_empty());
    }
}
