//! Stream adapters exposed to handlers. Explicit channels/queues per
//! stream rather than injected send/close callables, so cancellation is
//! just closing the queue.

use tokio::sync::mpsc;

use crate::context::CancellationHandle;
use crate::status::Status;

/// Error surfaced by a suspended send/receive operation.
#[derive(Debug, Clone)]
pub enum StreamError {
    Cancelled,
    Closed,
}

impl From<StreamError> for Status {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Cancelled => Status::cancelled("stream was cancelled"),
            StreamError::Closed => Status::internal("stream channel closed unexpectedly"),
        }
    }
}

/// Handler-facing outbound channel for server-streaming and bidi-streaming
/// RPCs. `send` suspends when the bounded channel (backed by HTTP/2 flow
/// control on the writer side) is full. Cheaply cloneable, like the
/// underlying `mpsc::Sender`.
#[derive(Clone)]
pub struct Sender<T> {
    inner: mpsc::Sender<T>,
    cancellation: CancellationHandle,
}

impl<T> Sender<T> {
    pub fn new(inner: mpsc::Sender<T>, cancellation: CancellationHandle) -> Self {
        Self { inner, cancellation }
    }

    pub async fn send(&self, message: T) -> Result<(), StreamError> {
        if self.cancellation.is_cancelled() {
            return Err(StreamError::Cancelled);
        }
        self.inner.send(message).await.map_err(|_| StreamError::Closed)
    }

    pub fn cancellation(&self) -> CancellationHandle {
        self.cancellation.clone()
    }
}

/// Handler-facing inbound channel for client-streaming and bidi-streaming
/// RPCs.
pub struct Receiver<T> {
    inner: mpsc::Receiver<T>,
    cancellation: CancellationHandle,
}

impl<T> Receiver<T> {
    pub fn new(inner: mpsc::Receiver<T>, cancellation: CancellationHandle) -> Self {
        Self { inner, cancellation }
    }

    /// Yields the next message, `Ok(None)` on a clean end-of-stream, or a
    /// cancellation error if the stream was reset.
    pub async fn next(&mut self) -> Result<Option<T>, StreamError> {
        if self.cancellation.is_cancelled() {
            return Err(StreamError::Cancelled);
        }
        Ok(self.inner.recv().await)
    }

    pub fn cancellation(&self) -> CancellationHandle {
        self.cancellation.clone()
    }
}

/// Construct a bounded sender/receiver pair sized by the stream's receive
/// window.
pub fn channel<T>(capacity: usize, cancellation: CancellationHandle) -> (Sender<T>, Receiver<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        Sender::new(tx, cancellation.clone()),
        Receiver::new(rx, cancellation),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RequestContext;
    use crate::stream::HeaderList;

    fn test_cancellation() -> CancellationHandle {
        let ctx = RequestContext::new(
            "/test.Greeter/Hello".into(),
            "localhost".into(),
            crate::context::PeerInfo {
                address: "127.0.0.1".parse().unwrap(),
                port: 1234,
                certificate: None,
            },
            HeaderList::new(),
            None,
        );
        ctx.cancellation_handle()
    }

    #[tokio::test]
    async fn send_then_receive_round_trips() {
        let (tx, mut rx) = channel::<i32>(4, test_cancellation());
        tx.send(42).await.unwrap();
        assert_eq!(rx.next().await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn closed_sender_yields_clean_eof() {
        let (tx, mut rx) = channel::<i32>(4, test_cancellation());
        drop(tx);
        assert_eq!(rx.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn cancellation_short_circuits_send_and_receive() {
        let cancellation = test_cancellation();
        let (tx, mut rx) = channel::<i32>(4, cancellation.clone());
        cancellation.cancel();
        assert!(matches!(tx.send(1).await, Err(StreamError::Cancelled)));
        assert!(matches!(rx.next().await, Err(StreamError::Cancelled)));
    }
}
