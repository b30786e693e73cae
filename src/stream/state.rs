//! Per-stream state machine. Server view only — inbound
//! streams never enter RESERVED_* since this runtime never initiates
//! server push.

use crate::error::GrpcRuntimeError;
use crate::frame::Http2ErrorCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    RecvHeaders { end_stream: bool },
    RecvData { end_stream: bool },
    SendHeaders { end_stream: bool },
    SendData { end_stream: bool },
    RecvReset,
    SendReset,
}

impl StreamState {
    /// Apply `event`, returning the new state or a stream-scope protocol
    /// error.
    pub fn apply(self, event: StreamEvent) -> Result<Self, GrpcRuntimeError> {
        use StreamEvent::*;
        use StreamState::*;

        match (self, event) {
            (_, RecvReset) | (_, SendReset) => Ok(Closed),

            (Idle, RecvHeaders { end_stream: false }) => Ok(Open),
            (Idle, RecvHeaders { end_stream: true }) => Ok(HalfClosedRemote),

            (Open, RecvHeaders { end_stream: true }) | (Open, RecvData { end_stream: true }) => {
                Ok(HalfClosedRemote)
            }
            (Open, RecvHeaders { end_stream: false }) | (Open, RecvData { end_stream: false }) => {
                Ok(Open)
            }
            (Open, SendHeaders { end_stream: true }) | (Open, SendData { end_stream: true }) => {
                Ok(HalfClosedLocal)
            }
            (Open, SendHeaders { end_stream: false }) | (Open, SendData { end_stream: false }) => {
                Ok(Open)
            }

            (HalfClosedRemote, SendHeaders { end_stream: true })
            | (HalfClosedRemote, SendData { end_stream: true }) => Ok(Closed),
            (HalfClosedRemote, SendHeaders { end_stream: false })
            | (HalfClosedRemote, SendData { end_stream: false }) => Ok(HalfClosedRemote),

            (HalfClosedLocal, RecvHeaders { end_stream: true })
            | (HalfClosedLocal, RecvData { end_stream: true }) => Ok(Closed),
            (HalfClosedLocal, RecvHeaders { end_stream: false })
            | (HalfClosedLocal, RecvData { end_stream: false }) => Ok(HalfClosedLocal),

            // Receiving DATA while IDLE or already HALF_CLOSED_REMOTE is
            // STREAM_CLOSED: a stream error, answered with RST_STREAM.
            (Idle, RecvData { .. }) | (HalfClosedRemote, RecvData { .. }) => {
                Err(GrpcRuntimeError::StreamProtocol(
                    Http2ErrorCode::StreamClosed,
                    "DATA received on a stream not open for receiving".into(),
                ))
            }

            (HalfClosedLocal, SendHeaders { .. }) | (HalfClosedLocal, SendData { .. }) => {
                Err(GrpcRuntimeError::StreamProtocol(
                    Http2ErrorCode::InternalError,
                    "attempted to send on a half-closed-local stream".into(),
                ))
            }
            (Closed, SendHeaders { .. }) | (Closed, SendData { .. }) => {
                Err(GrpcRuntimeError::StreamProtocol(
                    Http2ErrorCode::InternalError,
                    "attempted to send on a closed stream".into(),
                ))
            }
            (Closed, RecvHeaders { .. }) | (Closed, RecvData { .. }) => {
                Err(GrpcRuntimeError::StreamProtocol(
                    Http2ErrorCode::StreamClosed,
                    "frame received on a closed stream".into(),
                ))
            }
        }
    }

    pub fn is_closed(self) -> bool {
        matches!(self, StreamState::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use StreamEvent::*;
    use StreamState::*;

    #[test]
    fn idle_to_open_without_end_stream() {
        assert_eq!(Idle.apply(RecvHeaders { end_stream: false }).unwrap(), Open);
    }

    #[test]
    fn idle_to_half_closed_remote_with_end_stream() {
        assert_eq!(
            Idle.apply(RecvHeaders { end_stream: true }).unwrap(),
            HalfClosedRemote
        );
    }

    #[test]
    fn full_request_response_cycle() {
        let state = Idle.apply(RecvHeaders { end_stream: false }).unwrap();
        assert_eq!(state, Open);
        let state = state.apply(RecvData { end_stream: true }).unwrap();
        assert_eq!(state, HalfClosedRemote);
        let state = state.apply(SendHeaders { end_stream: false }).unwrap();
        assert_eq!(state, HalfClosedRemote);
        let state = state.apply(SendData { end_stream: true }).unwrap();
        assert_eq!(state, Closed);
        assert!(state.is_closed());
    }

    #[test]
    fn reset_from_any_non_closed_state_closes() {
        assert_eq!(Open.apply(RecvReset).unwrap(), Closed);
        assert_eq!(HalfClosedLocal.apply(SendReset).unwrap(), Closed);
    }

    #[test]
    fn data_on_idle_is_stream_closed_error() {
        assert!(Idle.apply(RecvData { end_stream: false }).is_err());
    }

    #[test]
    fn data_on_half_closed_remote_is_stream_closed_error() {
        assert!(HalfClosedRemote
            .apply(RecvData { end_stream: false })
            .is_err());
    }

    #[test]
    fn send_on_half_closed_local_is_programming_error() {
        assert!(HalfClosedLocal
            .apply(SendData { end_stream: false })
            .is_err());
    }

    #[test]
    fn send_on_closed_is_programming_error() {
        assert!(Closed.apply(SendHeaders { end_stream: true }).is_err());
    }
}
