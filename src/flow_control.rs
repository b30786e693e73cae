//! Flow control windows: connection-scope and stream-scope
//! send/receive accounting, WINDOW_UPDATE emission policy.

use crate::error::GrpcRuntimeError;
use crate::frame::Http2ErrorCode;

pub const MAX_WINDOW_SIZE: i64 = (1i64 << 31) - 1;

/// One side (send or receive) of a flow-control window, shared shape for
/// both connection and stream scope.
#[derive(Debug, Clone, Copy)]
pub struct Window {
    size: i64,
    initial: u32,
    /// Bytes consumed on the receive side but not yet acknowledged with a
    /// WINDOW_UPDATE; unused for send windows.
    pending_consumed: u32,
}

impl Window {
    pub fn new(initial: u32) -> Self {
        Self {
            size: initial as i64,
            initial,
            pending_consumed: 0,
        }
    }

    pub fn available(&self) -> i64 {
        self.size
    }

    /// Apply a WINDOW_UPDATE increment.
    pub fn apply_increment(&mut self, increment: u32) -> Result<(), GrpcRuntimeError> {
        if increment == 0 {
            return Err(GrpcRuntimeError::StreamProtocol(
                Http2ErrorCode::ProtocolError,
                "WINDOW_UPDATE increment must not be zero".into(),
            ));
        }
        let new_size = self.size + increment as i64;
        if new_size > MAX_WINDOW_SIZE {
            return Err(GrpcRuntimeError::StreamProtocol(
                Http2ErrorCode::FlowControlError,
                "window increment overflows 2^31-1".into(),
            ));
        }
        self.size = new_size;
        Ok(())
    }

    /// Reserve `amount` bytes for an outgoing DATA frame; caller must have
    /// already checked `available() >= amount`.
    pub fn consume_send(&mut self, amount: u32) {
        self.size -= amount as i64;
    }

    /// Account for `amount` bytes of incoming DATA.
    pub fn consume_recv(&mut self, amount: u32) {
        self.size -= amount as i64;
        self.pending_consumed += amount;
    }

    /// SETTINGS_INITIAL_WINDOW_SIZE changed from `old` to `new`: adjust this
    /// window's *send* side by the delta; may go negative.
    pub fn adjust_initial(&mut self, new_initial: u32) {
        let delta = new_initial as i64 - self.initial as i64;
        self.size += delta;
        self.initial = new_initial;
    }

    /// Whether pending-but-unacknowledged consumption has crossed the
    /// 50%-of-initial threshold that triggers a WINDOW_UPDATE.
    pub fn should_emit_window_update(&self) -> bool {
        self.pending_consumed as u64 >= (self.initial as u64) / 2
    }

    /// Take the pending increment to send in a WINDOW_UPDATE frame, resetting
    /// the counter. Also restores `size` by the same amount, since the
    /// increment is what the peer will now be allowed to send again.
    pub fn take_window_update(&mut self) -> u32 {
        let increment = self.pending_consumed;
        self.pending_consumed = 0;
        self.size += increment as i64;
        increment
    }
}

/// Per-connection and (owned externally) per-stream flow control state.
#[derive(Debug, Clone)]
pub struct FlowController {
    pub conn_send: Window,
    pub conn_recv: Window,
}

impl FlowController {
    pub fn new(initial_window_size: u32) -> Self {
        Self {
            conn_send: Window::new(initial_window_size),
            conn_recv: Window::new(initial_window_size),
        }
    }

    /// How many bytes of `requested` may be sent right now on a stream whose
    /// own send window is `stream_available`, respecting both the connection
    /// window and `max_frame_size`.
    pub fn sendable_now(&self, requested: u32, stream_available: i64, max_frame_size: u32) -> u32 {
        let conn_available = self.conn_send.available().max(0) as u64;
        let stream_available = stream_available.max(0) as u64;
        let cap = conn_available.min(stream_available).min(max_frame_size as u64);
        cap.min(requested as u64) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consume_and_increment_round_trip() {
        let mut window = Window::new(65_535);
        window.consume_send(60_000);
        assert_eq!(window.available(), 5_535);
        window.apply_increment(60_000).unwrap();
        assert_eq!(window.available(), 65_535);
    }

    #[test]
    fn zero_increment_is_protocol_error() {
        let mut window = Window::new(65_535);
        assert!(window.apply_increment(0).is_err());
    }

    #[test]
    fn overflow_increment_is_flow_control_error() {
        let mut window = Window::new(65_535);
        assert!(window.apply_increment(u32::MAX).is_err());
    }

    #[test]
    fn initial_window_resize_may_go_negative() {
        let mut window = Window::new(65_535);
        window.consume_send(65_535);
        assert_eq!(window.available(), 0);
        window.adjust_initial(1_000);
        assert_eq!(window.available(), 1_000 - 65_535);
    }

    #[test]
    fn window_update_threshold_and_take() {
        let mut window = Window::new(65_535);
        window.consume_recv(30_000);
        assert!(!window.should_emit_window_update());
        window.consume_recv(3_000);
        assert!(window.should_emit_window_update());
        let before = window.available();
        let increment = window.take_window_update();
        assert_eq!(increment, 33_000);
        assert_eq!(window.available(), before + 33_000);
        assert!(!window.should_emit_window_update());
    }

    #[test]
    fn sendable_now_is_bounded_by_all_three_limits() {
        let controller = FlowController::new(65_535);
        assert_eq!(controller.sendable_now(200_000, 50_000, 16_384), 16_384);
        assert_eq!(controller.sendable_now(200_000, 10_000, 16_384), 10_000);
        assert_eq!(controller.sendable_now(5_000, 50_000, 16_384), 5_000);
    }
}
