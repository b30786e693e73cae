//! Per-stream state.

mod state;

pub use state::{StreamEvent, StreamState};

use std::collections::HashMap;

use bytes::BytesMut;

use crate::flow_control::Window;

/// Case-preserved header list with case-insensitive lookup.
#[derive(Debug, Clone, Default)]
pub struct HeaderList {
    entries: Vec<(String, String)>,
}

impl HeaderList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: String, value: String) {
        self.entries.push((name, value));
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, String)> {
        self.entries.iter()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// One HTTP/2 stream's mutable state, owned by the connection's stream table
/// and touched under its short-held mutex.
pub struct Stream {
    pub id: u32,
    pub state: StreamState,
    pub request_headers: HeaderList,
    pub recv_buffer: BytesMut,
    pub send_window: Window,
    pub recv_window: Window,
    pub end_stream_received: bool,
    pub end_stream_sent: bool,
    pub reset: bool,
}

impl Stream {
    pub fn new(id: u32, initial_window_size: u32) -> Self {
        Self {
            id,
            state: StreamState::Idle,
            request_headers: HeaderList::new(),
            recv_buffer: BytesMut::new(),
            send_window: Window::new(initial_window_size),
            recv_window: Window::new(initial_window_size),
            end_stream_received: false,
            end_stream_sent: false,
            reset: false,
        }
    }

    pub fn apply(&mut self, event: StreamEvent) -> Result<(), crate::error::GrpcRuntimeError> {
        self.state = self.state.apply(event)?;
        match event {
            StreamEvent::RecvHeaders { end_stream } | StreamEvent::RecvData { end_stream } => {
                self.end_stream_received |= end_stream;
            }
            StreamEvent::SendHeaders { end_stream } | StreamEvent::SendData { end_stream } => {
                self.end_stream_sent |= end_stream;
            }
            StreamEvent::RecvReset | StreamEvent::SendReset => self.reset = true,
        }
        Ok(())
    }
}

/// The connection's `stream-id → Stream` mapping.
#[derive(Default)]
pub struct StreamTable {
    streams: HashMap<u32, Stream>,
    pub last_peer_stream_id: u32,
}

impl StreamTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: u32) -> Option<&Stream> {
        self.streams.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut Stream> {
        self.streams.get_mut(&id)
    }

    pub fn insert(&mut self, stream: Stream) {
        if stream.id > self.last_peer_stream_id {
            self.last_peer_stream_id = stream.id;
        }
        self.streams.insert(stream.id, stream);
    }

    pub fn remove(&mut self, id: u32) -> Option<Stream> {
        self.streams.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut Stream> {
        self.streams.values_mut()
    }

    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.streams.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_list_lookup_is_case_insensitive() {
        let mut headers = HeaderList::new();
        headers.push("Content-Type".into(), "application/grpc".into());
        assert_eq!(headers.get("content-type"), Some("application/grpc"));
    }

    #[test]
    fn header_list_preserves_multi_value_order() {
        let mut headers = HeaderList::new();
        headers.push("x-tag".into(), "a".into());
        headers.push("x-tag".into(), "b".into());
        let values: Vec<_> = headers.get_all("x-tag").collect();
        assert_eq!(values, vec!["a", "b"]);
    }

    #[test]
    fn stream_table_tracks_highest_peer_id() {
        let mut table = StreamTable::new();
        table.insert(Stream::new(1, 65_535));
        table.insert(Stream::new(3, 65_535));
        assert_eq!(table.last_peer_stream_id, 3);
        assert_eq!(table.len(), 2);
    }
}
