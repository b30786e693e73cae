use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::FrameError;

pub const DEFAULT_SETTINGS_HEADER_TABLE_SIZE: u32 = 4096;
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65_535;
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;
pub const MAX_MAX_FRAME_SIZE: u32 = 16_777_215;

/// SETTINGS identifiers (RFC 7540 §6.5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setting {
    HeaderTableSize(u32),
    EnablePush(bool),
    MaxConcurrentStreams(u32),
    InitialWindowSize(u32),
    MaxFrameSize(u32),
    MaxHeaderListSize(u32),
    Unknown(u16, u32),
}

impl Setting {
    fn id(&self) -> u16 {
        match self {
            Self::HeaderTableSize(_) => 0x1,
            Self::EnablePush(_) => 0x2,
            Self::MaxConcurrentStreams(_) => 0x3,
            Self::InitialWindowSize(_) => 0x4,
            Self::MaxFrameSize(_) => 0x5,
            Self::MaxHeaderListSize(_) => 0x6,
            Self::Unknown(id, _) => *id,
        }
    }

    fn value(&self) -> u32 {
        match self {
            Self::HeaderTableSize(v)
            | Self::MaxConcurrentStreams(v)
            | Self::InitialWindowSize(v)
            | Self::MaxFrameSize(v)
            | Self::MaxHeaderListSize(v)
            | Self::Unknown(_, v) => *v,
            Self::EnablePush(b) => *b as u32,
        }
    }

    fn decode_one(id: u16, value: u32) -> Self {
        match id {
            0x1 => Self::HeaderTableSize(value),
            0x2 => Self::EnablePush(value != 0),
            0x3 => Self::MaxConcurrentStreams(value),
            0x4 => Self::InitialWindowSize(value),
            0x5 => Self::MaxFrameSize(value),
            0x6 => Self::MaxHeaderListSize(value),
            other => Self::Unknown(other, value),
        }
    }
}

/// A SETTINGS frame payload: an ordered sequence of (id, value) pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsFrame {
    pub settings: Vec<Setting>,
}

impl SettingsFrame {
    pub fn new(settings: Vec<Setting>) -> Self {
        Self { settings }
    }

    pub fn decode(payload: &[u8]) -> Result<Self, FrameError> {
        if payload.len() % 6 != 0 {
            return Err(FrameError::FrameSizeError);
        }
        let mut settings = Vec::with_capacity(payload.len() / 6);
        let mut buf = payload;
        while buf.has_remaining() {
            let id = buf.get_u16();
            let value = buf.get_u32();
            settings.push(Setting::decode_one(id, value));
        }
        Ok(Self { settings })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.settings.len() * 6);
        for setting in &self.settings {
            buf.put_u16(setting.id());
            buf.put_u32(setting.value());
        }
        buf.freeze()
    }
}

/// Our default local settings, advertised first on every new connection.
pub fn default_local_settings() -> SettingsFrame {
    SettingsFrame::new(vec![
        Setting::HeaderTableSize(DEFAULT_SETTINGS_HEADER_TABLE_SIZE),
        Setting::EnablePush(false),
        Setting::MaxConcurrentStreams(100),
        Setting::InitialWindowSize(DEFAULT_INITIAL_WINDOW_SIZE),
        Setting::MaxFrameSize(DEFAULT_MAX_FRAME_SIZE),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_round_trip() {
        let frame = SettingsFrame::new(vec![
            Setting::HeaderTableSize(4096),
            Setting::InitialWindowSize(65535),
            Setting::MaxFrameSize(16384),
        ]);
        let encoded = frame.encode();
        let decoded = SettingsFrame::decode(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn settings_bad_length() {
        assert!(SettingsFrame::decode(&[0u8; 5]).is_err());
    }
}
