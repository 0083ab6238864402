//! SETTINGS frames.

use bytes::BufMut;

use super::{Error, Head, Kind, StreamId, flags, unpack_octets_as_u32};

const HEADER_TABLE_SIZE: u16 = 1;
const ENABLE_PUSH: u16 = 2;
const MAX_CONCURRENT_STREAMS: u16 = 3;
const INITIAL_WINDOW_SIZE: u16 = 4;
const MAX_FRAME_SIZE: u16 = 5;
const MAX_HEADER_LIST_SIZE: u16 = 6;

/// A SETTINGS frame, or the raw settings payload of an h2c upgrade token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    ack: bool,
    pub header_table_size: Option<u32>,
    pub enable_push: Option<bool>,
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: Option<u32>,
    pub max_frame_size: Option<u32>,
    pub max_header_list_size: Option<u32>,
}

// ===== impl Settings =====

impl Settings {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn ack() -> Self {
        Self {
            ack: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_ack(&self) -> bool {
        self.ack
    }

    /// Builds a `Settings` frame from a raw frame.
    pub fn load(head: Head, payload: &[u8]) -> Result<Self, Error> {
        debug_assert_eq!(head.kind(), Kind::Settings);
        if !head.stream_id().is_zero() {
            return Err(Error::InvalidStreamId);
        }
        if head.flag() & flags::ACK == flags::ACK {
            if payload.is_empty() {
                return Ok(Self::ack());
            }
            return Err(Error::InvalidPayloadAckSettings);
        }
        let mut settings = Self::from_payload(payload)?;
        settings.ack = false;
        Ok(settings)
    }

    /// Parse a bare settings payload: `(identifier, value)` pairs of six
    /// octets each. Also the wire format of the `HTTP2-Settings` header.
    pub fn from_payload(payload: &[u8]) -> Result<Self, Error> {
        if payload.len() % 6 != 0 {
            return Err(Error::BadFrameSize);
        }
        let mut settings = Self::new();
        for chunk in payload.chunks(6) {
            let id = u16::from_be_bytes([chunk[0], chunk[1]]);
            let value = unpack_octets_as_u32(chunk, 2);
            match id {
                HEADER_TABLE_SIZE => settings.header_table_size = Some(value),
                ENABLE_PUSH => match value {
                    0 => settings.enable_push = Some(false),
                    1 => settings.enable_push = Some(true),
                    _ => return Err(Error::InvalidSettingValue),
                },
                MAX_CONCURRENT_STREAMS => settings.max_concurrent_streams = Some(value),
                INITIAL_WINDOW_SIZE => {
                    if value > StreamId::MAX.into() {
                        return Err(Error::InvalidSettingValue);
                    }
                    settings.initial_window_size = Some(value);
                }
                MAX_FRAME_SIZE => {
                    if !(super::DEFAULT_MAX_FRAME_SIZE..=super::MAX_MAX_FRAME_SIZE)
                        .contains(&value)
                    {
                        return Err(Error::InvalidSettingValue);
                    }
                    settings.max_frame_size = Some(value);
                }
                MAX_HEADER_LIST_SIZE => settings.max_header_list_size = Some(value),
                // unknown settings must be ignored
                _ => {}
            }
        }
        Ok(settings)
    }

    pub fn encode<B: BufMut>(&self, dst: &mut B) {
        let payload_len = self.pairs().len() * 6;
        tracing::trace!("encoding SETTINGS; len={payload_len}");
        let flag = if self.ack { flags::ACK } else { 0 };
        Head::new(Kind::Settings, flag, StreamId::ZERO).encode(payload_len, dst);
        for (id, value) in self.pairs() {
            dst.put_u16(id);
            dst.put_u32(value);
        }
    }

    fn pairs(&self) -> Vec<(u16, u32)> {
        let mut pairs = Vec::new();
        if let Some(v) = self.header_table_size {
            pairs.push((HEADER_TABLE_SIZE, v));
        }
        if let Some(v) = self.enable_push {
            pairs.push((ENABLE_PUSH, u32::from(v)));
        }
        if let Some(v) = self.max_concurrent_streams {
            pairs.push((MAX_CONCURRENT_STREAMS, v));
        }
        if let Some(v) = self.initial_window_size {
            pairs.push((INITIAL_WINDOW_SIZE, v));
        }
        if let Some(v) = self.max_frame_size {
            pairs.push((MAX_FRAME_SIZE, v));
        }
        if let Some(v) = self.max_header_list_size {
            pairs.push((MAX_HEADER_LIST_SIZE, v));
        }
        pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn round_trip() {
        let mut settings = Settings::new();
        settings.enable_push = Some(false);
        settings.initial_window_size = Some(1024);
        settings.max_concurrent_streams = Some(100);

        let mut buf = BytesMut::new();
        settings.encode(&mut buf);
        let (head, len) = Head::parse(&buf);
        assert_eq!(len, buf.len() - super::super::HEADER_LEN);
        let loaded = Settings::load(head, &buf[super::super::HEADER_LEN..]).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn ack_round_trip() {
        let mut buf = BytesMut::new();
        Settings::ack().encode(&mut buf);
        let (head, len) = Head::parse(&buf);
        assert_eq!(len, 0);
        assert!(Settings::load(head, &[]).unwrap().is_ack());
        assert_eq!(head.flag() & flags::ACK, flags::ACK);
    }

    #[test]
    fn rejects_bad_push_value() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&2u16.to_be_bytes());
        payload.extend_from_slice(&7u32.to_be_bytes());
        assert_eq!(
            Settings::from_payload(&payload),
            Err(Error::InvalidSettingValue)
        );
    }

    #[test]
    fn unknown_settings_are_ignored() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&0xffu16.to_be_bytes());
        payload.extend_from_slice(&1u32.to_be_bytes());
        assert_eq!(Settings::from_payload(&payload).unwrap(), Settings::new());
    }

    #[test]
    fn rejects_ragged_payload() {
        assert_eq!(Settings::from_payload(&[0, 4, 0]), Err(Error::BadFrameSize));
    }
}
