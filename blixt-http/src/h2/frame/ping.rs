//! PING frames.

use bytes::BufMut;

use super::{Error, Head, Kind, StreamId, flags};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Ping {
    ack: bool,
    payload: [u8; 8],
}

// ===== impl Ping =====

impl Ping {
    #[must_use]
    pub fn pong(payload: [u8; 8]) -> Self {
        Self { ack: true, payload }
    }

    #[must_use]
    pub fn is_ack(&self) -> bool {
        self.ack
    }

    #[must_use]
    pub fn payload(&self) -> &[u8; 8] {
        &self.payload
    }

    pub fn load(head: Head, payload: &[u8]) -> Result<Self, Error> {
        debug_assert_eq!(head.kind(), Kind::Ping);
        if !head.stream_id().is_zero() {
            return Err(Error::InvalidStreamId);
        }
        if payload.len() != 8 {
            return Err(Error::BadFrameSize);
        }
        let mut bytes = [0; 8];
        bytes.copy_from_slice(payload);
        Ok(Self {
            ack: head.flag() & flags::ACK == flags::ACK,
            payload: bytes,
        })
    }

    pub fn encode<B: BufMut>(&self, dst: &mut B) {
        tracing::trace!("encoding PING; ack={}", self.ack);
        let flag = if self.ack { flags::ACK } else { 0 };
        Head::new(Kind::Ping, flag, StreamId::ZERO).encode(8, dst);
        dst.put_slice(&self.payload);
    }
}
