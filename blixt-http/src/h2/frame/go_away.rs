//! GOAWAY frames.

use bytes::{BufMut, Bytes};

use super::{Error, Head, Kind, Reason, StreamId, unpack_octets_as_u32};

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct GoAway {
    last_stream_id: StreamId,
    error_code: Reason,
    debug_data: Bytes,
}

// ===== impl GoAway =====

impl GoAway {
    #[must_use]
    pub fn new(last_stream_id: StreamId, reason: Reason) -> Self {
        Self {
            last_stream_id,
            error_code: reason,
            debug_data: Bytes::new(),
        }
    }

    #[must_use]
    pub fn last_stream_id(&self) -> StreamId {
        self.last_stream_id
    }

    #[must_use]
    pub fn reason(&self) -> Reason {
        self.error_code
    }

    pub fn load(payload: &[u8]) -> Result<Self, Error> {
        if payload.len() < 8 {
            return Err(Error::BadFrameSize);
        }
        let (last_stream_id, _) = StreamId::parse(&payload[..4]);
        let error_code = unpack_octets_as_u32(payload, 4);
        let debug_data = Bytes::copy_from_slice(&payload[8..]);
        Ok(Self {
            last_stream_id,
            error_code: error_code.into(),
            debug_data,
        })
    }

    pub fn encode<B: BufMut>(&self, dst: &mut B) {
        tracing::trace!("encoding GO_AWAY; code={}", self.error_code);
        Head::new(Kind::GoAway, 0, StreamId::ZERO).encode(8 + self.debug_data.len(), dst);
        dst.put_u32(self.last_stream_id.into());
        dst.put_u32(self.error_code.into());
        dst.put(self.debug_data.slice(..));
    }
}
