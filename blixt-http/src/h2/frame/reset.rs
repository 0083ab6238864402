//! RST_STREAM frames.

use bytes::BufMut;

use super::{Error, Head, Kind, Reason, StreamId, unpack_octets_as_u32};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Reset {
    pub stream_id: StreamId,
    pub error_code: Reason,
}

// ===== impl Reset =====

impl Reset {
    #[must_use]
    pub fn new(stream_id: StreamId, error: Reason) -> Self {
        Self {
            stream_id,
            error_code: error,
        }
    }

    pub fn load(head: Head, payload: &[u8]) -> Result<Self, Error> {
        debug_assert_eq!(head.kind(), Kind::Reset);
        if head.stream_id().is_zero() {
            return Err(Error::InvalidStreamId);
        }
        if payload.len() != 4 {
            return Err(Error::BadFrameSize);
        }
        Ok(Self {
            stream_id: head.stream_id(),
            error_code: unpack_octets_as_u32(payload, 0).into(),
        })
    }

    pub fn encode<B: BufMut>(&self, dst: &mut B) {
        tracing::trace!(
            "encoding RST_STREAM; id={}; reason={}",
            self.stream_id,
            self.error_code
        );
        Head::new(Kind::Reset, 0, self.stream_id).encode(4, dst);
        dst.put_u32(self.error_code.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn round_trip() {
        let mut buf = BytesMut::new();
        Reset::new(StreamId::from(9), Reason::CANCEL).encode(&mut buf);
        let (head, _) = Head::parse(&buf);
        let loaded = Reset::load(head, &buf[super::super::HEADER_LEN..]).unwrap();
        assert_eq!(loaded.stream_id, 9);
        assert_eq!(loaded.error_code, Reason::CANCEL);
    }
}
