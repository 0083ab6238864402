//! WINDOW_UPDATE frames.

use bytes::BufMut;

use super::{Error, Head, Kind, StreamId, unpack_octets_as_u32};

const SIZE_INCREMENT_MASK: u32 = 1 << 31;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct WindowUpdate {
    pub stream_id: StreamId,
    pub size_increment: u32,
}

// ===== impl WindowUpdate =====

impl WindowUpdate {
    #[must_use]
    pub fn new(stream_id: StreamId, size_increment: u32) -> Self {
        Self {
            stream_id,
            size_increment,
        }
    }

    /// Builds a `WindowUpdate` frame from a raw frame.
    pub fn load(head: Head, payload: &[u8]) -> Result<Self, Error> {
        debug_assert_eq!(head.kind(), Kind::WindowUpdate);
        if payload.len() != 4 {
            return Err(Error::BadFrameSize);
        }

        // Clear the most significant bit, as that is reserved and MUST be
        // ignored when received.
        let size_increment = unpack_octets_as_u32(payload, 0) & !SIZE_INCREMENT_MASK;
        if size_increment == 0 {
            return Err(Error::InvalidWindowUpdateValue);
        }

        Ok(Self {
            stream_id: head.stream_id(),
            size_increment,
        })
    }

    pub fn encode<B: BufMut>(&self, dst: &mut B) {
        tracing::trace!("encoding WINDOW_UPDATE; id={}", self.stream_id);
        Head::new(Kind::WindowUpdate, 0, self.stream_id).encode(4, dst);
        dst.put_u32(self.size_increment);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn round_trip() {
        let mut buf = BytesMut::new();
        WindowUpdate::new(StreamId::from(3), 4096).encode(&mut buf);
        let (head, _) = Head::parse(&buf);
        let loaded = WindowUpdate::load(head, &buf[super::super::HEADER_LEN..]).unwrap();
        assert_eq!(loaded.stream_id, 3);
        assert_eq!(loaded.size_increment, 4096);
    }

    #[test]
    fn zero_increment_is_invalid() {
        let mut buf = BytesMut::new();
        Head::new(Kind::WindowUpdate, 0, StreamId::ZERO).encode(4, &mut buf);
        let (head, _) = Head::parse(&buf);
        assert_eq!(
            WindowUpdate::load(head, &[0; 4]),
            Err(Error::InvalidWindowUpdateValue)
        );
    }
}
