//! HEADERS / CONTINUATION / PUSH_PROMISE / DATA payload helpers.
//!
//! The header block itself is opaque HPACK here; these helpers only deal
//! with the framing around it: padding, the optional priority prefix, and
//! splitting oversized blocks across continuation frames.

use bytes::{BufMut, Bytes, BytesMut};

use super::{Error, HEADER_LEN, Head, Kind, StreamId, flags};

/// Locate the header block inside a HEADERS payload, skipping the pad
/// length octet and the priority fields when their flags are set.
pub fn header_block_range(payload: &[u8], flag: u8) -> Result<(usize, usize), Error> {
    let mut start = 0;
    let mut end = payload.len();
    if flag & flags::PADDED == flags::PADDED {
        if payload.is_empty() {
            return Err(Error::BadFrameSize);
        }
        let pad = payload[0] as usize;
        if pad >= payload.len() {
            return Err(Error::TooMuchPadding);
        }
        start += 1;
        end -= pad;
    }
    if flag & flags::PRIORITY == flags::PRIORITY {
        start += 5;
    }
    if start > end {
        return Err(Error::BadFrameSize);
    }
    Ok((start, end))
}

/// Strip the padding of a DATA payload.
pub fn strip_data_padding(payload: &[u8], flag: u8) -> Result<&[u8], Error> {
    if flag & flags::PADDED == flags::PADDED {
        if payload.is_empty() {
            return Err(Error::BadFrameSize);
        }
        let pad = payload[0] as usize;
        if pad >= payload.len() {
            return Err(Error::TooMuchPadding);
        }
        Ok(&payload[1..payload.len() - pad])
    } else {
        Ok(payload)
    }
}

/// Encode a header block as one HEADERS frame, spilling into CONTINUATION
/// frames when it exceeds the peer's maximum frame size.
#[must_use]
pub fn encode_headers_frames(
    stream_id: StreamId,
    block: &[u8],
    end_stream: bool,
    max_frame_size: usize,
) -> Vec<Bytes> {
    let stream_flag = if end_stream { flags::END_STREAM } else { 0 };
    encode_block(Kind::Headers, stream_id, stream_flag, &[], block, max_frame_size)
}

/// Encode a PUSH_PROMISE (promised stream id + header block), spilling into
/// CONTINUATION frames when oversized.
#[must_use]
pub fn encode_push_promise_frames(
    stream_id: StreamId,
    promised_id: StreamId,
    block: &[u8],
    max_frame_size: usize,
) -> Vec<Bytes> {
    let promised = u32::from(promised_id).to_be_bytes();
    encode_block(Kind::PushPromise, stream_id, 0, &promised, block, max_frame_size)
}

fn encode_block(
    kind: Kind,
    stream_id: StreamId,
    first_flag: u8,
    prefix: &[u8],
    block: &[u8],
    max_frame_size: usize,
) -> Vec<Bytes> {
    tracing::trace!("encoding {kind:?}; id={stream_id}; block={}", block.len());
    let mut frames = Vec::new();
    let first_budget = max_frame_size.saturating_sub(prefix.len()).max(1);
    let first_len = block.len().min(first_budget);
    let (first, mut rest) = block.split_at(first_len);

    let mut flag = first_flag;
    if rest.is_empty() {
        flag |= flags::END_HEADERS;
    }
    let mut buf = BytesMut::with_capacity(HEADER_LEN + prefix.len() + first.len());
    Head::new(kind, flag, stream_id).encode(prefix.len() + first.len(), &mut buf);
    buf.put_slice(prefix);
    buf.put_slice(first);
    frames.push(buf.freeze());

    while !rest.is_empty() {
        let len = rest.len().min(max_frame_size);
        let (chunk, tail) = rest.split_at(len);
        rest = tail;
        let flag = if rest.is_empty() { flags::END_HEADERS } else { 0 };
        let mut buf = BytesMut::with_capacity(HEADER_LEN + chunk.len());
        Head::new(Kind::Continuation, flag, stream_id).encode(chunk.len(), &mut buf);
        buf.put_slice(chunk);
        frames.push(buf.freeze());
    }
    frames
}

/// Encode one DATA frame.
#[must_use]
pub fn encode_data(stream_id: StreamId, payload: &[u8], end_stream: bool) -> Bytes {
    let flag = if end_stream { flags::END_STREAM } else { 0 };
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    Head::new(Kind::Data, flag, stream_id).encode(payload.len(), &mut buf);
    buf.put_slice(payload);
    buf.freeze()
}
