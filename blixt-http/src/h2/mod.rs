//! HTTP/2 parser: a server-side connection state machine over the frame
//! layer in [`frame`], with HPACK handled by the `hpack` crate.
//!
//! Streams initiated by the client are collected into partial requests and
//! emitted on END_STREAM. Responses are serialized respecting the peer's
//! flow-control windows: data that does not fit is parked per stream and
//! flushed when WINDOW_UPDATE frames arrive. Clear-text upgrades
//! (`Upgrade: h2c`) are handled by falling back to an HTTP/1 parse of the
//! first chunk.

use std::collections::HashMap;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bytes::{Buf, Bytes, BytesMut};

use blixt_core::message::{Push, Request, Response};

use crate::h1;
use crate::parser::{Ingest, ParseError, Parser, ProtoError, PushStart};

pub mod frame;


use frame::{
    DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE, GoAway, HEADER_LEN, Head, Kind, PREFACE,
    Ping, Reason, Reset, Settings, StreamId, WindowUpdate, encode_data, encode_headers_frames,
    encode_push_promise_frames, flags, header_block_range, strip_data_padding,
};

const PROTOCOL_H2: &[u8] = b"HTTP/2";

/// How many bytes of the preface must match before a partial first chunk
/// is claimed as HTTP/2 rather than handed to the next candidate.
const PREFACE_CLAIM: usize = 4;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum RecvState {
    /// Nothing seen yet: the first chunk picks preface, h2c upgrade, or
    /// rejection.
    Init,
    /// Bound via h2c upgrade; the client still owes the preface.
    Preface,
    Frames,
}

#[derive(Debug, Default)]
struct PartialStream {
    method: Bytes,
    path: Bytes,
    scheme: Option<Bytes>,
    headers: Vec<(Bytes, Bytes)>,
    body: BytesMut,
}

#[derive(Debug)]
struct SendStream {
    window: i64,
    /// Response data that exceeded the flow-control window, waiting for
    /// WINDOW_UPDATE.
    pending: Option<Bytes>,
    reset: bool,
    done: bool,
}

impl SendStream {
    fn new(window: u32) -> Self {
        Self {
            window: i64::from(window),
            pending: None,
            reset: false,
            done: false,
        }
    }
}

#[derive(Debug)]
struct Continuation {
    stream_id: StreamId,
    end_stream: bool,
    block: BytesMut,
}

/// Server-side HTTP/2 connection state machine behind the sans-io
/// [`Parser`] contract.
pub struct Http2Parser {
    scheme: Bytes,
    state: RecvState,
    buf: BytesMut,
    outbound: BytesMut,
    decoder: hpack::Decoder<'static>,
    encoder: hpack::Encoder<'static>,
    peer_enable_push: bool,
    peer_initial_window: u32,
    peer_max_frame_size: u32,
    conn_window: i64,
    partial: HashMap<StreamId, PartialStream>,
    send: HashMap<StreamId, SendStream>,
    continuation: Option<Continuation>,
    last_stream: StreamId,
    next_promise: u32,
    closing: bool,
}

impl Http2Parser {
    #[must_use]
    pub fn new() -> Self {
        Self::with_scheme("http")
    }

    #[must_use]
    pub fn with_scheme(scheme: impl Into<Bytes>) -> Self {
        Self {
            scheme: scheme.into(),
            state: RecvState::Init,
            buf: BytesMut::new(),
            outbound: BytesMut::new(),
            decoder: hpack::Decoder::new(),
            encoder: hpack::Encoder::new(),
            peer_enable_push: true,
            peer_initial_window: DEFAULT_INITIAL_WINDOW_SIZE,
            peer_max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            conn_window: i64::from(DEFAULT_INITIAL_WINDOW_SIZE),
            partial: HashMap::new(),
            send: HashMap::new(),
            continuation: None,
            last_stream: StreamId::ZERO,
            next_promise: 2,
            closing: false,
        }
    }

    fn goaway(&mut self, reason: Reason, context: &'static str) {
        tracing::debug!(%reason, context, "http/2 connection error");
        GoAway::new(self.last_stream, reason).encode(&mut self.outbound);
        self.closing = true;
    }

    fn apply_peer_settings(&mut self, settings: &Settings) {
        if let Some(enable_push) = settings.enable_push {
            self.peer_enable_push = enable_push;
        }
        if let Some(max_frame_size) = settings.max_frame_size {
            self.peer_max_frame_size = max_frame_size;
        }
        if let Some(initial_window) = settings.initial_window_size {
            // a changed initial window retroactively adjusts every open
            // stream window by the delta (RFC 7540 §6.9.2)
            let delta = i64::from(initial_window) - i64::from(self.peer_initial_window);
            for stream in self.send.values_mut() {
                stream.window += delta;
            }
            self.peer_initial_window = initial_window;
        }
        // header_table_size would resize the encoder's dynamic table; the
        // encoder never grows past the protocol default, so smaller peer
        // tables are the only case and stay within bounds.
    }

    /// Complete the stream: move it out of the partial map and emit the
    /// request.
    fn complete_stream(&mut self, stream_id: StreamId, requests: &mut Vec<Request>) {
        let Some(partial) = self.partial.remove(&stream_id) else {
            return;
        };
        self.send
            .entry(stream_id)
            .or_insert_with(|| SendStream::new(self.peer_initial_window));
        let scheme = partial.scheme.unwrap_or_else(|| self.scheme.clone());
        let request = Request::builder()
            .method(partial.method)
            .path(partial.path)
            .headers(partial.headers)
            .body(partial.body.freeze())
            .stream(stream_id.into())
            .protocol(Bytes::from_static(PROTOCOL_H2))
            .scheme(scheme)
            .build();
        requests.push(request);
    }

    fn begin_stream(
        &mut self,
        stream_id: StreamId,
        block: &[u8],
        end_stream: bool,
        requests: &mut Vec<Request>,
    ) {
        let decoded = match self.decoder.decode(block) {
            Ok(decoded) => decoded,
            Err(err) => {
                tracing::debug!(?err, "hpack decoding failed");
                self.goaway(Reason::COMPRESSION_ERROR, "header block");
                return;
            }
        };
        if self.partial.contains_key(&stream_id) {
            // trailers; nothing in them is interesting to this framework,
            // but END_STREAM still completes the request
            if end_stream {
                self.complete_stream(stream_id, requests);
            }
            return;
        }
        let mut partial = PartialStream {
            method: Bytes::from_static(b"GET"),
            path: Bytes::from_static(b"/"),
            ..PartialStream::default()
        };
        for (name, value) in decoded {
            match name.as_slice() {
                b":method" => partial.method = Bytes::from(value),
                b":path" => partial.path = Bytes::from(value),
                b":scheme" => partial.scheme = Some(Bytes::from(value)),
                b":authority" => partial
                    .headers
                    .push((Bytes::from_static(b"host"), Bytes::from(value))),
                name if name.starts_with(b":") => {}
                _ => partial.headers.push((Bytes::from(name), Bytes::from(value))),
            }
        }
        if stream_id > self.last_stream {
            self.last_stream = stream_id;
        }
        self.partial.insert(stream_id, partial);
        if end_stream {
            self.complete_stream(stream_id, requests);
        }
    }

    /// Drain parked response data for every stream the current windows
    /// allow. Newly writable frames go into the outbound buffer.
    fn flush_pending(&mut self) {
        let mut stream_ids: Vec<StreamId> = self
            .send
            .iter()
            .filter(|(_, s)| s.pending.is_some() && !s.reset)
            .map(|(id, _)| *id)
            .collect();
        stream_ids.sort_unstable();
        for stream_id in stream_ids {
            let max_frame = self.peer_max_frame_size as usize;
            let Some(stream) = self.send.get_mut(&stream_id) else {
                continue;
            };
            let Some(mut remaining) = stream.pending.take() else {
                continue;
            };
            while !remaining.is_empty() {
                let allowed = stream
                    .window
                    .min(self.conn_window)
                    .min(max_frame as i64);
                if allowed <= 0 {
                    stream.pending = Some(remaining);
                    break;
                }
                let take = remaining.len().min(allowed as usize);
                let chunk = remaining.split_to(take);
                stream.window -= take as i64;
                self.conn_window -= take as i64;
                let end = remaining.is_empty();
                self.outbound
                    .extend_from_slice(&encode_data(stream_id, &chunk, end));
                if end {
                    stream.done = true;
                }
            }
        }
    }

    fn process_frames(&mut self, requests: &mut Vec<Request>) {
        while !self.closing {
            if self.buf.len() < HEADER_LEN {
                break;
            }
            let (head, payload_len) = Head::parse(&self.buf);
            if payload_len > DEFAULT_MAX_FRAME_SIZE as usize {
                self.goaway(Reason::FRAME_SIZE_ERROR, "oversized frame");
                break;
            }
            if self.buf.len() < HEADER_LEN + payload_len {
                break;
            }
            let mut frame = self.buf.split_to(HEADER_LEN + payload_len);
            let payload = frame.split_off(HEADER_LEN).freeze();

            // while a header block is open, only CONTINUATION frames for
            // that stream are legal
            if let Some(cont) = &self.continuation
                && (head.kind() != Kind::Continuation || head.stream_id() != cont.stream_id)
            {
                self.goaway(Reason::PROTOCOL_ERROR, "interleaved continuation");
                break;
            }

            match head.kind() {
                Kind::Settings => self.on_settings(head, &payload),
                Kind::Headers => self.on_headers(head, &payload, requests),
                Kind::Continuation => self.on_continuation(head, &payload, requests),
                Kind::Data => self.on_data(head, &payload, requests),
                Kind::WindowUpdate => self.on_window_update(head, &payload),
                Kind::Ping => self.on_ping(head, &payload),
                Kind::Reset => self.on_reset(head, &payload),
                Kind::GoAway => {
                    tracing::debug!("received GOAWAY");
                    self.closing = true;
                }
                Kind::PushPromise => {
                    self.goaway(Reason::PROTOCOL_ERROR, "client sent PUSH_PROMISE");
                }
                Kind::Priority | Kind::Unknown => {}
            }
        }
    }

    fn on_settings(&mut self, head: Head, payload: &[u8]) {
        match Settings::load(head, payload) {
            Ok(settings) if settings.is_ack() => {}
            Ok(settings) => {
                self.apply_peer_settings(&settings);
                Settings::ack().encode(&mut self.outbound);
                self.flush_pending();
            }
            Err(err) => {
                tracing::debug!(%err, "invalid SETTINGS frame");
                self.goaway(Reason::PROTOCOL_ERROR, "invalid settings");
            }
        }
    }

    fn on_headers(&mut self, head: Head, payload: &[u8], requests: &mut Vec<Request>) {
        let stream_id = head.stream_id();
        if !stream_id.is_client_initiated() {
            self.goaway(Reason::PROTOCOL_ERROR, "headers on invalid stream");
            return;
        }
        let (start, end) = match header_block_range(payload, head.flag()) {
            Ok(range) => range,
            Err(err) => {
                tracing::debug!(%err, "malformed HEADERS frame");
                self.goaway(Reason::PROTOCOL_ERROR, "malformed headers");
                return;
            }
        };
        let end_stream = head.flag() & flags::END_STREAM == flags::END_STREAM;
        if head.flag() & flags::END_HEADERS == flags::END_HEADERS {
            let block = payload[start..end].to_vec();
            self.begin_stream(stream_id, &block, end_stream, requests);
        } else {
            self.continuation = Some(Continuation {
                stream_id,
                end_stream,
                block: BytesMut::from(&payload[start..end]),
            });
        }
    }

    fn on_continuation(&mut self, head: Head, payload: &[u8], requests: &mut Vec<Request>) {
        let Some(mut cont) = self.continuation.take() else {
            self.goaway(Reason::PROTOCOL_ERROR, "unexpected CONTINUATION");
            return;
        };
        debug_assert_eq!(cont.stream_id, head.stream_id());
        cont.block.extend_from_slice(payload);
        if head.flag() & flags::END_HEADERS == flags::END_HEADERS {
            let block = cont.block.freeze();
            self.begin_stream(cont.stream_id, &block, cont.end_stream, requests);
        } else {
            self.continuation = Some(cont);
        }
    }

    fn on_data(&mut self, head: Head, payload: &[u8], requests: &mut Vec<Request>) {
        let stream_id = head.stream_id();
        if stream_id.is_zero() {
            self.goaway(Reason::PROTOCOL_ERROR, "data on stream zero");
            return;
        }
        // replenish both windows no matter what becomes of the data, so
        // the peer never stalls on our receive window
        if !payload.is_empty() {
            let n = payload.len() as u32;
            WindowUpdate::new(StreamId::ZERO, n).encode(&mut self.outbound);
            WindowUpdate::new(stream_id, n).encode(&mut self.outbound);
        }
        let data = match strip_data_padding(payload, head.flag()) {
            Ok(data) => data,
            Err(err) => {
                tracing::debug!(%err, "malformed DATA frame");
                self.goaway(Reason::PROTOCOL_ERROR, "malformed data");
                return;
            }
        };
        if let Some(partial) = self.partial.get_mut(&stream_id) {
            partial.body.extend_from_slice(data);
            if head.flag() & flags::END_STREAM == flags::END_STREAM {
                self.complete_stream(stream_id, requests);
            }
        }
    }

    fn on_window_update(&mut self, head: Head, payload: &[u8]) {
        match WindowUpdate::load(head, payload) {
            Ok(update) => {
                let increment = i64::from(update.size_increment);
                if update.stream_id.is_zero() {
                    self.conn_window += increment;
                } else if let Some(stream) = self.send.get_mut(&update.stream_id) {
                    stream.window += increment;
                }
                self.flush_pending();
            }
            Err(err) => {
                tracing::debug!(%err, "invalid WINDOW_UPDATE frame");
                self.goaway(Reason::FLOW_CONTROL_ERROR, "invalid window update");
            }
        }
    }

    fn on_ping(&mut self, head: Head, payload: &[u8]) {
        match Ping::load(head, payload) {
            Ok(ping) if ping.is_ack() => {}
            Ok(ping) => Ping::pong(*ping.payload()).encode(&mut self.outbound),
            Err(err) => {
                tracing::debug!(%err, "invalid PING frame");
                self.goaway(Reason::FRAME_SIZE_ERROR, "invalid ping");
            }
        }
    }

    fn on_reset(&mut self, head: Head, payload: &[u8]) {
        match Reset::load(head, payload) {
            Ok(reset) => {
                tracing::debug!(stream = %reset.stream_id, reason = %reset.error_code, "stream reset by peer");
                self.partial.remove(&reset.stream_id);
                let stream = self
                    .send
                    .entry(reset.stream_id)
                    .or_insert_with(|| SendStream::new(DEFAULT_INITIAL_WINDOW_SIZE));
                stream.reset = true;
                stream.pending = None;
            }
            Err(err) => {
                tracing::debug!(%err, "invalid RST_STREAM frame");
                self.goaway(Reason::FRAME_SIZE_ERROR, "invalid rst_stream");
            }
        }
    }

    /// Attempt the h2c upgrade dance on a first chunk that is not a
    /// connection preface.
    fn try_upgrade(&mut self) -> Result<Ingest, ParseError> {
        let head = h1::parse_head(&self.buf)?
            .ok_or_else(|| ParseError::new("not an http/2 connection preface"))?;
        let upgrade = head
            .header(b"upgrade")
            .is_some_and(|value| value.as_ref().eq_ignore_ascii_case(b"h2c"));
        let settings_token = head.header(b"http2-settings").cloned();
        let (true, Some(token)) = (upgrade, settings_token) else {
            return Err(ParseError::new("plain http/1 request without h2c upgrade"));
        };
        let total = head.head_len + head.content_length;
        if self.buf.len() < total {
            return Err(ParseError::new("h2c upgrade request with incomplete body"));
        }
        let raw = URL_SAFE_NO_PAD
            .decode(token.as_ref())
            .map_err(|_| ParseError::new("invalid HTTP2-Settings token"))?;
        let settings = Settings::from_payload(&raw)
            .map_err(|_| ParseError::new("invalid HTTP2-Settings payload"))?;

        // committed: 101 via HTTP/1, clear anything queued before, then
        // speak HTTP/2 from a clean slate
        self.outbound.clear();
        self.outbound.extend_from_slice(
            b"HTTP/1.1 101 Switching Protocols\r\nconnection: upgrade\r\nupgrade: h2c\r\n\r\n",
        );
        self.apply_peer_settings(&settings);
        Settings::new().encode(&mut self.outbound);

        let body = Bytes::copy_from_slice(&self.buf[head.head_len..total]);
        let headers: Vec<(Bytes, Bytes)> = head
            .headers
            .iter()
            .filter(|(name, _)| {
                !name.eq_ignore_ascii_case(b"upgrade")
                    && !name.eq_ignore_ascii_case(b"http2-settings")
                    && !name.eq_ignore_ascii_case(b"connection")
            })
            .cloned()
            .collect();
        let request = Request::builder()
            .method(head.method.clone())
            .path(head.path.clone())
            .headers(headers)
            .body(body)
            .stream(1)
            .protocol(Bytes::from_static(PROTOCOL_H2))
            .scheme(self.scheme.clone())
            .build();
        self.buf.advance(total);
        let upgraded = StreamId::from(1);
        self.send
            .insert(upgraded, SendStream::new(self.peer_initial_window));
        self.last_stream = upgraded;
        self.state = RecvState::Preface;

        let mut ingest = self.drain(vec![request]);
        // the preface (and more) may already be buffered behind the
        // upgrade request
        if !self.buf.is_empty() {
            let follow_up = self.ingest_buffered();
            ingest.requests.extend(follow_up.requests);
            ingest.close |= follow_up.close;
            let mut to_write = BytesMut::from(ingest.to_write.as_ref());
            to_write.extend_from_slice(&follow_up.to_write);
            ingest.to_write = to_write.freeze();
        }
        Ok(ingest)
    }

    /// Process whatever sits in the receive buffer for the `Preface` and
    /// `Frames` states.
    fn ingest_buffered(&mut self) -> Ingest {
        let mut requests = Vec::new();
        if self.state == RecvState::Preface {
            if self.buf.len() < PREFACE.len() {
                if PREFACE.starts_with(self.buf.as_ref()) {
                    return self.drain(requests);
                }
                self.goaway(Reason::PROTOCOL_ERROR, "missing preface after upgrade");
                return self.drain(requests);
            }
            if self.buf.starts_with(PREFACE) {
                self.buf.advance(PREFACE.len());
                self.state = RecvState::Frames;
            } else {
                self.goaway(Reason::PROTOCOL_ERROR, "missing preface after upgrade");
                return self.drain(requests);
            }
        }
        self.process_frames(&mut requests);
        self.drain(requests)
    }

    fn drain(&mut self, requests: Vec<Request>) -> Ingest {
        Ingest {
            to_write: self.outbound.split().freeze(),
            requests,
            close: self.closing,
        }
    }
}

impl Default for Http2Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser for Http2Parser {
    fn connect(&mut self) {
        Settings::new().encode(&mut self.outbound);
    }

    fn handle_request(&mut self, data: &[u8]) -> Result<Ingest, ParseError> {
        self.buf.extend_from_slice(data);
        if self.state == RecvState::Init {
            let claimed = self.buf.len().min(PREFACE.len());
            if claimed >= PREFACE_CLAIM && self.buf[..claimed] == PREFACE[..claimed] {
                if self.buf.len() < PREFACE.len() {
                    // a valid prefix: claim the connection, wait for the rest
                    self.state = RecvState::Preface;
                    return Ok(self.drain(Vec::new()));
                }
                self.buf.advance(PREFACE.len());
                self.state = RecvState::Frames;
            } else {
                return self.try_upgrade();
            }
        }
        Ok(self.ingest_buffered())
    }

    fn handle_response(
        &mut self,
        response: &mut Response,
        request: &Request,
    ) -> Result<Vec<Bytes>, ProtoError> {
        let stream_id = StreamId::from(request.stream());
        let max_frame = self.peer_max_frame_size as usize;

        {
            let stream = self
                .send
                .get(&stream_id)
                .ok_or(ProtoError::StreamClosed(stream_id.into()))?;
            if stream.reset || stream.done {
                return Err(ProtoError::StreamClosed(stream_id.into()));
            }
        }

        response.set_header("content-length", response.body.len().to_string());
        let mut pairs: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(1 + response.headers().count());
        pairs.push((b":status".to_vec(), response.status.to_string().into_bytes()));
        for (name, value) in response.headers() {
            pairs.push((name.as_bytes().to_vec(), value.to_vec()));
        }
        let block = self
            .encoder
            .encode(pairs.iter().map(|(n, v)| (n.as_slice(), v.as_slice())));

        let end_on_headers = response.body.is_empty();
        let mut frames = encode_headers_frames(stream_id, &block, end_on_headers, max_frame);

        if end_on_headers {
            if let Some(stream) = self.send.get_mut(&stream_id) {
                stream.done = true;
            }
            return Ok(frames);
        }

        let stream = self
            .send
            .get_mut(&stream_id)
            .ok_or(ProtoError::StreamClosed(stream_id.into()))?;
        let mut remaining = response.body.clone();
        while !remaining.is_empty() {
            let allowed = stream.window.min(self.conn_window).min(max_frame as i64);
            if allowed <= 0 {
                // window exhausted: park the tail until WINDOW_UPDATE
                tracing::trace!(stream = %stream_id, parked = remaining.len(), "send window exhausted");
                stream.pending = Some(remaining);
                break;
            }
            let take = remaining.len().min(allowed as usize);
            let chunk = remaining.split_to(take);
            stream.window -= take as i64;
            self.conn_window -= take as i64;
            let end = remaining.is_empty();
            frames.push(encode_data(stream_id, &chunk, end));
            if end {
                stream.done = true;
            }
        }
        Ok(frames)
    }

    fn push_support(&self) -> bool {
        self.state != RecvState::Init && self.peer_enable_push
    }

    fn start_push(
        &mut self,
        parent: &Request,
        push: &Push,
    ) -> Result<Option<PushStart>, ProtoError> {
        if !self.push_support() {
            return Ok(None);
        }
        let parent_id = StreamId::from(parent.stream());
        match self.send.get(&parent_id) {
            Some(stream) if !stream.reset => {}
            _ => return Err(ProtoError::StreamClosed(parent_id.into())),
        }

        let promised = StreamId::from(self.next_promise);
        self.next_promise += 2;

        let mut pairs: Vec<(Vec<u8>, Vec<u8>)> = vec![
            (b":method".to_vec(), push.method.to_vec()),
            (b":path".to_vec(), push.path.to_vec()),
            (b":scheme".to_vec(), parent.scheme().to_vec()),
        ];
        if let Some(host) = parent.headers().get("host") {
            pairs.push((b":authority".to_vec(), host.to_vec()));
        }
        let block = self
            .encoder
            .encode(pairs.iter().map(|(n, v)| (n.as_slice(), v.as_slice())));
        let frames = encode_push_promise_frames(
            parent_id,
            promised,
            &block,
            self.peer_max_frame_size as usize,
        );
        let mut to_write = BytesMut::new();
        for f in &frames {
            to_write.extend_from_slice(f);
        }
        self.send
            .insert(promised, SendStream::new(self.peer_initial_window));

        let request = Request::builder()
            .method(push.method.clone())
            .path(push.path.clone())
            .stream(promised.into())
            .protocol(Bytes::from_static(PROTOCOL_H2))
            .scheme(parent.scheme().clone())
            .build();
        Ok(Some(PushStart {
            to_write: to_write.freeze(),
            request,
        }))
    }

    fn protocol(&self) -> &'static str {
        "h2"
    }
}
