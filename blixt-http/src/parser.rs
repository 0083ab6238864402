//! The sans-io parser contract.
//!
//! A parser owns the protocol state of one connection and translates bytes
//! to requests and responses to bytes. It never touches the socket: the
//! connection feeds it received chunks and writes whatever it returns.
//! During negotiation several candidate parsers observe the same first
//! chunk; the first one that does not reject it is bound for the lifetime
//! of the socket.

use bytes::Bytes;

use blixt_core::message::{Push, Request, Response};

/// The outcome of feeding one received chunk into a parser.
#[derive(Debug, Default)]
pub struct Ingest {
    /// Bytes to write back to the peer (acknowledgements, protocol
    /// bookkeeping, flow-control releases).
    pub to_write: Bytes,
    /// Requests completed by this chunk.
    pub requests: Vec<Request>,
    /// The peer asked to terminate, or the parser gave up on the
    /// connection. The connection drains in-flight requests, then closes.
    pub close: bool,
}

impl Ingest {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }
}

/// The bytes offered are not a valid prefix of this parser's protocol.
///
/// Recoverable during negotiation (the connection tries the next
/// candidate), fatal once a parser is bound.
#[derive(Debug)]
pub struct ParseError {
    message: String,
}

impl ParseError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "parse error: {}", self.message)
    }
}

impl std::error::Error for ParseError {}

/// Stream-level failures raised while serializing a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtoError {
    /// The stream was reset or already completed; the response is dropped
    /// silently and the connection continues.
    StreamClosed(u32),
    /// The peer or caller violated the protocol on this connection.
    Protocol(String),
}

impl std::fmt::Display for ProtoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StreamClosed(stream) => write!(f, "stream {stream} is closed"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
        }
    }
}

impl std::error::Error for ProtoError {}

/// A reserved server push: the frames announcing it and the synthetic
/// request whose response will be sent on the reserved stream.
#[derive(Debug)]
pub struct PushStart {
    pub to_write: Bytes,
    pub request: Request,
}

/// Byte-level protocol state machine bound to one connection.
pub trait Parser: Send + 'static {
    /// A new connection was accepted. May enqueue initial bytes (the
    /// HTTP/2 server SETTINGS frame) into the parser's outbound buffer;
    /// they are surfaced by the first successful
    /// [`handle_request`](Parser::handle_request).
    fn connect(&mut self) {}

    /// Ingest one received chunk.
    fn handle_request(&mut self, data: &[u8]) -> Result<Ingest, ParseError>;

    /// Serialize a response for the given request. The parser owns the
    /// `content-length` header. HTTP/2 may return multiple frames and park
    /// data that exceeds the peer's flow-control window.
    fn handle_response(
        &mut self,
        response: &mut Response,
        request: &Request,
    ) -> Result<Vec<Bytes>, ProtoError>;

    /// True only when the peer has server push enabled.
    fn push_support(&self) -> bool {
        false
    }

    /// Reserve a pushed stream for `push`, announced on `parent`'s stream.
    /// `Ok(None)` when the protocol (or the peer) does not support push.
    fn start_push(
        &mut self,
        _parent: &Request,
        _push: &Push,
    ) -> Result<Option<PushStart>, ProtoError> {
        Ok(None)
    }

    /// Short protocol tag for diagnostics.
    fn protocol(&self) -> &'static str;
}
