//! HTTP/1.1 parser.
//!
//! Incremental request parsing on top of `httparse`, with buffered
//! `Content-Length` bodies and support for pipelined requests. A partial
//! request is a valid prefix of the protocol and produces an empty
//! [`Ingest`]; malformed bytes raise [`ParseError`] so negotiation can move
//! on (or the connection can drop a bound parser).

use bytes::{BufMut, Bytes, BytesMut};

use blixt_core::message::{Request, Response};

use crate::parser::{Ingest, ParseError, Parser, ProtoError};

const MAX_HEADERS: usize = 64;

/// Reason phrases for the statuses this framework emits; anything else is
/// serialized with an empty reason, which peers must tolerate.
pub(crate) fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        411 => "Length Required",
        413 => "Payload Too Large",
        415 => "Unsupported Media Type",
        426 => "Upgrade Required",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "",
    }
}

/// A fully parsed request head plus how much input it consumed.
pub(crate) struct ParsedHead {
    pub(crate) method: Bytes,
    pub(crate) path: Bytes,
    pub(crate) minor_version: u8,
    pub(crate) headers: Vec<(Bytes, Bytes)>,
    pub(crate) head_len: usize,
    pub(crate) content_length: usize,
}

impl ParsedHead {
    pub(crate) fn header(&self, name: &[u8]) -> Option<&Bytes> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }
}

/// Parse one request head out of `buf`. `Ok(None)` means the head is still
/// incomplete.
pub(crate) fn parse_head(buf: &[u8]) -> Result<Option<ParsedHead>, ParseError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(buf) {
        Ok(httparse::Status::Complete(head_len)) => {
            let method = Bytes::copy_from_slice(req.method.unwrap_or("GET").as_bytes());
            let path = Bytes::copy_from_slice(req.path.unwrap_or("/").as_bytes());
            let minor_version = req.version.unwrap_or(1) as u8;
            let headers: Vec<(Bytes, Bytes)> = req
                .headers
                .iter()
                .map(|h| {
                    (
                        Bytes::copy_from_slice(h.name.as_bytes()),
                        Bytes::copy_from_slice(h.value),
                    )
                })
                .collect();
            let content_length = headers
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(b"content-length"))
                .map(|(_, v)| {
                    std::str::from_utf8(v)
                        .ok()
                        .and_then(|s| s.trim().parse::<usize>().ok())
                        .ok_or_else(|| ParseError::new("invalid content-length"))
                })
                .transpose()?
                .unwrap_or(0);
            Ok(Some(ParsedHead {
                method,
                path,
                minor_version,
                headers,
                head_len,
                content_length,
            }))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(err) => Err(ParseError::new(format!("invalid http/1 request: {err}"))),
    }
}

/// HTTP/1.x request parser and response serializer.
pub struct Http1Parser {
    buf: BytesMut,
    scheme: Bytes,
    saw_input: bool,
}

impl Http1Parser {
    #[must_use]
    pub fn new() -> Self {
        Self::with_scheme("http")
    }

    #[must_use]
    pub fn with_scheme(scheme: impl Into<Bytes>) -> Self {
        Self {
            buf: BytesMut::new(),
            scheme: scheme.into(),
            saw_input: false,
        }
    }

    fn build_request(&self, head: &ParsedHead, body: Bytes) -> Request {
        let protocol: Bytes = if head.minor_version == 0 {
            Bytes::from_static(b"HTTP/1.0")
        } else {
            Bytes::from_static(b"HTTP/1.1")
        };
        Request::builder()
            .method(head.method.clone())
            .path(head.path.clone())
            .headers(head.headers.iter().cloned())
            .body(body)
            .protocol(protocol)
            .scheme(self.scheme.clone())
            .build()
    }
}

impl Default for Http1Parser {
    fn default() -> Self {
        Self::new()
    }
}

/// True when the request (or its HTTP/1.0 default) asks to close after the
/// response.
fn wants_close(head: &ParsedHead) -> bool {
    match head.header(b"connection") {
        Some(value) => value.eq_ignore_ascii_case(b"close"),
        None => head.minor_version == 0,
    }
}

impl Parser for Http1Parser {
    fn handle_request(&mut self, data: &[u8]) -> Result<Ingest, ParseError> {
        self.buf.extend_from_slice(data);
        let mut ingest = Ingest::empty();
        loop {
            if self.buf.is_empty() {
                break;
            }
            let head = match parse_head(&self.buf) {
                Ok(Some(head)) => head,
                Ok(None) => {
                    // during negotiation an empty buffer prefix proves
                    // nothing; only accept once this parser has seen a
                    // complete request head at least once
                    if !self.saw_input {
                        // still a plausible prefix of HTTP/1 — but reject
                        // clear binary prefaces so negotiation can settle
                        if looks_binary(&self.buf) {
                            return Err(ParseError::new("not an http/1 request"));
                        }
                    }
                    break;
                }
                Err(err) => return Err(err),
            };
            let total = head.head_len + head.content_length;
            if self.buf.len() < total {
                break;
            }
            self.saw_input = true;
            let body = Bytes::copy_from_slice(&self.buf[head.head_len..total]);
            let _ = self.buf.split_to(total);
            if wants_close(&head) {
                ingest.close = true;
            }
            ingest.requests.push(self.build_request(&head, body));
        }
        Ok(ingest)
    }

    fn handle_response(
        &mut self,
        response: &mut Response,
        _request: &Request,
    ) -> Result<Vec<Bytes>, ProtoError> {
        response.set_header("content-length", response.body.len().to_string());
        let mut head = BytesMut::with_capacity(128);
        head.put_slice(b"HTTP/1.1 ");
        head.put_slice(response.status.to_string().as_bytes());
        head.put_u8(b' ');
        head.put_slice(reason_phrase(response.status).as_bytes());
        head.put_slice(b"\r\n");
        for (name, value) in response.headers() {
            head.put_slice(name.as_bytes());
            head.put_slice(b": ");
            head.put_slice(value);
            head.put_slice(b"\r\n");
        }
        head.put_slice(b"\r\n");
        Ok(vec![head.freeze(), response.body.clone()])
    }

    fn protocol(&self) -> &'static str {
        "http/1.1"
    }
}

/// A cheap sniff for request bytes that cannot open an HTTP/1 request
/// line: control bytes before the first CRLF.
fn looks_binary(buf: &[u8]) -> bool {
    buf.iter()
        .take_while(|b| **b != b'\r' && **b != b'\n')
        .any(|b| *b < 0x20 || *b >= 0x80)
}
