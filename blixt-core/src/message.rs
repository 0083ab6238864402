//! Request, response and push message records.
//!
//! A [`Request`] has an immutable shape: the parsed fields live behind an
//! `Arc` and are never touched after construction. All cross-cutting state
//! goes through the shared [`Scope`], which makes request handles cheap to
//! clone into middlewares and spawned tasks.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::BoxError;
use crate::scope::{self, Scope, ScopeValue, keys};

/// Case-insensitive header map.
///
/// Names are indexed lowercase; repeated headers are joined with `"; "` at
/// construction time, so lookups always observe a single value.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    map: HashMap<String, Bytes>,
}

impl Headers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from raw name/value pairs, joining repeated names.
    #[must_use]
    pub fn from_pairs<I, N, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (N, V)>,
        N: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        let mut joined: HashMap<String, Vec<u8>> = HashMap::new();
        for (name, value) in pairs {
            let name = String::from_utf8_lossy(name.as_ref()).to_ascii_lowercase();
            let entry = joined.entry(name).or_default();
            if !entry.is_empty() {
                entry.extend_from_slice(b"; ");
            }
            entry.extend_from_slice(value.as_ref());
        }
        let map = joined
            .into_iter()
            .map(|(name, value)| (name, Bytes::from(value)))
            .collect();
        Self { map }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Bytes> {
        if name.bytes().any(|b| b.is_ascii_uppercase()) {
            self.map.get(&name.to_ascii_lowercase())
        } else {
            self.map.get(name)
        }
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Bytes)> {
        self.map.iter().map(|(name, value)| (name.as_str(), value))
    }
}

#[derive(Debug)]
struct Parts {
    method: Bytes,
    raw_path: Bytes,
    body: Bytes,
    headers: Headers,
    stream: u32,
    protocol: Bytes,
    scheme: Bytes,
}

/// An incoming request.
///
/// Created by a parser, destroyed when its task completes. Clones share the
/// same parts and scope.
#[derive(Debug, Clone)]
pub struct Request {
    parts: Arc<Parts>,
    scope: Scope,
}

impl Request {
    /// A request with the given method and path and defaults elsewhere.
    #[must_use]
    pub fn new(method: impl Into<Bytes>, path: impl Into<Bytes>) -> Self {
        Self::builder().method(method).path(path).build()
    }

    /// A request bound to an existing scope. Mostly useful in tests.
    #[must_use]
    pub fn with_scope(method: impl Into<Bytes>, path: impl Into<Bytes>, scope: Scope) -> Self {
        let mut request = Self::new(method, path);
        request.scope = scope;
        request
    }

    #[must_use]
    pub fn builder() -> RequestBuilder {
        RequestBuilder::default()
    }

    /// Request method, uppercase.
    #[must_use]
    pub fn method(&self) -> &Bytes {
        &self.parts.method
    }

    /// The path exactly as it appeared on the wire, query string included.
    #[must_use]
    pub fn raw_path(&self) -> &Bytes {
        &self.parts.raw_path
    }

    /// The path used for routing: the scope `path` entry when a middleware
    /// installed one, the raw path otherwise.
    #[must_use]
    pub fn path(&self) -> Bytes {
        match self.scope.resolve(keys::PATH, self) {
            Ok(Some(ScopeValue::Bytes(path))) => path,
            Ok(Some(ScopeValue::Str(path))) => Bytes::from(path.into_bytes()),
            _ => self.parts.raw_path.clone(),
        }
    }

    #[must_use]
    pub fn body(&self) -> &Bytes {
        &self.parts.body
    }

    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.parts.headers
    }

    /// Stream id; 0 for HTTP/1 requests.
    #[must_use]
    pub fn stream(&self) -> u32 {
        self.parts.stream
    }

    #[must_use]
    pub fn protocol(&self) -> &Bytes {
        &self.parts.protocol
    }

    #[must_use]
    pub fn scheme(&self) -> &Bytes {
        &self.parts.scheme
    }

    #[must_use]
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Read a scope entry, resolving lazy producers.
    pub fn try_get(&self, key: &str) -> Result<Option<ScopeValue>, BoxError> {
        self.scope.resolve(key, self)
    }

    /// Read a scope entry, discarding producer errors.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<ScopeValue> {
        self.try_get(key).ok().flatten()
    }

    /// Write-once scope insert; returns `false` if the key already existed.
    pub fn set(&self, key: impl Into<String>, value: impl Into<ScopeValue>) -> bool {
        self.scope.set(key, value)
    }

    /// Scope insert that replaces any existing entry.
    pub fn set_rewrite(&self, key: impl Into<String>, value: impl Into<ScopeValue>) {
        self.scope.set_rewrite(key, value);
    }

    /// Write-once insert of a lazy producer.
    pub fn set_lazy<F>(&self, key: impl Into<String>, producer: F) -> bool
    where
        F: Fn(&Request) -> Result<ScopeValue, BoxError> + Send + Sync + 'static,
    {
        self.scope.set_lazy(key, producer)
    }

    /// Record a push hint; the push middleware transfers accumulated hints
    /// onto the response after the handler returns.
    pub fn add_push(&self, path: impl Into<Bytes>, method: impl Into<Bytes>) {
        let mut pushes = match self.get(keys::PUSHES) {
            Some(ScopeValue::Pushes(pushes)) => pushes,
            _ => Vec::new(),
        };
        pushes.push(Push::with_method(path, method));
        self.scope.set_rewrite(keys::PUSHES, pushes);
    }

    /// First token of the `Content-Type` header, when the patch-request
    /// middleware installed its producers.
    #[must_use]
    pub fn content_type(&self) -> Option<Bytes> {
        match self.get(keys::CONTENT_TYPE) {
            Some(ScopeValue::Bytes(value)) => Some(value),
            _ => None,
        }
    }

    /// Charset of the request body, `iso-8859-1` when unspecified.
    #[must_use]
    pub fn encoding(&self) -> String {
        match self.get(keys::ENCODING) {
            Some(ScopeValue::Str(value)) => value,
            _ => scope::DEFAULT_ENCODING.to_owned(),
        }
    }

    /// Body decoded as JSON, `None` for non-JSON content types.
    pub fn json(&self) -> Result<Option<serde_json::Value>, BoxError> {
        match self.try_get(keys::JSON)? {
            Some(ScopeValue::Json(serde_json::Value::Null)) | None => Ok(None),
            Some(ScopeValue::Json(value)) => Ok(Some(value)),
            Some(other) => Ok(Some(serde_json::Value::String(other.display_text()))),
        }
    }

    /// Decoded query parameters as a JSON object of string arrays.
    pub fn query_params(&self) -> Result<serde_json::Map<String, serde_json::Value>, BoxError> {
        match self.try_get(keys::QUERY_PARAMS)? {
            Some(ScopeValue::Json(serde_json::Value::Object(map))) => Ok(map),
            _ => Ok(serde_json::Map::new()),
        }
    }
}

/// Builder used by parsers and tests.
#[derive(Debug)]
pub struct RequestBuilder {
    method: Bytes,
    path: Bytes,
    body: Bytes,
    headers: Vec<(Bytes, Bytes)>,
    stream: u32,
    protocol: Bytes,
    scheme: Bytes,
}

impl Default for RequestBuilder {
    fn default() -> Self {
        Self {
            method: Bytes::from_static(b"GET"),
            path: Bytes::from_static(b"/"),
            body: Bytes::new(),
            headers: Vec::new(),
            stream: 0,
            protocol: Bytes::from_static(b"HTTP/1.1"),
            scheme: Bytes::from_static(b"http"),
        }
    }
}

impl RequestBuilder {
    #[must_use]
    pub fn method(mut self, method: impl Into<Bytes>) -> Self {
        let method = method.into();
        if !method.is_empty() {
            self.method = if method.iter().any(u8::is_ascii_lowercase) {
                Bytes::from(method.to_ascii_uppercase())
            } else {
                method
            };
        }
        self
    }

    #[must_use]
    pub fn path(mut self, path: impl Into<Bytes>) -> Self {
        let path = path.into();
        if !path.is_empty() {
            self.path = path;
        }
        self
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn headers<I, N, V>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (N, V)>,
        N: Into<Bytes>,
        V: Into<Bytes>,
    {
        self.headers
            .extend(pairs.into_iter().map(|(n, v)| (n.into(), v.into())));
        self
    }

    #[must_use]
    pub fn stream(mut self, stream: u32) -> Self {
        self.stream = stream;
        self
    }

    #[must_use]
    pub fn protocol(mut self, protocol: impl Into<Bytes>) -> Self {
        self.protocol = protocol.into();
        self
    }

    #[must_use]
    pub fn scheme(mut self, scheme: impl Into<Bytes>) -> Self {
        self.scheme = scheme.into();
        self
    }

    #[must_use]
    pub fn build(self) -> Request {
        Request {
            parts: Arc::new(Parts {
                method: self.method,
                raw_path: self.path,
                body: self.body,
                headers: Headers::from_pairs(self.headers),
                stream: self.stream,
                protocol: self.protocol,
                scheme: self.scheme,
            }),
            scope: Scope::new(),
        }
    }
}

/// A server-push hint: generate a second request on the same HTTP/2
/// connection and push its response to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Push {
    pub path: Bytes,
    pub method: Bytes,
}

impl Push {
    #[must_use]
    pub fn new(path: impl Into<Bytes>) -> Self {
        Self {
            path: path.into(),
            method: Bytes::from_static(b"GET"),
        }
    }

    #[must_use]
    pub fn with_method(path: impl Into<Bytes>, method: impl Into<Bytes>) -> Self {
        Self {
            path: path.into(),
            method: method.into(),
        }
    }
}

/// An outgoing response.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub body: Bytes,
    headers: Vec<(String, Bytes)>,
    pub pushes: Vec<Push>,
    /// Marks a response that is itself being sent as a pushed resource.
    pub push: bool,
}

impl Response {
    #[must_use]
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
            headers: Vec::new(),
            pushes: Vec::new(),
            push: false,
        }
    }

    /// Add or replace a header; names are stored lowercase.
    pub fn set_header(&mut self, name: impl AsRef<str>, value: impl Into<Bytes>) {
        let name = name.as_ref().to_ascii_lowercase();
        let value = value.into();
        for (existing, slot) in &mut self.headers {
            if *existing == name {
                *slot = value;
                return;
            }
        }
        self.headers.push((name, value));
    }

    #[must_use]
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<Bytes>) -> Self {
        self.set_header(name, value);
        self
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&Bytes> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(existing, _)| *existing == name)
            .map(|(_, value)| value)
    }

    /// Headers in insertion order.
    pub fn headers(&self) -> impl Iterator<Item = (&str, &Bytes)> {
        self.headers.iter().map(|(name, value)| (name.as_str(), value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_join_and_lowercase() {
        let headers = Headers::from_pairs([
            (&b"Accept"[..], &b"text/html"[..]),
            (b"ACCEPT", b"application/json"),
            (b"Host", b"example.com"),
        ]);
        assert_eq!(
            headers.get("accept").unwrap().as_ref(),
            b"text/html; application/json"
        );
        assert_eq!(headers.get("HOST").unwrap().as_ref(), b"example.com");
        assert!(!headers.contains("content-type"));
    }

    #[test]
    fn request_defaults_are_never_empty() {
        let request = Request::builder().method("").path("").build();
        assert_eq!(request.method().as_ref(), b"GET");
        assert_eq!(request.raw_path().as_ref(), b"/");
    }

    #[test]
    fn method_is_uppercased() {
        let request = Request::new("post", "/x");
        assert_eq!(request.method().as_ref(), b"POST");
    }

    #[test]
    fn add_push_accumulates() {
        let request = Request::new("GET", "/");
        request.add_push("/style.css", "GET");
        request.add_push("/app.js", "GET");
        match request.get(keys::PUSHES) {
            Some(ScopeValue::Pushes(pushes)) => {
                assert_eq!(pushes.len(), 2);
                assert_eq!(pushes[0].path.as_ref(), b"/style.css");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn response_header_replaces() {
        let mut response = Response::new(200, "ok").with_header("Content-Type", "text/plain");
        response.set_header("content-type", "application/json");
        assert_eq!(
            response.header("content-type").unwrap().as_ref(),
            b"application/json"
        );
        assert_eq!(response.headers().count(), 1);
    }
}
