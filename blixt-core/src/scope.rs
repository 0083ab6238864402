//! The per-request scope map.
//!
//! A [`Scope`] is a string-keyed map carried by every [`Request`]. Routing
//! captures, parsed query parameters, decoded bodies and route metadata all
//! travel through it. Entries are write-once unless explicitly rewritten,
//! and an entry may be *lazy*: a producer function that runs on first read
//! and is memoized in place.
//!
//! The map is owned by a single request task for its lifetime (the mutex
//! exists because middlewares hold clones of the same [`Request`] handle,
//! not because of cross-task sharing).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::BoxError;
use crate::message::{Push, Request};

/// Charset assumed when a request carries none.
pub const DEFAULT_ENCODING: &str = "iso-8859-1";

/// Well-known scope keys installed by the standard middleware set.
pub mod keys {
    /// Path portion of the raw path, bytes before `?`.
    pub const PATH: &str = "path";
    /// Decoded query parameters, a JSON object of string arrays.
    pub const QUERY_PARAMS: &str = "query_params";
    /// First token of the `Content-Type` header.
    pub const CONTENT_TYPE: &str = "content_type";
    /// Charset parameter of the `Content-Type` header.
    pub const ENCODING: &str = "encoding";
    /// Body decoded as JSON when the content type asks for it.
    pub const JSON: &str = "json";
    /// Pushes accumulated by [`Request::add_push`](crate::Request::add_push).
    pub const PUSHES: &str = "pushes";
    /// Route pattern that matched this request.
    pub const PATTERN: &str = "pattern";
    /// Response status override honored by the formatters.
    pub const STATUS: &str = "status";
    /// Peer address, recorded by the connection.
    pub const PEER_ADDR: &str = "peer_addr";
}

/// A value stored in the scope.
#[derive(Debug, Clone, PartialEq)]
pub enum ScopeValue {
    Bytes(Bytes),
    Str(String),
    Int(i64),
    Bool(bool),
    Json(serde_json::Value),
    Pushes(Vec<Push>),
}

impl ScopeValue {
    /// Borrow the value as a string, for `Str` and JSON strings.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            Self::Json(serde_json::Value::String(s)) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Truthiness in the loose sense route metadata uses (`process = true`).
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Int(n) => *n != 0,
            Self::Json(v) => match v {
                serde_json::Value::Bool(b) => *b,
                serde_json::Value::Null => false,
                serde_json::Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
                serde_json::Value::String(s) => !s.is_empty(),
                _ => true,
            },
            Self::Str(s) => !s.is_empty(),
            Self::Bytes(b) => !b.is_empty(),
            Self::Pushes(p) => !p.is_empty(),
        }
    }

    /// Render the value as display text, used by template substitution and
    /// push-path rendering. Containers are rendered as compact JSON.
    #[must_use]
    pub fn display_text(&self) -> String {
        match self {
            Self::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
            Self::Str(s) => s.clone(),
            Self::Int(n) => n.to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Json(serde_json::Value::String(s)) => s.clone(),
            Self::Json(v) => v.to_string(),
            Self::Pushes(p) => format!("{p:?}"),
        }
    }
}

impl From<Bytes> for ScopeValue {
    fn from(value: Bytes) -> Self {
        Self::Bytes(value)
    }
}

impl From<&str> for ScopeValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<String> for ScopeValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for ScopeValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for ScopeValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<serde_json::Value> for ScopeValue {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

impl From<Vec<Push>> for ScopeValue {
    fn from(value: Vec<Push>) -> Self {
        Self::Pushes(value)
    }
}

/// A lazy scope producer: invoked with the owning request on first read.
pub type LazyProducer = Arc<dyn Fn(&Request) -> Result<ScopeValue, BoxError> + Send + Sync>;

enum Entry {
    Value(ScopeValue),
    Lazy(LazyProducer),
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Self::Lazy(_) => f.write_str("Lazy(..)"),
        }
    }
}

/// The shared per-request map. Clones refer to the same underlying storage.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    inner: Arc<Mutex<HashMap<String, Entry>>>,
}

impl Scope {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `key`, running and memoizing a lazy producer if needed.
    ///
    /// The producer is invoked outside the lock: producers are allowed to
    /// read other scope keys of the same request (the JSON body producer
    /// reads the content type, for example).
    pub fn resolve(&self, key: &str, request: &Request) -> Result<Option<ScopeValue>, BoxError> {
        let producer = {
            let guard = self.inner.lock();
            match guard.get(key) {
                None => return Ok(None),
                Some(Entry::Value(value)) => return Ok(Some(value.clone())),
                Some(Entry::Lazy(producer)) => producer.clone(),
            }
        };
        let value = producer(request)?;
        self.inner
            .lock()
            .insert(key.to_owned(), Entry::Value(value.clone()));
        Ok(Some(value))
    }

    /// Write-once insert. Returns `false` when the key already existed.
    pub fn set(&self, key: impl Into<String>, value: impl Into<ScopeValue>) -> bool {
        let key = key.into();
        let mut guard = self.inner.lock();
        if guard.contains_key(&key) {
            return false;
        }
        guard.insert(key, Entry::Value(value.into()));
        true
    }

    /// Insert, replacing any existing entry.
    pub fn set_rewrite(&self, key: impl Into<String>, value: impl Into<ScopeValue>) {
        self.inner
            .lock()
            .insert(key.into(), Entry::Value(value.into()));
    }

    /// Write-once insert of a lazy producer.
    pub fn set_lazy<F>(&self, key: impl Into<String>, producer: F) -> bool
    where
        F: Fn(&Request) -> Result<ScopeValue, BoxError> + Send + Sync + 'static,
    {
        let key = key.into();
        let mut guard = self.inner.lock();
        if guard.contains_key(&key) {
            return false;
        }
        guard.insert(key, Entry::Lazy(Arc::new(producer)));
        true
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().contains_key(key)
    }

    /// Snapshot of all already-resolved entries. Lazy entries that were
    /// never read are skipped rather than forced.
    #[must_use]
    pub fn resolved_entries(&self) -> Vec<(String, ScopeValue)> {
        self.inner
            .lock()
            .iter()
            .filter_map(|(key, entry)| match entry {
                Entry::Value(value) => Some((key.clone(), value.clone())),
                Entry::Lazy(_) => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn write_once_keeps_first_value() {
        let scope = Scope::new();
        assert!(scope.set("k", "v1"));
        assert!(!scope.set("k", "v2"));
        let request = Request::with_scope("GET", "/", scope.clone());
        let value = scope.resolve("k", &request).unwrap().unwrap();
        assert_eq!(value.as_str(), Some("v1"));
    }

    #[test]
    fn rewrite_replaces() {
        let scope = Scope::new();
        scope.set("k", "v1");
        scope.set_rewrite("k", "v2");
        let request = Request::with_scope("GET", "/", scope.clone());
        let value = scope.resolve("k", &request).unwrap().unwrap();
        assert_eq!(value.as_str(), Some("v2"));
    }

    #[test]
    fn lazy_runs_at_most_once() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        let scope = Scope::new();
        scope.set_lazy("lazy", |_req| {
            CALLS.fetch_add(1, Ordering::SeqCst);
            Ok(ScopeValue::Int(42))
        });
        let request = Request::with_scope("GET", "/", scope.clone());
        for _ in 0..3 {
            let value = scope.resolve("lazy", &request).unwrap().unwrap();
            assert_eq!(value, ScopeValue::Int(42));
        }
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn lazy_may_read_other_keys() {
        let scope = Scope::new();
        scope.set("base", 2i64);
        scope.set_lazy("derived", |req| {
            let base = req.try_get("base")?.unwrap();
            match base {
                ScopeValue::Int(n) => Ok(ScopeValue::Int(n * 2)),
                other => panic!("unexpected {other:?}"),
            }
        });
        let request = Request::with_scope("GET", "/", scope.clone());
        let value = request.try_get("derived").unwrap().unwrap();
        assert_eq!(value, ScopeValue::Int(4));
    }

    #[test]
    fn resolved_entries_skip_pending_lazies() {
        let scope = Scope::new();
        scope.set("eager", "x");
        scope.set_lazy("pending", |_| Ok(ScopeValue::Bool(true)));
        let entries = scope.resolved_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "eager");
    }
}
