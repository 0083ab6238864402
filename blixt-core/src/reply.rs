//! Handler return values.
//!
//! Handlers are heterogeneous: some build a full [`Response`], most return
//! a value (a JSON document, a string, a template) and let the formatter
//! middlewares lift it. [`Reply`] is the sum type that travels back through
//! the pipeline; only the first matching formatter claims a non-`Response`
//! variant.

use bytes::Bytes;

use crate::error::BoxError;
use crate::message::Response;

/// A template render request: a registered template name plus its context.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub name: String,
    pub context: serde_json::Map<String, serde_json::Value>,
}

impl Template {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            context: serde_json::Map::new(),
        }
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// The value produced by a handler and transformed by middlewares.
#[derive(Debug, Clone)]
pub enum Reply {
    Response(Response),
    Json(serde_json::Value),
    Text(String),
    Bytes(Bytes),
    Template(Template),
}

impl Reply {
    #[must_use]
    pub fn as_response(&self) -> Option<&Response> {
        match self {
            Self::Response(response) => Some(response),
            _ => None,
        }
    }

    /// Unwrap into a [`Response`], failing when no formatter claimed the
    /// value. The connection answers such failures with its last-resort 500.
    pub fn into_response(self) -> Result<Response, BoxError> {
        match self {
            Self::Response(response) => Ok(response),
            other => Err(crate::error::Message::boxed(format!(
                "reply was not formatted into a response: {other:?}"
            ))),
        }
    }
}

/// Conversion into a [`Reply`]; what handler bodies actually produce.
pub trait IntoReply {
    fn into_reply(self) -> Reply;
}

impl IntoReply for Reply {
    fn into_reply(self) -> Reply {
        self
    }
}

impl IntoReply for Response {
    fn into_reply(self) -> Reply {
        Reply::Response(self)
    }
}

impl IntoReply for serde_json::Value {
    fn into_reply(self) -> Reply {
        Reply::Json(self)
    }
}

impl IntoReply for serde_json::Map<String, serde_json::Value> {
    fn into_reply(self) -> Reply {
        Reply::Json(serde_json::Value::Object(self))
    }
}

impl IntoReply for String {
    fn into_reply(self) -> Reply {
        Reply::Text(self)
    }
}

impl IntoReply for &str {
    fn into_reply(self) -> Reply {
        Reply::Text(self.to_owned())
    }
}

impl IntoReply for Bytes {
    fn into_reply(self) -> Reply {
        Reply::Bytes(self)
    }
}

impl IntoReply for Vec<u8> {
    fn into_reply(self) -> Reply {
        Reply::Bytes(Bytes::from(self))
    }
}

impl IntoReply for Template {
    fn into_reply(self) -> Reply {
        Reply::Template(self)
    }
}

/// Conversion into the `Result<Reply, BoxError>` a handler must yield.
///
/// Implemented both for bare reply values and for `Result`s of them, so a
/// handler may be fallible or not without ceremony.
pub trait IntoReplyResult {
    fn into_reply_result(self) -> Result<Reply, BoxError>;
}

macro_rules! infallible_reply {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl IntoReplyResult for $ty {
                fn into_reply_result(self) -> Result<Reply, BoxError> {
                    Ok(self.into_reply())
                }
            }
        )+
    };
}

infallible_reply! {
    Reply,
    Response,
    serde_json::Value,
    serde_json::Map<String, serde_json::Value>,
    String,
    &str,
    Bytes,
    Vec<u8>,
    Template,
}

impl<R: IntoReply, E: Into<BoxError>> IntoReplyResult for Result<R, E> {
    fn into_reply_result(self) -> Result<Reply, BoxError> {
        self.map(IntoReply::into_reply).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unformatted_reply_is_an_error() {
        let reply = Reply::Text("hi".into());
        assert!(reply.into_response().is_err());
    }

    #[test]
    fn response_passes_through() {
        let reply = Response::new(204, "").into_reply();
        assert_eq!(reply.into_response().unwrap().status, 204);
    }
}
