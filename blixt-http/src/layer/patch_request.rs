//! Lazy request attributes (`patch_request`).
//!
//! Installs lazy producers on the request scope for the parsed path, query
//! parameters, content type, charset and JSON body. Each producer runs at
//! most once per request, on first read.

use bytes::Bytes;
use percent_encoding::percent_decode;

use blixt_core::component::Component;
use blixt_core::error::{BoxError, Message};
use blixt_core::message::Request;
use blixt_core::middleware::{BoxMiddleware, Next};
use blixt_core::reply::Reply;
use blixt_core::scope::{DEFAULT_ENCODING, ScopeValue, keys};
use blixt_core::{BoxHandler, Middleware};

const JSON_CONTENT_TYPE: &[u8] = b"application/json";

fn produce_path(request: &Request) -> Result<ScopeValue, BoxError> {
    let raw = request.raw_path();
    let path = match raw.iter().position(|b| *b == b'?') {
        Some(index) => raw.slice(..index),
        None => raw.clone(),
    };
    Ok(ScopeValue::Bytes(path))
}

fn decode_component(component: &[u8]) -> String {
    let plus_decoded: Vec<u8> = component
        .iter()
        .map(|b| if *b == b'+' { b' ' } else { *b })
        .collect();
    percent_decode(&plus_decoded).decode_utf8_lossy().into_owned()
}

fn produce_query_params(request: &Request) -> Result<ScopeValue, BoxError> {
    let raw = request.raw_path();
    let mut params = serde_json::Map::new();
    if let Some(index) = raw.iter().position(|b| *b == b'?') {
        for pair in raw[index + 1..].split(|b| *b == b'&') {
            // pairs without a value (`?flag`, `?flag=`) are dropped
            let Some(eq) = pair.iter().position(|b| *b == b'=') else {
                continue;
            };
            let (name, value) = (&pair[..eq], &pair[eq + 1..]);
            if value.is_empty() {
                continue;
            }
            let name = decode_component(name);
            let value = serde_json::Value::String(decode_component(value));
            match params
                .entry(name)
                .or_insert_with(|| serde_json::Value::Array(Vec::new()))
            {
                serde_json::Value::Array(values) => values.push(value),
                _ => unreachable!("query entries are always arrays"),
            }
        }
    }
    Ok(ScopeValue::Json(serde_json::Value::Object(params)))
}

fn produce_content_type(request: &Request) -> Result<ScopeValue, BoxError> {
    match request.headers().get("content-type") {
        Some(value) => {
            let first = match value.iter().position(|b| *b == b';') {
                Some(index) => value.slice(..index),
                None => value.clone(),
            };
            let trimmed = first.as_ref().trim_ascii();
            Ok(ScopeValue::Bytes(Bytes::copy_from_slice(trimmed)))
        }
        None => Ok(ScopeValue::Json(serde_json::Value::Null)),
    }
}

fn produce_encoding(request: &Request) -> Result<ScopeValue, BoxError> {
    let Some(value) = request.headers().get("content-type") else {
        return Ok(ScopeValue::Str(DEFAULT_ENCODING.to_owned()));
    };
    for param in value.split(|b| *b == b';').skip(1) {
        let Some(eq) = param.iter().position(|b| *b == b'=') else {
            continue;
        };
        let name = param[..eq].trim_ascii();
        if name.eq_ignore_ascii_case(b"charset") {
            let charset = param[eq + 1..].trim_ascii().to_ascii_lowercase();
            return Ok(ScopeValue::Str(
                String::from_utf8_lossy(&charset).into_owned(),
            ));
        }
    }
    Ok(ScopeValue::Str(DEFAULT_ENCODING.to_owned()))
}

fn produce_json(request: &Request) -> Result<ScopeValue, BoxError> {
    let is_json = request
        .content_type()
        .is_some_and(|ct| ct.as_ref() == JSON_CONTENT_TYPE);
    if !is_json {
        return Ok(ScopeValue::Json(serde_json::Value::Null));
    }
    let value: serde_json::Value = serde_json::from_slice(request.body())
        .map_err(|err| Message::boxed(format!("invalid json body: {err}")))?;
    Ok(ScopeValue::Json(value))
}

/// The `patch_request` component.
pub struct PatchRequest;

impl PatchRequest {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for PatchRequest {
    fn default() -> Self {
        Self::new()
    }
}

struct PatchRequestMiddleware;

impl Middleware for PatchRequestMiddleware {
    fn handle(
        &self,
        request: Request,
        handler: BoxHandler,
        next: Next,
    ) -> impl Future<Output = Result<Reply, BoxError>> + Send + '_ {
        request.set_lazy(keys::PATH, produce_path);
        request.set_lazy(keys::QUERY_PARAMS, produce_query_params);
        request.set_lazy(keys::CONTENT_TYPE, produce_content_type);
        request.set_lazy(keys::ENCODING, produce_encoding);
        request.set_lazy(keys::JSON, produce_json);
        next.call(request, handler)
    }
}

impl Component for PatchRequest {
    fn name(&self) -> &str {
        "patch_request"
    }

    fn middleware(&self) -> Option<BoxMiddleware> {
        Some(BoxMiddleware::new(PatchRequestMiddleware))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patched(request: Request) -> Request {
        request.set_lazy(keys::PATH, produce_path);
        request.set_lazy(keys::QUERY_PARAMS, produce_query_params);
        request.set_lazy(keys::CONTENT_TYPE, produce_content_type);
        request.set_lazy(keys::ENCODING, produce_encoding);
        request.set_lazy(keys::JSON, produce_json);
        request
    }

    #[test]
    fn path_strips_query() {
        let request = patched(Request::new("GET", "/a/b?x=1&y=2"));
        assert_eq!(request.path().as_ref(), b"/a/b");
    }

    #[test]
    fn query_params_decode_into_lists() {
        let request = patched(Request::new("GET", "/p?tag=a&tag=b%20c"));
        let params = request.query_params().unwrap();
        assert_eq!(
            params.get("tag").unwrap(),
            &serde_json::json!(["a", "b c"])
        );
    }

    #[test]
    fn blank_query_values_are_dropped() {
        let request = patched(Request::new("GET", "/p?flag&empty=&tag=x"));
        let params = request.query_params().unwrap();
        assert!(params.get("flag").is_none());
        assert!(params.get("empty").is_none());
        assert_eq!(params.get("tag").unwrap(), &serde_json::json!(["x"]));
    }

    #[test]
    fn plus_decodes_to_space() {
        let request = patched(Request::new("GET", "/p?q=hello+world"));
        let params = request.query_params().unwrap();
        assert_eq!(params.get("q").unwrap(), &serde_json::json!(["hello world"]));
    }

    #[test]
    fn content_type_takes_first_token() {
        let request = patched(
            Request::builder()
                .path("/x")
                .header("content-type", "application/json; charset=UTF-8")
                .build(),
        );
        assert_eq!(request.content_type().unwrap().as_ref(), b"application/json");
        assert_eq!(request.encoding(), "utf-8");
    }

    #[test]
    fn encoding_defaults_to_latin1() {
        let request = patched(Request::new("GET", "/x"));
        assert_eq!(request.encoding(), DEFAULT_ENCODING);
    }

    #[test]
    fn json_body_is_decoded_once() {
        let request = patched(
            Request::builder()
                .path("/x")
                .header("content-type", "application/json")
                .body(&b"{\"ok\": true}"[..])
                .build(),
        );
        let value = request.json().unwrap().unwrap();
        assert_eq!(value, serde_json::json!({"ok": true}));
    }

    #[test]
    fn non_json_body_is_none() {
        let request = patched(
            Request::builder()
                .path("/x")
                .header("content-type", "text/plain")
                .body(&b"{}"[..])
                .build(),
        );
        assert!(request.json().unwrap().is_none());
    }

    #[test]
    fn malformed_json_is_an_error() {
        let request = patched(
            Request::builder()
                .path("/x")
                .header("content-type", "application/json")
                .body(&b"{nope"[..])
                .build(),
        );
        assert!(request.json().is_err());
    }
}
