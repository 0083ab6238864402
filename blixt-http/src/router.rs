//! The HTTP router component.
//!
//! Routes are `(matcher, handler, meta)` tuples searched in insertion
//! order; the first match wins. Exact patterns use equality after
//! trailing-slash normalization, templates with `{name}` segments compile
//! to anchored regexes. On a match the captured variables, the pattern and
//! the route metadata are merged write-once into the request scope, and
//! the matched handler replaces the pipeline's terminal handler.

use bytes::Bytes;
use regex::bytes::Regex;

use blixt_core::component::{Component, ConfigMap};
use blixt_core::error::{BoxError, Message};
use blixt_core::message::{Request, Response};
use blixt_core::middleware::{BoxMiddleware, Next};
use blixt_core::scope::{ScopeValue, keys};
use blixt_core::{BoxHandler, Handler};

/// Meta key giving a route a name for [`HttpRouter::url`].
pub const META_NAME: &str = "name";

fn default_not_found() -> BoxHandler {
    BoxHandler::new(|_request: Request| async { Response::new(404, "Not found") })
}

/// Append a trailing slash when absent.
fn slash_append(value: &[u8]) -> Vec<u8> {
    let mut out = value.to_vec();
    if !out.ends_with(b"/") {
        out.push(b'/');
    }
    out
}

/// Compile a `/path/{name}` template into an anchored regex that tolerates
/// a trailing slash.
fn pattern_to_regex(pattern: &[u8]) -> Result<Regex, BoxError> {
    let mut source = String::from("^");
    let text = std::str::from_utf8(pattern)
        .map_err(|_| Message::boxed("route patterns must be valid utf-8"))?;
    let mut rest = text;
    while let Some(open) = rest.find('{') {
        let (literal, tail) = rest.split_at(open);
        source.push_str(literal);
        let close = tail
            .find('}')
            .ok_or_else(|| Message::boxed(format!("unterminated template segment in {text:?}")))?;
        let name = &tail[1..close];
        if name.is_empty() || !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_') {
            return Err(Message::boxed(format!("invalid template name {name:?}")));
        }
        source.push_str("(?P<");
        source.push_str(name);
        source.push_str(">[-_a-zA-Z0-9]+)");
        rest = &tail[close + 1..];
    }
    source.push_str(rest);
    if !source.ends_with('/') {
        source.push('/');
    }
    source.push_str("?$");
    Regex::new(&source).map_err(|err| Message::boxed(format!("invalid route pattern: {err}")))
}

#[derive(Debug, Clone)]
enum Matcher {
    Equals { method: Bytes, pattern: Bytes },
    Regexp {
        method: Bytes,
        pattern: Bytes,
        regex: Regex,
    },
}

impl Matcher {
    fn pattern(&self) -> &Bytes {
        match self {
            Self::Equals { pattern, .. } | Self::Regexp { pattern, .. } => pattern,
        }
    }

    /// Captured scope entries on a match, `None` otherwise.
    fn matches(&self, request: &Request) -> Option<Vec<(String, ScopeValue)>> {
        let path = request.path();
        match self {
            Self::Equals { method, pattern } => {
                if method != request.method() {
                    return None;
                }
                if slash_append(pattern) != slash_append(&path) {
                    return None;
                }
                Some(vec![(
                    keys::PATTERN.to_owned(),
                    ScopeValue::Bytes(pattern.clone()),
                )])
            }
            Self::Regexp {
                method,
                pattern,
                regex,
            } => {
                if method != request.method() {
                    return None;
                }
                let captures = regex.captures(&path)?;
                let mut values = vec![(
                    keys::PATTERN.to_owned(),
                    ScopeValue::Bytes(pattern.clone()),
                )];
                for name in regex.capture_names().flatten() {
                    if let Some(capture) = captures.name(name) {
                        values.push((
                            name.to_owned(),
                            ScopeValue::Str(
                                String::from_utf8_lossy(capture.as_bytes()).into_owned(),
                            ),
                        ));
                    }
                }
                Some(values)
            }
        }
    }
}

#[derive(Clone)]
struct Route {
    matcher: Matcher,
    handler: BoxHandler,
    meta: ConfigMap,
}

fn resolve_routes(
    routes: &[Route],
    not_found: &BoxHandler,
    request: &Request,
) -> (BoxHandler, Vec<(String, ScopeValue)>) {
    for route in routes {
        if let Some(mut captured) = route.matcher.matches(request) {
            for (key, value) in &route.meta {
                captured.push((key.clone(), ScopeValue::Json(value.clone())));
            }
            return (route.handler.clone(), captured);
        }
    }
    (not_found.clone(), Vec::new())
}

/// The router component (`route`).
pub struct HttpRouter {
    routes: Vec<Route>,
    not_found: BoxHandler,
}

impl HttpRouter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            routes: Vec::new(),
            not_found: default_not_found(),
        }
    }

    /// Replace the fallback handler used when no route matches.
    pub fn set_not_found(&mut self, handler: BoxHandler) {
        self.not_found = handler;
    }

    /// Drop all registered routes.
    pub fn clean(&mut self) {
        self.routes.clear();
    }

    /// Register a route. Patterns containing `{` compile to template
    /// matchers, anything else matches by normalized equality.
    pub fn add(
        &mut self,
        method: impl AsRef<[u8]>,
        pattern: impl AsRef<[u8]>,
        handler: BoxHandler,
        meta: ConfigMap,
    ) -> Result<(), BoxError> {
        let method = Bytes::copy_from_slice(&method.as_ref().to_ascii_uppercase());
        let pattern = Bytes::copy_from_slice(pattern.as_ref());
        let matcher = if pattern.contains(&b'{') {
            Matcher::Regexp {
                method,
                regex: pattern_to_regex(&pattern)?,
                pattern,
            }
        } else {
            Matcher::Equals { method, pattern }
        };
        self.routes.push(Route {
            matcher,
            handler,
            meta,
        });
        Ok(())
    }

    pub fn get(&mut self, pattern: impl AsRef<[u8]>, handler: impl Handler) -> Result<(), BoxError> {
        self.add("GET", pattern, BoxHandler::new(handler), ConfigMap::new())
    }

    pub fn post(
        &mut self,
        pattern: impl AsRef<[u8]>,
        handler: impl Handler,
    ) -> Result<(), BoxError> {
        self.add("POST", pattern, BoxHandler::new(handler), ConfigMap::new())
    }

    pub fn put(&mut self, pattern: impl AsRef<[u8]>, handler: impl Handler) -> Result<(), BoxError> {
        self.add("PUT", pattern, BoxHandler::new(handler), ConfigMap::new())
    }

    pub fn delete(
        &mut self,
        pattern: impl AsRef<[u8]>,
        handler: impl Handler,
    ) -> Result<(), BoxError> {
        self.add("DELETE", pattern, BoxHandler::new(handler), ConfigMap::new())
    }

    /// Resolve a request to a handler and the scope entries its match
    /// captured. Falls back to the configured not-found handler.
    #[must_use]
    pub fn resolve(&self, request: &Request) -> (BoxHandler, Vec<(String, ScopeValue)>) {
        resolve_routes(&self.routes, &self.not_found, request)
    }

    /// Render a named route's template with the given values.
    ///
    /// Routes are addressed by their `name` meta entry, or by the pattern
    /// itself. Every `{name}` segment must be provided.
    pub fn url(&self, name: &str, params: &[(&str, &str)]) -> Result<String, BoxError> {
        let route = self
            .routes
            .iter()
            .find(|route| {
                route
                    .meta
                    .get(META_NAME)
                    .and_then(serde_json::Value::as_str)
                    .is_some_and(|n| n == name)
                    || route.matcher.pattern().as_ref() == name.as_bytes()
            })
            .ok_or_else(|| Message::boxed(format!("unknown route {name:?}")))?;
        let pattern = String::from_utf8_lossy(route.matcher.pattern());
        let mut out = String::with_capacity(pattern.len());
        let mut rest = pattern.as_ref();
        while let Some(open) = rest.find('{') {
            let (literal, tail) = rest.split_at(open);
            out.push_str(literal);
            let close = tail
                .find('}')
                .ok_or_else(|| Message::boxed("unterminated template segment"))?;
            let key = &tail[1..close];
            let value = params
                .iter()
                .find(|(name, _)| *name == key)
                .map(|(_, value)| *value)
                .ok_or_else(|| Message::boxed(format!("missing url parameter {key:?}")))?;
            out.push_str(value);
            rest = &tail[close + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }

    /// The compiled regex source of a registered template route, if any.
    /// Exposed for introspection.
    #[must_use]
    pub fn compiled_pattern(&self, pattern: &[u8]) -> Option<String> {
        self.routes.iter().find_map(|route| match &route.matcher {
            Matcher::Regexp {
                pattern: own,
                regex,
                ..
            } if own.as_ref() == pattern => Some(regex.as_str().to_owned()),
            _ => None,
        })
    }
}

impl Default for HttpRouter {
    fn default() -> Self {
        Self::new()
    }
}

struct RouterMiddleware {
    routes: Vec<Route>,
    not_found: BoxHandler,
}

impl blixt_core::Middleware for RouterMiddleware {
    fn handle(
        &self,
        request: Request,
        _handler: BoxHandler,
        next: Next,
    ) -> impl Future<Output = Result<blixt_core::Reply, BoxError>> + Send + '_ {
        let (handler, captured) = resolve_routes(&self.routes, &self.not_found, &request);
        for (key, value) in captured {
            request.set(key, value);
        }
        async move { next.call(request, handler).await }
    }
}

impl Component for HttpRouter {
    fn name(&self) -> &str {
        "route"
    }

    fn middleware(&self) -> Option<BoxMiddleware> {
        Some(BoxMiddleware::new(RouterMiddleware {
            routes: self.routes.clone(),
            not_found: self.not_found.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler() -> BoxHandler {
        BoxHandler::new(|_request: Request| async { "handler" })
    }

    fn named_meta(name: &str) -> ConfigMap {
        let mut meta = ConfigMap::new();
        meta.insert(META_NAME.into(), serde_json::Value::String(name.into()));
        meta
    }

    fn captured<'a>(values: &'a [(String, ScopeValue)], key: &str) -> Option<&'a ScopeValue> {
        values
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value)
    }

    #[test]
    fn pattern_compiles_to_expected_regex() {
        let mut router = HttpRouter::new();
        router
            .add("GET", "/order/{user}/{order}", handler(), ConfigMap::new())
            .unwrap();
        assert_eq!(
            router.compiled_pattern(b"/order/{user}/{order}").unwrap(),
            "^/order/(?P<user>[-_a-zA-Z0-9]+)/(?P<order>[-_a-zA-Z0-9]+)/?$"
        );
    }

    #[test]
    fn resolve_equality_both_slash_forms() {
        for (registered, requested) in [
            ("/test1", "/test1"),
            ("/test1", "/test1/"),
            ("/test1/", "/test1"),
        ] {
            let mut router = HttpRouter::new();
            router
                .add("POST", registered, handler(), ConfigMap::new())
                .unwrap();
            let request = Request::new("POST", requested);
            let (_, values) = router.resolve(&request);
            assert_eq!(
                captured(&values, keys::PATTERN),
                Some(&ScopeValue::Bytes(Bytes::copy_from_slice(
                    registered.as_bytes()
                ))),
                "pattern {registered} vs path {requested}"
            );
        }
    }

    #[test]
    fn method_disambiguates() {
        let mut router = HttpRouter::new();
        router
            .add(
                "POST",
                "/test1",
                BoxHandler::new(|_r: Request| async { "post" }),
                ConfigMap::new(),
            )
            .unwrap();
        router
            .add(
                "GET",
                "/test1",
                BoxHandler::new(|_r: Request| async { "get" }),
                ConfigMap::new(),
            )
            .unwrap();
        let request = Request::new("GET", "/test1");
        let (matched, values) = router.resolve(&request);
        assert!(captured(&values, keys::PATTERN).is_some());
        // run the matched handler to identify it
        let reply = futures_block_on(matched.call(request));
        match reply.unwrap() {
            blixt_core::Reply::Text(text) => assert_eq!(text, "get"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn resolve_template_captures_vars() {
        for (registered, requested) in [
            ("/test/{user}", "/test/myuser"),
            ("/test/{user}", "/test/myuser/"),
            ("/test/{user}/", "/test/myuser"),
        ] {
            let mut router = HttpRouter::new();
            router
                .add("POST", registered, handler(), ConfigMap::new())
                .unwrap();
            let request = Request::new("POST", requested);
            let (_, values) = router.resolve(&request);
            assert_eq!(
                captured(&values, "user"),
                Some(&ScopeValue::Str("myuser".into())),
                "pattern {registered} vs path {requested}"
            );
            assert_eq!(
                captured(&values, keys::PATTERN),
                Some(&ScopeValue::Bytes(Bytes::copy_from_slice(
                    registered.as_bytes()
                )))
            );
        }
    }

    #[test]
    fn resolve_negative_cases() {
        let mut router = HttpRouter::new();
        router
            .add("POST", "/test/{user}", handler(), ConfigMap::new())
            .unwrap();
        for path in ["/test", "/testmyuser", "/test/myuser/test", "/v1/test/myuser"] {
            let request = Request::new("POST", path);
            let (_, values) = router.resolve(&request);
            assert!(values.is_empty(), "path {path} must not match");
        }
        let request = Request::new("GET", "/test/myuser");
        let (_, values) = router.resolve(&request);
        assert!(values.is_empty(), "wrong method must not match");
    }

    #[test]
    fn meta_is_merged_into_captures() {
        let mut router = HttpRouter::new();
        let mut meta = ConfigMap::new();
        meta.insert("template".into(), serde_json::Value::String("page".into()));
        router.add("GET", "/t/{id}", handler(), meta).unwrap();
        let request = Request::new("GET", "/t/abc");
        let (_, values) = router.resolve(&request);
        assert_eq!(
            captured(&values, "template"),
            Some(&ScopeValue::Json(serde_json::Value::String("page".into())))
        );
    }

    #[test]
    fn url_renders_cleanly() {
        let mut router = HttpRouter::new();
        router
            .add("GET", "/order/{user}/{order}", handler(), named_meta("order"))
            .unwrap();
        assert_eq!(
            router
                .url("order", &[("user", "u1"), ("order", "o2")])
                .unwrap(),
            "/order/u1/o2"
        );
        assert!(router.url("order", &[("user", "u1")]).is_err());
        assert!(router.url("nope", &[]).is_err());
    }

    fn futures_block_on<F: Future>(fut: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(fut)
    }
}
