//! Server-push bookkeeping (`push`).
//!
//! Handlers record push hints through [`Request::add_push`]; after the
//! inner chain (including the formatters) produced a response, the
//! accumulated hints plus an optional route-meta `push` template are
//! transferred onto `Response::pushes`. The parser decides later whether
//! the connection can actually push.

use blixt_core::component::Component;
use blixt_core::error::{BoxError, Message};
use blixt_core::message::{Push, Request};
use blixt_core::middleware::{BoxMiddleware, Next};
use blixt_core::reply::Reply;
use blixt_core::scope::{ScopeValue, keys};
use blixt_core::{BoxHandler, Middleware};

/// Render a `/{var}` template against the request scope.
fn render_scope_template(template: &str, request: &Request) -> Result<String, BoxError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let (literal, tail) = rest.split_at(open);
        out.push_str(literal);
        let close = tail
            .find('}')
            .ok_or_else(|| Message::boxed("unterminated push template"))?;
        let key = &tail[1..close];
        let value = request
            .try_get(key)?
            .ok_or_else(|| Message::boxed(format!("push template key {key:?} not in scope")))?;
        out.push_str(&value.display_text());
        rest = &tail[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// The `push` component.
pub struct PushState;

impl PushState {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for PushState {
    fn default() -> Self {
        Self::new()
    }
}

struct PushMiddleware;

impl Middleware for PushMiddleware {
    fn handle(
        &self,
        request: Request,
        handler: BoxHandler,
        next: Next,
    ) -> impl Future<Output = Result<Reply, BoxError>> + Send + '_ {
        async move {
            let reply = next.call(request.clone(), handler).await?;
            let Reply::Response(mut response) = reply else {
                return Ok(reply);
            };
            if response.push {
                // pushed responses never push further
                return Ok(Reply::Response(response));
            }
            if let Some(ScopeValue::Pushes(pushes)) = request.get(keys::PUSHES) {
                response.pushes = pushes;
            }
            if let Some(template) = request.get("push")
                && let Some(template) = template.as_str()
            {
                let path = render_scope_template(template, &request)?;
                response.pushes.push(Push::new(path));
            }
            Ok(Reply::Response(response))
        }
    }
}

impl Component for PushState {
    fn name(&self) -> &str {
        "push"
    }

    fn middleware(&self) -> Option<BoxMiddleware> {
        Some(BoxMiddleware::new(PushMiddleware))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blixt_core::message::Response;

    fn response_handler() -> BoxHandler {
        BoxHandler::new(|request: Request| async move {
            request.add_push("/style.css", "GET");
            Response::new(200, "page")
        })
    }

    #[tokio::test]
    async fn accumulated_pushes_reach_the_response() {
        let middleware = PushState::new().middleware().unwrap();
        let reply = middleware
            .call(Request::new("GET", "/"), response_handler(), Next::terminal())
            .await
            .unwrap();
        let response = reply.as_response().unwrap();
        assert_eq!(response.pushes.len(), 1);
        assert_eq!(response.pushes[0].path.as_ref(), b"/style.css");
    }

    #[tokio::test]
    async fn meta_template_is_rendered_from_scope() {
        let middleware = PushState::new().middleware().unwrap();
        let request = Request::new("GET", "/u/alice");
        request.set("user", "alice");
        request.set("push", "/feed/{user}");
        let handler = BoxHandler::new(|_request: Request| async { Response::new(200, "x") });
        let reply = middleware
            .call(request, handler, Next::terminal())
            .await
            .unwrap();
        let response = reply.as_response().unwrap();
        assert_eq!(response.pushes.len(), 1);
        assert_eq!(response.pushes[0].path.as_ref(), b"/feed/alice");
    }

    #[tokio::test]
    async fn missing_template_key_is_an_error() {
        let middleware = PushState::new().middleware().unwrap();
        let request = Request::new("GET", "/");
        request.set("push", "/feed/{user}");
        let handler = BoxHandler::new(|_request: Request| async { Response::new(200, "x") });
        assert!(
            middleware
                .call(request, handler, Next::terminal())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn pushed_responses_do_not_recurse() {
        let middleware = PushState::new().middleware().unwrap();
        let request = Request::new("GET", "/");
        request.set("push", "/never");
        let handler = BoxHandler::new(|_request: Request| async {
            let mut response = Response::new(200, "pushed");
            response.push = true;
            response
        });
        let reply = middleware
            .call(request, handler, Next::terminal())
            .await
            .unwrap();
        assert!(reply.as_response().unwrap().pushes.is_empty());
    }
}
