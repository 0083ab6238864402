//! Catch-all error handling (`error_handle`).
//!
//! Wraps everything inside it; any failure becomes a response through the
//! configured `on_error` hook. Sits right inside the logger so the log
//! line still observes the substituted response.

use std::sync::Arc;

use blixt_core::component::Component;
use blixt_core::error::{BoxError, display_chain};
use blixt_core::message::{Request, Response};
use blixt_core::middleware::{BoxMiddleware, Next};
use blixt_core::reply::Reply;
use blixt_core::{BoxHandler, Middleware};

/// Hook building the response for an uncaught failure.
pub type OnError = Arc<dyn Fn(&Request, &BoxError) -> Response + Send + Sync>;

fn default_on_error(request: &Request, error: &BoxError) -> Response {
    tracing::error!(
        method = %String::from_utf8_lossy(request.method()),
        path = %String::from_utf8_lossy(request.raw_path()),
        error = %display_chain(error.as_ref()),
        "unhandled error in request pipeline"
    );
    Response::new(500, display_chain(error.as_ref()))
}

/// The `error_handle` component.
pub struct ErrorHandle {
    on_error: OnError,
}

impl ErrorHandle {
    #[must_use]
    pub fn new() -> Self {
        Self {
            on_error: Arc::new(default_on_error),
        }
    }

    /// Replace the error hook.
    #[must_use]
    pub fn with_on_error(
        mut self,
        on_error: impl Fn(&Request, &BoxError) -> Response + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Arc::new(on_error);
        self
    }
}

impl Default for ErrorHandle {
    fn default() -> Self {
        Self::new()
    }
}

struct ErrorHandleMiddleware {
    on_error: OnError,
}

impl Middleware for ErrorHandleMiddleware {
    fn handle(
        &self,
        request: Request,
        handler: BoxHandler,
        next: Next,
    ) -> impl Future<Output = Result<Reply, BoxError>> + Send + '_ {
        async move {
            match next.call(request.clone(), handler).await {
                Ok(reply) => Ok(reply),
                Err(error) => Ok(Reply::Response((self.on_error)(&request, &error))),
            }
        }
    }
}

impl Component for ErrorHandle {
    fn name(&self) -> &str {
        "error_handle"
    }

    fn middleware(&self) -> Option<BoxMiddleware> {
        Some(BoxMiddleware::new(ErrorHandleMiddleware {
            on_error: self.on_error.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blixt_core::error::Message;

    #[tokio::test]
    async fn failures_become_responses() {
        let component = ErrorHandle::new();
        let middleware = component.middleware().unwrap();
        let handler = BoxHandler::new(|_request: Request| async {
            Err::<Reply, BoxError>(Message::boxed("kaboom"))
        });
        let reply = middleware
            .call(Request::new("GET", "/"), handler, Next::terminal())
            .await
            .unwrap();
        let response = reply.as_response().unwrap();
        assert_eq!(response.status, 500);
        assert_eq!(response.body.as_ref(), b"kaboom");
    }

    #[tokio::test]
    async fn custom_hook_is_used() {
        let component =
            ErrorHandle::new().with_on_error(|_request, _error| Response::new(503, "later"));
        let middleware = component.middleware().unwrap();
        let handler = BoxHandler::new(|_request: Request| async {
            Err::<Reply, BoxError>(Message::boxed("kaboom"))
        });
        let reply = middleware
            .call(Request::new("GET", "/"), handler, Next::terminal())
            .await
            .unwrap();
        assert_eq!(reply.as_response().unwrap().status, 503);
    }

    #[tokio::test]
    async fn success_passes_through() {
        let component = ErrorHandle::new();
        let middleware = component.middleware().unwrap();
        let handler = BoxHandler::new(|_request: Request| async { "fine" });
        let reply = middleware
            .call(Request::new("GET", "/"), handler, Next::terminal())
            .await
            .unwrap();
        assert!(matches!(reply, Reply::Text(text) if text == "fine"));
    }
}
