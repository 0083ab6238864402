//! [`Middleware`] and the compiled pipeline.
//!
//! A middleware wraps the remainder of the chain: it receives the request,
//! the current handler, and a [`Next`] that invokes everything inside it.
//! A middleware may swap the handler before delegating, short-circuit by
//! returning a reply without calling [`Next::call`], or transform the reply
//! on the way out. The chain is composed right-to-left once, at
//! application start.

use std::sync::Arc;

use crate::BoxFuture;
use crate::error::BoxError;
use crate::handler::BoxHandler;
use crate::message::Request;
use crate::reply::Reply;

/// The compiled form of a (partial) middleware chain.
pub type PipelineFn =
    Arc<dyn Fn(Request, BoxHandler) -> BoxFuture<'static, Result<Reply, BoxError>> + Send + Sync>;

/// One unit of pipeline behavior.
pub trait Middleware: Send + Sync + 'static {
    fn handle(
        &self,
        request: Request,
        handler: BoxHandler,
        next: Next,
    ) -> impl Future<Output = Result<Reply, BoxError>> + Send + '_;
}

impl<F, Fut> Middleware for F
where
    F: Fn(Request, BoxHandler, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Reply, BoxError>> + Send + 'static,
{
    fn handle(
        &self,
        request: Request,
        handler: BoxHandler,
        next: Next,
    ) -> impl Future<Output = Result<Reply, BoxError>> + Send + '_ {
        (self)(request, handler, next)
    }
}

trait DynMiddleware: Send + Sync {
    fn handle_arc(
        self: Arc<Self>,
        request: Request,
        handler: BoxHandler,
        next: Next,
    ) -> BoxFuture<'static, Result<Reply, BoxError>>;
}

impl<T> DynMiddleware for T
where
    T: Middleware,
{
    fn handle_arc(
        self: Arc<Self>,
        request: Request,
        handler: BoxHandler,
        next: Next,
    ) -> BoxFuture<'static, Result<Reply, BoxError>> {
        Box::pin(async move { self.handle(request, handler, next).await })
    }
}

/// A boxed [`Middleware`] for storage inside components.
#[derive(Clone)]
pub struct BoxMiddleware {
    inner: Arc<dyn DynMiddleware>,
}

impl BoxMiddleware {
    pub fn new<M: Middleware>(middleware: M) -> Self {
        Self {
            inner: Arc::new(middleware),
        }
    }

    #[must_use]
    pub fn call(
        &self,
        request: Request,
        handler: BoxHandler,
        next: Next,
    ) -> BoxFuture<'static, Result<Reply, BoxError>> {
        self.inner.clone().handle_arc(request, handler, next)
    }

    /// Wrap an inner chain, producing the compiled form of `self ∘ inner`.
    #[must_use]
    pub fn compose(&self, inner: PipelineFn) -> PipelineFn {
        let middleware = self.clone();
        Arc::new(move |request, handler| {
            middleware.call(request, handler, Next::new(inner.clone()))
        })
    }
}

impl std::fmt::Debug for BoxMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BoxMiddleware")
    }
}

/// The continuation handed to a middleware: everything inside it, ending in
/// the handler itself.
#[derive(Clone)]
pub struct Next {
    inner: PipelineFn,
}

impl Next {
    #[must_use]
    pub fn new(inner: PipelineFn) -> Self {
        Self { inner }
    }

    /// The terminal continuation: invokes the handler.
    #[must_use]
    pub fn terminal() -> Self {
        Self {
            inner: terminal_pipeline(),
        }
    }

    pub fn call(
        &self,
        request: Request,
        handler: BoxHandler,
    ) -> BoxFuture<'static, Result<Reply, BoxError>> {
        (self.inner)(request, handler)
    }
}

impl std::fmt::Debug for Next {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Next")
    }
}

/// The innermost pipeline stage: call the handler.
#[must_use]
pub fn terminal_pipeline() -> PipelineFn {
    Arc::new(|request, handler: BoxHandler| handler.call(request))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn tracing_middleware(log: Arc<Mutex<Vec<String>>>, tag: &'static str) -> BoxMiddleware {
        BoxMiddleware::new(move |request: Request, handler: BoxHandler, next: Next| {
            let log = log.clone();
            async move {
                log.lock().push(format!("{tag}:in"));
                let reply = next.call(request, handler).await;
                log.lock().push(format!("{tag}:out"));
                reply
            }
        })
    }

    #[tokio::test]
    async fn composition_runs_outside_in_and_back() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = [
            tracing_middleware(log.clone(), "a"),
            tracing_middleware(log.clone(), "b"),
            tracing_middleware(log.clone(), "c"),
        ];
        let mut pipeline = terminal_pipeline();
        for middleware in chain.iter().rev() {
            pipeline = middleware.compose(pipeline);
        }
        let log_in_handler = log.clone();
        let handler = BoxHandler::new(move |_req: Request| {
            let log = log_in_handler.clone();
            async move {
                log.lock().push("handler".to_owned());
                "done"
            }
        });
        pipeline(Request::new("GET", "/"), handler).await.unwrap();
        assert_eq!(
            log.lock().as_slice(),
            ["a:in", "b:in", "c:in", "handler", "c:out", "b:out", "a:out"]
        );
    }

    #[tokio::test]
    async fn middleware_may_short_circuit() {
        let middleware = BoxMiddleware::new(
            |_request: Request, _handler: BoxHandler, _next: Next| async move {
                Ok(Reply::Text("short".into()))
            },
        );
        let pipeline = middleware.compose(terminal_pipeline());
        let handler = BoxHandler::new(|_req: Request| async {
            Err::<Reply, BoxError>(crate::error::Message::boxed("handler must not run"))
        });
        let reply = pipeline(Request::new("GET", "/"), handler).await.unwrap();
        match reply {
            Reply::Text(text) => assert_eq!(text, "short"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
