//! [`Handler`] and [`BoxHandler`].
//!
//! A handler is the innermost element of the pipeline: one async method
//! from [`Request`] to a [`Reply`]. [`BoxHandler`] is the dyn-dispatch form
//! the router stores and middlewares swap; it also carries the one piece of
//! metadata middleware cannot discover at runtime in Rust — whether the
//! handler is a blocking function that should be offloaded to a worker.

use std::sync::Arc;

use crate::BoxFuture;
use crate::error::BoxError;
use crate::message::Request;
use crate::reply::{IntoReplyResult, Reply};

/// An async request handler.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, request: Request) -> impl Future<Output = Result<Reply, BoxError>> + Send + '_;
}

impl<F, Fut, R> Handler for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoReplyResult + Send + 'static,
{
    fn call(&self, request: Request) -> impl Future<Output = Result<Reply, BoxError>> + Send + '_ {
        let fut = (self)(request);
        async move { fut.await.into_reply_result() }
    }
}

/// A blocking handler body, run off the event loop by the offload
/// middlewares.
pub type BlockingFn = Arc<dyn Fn(Request) -> Result<Reply, BoxError> + Send + Sync>;

/// Internal trait for dynamic dispatch of the async handler method,
/// following the builder-provider pattern the async-fn-in-trait rollout
/// documented.
trait DynHandler: Send + Sync {
    fn call_arc(self: Arc<Self>, request: Request) -> BoxFuture<'static, Result<Reply, BoxError>>;
}

impl<T> DynHandler for T
where
    T: Handler,
{
    fn call_arc(self: Arc<Self>, request: Request) -> BoxFuture<'static, Result<Reply, BoxError>> {
        Box::pin(async move { self.call(request).await })
    }
}

#[derive(Clone)]
enum Kind {
    Async(Arc<dyn DynHandler>),
    Blocking(BlockingFn),
}

/// A boxed [`Handler`] for dynamic dispatch. Cloning is cheap.
#[derive(Clone)]
pub struct BoxHandler {
    kind: Kind,
}

impl BoxHandler {
    /// Box an async handler.
    pub fn new<H: Handler>(handler: H) -> Self {
        Self {
            kind: Kind::Async(Arc::new(handler)),
        }
    }

    /// Box a blocking function as a handler.
    ///
    /// Without offloading it runs inline on the event loop; the
    /// sync-to-async middleware detects the flag and moves the call to a
    /// worker.
    pub fn blocking<F, R>(f: F) -> Self
    where
        F: Fn(Request) -> R + Send + Sync + 'static,
        R: IntoReplyResult,
    {
        Self {
            kind: Kind::Blocking(Arc::new(move |request| f(request).into_reply_result())),
        }
    }

    /// True for handlers declared blocking at construction.
    #[must_use]
    pub fn is_blocking(&self) -> bool {
        matches!(self.kind, Kind::Blocking(_))
    }

    /// The blocking body, for middlewares that re-home it onto a worker.
    #[must_use]
    pub fn blocking_fn(&self) -> Option<BlockingFn> {
        match &self.kind {
            Kind::Blocking(f) => Some(f.clone()),
            Kind::Async(_) => None,
        }
    }

    /// Invoke the handler. The returned future owns everything it needs,
    /// so it may be spawned or raced against a deadline.
    #[must_use]
    pub fn call(&self, request: Request) -> BoxFuture<'static, Result<Reply, BoxError>> {
        match &self.kind {
            Kind::Async(handler) => handler.clone().call_arc(request),
            Kind::Blocking(f) => {
                let f = f.clone();
                Box::pin(async move { f(request) })
            }
        }
    }
}

impl std::fmt::Debug for BoxHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            Kind::Async(_) => f.write_str("BoxHandler::Async"),
            Kind::Blocking(_) => f.write_str("BoxHandler::Blocking"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Response;

    #[tokio::test]
    async fn closure_handlers_lift_values() {
        let handler = BoxHandler::new(|_req: Request| async { "hello" });
        let reply = handler.call(Request::new("GET", "/")).await.unwrap();
        match reply {
            Reply::Text(text) => assert_eq!(text, "hello"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn fallible_handlers_propagate_errors() {
        let handler = BoxHandler::new(|_req: Request| async {
            Err::<Reply, BoxError>(crate::error::Message::boxed("boom"))
        });
        let err = handler.call(Request::new("GET", "/")).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[tokio::test]
    async fn blocking_handlers_run_inline_without_offload() {
        let handler = BoxHandler::blocking(|_req| Response::new(200, "sync"));
        assert!(handler.is_blocking());
        let reply = handler.call(Request::new("GET", "/")).await.unwrap();
        assert_eq!(reply.as_response().unwrap().body.as_ref(), b"sync");
    }
}
