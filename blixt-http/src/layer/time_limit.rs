//! Per-request deadline (`handler_timeout`).
//!
//! The inner chain races a delay; when the delay wins, the inner future is
//! dropped (cancellation is cooperative at its next suspension point) and
//! a `500 Timeout` response takes its place.

use std::time::Duration;

use parking_lot::Mutex;

use blixt_core::component::{Component, ConfigMap, ConfigParam};
use blixt_core::error::{BoxError, Message};
use blixt_core::message::{Request, Response};
use blixt_core::middleware::{BoxMiddleware, Next};
use blixt_core::reply::Reply;
use blixt_core::{BoxHandler, Middleware};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// The `handler_timeout` component.
pub struct TimeLimit {
    timeout: Mutex<Duration>,
}

impl TimeLimit {
    #[must_use]
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Mutex::new(timeout),
        }
    }
}

impl Default for TimeLimit {
    fn default() -> Self {
        Self::new()
    }
}

struct TimeLimitMiddleware {
    timeout: Duration,
}

impl Middleware for TimeLimitMiddleware {
    fn handle(
        &self,
        request: Request,
        handler: BoxHandler,
        next: Next,
    ) -> impl Future<Output = Result<Reply, BoxError>> + Send + '_ {
        let timeout = self.timeout;
        async move {
            tokio::select! {
                reply = next.call(request, handler) => reply,
                () = tokio::time::sleep(timeout) => {
                    Ok(Reply::Response(Response::new(500, "Timeout")))
                }
            }
        }
    }
}

impl Component for TimeLimit {
    fn name(&self) -> &str {
        "handler_timeout"
    }

    fn middleware(&self) -> Option<BoxMiddleware> {
        Some(BoxMiddleware::new(TimeLimitMiddleware {
            timeout: *self.timeout.lock(),
        }))
    }

    fn params(&self) -> Vec<ConfigParam> {
        vec![ConfigParam::new("timeout", DEFAULT_TIMEOUT.as_secs_f64())]
    }

    fn configure(&self, values: &ConfigMap) -> Result<(), BoxError> {
        for (key, value) in values {
            match key.as_str() {
                "timeout" => {
                    let secs = value
                        .as_f64()
                        .filter(|secs| *secs > 0.0)
                        .ok_or_else(|| Message::boxed("timeout must be a positive number"))?;
                    *self.timeout.lock() = Duration::from_secs_f64(secs);
                }
                other => {
                    return Err(Message::boxed(format!(
                        "handler_timeout has no parameter {other:?}"
                    )));
                }
            }
        }
        Ok(())
    }
}
