//! Request logging (`logger`).
//!
//! One structured `tracing` line per request: method, path, protocol,
//! status, body size, elapsed time, stream id and peer address. Sits
//! outermost so it observes the response the client actually gets.

use std::time::Instant;

use blixt_core::Application;
use blixt_core::component::{Component, ComponentError, ConfigMap, ConfigParam};
use blixt_core::error::{BoxError, Message};
use blixt_core::message::Request;
use blixt_core::middleware::{BoxMiddleware, Next};
use blixt_core::reply::Reply;
use blixt_core::scope::keys;
use blixt_core::{BoxHandler, Middleware};

use parking_lot::Mutex;

/// The `logger` component.
pub struct Logger {
    enabled: Mutex<bool>,
}

impl Logger {
    #[must_use]
    pub fn new() -> Self {
        Self {
            enabled: Mutex::new(true),
        }
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

struct LoggerMiddleware;

impl Middleware for LoggerMiddleware {
    fn handle(
        &self,
        request: Request,
        handler: BoxHandler,
        next: Next,
    ) -> impl Future<Output = Result<Reply, BoxError>> + Send + '_ {
        async move {
            let started = Instant::now();
            let outcome = next.call(request.clone(), handler).await;
            let elapsed = started.elapsed();
            let peer = request
                .get(keys::PEER_ADDR)
                .map(|value| value.display_text())
                .unwrap_or_default();
            match &outcome {
                Ok(Reply::Response(response)) => {
                    tracing::info!(
                        method = %String::from_utf8_lossy(request.method()),
                        path = %String::from_utf8_lossy(request.raw_path()),
                        protocol = %String::from_utf8_lossy(request.protocol()),
                        status = response.status,
                        body_size = response.body.len(),
                        elapsed_ms = elapsed.as_secs_f64() * 1000.0,
                        stream = request.stream(),
                        peer = %peer,
                        "request"
                    );
                }
                Ok(_) => {
                    tracing::warn!(
                        method = %String::from_utf8_lossy(request.method()),
                        path = %String::from_utf8_lossy(request.raw_path()),
                        "request finished with an unformatted reply"
                    );
                }
                Err(error) => {
                    tracing::warn!(
                        method = %String::from_utf8_lossy(request.method()),
                        path = %String::from_utf8_lossy(request.raw_path()),
                        error = %error,
                        "request failed"
                    );
                }
            }
            outcome
        }
    }
}

impl Component for Logger {
    fn name(&self) -> &str {
        "logger"
    }

    fn enabled(&self) -> bool {
        *self.enabled.lock()
    }

    fn middleware(&self) -> Option<BoxMiddleware> {
        Some(BoxMiddleware::new(LoggerMiddleware))
    }

    fn start(
        &self,
        _app: &Application,
    ) -> impl Future<Output = Result<(), ComponentError>> + Send + '_ {
        tracing::info!("server starting");
        std::future::ready(Ok(()))
    }

    fn stop(&self, _app: &Application) -> impl Future<Output = Result<(), BoxError>> + Send + '_ {
        tracing::info!("server stopped");
        std::future::ready(Ok(()))
    }

    fn params(&self) -> Vec<ConfigParam> {
        vec![ConfigParam::new("enabled", true)]
    }

    fn configure(&self, values: &ConfigMap) -> Result<(), BoxError> {
        for (key, value) in values {
            match key.as_str() {
                "enabled" => {
                    *self.enabled.lock() = value
                        .as_bool()
                        .ok_or_else(|| Message::boxed("enabled must be a boolean"))?;
                }
                other => {
                    return Err(Message::boxed(format!("logger has no parameter {other:?}")));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn logger_passes_replies_through() {
        let middleware = Logger::new().middleware().unwrap();
        let handler = BoxHandler::new(|_request: Request| async {
            blixt_core::message::Response::new(200, "ok")
        });
        let reply = middleware
            .call(Request::new("GET", "/"), handler, Next::terminal())
            .await
            .unwrap();
        assert_eq!(reply.as_response().unwrap().status, 200);
    }

    #[tokio::test]
    async fn disabled_logger_is_pruned_at_start() {
        let logger = Logger::new();
        let mut values = ConfigMap::new();
        values.insert("enabled".into(), serde_json::json!(false));
        logger.configure(&values).unwrap();
        assert!(!Component::enabled(&logger));
    }
}
