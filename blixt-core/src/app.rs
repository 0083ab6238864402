//! The [`Application`]: owns components, compiles the pipeline, dispatches
//! requests.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::component::{self, BoxComponent, Component, ComponentError, ConfigMap};
use crate::error::{BoxError, Message};
use crate::handler::BoxHandler;
use crate::message::{Request, Response};
use crate::middleware::{BoxMiddleware, Middleware, PipelineFn, terminal_pipeline};

/// The handler used when no middleware (usually the router) supplies one.
fn landing_handler() -> BoxHandler {
    BoxHandler::new(|_request: Request| async {
        Response::new(200, "<html><head></head><body>blixt</body></html>")
            .with_header("content-type", "text/html")
    })
}

/// A user-assembled set of components compiled into one request pipeline.
///
/// Lifecycle: `add`/`configure` while building, `start` once (prunes
/// disabled components and compiles the middleware onion), then `handle`
/// per request until `stop`. `start` and `stop` are idempotent.
pub struct Application {
    components: Vec<BoxComponent>,
    default_handler: BoxHandler,
    pipeline: Option<PipelineFn>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl Default for Application {
    fn default() -> Self {
        Self::new()
    }
}

impl Application {
    #[must_use]
    pub fn new() -> Self {
        Self {
            components: Vec::new(),
            default_handler: landing_handler(),
            pipeline: None,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    /// Replace the terminal handler invoked when no middleware routed the
    /// request elsewhere.
    pub fn set_default_handler(&mut self, handler: BoxHandler) {
        self.default_handler = handler;
    }

    /// Register a component at the end of the list.
    pub fn add(&mut self, component: impl Component) -> Result<(), BoxError> {
        self.add_boxed(BoxComponent::new(component), None)
    }

    /// Register a component at `position` (end of list when `None`).
    pub fn add_at(
        &mut self,
        component: impl Component,
        position: Option<usize>,
    ) -> Result<(), BoxError> {
        self.add_boxed(BoxComponent::new(component), position)
    }

    /// Register a bare middleware wrapped in a synthesized component.
    pub fn add_middleware(
        &mut self,
        name: impl Into<String>,
        middleware: impl Middleware,
    ) -> Result<(), BoxError> {
        self.add_boxed(
            component::from_middleware(name, BoxMiddleware::new(middleware)),
            None,
        )
    }

    pub fn add_boxed(
        &mut self,
        component: BoxComponent,
        position: Option<usize>,
    ) -> Result<(), BoxError> {
        if self.get_component(component.name()).is_some() {
            return Err(Message::boxed(format!(
                "duplicate component name {:?}",
                component.name()
            )));
        }
        let index = position.unwrap_or(self.components.len()).min(self.components.len());
        self.components.insert(index, component);
        let component = &self.components[index];
        component.init(self);
        Ok(())
    }

    /// Apply `{component_name: {attribute: value}}` overrides. Fails when
    /// any component name is unknown or an attribute is not published.
    pub fn configure(&self, config: &ConfigMap) -> Result<(), BoxError> {
        for (name, values) in config {
            let component = self
                .get_component(name)
                .ok_or_else(|| Message::boxed(format!("unknown component {name:?}")))?;
            let values = values
                .as_object()
                .ok_or_else(|| Message::boxed(format!("configuration for {name:?} must be a map")))?;
            component.configure(values)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn get_component(&self, name: &str) -> Option<&BoxComponent> {
        self.components.iter().find(|c| c.name() == name)
    }

    /// All registered components, in pipeline order.
    #[must_use]
    pub fn components(&self) -> &[BoxComponent] {
        &self.components
    }

    /// Start every component, prune the ones that disabled themselves, then
    /// compile the pipeline. Idempotent.
    pub async fn start(&mut self) -> Result<(), BoxError> {
        if self.started.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut disabled = Vec::new();
        for (index, component) in self.components.iter().enumerate() {
            match component.start(self).await {
                Ok(()) => {}
                Err(ComponentError::Disabled) => {
                    tracing::debug!(component = component.name(), "component disabled at start");
                    disabled.push(index);
                }
                Err(ComponentError::Failed(err)) => {
                    return Err(Message::boxed(format!(
                        "component {:?} failed to start: {err}",
                        component.name()
                    )));
                }
            }
        }
        for index in disabled.into_iter().rev() {
            self.components.remove(index);
        }
        self.pipeline = Some(self.compile());
        self.started.store(true, Ordering::Release);
        Ok(())
    }

    /// Right-to-left composition: the first registered component is the
    /// outermost middleware.
    fn compile(&self) -> PipelineFn {
        let mut pipeline = terminal_pipeline();
        for component in self.components.iter().rev() {
            if let Some(middleware) = component.middleware() {
                pipeline = middleware.compose(pipeline);
            }
        }
        pipeline
    }

    /// Stop every component. Idempotent; component stop failures are logged
    /// and swallowed so shutdown always completes.
    pub async fn stop(&self) {
        if !self.started.load(Ordering::Acquire) || self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        for component in &self.components {
            if let Err(err) = component.stop(self).await {
                tracing::warn!(
                    component = component.name(),
                    error = %err,
                    "component stop failed"
                );
            }
        }
    }

    /// Dispatch one request through the compiled pipeline.
    ///
    /// Must not be called before [`Application::start`].
    pub async fn handle(&self, request: Request) -> Result<Response, BoxError> {
        let pipeline = self
            .pipeline
            .as_ref()
            .expect("Application::handle called before start");
        let reply = pipeline(request, self.default_handler.clone()).await?;
        reply.into_response()
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Application")
            .field("components", &self.components)
            .field("started", &self.started)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ConfigParam;
    use crate::middleware::Next;
    use crate::reply::Reply;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct Flaky {
        enabled: bool,
    }

    impl Component for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        fn enabled(&self) -> bool {
            self.enabled
        }

        fn middleware(&self) -> Option<BoxMiddleware> {
            Some(BoxMiddleware::new(
                |request: Request, handler: BoxHandler, next: Next| async move {
                    let reply = next.call(request, handler).await?;
                    match reply {
                        Reply::Text(text) => Ok(Reply::Text(format!("flaky({text})"))),
                        other => Ok(other),
                    }
                },
            ))
        }
    }

    struct Configurable {
        limit: Arc<Mutex<i64>>,
    }

    impl Component for Configurable {
        fn name(&self) -> &str {
            "configurable"
        }

        fn params(&self) -> Vec<ConfigParam> {
            vec![ConfigParam::new("limit", 1)]
        }

        fn configure(&self, values: &ConfigMap) -> Result<(), BoxError> {
            for (key, value) in values {
                match key.as_str() {
                    "limit" => {
                        *self.limit.lock() = value
                            .as_i64()
                            .ok_or_else(|| Message::boxed("limit must be an integer"))?;
                    }
                    other => {
                        return Err(Message::boxed(format!("no parameter {other:?}")));
                    }
                }
            }
            Ok(())
        }
    }

    fn text_pipeline_app(components: Vec<BoxComponent>) -> Application {
        let mut app = Application::new();
        for component in components {
            app.add_boxed(component, None).unwrap();
        }
        app.set_default_handler(BoxHandler::new(|_req: Request| async { "h" }));
        app
    }

    #[tokio::test]
    async fn disabled_components_are_pruned_at_start() {
        let mut app = text_pipeline_app(vec![
            BoxComponent::new(Flaky { enabled: false }),
            component::from_middleware(
                "tail",
                BoxMiddleware::new(
                    |request: Request, handler: BoxHandler, next: Next| async move {
                        let reply = next.call(request, handler).await?;
                        match reply {
                            Reply::Text(text) => Ok(Reply::Text(format!("tail({text})"))),
                            other => Ok(other),
                        }
                    },
                ),
            ),
        ]);
        app.start().await.unwrap();
        assert!(app.get_component("flaky").is_none());
        // the pruned component contributes nothing to the pipeline
        let pipeline = app.pipeline.clone().unwrap();
        let reply = pipeline(
            Request::new("GET", "/"),
            BoxHandler::new(|_req: Request| async { "h" }),
        )
        .await
        .unwrap();
        match reply {
            Reply::Text(text) => assert_eq!(text, "tail(h)"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn configure_rejects_unknown_component() {
        let app = text_pipeline_app(vec![]);
        let mut config = ConfigMap::new();
        config.insert("nope".into(), serde_json::json!({"x": 1}));
        assert!(app.configure(&config).is_err());
    }

    #[tokio::test]
    async fn configure_reaches_component() {
        let limit = Arc::new(Mutex::new(1));
        let mut app = Application::new();
        app.add(Configurable {
            limit: limit.clone(),
        })
        .unwrap();
        let mut config = ConfigMap::new();
        config.insert("configurable".into(), serde_json::json!({"limit": 9}));
        app.configure(&config).unwrap();
        assert_eq!(*limit.lock(), 9);
        let mut bad = ConfigMap::new();
        bad.insert("configurable".into(), serde_json::json!({"bogus": 1}));
        assert!(app.configure(&bad).is_err());
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let mut app = Application::new();
        app.add(Flaky { enabled: true }).unwrap();
        assert!(app.add(Flaky { enabled: true }).is_err());
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let mut app = text_pipeline_app(vec![]);
        app.start().await.unwrap();
        app.start().await.unwrap();
        let response = app.handle(Request::new("GET", "/")).await;
        // default handler yields an unformatted text reply only when the
        // default landing handler was replaced; here it was.
        assert!(response.is_err());
    }
}
