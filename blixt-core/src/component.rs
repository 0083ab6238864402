//! [`Component`]: the registrable unit an [`Application`] is assembled from.
//!
//! A component bundles zero or one middleware with lifecycle hooks and an
//! explicit list of configurable parameters. Components are owned by the
//! application; the hooks only ever borrow it, so there is no cycle to
//! manage.

use std::any::Any;

use crate::BoxFuture;
use crate::app::Application;
use crate::error::BoxError;
use crate::middleware::BoxMiddleware;

/// Per-component configuration values, as passed to
/// [`Application::configure`](crate::Application::configure).
pub type ConfigMap = serde_json::Map<String, serde_json::Value>;

/// A configurable parameter a component publishes: name and default.
#[derive(Debug, Clone)]
pub struct ConfigParam {
    pub name: &'static str,
    pub default: serde_json::Value,
}

impl ConfigParam {
    #[must_use]
    pub fn new(name: &'static str, default: impl Into<serde_json::Value>) -> Self {
        Self {
            name,
            default: default.into(),
        }
    }
}

/// Failure modes of [`Component::start`].
#[derive(Debug)]
pub enum ComponentError {
    /// The component asks to be removed from the active list. Not an error
    /// to the user.
    Disabled,
    /// Startup genuinely failed; aborts application start.
    Failed(BoxError),
}

impl std::fmt::Display for ComponentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disabled => f.write_str("component disabled"),
            Self::Failed(err) => write!(f, "component start failed: {err}"),
        }
    }
}

impl std::error::Error for ComponentError {}

impl From<BoxError> for ComponentError {
    fn from(err: BoxError) -> Self {
        Self::Failed(err)
    }
}

/// A unit of application behavior with lifecycle hooks.
///
/// `start` runs once before the first request, `stop` once at shutdown;
/// both are async because components may own pools or sockets. A component
/// whose `start` returns [`ComponentError::Disabled`] is pruned. The
/// `enabled` flag gives the common disable-by-configuration case a default
/// implementation.
pub trait Component: Send + Sync + 'static {
    /// Unique name within an application.
    fn name(&self) -> &str;

    /// The middleware this component contributes, if any. Called when the
    /// pipeline is compiled, after `start`.
    fn middleware(&self) -> Option<BoxMiddleware> {
        None
    }

    /// Whether the component should survive `start`. Configurable via the
    /// implicit `enabled` parameter.
    fn enabled(&self) -> bool {
        true
    }

    /// Called once at registration.
    fn init(&self, _app: &Application) {}

    fn start(
        &self,
        _app: &Application,
    ) -> impl Future<Output = Result<(), ComponentError>> + Send + '_ {
        std::future::ready(Ok(()))
    }

    fn stop(&self, _app: &Application) -> impl Future<Output = Result<(), BoxError>> + Send + '_ {
        std::future::ready(Ok(()))
    }

    /// The parameters this component accepts via
    /// [`Application::configure`](crate::Application::configure).
    fn params(&self) -> Vec<ConfigParam> {
        Vec::new()
    }

    /// Apply configuration overrides. Unknown keys are an error.
    fn configure(&self, values: &ConfigMap) -> Result<(), BoxError> {
        if let Some((key, _)) = values.iter().next() {
            return Err(crate::error::Message::boxed(format!(
                "component {:?} has no parameter {key:?}",
                self.name()
            )));
        }
        Ok(())
    }
}

trait DynComponent: Send + Sync {
    fn name(&self) -> &str;
    fn middleware(&self) -> Option<BoxMiddleware>;
    fn enabled(&self) -> bool;
    fn init(&self, app: &Application);
    fn start_box<'a>(&'a self, app: &'a Application)
    -> BoxFuture<'a, Result<(), ComponentError>>;
    fn stop_box<'a>(&'a self, app: &'a Application) -> BoxFuture<'a, Result<(), BoxError>>;
    fn params(&self) -> Vec<ConfigParam>;
    fn configure(&self, values: &ConfigMap) -> Result<(), BoxError>;
    fn as_any(&self) -> &dyn Any;
}

impl<T> DynComponent for T
where
    T: Component,
{
    fn name(&self) -> &str {
        Component::name(self)
    }

    fn middleware(&self) -> Option<BoxMiddleware> {
        Component::middleware(self)
    }

    fn enabled(&self) -> bool {
        Component::enabled(self)
    }

    fn init(&self, app: &Application) {
        Component::init(self, app);
    }

    fn start_box<'a>(
        &'a self,
        app: &'a Application,
    ) -> BoxFuture<'a, Result<(), ComponentError>> {
        Box::pin(async move {
            if !Component::enabled(self) {
                return Err(ComponentError::Disabled);
            }
            Component::start(self, app).await
        })
    }

    fn stop_box<'a>(&'a self, app: &'a Application) -> BoxFuture<'a, Result<(), BoxError>> {
        Box::pin(Component::stop(self, app))
    }

    fn params(&self) -> Vec<ConfigParam> {
        Component::params(self)
    }

    fn configure(&self, values: &ConfigMap) -> Result<(), BoxError> {
        Component::configure(self, values)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A boxed [`Component`], as stored by the application.
pub struct BoxComponent {
    inner: Box<dyn DynComponent>,
}

impl BoxComponent {
    pub fn new<C: Component>(component: C) -> Self {
        Self {
            inner: Box::new(component),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    #[must_use]
    pub fn middleware(&self) -> Option<BoxMiddleware> {
        self.inner.middleware()
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.inner.enabled()
    }

    pub fn init(&self, app: &Application) {
        self.inner.init(app);
    }

    pub fn start<'a>(&'a self, app: &'a Application) -> BoxFuture<'a, Result<(), ComponentError>> {
        self.inner.start_box(app)
    }

    pub fn stop<'a>(&'a self, app: &'a Application) -> BoxFuture<'a, Result<(), BoxError>> {
        self.inner.stop_box(app)
    }

    #[must_use]
    pub fn params(&self) -> Vec<ConfigParam> {
        self.inner.params()
    }

    pub fn configure(&self, values: &ConfigMap) -> Result<(), BoxError> {
        self.inner.configure(values)
    }

    /// Borrow the concrete component back out.
    #[must_use]
    pub fn downcast_ref<C: Component>(&self) -> Option<&C> {
        self.inner.as_any().downcast_ref()
    }
}

impl std::fmt::Debug for BoxComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxComponent")
            .field("name", &self.name())
            .finish()
    }
}

struct MiddlewareComponent {
    name: String,
    middleware: BoxMiddleware,
}

impl Component for MiddlewareComponent {
    fn name(&self) -> &str {
        &self.name
    }

    fn middleware(&self) -> Option<BoxMiddleware> {
        Some(self.middleware.clone())
    }
}

/// Wrap a bare middleware in a synthesized component, for
/// [`Application::add_middleware`](crate::Application::add_middleware).
#[must_use]
pub fn from_middleware(name: impl Into<String>, middleware: BoxMiddleware) -> BoxComponent {
    BoxComponent::new(MiddlewareComponent {
        name: name.into(),
        middleware,
    })
}
