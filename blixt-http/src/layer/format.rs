//! Response formatters (`json_format`, `text_format`, `templates`).
//!
//! After the inner chain returns, the first formatter whose shape matches
//! claims the reply and lifts it into a full response; everything else
//! passes through untouched. A `status` scope entry overrides the default
//! 200.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use blixt_core::component::{Component, ConfigMap, ConfigParam};
use blixt_core::error::{BoxError, Message};
use blixt_core::message::{Request, Response};
use blixt_core::middleware::{BoxMiddleware, Next};
use blixt_core::reply::Reply;
use blixt_core::scope::{ScopeValue, keys};
use blixt_core::{BoxHandler, Middleware};

fn status_from_scope(request: &Request) -> u16 {
    match request.get(keys::STATUS) {
        Some(ScopeValue::Int(status)) => u16::try_from(status).unwrap_or(200),
        Some(ScopeValue::Json(value)) => value
            .as_u64()
            .and_then(|status| u16::try_from(status).ok())
            .unwrap_or(200),
        _ => 200,
    }
}

/// The `json_format` component: maps and sequences become JSON responses.
pub struct JsonFormat {
    content_type: Mutex<String>,
}

impl JsonFormat {
    #[must_use]
    pub fn new() -> Self {
        Self {
            content_type: Mutex::new("application/json".to_owned()),
        }
    }
}

impl Default for JsonFormat {
    fn default() -> Self {
        Self::new()
    }
}

struct JsonFormatMiddleware {
    content_type: String,
}

impl Middleware for JsonFormatMiddleware {
    fn handle(
        &self,
        request: Request,
        handler: BoxHandler,
        next: Next,
    ) -> impl Future<Output = Result<Reply, BoxError>> + Send + '_ {
        async move {
            let reply = next.call(request.clone(), handler).await?;
            match reply {
                Reply::Json(value) => {
                    let body = serde_json::to_vec(&value)
                        .map_err(|err| Message::boxed(format!("json encoding failed: {err}")))?;
                    Ok(Reply::Response(
                        Response::new(status_from_scope(&request), body)
                            .with_header("content-type", self.content_type.clone()),
                    ))
                }
                other => Ok(other),
            }
        }
    }
}

impl Component for JsonFormat {
    fn name(&self) -> &str {
        "json_format"
    }

    fn middleware(&self) -> Option<BoxMiddleware> {
        Some(BoxMiddleware::new(JsonFormatMiddleware {
            content_type: self.content_type.lock().clone(),
        }))
    }

    fn params(&self) -> Vec<ConfigParam> {
        vec![ConfigParam::new("content_type", "application/json")]
    }

    fn configure(&self, values: &ConfigMap) -> Result<(), BoxError> {
        configure_content_type("json_format", &self.content_type, values)
    }
}

/// The `text_format` component: strings and bytes become text responses.
pub struct TextFormat {
    content_type: Mutex<String>,
}

impl TextFormat {
    #[must_use]
    pub fn new() -> Self {
        Self {
            content_type: Mutex::new("text/html".to_owned()),
        }
    }
}

impl Default for TextFormat {
    fn default() -> Self {
        Self::new()
    }
}

struct TextFormatMiddleware {
    content_type: String,
}

impl Middleware for TextFormatMiddleware {
    fn handle(
        &self,
        request: Request,
        handler: BoxHandler,
        next: Next,
    ) -> impl Future<Output = Result<Reply, BoxError>> + Send + '_ {
        async move {
            let reply = next.call(request.clone(), handler).await?;
            let body: Bytes = match reply {
                Reply::Text(text) => Bytes::from(text.into_bytes()),
                Reply::Bytes(bytes) => bytes,
                other => return Ok(other),
            };
            Ok(Reply::Response(
                Response::new(status_from_scope(&request), body)
                    .with_header("content-type", self.content_type.clone()),
            ))
        }
    }
}

impl Component for TextFormat {
    fn name(&self) -> &str {
        "text_format"
    }

    fn middleware(&self) -> Option<BoxMiddleware> {
        Some(BoxMiddleware::new(TextFormatMiddleware {
            content_type: self.content_type.lock().clone(),
        }))
    }

    fn params(&self) -> Vec<ConfigParam> {
        vec![ConfigParam::new("content_type", "text/html")]
    }

    fn configure(&self, values: &ConfigMap) -> Result<(), BoxError> {
        configure_content_type("text_format", &self.content_type, values)
    }
}

fn configure_content_type(
    component: &str,
    slot: &Mutex<String>,
    values: &ConfigMap,
) -> Result<(), BoxError> {
    for (key, value) in values {
        match key.as_str() {
            "content_type" => {
                let content_type = value
                    .as_str()
                    .ok_or_else(|| Message::boxed("content_type must be a string"))?;
                *slot.lock() = content_type.to_owned();
            }
            other => {
                return Err(Message::boxed(format!(
                    "{component} has no parameter {other:?}"
                )));
            }
        }
    }
    Ok(())
}

/// Renders a registered template against a context.
pub trait TemplateEngine: Send + Sync + 'static {
    fn render(
        &self,
        name: &str,
        context: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Bytes, BoxError>;
}

/// The built-in engine: an in-memory name → template map with `${name}`
/// substitution. Unknown placeholders are left in place.
#[derive(Debug, Default)]
pub struct MapTemplates {
    templates: HashMap<String, String>,
}

impl MapTemplates {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, template: impl Into<String>) {
        self.templates.insert(name.into(), template.into());
    }
}

fn value_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

impl TemplateEngine for MapTemplates {
    fn render(
        &self,
        name: &str,
        context: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Bytes, BoxError> {
        let template = self
            .templates
            .get(name)
            .ok_or_else(|| Message::boxed(format!("unknown template {name:?}")))?;
        let mut out = String::with_capacity(template.len());
        let mut rest = template.as_str();
        while let Some(open) = rest.find("${") {
            let (literal, tail) = rest.split_at(open);
            out.push_str(literal);
            match tail.find('}') {
                Some(close) => {
                    let key = &tail[2..close];
                    match context.get(key) {
                        Some(value) => out.push_str(&value_text(value)),
                        None => out.push_str(&tail[..=close]),
                    }
                    rest = &tail[close + 1..];
                }
                None => {
                    out.push_str(tail);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        Ok(Bytes::from(out.into_bytes()))
    }
}

/// The `templates` component: `Template` replies (or JSON objects on
/// routes whose meta names a template) become rendered responses.
pub struct TemplateFormat {
    engine: Arc<dyn TemplateEngine>,
    content_type: Mutex<String>,
}

impl TemplateFormat {
    #[must_use]
    pub fn new() -> Self {
        Self::with_engine(MapTemplates::new())
    }

    #[must_use]
    pub fn with_engine(engine: impl TemplateEngine) -> Self {
        Self {
            engine: Arc::new(engine),
            content_type: Mutex::new("text/html".to_owned()),
        }
    }
}

impl Default for TemplateFormat {
    fn default() -> Self {
        Self::new()
    }
}

struct TemplateFormatMiddleware {
    engine: Arc<dyn TemplateEngine>,
    content_type: String,
}

impl TemplateFormatMiddleware {
    /// Overlay resolved scope values onto the render context; the scope
    /// wins, matching how handlers expect captured variables to appear in
    /// their pages.
    fn context_with_scope(
        &self,
        mut context: serde_json::Map<String, serde_json::Value>,
        request: &Request,
    ) -> serde_json::Map<String, serde_json::Value> {
        for (key, value) in request.scope().resolved_entries() {
            let rendered = match value {
                ScopeValue::Json(json) => json,
                other => serde_json::Value::String(other.display_text()),
            };
            context.insert(key, rendered);
        }
        context
    }
}

impl Middleware for TemplateFormatMiddleware {
    fn handle(
        &self,
        request: Request,
        handler: BoxHandler,
        next: Next,
    ) -> impl Future<Output = Result<Reply, BoxError>> + Send + '_ {
        async move {
            let reply = next.call(request.clone(), handler).await?;
            let (name, context) = match reply {
                Reply::Template(template) => (template.name, template.context),
                Reply::Json(serde_json::Value::Object(map)) => {
                    let Some(name) = request
                        .get("template")
                        .and_then(|value| value.as_str().map(str::to_owned))
                    else {
                        return Ok(Reply::Json(serde_json::Value::Object(map)));
                    };
                    (name, map)
                }
                other => return Ok(other),
            };
            let context = self.context_with_scope(context, &request);
            let body = self.engine.render(&name, &context)?;
            Ok(Reply::Response(
                Response::new(status_from_scope(&request), body)
                    .with_header("content-type", self.content_type.clone()),
            ))
        }
    }
}

impl Component for TemplateFormat {
    fn name(&self) -> &str {
        "templates"
    }

    fn middleware(&self) -> Option<BoxMiddleware> {
        Some(BoxMiddleware::new(TemplateFormatMiddleware {
            engine: self.engine.clone(),
            content_type: self.content_type.lock().clone(),
        }))
    }

    fn params(&self) -> Vec<ConfigParam> {
        vec![ConfigParam::new("content_type", "text/html")]
    }

    fn configure(&self, values: &ConfigMap) -> Result<(), BoxError> {
        configure_content_type("templates", &self.content_type, values)
    }
}
