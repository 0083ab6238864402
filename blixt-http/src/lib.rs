//! HTTP protocol support for the `blixt` framework.
//!
//! Two wire protocols behind one sans-io [`Parser`] contract: plain
//! HTTP/1.1 and HTTP/2 (prior knowledge, h2c upgrade, or TLS-ALPN). On top
//! of the parsers sit the [`HttpRouter`] component and the standard
//! middleware set (`layer`): error handling, deadlines, request patching,
//! executor offload, server push, response formatting and request logging.

#![cfg_attr(not(test), warn(clippy::print_stdout, clippy::dbg_macro))]

pub mod parser;
pub use parser::{Ingest, ParseError, Parser, ProtoError, PushStart};

pub mod h1;
pub use h1::Http1Parser;

pub mod h2;
pub use h2::Http2Parser;

pub mod router;
pub use router::HttpRouter;

pub mod layer;
pub use layer::{
    ErrorHandle, JsonFormat, Logger, MapTemplates, PatchRequest, PushState, SyncToAsync,
    TemplateEngine, TemplateFormat, TextFormat, TimeLimit, WorkerPool,
};

use blixt_core::error::BoxError;
use blixt_core::{Application, BoxComponent};

/// An application pre-loaded with the standard middleware stack around the
/// given router.
///
/// Registration order is pipeline order: logging and error handling
/// outermost, then the deadline, then request patching (the router matches
/// on the patched `path`), then the router itself so everything inside it
/// observes the matched handler and route metadata, then push bookkeeping
/// outside the formatters, and the executor offload innermost.
pub fn default_app(router: HttpRouter) -> Result<Application, BoxError> {
    let mut app = Application::new();
    for component in [
        BoxComponent::new(Logger::new()),
        BoxComponent::new(ErrorHandle::new()),
        BoxComponent::new(TimeLimit::new()),
        BoxComponent::new(PatchRequest::new()),
        BoxComponent::new(router),
        BoxComponent::new(PushState::new()),
        BoxComponent::new(JsonFormat::new()),
        BoxComponent::new(TextFormat::new()),
        BoxComponent::new(TemplateFormat::new()),
        BoxComponent::new(SyncToAsync::new()),
        BoxComponent::new(WorkerPool::new()),
    ] {
        app.add_boxed(component, None)?;
    }
    Ok(app)
}
