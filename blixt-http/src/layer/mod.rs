//! The standard middleware set.
//!
//! Each file is one component; registration order is pipeline order (see
//! [`crate::default_app`] for the canonical assembly).

mod error_handle;
pub use error_handle::ErrorHandle;

mod time_limit;
pub use time_limit::TimeLimit;

mod patch_request;
pub use patch_request::PatchRequest;

mod offload;
pub use offload::{SyncToAsync, WorkerPool};

mod push;
pub use push::PushState;

mod format;
pub use format::{JsonFormat, MapTemplates, TemplateEngine, TemplateFormat, TextFormat};

mod logger;
pub use logger::Logger;
