//! Error utilities shared across the framework.
//!
//! Handlers and middlewares report failures as a [`BoxError`]: the concrete
//! type rarely matters at the pipeline boundary, only that something went
//! wrong and can be displayed. Protocol-level error enums live next to the
//! parsers that raise them.

use std::error::Error;
use std::fmt::Write as _;

/// A boxed, type-erased error.
pub type BoxError = Box<dyn Error + Send + Sync>;

/// Render an error and its source chain as a single line.
///
/// Used by the default error handler to build a 500 body, and by log lines
/// that want the whole story without a backtrace.
#[must_use]
pub fn display_chain(err: &(dyn Error + 'static)) -> String {
    let mut out = String::new();
    let _ = write!(&mut out, "{err}");
    let mut source = err.source();
    while let Some(cause) = source {
        let _ = write!(&mut out, ": {cause}");
        source = cause.source();
    }
    out
}

/// A plain message error, for failure paths that have no richer type.
#[derive(Debug)]
pub struct Message(String);

impl Message {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }

    /// Shorthand producing the boxed form directly.
    pub fn boxed(msg: impl Into<String>) -> BoxError {
        Box::new(Self(msg.into()))
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Error for Message {}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Outer(Message);

    impl std::fmt::Display for Outer {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("outer")
        }
    }

    impl Error for Outer {
        fn source(&self) -> Option<&(dyn Error + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn chain_includes_sources() {
        let err = Outer(Message::new("inner"));
        assert_eq!(display_chain(&err), "outer: inner");
    }
}
