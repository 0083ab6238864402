//! Graceful-shutdown primitives.
//!
//! The accept loop and every connection task coordinate their teardown
//! through the guard types of the `tokio-graceful` crate, re-exported
//! here so the rest of the workspace never depends on it directly: a
//! [`Shutdown`] owns the trigger signal, a [`ShutdownGuard`] delays the
//! shutdown until its holder finishes, and [`default_signal`] listens for
//! the usual process signals.

#[doc(inline)]
pub use ::tokio_graceful::{
    Shutdown, ShutdownBuilder, ShutdownGuard, WeakShutdownGuard, default_signal,
};
