//! `async fn handle(&self, Request) -> Result<Response, BoxError>`
//!
//! Core primitives of the `blixt` server framework: the message types
//! ([`Request`], [`Response`], [`Push`]), the per-request [`Scope`] with its
//! lazily produced attributes, the [`Handler`] / [`Middleware`] /
//! [`Component`] traits, and the [`Application`] that owns components and
//! compiles their middlewares into a single onion-style pipeline.
//!
//! Protocol parsers and the standard middleware set live in `blixt-http`;
//! the socket layer lives in `blixt-server`. This crate is deliberately
//! transport-free.

#![cfg_attr(not(test), warn(clippy::print_stdout, clippy::dbg_macro))]

pub mod error;
pub use error::BoxError;

pub mod message;
pub use message::{Headers, Push, Request, Response};

pub mod scope;
pub use scope::{Scope, ScopeValue};

pub mod reply;
pub use reply::{IntoReply, IntoReplyResult, Reply, Template};

pub mod handler;
pub use handler::{BoxHandler, Handler};

pub mod middleware;
pub use middleware::{BoxMiddleware, Middleware, Next};

pub mod component;
pub use component::{BoxComponent, Component, ComponentError, ConfigMap, ConfigParam};

pub mod app;
pub use app::Application;

pub mod graceful;

/// A boxed future, as returned by the dyn-dispatch wrappers of this crate.
pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn Future<Output = T> + Send + 'a>>;
