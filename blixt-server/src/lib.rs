//! Socket layer of the `blixt` framework: the per-connection state machine
//! that negotiates a parser and schedules request tasks, the accept loop
//! with graceful shutdown, and the TLS/ALPN wiring.

#![cfg_attr(not(test), warn(clippy::print_stdout, clippy::dbg_macro))]

pub mod connection;
pub use connection::Connection;

pub mod server;
pub use server::{AppServerExt, Server};

pub mod tls;
