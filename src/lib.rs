//! blixt — an asynchronous HTTP server framework.
//!
//! One listening socket multiplexes HTTP/1.1 and HTTP/2 (prior knowledge,
//! `h2c` upgrade, or TLS-ALPN). Parsed requests flow through an
//! onion-style middleware pipeline assembled from components and end in a
//! route-matched handler; responses (and HTTP/2 server pushes) are
//! serialized by whichever parser the connection negotiated.
//!
//! ```no_run
//! use blixt::Request;
//! use blixt::http::HttpRouter;
//! use blixt::server::AppServerExt as _;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), blixt::BoxError> {
//!     let mut router = HttpRouter::new();
//!     router.get("/hello/{name}", |req: Request| async move {
//!         let name = req.get("name").and_then(|v| v.as_str().map(String::from));
//!         Ok::<_, blixt::BoxError>(serde_json::json!({ "hello": name }))
//!     })?;
//!     blixt::http::default_app(router)?.run("127.0.0.1", 8000).await
//! }
//! ```

#![cfg_attr(not(test), warn(clippy::print_stdout, clippy::dbg_macro))]

#[doc(inline)]
pub use blixt_core::{
    Application, BoxError, BoxHandler, Handler, IntoReply, Middleware, Next, Push, Reply, Request,
    Response, Scope, ScopeValue, Template,
};

pub mod graceful {
    //! Re-export of the graceful-shutdown primitives.
    #[doc(inline)]
    pub use blixt_core::graceful::*;
}

pub mod http {
    //! Protocol parsers, router and the standard middleware set.
    #[doc(inline)]
    pub use blixt_http::*;
}

pub mod server {
    //! Connection state machine, accept loop and TLS wiring.
    #[doc(inline)]
    pub use blixt_server::*;
}
