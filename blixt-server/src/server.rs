//! The accept loop.
//!
//! Binds a listener, starts the application, and serves connections under
//! a graceful shutdown: when the signal fires the loop stops accepting,
//! connections cancel their in-flight requests, and the application's
//! components are stopped.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use blixt_core::Application;
use blixt_core::error::BoxError;
use blixt_core::graceful::{Shutdown, default_signal};
use blixt_http::parser::Parser;
use blixt_http::{Http1Parser, Http2Parser};

use crate::connection::Connection;

const SHUTDOWN_LIMIT: Duration = Duration::from_secs(10);

/// Parser candidates for a fresh connection, in priority order.
fn candidates(scheme: &'static str, h2_only: bool) -> Vec<Box<dyn Parser>> {
    if h2_only {
        vec![Box::new(Http2Parser::with_scheme(scheme))]
    } else {
        vec![
            Box::new(Http2Parser::with_scheme(scheme)),
            Box::new(Http1Parser::with_scheme(scheme)),
        ]
    }
}

/// Owns the application and the listening surface.
pub struct Server {
    app: Application,
    tls: Option<Arc<rustls::ServerConfig>>,
}

impl Server {
    #[must_use]
    pub fn new(app: Application) -> Self {
        Self { app, tls: None }
    }

    /// Serve TLS with the given config; see [`crate::tls::server_config`]
    /// for a config with the right versions and ALPN.
    #[must_use]
    pub fn with_tls(mut self, config: Arc<rustls::ServerConfig>) -> Self {
        self.tls = Some(config);
        self
    }

    /// Bind and serve until ctrl-c.
    pub async fn run(self, host: &str, port: u16) -> Result<(), BoxError> {
        let listener = TcpListener::bind((host, port)).await?;
        tracing::info!(%host, port, "listening");
        self.serve(listener, default_signal()).await
    }

    /// Serve an existing listener until `signal` completes.
    pub async fn serve(
        mut self,
        listener: TcpListener,
        signal: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), BoxError> {
        self.app.start().await?;
        let app = Arc::new(self.app);
        let tls = self.tls.take().map(TlsAcceptor::from);

        let shutdown = Shutdown::new(signal);
        let watcher = shutdown.guard_weak();
        loop {
            tokio::select! {
                () = watcher.clone().into_cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let app = app.clone();
                        let tls = tls.clone();
                        shutdown.spawn_task_fn(move |guard| async move {
                            serve_socket(stream, peer, app, tls, guard).await;
                        });
                    }
                    Err(err) => {
                        tracing::warn!(%err, "accept failed");
                    }
                },
            }
        }
        drop(listener);
        tracing::info!("shutting down");
        if shutdown.shutdown_with_limit(SHUTDOWN_LIMIT).await.is_err() {
            tracing::warn!("graceful shutdown limit reached");
        }
        app.stop().await;
        Ok(())
    }
}

async fn serve_socket(
    stream: TcpStream,
    peer: std::net::SocketAddr,
    app: Arc<Application>,
    tls: Option<TlsAcceptor>,
    guard: blixt_core::graceful::ShutdownGuard,
) {
    match tls {
        None => {
            Connection::new(app, Some(peer))
                .with_guard(guard)
                .serve(stream, candidates("http", false))
                .await;
        }
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls_stream) => {
                // ALPN h2 favors the HTTP/2 parser outright; anything else
                // negotiates as usual
                let h2_only = tls_stream
                    .get_ref()
                    .1
                    .alpn_protocol()
                    .is_some_and(|proto| proto == b"h2");
                Connection::new(app, Some(peer))
                    .with_guard(guard)
                    .serve(tls_stream, candidates("https", h2_only))
                    .await;
            }
            Err(err) => {
                tracing::debug!(%peer, %err, "tls handshake failed");
            }
        },
    }
}

/// `Application::run`-style convenience: serve this application on
/// `(host, port)`, optionally with TLS.
pub trait AppServerExt {
    fn run(
        self,
        host: &str,
        port: u16,
    ) -> impl Future<Output = Result<(), BoxError>> + Send;

    fn run_with(
        self,
        host: &str,
        port: u16,
        tls: Option<Arc<rustls::ServerConfig>>,
    ) -> impl Future<Output = Result<(), BoxError>> + Send;
}

impl AppServerExt for Application {
    fn run(self, host: &str, port: u16) -> impl Future<Output = Result<(), BoxError>> + Send {
        Server::new(self).run(host, port)
    }

    fn run_with(
        self,
        host: &str,
        port: u16,
        tls: Option<Arc<rustls::ServerConfig>>,
    ) -> impl Future<Output = Result<(), BoxError>> + Send {
        let mut server = Server::new(self);
        if let Some(config) = tls {
            server = server.with_tls(config);
        }
        server.run(host, port)
    }
}
