//! The per-socket connection state machine.
//!
//! A connection starts negotiating: every candidate parser observes the
//! first chunk and the first that accepts it is bound for the lifetime of
//! the socket. Completed requests are spawned as tasks running the
//! application pipeline; the connection task itself is the single owner of
//! the parser and serializes every response, including pushed ones.
//!
//! Task endings: normal completion writes the response; a failed
//! pipeline, a panicked task, or a task cancelled while the transport is
//! still writable (graceful shutdown) is answered with the canned 500;
//! when the transport itself is gone the in-flight tasks are aborted and
//! nothing further is written.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::task::JoinSet;

use blixt_core::Application;
use blixt_core::error::BoxError;
use blixt_core::graceful::ShutdownGuard;
use blixt_core::message::{Request, Response};
use blixt_core::scope::keys;
use blixt_http::parser::{Ingest, Parser};

fn canned_500() -> Response {
    Response::new(500, "Sorry")
}

enum Binding {
    Negotiating(Vec<Box<dyn Parser>>),
    Bound(Box<dyn Parser>),
}

impl Binding {
    /// Feed one chunk. During negotiation every candidate sees the same
    /// bytes; the first to accept is pinned. `Err` means no parser wants
    /// the connection (or the bound parser gave up) and it must be
    /// dropped.
    fn feed(&mut self, data: &[u8]) -> Result<Ingest, BoxError> {
        match self {
            Self::Bound(parser) => parser.handle_request(data).map_err(Into::into),
            Self::Negotiating(candidates) => {
                for index in 0..candidates.len() {
                    match candidates[index].handle_request(data) {
                        Ok(ingest) => {
                            let parser = candidates.swap_remove(index);
                            tracing::debug!(protocol = parser.protocol(), "parser bound");
                            *self = Self::Bound(parser);
                            return Ok(ingest);
                        }
                        Err(err) => {
                            tracing::trace!(
                                candidate = candidates[index].protocol(),
                                %err,
                                "candidate rejected connection"
                            );
                        }
                    }
                }
                Err(blixt_core::error::Message::boxed(
                    "no parser accepted the connection",
                ))
            }
        }
    }

    fn bound(&mut self) -> Option<&mut Box<dyn Parser>> {
        match self {
            Self::Bound(parser) => Some(parser),
            Self::Negotiating(_) => None,
        }
    }
}

/// One accepted socket bound to an application.
pub struct Connection {
    app: Arc<Application>,
    peer: Option<SocketAddr>,
    guard: Option<ShutdownGuard>,
}

impl Connection {
    #[must_use]
    pub fn new(app: Arc<Application>, peer: Option<SocketAddr>) -> Self {
        Self {
            app,
            peer,
            guard: None,
        }
    }

    /// Hold a shutdown guard for the lifetime of the connection: graceful
    /// shutdown waits for it, and when the signal fires the in-flight
    /// tasks are aborted and the connection closes.
    #[must_use]
    pub fn with_guard(mut self, guard: ShutdownGuard) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Drive the connection until the peer goes away, a parser asks for
    /// close, or shutdown fires.
    pub async fn serve<IO>(self, io: IO, mut candidates: Vec<Box<dyn Parser>>)
    where
        IO: AsyncRead + AsyncWrite + Send + 'static,
    {
        for parser in &mut candidates {
            parser.connect();
        }
        let (mut rd, mut wr) = tokio::io::split(io);
        let mut binding = Binding::Negotiating(candidates);
        let mut tasks: JoinSet<(Request, Result<Response, BoxError>)> = JoinSet::new();
        let mut in_flight: HashMap<tokio::task::Id, Request> = HashMap::new();
        let mut rbuf = BytesMut::with_capacity(16 * 1024);

        // reading stops on close-request or transport loss; the loop then
        // drains in-flight tasks before the socket is shut down
        let mut reading = true;
        let mut writable = true;
        let mut shutting_down = false;

        loop {
            if tasks.is_empty() && !reading {
                break;
            }
            tokio::select! {
                read = rd.read_buf(&mut rbuf), if reading => match read {
                    Ok(0) => {
                        tracing::trace!("transport closed by peer");
                        reading = false;
                        writable = false;
                        tasks.abort_all();
                    }
                    Ok(_) => {
                        let chunk = rbuf.split().freeze();
                        match binding.feed(&chunk) {
                            Ok(ingest) => {
                                if writable
                                    && !ingest.to_write.is_empty()
                                    && write_all(&mut wr, &ingest.to_write).await.is_err()
                                {
                                    reading = false;
                                    writable = false;
                                    tasks.abort_all();
                                    continue;
                                }
                                for request in ingest.requests {
                                    self.spawn_request(request, &mut tasks, &mut in_flight);
                                }
                                if ingest.close {
                                    reading = false;
                                }
                            }
                            Err(err) => {
                                tracing::debug!(%err, "dropping connection");
                                reading = false;
                            }
                        }
                    }
                    Err(err) => {
                        tracing::debug!(%err, "transport read failed");
                        reading = false;
                        writable = false;
                        tasks.abort_all();
                    }
                },
                joined = tasks.join_next_with_id(), if !tasks.is_empty() => match joined {
                    Some(Ok((id, (request, outcome)))) => {
                        in_flight.remove(&id);
                        if writable && let Some(parser) = binding.bound() {
                            let response = match outcome {
                                Ok(response) => response,
                                Err(err) => {
                                    tracing::debug!(%err, "pipeline failed; answering 500");
                                    canned_500()
                                }
                            };
                            if self
                                .respond(parser, &mut wr, &request, response)
                                .await
                                .is_err()
                            {
                                writable = false;
                                reading = false;
                                tasks.abort_all();
                            }
                        }
                    }
                    Some(Err(join_err)) => {
                        let request = in_flight.remove(&join_err.id());
                        // a panicked or cancelled task still gets the
                        // canned answer while the transport is writable;
                        // transport loss clears `writable` first, so those
                        // aborts stay silent
                        if writable
                            && let (Some(request), Some(parser)) = (request, binding.bound())
                        {
                            if join_err.is_panic() {
                                tracing::error!(stream = request.stream(), "request task panicked");
                            } else {
                                tracing::debug!(stream = request.stream(), "request task cancelled");
                            }
                            let mut response = canned_500();
                            if let Ok(frames) = parser.handle_response(&mut response, &request) {
                                for frame in frames {
                                    if write_all(&mut wr, &frame).await.is_err() {
                                        writable = false;
                                        break;
                                    }
                                }
                            }
                        }
                    }
                    None => {}
                },
                // shutdown is not transport loss: the socket is still
                // open, so cancelled tasks are answered with the canned
                // 500 as they drain
                () = watch(self.guard.as_ref()), if !shutting_down => {
                    tracing::debug!("shutdown requested; cancelling in-flight requests");
                    shutting_down = true;
                    reading = false;
                    tasks.abort_all();
                }
            }
        }
        if writable {
            let _ = wr.shutdown().await;
        }
    }

    fn spawn_request(
        &self,
        request: Request,
        tasks: &mut JoinSet<(Request, Result<Response, BoxError>)>,
        in_flight: &mut HashMap<tokio::task::Id, Request>,
    ) {
        if let Some(peer) = self.peer {
            request.set(keys::PEER_ADDR, peer.to_string());
        }
        let app = self.app.clone();
        let task_request = request.clone();
        let handle = tasks.spawn(async move {
            let outcome = app.handle(task_request.clone()).await;
            (task_request, outcome)
        });
        in_flight.insert(handle.id(), request);
    }

    /// Serialize one response. When the response carries push hints and
    /// the bound parser can push, the promises go out first, then every
    /// pushed response, and only then the primary response so its stream
    /// ends last.
    async fn respond<W>(
        &self,
        parser: &mut Box<dyn Parser>,
        wr: &mut WriteHalf<W>,
        request: &Request,
        mut response: Response,
    ) -> std::io::Result<()>
    where
        W: AsyncWrite,
    {
        if !response.push && !response.pushes.is_empty() && parser.push_support() {
            let pushes = std::mem::take(&mut response.pushes);
            let mut promised = Vec::new();
            for push in &pushes {
                match parser.start_push(request, push) {
                    Ok(Some(start)) => {
                        write_all(wr, &start.to_write).await?;
                        promised.push(start.request);
                    }
                    Ok(None) => {}
                    Err(err) => {
                        tracing::debug!(%err, "push reservation failed");
                    }
                }
            }
            for push_request in promised {
                let mut push_response = match self.app.handle(push_request.clone()).await {
                    Ok(response) => response,
                    Err(err) => {
                        tracing::debug!(%err, "push pipeline failed");
                        canned_500()
                    }
                };
                push_response.push = true;
                match parser.handle_response(&mut push_response, &push_request) {
                    Ok(frames) => {
                        for frame in frames {
                            write_all(wr, &frame).await?;
                        }
                    }
                    Err(err) => {
                        tracing::debug!(%err, "pushed stream abandoned");
                    }
                }
            }
        }
        match parser.handle_response(&mut response, request) {
            Ok(frames) => {
                for frame in frames {
                    write_all(wr, &frame).await?;
                }
            }
            Err(err) => {
                tracing::debug!(%err, "response stream abandoned");
            }
        }
        Ok(())
    }
}

async fn write_all<W: AsyncWrite>(wr: &mut WriteHalf<W>, data: &[u8]) -> std::io::Result<()> {
    wr.write_all(data).await?;
    wr.flush().await
}

async fn watch(guard: Option<&ShutdownGuard>) {
    match guard {
        Some(guard) => guard.cancelled().await,
        None => std::future::pending().await,
    }
}
