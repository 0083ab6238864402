//! Executor offload (`sync_to_async`, `worker_pool`).
//!
//! Handlers declared blocking must not run on the event loop.
//! [`SyncToAsync`] re-homes them onto the runtime's blocking pool, bounded
//! by a semaphore. [`WorkerPool`] owns a dedicated OS-thread pool for
//! routes whose metadata marks them heavy (`process = true`); jobs travel
//! over a bounded queue and answer through a oneshot.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::Semaphore;

use blixt_core::Application;
use blixt_core::component::{Component, ComponentError, ConfigMap, ConfigParam};
use blixt_core::error::{BoxError, Message};
use blixt_core::handler::BlockingFn;
use blixt_core::message::Request;
use blixt_core::middleware::{BoxMiddleware, Next};
use blixt_core::reply::Reply;
use blixt_core::{BoxHandler, Middleware};

const DEFAULT_BLOCKING_WORKERS: usize = 10;

fn default_pool_workers() -> usize {
    let cores = std::thread::available_parallelism()
        .map(std::num::NonZero::get)
        .unwrap_or(1);
    2 * cores + 1
}

/// The `sync_to_async` component: blocking handlers are wrapped to run on
/// the runtime's blocking pool.
pub struct SyncToAsync {
    max_workers: Mutex<usize>,
    semaphore: Mutex<Option<Arc<Semaphore>>>,
    used: Arc<AtomicBool>,
}

impl SyncToAsync {
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_workers: Mutex::new(DEFAULT_BLOCKING_WORKERS),
            semaphore: Mutex::new(None),
            used: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Default for SyncToAsync {
    fn default() -> Self {
        Self::new()
    }
}

struct SyncToAsyncMiddleware {
    semaphore: Arc<Semaphore>,
    used: Arc<AtomicBool>,
}

impl Middleware for SyncToAsyncMiddleware {
    fn handle(
        &self,
        request: Request,
        handler: BoxHandler,
        next: Next,
    ) -> impl Future<Output = Result<Reply, BoxError>> + Send + '_ {
        let handler = match handler.blocking_fn() {
            Some(blocking) => {
                self.used.store(true, Ordering::Relaxed);
                offloading_handler(blocking, self.semaphore.clone())
            }
            None => handler,
        };
        next.call(request, handler)
    }
}

fn offloading_handler(blocking: BlockingFn, semaphore: Arc<Semaphore>) -> BoxHandler {
    BoxHandler::new(move |request: Request| {
        let blocking = blocking.clone();
        let semaphore = semaphore.clone();
        async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| Message::boxed("blocking pool is shut down"))?;
            tokio::task::spawn_blocking(move || blocking(request))
                .await
                .map_err(|err| -> BoxError {
                    Message::boxed(format!("blocking handler failed: {err}"))
                })?
        }
    })
}

impl Component for SyncToAsync {
    fn name(&self) -> &str {
        "sync_to_async"
    }

    fn middleware(&self) -> Option<BoxMiddleware> {
        let semaphore = self
            .semaphore
            .lock()
            .clone()
            .unwrap_or_else(|| Arc::new(Semaphore::new(*self.max_workers.lock())));
        Some(BoxMiddleware::new(SyncToAsyncMiddleware {
            semaphore,
            used: self.used.clone(),
        }))
    }

    fn start(
        &self,
        _app: &Application,
    ) -> impl Future<Output = Result<(), ComponentError>> + Send + '_ {
        *self.semaphore.lock() = Some(Arc::new(Semaphore::new(*self.max_workers.lock())));
        std::future::ready(Ok(()))
    }

    fn stop(&self, _app: &Application) -> impl Future<Output = Result<(), BoxError>> + Send + '_ {
        let semaphore = self.semaphore.lock().take();
        let max_workers = *self.max_workers.lock();
        let used = self.used.load(Ordering::Relaxed);
        async move {
            // wait for in-flight offloaded handlers, but only when the
            // pool actually ran something
            if used && let Some(semaphore) = semaphore {
                let _ = semaphore.acquire_many(max_workers as u32).await;
            }
            Ok(())
        }
    }

    fn params(&self) -> Vec<ConfigParam> {
        vec![ConfigParam::new(
            "max_workers",
            DEFAULT_BLOCKING_WORKERS as i64,
        )]
    }

    fn configure(&self, values: &ConfigMap) -> Result<(), BoxError> {
        for (key, value) in values {
            match key.as_str() {
                "max_workers" => {
                    let workers = value
                        .as_u64()
                        .filter(|w| *w > 0)
                        .ok_or_else(|| Message::boxed("max_workers must be a positive integer"))?;
                    *self.max_workers.lock() = workers as usize;
                }
                other => {
                    return Err(Message::boxed(format!(
                        "sync_to_async has no parameter {other:?}"
                    )));
                }
            }
        }
        Ok(())
    }
}

struct Job {
    request: Request,
    body: BlockingFn,
    reply: tokio::sync::oneshot::Sender<Result<Reply, BoxError>>,
}

struct PoolInner {
    tx: flume::Sender<Job>,
    threads: Vec<std::thread::JoinHandle<()>>,
}

/// The `worker_pool` component: a dedicated OS-thread pool for routes
/// whose metadata sets `process = true`.
pub struct WorkerPool {
    max_workers: Mutex<usize>,
    inner: Mutex<Option<PoolInner>>,
    used: Arc<AtomicBool>,
}

impl WorkerPool {
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_workers: Mutex::new(default_pool_workers()),
            inner: Mutex::new(None),
            used: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

struct WorkerPoolMiddleware {
    tx: flume::Sender<Job>,
    used: Arc<AtomicBool>,
}

impl Middleware for WorkerPoolMiddleware {
    fn handle(
        &self,
        request: Request,
        handler: BoxHandler,
        next: Next,
    ) -> impl Future<Output = Result<Reply, BoxError>> + Send + '_ {
        let wants_pool = request
            .get("process")
            .is_some_and(|value| value.is_truthy());
        let handler = match handler.blocking_fn() {
            Some(body) if wants_pool => {
                self.used.store(true, Ordering::Relaxed);
                pool_handler(body, self.tx.clone())
            }
            _ => handler,
        };
        next.call(request, handler)
    }
}

fn pool_handler(body: BlockingFn, tx: flume::Sender<Job>) -> BoxHandler {
    BoxHandler::new(move |request: Request| {
        let body = body.clone();
        let tx = tx.clone();
        async move {
            let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
            tx.send_async(Job {
                request,
                body,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Message::boxed("worker pool is shut down"))?;
            reply_rx
                .await
                .map_err(|_| -> BoxError { Message::boxed("worker died before replying") })?
        }
    })
}

fn spawn_workers(count: usize) -> PoolInner {
    let (tx, rx) = flume::bounded::<Job>(count * 2);
    let threads = (0..count)
        .map(|index| {
            let rx = rx.clone();
            std::thread::Builder::new()
                .name(format!("blixt-worker-{index}"))
                .spawn(move || {
                    for job in rx.iter() {
                        let outcome = (job.body)(job.request);
                        let _ = job.reply.send(outcome);
                    }
                })
                .expect("spawning a worker thread")
        })
        .collect();
    PoolInner { tx, threads }
}

impl Component for WorkerPool {
    fn name(&self) -> &str {
        "worker_pool"
    }

    fn middleware(&self) -> Option<BoxMiddleware> {
        let inner = self.inner.lock();
        let tx = inner.as_ref().map(|pool| pool.tx.clone())?;
        Some(BoxMiddleware::new(WorkerPoolMiddleware {
            tx,
            used: self.used.clone(),
        }))
    }

    fn start(
        &self,
        _app: &Application,
    ) -> impl Future<Output = Result<(), ComponentError>> + Send + '_ {
        *self.inner.lock() = Some(spawn_workers(*self.max_workers.lock()));
        std::future::ready(Ok(()))
    }

    fn stop(&self, _app: &Application) -> impl Future<Output = Result<(), BoxError>> + Send + '_ {
        let inner = self.inner.lock().take();
        let used = self.used.load(Ordering::Relaxed);
        async move {
            if let Some(pool) = inner {
                // dropping the sender stops the workers; join them only
                // when at least one job ever ran through the pool
                drop(pool.tx);
                if used {
                    let join = tokio::task::spawn_blocking(move || {
                        for thread in pool.threads {
                            let _ = thread.join();
                        }
                    });
                    join.await
                        .map_err(|err| -> BoxError { Box::new(err) })?;
                }
            }
            Ok(())
        }
    }

    fn params(&self) -> Vec<ConfigParam> {
        vec![ConfigParam::new(
            "max_workers",
            default_pool_workers() as i64,
        )]
    }

    fn configure(&self, values: &ConfigMap) -> Result<(), BoxError> {
        for (key, value) in values {
            match key.as_str() {
                "max_workers" => {
                    let workers = value
                        .as_u64()
                        .filter(|w| *w > 0)
                        .ok_or_else(|| Message::boxed("max_workers must be a positive integer"))?;
                    *self.max_workers.lock() = workers as usize;
                }
                other => {
                    return Err(Message::boxed(format!(
                        "worker_pool has no parameter {other:?}"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blixt_core::message::Response;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_handlers_are_offloaded() {
        let component = SyncToAsync::new();
        let app = Application::new();
        component.start(&app).await.unwrap();
        let middleware = component.middleware().unwrap();

        let handler = BoxHandler::blocking(|_request| {
            // would wedge the event loop if run inline on a paused runtime
            std::thread::sleep(std::time::Duration::from_millis(20));
            Response::new(200, "offloaded")
        });
        let reply = middleware
            .call(Request::new("GET", "/"), handler, Next::terminal())
            .await
            .unwrap();
        assert_eq!(reply.as_response().unwrap().body.as_ref(), b"offloaded");
        assert!(component.used.load(Ordering::Relaxed));
        component.stop(&app).await.unwrap();
    }

    #[tokio::test]
    async fn async_handlers_pass_untouched() {
        let component = SyncToAsync::new();
        let app = Application::new();
        component.start(&app).await.unwrap();
        let middleware = component.middleware().unwrap();
        let handler = BoxHandler::new(|_request: Request| async { "async" });
        let reply = middleware
            .call(Request::new("GET", "/"), handler, Next::terminal())
            .await
            .unwrap();
        assert!(matches!(reply, Reply::Text(text) if text == "async"));
        assert!(!component.used.load(Ordering::Relaxed));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pool_runs_marked_routes() {
        let component = WorkerPool::new();
        let app = Application::new();
        component.start(&app).await.unwrap();
        let middleware = component.middleware().unwrap();

        let handler = BoxHandler::blocking(|_request| {
            format!("worker:{:?}", std::thread::current().name())
        });
        let request = Request::new("GET", "/heavy");
        request.set("process", true);
        let reply = middleware
            .call(request, handler, Next::terminal())
            .await
            .unwrap();
        match reply {
            Reply::Text(text) => assert!(text.contains("blixt-worker-"), "got {text}"),
            other => panic!("unexpected {other:?}"),
        }
        component.stop(&app).await.unwrap();
    }

    #[tokio::test]
    async fn unmarked_routes_skip_the_pool() {
        let component = WorkerPool::new();
        let app = Application::new();
        component.start(&app).await.unwrap();
        let middleware = component.middleware().unwrap();
        let handler = BoxHandler::blocking(|_request| "inline");
        let reply = middleware
            .call(Request::new("GET", "/light"), handler, Next::terminal())
            .await
            .unwrap();
        assert!(matches!(reply, Reply::Text(text) if text == "inline"));
        assert!(!component.used.load(Ordering::Relaxed));
        component.stop(&app).await.unwrap();
    }
}
