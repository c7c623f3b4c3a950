//! # Options: the configuration record threaded through the core.
//!
//! [`Options`] is built by the caller (service name, tags, workers,
//! puzzles), enriched by the core at bind time (listener address,
//! sub-listener factories), mutated by puzzles during their `before`
//! phase, and then frozen into an `Arc` for the lifetime of the service.
//!
//! The only steady-state mutability left after the freeze is
//! [`HttpMux`], whose route table is snapshotted per accepted
//! connection.
//!
//! ```rust
//! use corevisor::Options;
//!
//! let mut opts = Options::new("user-service:v2");
//! opts.tag("edge");
//! opts.named_worker("warmup", |_ctx| async { Ok(()) });
//! assert_eq!(opts.service_name, "user-service");
//! assert_eq!(opts.tags, vec!["v2".to_string(), "edge".to_string()]);
//! ```

use std::borrow::Cow;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::routing::MethodRouter;
use axum::Router;
use tokio_util::sync::CancellationToken;

use crate::cron::CronBody;
use crate::error::MountError;
use crate::mount::MountFuture;
use crate::mux::{LazySubListener, SubListener};
use crate::puzzle::Puzzle;
use crate::ready::Ready;

/// Shared, prefix-mountable HTTP route table.
///
/// The thin seam puzzles use to install handlers without owning the
/// HTTP server. Mutation is expected during `before`/`start` preludes;
/// the serving side takes a snapshot per accepted connection, so a
/// mount becomes visible no later than the next accept.
pub struct HttpMux {
    router: Mutex<Router>,
}

impl HttpMux {
    fn new() -> Self {
        Self {
            router: Mutex::new(Router::new()),
        }
    }

    /// Mounts a router under a path prefix (`"/"` merges at the root).
    pub fn mount(&self, pattern: &str, sub: Router) {
        let mut router = self.router.lock().expect("http mux lock");
        let current = std::mem::take(&mut *router);
        *router = if pattern.is_empty() || pattern == "/" {
            current.merge(sub)
        } else {
            current.nest(pattern.trim_end_matches('/'), sub)
        };
    }

    /// Adds a single route.
    pub fn route(&self, path: &str, handler: MethodRouter) {
        let mut router = self.router.lock().expect("http mux lock");
        let current = std::mem::take(&mut *router);
        *router = current.route(path, handler);
    }

    /// The current route table.
    pub(crate) fn snapshot(&self) -> Router {
        self.router.lock().expect("http mux lock").clone()
    }
}

impl Default for HttpMux {
    fn default() -> Self {
        Self::new()
    }
}

/// A registered worker, mounted by the core during `serve` assembly.
pub(crate) enum WorkerSpec {
    Simple {
        name: Cow<'static, str>,
        daemon: bool,
        body: Mutex<Box<dyn FnOnce(CancellationToken) -> MountFuture + Send>>,
    },
    Cron {
        name: Cow<'static, str>,
        expr: String,
        body: CronBody,
    },
}

/// Configuration record for a [`CoreService`](crate::CoreService).
pub struct Options {
    /// Service name, used in logs and discovery registration.
    pub service_name: String,
    /// Ordered service tags; duplicates are preserved.
    pub tags: Vec<String>,
    /// Readiness of the pprof route set; present iff pprof is enabled.
    pub wait_pprof: Option<Ready>,
    /// Readiness of the gRPC server; present iff the gRPC puzzle is
    /// enabled.
    pub wait_grpc: Option<Ready>,
    /// Shared HTTP route table served on the HTTP sub-listener.
    pub http_mux: HttpMux,

    pub(crate) listener_addr: Option<SocketAddr>,
    pub(crate) http_handler: Option<Router>,
    pub(crate) grpc_listener: Option<LazySubListener>,
    pub(crate) http_listener: Option<LazySubListener>,
    pub(crate) puzzles: Vec<Arc<dyn Puzzle>>,
    pub(crate) workers: Vec<WorkerSpec>,
}

impl Options {
    /// Creates options for a named service.
    ///
    /// A `name:tag` argument is split into the service name and its
    /// first tag.
    pub fn new(name: impl AsRef<str>) -> Self {
        let name = name.as_ref();
        let (service_name, first_tag) = match name.split_once(':') {
            Some((service, tag)) => (service.to_string(), Some(tag.to_string())),
            None => (name.to_string(), None),
        };
        Self {
            service_name,
            tags: first_tag.into_iter().collect(),
            wait_pprof: None,
            wait_grpc: None,
            http_mux: HttpMux::new(),
            listener_addr: None,
            http_handler: None,
            grpc_listener: None,
            http_listener: None,
            puzzles: Vec::new(),
            workers: Vec::new(),
        }
    }

    /// Appends a service tag.
    pub fn tag(&mut self, tag: impl Into<String>) {
        self.tags.push(tag.into());
    }

    /// Bound listener address, in `HOST:PORT` form. `None` until the
    /// core has bound (or when running listener-less).
    pub fn listener_addr(&self) -> Option<SocketAddr> {
        self.listener_addr
    }

    /// Replaces the root HTTP handler. By default the core serves
    /// [`Options::http_mux`].
    pub fn http_handler(&mut self, handler: Router) {
        self.http_handler = Some(handler);
    }

    /// The gRPC sub-listener factory. `None` when the core runs without
    /// a listener. The first caller registers the matcher on the muxer;
    /// everyone gets the same sub-listener.
    pub fn grpc_listener(&self) -> Option<Arc<SubListener>> {
        self.grpc_listener.as_ref().map(LazySubListener::get)
    }

    /// The HTTP sub-listener factory; memoised like
    /// [`grpc_listener`](Options::grpc_listener).
    pub fn http_listener(&self) -> Option<Arc<SubListener>> {
        self.http_listener.as_ref().map(LazySubListener::get)
    }

    /// Registers a puzzle. Re-registering a name replaces the previous
    /// puzzle; registration order is preserved otherwise.
    pub fn register_puzzle(&mut self, puzzle: Arc<dyn Puzzle>) {
        if let Some(existing) = self
            .puzzles
            .iter_mut()
            .find(|existing| existing.name() == puzzle.name())
        {
            *existing = puzzle;
        } else {
            self.puzzles.push(puzzle);
        }
    }

    /// Registers a one-shot worker named after its closure type.
    pub fn worker<F, Fut>(&mut self, body: F)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), MountError>> + Send + 'static,
    {
        self.push_simple(std::any::type_name::<F>(), false, body);
    }

    /// Registers a named one-shot worker.
    pub fn named_worker<F, Fut>(&mut self, name: impl Into<Cow<'static, str>>, body: F)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), MountError>> + Send + 'static,
    {
        self.push_simple(name, false, body);
    }

    /// Registers a daemon worker: its failure or early exit with an
    /// error tears the core down.
    pub fn daemon_worker<F, Fut>(&mut self, name: impl Into<Cow<'static, str>>, body: F)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), MountError>> + Send + 'static,
    {
        self.push_simple(name, true, body);
    }

    /// Registers a cron worker. `expr` is `@every <dur>` or a cron
    /// expression; it is validated during `serve` assembly and an
    /// invalid expression fails startup.
    pub fn cron_worker<F, Fut>(
        &mut self,
        name: impl Into<Cow<'static, str>>,
        expr: impl Into<String>,
        body: F,
    ) where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), MountError>> + Send + 'static,
    {
        self.workers.push(WorkerSpec::Cron {
            name: name.into(),
            expr: expr.into(),
            body: Arc::new(move |token| Box::pin(body(token))),
        });
    }

    fn push_simple<F, Fut>(&mut self, name: impl Into<Cow<'static, str>>, daemon: bool, body: F)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), MountError>> + Send + 'static,
    {
        self.workers.push(WorkerSpec::Simple {
            name: name.into(),
            daemon,
            body: Mutex::new(Box::new(move |token| Box::pin(body(token)))),
        });
    }
}
