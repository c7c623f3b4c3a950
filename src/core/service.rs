//! # CoreService: the composition facade.
//!
//! Wires the muxer, the mount supervisor, puzzles, and workers into one
//! long-running service.
//!
//! ## Startup flow
//! ```text
//! Options ──► CoreService::new()
//!                  │
//! start(addr) ─────┤ bind TCP, build muxer, install sub-listener
//!                  │ factories (run() skips all of this)
//!                  │
//!                  ├─ before pass: every puzzle's before(), in
//!                  │  registration order, fan-out drained; first error
//!                  │  aborts startup with no mounts spawned
//!                  │
//!                  ├─ materialise the HTTP sub-listener (the gRPC one
//!                  │  is claimed by the gRPC puzzle during before), so
//!                  │  the matcher set is frozen before the muxer serves
//!                  │
//!                  ├─ assemble mounts: graceful-kill, http server,
//!                  │  muxer server, puzzles, workers, cron scheduler
//!                  │
//!                  └─ run_mounts(): blocks until a signal, a daemon
//!                     failure, or close()
//! ```

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};

use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::core::graceful::graceful_kill;
use crate::cron::{scheduler_mount, CronJob, CronSpec};
use crate::error::{is_listener_closed, CoreError, MountError};
use crate::mount::{run_mounts, MountFn};
use crate::mux::{Http1Fast, Http2HeaderField, LazySubListener, MatchWriter, Muxer};
use crate::options::{Options, WorkerSpec};
use crate::puzzle::Puzzle;

/// The gRPC fingerprint header.
const GRPC_CONTENT_TYPE: (&str, &str) = ("content-type", "application/grpc");

/// Listen address accepted by [`CoreService::start`]: a bare port or a
/// `HOST:PORT` string.
#[derive(Debug, Clone)]
pub enum ListenAddr {
    /// Rendered as `:PORT`, bound on all interfaces.
    Port(u16),
    /// A literal address, resolved at bind time.
    Addr(String),
}

impl From<u16> for ListenAddr {
    fn from(port: u16) -> Self {
        ListenAddr::Port(port)
    }
}

impl From<&str> for ListenAddr {
    fn from(addr: &str) -> Self {
        ListenAddr::Addr(addr.to_string())
    }
}

impl From<String> for ListenAddr {
    fn from(addr: String) -> Self {
        ListenAddr::Addr(addr)
    }
}

impl From<SocketAddr> for ListenAddr {
    fn from(addr: SocketAddr) -> Self {
        ListenAddr::Addr(addr.to_string())
    }
}

impl std::fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenAddr::Port(port) => write!(f, ":{port}"),
            ListenAddr::Addr(addr) => f.write_str(addr),
        }
    }
}

/// A configured, not-yet-running service core.
pub struct CoreService {
    token: CancellationToken,
    opts: Mutex<Option<Options>>,
    bound: OnceLock<SocketAddr>,
}

impl CoreService {
    /// Wraps finished [`Options`] into a startable core.
    pub fn new(opts: Options) -> Self {
        Self {
            token: CancellationToken::new(),
            opts: Mutex::new(Some(opts)),
            bound: OnceLock::new(),
        }
    }

    /// Binds a TCP listener and serves until shutdown.
    ///
    /// Returns the signal identity error after a signal-triggered
    /// shutdown, the daemon's error after a daemon failure, or
    /// [`CoreError::Canceled`] after [`close`](CoreService::close).
    pub async fn start(&self, addr: impl Into<ListenAddr>) -> Result<(), CoreError> {
        let addr = addr.into();
        let listener = match &addr {
            ListenAddr::Port(port) => TcpListener::bind(("0.0.0.0", *port)).await,
            ListenAddr::Addr(addr) => TcpListener::bind(addr.as_str()).await,
        }
        .map_err(|source| CoreError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        self.serve(Some(listener)).await
    }

    /// Serves without a listener: workers and listener-less puzzles
    /// only. Used by pure-worker daemons.
    pub async fn run(&self) -> Result<(), CoreError> {
        self.serve(None).await
    }

    /// Cancels the root context, triggering the full teardown sequence.
    pub fn close(&self) {
        self.token.cancel();
    }

    /// The bound listener address, available once
    /// [`start`](CoreService::start) has bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound.get().copied()
    }

    async fn serve(&self, listener: Option<TcpListener>) -> Result<(), CoreError> {
        let mut opts = self
            .opts
            .lock()
            .expect("core options lock")
            .take()
            .ok_or(CoreError::AlreadyStarted)?;

        let muxer = match listener {
            Some(listener) => Some(Arc::new(
                Muxer::new(listener).map_err(|source| CoreError::Bind {
                    addr: "bound listener".to_string(),
                    source,
                })?,
            )),
            None => None,
        };

        if let Some(muxer) = &muxer {
            let addr = muxer.local_addr();
            opts.listener_addr = Some(addr);
            let _ = self.bound.set(addr);

            opts.grpc_listener = Some(LazySubListener::new({
                let muxer = Arc::clone(muxer);
                move || {
                    muxer.match_with_writer(vec![Box::new(Http2HeaderField::new(
                        GRPC_CONTENT_TYPE.0,
                        GRPC_CONTENT_TYPE.1,
                    ))])
                }
            }));
            opts.http_listener = Some(LazySubListener::new({
                let muxer = Arc::clone(muxer);
                move || {
                    muxer.match_with_writer(vec![
                        Box::new(Http1Fast) as Box<dyn MatchWriter>,
                        Box::new(Http2HeaderField::exclude(
                            GRPC_CONTENT_TYPE.0,
                            GRPC_CONTENT_TYPE.1,
                        )),
                    ])
                }
            }));
        }

        let puzzles = self.before_pass(&mut opts).await?;

        // Freeze the matcher set before the muxer mount spawns: the
        // HTTP catch-all registers last, after every before-phase claim.
        if muxer.is_some() {
            let _ = opts.http_listener();
        }

        let workers = std::mem::take(&mut opts.workers);
        let opts = Arc::new(opts);

        let mut mounts = vec![graceful_kill(
            self.token.clone(),
            puzzles.clone(),
            muxer.clone(),
        )];
        if let Some(muxer) = &muxer {
            mounts.push(http_mount(Arc::clone(&opts)));
            mounts.push(muxer_mount(Arc::clone(muxer)));
        }
        for puzzle in &puzzles {
            mounts.push(puzzle_mount(Arc::clone(puzzle), Arc::clone(&opts)));
        }
        mounts.extend(worker_mounts(workers)?);

        welcome(&opts);
        run_mounts(self.token.clone(), mounts).await
    }

    /// Runs `before` on every puzzle sequentially, draining fan-out
    /// registrations onto the work-list. The first error is fatal.
    async fn before_pass(&self, opts: &mut Options) -> Result<Vec<Arc<dyn Puzzle>>, CoreError> {
        let mut puzzles: Vec<Arc<dyn Puzzle>> = std::mem::take(&mut opts.puzzles);
        let mut index = 0;
        while index < puzzles.len() {
            let puzzle = Arc::clone(&puzzles[index]);
            tracing::debug!(puzzle = %puzzle.name(), "running before phase");
            puzzle
                .before(opts)
                .await
                .map_err(|source| CoreError::PuzzleSetup {
                    name: puzzle.name().to_string(),
                    source,
                })?;

            // Puzzles registered from inside before() (fan-out) join the
            // work-list with the usual last-write-wins rule.
            for registered in std::mem::take(&mut opts.puzzles) {
                match puzzles
                    .iter()
                    .position(|existing| existing.name() == registered.name())
                {
                    Some(pos) => puzzles[pos] = registered,
                    None => puzzles.push(registered),
                }
            }
            index += 1;
        }
        Ok(puzzles)
    }
}

/// Serves the root HTTP handler on the HTTP sub-listener. Each accepted
/// connection gets the current mux snapshot, so routes installed by
/// late `start` preludes are visible from the next accept on.
fn http_mount(opts: Arc<Options>) -> MountFn {
    MountFn::daemon("http-listener", move |token| async move {
        let Some(sub) = opts.http_listener() else {
            return Ok(());
        };
        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                accepted = sub.accept() => {
                    let conn = match accepted {
                        Ok(conn) => conn,
                        Err(err) if is_listener_closed(&err) => return Ok(()),
                        Err(err) => return Err(MountError::Io(err)),
                    };
                    let router = opts
                        .http_handler
                        .clone()
                        .unwrap_or_else(|| opts.http_mux.snapshot());
                    tokio::spawn(async move {
                        let service = TowerToHyperService::new(router);
                        let io = TokioIo::new(conn);
                        if let Err(err) = auto::Builder::new(TokioExecutor::new())
                            .serve_connection_with_upgrades(io, service)
                            .await
                        {
                            tracing::debug!(error = %err, "http connection ended with error");
                        }
                    });
                }
            }
        }
    })
}

/// Runs the muxer's accept-and-dispatch loop as a daemon mount.
fn muxer_mount(muxer: Arc<Muxer>) -> MountFn {
    MountFn::daemon("muxer-listener", move |_token| async move {
        match muxer.serve().await {
            Ok(()) => Ok(()),
            Err(err) if is_listener_closed(&err) => Ok(()),
            Err(err) => {
                tracing::error!(error = %err, "muxer serve failed");
                Err(MountError::Io(err))
            }
        }
    })
}

/// Wraps a puzzle's `start` as a daemon mount.
fn puzzle_mount(puzzle: Arc<dyn Puzzle>, opts: Arc<Options>) -> MountFn {
    let name = puzzle.name().to_string();
    MountFn::daemon(name, move |token| async move {
        puzzle.start(token, opts).await
    })
}

/// Converts registered workers into mounts; cron workers share one
/// scheduler mount. Cron parse failures abort assembly.
fn worker_mounts(workers: Vec<WorkerSpec>) -> Result<Vec<MountFn>, CoreError> {
    let mut mounts = Vec::new();
    let mut jobs = Vec::new();

    for worker in workers {
        match worker {
            WorkerSpec::Simple { name, daemon, body } => {
                let body = body.into_inner().expect("worker body lock");
                let mount = if daemon {
                    MountFn::daemon(name, body)
                } else {
                    MountFn::worker(name, body)
                };
                mounts.push(mount);
            }
            WorkerSpec::Cron { name, expr, body } => {
                let spec = CronSpec::parse(&expr).map_err(|reason| CoreError::CronParse {
                    worker: name.to_string(),
                    expr: expr.clone(),
                    reason,
                })?;
                jobs.push(CronJob::new(name, spec, body));
            }
        }
    }

    if !jobs.is_empty() {
        mounts.push(scheduler_mount(jobs));
    }
    Ok(mounts)
}

/// Logs the startup banner.
fn welcome(opts: &Options) {
    if let Some(addr) = opts.listener_addr {
        tracing::info!(%addr, "listening");
    }
    if !opts.service_name.is_empty() {
        tracing::info!(service = %opts.service_name, "service starting");
    }
    if !opts.tags.is_empty() {
        tracing::info!(tags = %opts.tags.join(","), "service tags");
    }
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "core started");
}
