//! # Error types used by the core runtime and mount bodies.
//!
//! Two enums, split by who raises them:
//!
//! - [`CoreError`] errors surfaced by the facade and the mount supervisor.
//! - [`MountError`] errors raised by individual mount bodies and puzzles.
//!
//! Everything with lifecycle implications flows up as a `CoreError`;
//! matcher errors and one-shot worker failures are logged and absorbed.

use std::io;

use thiserror::Error;

/// Errors returned from [`CoreService::start`](crate::CoreService::start)
/// and [`CoreService::run`](crate::CoreService::run).
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum CoreError {
    /// TCP bind failed before any mount was spawned.
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        /// Requested listen address.
        addr: String,
        source: io::Error,
    },

    /// A puzzle's `before` phase failed; no mounts were spawned.
    #[error("puzzle '{name}' setup failed: {source}")]
    PuzzleSetup {
        /// Name of the puzzle whose `before` returned the error.
        name: String,
        source: MountError,
    },

    /// A daemon mount failed and tore down the core.
    #[error("mount '{name}' failed: {source}")]
    Mount {
        /// Name of the failed daemon mount.
        name: String,
        source: MountError,
    },

    /// A cron worker carried an expression that does not parse.
    ///
    /// Raised during `serve` assembly, before any mount runs.
    #[error("cron worker '{worker}' has invalid schedule '{expr}': {reason}")]
    CronParse {
        worker: String,
        expr: String,
        reason: String,
    },

    /// Shutdown was triggered by an OS signal.
    #[error("received signal {signal}")]
    Signal {
        /// Human-readable signal name (e.g. `SIGTERM`).
        signal: String,
    },

    /// The root context was cancelled without a daemon failure
    /// (programmatic [`close`](crate::CoreService::close)).
    #[error("core context canceled")]
    Canceled,

    /// `start` / `run` was called on a core that already served once.
    #[error("core already started")]
    AlreadyStarted,
}

impl CoreError {
    /// Returns a short stable label (snake_case) for logs and metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            CoreError::Bind { .. } => "core_bind",
            CoreError::PuzzleSetup { .. } => "core_puzzle_setup",
            CoreError::Mount { .. } => "core_mount_failed",
            CoreError::CronParse { .. } => "core_cron_parse",
            CoreError::Signal { .. } => "core_signal",
            CoreError::Canceled => "core_canceled",
            CoreError::AlreadyStarted => "core_already_started",
        }
    }
}

/// Errors produced by mount bodies: workers, puzzle `start`/`stop`, and
/// the built-in serve loops.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum MountError {
    /// The body failed with a domain error.
    #[error("{reason}")]
    Failed { reason: String },

    /// An I/O error escaped a serve loop.
    ///
    /// Closed-listener errors never reach this variant; serve loops
    /// normalise them to success via [`is_listener_closed`].
    #[error(transparent)]
    Io(#[from] io::Error),

    /// A readiness wait timed out before the provider signalled.
    #[error("timed out waiting for {what} readiness")]
    Ready { what: &'static str },

    /// The graceful-kill mount observed this OS signal.
    #[error("signal {signal}")]
    Signal { signal: String },

    /// The body ignored cancellation past the drain window and was
    /// abandoned by the supervisor.
    #[error("force closed after drain window (context canceled)")]
    ForceClosed,

    /// The body observed cancellation and exited cooperatively.
    ///
    /// Not a failure; signals intentional termination.
    #[error("context canceled")]
    Canceled,
}

impl MountError {
    /// Builds a [`MountError::Failed`] from any displayable reason.
    pub fn failed(reason: impl std::fmt::Display) -> Self {
        MountError::Failed {
            reason: reason.to_string(),
        }
    }

    /// Returns a short stable label.
    pub fn as_label(&self) -> &'static str {
        match self {
            MountError::Failed { .. } => "mount_failed",
            MountError::Io(_) => "mount_io",
            MountError::Ready { .. } => "mount_ready_timeout",
            MountError::Signal { .. } => "mount_signal",
            MountError::ForceClosed => "mount_force_closed",
            MountError::Canceled => "mount_canceled",
        }
    }

    /// True for the two cancellation-shaped outcomes the supervisor
    /// treats as the context's cause rather than a real failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, MountError::Canceled | MountError::ForceClosed)
    }
}

/// Whether an I/O error means "the listener backing this serve loop was
/// closed", i.e. the ordinary shutdown path rather than a failure.
pub fn is_listener_closed(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted | io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe
    )
}

/// The closed-listener error handed out by sub-listeners after
/// [`Muxer::close`](crate::mux::Muxer::close).
pub(crate) fn listener_closed() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "listener closed")
}
