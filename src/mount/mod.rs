//! # Mount supervision.
//!
//! A *mount* is one supervised unit of concurrent work: a serve loop, a
//! worker, a puzzle's `start`, the graceful-kill waiter. The supervisor
//! runs a fixed set of mounts under one cancellation token and applies
//! the daemon / one-shot failure policy.
//!
//! - [`spec`]       the [`MountFn`] unit itself
//! - [`supervisor`] runs the set, aggregates failures
//! - [`wait`]       the bounded-drain kernel, [`wait_context`]
//!
//! ## Shutdown timeline
//! ```text
//! token cancelled (signal, daemon failure, or close)
//!   → every mount body sees its child token cancelled
//!   → wait_context arms the 5 s drain per mount
//!   → bodies that finish in time return their own result
//!   → stragglers are logged and abandoned (ForceClosed)
//! ```

pub(crate) mod spec;
pub(crate) mod supervisor;
pub(crate) mod wait;

pub(crate) use spec::{MountFn, MountFuture};
pub(crate) use supervisor::run_mounts;
pub(crate) use wait::wait_context;
