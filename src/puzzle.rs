//! # Puzzles: opt-in subsystems composed into the core.
//!
//! A puzzle is a capability set with a two-phase lifecycle:
//!
//! ```text
//! registered ──before──► prepared ──start──► running ──stop──► stopped
//! ```
//!
//! - `before` runs **sequentially** on the registration task, before any
//!   mount spawns. It must not block on the network. It may mutate
//!   [`Options`]: append tags, install routes, publish a readiness
//!   latch, claim a sub-listener, even register further puzzles.
//! - `start` runs as a daemon mount and may block for the lifetime of
//!   the service. Returning an error tears the core down; a
//!   closed-listener condition must be reported as `Ok(())`.
//! - `stop` is called during graceful shutdown, in registration order.
//!   It must be idempotent and limited to short local cleanup.
//!
//! Puzzles are shared as `Arc<dyn Puzzle>`; state finalised during
//! `before` lives behind interior mutability (`OnceLock`, `Mutex`).

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::MountError;
use crate::options::Options;

/// An opt-in subsystem with `before` / `start` / `stop` capabilities.
#[async_trait]
pub trait Puzzle: Send + Sync {
    /// Stable puzzle name; also the registry key (last-write-wins).
    fn name(&self) -> &str;

    /// Preparation phase: runs sequentially before any mount spawns.
    /// Must not block on network I/O.
    async fn before(&self, opts: &mut Options) -> Result<(), MountError> {
        let _ = opts;
        Ok(())
    }

    /// Running phase: spawned as a daemon mount. May block indefinitely;
    /// must observe `ctx` for cancellation where blocking is possible.
    async fn start(&self, ctx: CancellationToken, opts: Arc<Options>) -> Result<(), MountError>;

    /// Shutdown: idempotent, short, local.
    async fn stop(&self) -> Result<(), MountError> {
        Ok(())
    }
}
