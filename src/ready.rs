//! # One-shot readiness signals between puzzles.
//!
//! [`Ready`] is a clone-able latch a providing puzzle fires exactly once
//! when it reaches a milestone (server object built, routes mounted), and
//! that any number of dependents await with a bounded timeout.
//!
//! ## Rules
//! - `signal()` fires once; a second call is a programming error.
//! - Once signalled, every later `wait` observes the signal immediately,
//!   regardless of when the dependent subscribed.
//! - Dependents never block unboundedly: [`Ready::wait`] takes a timeout
//!   (the crate-wide default is [`READY_TIMEOUT`]) and callers select
//!   against their own cancellation token as well.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time;

use crate::error::MountError;

/// Default bound on readiness waits.
pub const READY_TIMEOUT: Duration = Duration::from_secs(5);

/// A one-shot readiness latch.
///
/// Backed by a `tokio::sync::watch` channel so the signal is level-, not
/// edge-triggered: late subscribers still observe it.
#[derive(Clone)]
pub struct Ready {
    tx: watch::Sender<bool>,
    what: &'static str,
}

impl Ready {
    /// Creates an unsignalled latch. `what` names the milestone in
    /// timeout errors and logs (e.g. `"grpc"`, `"pprof"`).
    pub fn new(what: &'static str) -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx, what }
    }

    /// Fires the latch.
    ///
    /// Calling twice indicates a provider bug; the duplicate is ignored
    /// in release builds.
    pub fn signal(&self) {
        let already = self.tx.send_replace(true);
        debug_assert!(!already, "readiness '{}' signalled twice", self.what);
        if already {
            tracing::warn!(what = self.what, "readiness signalled twice, ignoring");
        }
    }

    /// True once [`signal`](Ready::signal) has fired.
    pub fn is_signalled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Waits up to `timeout` for the latch to fire.
    ///
    /// Resolves immediately when the latch is already set. Returns
    /// [`MountError::Ready`] on timeout.
    pub async fn wait(&self, timeout: Duration) -> Result<(), MountError> {
        let mut rx = self.tx.subscribe();
        let result = match time::timeout(timeout, rx.wait_for(|ready| *ready)).await {
            Ok(Ok(_)) => Ok(()),
            // The sender side lives inside self, so the channel cannot
            // close while we hold it; treat closure as a timeout anyway.
            Ok(Err(_)) | Err(_) => Err(MountError::Ready { what: self.what }),
        };
        result
    }

    /// [`wait`](Ready::wait) with the crate default bound.
    pub async fn wait_default(&self) -> Result<(), MountError> {
        self.wait(READY_TIMEOUT).await
    }
}

impl std::fmt::Debug for Ready {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ready")
            .field("what", &self.what)
            .field("signalled", &self.is_signalled())
            .finish()
    }
}
