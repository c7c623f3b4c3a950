//! # Bounded-drain waiting, the supervisor's hard kernel.
//!
//! [`wait_context`] runs a body future as its own task and supervises
//! it against a cancellation token:
//!
//! ```text
//! body finishes first              → its result
//! token cancelled, quit now        → Canceled (body keeps running,
//!                                    detached; nobody waits for it)
//! token cancelled, drain allowed   → wait up to 5 s for the body
//!     body finishes within window  → its result
//!     window elapses               → log "force closing", ForceClosed
//! ```
//!
//! The abandoned body is never aborted: serve loops own sockets whose
//! teardown should run, and an abort could tear state mid-write. It is
//! detached and the process is expected to exit shortly after.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinError;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::error::MountError;

/// Grace window granted to a mount after cancellation.
pub(crate) const DRAIN_WINDOW: Duration = Duration::from_secs(5);

/// Supervises `body` against `token`. See the module docs for the
/// decision table.
pub(crate) async fn wait_context<F>(
    token: CancellationToken,
    quit_immediately: bool,
    body: F,
) -> Result<(), MountError>
where
    F: Future<Output = Result<(), MountError>> + Send + 'static,
{
    let mut task = tokio::spawn(body);

    tokio::select! {
        res = &mut task => flatten(res),
        _ = token.cancelled() => {
            if quit_immediately {
                return Err(MountError::Canceled);
            }
            match time::timeout(DRAIN_WINDOW, &mut task).await {
                Ok(res) => flatten(res),
                Err(_elapsed) => {
                    tracing::warn!("force closing mount after drain window");
                    Err(MountError::ForceClosed)
                }
            }
        }
    }
}

fn flatten(res: Result<Result<(), MountError>, JoinError>) -> Result<(), MountError> {
    match res {
        Ok(inner) => inner,
        Err(join) if join.is_panic() => Err(MountError::failed(format!("mount panicked: {join}"))),
        Err(_cancelled) => Err(MountError::Canceled),
    }
}
