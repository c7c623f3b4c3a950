//! # Mount supervisor: runs the set, aggregates failures.
//!
//! ## Rules
//! - Every mount runs under [`wait_context`] with the bounded drain.
//! - A **daemon** failure cancels the shared token and becomes the
//!   supervisor's result; everything else then drains.
//! - A **one-shot** failure is logged and swallowed.
//! - Cancellation-shaped daemon results (the body saw the token and
//!   exited, or was force closed) are reported only when no real
//!   failure occurred, so the error that *caused* teardown wins over
//!   the errors teardown *produced*.

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::{CoreError, MountError};
use crate::mount::spec::MountFn;
use crate::mount::wait::wait_context;

/// Runs `mounts` to completion under `token`.
///
/// Blocks until every mount has returned (or been force closed). The
/// first real daemon failure is returned; if teardown was triggered by
/// cancellation alone, the cancellation cause is returned.
pub(crate) async fn run_mounts(
    token: CancellationToken,
    mounts: Vec<MountFn>,
) -> Result<(), CoreError> {
    let mut set = JoinSet::new();
    for mount in mounts {
        let supervisor_token = token.clone();
        let (name, daemon, body) = mount.into_body(&token);
        tracing::debug!(mount = %name, daemon, "spawning mount");
        set.spawn(async move {
            let res = wait_context(supervisor_token, false, body).await;
            (name, daemon, res)
        });
    }

    let mut failure: Option<CoreError> = None;
    let mut cancelled: Option<CoreError> = None;

    while let Some(joined) = set.join_next().await {
        let (name, daemon, res) = match joined {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(error = %err, "mount supervisor task failed to join");
                continue;
            }
        };

        match res {
            Ok(()) => tracing::debug!(mount = %name, "mount finished"),
            Err(err) if !daemon => {
                tracing::error!(mount = %name, error = %err, "worker failed");
            }
            Err(err) if err.is_cancellation() => {
                tracing::debug!(mount = %name, error = %err, "daemon stopped by cancellation");
                cancelled.get_or_insert(CoreError::Canceled);
            }
            Err(err) => {
                tracing::error!(mount = %name, error = %err, "daemon mount failed");
                if failure.is_none() {
                    failure = Some(promote(name.into_owned(), err));
                }
                token.cancel();
            }
        }
    }

    match (failure, cancelled) {
        (Some(err), _) => Err(err),
        (None, Some(err)) => Err(err),
        (None, None) if token.is_cancelled() => Err(CoreError::Canceled),
        (None, None) => Ok(()),
    }
}

/// Lifts a daemon failure to the user-visible error. Signal identity is
/// preserved so callers can tell "asked to stop" from "broke".
fn promote(name: String, err: MountError) -> CoreError {
    match err {
        MountError::Signal { signal } => CoreError::Signal { signal },
        source => CoreError::Mount { name, source },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn daemon_failure_cancels_the_rest_and_propagates() {
        let token = CancellationToken::new();
        let peer_saw_cancel = Arc::new(AtomicBool::new(false));

        let failing = MountFn::daemon("broken", |_token| async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Err(MountError::failed("exploded"))
        });
        let peer = {
            let saw = Arc::clone(&peer_saw_cancel);
            MountFn::daemon("peer", move |token| async move {
                token.cancelled().await;
                saw.store(true, Ordering::SeqCst);
                Err(MountError::Canceled)
            })
        };

        let err = run_mounts(token, vec![failing, peer]).await.unwrap_err();
        assert!(matches!(err, CoreError::Mount { ref name, .. } if name == "broken"));
        assert!(peer_saw_cancel.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn one_shot_failures_are_swallowed() {
        let token = CancellationToken::new();
        let worker = MountFn::worker("flaky", |_token| async {
            Err(MountError::failed("transient"))
        });
        let fine = MountFn::worker("fine", |_token| async { Ok(()) });

        run_mounts(token, vec![worker, fine]).await.unwrap();
    }

    #[tokio::test]
    async fn signal_identity_beats_teardown_cancellations() {
        let token = CancellationToken::new();

        // A daemon that reports a signal and cancels, and a daemon that
        // (racing ahead of it) reports plain cancellation.
        let killer = {
            let token = token.clone();
            MountFn::daemon("graceful-kill", move |_child| async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                token.cancel();
                Err(MountError::Signal {
                    signal: "SIGTERM".into(),
                })
            })
        };
        let server = MountFn::daemon("server", |token| async move {
            token.cancelled().await;
            Err(MountError::Canceled)
        });

        let err = run_mounts(token, vec![killer, server]).await.unwrap_err();
        assert!(matches!(err, CoreError::Signal { ref signal } if signal == "SIGTERM"));
    }

    #[tokio::test]
    async fn external_cancellation_reports_the_cause() {
        let token = CancellationToken::new();
        let outside = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            outside.cancel();
        });

        let server = MountFn::daemon("server", |token| async move {
            token.cancelled().await;
            Err(MountError::Canceled)
        });

        let err = run_mounts(token, vec![server]).await.unwrap_err();
        assert!(matches!(err, CoreError::Canceled));
    }
}
