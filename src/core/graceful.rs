//! # Signal-triggered graceful shutdown.
//!
//! The graceful-kill daemon mount turns a process signal into orderly
//! teardown:
//!
//! 1. `stop` every registered puzzle in registration order (errors are
//!    logged, never abort the sequence),
//! 2. close the muxer (all sub-listeners fail their accepts, the root
//!    listener is released),
//! 3. cancel the root token,
//! 4. return the signal's identity so the supervisor reports teardown
//!    as "triggered", not "unexpected".
//!
//! When the root token falls for another reason (daemon failure,
//! programmatic close) the same stop/close sequence runs, but the mount
//! reports plain cancellation so the original cause wins.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::MountError;
use crate::mount::MountFn;
use crate::mux::Muxer;
use crate::puzzle::Puzzle;

/// Builds the always-present graceful-kill daemon mount.
pub(crate) fn graceful_kill(
    root: CancellationToken,
    puzzles: Vec<Arc<dyn Puzzle>>,
    muxer: Option<Arc<Muxer>>,
) -> MountFn {
    MountFn::daemon("graceful-kill", move |child| async move {
        tokio::select! {
            signal = wait_for_shutdown_signal() => {
                let signal = signal.map_err(MountError::Io)?;
                tracing::info!(signal, "graceful stopping puzzles");
                stop_puzzles(&puzzles).await;
                if let Some(muxer) = &muxer {
                    muxer.close();
                }
                root.cancel();
                tracing::info!("graceful stop complete");
                Err(MountError::Signal {
                    signal: signal.to_string(),
                })
            }
            _ = child.cancelled() => {
                stop_puzzles(&puzzles).await;
                if let Some(muxer) = &muxer {
                    muxer.close();
                }
                Err(MountError::Canceled)
            }
        }
    })
}

/// Stops every puzzle in registration order; per-puzzle errors are
/// logged and the sequence continues.
pub(crate) async fn stop_puzzles(puzzles: &[Arc<dyn Puzzle>]) {
    for puzzle in puzzles {
        match puzzle.stop().await {
            Ok(()) => tracing::debug!(puzzle = %puzzle.name(), "puzzle stopped"),
            Err(err) => {
                tracing::error!(puzzle = %puzzle.name(), error = %err, "puzzle stop failed");
            }
        }
    }
}

/// Waits for a termination signal and reports which one fired.
///
/// Unix: SIGINT, SIGTERM, SIGQUIT, SIGHUP plus ctrl-c. Elsewhere only
/// ctrl-c is available.
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;
    let mut sighup = signal(SignalKind::hangup())?;

    let signal = tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
        _ = sigquit.recv() => "SIGQUIT",
        _ = sighup.recv() => "SIGHUP",
    };
    Ok(signal)
}

/// Waits for a termination signal and reports which one fired.
#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("interrupt")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recording {
        order: Arc<std::sync::Mutex<Vec<&'static str>>>,
        label: &'static str,
        fail: bool,
        stops: AtomicUsize,
    }

    #[async_trait]
    impl Puzzle for Recording {
        fn name(&self) -> &str {
            self.label
        }

        async fn start(
            &self,
            _ctx: CancellationToken,
            _opts: Arc<Options>,
        ) -> Result<(), MountError> {
            Ok(())
        }

        async fn stop(&self) -> Result<(), MountError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.order.lock().unwrap().push(self.label);
            if self.fail {
                Err(MountError::failed("stop failed"))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn stop_runs_all_puzzles_in_order_despite_failures() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let make = |label, fail| {
            Arc::new(Recording {
                order: Arc::clone(&order),
                label,
                fail,
                stops: AtomicUsize::new(0),
            })
        };
        let a = make("a", false);
        let b = make("b", true);
        let c = make("c", false);
        let puzzles: Vec<Arc<dyn Puzzle>> = vec![a.clone(), b.clone(), c.clone()];

        stop_puzzles(&puzzles).await;
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(b.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_path_stops_puzzles_and_reports_cancel() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let puzzle = Arc::new(Recording {
            order: Arc::clone(&order),
            label: "p",
            fail: false,
            stops: AtomicUsize::new(0),
        });

        let root = CancellationToken::new();
        let mount = graceful_kill(root.clone(), vec![puzzle.clone()], None);
        let (_name, daemon, body) = mount.into_body(&root);
        assert!(daemon);

        root.cancel();
        let res = body.await;
        assert!(matches!(res, Err(MountError::Canceled)));
        assert_eq!(*order.lock().unwrap(), vec!["p"]);
    }
}
