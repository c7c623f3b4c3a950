//! # corevisor
//!
//! **Corevisor** is a composition core for long-running network
//! services: one TCP listener multiplexed across HTTP/1, HTTP/2 and
//! gRPC, a mount supervisor with bounded graceful drain, and opt-in
//! "puzzle" subsystems wired together by a two-phase startup protocol.
//!
//! ## Features
//!
//! | Area               | Description                                                        | Key types / traits                     |
//! |--------------------|--------------------------------------------------------------------|----------------------------------------|
//! | **Facade**         | Build options, bind, serve, shut down.                             | [`CoreService`], [`Options`]           |
//! | **Multiplexing**   | Classify connections by first bytes onto sub-listeners.            | [`mux::Muxer`], [`mux::SubListener`]   |
//! | **Supervision**    | Daemon / one-shot mounts, 5 s drain after cancellation.            | workers via [`Options`]                |
//! | **Puzzles**        | Opt-in subsystems with `before` / `start` / `stop`.                | [`Puzzle`], [`puzzles`]                |
//! | **Readiness**      | One-shot cross-puzzle milestones with bounded waits.               | [`Ready`]                              |
//! | **Errors**         | Typed errors for the facade and for mount bodies.                  | [`CoreError`], [`MountError`]          |
//!
//! ```no_run
//! use axum::routing::get;
//! use axum::Router;
//! use corevisor::{puzzles, CoreService, Options};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut opts = Options::new("hello-service");
//!     puzzles::pprof::enable(&mut opts);
//!     puzzles::http::serve_routes(
//!         &mut opts,
//!         "/api",
//!         Router::new().route("/hello", get(|| async { "hello world" })),
//!     );
//!     opts.cron_worker("heartbeat", "@every 30s", |_ctx| async {
//!         tracing::info!("alive");
//!         Ok(())
//!     });
//!
//!     let core = CoreService::new(opts);
//!     // Blocks until SIGTERM/SIGINT, a daemon failure, or close().
//!     let err = core.start(8080u16).await.unwrap_err();
//!     tracing::info!(error = %err, "service stopped");
//!     Ok(())
//! }
//! ```
//!
//! ## Lifecycle
//! ```text
//! Options ─► CoreService::new ─► start(addr) / run()
//!     bind ─► before pass (sequential, may claim sub-listeners)
//!          ─► mounts spawn: graceful-kill, http, muxer, puzzles, workers
//!          ─► blocks until signal / daemon failure / close()
//!          ─► stop puzzles, close listeners, cancel, drain ≤ 5 s
//! ```
//!
//! ---

mod core;
mod cron;
mod error;
mod options;
mod puzzle;
mod ready;

pub mod mux;
pub mod puzzles;

mod mount;

// ---- Public re-exports ----

pub use crate::core::{CoreService, ListenAddr};
pub use error::{is_listener_closed, CoreError, MountError};
pub use options::{HttpMux, Options};
pub use puzzle::Puzzle;
pub use ready::{Ready, READY_TIMEOUT};
