//! # Pprof puzzle: process debug surface under `/debug/pprof/`.
//!
//! Serves the classic profile index and per-profile endpoints. Reports
//! are process-level snapshots (memory, threads, cmdline) read from the
//! OS; profile classes the runtime cannot produce answer `501` rather
//! than pretending.
//!
//! The puzzle owns the `WaitPprof` readiness latch: it is created at
//! registration and signalled once the routes are mounted, which is
//! what the HTTP puzzle gates its own mounting on.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::StatusCode;
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;

use crate::error::MountError;
use crate::options::Options;
use crate::puzzle::Puzzle;
use crate::ready::Ready;

const PPROF_PREFIX: &str = "/debug/pprof";

/// Profile endpoints exposed under the index.
const PROFILES: [&str; 10] = [
    "allocs",
    "block",
    "cmdline",
    "goroutine",
    "heap",
    "mutex",
    "profile",
    "threadcreate",
    "trace",
    "symbol",
];

/// Enables the pprof puzzle and publishes its readiness latch.
pub fn enable(opts: &mut Options) {
    opts.wait_pprof = Some(Ready::new("pprof"));
    opts.register_puzzle(Arc::new(PprofPuzzle));
}

/// The pprof debug puzzle.
pub struct PprofPuzzle;

#[async_trait]
impl Puzzle for PprofPuzzle {
    fn name(&self) -> &str {
        "pprof"
    }

    async fn start(&self, _ctx: CancellationToken, opts: Arc<Options>) -> Result<(), MountError> {
        opts.http_mux.mount(PPROF_PREFIX, router());
        if let Some(ready) = &opts.wait_pprof {
            ready.signal();
        }

        if let Some(addr) = opts.listener_addr() {
            tracing::debug!(
                url = %format!("http://localhost:{}{}/", addr.port(), PPROF_PREFIX),
                "pprof puzzle enabled"
            );
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), MountError> {
        tracing::debug!("pprof puzzle stopped");
        Ok(())
    }
}

fn router() -> Router {
    Router::new()
        .route("/", get(index))
        .route("/cmdline", get(cmdline))
        .route("/goroutine", get(tasks_report))
        .route("/threadcreate", get(tasks_report))
        .route("/heap", get(memory_report))
        .route("/allocs", get(memory_report))
        .route("/block", get(unsupported))
        .route("/mutex", get(unsupported))
        .route("/profile", get(unsupported))
        .route("/trace", get(unsupported))
        .route("/symbol", get(unsupported))
}

async fn index() -> Html<String> {
    let mut page = String::from("<html><head><title>/debug/pprof/</title></head><body>\n");
    page.push_str("<h1>/debug/pprof/</h1>\n<ul>\n");
    for profile in PROFILES {
        page.push_str(&format!(
            "<li><a href=\"{PPROF_PREFIX}/{profile}\">{profile}</a></li>\n"
        ));
    }
    page.push_str("</ul>\n</body></html>\n");
    Html(page)
}

async fn cmdline() -> String {
    std::env::args().collect::<Vec<_>>().join("\x00")
}

async fn tasks_report() -> String {
    format!(
        "threads: {}\nuptime reference: process status\n{}",
        proc_status_field("Threads").unwrap_or_else(|| "unknown".to_string()),
        proc_status().unwrap_or_default()
    )
}

async fn memory_report() -> String {
    let mut out = String::new();
    for field in ["VmRSS", "VmHWM", "VmSize", "VmData"] {
        let value = proc_status_field(field).unwrap_or_else(|| "unknown".to_string());
        out.push_str(&format!("{field}: {value}\n"));
    }
    out
}

async fn unsupported() -> (StatusCode, &'static str) {
    (
        StatusCode::NOT_IMPLEMENTED,
        "this profile class is not available on this runtime\n",
    )
}

#[cfg(target_os = "linux")]
fn proc_status() -> Option<String> {
    std::fs::read_to_string("/proc/self/status").ok()
}

#[cfg(not(target_os = "linux"))]
fn proc_status() -> Option<String> {
    None
}

fn proc_status_field(field: &str) -> Option<String> {
    let status = proc_status()?;
    status
        .lines()
        .find(|line| line.starts_with(field))
        .and_then(|line| line.split_once(':'))
        .map(|(_, value)| value.trim().to_string())
}
