//! End-to-end flows over a real bound port: raw TCP clients against a
//! running core.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::routing::get;
use axum::Router;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use corevisor::{puzzles, CoreError, CoreService, MountError, Options, Puzzle};

/// Starts the core on an ephemeral port and waits for the bind.
async fn start_core(opts: Options) -> (Arc<CoreService>, std::net::SocketAddr, tokio::task::JoinHandle<Result<(), CoreError>>) {
    let core = Arc::new(CoreService::new(opts));
    let handle = {
        let core = Arc::clone(&core);
        tokio::spawn(async move { core.start(0u16).await })
    };

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    let addr = loop {
        if let Some(addr) = core.local_addr() {
            break addr;
        }
        assert!(tokio::time::Instant::now() < deadline, "core never bound");
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    // Give the mounts a beat to start accepting.
    tokio::time::sleep(Duration::from_millis(50)).await;
    (core, addr, handle)
}

/// One HTTP/1 request over a fresh connection; returns (status, body).
async fn http_get(addr: std::net::SocketAddr, path: &str) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let text = String::from_utf8_lossy(&raw).into_owned();

    let status: u16 = text
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or(0);
    let body = text
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default();
    (status, body)
}

#[tokio::test]
async fn http_only_service_serves_routes_and_nothing_else() {
    let mut opts = Options::new("http-only");
    puzzles::http::serve_routes(
        &mut opts,
        "/api",
        Router::new().route("/hello", get(|| async { "hello world" })),
    );

    let (core, addr, handle) = start_core(opts).await;

    let (status, body) = http_get(addr, "/api/hello").await;
    assert_eq!(status, 200);
    assert_eq!(body, "hello world");

    let (status, _) = http_get(addr, "/health").await;
    assert_eq!(status, 200);

    // No pprof puzzle registered, so no debug surface.
    let (status, _) = http_get(addr, "/debug/pprof/heap").await;
    assert_eq!(status, 404);

    core.close();
    let err = handle.await.unwrap().unwrap_err();
    assert!(matches!(err, CoreError::Canceled));
}

#[tokio::test]
async fn pprof_and_http_coexist() {
    let mut opts = Options::new("debuggable");
    puzzles::pprof::enable(&mut opts);
    puzzles::http::serve_routes(
        &mut opts,
        "/api",
        Router::new().route("/hello", get(|| async { "hello world" })),
    );

    let (core, addr, handle) = start_core(opts).await;

    let (status, body) = http_get(addr, "/debug/pprof/").await;
    assert_eq!(status, 200);
    assert!(body.contains("heap"));

    let (status, body) = http_get(addr, "/api/hello").await;
    assert_eq!(status, 200);
    assert_eq!(body, "hello world");

    core.close();
    let _ = handle.await.unwrap();
}

struct StopTracker {
    stopped: Arc<AtomicUsize>,
}

#[async_trait]
impl Puzzle for StopTracker {
    fn name(&self) -> &str {
        "stop-tracker"
    }

    async fn start(&self, ctx: CancellationToken, _opts: Arc<Options>) -> Result<(), MountError> {
        ctx.cancelled().await;
        Err(MountError::Canceled)
    }

    async fn stop(&self) -> Result<(), MountError> {
        self.stopped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn daemon_failure_tears_the_core_down() {
    let stopped = Arc::new(AtomicUsize::new(0));
    let worker_saw_cancel = Arc::new(AtomicBool::new(false));

    let mut opts = Options::new("doomed");
    opts.register_puzzle(Arc::new(StopTracker {
        stopped: Arc::clone(&stopped),
    }));
    opts.daemon_worker("broken", |_ctx| async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Err(MountError::failed("exploded after 100ms"))
    });
    {
        let saw = Arc::clone(&worker_saw_cancel);
        opts.named_worker("sleeper", move |ctx| async move {
            ctx.cancelled().await;
            saw.store(true, Ordering::SeqCst);
            Ok(())
        });
    }

    let (_core, addr, handle) = start_core(opts).await;

    let err = handle.await.unwrap().unwrap_err();
    assert!(matches!(err, CoreError::Mount { ref name, .. } if name == "broken"));

    // The shutdown sequence still ran: puzzles stopped, listener closed,
    // cancellation observed by the surviving worker.
    assert_eq!(stopped.load(Ordering::SeqCst), 1);
    assert!(worker_saw_cancel.load(Ordering::SeqCst));
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn close_cancels_long_running_workers_within_the_drain_window() {
    let worker_saw_cancel = Arc::new(AtomicBool::new(false));

    let mut opts = Options::new("long-worker");
    {
        let saw = Arc::clone(&worker_saw_cancel);
        opts.named_worker("long", move |ctx| async move {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(30)) => {}
                _ = ctx.cancelled() => saw.store(true, Ordering::SeqCst),
            }
            Ok(())
        });
    }

    let (core, _addr, handle) = start_core(opts).await;

    let begun = tokio::time::Instant::now();
    core.close();
    let err = handle.await.unwrap().unwrap_err();

    assert!(matches!(err, CoreError::Canceled));
    assert!(begun.elapsed() < Duration::from_secs(5));
    assert!(worker_saw_cancel.load(Ordering::SeqCst));
}
