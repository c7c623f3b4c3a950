//! # HTTP puzzle: mounts caller routes on the shared mux.
//!
//! Installs a router under a path prefix, adds the `/health` endpoint,
//! and optionally wraps the mounted routes in a permissive CORS layer.
//!
//! When the pprof puzzle is enabled, this puzzle waits for its
//! readiness latch before mounting, so the HTTP surface never serves
//! ahead of the debug routes.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use crate::error::MountError;
use crate::options::Options;
use crate::puzzle::Puzzle;

/// Mounts `router` under `pattern` on the core's HTTP surface.
pub fn serve_routes(opts: &mut Options, pattern: impl Into<String>, router: Router) {
    opts.register_puzzle(Arc::new(HttpPuzzle::new(pattern, router)));
}

/// The HTTP mount puzzle. Build with [`HttpPuzzle::new`], optionally
/// [`with_cors`](HttpPuzzle::with_cors), then register.
pub struct HttpPuzzle {
    pattern: String,
    router: Mutex<Option<Router>>,
    cors: bool,
}

impl HttpPuzzle {
    /// A puzzle serving `router` under `pattern` (leading slash added
    /// when missing).
    pub fn new(pattern: impl Into<String>, router: Router) -> Self {
        let mut pattern = pattern.into();
        if !pattern.starts_with('/') {
            pattern.insert(0, '/');
        }
        Self {
            pattern,
            router: Mutex::new(Some(router)),
            cors: false,
        }
    }

    /// Applies a permissive CORS layer to the mounted routes.
    pub fn with_cors(mut self) -> Self {
        self.cors = true;
        self
    }
}

#[async_trait]
impl Puzzle for HttpPuzzle {
    fn name(&self) -> &str {
        "http"
    }

    async fn start(&self, ctx: CancellationToken, opts: Arc<Options>) -> Result<(), MountError> {
        // Serve nothing before the pprof routes exist.
        if let Some(pprof) = &opts.wait_pprof {
            tokio::select! {
                res = pprof.wait_default() => res?,
                _ = ctx.cancelled() => return Err(MountError::Canceled),
            }
        }

        let Some(mut router) = self.router.lock().expect("http puzzle router lock").take()
        else {
            return Ok(());
        };
        if self.cors {
            router = router.layer(CorsLayer::permissive());
        }

        opts.http_mux.route("/health", get(|| async { "ok" }));
        opts.http_mux.mount(&self.pattern, router);

        if let Some(addr) = opts.listener_addr() {
            tracing::debug!(
                url = %format!("http://127.0.0.1:{}{}", addr.port(), self.pattern),
                "http puzzle enabled"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ready::Ready;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    async fn status(router: Router, uri: &str) -> StatusCode {
        router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn mounts_routes_and_health() {
        let puzzle = HttpPuzzle::new("api", Router::new().route("/hello", get(|| async { "hello world" })));
        let opts = Arc::new(Options::new("svc"));

        puzzle
            .start(CancellationToken::new(), Arc::clone(&opts))
            .await
            .unwrap();

        let router = opts.http_mux.snapshot();
        assert_eq!(status(router.clone(), "/api/hello").await, StatusCode::OK);
        assert_eq!(status(router.clone(), "/health").await, StatusCode::OK);
        // No pprof puzzle, no debug surface.
        assert_eq!(
            status(router, "/debug/pprof/heap").await,
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn waits_for_pprof_readiness() {
        let puzzle = HttpPuzzle::new("/api", Router::new());
        let mut raw = Options::new("svc");
        let ready = Ready::new("pprof");
        raw.wait_pprof = Some(ready.clone());
        let opts = Arc::new(raw);

        let task = {
            let opts = Arc::clone(&opts);
            tokio::spawn(async move { puzzle.start(CancellationToken::new(), opts).await })
        };
        tokio::task::yield_now().await;
        assert!(!task.is_finished());

        ready.signal();
        task.await.unwrap().unwrap();
    }
}
