//! HTTP service demo: routes under `/api`, pprof, and a cron heartbeat
//! on one port.
//!
//! ```text
//! cargo run --example http_service
//! curl http://127.0.0.1:8080/api/hello
//! curl http://127.0.0.1:8080/debug/pprof/
//! ```

use axum::routing::get;
use axum::Router;

use corevisor::{puzzles, CoreService, Options};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,corevisor=debug".into()),
        )
        .init();

    let mut opts = Options::new("demo-http:edge");
    puzzles::pprof::enable(&mut opts);
    puzzles::http::serve_routes(
        &mut opts,
        "/api",
        Router::new().route("/hello", get(|| async { "hello world" })),
    );
    opts.cron_worker("heartbeat", "@every 30s", |_ctx| async {
        tracing::info!("heartbeat");
        Ok(())
    });

    let core = CoreService::new(opts);
    match core.start(8080u16).await {
        Ok(()) => tracing::info!("core finished"),
        Err(err) => tracing::info!(error = %err, "core stopped"),
    }
    Ok(())
}
