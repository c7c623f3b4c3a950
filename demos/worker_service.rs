//! Listener-less worker demo: a pure-cron daemon driven by `run()`.

use std::time::Duration;

use corevisor::{CoreService, Options};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().init();

    let mut opts = Options::new("demo-worker");
    opts.named_worker("warmup", |_ctx| async {
        tracing::info!("warming caches");
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(())
    });
    opts.cron_worker("sweep", "@every 5s", |ctx| async move {
        tracing::info!("sweeping");
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            _ = ctx.cancelled() => {}
        }
        Ok(())
    });

    let core = CoreService::new(opts);
    match core.run().await {
        Ok(()) => tracing::info!("worker core finished"),
        Err(err) => tracing::info!(error = %err, "worker core stopped"),
    }
    Ok(())
}
