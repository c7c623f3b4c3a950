//! # gRPC UI puzzle: reflection-backed explorer under `/debug/grpc/ui/`.
//!
//! Dials the core's own listener over a lazy loopback channel
//! (`before` never touches the network), waits for the gRPC puzzle's
//! readiness latch, then mounts a small exploration surface that lists
//! the server's services through the reflection API on every request.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint};
use tonic_reflection::pb::v1::server_reflection_client::ServerReflectionClient;
use tonic_reflection::pb::v1::server_reflection_request::MessageRequest;
use tonic_reflection::pb::v1::server_reflection_response::MessageResponse;
use tonic_reflection::pb::v1::ServerReflectionRequest;

use crate::error::MountError;
use crate::options::Options;
use crate::puzzle::Puzzle;

const UI_PREFIX: &str = "/debug/grpc/ui";

/// Enables the gRPC UI puzzle. Requires the gRPC puzzle.
pub fn enable(opts: &mut Options) {
    opts.register_puzzle(Arc::new(GrpcUiPuzzle::new()));
}

/// The reflection explorer puzzle.
pub struct GrpcUiPuzzle {
    self_dial: OnceLock<Channel>,
}

impl GrpcUiPuzzle {
    pub fn new() -> Self {
        Self {
            self_dial: OnceLock::new(),
        }
    }
}

impl Default for GrpcUiPuzzle {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Puzzle for GrpcUiPuzzle {
    fn name(&self) -> &str {
        "grpc-ui"
    }

    async fn before(&self, opts: &mut Options) -> Result<(), MountError> {
        let addr = opts
            .listener_addr()
            .ok_or_else(|| MountError::failed("grpc-ui requires a listener"))?;
        let endpoint = Endpoint::from_shared(format!("http://127.0.0.1:{}", addr.port()))
            .map_err(MountError::failed)?;
        // connect_lazy: the channel dials on first use, keeping before
        // free of network I/O.
        let _ = self.self_dial.set(endpoint.connect_lazy());
        Ok(())
    }

    async fn start(&self, ctx: CancellationToken, opts: Arc<Options>) -> Result<(), MountError> {
        let Some(grpc_ready) = &opts.wait_grpc else {
            return Err(MountError::failed(
                "grpc-ui requires the grpc puzzle to be registered",
            ));
        };
        tokio::select! {
            res = grpc_ready.wait_default() => res?,
            _ = ctx.cancelled() => return Err(MountError::Canceled),
        }

        let channel = self
            .self_dial
            .get()
            .cloned()
            .ok_or_else(|| MountError::failed("grpc-ui before phase did not run"))?;

        opts.http_mux.mount(UI_PREFIX, ui_router(channel));
        if let Some(addr) = opts.listener_addr() {
            tracing::debug!(
                url = %format!("http://127.0.0.1:{}{}/", addr.port(), UI_PREFIX),
                "grpc-ui puzzle enabled"
            );
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), MountError> {
        tracing::debug!("grpc-ui puzzle stopped");
        Ok(())
    }
}

fn ui_router(channel: Channel) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/services", get(services))
        .with_state(channel)
}

async fn index(State(channel): State<Channel>) -> Result<Html<String>, (StatusCode, String)> {
    let services = list_services(channel).await.map_err(reflection_error)?;

    let mut page = String::from(
        "<html><head><title>grpc explorer</title></head><body>\n<h1>gRPC services</h1>\n<ul>\n",
    );
    for service in services {
        page.push_str(&format!("<li><code>{service}</code></li>\n"));
    }
    page.push_str("</ul>\n<p>Plain-text listing at ");
    page.push_str(&format!("<a href=\"{UI_PREFIX}/services\">services</a></p>\n"));
    page.push_str("</body></html>\n");
    Ok(Html(page))
}

async fn services(State(channel): State<Channel>) -> Result<String, (StatusCode, String)> {
    let services = list_services(channel).await.map_err(reflection_error)?;
    Ok(services.join("\n"))
}

fn reflection_error(status: tonic::Status) -> (StatusCode, String) {
    (
        StatusCode::BAD_GATEWAY,
        format!("reflection request failed: {status}"),
    )
}

/// One `list_services` round trip on the reflection stream.
async fn list_services(channel: Channel) -> Result<Vec<String>, tonic::Status> {
    let mut client = ServerReflectionClient::new(channel);
    let request = ServerReflectionRequest {
        host: String::new(),
        message_request: Some(MessageRequest::ListServices(String::new())),
    };

    let mut stream = client
        .server_reflection_info(futures::stream::iter(vec![request]))
        .await?
        .into_inner();

    let Some(response) = stream.message().await? else {
        return Ok(Vec::new());
    };
    match response.message_response {
        Some(MessageResponse::ListServicesResponse(list)) => {
            Ok(list.service.into_iter().map(|s| s.name).collect())
        }
        _ => Ok(Vec::new()),
    }
}
