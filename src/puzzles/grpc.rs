//! # gRPC puzzle: a tonic server on the gRPC sub-listener.
//!
//! The puzzle claims the gRPC sub-listener during `before` (freezing
//! its matcher before the muxer serves), assembles the configured
//! [`Routes`], registers reflection, publishes the `WaitGrpc` readiness
//! latch, and serves until cancellation.
//!
//! Service registration stays generic: callers configure the routes
//! with their generated tonic services.
//!
//! ```no_run
//! use std::sync::Arc;
//! use corevisor::puzzles::grpc::GrpcPuzzle;
//! use corevisor::Options;
//!
//! # fn configure(opts: &mut Options) {
//! let grpc = GrpcPuzzle::new();
//! grpc.configure(|routes| {
//!     // routes.add_service(GreeterServer::new(MyGreeter))
//!     routes
//! });
//! opts.register_puzzle(Arc::new(grpc));
//! # }
//! ```

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tonic::service::Routes;
use tonic::transport::Server;

use crate::error::MountError;
use crate::options::Options;
use crate::puzzle::Puzzle;
use crate::ready::Ready;

type RouteInstaller = Box<dyn FnOnce(Routes) -> Routes + Send>;

/// The gRPC server puzzle.
pub struct GrpcPuzzle {
    installers: Mutex<Vec<RouteInstaller>>,
    descriptors: Mutex<Vec<&'static [u8]>>,
    ready: Ready,
}

impl GrpcPuzzle {
    /// An empty gRPC puzzle; add services with
    /// [`configure`](GrpcPuzzle::configure).
    pub fn new() -> Self {
        Self {
            installers: Mutex::new(Vec::new()),
            descriptors: Mutex::new(Vec::new()),
            ready: Ready::new("grpc"),
        }
    }

    /// Queues a routes transformation, typically
    /// `|routes| routes.add_service(MyServer::new(svc))`. Installers
    /// run in registration order when the puzzle starts.
    pub fn configure(&self, install: impl FnOnce(Routes) -> Routes + Send + 'static) {
        self.installers
            .lock()
            .expect("grpc installers lock")
            .push(Box::new(install));
    }

    /// Registers an encoded file descriptor set with the reflection
    /// service, so reflection-driven clients can explore the schema.
    pub fn add_file_descriptor_set(&self, descriptor_set: &'static [u8]) {
        self.descriptors
            .lock()
            .expect("grpc descriptors lock")
            .push(descriptor_set);
    }
}

impl Default for GrpcPuzzle {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Puzzle for GrpcPuzzle {
    fn name(&self) -> &str {
        "grpc"
    }

    async fn before(&self, opts: &mut Options) -> Result<(), MountError> {
        opts.tag("grpc");
        opts.wait_grpc = Some(self.ready.clone());
        // Claim the sub-listener now so the gRPC matcher is registered
        // ahead of the HTTP catch-all.
        let _ = opts.grpc_listener();
        Ok(())
    }

    async fn start(&self, ctx: CancellationToken, opts: Arc<Options>) -> Result<(), MountError> {
        let Some(sub) = opts.grpc_listener() else {
            return Err(MountError::failed(
                "grpc puzzle requires a listener; start the core with start(), not run()",
            ));
        };

        let mut routes = Routes::default();
        for install in self
            .installers
            .lock()
            .expect("grpc installers lock")
            .drain(..)
        {
            routes = install(routes);
        }

        let mut reflection = tonic_reflection::server::Builder::configure();
        for descriptor_set in self
            .descriptors
            .lock()
            .expect("grpc descriptors lock")
            .iter()
        {
            reflection = reflection.register_encoded_file_descriptor_set(descriptor_set);
        }
        let reflection = reflection
            .build_v1()
            .map_err(MountError::failed)?;

        let incoming = sub.incoming();
        self.ready.signal();
        tracing::debug!("grpc server serving on the grpc sub-listener");

        Server::builder()
            .add_routes(routes)
            .add_service(reflection)
            .serve_with_incoming_shutdown(incoming, ctx.cancelled_owned())
            .await
            .map_err(MountError::failed)
    }

    async fn stop(&self) -> Result<(), MountError> {
        tracing::debug!("grpc puzzle stopped");
        Ok(())
    }
}
