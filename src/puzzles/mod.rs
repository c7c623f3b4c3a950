//! # Built-in puzzles.
//!
//! Opt-in subsystems that compose into the core through the standard
//! puzzle lifecycle:
//!
//! - [`http`]     mount caller routes (plus `/health`) on the HTTP surface
//! - [`pprof`]    process debug endpoints under `/debug/pprof/`
//! - [`grpc`]     tonic server with reflection on the gRPC sub-listener
//! - [`grpc_ui`]  reflection explorer under `/debug/grpc/ui/`
//! - [`discover`] announce / withdraw the service in a registry

pub mod discover;
pub mod grpc;
pub mod grpc_ui;
pub mod http;
pub mod pprof;

pub use discover::{DiscoverPuzzle, ManualRegistry, ServiceEntry, ServiceRegistry};
pub use grpc::GrpcPuzzle;
pub use grpc_ui::GrpcUiPuzzle;
pub use http::HttpPuzzle;
pub use pprof::PprofPuzzle;
