//! # The core runtime: facade, assembly, and graceful teardown.
//!
//! - **service.rs**: [`CoreService`] facade, serve assembly, the before
//!   pass, built-in HTTP / muxer mounts.
//! - **graceful.rs**: the graceful-kill daemon mount and the puzzle
//!   stop sequence.

pub(crate) mod graceful;
mod service;

pub use service::{CoreService, ListenAddr};
