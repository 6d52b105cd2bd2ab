//! REST API module for probes and observability
//!
//! Serves liveness and metrics endpoints plus a read-only view of managed
//! resources.

mod dto;
mod handlers;
mod server;

pub use server::{build_router, run_server};
