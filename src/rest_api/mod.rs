//! REST API module
//!
//! Serves liveness, Prometheus metrics and the agent's own base state.

mod handlers;
mod server;

pub use handlers::HealthResponse;
pub use server::{router, run_server, ApiState};
