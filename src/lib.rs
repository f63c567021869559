//! service-reach-agent: node-resident agent that reports Kubernetes service
//! reachability from a network device's forwarding state.
//!
//! The agent watches Services and Endpoints, cross-references each service's
//! external address with the device's route table, next-hop groups and next
//! hops, and publishes per-endpoint and per-service operational state to the
//! device's telemetry tree.

pub mod agent;
pub mod config;
pub mod controller;
pub mod device;
pub mod error;
pub mod model;
pub mod observability;
pub mod retry;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::agent::Agent;
pub use crate::config::AgentConfig;
pub use crate::error::{Error, Result};
