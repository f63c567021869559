//! Controller module for service reachability
//! This module contains the reconcile engine, the Kubernetes watchers feeding
//! it, and the device notification path that applies pushed config.

pub mod agent_state;
pub mod batcher;
pub mod endpoint_set;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod reachability;
pub mod receiver;
mod reconciler;
#[cfg(test)]
mod reconciler_test;
pub mod watchers;

pub use agent_state::{run_pod_counter, AgentConfigHandler, AgentState, AgentStatePublisher};
pub use batcher::{
    ConfigDispatcher, ConfigHandler, ConfigTransactionEntry, TransactionBatcher, COMMIT_END_PATH,
};
pub use endpoint_set::{GcReport, ServiceEndpointSet};
pub use reachability::{BackendAddress, ExternalRoute, PassOutcome, ServicePass};
pub use receiver::{establish_session, NotificationReceiver, ReceiverState, SessionIds};
pub use reconciler::{PassReport, ReconcileEngine, ReconcileHandle, ReconcileRequest};
pub use watchers::{run_endpoints_watcher, run_service_watcher, ClusterLookup, KubeLookup};
