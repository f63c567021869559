//! Device-side capabilities the agent depends on
//!
//! The agent talks to the network device through three narrow seams:
//! - [`DeviceSession`] - agent registration and the config notification stream
//! - [`TelemetryStore`] - publish/delete JSON state at a telemetry path
//! - [`RouteTableSource`] - point-in-time reads of a network instance's route table
//!
//! [`JsonRpcDevice`] implements all three over the device's JSON-RPC
//! endpoint. Everything above this module only sees the traits, so the
//! reconciler and batcher run against in-memory fakes in tests.

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub mod jsonrpc;
pub mod paths;
pub mod route_table;
pub mod telemetry;

pub use jsonrpc::JsonRpcDevice;
pub use route_table::{NextHop, NextHopGroup, Route, RouteTableReader, Snapshot};
pub use telemetry::TelemetryClient;

/// Operation carried by a config notification
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfigOperation {
    #[serde(alias = "create", alias = "CREATE")]
    Create,
    #[serde(alias = "update", alias = "CHANGE", alias = "change")]
    Update,
    #[serde(alias = "delete", alias = "DELETE")]
    Delete,
}

impl fmt::Display for ConfigOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigOperation::Create => write!(f, "Create"),
            ConfigOperation::Update => write!(f, "Update"),
            ConfigOperation::Delete => write!(f, "Delete"),
        }
    }
}

/// A single configuration change pushed by the device
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigEvent {
    pub op: ConfigOperation,
    /// JSON path of the changed node, e.g. `.kbutler` or `.commit.end`
    pub path: String,
    /// List keys of the changed node, outermost first
    pub keys: Vec<String>,
    /// JSON document of the new node contents; absent on deletes
    pub payload: Option<String>,
}

/// One item of a notification stream message
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    Config(ConfigEvent),
    /// Any subscription type the agent does not act on, named by its kind
    Unhandled(String),
}

/// A message from the notification stream, already split into items
pub type NotificationBatch = Vec<Notification>;

/// Live notification stream. Ends with `None` on a clean end-of-stream.
pub type NotificationStream = BoxStream<'static, Result<NotificationBatch>>;

/// Outcome the device reports for a telemetry call
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryResponse {
    pub status: String,
    #[serde(default, rename = "error_str")]
    pub error_str: String,
}

impl TelemetryResponse {
    pub fn success() -> Self {
        Self {
            status: "success".to_string(),
            error_str: String::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.eq_ignore_ascii_case("success") || self.status == "kSdkMgrSuccess"
    }
}

/// Registration and notification stream handling
#[async_trait]
pub trait DeviceSession: Send + Sync {
    /// Register the agent with the device manager, returning its app id
    async fn register_agent(&self) -> Result<u32>;

    /// Create a notification stream and subscribe it to config changes
    async fn create_config_stream(&self) -> Result<u64>;

    /// Open the previously created stream for reading
    async fn open_stream(&self, stream_id: u64) -> Result<NotificationStream>;
}

/// Path-addressed state store on the device
#[async_trait]
pub trait TelemetryStore: Send + Sync {
    async fn add_or_update(&self, path: &str, json: &str) -> Result<TelemetryResponse>;

    async fn delete(&self, path: &str) -> Result<TelemetryResponse>;
}

/// Raw read access to a network instance's routing state
#[async_trait]
pub trait RouteTableSource: Send + Sync {
    async fn get_route_table(&self, network_instance: &str) -> Result<serde_json::Value>;
}
