//! Agent base telemetry and device-pushed agent config
//!
//! The agent root carries its own state next to the per-service entries:
//! the configured name, the node it runs on, and pod counts refreshed on an
//! interval. Committed config transactions for the root update the name or,
//! when the root config is deleted, remove the root telemetry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::batcher::{ConfigHandler, ConfigTransactionEntry};
use super::watchers::ClusterLookup;
use crate::device::{ConfigOperation, TelemetryClient};
use crate::error::{Error, Result};
use crate::model::Leaf;

#[cfg(feature = "metrics")]
use super::metrics;

/// State published at the agent root
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentState {
    pub name: Leaf<String>,
    pub node_name: Leaf<String>,
    pub cluster_pods: Leaf<u32>,
    pub local_pods: Leaf<u32>,
    /// Free-form response leaf; nothing the agent does sets it
    pub response: Leaf<String>,
}

/// Agent config pushed by the device; unknown leaves are ignored
#[derive(Debug, Default, Deserialize)]
struct AgentConfigDocument {
    #[serde(default)]
    name: Option<Leaf<String>>,
}

/// Owns [`AgentState`] and republishes it on every change
pub struct AgentStatePublisher {
    root: String,
    telemetry: TelemetryClient,
    state: Mutex<AgentState>,
}

impl AgentStatePublisher {
    pub fn new(root: impl Into<String>, telemetry: TelemetryClient, node_name: &str) -> Self {
        Self {
            root: root.into(),
            telemetry,
            state: Mutex::new(AgentState {
                node_name: node_name.to_string().into(),
                ..Default::default()
            }),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub async fn state(&self) -> AgentState {
        self.state.lock().await.clone()
    }

    pub async fn publish(&self) -> Result<()> {
        let state = self.state().await;
        self.telemetry.publish(&self.root, &state).await
    }

    pub async fn set_name(&self, name: &str) -> Result<()> {
        self.state.lock().await.name = name.to_string().into();
        self.publish().await
    }

    pub async fn set_pods(&self, cluster: u32, local: u32) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            state.cluster_pods = cluster.into();
            state.local_pods = local.into();
        }
        #[cfg(feature = "metrics")]
        metrics::set_pod_counts(cluster, local);
        self.publish().await
    }

    /// Remove the whole root subtree from telemetry
    pub async fn delete(&self) -> Result<()> {
        self.telemetry.delete(&self.root).await
    }
}

/// Applies committed config entries for the agent root
pub struct AgentConfigHandler {
    publisher: Arc<AgentStatePublisher>,
}

impl AgentConfigHandler {
    pub fn new(publisher: Arc<AgentStatePublisher>) -> Self {
        Self { publisher }
    }
}

#[async_trait]
impl ConfigHandler for AgentConfigHandler {
    async fn handle(&self, entry: &ConfigTransactionEntry) -> Result<()> {
        if entry.path != self.publisher.root() {
            debug!("Ignoring config for {}", entry.path);
            return Ok(());
        }

        let Some(payload) = entry.payload.as_deref() else {
            if entry.op == ConfigOperation::Delete {
                info!("Agent config deleted, removing {}", entry.path);
                return self.publisher.delete().await;
            }
            debug!("No data in {} for {}", entry.op, entry.path);
            return Ok(());
        };

        let document: AgentConfigDocument = serde_json::from_str(payload)
            .map_err(|e| Error::DecodeError(format!("agent config {}: {}", entry.path, e)))?;

        match document.name {
            Some(name) => {
                info!("Agent name set to {}", name.value);
                self.publisher.set_name(&name.value).await
            }
            None => Ok(()),
        }
    }
}

/// Count pods and publish the result once
pub async fn refresh_pod_counts(
    lookup: &dyn ClusterLookup,
    publisher: &AgentStatePublisher,
    node_name: Option<&str>,
) -> Result<()> {
    let cluster = lookup.count_pods(None).await?;
    let local = match node_name {
        Some(node) => lookup.count_pods(Some(node)).await?,
        None => 0,
    };
    debug!("Pods: {} in cluster, {} local", cluster, local);
    publisher.set_pods(cluster, local).await
}

/// Refresh pod counts every `interval` until a fatal error
pub async fn run_pod_counter(
    lookup: Arc<dyn ClusterLookup>,
    publisher: Arc<AgentStatePublisher>,
    node_name: Option<String>,
    interval: Duration,
) -> Result<()> {
    info!("Starting pod counter every {:?}", interval);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if let Err(e) = refresh_pod_counts(lookup.as_ref(), &publisher, node_name.as_deref()).await
        {
            if e.is_fatal() {
                return Err(e);
            }
            warn!("Failed to refresh pod counts: {:?}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{TelemetryResponse, TelemetryStore};
    use k8s_openapi::api::core::v1::Endpoints;
    use serde_json::{json, Value};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Store {
        published: StdMutex<Vec<(String, Value)>>,
        deleted: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl TelemetryStore for Store {
        async fn add_or_update(&self, path: &str, json: &str) -> Result<TelemetryResponse> {
            self.published
                .lock()
                .unwrap()
                .push((path.to_string(), serde_json::from_str(json).unwrap()));
            Ok(TelemetryResponse::success())
        }

        async fn delete(&self, path: &str) -> Result<TelemetryResponse> {
            self.deleted.lock().unwrap().push(path.to_string());
            Ok(TelemetryResponse::success())
        }
    }

    struct Pods;

    #[async_trait]
    impl ClusterLookup for Pods {
        async fn node_internal_ip(&self, _node: &str) -> Result<Option<String>> {
            Ok(None)
        }

        async fn service_external_address(&self, _ns: &str, _name: &str) -> Result<Option<String>> {
            Ok(None)
        }

        async fn endpoints(&self, _ns: &str, _name: &str) -> Result<Option<Endpoints>> {
            Ok(None)
        }

        async fn count_pods(&self, node: Option<&str>) -> Result<u32> {
            match node {
                None => Ok(12),
                Some("node-a") => Ok(4),
                Some(other) => Err(Error::ConfigError(format!("unknown node {}", other))),
            }
        }
    }

    fn setup() -> (Arc<Store>, Arc<AgentStatePublisher>) {
        let store = Arc::new(Store::default());
        let publisher = Arc::new(AgentStatePublisher::new(
            ".kbutler",
            TelemetryClient::new(store.clone()),
            "node-a",
        ));
        (store, publisher)
    }

    fn entry(op: ConfigOperation, path: &str, payload: Option<&str>) -> ConfigTransactionEntry {
        ConfigTransactionEntry {
            op,
            path: path.to_string(),
            keys: vec![],
            payload: payload.map(String::from),
        }
    }

    #[tokio::test]
    async fn test_state_encoding() {
        let (store, publisher) = setup();
        publisher.publish().await.unwrap();

        let published = store.published.lock().unwrap();
        assert_eq!(
            published[0],
            (
                ".kbutler".to_string(),
                json!({
                    "name": {"value": ""},
                    "node_name": {"value": "node-a"},
                    "cluster_pods": {"value": 0},
                    "local_pods": {"value": 0},
                    "response": {"value": ""}
                })
            )
        );
    }

    #[tokio::test]
    async fn test_config_name_is_reflected() {
        let (store, publisher) = setup();
        let handler = AgentConfigHandler::new(publisher.clone());

        handler
            .handle(&entry(
                ConfigOperation::Update,
                ".kbutler",
                Some(r#"{"name": {"value": "edge-1"}, "cpu_min": {"value": 1}}"#),
            ))
            .await
            .unwrap();

        assert_eq!(publisher.state().await.name.value, "edge-1");
        assert_eq!(store.published.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_without_payload_removes_root() {
        let (store, publisher) = setup();
        let handler = AgentConfigHandler::new(publisher);

        handler
            .handle(&entry(ConfigOperation::Delete, ".kbutler", None))
            .await
            .unwrap();
        assert_eq!(*store.deleted.lock().unwrap(), vec![".kbutler".to_string()]);

        // a payload-less update does nothing
        handler
            .handle(&entry(ConfigOperation::Update, ".kbutler", None))
            .await
            .unwrap();
        assert_eq!(store.deleted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_bad_payload_is_non_fatal_decode_error() {
        let (store, publisher) = setup();
        let handler = AgentConfigHandler::new(publisher);

        let err = handler
            .handle(&entry(ConfigOperation::Create, ".kbutler", Some("{not json")))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DecodeError(_)));
        assert!(!err.is_fatal());
        assert!(store.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_other_paths_are_ignored() {
        let (store, publisher) = setup();
        let handler = AgentConfigHandler::new(publisher);

        handler
            .handle(&entry(ConfigOperation::Delete, ".kbutler.config-node", None))
            .await
            .unwrap();
        assert!(store.deleted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_pod_counts() {
        let (store, publisher) = setup();

        refresh_pod_counts(&Pods, &publisher, Some("node-a")).await.unwrap();
        let state = publisher.state().await;
        assert_eq!(state.cluster_pods.value, 12);
        assert_eq!(state.local_pods.value, 4);

        refresh_pod_counts(&Pods, &publisher, None).await.unwrap();
        assert_eq!(publisher.state().await.local_pods.value, 0);

        assert!(refresh_pod_counts(&Pods, &publisher, Some("node-z")).await.is_err());
        assert_eq!(store.published.lock().unwrap().len(), 2);
    }
}
