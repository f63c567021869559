//! Previously published endpoints, and cleanup of the ones that went away

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, warn};

use crate::device::{paths, TelemetryClient};
use crate::model::{EndpointIdentity, ServiceIdentity};

/// Result of one cleanup pass for a service
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Stale endpoints whose delete was accepted
    pub deleted: Vec<EndpointIdentity>,
    /// Stale endpoints whose delete failed; they are forgotten regardless
    pub failed: Vec<EndpointIdentity>,
}

impl GcReport {
    pub fn attempted(&self) -> usize {
        self.deleted.len() + self.failed.len()
    }
}

/// Tracks, per service, the endpoint identities published by the last pass
#[derive(Debug, Default)]
pub struct ServiceEndpointSet {
    services: HashMap<ServiceIdentity, BTreeSet<EndpointIdentity>>,
}

impl ServiceEndpointSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, service: &ServiceIdentity) -> Option<&BTreeSet<EndpointIdentity>> {
        self.services.get(service)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Recorded endpoints of `service` that are not in `new_set`
    pub fn stale(
        &self,
        service: &ServiceIdentity,
        new_set: &BTreeSet<EndpointIdentity>,
    ) -> Vec<EndpointIdentity> {
        self.services
            .get(service)
            .map(|old| old.difference(new_set).cloned().collect())
            .unwrap_or_default()
    }

    /// Delete the paths of stale endpoints, then record `new_set`.
    ///
    /// A failed delete is logged and does not stop the remaining deletes.
    /// The recorded set is replaced even when some deletes failed.
    pub async fn reconcile(
        &mut self,
        telemetry: &TelemetryClient,
        root: &str,
        service: &ServiceIdentity,
        new_set: BTreeSet<EndpointIdentity>,
    ) -> GcReport {
        let mut report = GcReport::default();

        for endpoint in self.stale(service, &new_set) {
            let path = paths::endpoint_path(root, service, &endpoint);
            match telemetry.delete(&path).await {
                Ok(()) => {
                    debug!("Deleted stale endpoint {} of {}", endpoint, service);
                    report.deleted.push(endpoint);
                }
                Err(e) => {
                    warn!("Failed to delete stale endpoint {} of {}: {:?}", endpoint, service, e);
                    report.failed.push(endpoint);
                }
            }
        }

        self.services.insert(service.clone(), new_set);
        report
    }

    /// Drop everything recorded for `service`
    pub fn forget(&mut self, service: &ServiceIdentity) -> Option<BTreeSet<EndpointIdentity>> {
        self.services.remove(service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{TelemetryResponse, TelemetryStore};
    use crate::error::{Error, Result};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct DeleteLog {
        deletes: Mutex<Vec<String>>,
        fail_path_containing: Option<String>,
    }

    #[async_trait]
    impl TelemetryStore for DeleteLog {
        async fn add_or_update(&self, _path: &str, _json: &str) -> Result<TelemetryResponse> {
            Ok(TelemetryResponse::success())
        }

        async fn delete(&self, path: &str) -> Result<TelemetryResponse> {
            self.deletes.lock().unwrap().push(path.to_string());
            match &self.fail_path_containing {
                Some(needle) if path.contains(needle.as_str()) => {
                    Err(Error::DeviceRpc("connection reset".to_string()))
                }
                _ => Ok(TelemetryResponse::success()),
            }
        }
    }

    fn set(hosts: &[&str]) -> BTreeSet<EndpointIdentity> {
        hosts
            .iter()
            .map(|h| EndpointIdentity::new("10.0.0.5", *h))
            .collect()
    }

    fn web() -> ServiceIdentity {
        ServiceIdentity::new("web", "default")
    }

    #[tokio::test]
    async fn test_first_pass_deletes_nothing() {
        let store = Arc::new(DeleteLog::default());
        let telemetry = TelemetryClient::new(store.clone());
        let mut sets = ServiceEndpointSet::new();

        let report = sets.reconcile(&telemetry, ".r", &web(), set(&["a", "b"])).await;

        assert_eq!(report.attempted(), 0);
        assert!(store.deletes.lock().unwrap().is_empty());
        assert_eq!(sets.get(&web()), Some(&set(&["a", "b"])));
    }

    #[tokio::test]
    async fn test_shrinking_set_deletes_difference() {
        let store = Arc::new(DeleteLog::default());
        let telemetry = TelemetryClient::new(store.clone());
        let mut sets = ServiceEndpointSet::new();

        sets.reconcile(&telemetry, ".r", &web(), set(&["a", "b", "c"])).await;
        let report = sets.reconcile(&telemetry, ".r", &web(), set(&["b"])).await;

        assert_eq!(
            report.deleted,
            vec![
                EndpointIdentity::new("10.0.0.5", "a"),
                EndpointIdentity::new("10.0.0.5", "c")
            ]
        );
        let deletes = store.deletes.lock().unwrap();
        assert_eq!(
            deletes[0],
            r#".r.service{.service_name=="web"&&.namespace=="default"}.external_address{.address=="10.0.0.5"&&.hostname=="a"}"#
        );
        assert_eq!(sets.get(&web()), Some(&set(&["b"])));
    }

    #[tokio::test]
    async fn test_unchanged_set_is_idempotent() {
        let store = Arc::new(DeleteLog::default());
        let telemetry = TelemetryClient::new(store.clone());
        let mut sets = ServiceEndpointSet::new();

        sets.reconcile(&telemetry, ".r", &web(), set(&["a", "b"])).await;
        let report = sets.reconcile(&telemetry, ".r", &web(), set(&["a", "b"])).await;

        assert_eq!(report, GcReport::default());
        assert!(store.deletes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_delete_does_not_block_others() {
        let store = Arc::new(DeleteLog {
            fail_path_containing: Some(r#"hostname=="a""#.to_string()),
            ..Default::default()
        });
        let telemetry = TelemetryClient::new(store.clone());
        let mut sets = ServiceEndpointSet::new();

        sets.reconcile(&telemetry, ".r", &web(), set(&["a", "b"])).await;
        let report = sets.reconcile(&telemetry, ".r", &web(), BTreeSet::new()).await;

        assert_eq!(report.failed, vec![EndpointIdentity::new("10.0.0.5", "a")]);
        assert_eq!(report.deleted, vec![EndpointIdentity::new("10.0.0.5", "b")]);
        assert_eq!(store.deletes.lock().unwrap().len(), 2);
        // replaced even though one delete failed
        assert_eq!(sets.get(&web()), Some(&BTreeSet::new()));
    }

    #[tokio::test]
    async fn test_services_are_tracked_independently() {
        let store = Arc::new(DeleteLog::default());
        let telemetry = TelemetryClient::new(store.clone());
        let mut sets = ServiceEndpointSet::new();
        let api = ServiceIdentity::new("api", "default");

        sets.reconcile(&telemetry, ".r", &web(), set(&["a"])).await;
        sets.reconcile(&telemetry, ".r", &api, set(&["b"])).await;
        let report = sets.reconcile(&telemetry, ".r", &api, set(&["c"])).await;

        assert_eq!(report.deleted, vec![EndpointIdentity::new("10.0.0.5", "b")]);
        assert_eq!(sets.get(&web()), Some(&set(&["a"])));
        assert_eq!(sets.len(), 2);

        assert_eq!(sets.forget(&web()), Some(set(&["a"])));
        assert!(sets.get(&web()).is_none());
    }
}
