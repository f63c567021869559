//! Service and Endpoints watch controllers
//!
//! Each watcher turns Kubernetes events into [`ReconcileRequest`]s for the
//! engine. Cross-object lookups (the service's ingress IP, the endpoints'
//! nodes) go through [`ClusterLookup`] so event handling can be tested
//! without an API server.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Endpoints, Node, Pod, Service};
use kube::api::{Api, ListParams};
use kube::runtime::{watcher, watcher::Event, WatchStreamExt};
use kube::{Client, ResourceExt};
use tracing::{debug, info, instrument, warn};

use super::reachability::{BackendAddress, ServicePass};
use super::reconciler::{ReconcileHandle, ReconcileRequest};
use crate::error::Result;
use crate::model::ServiceIdentity;

/// Cluster reads needed while handling watch events
#[async_trait]
pub trait ClusterLookup: Send + Sync {
    /// InternalIP of a node, `None` when the node has none
    async fn node_internal_ip(&self, node: &str) -> Result<Option<String>>;

    /// Load-balancer ingress IP of a service, `None` when it has none or is gone
    async fn service_external_address(&self, namespace: &str, name: &str)
        -> Result<Option<String>>;

    async fn endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>>;

    /// Pods cluster-wide, or on one node when `node` is set
    async fn count_pods(&self, node: Option<&str>) -> Result<u32>;
}

/// [`ClusterLookup`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeLookup {
    client: Client,
}

impl KubeLookup {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterLookup for KubeLookup {
    async fn node_internal_ip(&self, node: &str) -> Result<Option<String>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        Ok(nodes.get_opt(node).await?.as_ref().and_then(node_internal_ip))
    }

    async fn service_external_address(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<String>> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(services
            .get_opt(name)
            .await?
            .as_ref()
            .and_then(external_address))
    }

    async fn endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>> {
        let endpoints: Api<Endpoints> = Api::namespaced(self.client.clone(), namespace);
        Ok(endpoints.get_opt(name).await?)
    }

    async fn count_pods(&self, node: Option<&str>) -> Result<u32> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let params = match node {
            Some(node) => ListParams::default().fields(&format!("spec.nodeName={}", node)),
            None => ListParams::default(),
        };
        let list = pods.list(&params).await?;
        Ok(u32::try_from(list.items.len()).unwrap_or(u32::MAX))
    }
}

/// Load-balancer ingress IP of a service; the last one wins when there are several
pub fn external_address(service: &Service) -> Option<String> {
    service
        .status
        .as_ref()?
        .load_balancer
        .as_ref()?
        .ingress
        .as_ref()?
        .iter()
        .filter_map(|ingress| ingress.ip.as_deref())
        .filter(|ip| !ip.is_empty())
        .last()
        .map(String::from)
}

/// InternalIP address of a node; the last one wins when there are several
pub fn node_internal_ip(node: &Node) -> Option<String> {
    node.status
        .as_ref()?
        .addresses
        .as_ref()?
        .iter()
        .filter(|address| address.type_ == "InternalIP")
        .last()
        .map(|address| address.address.clone())
}

/// Every ready address of an endpoints object, resolving each node's InternalIP.
///
/// A failed node lookup leaves `node_address` empty; the endpoint is then
/// reported unreachable rather than dropped.
pub async fn resolve_backends(
    lookup: &dyn ClusterLookup,
    endpoints: &Endpoints,
) -> Vec<BackendAddress> {
    let addresses = endpoints
        .subsets
        .iter()
        .flatten()
        .flat_map(|subset| subset.addresses.iter().flatten());

    let mut backends = Vec::new();
    for address in addresses {
        let node_address = match address.node_name.as_deref() {
            None => {
                debug!(
                    "No node name for address {} of {}",
                    address.ip,
                    endpoints.name_any()
                );
                None
            }
            Some(node) => match lookup.node_internal_ip(node).await {
                Ok(Some(ip)) => Some(ip),
                Ok(None) => {
                    warn!("Node {} has no InternalIP", node);
                    None
                }
                Err(e) => {
                    warn!("Failed to look up node {}: {:?}", node, e);
                    None
                }
            },
        };
        backends.push(BackendAddress {
            ip: address.ip.clone(),
            node_name: address.node_name.clone(),
            node_address,
        });
    }
    backends
}

fn identity<K: ResourceExt>(object: &K) -> ServiceIdentity {
    ServiceIdentity::new(object.name_any(), object.namespace().unwrap_or_default())
}

/// Handle one Service event. Returns only errors from the request queue.
#[instrument(skip(lookup, handle, event))]
pub async fn handle_service_event(
    lookup: &dyn ClusterLookup,
    handle: &ReconcileHandle,
    event: Event<Service>,
) -> Result<()> {
    match event {
        Event::Apply(service) | Event::InitApply(service) => {
            let id = identity(&service);
            let Some(external_address) = external_address(&service) else {
                info!("Skipping service {}, no external IP", id);
                return Ok(());
            };
            info!("Service {} changed, external address {}", id, external_address);

            let backends = match lookup.endpoints(&id.namespace, &id.name).await {
                Ok(Some(endpoints)) => resolve_backends(lookup, &endpoints).await,
                Ok(None) => Vec::new(),
                Err(e) => {
                    warn!("Failed to fetch endpoints of {}: {:?}", id, e);
                    return Ok(());
                }
            };

            handle
                .submit(ReconcileRequest::Pass(ServicePass {
                    service: id,
                    external_address: Some(external_address),
                    backends,
                }))
                .await
        }
        Event::Delete(service) => {
            let id = identity(&service);
            info!("Service {} deleted", id);
            handle.submit(ReconcileRequest::Remove(id)).await
        }
        Event::Init | Event::InitDone => {
            debug!("Service watcher (re)listing");
            Ok(())
        }
    }
}

/// Handle one Endpoints event. Returns only errors from the request queue.
#[instrument(skip(lookup, handle, event))]
pub async fn handle_endpoints_event(
    lookup: &dyn ClusterLookup,
    handle: &ReconcileHandle,
    event: Event<Endpoints>,
) -> Result<()> {
    let (endpoints, deleted) = match event {
        Event::Apply(endpoints) | Event::InitApply(endpoints) => (endpoints, false),
        Event::Delete(endpoints) => (endpoints, true),
        Event::Init | Event::InitDone => {
            debug!("Endpoints watcher (re)listing");
            return Ok(());
        }
    };

    let id = identity(&endpoints);
    let external_address = match lookup
        .service_external_address(&id.namespace, &id.name)
        .await
    {
        Ok(Some(address)) => address,
        Ok(None) => {
            debug!("Skipping endpoints {}, service has no external IP", id);
            return Ok(());
        }
        Err(e) => {
            warn!("Failed to fetch service {}: {:?}", id, e);
            return Ok(());
        }
    };

    let backends = if deleted {
        info!("Endpoints {} deleted", id);
        Vec::new()
    } else {
        info!("Endpoints {} changed", id);
        resolve_backends(lookup, &endpoints).await
    };

    handle
        .submit(ReconcileRequest::Pass(ServicePass {
            service: id,
            external_address: Some(external_address),
            backends,
        }))
        .await
}

/// Watch Services cluster-wide until the stream ends or the engine stops
pub async fn run_service_watcher(
    client: Client,
    lookup: Arc<dyn ClusterLookup>,
    handle: ReconcileHandle,
) -> Result<()> {
    let services: Api<Service> = Api::all(client);
    info!("Starting Service watcher");

    let mut stream = watcher(services, watcher::Config::default())
        .default_backoff()
        .boxed();

    while let Some(event) = stream.next().await {
        match event {
            Ok(event) => handle_service_event(lookup.as_ref(), &handle, event).await?,
            Err(e) => warn!("Service watch error, will retry: {}", e),
        }
    }
    Ok(())
}

/// Watch Endpoints cluster-wide until the stream ends or the engine stops
pub async fn run_endpoints_watcher(
    client: Client,
    lookup: Arc<dyn ClusterLookup>,
    handle: ReconcileHandle,
) -> Result<()> {
    let endpoints: Api<Endpoints> = Api::all(client);
    info!("Starting Endpoints watcher");

    let mut stream = watcher(endpoints, watcher::Config::default())
        .default_backoff()
        .boxed();

    while let Some(event) = stream.next().await {
        match event {
            Ok(event) => handle_endpoints_event(lookup.as_ref(), &handle, event).await?,
            Err(e) => warn!("Endpoints watch error, will retry: {}", e),
        }
    }
    Ok(())
}
