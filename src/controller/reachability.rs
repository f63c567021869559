//! Service reachability evaluation
//!
//! Cross-references a service's external address and backend nodes with a
//! route-table [`Snapshot`]:
//!
//! 1. find the host route `<external address>/32` (no other prefix matches)
//! 2. if it is FIB-programmed, resolve its next-hop group to next-hop IPs
//! 3. an endpoint is up when its node's internal IP is one of those next hops
//! 4. the service state is derived from the route status and endpoint states
//!
//! Everything here is pure; publishing and cleanup live in the reconciler.

use std::collections::{BTreeMap, BTreeSet};

use crate::device::Snapshot;
use crate::model::{
    EndpointIdentity, EndpointState, ServiceIdentity, ServiceOperState, ServiceReason,
    ServiceState,
};

/// One backend address of a service, with its node already resolved
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendAddress {
    /// Pod IP from the endpoints subset
    pub ip: String,
    /// Node the pod runs on, when the endpoints object names one
    pub node_name: Option<String>,
    /// Internal IP of that node; `None` when the lookup failed
    pub node_address: Option<String>,
}

/// Everything needed for one reconciliation pass of a service
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServicePass {
    pub service: ServiceIdentity,
    /// Load-balancer ingress IP; a service without one is never evaluated
    pub external_address: Option<String>,
    pub backends: Vec<BackendAddress>,
}

/// State of the external address's host route in a snapshot
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExternalRoute {
    /// The route table could not be read this pass
    Unknown,
    /// No `<addr>/32` route
    Missing,
    /// Route present but not yet in the FIB
    NotProgrammed,
    /// Route in the FIB, with the IPs of its next hops
    Programmed { next_hops: Vec<String> },
}

impl ExternalRoute {
    pub fn is_matched(&self) -> bool {
        matches!(
            self,
            ExternalRoute::NotProgrammed | ExternalRoute::Programmed { .. }
        )
    }

    pub fn is_programmed(&self) -> bool {
        matches!(self, ExternalRoute::Programmed { .. })
    }
}

/// Look up the host route for `external_address`
pub fn lookup_external_route(snapshot: &Snapshot, external_address: &str) -> ExternalRoute {
    match snapshot.host_route(external_address) {
        None => ExternalRoute::Missing,
        Some(route) if !route.is_programmed() => ExternalRoute::NotProgrammed,
        Some(route) => ExternalRoute::Programmed {
            next_hops: snapshot
                .next_hop_addresses(route)
                .into_iter()
                .map(String::from)
                .collect(),
        },
    }
}

/// State of one endpoint, or `None` when nothing should be published for it.
///
/// Without a usable external route there is no endpoint detail to report.
/// A failed route-table read marks the endpoint unreachable.
pub fn evaluate_endpoint(route: &ExternalRoute, node_address: Option<&str>) -> Option<EndpointState> {
    let host = node_address.unwrap_or_default();
    match route {
        ExternalRoute::Missing | ExternalRoute::NotProgrammed => None,
        ExternalRoute::Unknown => Some(EndpointState::no_route_to_host(host)),
        ExternalRoute::Programmed { next_hops } => match node_address {
            Some(addr) if next_hops.iter().any(|nh| nh == addr) => Some(EndpointState::up(addr)),
            _ => Some(EndpointState::no_route_to_host(host)),
        },
    }
}

/// Aggregate service state for a pass.
///
/// | route                     | endpoints          | state    | reason                            |
/// |---------------------------|--------------------|----------|-----------------------------------|
/// | missing or unreadable     | any                | down     | `external-address-no-route`       |
/// | present, not programmed   | any                | down     | `external-address-not-programmed` |
/// | programmed                | at least one down  | degraded | `endpoint-nexthop-missing`        |
/// | programmed                | all up (or none)   | up       |                                   |
pub fn aggregate_service_state<'a, I>(route: &ExternalRoute, endpoints: I) -> ServiceState
where
    I: IntoIterator<Item = &'a EndpointState>,
{
    match route {
        ExternalRoute::Unknown | ExternalRoute::Missing => ServiceState::new(
            ServiceOperState::Down,
            Some(ServiceReason::ExternalAddressNoRoute),
        ),
        ExternalRoute::NotProgrammed => ServiceState::new(
            ServiceOperState::Down,
            Some(ServiceReason::ExternalAddressNotProgrammed),
        ),
        ExternalRoute::Programmed { .. } => {
            if endpoints.into_iter().all(EndpointState::is_up) {
                ServiceState::new(ServiceOperState::Up, None)
            } else {
                ServiceState::new(
                    ServiceOperState::Degraded,
                    Some(ServiceReason::EndpointNexthopMissing),
                )
            }
        }
    }
}

/// Computed result of a pass, before anything is published
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PassOutcome {
    /// Every endpoint identity seen this pass, published or not
    pub identities: BTreeMap<EndpointIdentity, Option<EndpointState>>,
    pub service: ServiceState,
}

impl PassOutcome {
    /// Endpoint states to publish, in identity order
    pub fn published(&self) -> impl Iterator<Item = (&EndpointIdentity, &EndpointState)> {
        self.identities
            .iter()
            .filter_map(|(id, state)| state.as_ref().map(|s| (id, s)))
    }

    /// Identities that get an endpoint state this pass.
    ///
    /// This is the set recorded for cleanup: an identity without a state
    /// must not keep its earlier entry on the device.
    pub fn published_identities(&self) -> BTreeSet<EndpointIdentity> {
        self.published().map(|(id, _)| id.clone()).collect()
    }
}

/// Evaluate every backend of a service against the route state.
///
/// Backends without a node name are skipped; backends sharing a node
/// collapse into one endpoint identity.
pub fn compute_pass(
    external_address: &str,
    backends: &[BackendAddress],
    route: &ExternalRoute,
) -> PassOutcome {
    let mut identities = BTreeMap::new();

    for backend in backends {
        let Some(node_name) = backend.node_name.as_deref() else {
            continue;
        };
        let identity = EndpointIdentity::new(external_address, node_name);
        identities
            .entry(identity)
            .or_insert_with(|| evaluate_endpoint(route, backend.node_address.as_deref()));
    }

    let service = aggregate_service_state(route, identities.values().flatten());
    PassOutcome {
        identities,
        service,
    }
}
