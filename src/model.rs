//! Shared types for published service reachability state
//!
//! - [`ServiceIdentity`] / [`EndpointIdentity`] - keys of the telemetry list entries
//! - [`EndpointState`] - per (service, backend node) operational state
//! - [`ServiceState`] - aggregate state derived from the endpoint states
//!
//! The published JSON follows the device's value-leaf encoding, where every
//! leaf is wrapped as `{"value": ...}`.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Key of a Kubernetes Service the agent publishes state for
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceIdentity {
    pub name: String,
    pub namespace: String,
}

impl ServiceIdentity {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

impl fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Key of one (external address, backend node) pairing of a service
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointIdentity {
    pub external_address: String,
    pub hostname: String,
}

impl EndpointIdentity {
    pub fn new(external_address: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            external_address: external_address.into(),
            hostname: hostname.into(),
        }
    }
}

impl fmt::Display for EndpointIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.external_address, self.hostname)
    }
}

/// Leaf wrapper used by the device's JSON encoding
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leaf<T> {
    pub value: T,
}

impl<T> From<T> for Leaf<T> {
    fn from(value: T) -> Self {
        Leaf { value }
    }
}

/// Endpoint operational state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointOperState {
    Up,
    Down,
}

/// Service operational state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceOperState {
    Up,
    Degraded,
    Down,
}

impl fmt::Display for ServiceOperState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceOperState::Up => write!(f, "up"),
            ServiceOperState::Degraded => write!(f, "degraded"),
            ServiceOperState::Down => write!(f, "down"),
        }
    }
}

/// Why an endpoint is not up
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndpointReason {
    NoRouteToHost,
}

/// Why a service is not up
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceReason {
    EndpointNexthopMissing,
    ExternalAddressNotProgrammed,
    ExternalAddressNoRoute,
}

impl fmt::Display for ServiceReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceReason::EndpointNexthopMissing => write!(f, "endpoint-nexthop-missing"),
            ServiceReason::ExternalAddressNotProgrammed => {
                write!(f, "external-address-not-programmed")
            }
            ServiceReason::ExternalAddressNoRoute => write!(f, "external-address-no-route"),
        }
    }
}

/// Published state of one endpoint
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointState {
    pub oper_state: Leaf<EndpointOperState>,
    #[serde(default, with = "reason_leaf")]
    pub oper_reason: Option<Leaf<EndpointReason>>,
    pub fib_programmed: Leaf<bool>,
    pub host_address: Leaf<String>,
}

impl EndpointState {
    pub fn up(host_address: impl Into<String>) -> Self {
        Self {
            oper_state: EndpointOperState::Up.into(),
            oper_reason: None,
            fib_programmed: true.into(),
            host_address: Leaf::from(host_address.into()),
        }
    }

    pub fn no_route_to_host(host_address: impl Into<String>) -> Self {
        Self {
            oper_state: EndpointOperState::Down.into(),
            oper_reason: Some(EndpointReason::NoRouteToHost.into()),
            fib_programmed: false.into(),
            host_address: Leaf::from(host_address.into()),
        }
    }

    pub fn is_up(&self) -> bool {
        self.oper_state.value == EndpointOperState::Up
    }
}

/// Published aggregate state of one service
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceState {
    pub oper_state: Leaf<ServiceOperState>,
    #[serde(default, with = "reason_leaf")]
    pub oper_reason: Option<Leaf<ServiceReason>>,
}

impl ServiceState {
    pub fn new(state: ServiceOperState, reason: Option<ServiceReason>) -> Self {
        Self {
            oper_state: state.into(),
            oper_reason: reason.map(Leaf::from),
        }
    }

    pub fn state(&self) -> ServiceOperState {
        self.oper_state.value
    }

    pub fn reason(&self) -> Option<ServiceReason> {
        self.oper_reason.as_ref().map(|r| r.value)
    }
}

// A reason leaf is always present; no reason is encoded as an empty string
// so a merge on the device clears the previous one.
mod reason_leaf {
    use super::*;

    pub fn serialize<S, R>(reason: &Option<Leaf<R>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        R: Serialize,
    {
        match reason {
            Some(leaf) => leaf.serialize(serializer),
            None => Leaf { value: "" }.serialize(serializer),
        }
    }

    pub fn deserialize<'de, D, R>(deserializer: D) -> Result<Option<Leaf<R>>, D::Error>
    where
        D: Deserializer<'de>,
        R: DeserializeOwned,
    {
        match Option::<Leaf<serde_json::Value>>::deserialize(deserializer)? {
            None => Ok(None),
            Some(leaf) if leaf.value.as_str() == Some("") => Ok(None),
            Some(leaf) => serde_json::from_value(leaf.value)
                .map(|value| Some(Leaf { value }))
                .map_err(serde::de::Error::custom),
        }
    }
}
