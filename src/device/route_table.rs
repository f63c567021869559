//! Route-table snapshots
//!
//! A [`Snapshot`] is a flat, decoded copy of one network instance's route
//! table, next-hop-group table and next-hop table. Snapshots are never
//! cached; every reconciliation pass reads a fresh one.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Deserializer};
use tracing::debug;

use super::RouteTableSource;
use crate::error::{Error, Result};

/// Programming status the device reports for a route that is in the FIB
pub const FIB_PROGRAMMED: &str = "success";

/// An IPv4 route entry
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Route {
    #[serde(rename = "ipv4-prefix")]
    pub prefix: String,
    #[serde(
        rename = "next-hop-group",
        default,
        deserialize_with = "de_opt_index"
    )]
    pub next_hop_group: Option<u64>,
    #[serde(rename = "fib-programming", default)]
    pub fib_programming: Option<FibProgramming>,
}

impl Route {
    pub fn programming_status(&self) -> Option<&str> {
        self.fib_programming
            .as_ref()
            .and_then(|f| f.status.as_deref())
    }

    pub fn is_programmed(&self) -> bool {
        self.programming_status() == Some(FIB_PROGRAMMED)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct FibProgramming {
    #[serde(default)]
    pub status: Option<String>,
}

/// A next-hop group, indirecting a route to a set of next hops
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct NextHopGroup {
    #[serde(deserialize_with = "de_index")]
    pub index: u64,
    #[serde(rename = "next-hop", default)]
    pub next_hops: Vec<NextHopRef>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct NextHopRef {
    #[serde(rename = "next-hop", deserialize_with = "de_index")]
    pub next_hop: u64,
}

/// A resolved next hop
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct NextHop {
    #[serde(deserialize_with = "de_index")]
    pub index: u64,
    #[serde(rename = "ip-address", default)]
    pub ip_address: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawRouteTable {
    #[serde(
        rename = "ipv4-unicast",
        alias = "srl_nokia-ip-route-tables:ipv4-unicast",
        default
    )]
    ipv4_unicast: Option<RawIpv4Unicast>,
    #[serde(
        rename = "next-hop-group",
        alias = "srl_nokia-ip-route-tables:next-hop-group",
        default
    )]
    next_hop_groups: Vec<NextHopGroup>,
    #[serde(
        rename = "next-hop",
        alias = "srl_nokia-ip-route-tables:next-hop",
        default
    )]
    next_hops: Vec<NextHop>,
}

#[derive(Debug, Default, Deserialize)]
struct RawIpv4Unicast {
    #[serde(default)]
    route: Vec<Route>,
}

/// Point-in-time copy of a network instance's routing state
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub routes: Vec<Route>,
    pub next_hop_groups: HashMap<u64, NextHopGroup>,
    pub next_hops: HashMap<u64, NextHop>,
}

impl Snapshot {
    /// Decode the JSON the device returns for a route-table read.
    ///
    /// The table may arrive bare or wrapped in a single `...route-table` key.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        let value = match value {
            serde_json::Value::Object(mut map)
                if map.len() == 1 && map.keys().all(|k| k.ends_with("route-table")) =>
            {
                let key = map.keys().next().cloned().unwrap_or_default();
                map.remove(&key).unwrap_or_default()
            }
            other => other,
        };

        let raw: RawRouteTable = serde_json::from_value(value)
            .map_err(|e| Error::DecodeError(format!("route table: {}", e)))?;

        Ok(Self {
            routes: raw.ipv4_unicast.map(|u| u.route).unwrap_or_default(),
            next_hop_groups: raw
                .next_hop_groups
                .into_iter()
                .map(|g| (g.index, g))
                .collect(),
            next_hops: raw.next_hops.into_iter().map(|n| (n.index, n)).collect(),
        })
    }

    /// The host route for `address`: prefix exactly `<address>/32`.
    pub fn host_route(&self, address: &str) -> Option<&Route> {
        let wanted = format!("{}/32", address);
        self.routes.iter().find(|r| r.prefix == wanted)
    }

    /// IP addresses of every next hop reachable through `route`'s group.
    ///
    /// Dangling group or next-hop references resolve to nothing.
    pub fn next_hop_addresses(&self, route: &Route) -> Vec<&str> {
        let Some(group) = route
            .next_hop_group
            .and_then(|index| self.next_hop_groups.get(&index))
        else {
            return Vec::new();
        };

        group
            .next_hops
            .iter()
            .filter_map(|r| self.next_hops.get(&r.next_hop))
            .filter_map(|nh| nh.ip_address.as_deref())
            .collect()
    }
}

/// Reads snapshots of one network instance
#[derive(Clone)]
pub struct RouteTableReader {
    source: Arc<dyn RouteTableSource>,
    network_instance: String,
}

impl RouteTableReader {
    pub fn new(source: Arc<dyn RouteTableSource>, network_instance: impl Into<String>) -> Self {
        Self {
            source,
            network_instance: network_instance.into(),
        }
    }

    pub fn network_instance(&self) -> &str {
        &self.network_instance
    }

    pub async fn fetch(&self) -> Result<Snapshot> {
        let raw = self.source.get_route_table(&self.network_instance).await?;
        let snapshot = Snapshot::from_json(raw)?;
        debug!(
            "Fetched route table for {}: {} routes, {} groups, {} next hops",
            self.network_instance,
            snapshot.routes.len(),
            snapshot.next_hop_groups.len(),
            snapshot.next_hops.len()
        );
        Ok(snapshot)
    }
}

// The device renders 64-bit indexes either as numbers or as strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum Index {
    Num(u64),
    Str(String),
}

fn de_index<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match Index::deserialize(deserializer)? {
        Index::Num(n) => Ok(n),
        Index::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

fn de_opt_index<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Index>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Index::Num(n)) => Ok(Some(n)),
        Some(Index::Str(s)) => s.parse().map(Some).map_err(serde::de::Error::custom),
    }
}
