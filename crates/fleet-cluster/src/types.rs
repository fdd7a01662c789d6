//! Core membership and scheduling types

use crate::error::{ClusterError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use uuid::Uuid;

/// Set of live endpoints for one service, enumerated in address order.
pub type HostSet = BTreeSet<HostAddress>;

/// Unique identifier for a subscribing process
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    /// Create a new random subscriber ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a subscriber ID from a string
    pub fn from_string(s: &str) -> Result<Self> {
        let uuid = Uuid::parse_str(s)
            .map_err(|e| ClusterError::protocol(format!("Invalid subscriber ID: {}", e)))?;
        Ok(Self(uuid))
    }

    /// Get the underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

/// Opaque name for a class of service exposed by backends
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(String);

impl ServiceId {
    pub fn new<T: Into<String>>(id: T) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServiceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ServiceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// One reachable endpoint: host name or IP plus port.
///
/// A port of `0` is only meaningful in locality hints, where it stands for
/// "any port on this host".
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostAddress {
    host: String,
    port: u16,
}

impl HostAddress {
    pub fn new<T: Into<String>>(host: T, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Locality hint matching every port on `host`
    pub fn any_port<T: Into<String>>(host: T) -> Self {
        Self::new(host, 0)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_any_port(&self) -> bool {
        self.port == 0
    }

    /// Whether this live endpoint satisfies a locality hint.
    pub fn matches_hint(&self, hint: &HostAddress) -> bool {
        if hint.is_any_port() {
            self.host == hint.host
        } else {
            self == hint
        }
    }

    /// URI used to open a gRPC channel to this endpoint
    pub fn endpoint_uri(&self) -> String {
        format!("http://{}", self)
    }
}

impl fmt::Display for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for HostAddress {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ClusterError::invalid_address(format!("missing port in '{}'", s)))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(ClusterError::invalid_address(format!("missing host in '{}'", s)));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| ClusterError::invalid_address(format!("bad port in '{}': {}", s, e)))?;
        Ok(Self::new(host, port))
    }
}

impl From<SocketAddr> for HostAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

/// A service endpoint announced by a backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub service_id: ServiceId,
    pub address: HostAddress,
    /// Subscriber that registered the endpoint, if it runs a subscription
    pub owner: Option<SubscriberId>,
    pub registered_at: DateTime<Utc>,
}

impl Registration {
    pub fn new(service_id: ServiceId, address: HostAddress, owner: Option<SubscriberId>) -> Self {
        Self {
            service_id,
            address,
            owner,
            registered_at: Utc::now(),
        }
    }
}

/// Immutable point-in-time view of cluster membership.
///
/// Never mutated after construction; a newer registry state is a new value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipSnapshot {
    version: u64,
    services: BTreeMap<ServiceId, HostSet>,
}

impl MembershipSnapshot {
    /// Build a snapshot, dropping services without hosts
    pub fn new(version: u64, services: BTreeMap<ServiceId, HostSet>) -> Self {
        let services = services
            .into_iter()
            .filter(|(_, hosts)| !hosts.is_empty())
            .collect();
        Self { version, services }
    }

    /// The empty snapshot a client serves before its first update
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn hosts(&self, service_id: &ServiceId) -> Option<&HostSet> {
        self.services.get(service_id)
    }

    /// Owned copy of the host set for a service; empty when unknown
    pub fn known_hosts(&self, service_id: &ServiceId) -> HostSet {
        self.hosts(service_id).cloned().unwrap_or_default()
    }

    pub fn contains(&self, service_id: &ServiceId, address: &HostAddress) -> bool {
        self.hosts(service_id)
            .map(|hosts| hosts.contains(address))
            .unwrap_or(false)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&ServiceId, &HostSet)> {
        self.services.iter()
    }

    pub fn num_services(&self) -> usize {
        self.services.len()
    }

    /// Total number of (service, address) pairs
    pub fn num_registrations(&self) -> usize {
        self.services.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

/// Identifier used for deterministic fallback placement
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkItemId(String);

impl WorkItemId {
    pub fn new<T: Into<String>>(id: T) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A unit of work (e.g. a scan range) with optional locality hints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,
    pub preferred_hosts: Vec<HostAddress>,
}

impl WorkItem {
    pub fn new<T: Into<String>>(id: T) -> Self {
        Self {
            id: WorkItemId::new(id),
            preferred_hosts: Vec::new(),
        }
    }

    pub fn with_preferred_host(mut self, host: HostAddress) -> Self {
        self.preferred_hosts.push(host);
        self
    }

    pub fn with_preferred_hosts<I>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = HostAddress>,
    {
        self.preferred_hosts.extend(hosts);
        self
    }
}

/// Scheduler output: the chosen host for each work item
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    /// Version of the membership snapshot the placements were computed from
    pub snapshot_version: u64,
    placements: BTreeMap<WorkItemId, HostAddress>,
}

impl Assignment {
    pub fn new(snapshot_version: u64) -> Self {
        Self {
            snapshot_version,
            placements: BTreeMap::new(),
        }
    }

    pub(crate) fn record(&mut self, id: WorkItemId, host: HostAddress) {
        self.placements.insert(id, host);
    }

    pub fn get(&self, id: &WorkItemId) -> Option<&HostAddress> {
        self.placements.get(id)
    }

    pub fn contains(&self, id: &WorkItemId) -> bool {
        self.placements.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&WorkItemId, &HostAddress)> {
        self.placements.iter()
    }

    pub fn len(&self) -> usize {
        self.placements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.placements.is_empty()
    }

    /// Number of work items placed on each host
    pub fn load_by_host(&self) -> BTreeMap<&HostAddress, usize> {
        let mut load = BTreeMap::new();
        for host in self.placements.values() {
            *load.entry(host).or_insert(0) += 1;
        }
        load
    }
}
