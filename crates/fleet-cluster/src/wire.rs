//! gRPC messages for registration and snapshot delivery

use crate::error::{ClusterError, Result};
use crate::types::{HostAddress, HostSet, MembershipSnapshot, ServiceId};
use std::collections::BTreeMap;
use tonic::Status;

// Include generated protobuf code
pub mod proto {
    tonic::include_proto!("membership");
}

pub use proto::state_store_client::StateStoreClient;
pub use proto::state_store_server::{StateStore, StateStoreServer};
pub use proto::state_subscriber_client::StateSubscriberClient;
pub use proto::state_subscriber_server::{StateSubscriber, StateSubscriberServer};

use proto::{HostPort, MembershipEntry, MembershipUpdate};

impl From<&HostAddress> for HostPort {
    fn from(address: &HostAddress) -> Self {
        HostPort {
            host: address.host().to_string(),
            port: u32::from(address.port()),
        }
    }
}

impl TryFrom<HostPort> for HostAddress {
    type Error = ClusterError;

    fn try_from(proto: HostPort) -> Result<Self> {
        if proto.host.is_empty() {
            return Err(ClusterError::invalid_address("empty host"));
        }
        let port = u16::try_from(proto.port).map_err(|_| {
            ClusterError::invalid_address(format!("port {} out of range", proto.port))
        })?;
        Ok(HostAddress::new(proto.host, port))
    }
}

/// Decode a required address field, rejecting the request when it is missing or malformed.
pub fn require_address(address: Option<HostPort>) -> std::result::Result<HostAddress, Status> {
    let address = address.ok_or_else(|| Status::invalid_argument("Missing address"))?;
    HostAddress::try_from(address).map_err(|e| Status::invalid_argument(e.to_string()))
}

/// Protobuf versions are signed; local versions never exceed `i64::MAX`.
pub fn version_to_proto(version: u64) -> i64 {
    i64::try_from(version).unwrap_or(i64::MAX)
}

pub fn version_from_proto(version: i64) -> Result<u64> {
    u64::try_from(version)
        .map_err(|_| ClusterError::protocol(format!("negative snapshot version {}", version)))
}

/// Encode a snapshot for delivery, tagged with the sending authority
pub fn snapshot_to_proto(snapshot: &MembershipSnapshot, authority_id: &str) -> MembershipUpdate {
    let entries = snapshot
        .entries()
        .map(|(service_id, hosts)| MembershipEntry {
            service_id: service_id.to_string(),
            hosts: hosts.iter().map(HostPort::from).collect(),
        })
        .collect();

    MembershipUpdate {
        version: version_to_proto(snapshot.version()),
        entries,
        authority_id: authority_id.to_string(),
    }
}

/// Decode a delivered snapshot; duplicate entries merge into one host set
pub fn snapshot_from_proto(update: MembershipUpdate) -> Result<MembershipSnapshot> {
    let version = version_from_proto(update.version)?;
    let mut services: BTreeMap<ServiceId, HostSet> = BTreeMap::new();

    for entry in update.entries {
        if entry.service_id.is_empty() {
            return Err(ClusterError::protocol("snapshot entry without service id"));
        }
        let hosts = services.entry(ServiceId::new(entry.service_id)).or_default();
        for host in entry.hosts {
            hosts.insert(HostAddress::try_from(host)?);
        }
    }

    Ok(MembershipSnapshot::new(version, services))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_snapshot() -> MembershipSnapshot {
        let mut services = BTreeMap::new();
        services.insert(
            ServiceId::new("exec"),
            HostSet::from([
                HostAddress::new("127.0.0.1", 22001),
                HostAddress::new("127.0.0.1", 22002),
            ]),
        );
        services.insert(
            ServiceId::new("catalog"),
            HostSet::from([HostAddress::new("10.0.0.5", 26000)]),
        );
        MembershipSnapshot::new(12, services)
    }

    #[test]
    fn test_snapshot_conversion() {
        let original = sample_snapshot();
        let proto = snapshot_to_proto(&original, "authority-1");

        assert_eq!(proto.version, 12);
        assert_eq!(proto.authority_id, "authority-1");
        assert_eq!(proto.entries.len(), 2);

        let converted = snapshot_from_proto(proto).unwrap();
        assert_eq!(original, converted);
    }

    #[test]
    fn test_duplicate_entries_merge() {
        let update = MembershipUpdate {
            version: 3,
            entries: vec![
                MembershipEntry {
                    service_id: "exec".to_string(),
                    hosts: vec![HostPort { host: "a".to_string(), port: 1 }],
                },
                MembershipEntry {
                    service_id: "exec".to_string(),
                    hosts: vec![
                        HostPort { host: "a".to_string(), port: 1 },
                        HostPort { host: "b".to_string(), port: 1 },
                    ],
                },
            ],
            authority_id: String::new(),
        };

        let snapshot = snapshot_from_proto(update).unwrap();
        assert_eq!(snapshot.known_hosts(&ServiceId::new("exec")).len(), 2);
    }

    #[test]
    fn test_invalid_messages_rejected() {
        let bad_port = HostPort { host: "a".to_string(), port: 70000 };
        assert!(HostAddress::try_from(bad_port).is_err());

        let empty_host = HostPort { host: String::new(), port: 80 };
        assert!(HostAddress::try_from(empty_host).is_err());

        let negative = MembershipUpdate {
            version: -1,
            entries: vec![],
            authority_id: String::new(),
        };
        assert!(snapshot_from_proto(negative).is_err());

        let status = require_address(None).unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }
}
