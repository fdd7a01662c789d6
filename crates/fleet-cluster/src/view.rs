//! Read-only access to the current membership snapshot

use crate::types::{HostSet, MembershipSnapshot, ServiceId};
use std::sync::Arc;
use tokio::sync::watch;

/// Source of membership snapshots for schedulers and diagnostics.
///
/// Implementations answer from memory only: no call may block on I/O.
pub trait MembershipView: Send + Sync {
    /// The most recent complete snapshot
    fn snapshot(&self) -> Arc<MembershipSnapshot>;

    /// Hosts currently known for `service_id`; empty when none are known
    fn get_all_known_hosts(&self, service_id: &ServiceId) -> HostSet {
        self.snapshot().known_hosts(service_id)
    }
}

/// A view whose snapshot is set by hand.
///
/// Used by tooling that does not run a subscription, and by tests.
#[derive(Debug)]
pub struct StaticMembership {
    current: watch::Sender<Arc<MembershipSnapshot>>,
}

impl StaticMembership {
    pub fn new(snapshot: MembershipSnapshot) -> Self {
        let (current, _) = watch::channel(Arc::new(snapshot));
        Self { current }
    }

    pub fn empty() -> Self {
        Self::new(MembershipSnapshot::empty())
    }

    /// Replace the snapshot as a whole
    pub fn set(&self, snapshot: MembershipSnapshot) {
        self.current.send_replace(Arc::new(snapshot));
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<MembershipSnapshot>> {
        self.current.subscribe()
    }
}

impl Default for StaticMembership {
    fn default() -> Self {
        Self::empty()
    }
}

impl MembershipView for StaticMembership {
    fn snapshot(&self) -> Arc<MembershipSnapshot> {
        self.current.borrow().clone()
    }
}
