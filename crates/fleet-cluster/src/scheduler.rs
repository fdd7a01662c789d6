//! Host assignment for work items
//!
//! Places each work item on one live host of the target service. Items whose
//! locality hints name live hosts are spread round-robin over those hosts;
//! everything else is hashed onto the sorted host set so that retries of the
//! same item land on the same host while the membership is unchanged.

use crate::error::{ClusterError, Result};
use crate::types::{Assignment, HostAddress, HostSet, ServiceId, WorkItem, WorkItemId};
use crate::view::MembershipView;
use dashmap::DashMap;
use siphasher::sip::SipHasher24;
use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Round-robin counters kept before the table is reset
const MAX_ROUND_ROBIN_KEYS: usize = 4096;

/// Places work items on hosts
pub trait Scheduler: Send + Sync {
    /// Assign every item in the batch to exactly one live host
    fn schedule(&self, items: &[WorkItem]) -> Result<Assignment>;

    /// Assign a single item
    fn schedule_one(&self, item: &WorkItem) -> Result<HostAddress>;

    /// Hosts the scheduler would currently choose from
    fn get_all_known_hosts(&self) -> HostSet;
}

/// Placement counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Items placed on one of their preferred hosts
    pub local_placements: u64,
    /// Items placed by identifier hash
    pub fallback_placements: u64,
    /// Requests rejected because no host was known
    pub failed_requests: u64,
}

#[derive(Default)]
struct Counters {
    local: AtomicU64,
    fallback: AtomicU64,
    failed: AtomicU64,
}

/// Locality-aware scheduler reading from a membership view
pub struct SimpleScheduler {
    view: Arc<dyn MembershipView>,
    service_id: ServiceId,
    round_robin: DashMap<Vec<HostAddress>, AtomicUsize>,
    counters: Counters,
}

impl SimpleScheduler {
    /// Bind a scheduler to a membership view and the service it places work on
    pub fn init(view: Arc<dyn MembershipView>, service_id: ServiceId) -> Result<Self> {
        if service_id.is_empty() {
            return Err(ClusterError::configuration(
                "Scheduler requires a non-empty service id",
            ));
        }

        tracing::info!("Scheduler initialized for service {}", service_id);
        Ok(Self {
            view,
            service_id,
            round_robin: DashMap::new(),
            counters: Counters::default(),
        })
    }

    pub fn service_id(&self) -> &ServiceId {
        &self.service_id
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            local_placements: self.counters.local.load(Ordering::Relaxed),
            fallback_placements: self.counters.fallback.load(Ordering::Relaxed),
            failed_requests: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    fn no_hosts(&self) -> ClusterError {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        tracing::warn!("No hosts available for service {}", self.service_id);
        ClusterError::no_hosts_available(self.service_id.as_str())
    }

    fn place(&self, hosts: &HostSet, ordered: &[&HostAddress], item: &WorkItem) -> HostAddress {
        let candidates: Vec<HostAddress> = if item.preferred_hosts.is_empty() {
            Vec::new()
        } else {
            hosts
                .iter()
                .filter(|host| item.preferred_hosts.iter().any(|hint| host.matches_hint(hint)))
                .cloned()
                .collect()
        };

        if !candidates.is_empty() {
            let turn = self.next_turn(&candidates);
            self.counters.local.fetch_add(1, Ordering::Relaxed);
            return candidates[turn % candidates.len()].clone();
        }

        let index = (fallback_hash(&item.id) % ordered.len() as u64) as usize;
        self.counters.fallback.fetch_add(1, Ordering::Relaxed);
        ordered[index].clone()
    }

    fn next_turn(&self, candidates: &[HostAddress]) -> usize {
        if let Some(counter) = self.round_robin.get(candidates) {
            return counter.fetch_add(1, Ordering::Relaxed);
        }
        if self.round_robin.len() >= MAX_ROUND_ROBIN_KEYS {
            self.round_robin.clear();
        }
        let counter = self.round_robin.entry(candidates.to_vec()).or_default();
        counter.fetch_add(1, Ordering::Relaxed)
    }
}

impl Scheduler for SimpleScheduler {
    fn schedule(&self, items: &[WorkItem]) -> Result<Assignment> {
        let snapshot = self.view.snapshot();
        let hosts = match snapshot.hosts(&self.service_id) {
            Some(hosts) if !hosts.is_empty() => hosts,
            _ => return Err(self.no_hosts()),
        };
        let ordered: Vec<&HostAddress> = hosts.iter().collect();

        let mut assignment = Assignment::new(snapshot.version());
        for item in items {
            if assignment.contains(&item.id) {
                continue;
            }
            let host = self.place(hosts, &ordered, item);
            assignment.record(item.id.clone(), host);
        }

        tracing::debug!(
            "Scheduled {} work items on {} hosts (membership v{})",
            assignment.len(),
            hosts.len(),
            snapshot.version()
        );
        Ok(assignment)
    }

    fn schedule_one(&self, item: &WorkItem) -> Result<HostAddress> {
        let snapshot = self.view.snapshot();
        let hosts = match snapshot.hosts(&self.service_id) {
            Some(hosts) if !hosts.is_empty() => hosts,
            _ => return Err(self.no_hosts()),
        };
        let ordered: Vec<&HostAddress> = hosts.iter().collect();
        Ok(self.place(hosts, &ordered, item))
    }

    fn get_all_known_hosts(&self) -> HostSet {
        self.view.get_all_known_hosts(&self.service_id)
    }
}

/// SipHash-2-4 with fixed keys, stable across processes and toolchains
fn fallback_hash(id: &WorkItemId) -> u64 {
    let mut hasher = SipHasher24::new();
    hasher.write(id.as_str().as_bytes());
    hasher.finish()
}
