//! Authoritative service registry owned by the membership authority

use crate::types::{
    HostAddress, HostSet, MembershipSnapshot, Registration, ServiceId, SubscriberId,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// In-memory table of service id to registered endpoints.
///
/// Every mutation that changes the table bumps the version and publishes a
/// fresh [`MembershipSnapshot`]; callers only ever see whole snapshots.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    state: Mutex<RegistryState>,
}

#[derive(Debug, Default)]
struct RegistryState {
    version: u64,
    services: BTreeMap<ServiceId, BTreeMap<HostAddress, Registration>>,
    published: Arc<MembershipSnapshot>,
}

impl RegistryState {
    fn publish(&mut self) {
        self.version += 1;
        let services = self
            .services
            .iter()
            .map(|(id, hosts)| (id.clone(), hosts.keys().cloned().collect::<HostSet>()))
            .collect();
        self.published = Arc::new(MembershipSnapshot::new(self.version, services));
    }
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        // A poisoned registry still holds a consistent published snapshot.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Idempotent insert; returns the version after the call.
    pub fn register(&self, service_id: ServiceId, address: HostAddress) -> u64 {
        self.register_owned(service_id, address, None)
    }

    /// Insert an endpoint on behalf of a subscriber so it can be evicted with it.
    ///
    /// Re-registering an existing endpoint with a new owner transfers it
    /// without a version change.
    pub fn register_owned(
        &self,
        service_id: ServiceId,
        address: HostAddress,
        owner: Option<SubscriberId>,
    ) -> u64 {
        let mut state = self.lock();
        let hosts = state.services.entry(service_id.clone()).or_default();

        if let Some(existing) = hosts.get_mut(&address) {
            // The latest registrant owns the endpoint
            if owner.is_some() {
                existing.owner = owner;
            }
            tracing::debug!("{} already registered for {}", address, service_id);
            return state.version;
        }

        tracing::info!("Registering {} for service {}", address, service_id);
        let registration = Registration::new(service_id, address.clone(), owner);
        hosts.insert(address, registration);
        state.publish();
        state.version
    }

    /// Idempotent remove; returns the version after the call.
    pub fn deregister(&self, service_id: &ServiceId, address: &HostAddress) -> u64 {
        let mut state = self.lock();
        let removed = state
            .services
            .get_mut(service_id)
            .map(|hosts| hosts.remove(address).is_some())
            .unwrap_or(false);
        if state.services.get(service_id).map_or(false, BTreeMap::is_empty) {
            state.services.remove(service_id);
        }

        if removed {
            tracing::info!("Deregistered {} from service {}", address, service_id);
            state.publish();
        }
        state.version
    }

    /// Remove every endpoint registered by `owner` in a single version step.
    ///
    /// Returns the number of removed registrations and the resulting version.
    pub fn remove_owned_by(&self, owner: &SubscriberId) -> (usize, u64) {
        let mut state = self.lock();
        let mut removed = 0;
        for hosts in state.services.values_mut() {
            let before = hosts.len();
            hosts.retain(|_, registration| registration.owner.as_ref() != Some(owner));
            removed += before - hosts.len();
        }
        state.services.retain(|_, hosts| !hosts.is_empty());

        if removed > 0 {
            tracing::info!("Evicted {} registrations owned by {}", removed, owner);
            state.publish();
        }
        (removed, state.version)
    }

    /// Current immutable view
    pub fn snapshot(&self) -> Arc<MembershipSnapshot> {
        self.lock().published.clone()
    }

    pub fn version(&self) -> u64 {
        self.lock().version
    }

    /// Number of (service, address) pairs
    pub fn len(&self) -> usize {
        self.lock().services.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Full registration records, for diagnostics
    pub fn registrations(&self) -> Vec<Registration> {
        self.lock()
            .services
            .values()
            .flat_map(|hosts| hosts.values().cloned())
            .collect()
    }
}
