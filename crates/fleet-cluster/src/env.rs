//! Per-process execution environment
//!
//! Bundles what one process needs to take part in the cluster: its
//! membership client, the client cache for reaching other hosts and, on
//! coordinators, a scheduler. Built explicitly and passed by reference.

use crate::config::ClusterConfig;
use crate::error::{ClusterError, Result};
use crate::pool::{ChannelConnector, ConnectionPool};
use crate::scheduler::{Scheduler, SimpleScheduler};
use crate::subscriber::MembershipClient;
use crate::types::{HostAddress, ServiceId};
use crate::view::MembershipView;
use std::sync::Arc;

/// Role of the process owning an [`ExecEnv`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecRole {
    /// Executes work; no scheduler
    Backend,
    /// Places work on backends
    Coordinator,
}

pub struct ExecEnv {
    role: ExecRole,
    membership: MembershipClient,
    scheduler: Option<Arc<SimpleScheduler>>,
    client_cache: Arc<ConnectionPool<ChannelConnector>>,
}

impl ExecEnv {
    /// Environment for a backend: membership client and client cache only
    pub fn backend(config: &ClusterConfig) -> Result<Self> {
        Self::build(config, ExecRole::Backend)
    }

    /// Environment for a coordinator, with a scheduler over the configured service
    pub fn coordinator(config: &ClusterConfig) -> Result<Self> {
        Self::build(config, ExecRole::Coordinator)
    }

    fn build(config: &ClusterConfig, role: ExecRole) -> Result<Self> {
        let membership = MembershipClient::new(config.subscriber.clone(), config.pool.clone())?;

        let scheduler = match role {
            ExecRole::Coordinator => {
                let view: Arc<dyn MembershipView> = Arc::new(membership.clone());
                let scheduler = SimpleScheduler::init(view, config.scheduler.service_id())?;
                Some(Arc::new(scheduler))
            }
            ExecRole::Backend => None,
        };

        Ok(Self {
            role,
            membership,
            scheduler,
            client_cache: Arc::new(ConnectionPool::channels(config.pool.clone())),
        })
    }

    /// Start the membership client
    pub async fn start_services(&self) -> Result<()> {
        self.membership.start().await?;
        tracing::info!("{:?} services started", self.role);
        Ok(())
    }

    /// Register a service this process exposes
    pub async fn register_service(
        &self,
        service_id: ServiceId,
        address: HostAddress,
    ) -> Result<u64> {
        self.membership.register_service(service_id, address).await
    }

    pub fn role(&self) -> ExecRole {
        self.role
    }

    pub fn membership(&self) -> &MembershipClient {
        &self.membership
    }

    /// The scheduler; backends have none
    pub fn scheduler(&self) -> Result<Arc<dyn Scheduler>> {
        match &self.scheduler {
            Some(scheduler) => Ok(scheduler.clone()),
            None => Err(ClusterError::configuration(
                "Backend environments have no scheduler",
            )),
        }
    }

    pub fn simple_scheduler(&self) -> Option<&Arc<SimpleScheduler>> {
        self.scheduler.as_ref()
    }

    pub fn client_cache(&self) -> &Arc<ConnectionPool<ChannelConnector>> {
        &self.client_cache
    }

    /// Client cache occupancy
    pub fn debug_string(&self) -> String {
        self.client_cache.debug_string()
    }

    /// Deregister local services and stop the membership client
    pub async fn shutdown(&self) {
        for (service_id, address) in self.membership.local_services() {
            if let Err(e) = self.membership.unregister_service(&service_id, &address).await {
                tracing::warn!("Failed to deregister {} from {}: {}", address, service_id, e);
            }
        }
        self.membership.stop().await;
        self.client_cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles() {
        let config = ClusterConfig::default();

        let backend = ExecEnv::backend(&config).unwrap();
        assert_eq!(backend.role(), ExecRole::Backend);
        assert!(backend.scheduler().is_err());
        assert!(backend.simple_scheduler().is_none());

        let coordinator = ExecEnv::coordinator(&config).unwrap();
        assert_eq!(coordinator.role(), ExecRole::Coordinator);
        assert_eq!(
            coordinator.simple_scheduler().unwrap().service_id(),
            &ServiceId::new("exec")
        );
    }

    #[test]
    fn test_coordinator_scheduler_reads_membership() {
        let coordinator = ExecEnv::coordinator(&ClusterConfig::default()).unwrap();
        let scheduler = coordinator.scheduler().unwrap();

        // Nothing received yet
        assert!(scheduler.get_all_known_hosts().is_empty());
        assert!(matches!(
            scheduler.schedule(&[crate::types::WorkItem::new("scan-1")]),
            Err(ClusterError::NoHostsAvailable(_))
        ));
    }

    #[test]
    fn test_invalid_authority_address() {
        let mut config = ClusterConfig::default();
        config.subscriber.authority_address = "missing-port".to_string();
        assert!(ExecEnv::backend(&config).is_err());
    }

    #[test]
    fn test_debug_string_dumps_client_cache() {
        let env = ExecEnv::backend(&ClusterConfig::default()).unwrap();
        assert!(env.debug_string().starts_with("ConnectionPool(hosts=0"));
    }
}
