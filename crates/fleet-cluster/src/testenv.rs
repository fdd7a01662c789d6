//! In-process test cluster
//!
//! Starts one membership authority, a number of backends and a coordinator in
//! the current process, then waits until the coordinator sees every backend.
//! Meant for tests and local experiments, not for production deployments.

use crate::authority::MembershipAuthority;
use crate::config::ClusterConfig;
use crate::env::ExecEnv;
use crate::error::{ClusterError, Result};
use crate::retry::{poll_until, wait_for_server};
use crate::scheduler::Scheduler;
use crate::types::{HostAddress, ServiceId};
use crate::view::MembershipView;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Probes of the authority's socket before giving up
pub const AUTHORITY_PROBE_ATTEMPTS: u32 = 10;
pub const AUTHORITY_PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// Polls for the complete backend set (5 s in total)
pub const BOOTSTRAP_ATTEMPTS: u32 = 100;
pub const BOOTSTRAP_POLL_INTERVAL: Duration = Duration::from_millis(50);

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Wait until `view` knows at least `expected` hosts for `service_id`.
///
/// Returns the attempt that succeeded, or `BootstrapTimeout` carrying the
/// last observed count.
pub async fn wait_for_hosts(
    view: &dyn MembershipView,
    service_id: &ServiceId,
    expected: usize,
    attempts: u32,
    interval: Duration,
) -> Result<u32> {
    let mut observed = 0;
    let attempt = poll_until(attempts, interval, || {
        observed = view.get_all_known_hosts(service_id).len();
        observed >= expected
    })
    .await;

    match attempt {
        Some(attempt) => {
            tracing::debug!(
                "Complete set of {} backends observed in under {:?}",
                expected,
                interval * attempt
            );
            Ok(attempt)
        }
        None => Err(ClusterError::bootstrap_timeout(expected, observed)),
    }
}

/// Stand-in for a backend's execution service: accepts and drops connections
struct ExecListener {
    address: HostAddress,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ExecListener {
    async fn bind(port: u16) -> Result<Self> {
        let listener = TcpListener::bind(SocketAddr::new(LOCALHOST, port)).await?;
        let address = HostAddress::from(listener.local_addr()?);
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    accepted = listener.accept() => {
                        if let Err(e) = accepted {
                            tracing::debug!("Exec listener accept failed: {}", e);
                        }
                    }
                }
            }
        });

        Ok(Self {
            address,
            shutdown,
            task,
        })
    }

    async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

struct Backend {
    exec_env: ExecEnv,
    listener: ExecListener,
}

/// One authority, `num_backends` backends and a coordinator, all in-process
pub struct TestCluster {
    num_backends: usize,
    start_port: u16,
    config: ClusterConfig,
    authority: MembershipAuthority,
    authority_address: Option<HostAddress>,
    backends: Vec<Backend>,
    coordinator: Option<ExecEnv>,
}

impl TestCluster {
    /// Ports are handed out upwards from `start_port`; 0 uses ephemeral ports throughout
    pub fn new(num_backends: usize, start_port: u16) -> Self {
        let mut config = ClusterConfig::default();
        config.authority.bind_address = SocketAddr::new(LOCALHOST, 0);
        Self::with_config(num_backends, start_port, config)
    }

    pub fn with_config(num_backends: usize, start_port: u16, config: ClusterConfig) -> Self {
        let authority = MembershipAuthority::new(config.authority.clone(), config.pool.clone());
        Self {
            num_backends,
            start_port,
            config,
            authority,
            authority_address: None,
            backends: Vec::new(),
            coordinator: None,
        }
    }

    fn next_port(&self, next_free: &mut u16) -> u16 {
        if self.start_port == 0 {
            return 0;
        }
        let port = *next_free;
        *next_free = next_free.saturating_add(1);
        port
    }

    /// Start the authority, every backend and the coordinator, then wait for
    /// the coordinator to see all backends.
    pub async fn start_backends(&mut self) -> Result<()> {
        tracing::info!("Starting {} backends", self.num_backends);
        let mut next_free = self.start_port;
        let service_id = self.config.scheduler.service_id();

        let authority_port = self.next_port(&mut next_free);
        tracing::info!("Starting in-process membership authority");
        let bound = self.authority.start(authority_port).await?;
        let authority_address = HostAddress::new(LOCALHOST.to_string(), bound.port());
        wait_for_server(
            authority_address.host(),
            authority_address.port(),
            AUTHORITY_PROBE_ATTEMPTS,
            AUTHORITY_PROBE_INTERVAL,
        )
        .await?;
        self.authority_address = Some(authority_address.clone());

        for _ in 0..self.num_backends {
            let subscriber_port = self.next_port(&mut next_free);
            let exec_port = self.next_port(&mut next_free);

            let config = self.process_config(&authority_address, subscriber_port);
            let exec_env = ExecEnv::backend(&config)?;
            let listener = ExecListener::bind(exec_port).await?;

            exec_env.start_services().await?;
            exec_env
                .register_service(service_id.clone(), listener.address.clone())
                .await?;
            self.backends.push(Backend { exec_env, listener });
        }

        let coordinator_port = self.next_port(&mut next_free);
        let config = self.process_config(&authority_address, coordinator_port);
        let coordinator = ExecEnv::coordinator(&config)?;
        coordinator.start_services().await?;
        let membership = coordinator.membership().clone();
        self.coordinator = Some(coordinator);

        wait_for_hosts(
            &membership,
            &service_id,
            self.num_backends,
            BOOTSTRAP_ATTEMPTS,
            BOOTSTRAP_POLL_INTERVAL,
        )
        .await?;
        Ok(())
    }

    fn process_config(&self, authority: &HostAddress, port: u16) -> ClusterConfig {
        let mut config = self.config.clone();
        config.subscriber.authority_address = authority.to_string();
        config.subscriber.bind_address = SocketAddr::new(LOCALHOST, port);
        config
    }

    pub fn authority(&self) -> &MembershipAuthority {
        &self.authority
    }

    pub fn authority_address(&self) -> Option<&HostAddress> {
        self.authority_address.as_ref()
    }

    /// Exec addresses registered by the backends
    pub fn backend_addresses(&self) -> Vec<HostAddress> {
        self.backends
            .iter()
            .map(|backend| backend.listener.address.clone())
            .collect()
    }

    pub fn backend(&self, index: usize) -> Option<&ExecEnv> {
        self.backends.get(index).map(|backend| &backend.exec_env)
    }

    pub fn coordinator(&self) -> Result<&ExecEnv> {
        self.coordinator.as_ref().ok_or(ClusterError::NotStarted)
    }

    pub fn scheduler(&self) -> Result<Arc<dyn Scheduler>> {
        self.coordinator()?.scheduler()
    }

    /// The coordinator's client cache
    pub fn debug_string(&self) -> String {
        match &self.coordinator {
            Some(coordinator) => coordinator.debug_string(),
            None => "TestCluster(not started)".to_string(),
        }
    }

    /// Stop the coordinator, the backends and the authority
    pub async fn shutdown(&mut self) {
        if let Some(coordinator) = self.coordinator.take() {
            coordinator.shutdown().await;
        }
        for backend in self.backends.drain(..) {
            backend.exec_env.shutdown().await;
            backend.listener.stop().await;
        }
        self.authority.stop().await;
        self.authority_address = None;
    }
}
