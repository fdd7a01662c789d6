//! Membership client ("subscription manager")
//!
//! Runs inside every participating process. Registers the process's services
//! with the authority, serves the endpoint the authority pushes snapshots to,
//! and keeps the latest snapshot in a `watch` channel so reads never touch
//! the network.
//!
//! A background refresh loop re-subscribes whenever the client is not
//! subscribed or its snapshot has gone stale, re-registering the local
//! services each time so a restarted authority learns them again.

use crate::config::{PoolConfig, SubscriberConfig};
use crate::error::{ClusterError, Result};
use crate::pool::{ChannelConnector, ConnectionPool};
use crate::retry::{retry_with_backoff, with_timeout};
use crate::types::{HostAddress, HostSet, MembershipSnapshot, ServiceId, SubscriberId};
use crate::view::MembershipView;
use crate::wire::proto::{
    GetSnapshotRequest, HostPort, MembershipUpdate, RegisterServiceRequest,
    RegisterSubscriptionRequest, RegistrationStatus, UnregisterServiceRequest,
    UnregisterSubscriptionRequest, UpdateStateResponse,
};
use crate::wire::{
    snapshot_from_proto, version_from_proto, version_to_proto, StateStoreClient,
    StateSubscriber, StateSubscriberServer,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::future::Future;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::{Channel, Server};
use tonic::{Code, Request, Response, Status};

/// Coarse state of a membership client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    NotStarted,
    /// `stop()` was called; the cached snapshot is still readable
    Stopped,
    /// Started, no snapshot received yet
    Connecting,
    Healthy,
    /// The last snapshot is older than `stale_after`
    Stale,
    /// Refreshes keep failing
    Unreachable,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HealthStatus::NotStarted => "not started",
            HealthStatus::Stopped => "stopped",
            HealthStatus::Connecting => "connecting",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Stale => "stale",
            HealthStatus::Unreachable => "unreachable",
        };
        f.write_str(name)
    }
}

/// Health report of a membership client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriberHealth {
    pub status: HealthStatus,
    /// Version of the cached snapshot
    pub version: u64,
    /// Time since the authority last confirmed the cached snapshot
    pub last_update_age: Option<Duration>,
    pub consecutive_failures: u32,
    pub authority_id: Option<String>,
}

#[derive(Debug, Default)]
struct ClientState {
    subscribed: bool,
    /// Authority that produced the cached snapshot
    snapshot_authority: Option<String>,
    last_update: Option<Instant>,
    consecutive_failures: u32,
    local_services: BTreeSet<(ServiceId, HostAddress)>,
}

enum Lifecycle {
    NotStarted,
    Starting,
    Running(Running),
    Stopped,
}

struct Running {
    advertised: HostAddress,
    shutdown: watch::Sender<bool>,
    tasks: JoinSet<()>,
}

/// State shared with the background tasks
struct ClientInner {
    subscriber_id: SubscriberId,
    config: SubscriberConfig,
    authority: HostAddress,
    pool: ConnectionPool<ChannelConnector>,
    current: watch::Sender<Arc<MembershipSnapshot>>,
    state: Mutex<ClientState>,
    created_at: Instant,
}

/// Owns the background tasks; only user-facing handles hold it.
///
/// Dropping the last handle aborts the tasks and unsubscribes in the background.
struct ClientLifecycle {
    inner: Arc<ClientInner>,
    state: Mutex<Lifecycle>,
}

impl ClientLifecycle {
    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for ClientLifecycle {
    fn drop(&mut self) {
        let lifecycle = self
            .state
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Lifecycle::Running(running) = mem::replace(lifecycle, Lifecycle::Stopped) else {
            return;
        };
        let _ = running.shutdown.send(true);
        // Dropping the JoinSet aborts the tasks
        drop(running.tasks);

        let subscribed = mem::replace(&mut self.inner.state().subscribed, false);
        tracing::debug!(
            "Membership client {} dropped without stop()",
            self.inner.subscriber_id
        );
        if !subscribed {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let inner = self.inner.clone();
            runtime.spawn(async move {
                let deadline = inner.config.shutdown_timeout();
                if let Ok(Err(e)) = timeout(deadline, inner.unsubscribe()).await {
                    tracing::debug!("Unsubscribe of dropped client failed: {}", e);
                }
                inner.pool.clear();
            });
        }
    }
}

/// Per-process membership client; cheap to clone
#[derive(Clone)]
pub struct MembershipClient {
    inner: Arc<ClientInner>,
    lifecycle: Arc<ClientLifecycle>,
}

impl MembershipClient {
    pub fn new(config: SubscriberConfig, pool_config: PoolConfig) -> Result<Self> {
        let authority = config.authority()?;
        let (current, _) = watch::channel(Arc::new(MembershipSnapshot::empty()));

        let inner = ClientInner {
            subscriber_id: SubscriberId::new(),
            config,
            authority,
            pool: ConnectionPool::channels(pool_config),
            current,
            state: Mutex::new(ClientState::default()),
            created_at: Instant::now(),
        };
        let inner = Arc::new(inner);
        let lifecycle = ClientLifecycle {
            inner: inner.clone(),
            state: Mutex::new(Lifecycle::NotStarted),
        };

        Ok(Self {
            inner,
            lifecycle: Arc::new(lifecycle),
        })
    }

    pub fn subscriber_id(&self) -> SubscriberId {
        self.inner.subscriber_id
    }

    pub fn authority(&self) -> &HostAddress {
        &self.inner.authority
    }

    /// Address the authority pushes to, once started
    pub fn advertised_address(&self) -> Option<HostAddress> {
        match &*self.lifecycle.lock() {
            Lifecycle::Running(running) => Some(running.advertised.clone()),
            _ => None,
        }
    }

    /// Start the update endpoint and the background refresh loop.
    ///
    /// May be called once per client; later calls fail with `AlreadyStarted`.
    pub async fn start(&self) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle.lock();
            if !matches!(*lifecycle, Lifecycle::NotStarted) {
                return Err(ClusterError::AlreadyStarted);
            }
            *lifecycle = Lifecycle::Starting;
        }

        match self.spawn_tasks().await {
            Ok(running) => {
                tracing::info!(
                    "Membership client {} started; updates at {}, authority {}",
                    self.inner.subscriber_id,
                    running.advertised,
                    self.inner.authority
                );
                *self.lifecycle.lock() = Lifecycle::Running(running);
                Ok(())
            }
            Err(e) => {
                *self.lifecycle.lock() = Lifecycle::NotStarted;
                Err(e)
            }
        }
    }

    async fn spawn_tasks(&self) -> Result<Running> {
        let bind_address = self.inner.config.bind_address;
        let listener = TcpListener::bind(bind_address).await.map_err(|e| {
            ClusterError::connectivity(format!(
                "Failed to bind membership update endpoint to {}: {}",
                bind_address, e
            ))
        })?;
        let local_addr = listener.local_addr()?;

        let host = match &self.inner.config.advertise_host {
            Some(host) => host.clone(),
            None if local_addr.ip().is_unspecified() => {
                return Err(ClusterError::configuration(format!(
                    "advertise_host is required when binding to {}",
                    local_addr
                )))
            }
            None => local_addr.ip().to_string(),
        };
        let advertised = HostAddress::new(host, local_addr.port());

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();

        let service = UpdateService {
            inner: self.inner.clone(),
        };
        let mut server_shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            let result = Server::builder()
                .add_service(StateSubscriberServer::new(service))
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                    let _ = server_shutdown.wait_for(|stop| *stop).await;
                })
                .await;
            if let Err(e) = result {
                tracing::error!("Membership update endpoint error: {}", e);
            }
        });

        tasks.spawn(refresh_loop(
            self.inner.clone(),
            advertised.clone(),
            shutdown_rx,
        ));

        Ok(Running {
            advertised,
            shutdown,
            tasks,
        })
    }

    /// Stop the refresh loop and the update endpoint; idempotent.
    ///
    /// The cached snapshot stays readable.
    pub async fn stop(&self) {
        let running = {
            let mut lifecycle = self.lifecycle.lock();
            match mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
                Lifecycle::Running(running) => running,
                other => {
                    *lifecycle = other;
                    return;
                }
            }
        };
        let Running {
            shutdown,
            mut tasks,
            ..
        } = running;

        let _ = shutdown.send(true);
        let deadline = self.inner.config.shutdown_timeout();

        let drained = timeout(deadline, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!("Membership client tasks did not stop in time; aborting");
            tasks.shutdown().await;
        }

        let subscribed = mem::replace(&mut self.inner.state().subscribed, false);
        if subscribed {
            match timeout(deadline, self.inner.unsubscribe()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!("Unsubscribe failed: {}", e),
                Err(_) => tracing::debug!("Unsubscribe did not finish before shutdown"),
            }
        }

        self.inner.pool.clear();
        tracing::info!("Membership client {} stopped", self.inner.subscriber_id);
    }

    /// Register a local service endpoint with the authority.
    ///
    /// Transient failures are retried with backoff; returns the registry
    /// version after the registration.
    pub async fn register_service(
        &self,
        service_id: ServiceId,
        address: HostAddress,
    ) -> Result<u64> {
        if service_id.is_empty() {
            return Err(ClusterError::registration_rejected("empty service id"));
        }
        if address.is_any_port() {
            return Err(ClusterError::registration_rejected(format!(
                "port 0 is not a live endpoint: {}",
                address
            )));
        }

        let operation = format!("register {} for {}", address, service_id);
        let version = retry_with_backoff(&self.inner.config.retry_policy(), &operation, || {
            self.inner.register_once(&service_id, &address)
        })
        .await?;

        tracing::info!(
            "Registered {} for service {} (registry v{})",
            address,
            service_id,
            version
        );
        self.inner
            .state()
            .local_services
            .insert((service_id, address));
        self.catch_up(version).await;
        Ok(version)
    }

    /// Remove a local service endpoint from the authority.
    ///
    /// The endpoint stays in the re-registration set until the authority confirms.
    pub async fn unregister_service(
        &self,
        service_id: &ServiceId,
        address: &HostAddress,
    ) -> Result<u64> {
        let operation = format!("unregister {} from {}", address, service_id);
        let version = retry_with_backoff(&self.inner.config.retry_policy(), &operation, || {
            self.inner.unregister_once(service_id, address)
        })
        .await?;

        self.inner
            .state()
            .local_services
            .remove(&(service_id.clone(), address.clone()));
        tracing::info!("Unregistered {} from service {}", address, service_id);
        self.catch_up(version).await;
        Ok(version)
    }

    /// Pull the snapshot right away when the cache is behind `version`
    async fn catch_up(&self, version: u64) {
        if !self.is_running() || self.inner.current_version() >= version {
            return;
        }
        if let Err(e) = self.inner.pull_snapshot().await {
            tracing::debug!("Snapshot catch-up failed, waiting for next push: {}", e);
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lifecycle.lock(), Lifecycle::Running(_))
    }

    /// Hosts of `service_id` from the cached snapshot; never blocks on I/O
    pub fn get_all_known_hosts(&self, service_id: &ServiceId) -> HostSet {
        self.inner.current.borrow().known_hosts(service_id)
    }

    /// The whole cached snapshot
    pub fn snapshot(&self) -> Arc<MembershipSnapshot> {
        self.inner.current.borrow().clone()
    }

    /// Receiver notified on every applied snapshot
    pub fn subscribe(&self) -> watch::Receiver<Arc<MembershipSnapshot>> {
        self.inner.current.subscribe()
    }

    /// Services this client registered and keeps registered
    pub fn local_services(&self) -> Vec<(ServiceId, HostAddress)> {
        self.inner.state().local_services.iter().cloned().collect()
    }

    pub fn health(&self) -> SubscriberHealth {
        let stopped = match *self.lifecycle.lock() {
            Lifecycle::NotStarted | Lifecycle::Starting => Some(HealthStatus::NotStarted),
            Lifecycle::Stopped => Some(HealthStatus::Stopped),
            Lifecycle::Running(_) => None,
        };
        let state = self.inner.state();
        let last_update_age = state.last_update.map(|at| at.elapsed());

        let status = if let Some(status) = stopped {
            status
        } else if state.consecutive_failures >= self.inner.config.unreachable_after_failures {
            HealthStatus::Unreachable
        } else {
            match last_update_age {
                None => HealthStatus::Connecting,
                Some(age) if age > self.inner.config.stale_after() => HealthStatus::Stale,
                Some(_) => HealthStatus::Healthy,
            }
        };

        SubscriberHealth {
            status,
            version: self.inner.current_version(),
            last_update_age,
            consecutive_failures: state.consecutive_failures,
            authority_id: state.snapshot_authority.clone(),
        }
    }

    /// Fail with `StaleRegistry` when the snapshot was last confirmed more than `max_age` ago
    pub fn check_freshness(&self, max_age: Duration) -> Result<()> {
        let since = self.inner.state().last_update.unwrap_or(self.inner.created_at);
        let age = since.elapsed();
        if age > max_age {
            return Err(ClusterError::StaleRegistry {
                version: self.inner.current_version(),
                age_ms: u64::try_from(age.as_millis()).unwrap_or(u64::MAX),
            });
        }
        Ok(())
    }

    pub fn debug_string(&self) -> String {
        let health = self.health();
        let snapshot = self.snapshot();
        format!(
            "MembershipClient(id={}, authority={}, status={}, version={}, services={}, registrations={}, failures={})",
            self.inner.subscriber_id,
            self.inner.authority,
            health.status,
            snapshot.version(),
            snapshot.num_services(),
            snapshot.num_registrations(),
            health.consecutive_failures
        )
    }
}

impl MembershipView for MembershipClient {
    fn snapshot(&self) -> Arc<MembershipSnapshot> {
        MembershipClient::snapshot(self)
    }
}

async fn refresh_loop(
    inner: Arc<ClientInner>,
    advertised: HostAddress,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(inner.config.refresh_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = inner.refresh(&advertised) => {}
        }
    }
    tracing::debug!("Membership refresh loop stopped");
}

impl ClientInner {
    fn state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn current_version(&self) -> u64 {
        self.current.borrow().version()
    }

    fn needs_resubscribe(&self) -> bool {
        let state = self.state();
        if !state.subscribed {
            return true;
        }
        match state.last_update {
            Some(at) => at.elapsed() > self.config.stale_after(),
            None => true,
        }
    }

    async fn refresh(&self, advertised: &HostAddress) {
        if !self.needs_resubscribe() {
            return;
        }

        match self.resubscribe(advertised).await {
            Ok(()) => {
                self.state().consecutive_failures = 0;
            }
            Err(e) => {
                let failures = {
                    let mut state = self.state();
                    state.subscribed = false;
                    state.consecutive_failures += 1;
                    state.consecutive_failures
                };
                if failures == self.config.unreachable_after_failures {
                    tracing::error!(
                        "Membership authority {} unreachable after {} refresh attempts; serving cached v{}: {}",
                        self.authority,
                        failures,
                        self.current_version(),
                        e
                    );
                } else {
                    tracing::warn!("Membership refresh failed (attempt {}): {}", failures, e);
                }
            }
        }
    }

    async fn resubscribe(&self, advertised: &HostAddress) -> Result<()> {
        let request = RegisterSubscriptionRequest {
            subscriber_id: self.subscriber_id.to_string(),
            address: Some(HostPort::from(advertised)),
        };
        let response = self
            .call_authority("subscribe", |mut client| async move {
                client.register_subscription(request).await
            })
            .await?;
        self.state().subscribed = true;
        tracing::debug!(
            "Subscribed to authority {} at registry v{}",
            response.authority_id,
            response.version
        );

        let local: Vec<(ServiceId, HostAddress)> =
            self.state().local_services.iter().cloned().collect();
        for (service_id, address) in local {
            if let Err(e) = self.register_once(&service_id, &address).await {
                tracing::warn!("Failed to re-register {} for {}: {}", address, service_id, e);
            }
        }

        self.pull_snapshot().await?;
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<()> {
        let request = UnregisterSubscriptionRequest {
            subscriber_id: self.subscriber_id.to_string(),
        };
        self.call_authority("unsubscribe", |mut client| async move {
            client.unregister_subscription(request).await
        })
        .await?;
        Ok(())
    }

    async fn pull_snapshot(&self) -> Result<bool> {
        let request = GetSnapshotRequest {
            subscriber_id: self.subscriber_id.to_string(),
        };
        let update = self
            .call_authority("fetch snapshot", |mut client| async move {
                client.get_snapshot(request).await
            })
            .await?;
        self.apply_update(update)
    }

    async fn register_once(&self, service_id: &ServiceId, address: &HostAddress) -> Result<u64> {
        let request = RegisterServiceRequest {
            service_id: service_id.to_string(),
            address: Some(HostPort::from(address)),
            subscriber_id: self.subscriber_id.to_string(),
        };
        let response = self
            .call_authority("register service", |mut client| async move {
                client.register_service(request).await
            })
            .await?;

        if response.status() != RegistrationStatus::Ok {
            return Err(ClusterError::registration_rejected(response.message));
        }
        version_from_proto(response.version)
    }

    async fn unregister_once(&self, service_id: &ServiceId, address: &HostAddress) -> Result<u64> {
        let request = UnregisterServiceRequest {
            service_id: service_id.to_string(),
            address: Some(HostPort::from(address)),
        };
        let response = self
            .call_authority("unregister service", |mut client| async move {
                client.unregister_service(request).await
            })
            .await?;

        if response.status() != RegistrationStatus::Ok {
            return Err(ClusterError::registration_rejected(response.message));
        }
        version_from_proto(response.version)
    }

    /// One RPC to the authority over a pooled channel, bounded by the RPC timeout
    async fn call_authority<T, F, Fut>(&self, operation: &str, call: F) -> Result<T>
    where
        F: FnOnce(StateStoreClient<Channel>) -> Fut,
        Fut: Future<Output = std::result::Result<Response<T>, Status>>,
    {
        with_timeout(self.config.rpc_timeout(), operation, async {
            let mut handle = self.pool.get_connection(&self.authority).await?;
            let client = StateStoreClient::new(handle.get().clone());

            match call(client).await {
                Ok(response) => {
                    self.pool.release_connection(handle);
                    Ok(response.into_inner())
                }
                Err(status) => {
                    if matches!(
                        status.code(),
                        Code::Unavailable | Code::Unknown | Code::Cancelled | Code::DeadlineExceeded
                    ) {
                        handle.mark_defective();
                    }
                    self.pool.release_connection(handle);
                    Err(status.into())
                }
            }
        })
        .await
    }

    /// Install `update` unless it is older than the cached snapshot of the same authority.
    ///
    /// Returns whether the cached snapshot was replaced.
    fn apply_update(&self, update: MembershipUpdate) -> Result<bool> {
        let authority_id = update.authority_id.clone();
        let snapshot = snapshot_from_proto(update)?;
        let version = snapshot.version();

        let mut state = self.state();
        let now = Instant::now();
        let same_authority = state.snapshot_authority.as_deref() == Some(authority_id.as_str());

        if same_authority && version <= self.current_version() {
            // Still proves the authority is alive
            state.last_update = Some(now);
            return Ok(false);
        }

        if !same_authority {
            if let Some(previous) = &state.snapshot_authority {
                tracing::info!(
                    "Membership authority changed from {} to {}; accepting v{}",
                    previous,
                    authority_id,
                    version
                );
            }
        }

        state.snapshot_authority = Some(authority_id);
        state.last_update = Some(now);
        state.consecutive_failures = 0;
        self.current.send_replace(Arc::new(snapshot));
        tracing::debug!("Applied membership snapshot v{}", version);
        Ok(true)
    }
}

struct UpdateService {
    inner: Arc<ClientInner>,
}

#[tonic::async_trait]
impl StateSubscriber for UpdateService {
    async fn update_state(
        &self,
        request: Request<MembershipUpdate>,
    ) -> std::result::Result<Response<UpdateStateResponse>, Status> {
        let applied = self
            .inner
            .apply_update(request.into_inner())
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        Ok(Response::new(UpdateStateResponse {
            applied,
            version: version_to_proto(self.inner.current_version()),
        }))
    }
}
