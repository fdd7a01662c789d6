//! Membership authority ("state store")
//!
//! Owns the [`ServiceRegistry`], accepts registrations and subscriptions over
//! gRPC and pushes the latest snapshot to every subscriber once per broadcast
//! interval. Each subscriber has at most one push in flight; a subscriber
//! whose previous push has not finished is skipped for that tick, so a slow
//! one never delays the others. Subscribers that keep failing are dropped;
//! with `evict_on_failure` their registrations go with them.

use crate::config::{AuthorityConfig, PoolConfig};
use crate::error::{ClusterError, Result};
use crate::pool::{ChannelConnector, ConnectionPool};
use crate::registry::ServiceRegistry;
use crate::retry::with_timeout;
use crate::types::{HostAddress, ServiceId, SubscriberId};
use crate::wire::proto::{
    GetSnapshotRequest, MembershipUpdate, RegisterServiceRequest, RegisterServiceResponse,
    RegisterSubscriptionRequest, RegisterSubscriptionResponse, RegistrationStatus,
    UnregisterServiceRequest, UnregisterServiceResponse, UnregisterSubscriptionRequest,
    UnregisterSubscriptionResponse,
};
use crate::wire::{
    require_address, snapshot_to_proto, version_from_proto, version_to_proto, StateStore,
    StateStoreServer, StateSubscriberClient,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use uuid::Uuid;

/// A subscriber the authority pushes snapshots to
#[derive(Debug, Clone)]
pub struct Subscription {
    pub subscriber_id: SubscriberId,
    pub address: HostAddress,
    pub consecutive_failures: u32,
    pub last_acked_version: Option<u64>,
    pub subscribed_at: DateTime<Utc>,
    pub push_in_flight: bool,
}

struct AuthorityInner {
    authority_id: String,
    config: AuthorityConfig,
    registry: ServiceRegistry,
    subscriptions: DashMap<SubscriberId, Subscription>,
    pool: ConnectionPool<ChannelConnector>,
}

struct Running {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    tasks: JoinSet<()>,
}

/// The single membership authority of a cluster
pub struct MembershipAuthority {
    inner: Arc<AuthorityInner>,
    running: Mutex<Option<Running>>,
}

impl MembershipAuthority {
    pub fn new(config: AuthorityConfig, pool_config: PoolConfig) -> Self {
        let inner = AuthorityInner {
            authority_id: Uuid::new_v4().to_string(),
            config,
            registry: ServiceRegistry::new(),
            subscriptions: DashMap::new(),
            pool: ConnectionPool::channels(pool_config),
        };

        Self {
            inner: Arc::new(inner),
            running: Mutex::new(None),
        }
    }

    fn lock_running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Bind the gRPC endpoint on `port` (0 picks a free one) and start broadcasting.
    ///
    /// Returns the bound address.
    pub async fn start(&self, port: u16) -> Result<SocketAddr> {
        if self.lock_running().is_some() {
            return Err(ClusterError::AlreadyStarted);
        }

        let mut bind_address = self.inner.config.bind_address;
        bind_address.set_port(port);
        let listener = TcpListener::bind(bind_address).await.map_err(|e| {
            ClusterError::connectivity(format!(
                "Failed to bind membership authority to {}: {}",
                bind_address, e
            ))
        })?;
        let local_addr = listener.local_addr()?;

        let mut running = self.lock_running();
        if running.is_some() {
            return Err(ClusterError::AlreadyStarted);
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();

        let service = StateStoreService {
            inner: self.inner.clone(),
        };
        let mut server_shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            let result = Server::builder()
                .add_service(StateStoreServer::new(service))
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                    let _ = server_shutdown.wait_for(|stop| *stop).await;
                })
                .await;
            if let Err(e) = result {
                tracing::error!("Membership authority server error: {}", e);
            }
        });

        tasks.spawn(broadcast_loop(self.inner.clone(), shutdown_rx));

        tracing::info!(
            "Membership authority {} listening on {} (broadcast every {:?})",
            self.inner.authority_id,
            local_addr,
            self.inner.config.broadcast_interval()
        );

        *running = Some(Running {
            local_addr,
            shutdown,
            tasks,
        });
        Ok(local_addr)
    }

    /// Stop serving and broadcasting; idempotent.
    pub async fn stop(&self) {
        let Some(mut running) = self.lock_running().take() else {
            return;
        };

        tracing::info!("Stopping membership authority on {}", running.local_addr);
        let _ = running.shutdown.send(true);

        let drained = timeout(self.inner.config.shutdown_timeout(), async {
            while running.tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!("Membership authority tasks did not stop in time; aborting");
            running.tasks.shutdown().await;
        }

        self.inner.pool.clear();
    }

    pub fn is_running(&self) -> bool {
        self.lock_running().is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock_running().as_ref().map(|running| running.local_addr)
    }

    /// Identity of this authority instance, sent with every snapshot
    pub fn authority_id(&self) -> &str {
        &self.inner.authority_id
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.inner.registry
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscriptions.len()
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.inner
            .subscriptions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Push the current snapshot to every idle subscriber and wait for the pushes.
    ///
    /// Returns the number of subscribers pushed to.
    pub async fn broadcast_now(&self) -> usize {
        let mut pushes = JoinSet::new();
        let started = self.inner.spawn_pushes(&mut pushes);
        while pushes.join_next().await.is_some() {}
        started
    }

    /// Pool of push channels, keyed by subscriber address
    pub fn pool(&self) -> &ConnectionPool<ChannelConnector> {
        &self.inner.pool
    }

    pub fn debug_string(&self) -> String {
        let snapshot = self.inner.registry.snapshot();
        let address = self
            .local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "stopped".to_string());

        let mut out = format!(
            "MembershipAuthority(id={}, addr={}, version={}, registrations={}, subscribers={})",
            self.inner.authority_id,
            address,
            snapshot.version(),
            snapshot.num_registrations(),
            self.inner.subscriptions.len()
        );
        for (service_id, hosts) in snapshot.entries() {
            let hosts: Vec<String> = hosts.iter().map(ToString::to_string).collect();
            let _ = write!(out, "\n  service {}: [{}]", service_id, hosts.join(", "));
        }
        for subscription in self.subscriptions() {
            let acked = subscription
                .last_acked_version
                .map(|v| format!("v{}", v))
                .unwrap_or_else(|| "-".to_string());
            let _ = write!(
                out,
                "\n  subscriber {} at {}: acked={} failures={}",
                subscription.subscriber_id,
                subscription.address,
                acked,
                subscription.consecutive_failures
            );
        }
        out
    }
}

async fn broadcast_loop(inner: Arc<AuthorityInner>, mut shutdown: watch::Receiver<bool>) {
    // First push one full period after start; new subscribers pull on subscribe
    let period = inner.config.broadcast_interval();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut pushes = JoinSet::new();
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                inner.spawn_pushes(&mut pushes);
            }
            Some(joined) = pushes.join_next(), if !pushes.is_empty() => {
                if let Err(e) = joined {
                    tracing::error!("Snapshot push task failed: {}", e);
                }
            }
        }
    }
    pushes.shutdown().await;
    tracing::debug!("Membership broadcast loop stopped");
}

/// Clears a subscriber's in-flight flag when its push finishes or is aborted
struct PushGuard {
    inner: Arc<AuthorityInner>,
    subscriber_id: SubscriberId,
    address: HostAddress,
}

impl Drop for PushGuard {
    fn drop(&mut self) {
        match self.inner.subscriptions.get_mut(&self.subscriber_id) {
            Some(mut subscription) => subscription.push_in_flight = false,
            None => {
                // Unsubscribed while the push was running
                self.inner.pool.remove_host(&self.address);
            }
        }
    }
}

impl AuthorityInner {
    /// Start one push per subscriber that has none in flight; returns how many started.
    fn spawn_pushes(self: &Arc<Self>, pushes: &mut JoinSet<()>) -> usize {
        let mut targets = Vec::new();
        let mut busy = 0;
        for mut entry in self.subscriptions.iter_mut() {
            if entry.push_in_flight {
                busy += 1;
                continue;
            }
            entry.push_in_flight = true;
            targets.push((*entry.key(), entry.address.clone()));
        }
        if busy > 0 {
            tracing::debug!("Skipping {} subscribers with a push still in flight", busy);
        }
        if targets.is_empty() {
            return 0;
        }

        let snapshot = self.registry.snapshot();
        let update = snapshot_to_proto(&snapshot, &self.authority_id);
        tracing::debug!(
            "Broadcasting membership v{} to {} subscribers",
            snapshot.version(),
            targets.len()
        );

        let started = targets.len();
        for (subscriber_id, address) in targets {
            let guard = PushGuard {
                inner: self.clone(),
                subscriber_id,
                address: address.clone(),
            };
            let update = update.clone();
            pushes.spawn(async move {
                let inner = &guard.inner;
                match inner.push(&address, update).await {
                    Ok(acked) => inner.record_success(&subscriber_id, acked),
                    Err(e) => inner.record_failure(&subscriber_id, &address, &e),
                }
                drop(guard);
            });
        }
        started
    }

    async fn push(&self, address: &HostAddress, update: MembershipUpdate) -> Result<u64> {
        let operation = format!("snapshot push to {}", address);
        with_timeout(self.config.update_timeout(), &operation, async {
            let mut handle = self.pool.get_connection(address).await?;
            let mut client = StateSubscriberClient::new(handle.get().clone());

            match client.update_state(update).await {
                Ok(response) => {
                    self.pool.release_connection(handle);
                    let response = response.into_inner();
                    version_from_proto(response.version)
                }
                Err(status) => {
                    handle.mark_defective();
                    self.pool.release_connection(handle);
                    Err(status.into())
                }
            }
        })
        .await
    }

    fn record_success(&self, subscriber_id: &SubscriberId, acked: u64) {
        if let Some(mut subscription) = self.subscriptions.get_mut(subscriber_id) {
            subscription.consecutive_failures = 0;
            subscription.last_acked_version = Some(acked);
        }
    }

    fn record_failure(
        &self,
        subscriber_id: &SubscriberId,
        address: &HostAddress,
        error: &ClusterError,
    ) {
        let failures = match self.subscriptions.get_mut(subscriber_id) {
            // Re-subscribed from elsewhere while the push was in flight
            Some(subscription) if subscription.address != *address => return,
            Some(mut subscription) => {
                subscription.consecutive_failures += 1;
                subscription.consecutive_failures
            }
            None => return,
        };
        tracing::warn!(
            "Failed to push membership to subscriber {} at {} ({} consecutive): {}",
            subscriber_id,
            address,
            failures,
            error
        );

        let threshold = self.config.failure_threshold;
        if threshold == 0 || failures < threshold {
            return;
        }

        self.subscriptions.remove(subscriber_id);
        self.pool.remove_host(address);
        tracing::warn!(
            "Dropped subscription {} after {} failed updates",
            subscriber_id,
            failures
        );

        if self.config.evict_on_failure {
            let (removed, version) = self.registry.remove_owned_by(subscriber_id);
            if removed > 0 {
                tracing::info!(
                    "Evicted {} registrations of unreachable subscriber {} (now v{})",
                    removed,
                    subscriber_id,
                    version
                );
            }
        }
    }
}

struct StateStoreService {
    inner: Arc<AuthorityInner>,
}

impl StateStoreService {
    fn rejected_registration(&self, message: String) -> RegisterServiceResponse {
        tracing::warn!("Rejected service registration: {}", message);
        let mut response = RegisterServiceResponse {
            version: version_to_proto(self.inner.registry.version()),
            status: 0,
            message,
        };
        response.set_status(RegistrationStatus::Error);
        response
    }
}

fn parse_subscriber(raw: &str) -> std::result::Result<Option<SubscriberId>, String> {
    if raw.is_empty() {
        return Ok(None);
    }
    SubscriberId::from_string(raw)
        .map(Some)
        .map_err(|e| format!("invalid subscriber id '{}': {}", raw, e))
}

#[tonic::async_trait]
impl StateStore for StateStoreService {
    async fn register_service(
        &self,
        request: Request<RegisterServiceRequest>,
    ) -> std::result::Result<Response<RegisterServiceResponse>, Status> {
        let req = request.into_inner();

        if req.service_id.is_empty() {
            return Ok(Response::new(
                self.rejected_registration("empty service id".to_string()),
            ));
        }
        let address = match require_address(req.address) {
            Ok(address) => address,
            Err(status) => {
                return Ok(Response::new(
                    self.rejected_registration(status.message().to_string()),
                ))
            }
        };
        if address.is_any_port() {
            return Ok(Response::new(
                self.rejected_registration(format!("port 0 is not a live endpoint: {}", address)),
            ));
        }
        let owner = match parse_subscriber(&req.subscriber_id) {
            Ok(owner) => owner,
            Err(message) => return Ok(Response::new(self.rejected_registration(message))),
        };

        let version = self
            .inner
            .registry
            .register_owned(ServiceId::new(req.service_id), address, owner);

        let mut response = RegisterServiceResponse {
            version: version_to_proto(version),
            status: 0,
            message: String::new(),
        };
        response.set_status(RegistrationStatus::Ok);
        Ok(Response::new(response))
    }

    async fn unregister_service(
        &self,
        request: Request<UnregisterServiceRequest>,
    ) -> std::result::Result<Response<UnregisterServiceResponse>, Status> {
        let req = request.into_inner();

        let mut response = UnregisterServiceResponse {
            version: 0,
            status: 0,
            message: String::new(),
        };
        match require_address(req.address) {
            Ok(address) if !req.service_id.is_empty() => {
                let version = self
                    .inner
                    .registry
                    .deregister(&ServiceId::new(req.service_id), &address);
                response.version = version_to_proto(version);
                response.set_status(RegistrationStatus::Ok);
            }
            Ok(_) => {
                response.version = version_to_proto(self.inner.registry.version());
                response.message = "empty service id".to_string();
                response.set_status(RegistrationStatus::Error);
            }
            Err(status) => {
                response.version = version_to_proto(self.inner.registry.version());
                response.message = status.message().to_string();
                response.set_status(RegistrationStatus::Error);
            }
        }
        Ok(Response::new(response))
    }

    async fn register_subscription(
        &self,
        request: Request<RegisterSubscriptionRequest>,
    ) -> std::result::Result<Response<RegisterSubscriptionResponse>, Status> {
        let req = request.into_inner();

        let subscriber_id = match parse_subscriber(&req.subscriber_id) {
            Ok(Some(id)) => id,
            Ok(None) => return Err(Status::invalid_argument("Missing subscriber id")),
            Err(message) => return Err(Status::invalid_argument(message)),
        };
        let address = require_address(req.address)?;

        tracing::info!("Subscriber {} subscribed from {}", subscriber_id, address);
        let previous = self.inner.subscriptions.insert(
            subscriber_id,
            Subscription {
                subscriber_id,
                address: address.clone(),
                consecutive_failures: 0,
                last_acked_version: None,
                subscribed_at: Utc::now(),
                push_in_flight: false,
            },
        );
        if let Some(previous) = previous.filter(|previous| previous.address != address) {
            self.inner.pool.remove_host(&previous.address);
        }

        Ok(Response::new(RegisterSubscriptionResponse {
            authority_id: self.inner.authority_id.clone(),
            version: version_to_proto(self.inner.registry.version()),
        }))
    }

    async fn unregister_subscription(
        &self,
        request: Request<UnregisterSubscriptionRequest>,
    ) -> std::result::Result<Response<UnregisterSubscriptionResponse>, Status> {
        let req = request.into_inner();

        let removed = match parse_subscriber(&req.subscriber_id) {
            Ok(Some(id)) => self.inner.subscriptions.remove(&id),
            Ok(None) => None,
            Err(message) => return Err(Status::invalid_argument(message)),
        };
        let removed = match removed {
            Some((_, subscription)) => {
                self.inner.pool.remove_host(&subscription.address);
                true
            }
            None => false,
        };
        if removed {
            tracing::info!("Subscriber {} unsubscribed", req.subscriber_id);
        }

        Ok(Response::new(UnregisterSubscriptionResponse { removed }))
    }

    async fn get_snapshot(
        &self,
        _request: Request<GetSnapshotRequest>,
    ) -> std::result::Result<Response<MembershipUpdate>, Status> {
        let snapshot = self.inner.registry.snapshot();
        Ok(Response::new(snapshot_to_proto(
            &snapshot,
            &self.inner.authority_id,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::proto::{HostPort, UpdateStateResponse};
    use crate::wire::{
        snapshot_from_proto, StateStoreClient, StateSubscriber, StateSubscriberServer,
    };
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn test_config() -> AuthorityConfig {
        AuthorityConfig {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 0)),
            broadcast_interval_ms: 50,
            update_timeout_ms: 500,
            failure_threshold: 2,
            evict_on_failure: false,
            shutdown_timeout_ms: 1000,
        }
    }

    fn test_pool() -> PoolConfig {
        PoolConfig {
            connect_timeout_ms: 200,
            connect_attempts: 1,
            ..PoolConfig::default()
        }
    }

    async fn client_for(addr: SocketAddr) -> StateStoreClient<tonic::transport::Channel> {
        StateStoreClient::connect(format!("http://{}", addr))
            .await
            .unwrap()
    }

    fn register_request(service: &str, port: u32, owner: &str) -> RegisterServiceRequest {
        RegisterServiceRequest {
            service_id: service.to_string(),
            address: Some(HostPort {
                host: "127.0.0.1".to_string(),
                port,
            }),
            subscriber_id: owner.to_string(),
        }
    }

    struct RecordingSubscriber {
        updates: mpsc::UnboundedSender<MembershipUpdate>,
    }

    #[tonic::async_trait]
    impl StateSubscriber for RecordingSubscriber {
        async fn update_state(
            &self,
            request: Request<MembershipUpdate>,
        ) -> std::result::Result<Response<UpdateStateResponse>, Status> {
            let update = request.into_inner();
            let version = update.version;
            let _ = self.updates.send(update);
            Ok(Response::new(UpdateStateResponse {
                applied: true,
                version,
            }))
        }
    }

    async fn spawn_subscriber() -> (SocketAddr, mpsc::UnboundedReceiver<MembershipUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            Server::builder()
                .add_service(StateSubscriberServer::new(RecordingSubscriber { updates: tx }))
                .serve_with_incoming(TcpListenerStream::new(listener))
                .await
                .unwrap();
        });
        (addr, rx)
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let authority = MembershipAuthority::new(test_config(), test_pool());
        assert!(!authority.is_running());

        let addr = authority.start(0).await.unwrap();
        assert_eq!(authority.local_addr(), Some(addr));
        assert!(matches!(
            authority.start(0).await,
            Err(ClusterError::AlreadyStarted)
        ));

        authority.stop().await;
        assert!(!authority.is_running());
        authority.stop().await;
    }

    #[tokio::test]
    async fn test_bind_failure_is_returned() {
        let first = MembershipAuthority::new(test_config(), test_pool());
        let addr = first.start(0).await.unwrap();

        let second = MembershipAuthority::new(test_config(), test_pool());
        let result = second.start(addr.port()).await;
        assert!(matches!(result, Err(ClusterError::Connectivity(_))));
        assert!(!second.is_running());

        first.stop().await;
    }

    #[tokio::test]
    async fn test_registration_over_rpc() {
        let authority = MembershipAuthority::new(test_config(), test_pool());
        let addr = authority.start(0).await.unwrap();
        let mut client = client_for(addr).await;

        let first = client
            .register_service(register_request("exec", 22000, ""))
            .await
            .unwrap()
            .into_inner();
        let again = client
            .register_service(register_request("exec", 22000, ""))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(first.status(), RegistrationStatus::Ok);
        assert_eq!(first.version, 1);
        assert_eq!(again.version, 1);

        let rejected = client
            .register_service(register_request("", 22000, ""))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(rejected.status(), RegistrationStatus::Error);
        assert!(!rejected.message.is_empty());

        let any_port = client
            .register_service(register_request("exec", 0, ""))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(any_port.status(), RegistrationStatus::Error);
        assert_eq!(any_port.version, 1);

        let snapshot = client
            .get_snapshot(GetSnapshotRequest {
                subscriber_id: String::new(),
            })
            .await
            .unwrap()
            .into_inner();
        assert_eq!(snapshot.authority_id, authority.authority_id());
        let snapshot = snapshot_from_proto(snapshot).unwrap();
        assert_eq!(snapshot.known_hosts(&ServiceId::new("exec")).len(), 1);

        let removed = client
            .unregister_service(UnregisterServiceRequest {
                service_id: "exec".to_string(),
                address: Some(HostPort {
                    host: "127.0.0.1".to_string(),
                    port: 22000,
                }),
            })
            .await
            .unwrap()
            .into_inner();
        assert_eq!(removed.version, 2);
        assert!(authority.registry().is_empty());

        authority.stop().await;
    }

    #[tokio::test]
    async fn test_snapshots_are_pushed_to_subscribers() {
        let authority = MembershipAuthority::new(test_config(), test_pool());
        let addr = authority.start(0).await.unwrap();
        let (subscriber_addr, mut updates) = spawn_subscriber().await;
        let mut client = client_for(addr).await;

        let subscriber_id = SubscriberId::new();
        client
            .register_subscription(RegisterSubscriptionRequest {
                subscriber_id: subscriber_id.to_string(),
                address: Some(HostPort::from(&HostAddress::from(subscriber_addr))),
            })
            .await
            .unwrap();
        authority
            .registry()
            .register(ServiceId::new("exec"), HostAddress::new("127.0.0.1", 22000));

        let update = timeout(Duration::from_secs(5), async {
            loop {
                let update = updates.recv().await.unwrap();
                if update.version >= 1 {
                    return update;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(update.authority_id, authority.authority_id());
        assert_eq!(update.entries.len(), 1);

        let subscription = &authority.subscriptions()[0];
        assert_eq!(subscription.subscriber_id, subscriber_id);

        authority.stop().await;
    }

    #[tokio::test]
    async fn test_unreachable_subscriber_is_dropped_and_evicted() {
        // Broadcasts are driven by hand below
        let config = AuthorityConfig {
            broadcast_interval_ms: 60_000,
            evict_on_failure: true,
            ..test_config()
        };
        let authority = MembershipAuthority::new(config, test_pool());
        let addr = authority.start(0).await.unwrap();
        let mut client = client_for(addr).await;

        let dead_port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let subscriber_id = SubscriberId::new();
        client
            .register_subscription(RegisterSubscriptionRequest {
                subscriber_id: subscriber_id.to_string(),
                address: Some(HostPort {
                    host: "127.0.0.1".to_string(),
                    port: u32::from(dead_port),
                }),
            })
            .await
            .unwrap();
        client
            .register_service(register_request("exec", 22000, &subscriber_id.to_string()))
            .await
            .unwrap();
        // Not owned by the dead subscriber
        client
            .register_service(register_request("exec", 22001, ""))
            .await
            .unwrap();

        authority.broadcast_now().await;
        assert_eq!(authority.subscriber_count(), 1);
        authority.broadcast_now().await;
        assert_eq!(authority.subscriber_count(), 0);

        let hosts = authority
            .registry()
            .snapshot()
            .known_hosts(&ServiceId::new("exec"));
        assert_eq!(hosts.len(), 1);
        assert!(hosts.contains(&HostAddress::new("127.0.0.1", 22001)));
        assert!(authority.pool().stats().hosts.is_empty());

        authority.stop().await;
    }

    #[tokio::test]
    async fn test_silent_subscriber_does_not_slow_pushes_to_others() {
        let config = AuthorityConfig {
            broadcast_interval_ms: 50,
            update_timeout_ms: 2000,
            failure_threshold: 0,
            ..test_config()
        };
        let pool = PoolConfig {
            connect_timeout_ms: 2000,
            rpc_timeout_ms: 2000,
            ..test_pool()
        };
        let authority = MembershipAuthority::new(config, pool);
        let addr = authority.start(0).await.unwrap();
        let mut client = client_for(addr).await;

        // Accepts connections and never answers
        let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let silent_addr = silent.local_addr().unwrap();
        let holder = tokio::spawn(async move {
            let mut streams = Vec::new();
            while let Ok((stream, _)) = silent.accept().await {
                streams.push(stream);
            }
        });
        let (healthy_addr, mut updates) = spawn_subscriber().await;

        for address in [silent_addr, healthy_addr] {
            client
                .register_subscription(RegisterSubscriptionRequest {
                    subscriber_id: SubscriberId::new().to_string(),
                    address: Some(HostPort::from(&HostAddress::from(address))),
                })
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_secs(1)).await;
        let mut pushes = 0;
        while updates.try_recv().is_ok() {
            pushes += 1;
        }
        // Roughly one push per 50 ms tick
        assert!(pushes >= 8, "healthy subscriber got only {} pushes", pushes);
        assert_eq!(authority.subscriber_count(), 2);

        authority.stop().await;
        holder.abort();
    }

    #[tokio::test]
    async fn test_unsubscribe_releases_push_connections() {
        // Broadcasts are driven by hand below
        let config = AuthorityConfig {
            broadcast_interval_ms: 60_000,
            ..test_config()
        };
        let authority = MembershipAuthority::new(config, test_pool());
        let addr = authority.start(0).await.unwrap();
        let (subscriber_addr, mut updates) = spawn_subscriber().await;
        let mut client = client_for(addr).await;

        let subscriber_id = SubscriberId::new();
        client
            .register_subscription(RegisterSubscriptionRequest {
                subscriber_id: subscriber_id.to_string(),
                address: Some(HostPort::from(&HostAddress::from(subscriber_addr))),
            })
            .await
            .unwrap();
        assert_eq!(authority.broadcast_now().await, 1);
        assert!(updates.recv().await.is_some());
        assert!(authority
            .pool()
            .stats()
            .hosts
            .contains_key(&HostAddress::from(subscriber_addr)));

        let removed = client
            .unregister_subscription(UnregisterSubscriptionRequest {
                subscriber_id: subscriber_id.to_string(),
            })
            .await
            .unwrap()
            .into_inner();
        assert!(removed.removed);
        assert!(authority.pool().stats().hosts.is_empty());
        assert_eq!(authority.broadcast_now().await, 0);

        authority.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_subscription_rejected() {
        let authority = MembershipAuthority::new(test_config(), test_pool());
        let addr = authority.start(0).await.unwrap();
        let mut client = client_for(addr).await;

        let status = client
            .register_subscription(RegisterSubscriptionRequest {
                subscriber_id: "not-a-uuid".to_string(),
                address: None,
            })
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        let removed = client
            .unregister_subscription(UnregisterSubscriptionRequest {
                subscriber_id: SubscriberId::new().to_string(),
            })
            .await
            .unwrap()
            .into_inner();
        assert!(!removed.removed);

        authority.stop().await;
    }
}
