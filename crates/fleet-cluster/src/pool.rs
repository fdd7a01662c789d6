//! Keyed connection pooling ("client cache")
//!
//! Keeps already-connected RPC clients per remote host so schedulers,
//! the authority and query execution do not pay connection setup on every
//! call. Each host has its own cap; handles that failed during use are
//! closed instead of being pooled again.

use crate::config::PoolConfig;
use crate::error::{ClusterError, Result};
use crate::retry::{retry_with_backoff, with_timeout, RetryPolicy};
use crate::types::HostAddress;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{timeout, Instant};
use tonic::transport::{Channel, Endpoint};

/// Pause between connection attempts to one host
const CONNECT_RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Opens connections for the pool
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: Send + 'static;

    async fn connect(&self, address: &HostAddress) -> Result<Self::Connection>;
}

/// Opens eager gRPC channels with connect and per-request timeouts
#[derive(Debug, Clone)]
pub struct ChannelConnector {
    connect_timeout: Duration,
    rpc_timeout: Duration,
}

impl ChannelConnector {
    pub fn new(connect_timeout: Duration, rpc_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            rpc_timeout,
        }
    }

    pub fn from_config(config: &PoolConfig) -> Self {
        Self::new(config.connect_timeout(), config.rpc_timeout())
    }
}

#[async_trait]
impl Connector for ChannelConnector {
    type Connection = Channel;

    async fn connect(&self, address: &HostAddress) -> Result<Channel> {
        let endpoint = Endpoint::from_shared(address.endpoint_uri())
            .map_err(|e| ClusterError::invalid_address(format!("{}: {}", address, e)))?
            .connect_timeout(self.connect_timeout)
            .timeout(self.rpc_timeout);

        let channel = endpoint.connect().await.map_err(|e| {
            ClusterError::connectivity(format!("Failed to connect to {}: {}", address, e))
        })?;
        Ok(channel)
    }
}

struct IdleConnection<T> {
    connection: T,
    created_at: Instant,
    idle_since: Instant,
}

#[derive(Default)]
struct HostCounters {
    created: AtomicU64,
    reused: AtomicU64,
    evicted: AtomicU64,
    failed: AtomicU64,
}

struct HostPool<T> {
    idle: Mutex<Vec<IdleConnection<T>>>,
    permits: Arc<Semaphore>,
    counters: HostCounters,
}

impl<T> HostPool<T> {
    fn new(max_connections: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            permits: Arc::new(Semaphore::new(max_connections)),
            counters: HostCounters::default(),
        }
    }

    fn idle(&self) -> MutexGuard<'_, Vec<IdleConnection<T>>> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Most recently used connection that has not idled past `max_idle`
    fn take_idle(&self, max_idle: Duration) -> Option<IdleConnection<T>> {
        let mut idle = self.idle();
        while let Some(candidate) = idle.pop() {
            if candidate.idle_since.elapsed() <= max_idle {
                return Some(candidate);
            }
            self.counters.evicted.fetch_add(1, Ordering::Relaxed);
        }
        None
    }
}

/// A connection checked out of the pool.
///
/// Hand it back with [`ConnectionPool::release_connection`]; a handle that is
/// simply dropped closes its connection.
pub struct PooledConnection<T> {
    connection: T,
    address: HostAddress,
    created_at: Instant,
    defective: bool,
    permit: OwnedSemaphorePermit,
}

impl<T> PooledConnection<T> {
    pub fn address(&self) -> &HostAddress {
        &self.address
    }

    pub fn get(&self) -> &T {
        &self.connection
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.connection
    }

    /// Flag the connection as broken so release closes it
    pub fn mark_defective(&mut self) {
        self.defective = true;
    }

    pub fn is_defective(&self) -> bool {
        self.defective
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

impl<T> Deref for PooledConnection<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.connection
    }
}

/// Occupancy of one host's pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPoolStats {
    pub idle: usize,
    pub in_use: usize,
    pub created: u64,
    pub reused: u64,
    pub evicted: u64,
    pub failed: u64,
}

/// Pool statistics
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub hosts: BTreeMap<HostAddress, HostPoolStats>,
    pub max_connections_per_host: usize,
}

/// Pool of reusable connections keyed by remote host
pub struct ConnectionPool<C: Connector> {
    connector: C,
    hosts: DashMap<HostAddress, Arc<HostPool<C::Connection>>>,
    config: PoolConfig,
}

impl ConnectionPool<ChannelConnector> {
    /// Pool of gRPC channels
    pub fn channels(config: PoolConfig) -> Self {
        let connector = ChannelConnector::from_config(&config);
        Self::new(connector, config)
    }
}

impl<C: Connector> ConnectionPool<C> {
    pub fn new(connector: C, config: PoolConfig) -> Self {
        Self {
            connector,
            hosts: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn host_pool(&self, address: &HostAddress) -> Arc<HostPool<C::Connection>> {
        if let Some(existing) = self.hosts.get(address) {
            return existing.clone();
        }
        self.hosts
            .entry(address.clone())
            .or_insert_with(|| Arc::new(HostPool::new(self.config.max_connections_per_host)))
            .clone()
    }

    /// Check out a connection to `address`, reusing an idle one when possible.
    ///
    /// Waits at most `acquire_timeout` for a free slot when the host is at its
    /// cap, then makes up to `connect_attempts` connection attempts.
    pub async fn get_connection(
        &self,
        address: &HostAddress,
    ) -> Result<PooledConnection<C::Connection>> {
        let host = self.host_pool(address);

        let permit = match timeout(
            self.config.acquire_timeout(),
            host.permits.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(ClusterError::connectivity(format!(
                    "Connection pool for {} is closed",
                    address
                )))
            }
            Err(_) => {
                return Err(ClusterError::timeout(format!(
                    "No free connection to {} within {:?} (cap {})",
                    address,
                    self.config.acquire_timeout(),
                    self.config.max_connections_per_host
                )))
            }
        };

        if let Some(idle) = host.take_idle(self.config.max_idle()) {
            host.counters.reused.fetch_add(1, Ordering::Relaxed);
            return Ok(PooledConnection {
                connection: idle.connection,
                address: address.clone(),
                created_at: idle.created_at,
                defective: false,
                permit,
            });
        }

        match self.connect(address).await {
            Ok(connection) => {
                host.counters.created.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Opened new connection to {}", address);
                Ok(PooledConnection {
                    connection,
                    address: address.clone(),
                    created_at: Instant::now(),
                    defective: false,
                    permit,
                })
            }
            Err(e) => {
                host.counters.failed.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    async fn connect(&self, address: &HostAddress) -> Result<C::Connection> {
        let attempts = self.config.connect_attempts;
        let policy = RetryPolicy {
            max_attempts: attempts,
            initial_backoff: CONNECT_RETRY_BACKOFF,
            max_backoff: CONNECT_RETRY_BACKOFF * 4,
            jitter: true,
        };
        let connect_timeout = self.config.connect_timeout();
        let operation = format!("connect to {}", address);

        retry_with_backoff(&policy, &operation, || {
            with_timeout(connect_timeout, &operation, self.connector.connect(address))
        })
        .await
        .map_err(|e| match e {
            ClusterError::Connectivity(_) | ClusterError::Timeout(_) | ClusterError::Io(_) => {
                ClusterError::connectivity(format!(
                    "Unable to connect to {} after {} attempts: {}",
                    address, attempts, e
                ))
            }
            other => other,
        })
    }

    /// Return a handle to the idle pool; defective handles are closed instead.
    pub fn release_connection(&self, handle: PooledConnection<C::Connection>) {
        let PooledConnection {
            connection,
            address,
            created_at,
            defective,
            permit,
        } = handle;

        let Some(host) = self.hosts.get(&address).map(|entry| entry.clone()) else {
            return;
        };

        if defective {
            host.counters.evicted.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Closing defective connection to {}", address);
            drop(connection);
        } else {
            host.idle().push(IdleConnection {
                connection,
                created_at,
                idle_since: Instant::now(),
            });
        }
        drop(permit);
    }

    /// Close the idle connections to one host; returns how many were closed
    pub fn close_idle(&self, address: &HostAddress) -> usize {
        let Some(host) = self.hosts.get(address).map(|entry| entry.clone()) else {
            return 0;
        };
        let closed = host.idle().drain(..).count();
        host.counters
            .evicted
            .fetch_add(closed as u64, Ordering::Relaxed);
        closed
    }

    /// Close the idle connections to `address` and forget the host once none are checked out.
    ///
    /// Returns whether the host entry was removed.
    pub fn remove_host(&self, address: &HostAddress) -> bool {
        self.close_idle(address);
        let cap = self.config.max_connections_per_host;
        let removed = self
            .hosts
            .remove_if(address, |_, host| host.permits.available_permits() == cap)
            .is_some();
        if removed {
            tracing::debug!("Removed connection pool for {}", address);
        }
        removed
    }

    /// Close every idle connection and drop hosts with nothing checked out
    pub fn clear(&self) {
        let cap = self.config.max_connections_per_host;
        self.hosts.retain(|_, host| {
            let closed = host.idle().drain(..).count();
            host.counters
                .evicted
                .fetch_add(closed as u64, Ordering::Relaxed);
            host.permits.available_permits() < cap
        });
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        let cap = self.config.max_connections_per_host;
        let hosts = self
            .hosts
            .iter()
            .map(|entry| {
                let host = entry.value();
                let stats = HostPoolStats {
                    idle: host.idle().len(),
                    in_use: cap.saturating_sub(host.permits.available_permits()),
                    created: host.counters.created.load(Ordering::Relaxed),
                    reused: host.counters.reused.load(Ordering::Relaxed),
                    evicted: host.counters.evicted.load(Ordering::Relaxed),
                    failed: host.counters.failed.load(Ordering::Relaxed),
                };
                (entry.key().clone(), stats)
            })
            .collect();

        PoolStats {
            hosts,
            max_connections_per_host: cap,
        }
    }

    /// Human-readable dump of pool occupancy for operational tooling
    pub fn debug_string(&self) -> String {
        let stats = self.stats();
        let mut out = format!(
            "ConnectionPool(hosts={}, max_per_host={})",
            stats.hosts.len(),
            stats.max_connections_per_host
        );
        for (address, host) in &stats.hosts {
            let _ = write!(
                out,
                "\n  {}: idle={} in_use={} created={} reused={} evicted={} failed={}",
                address,
                host.idle,
                host.in_use,
                host.created,
                host.reused,
                host.evicted,
                host.failed
            );
        }
        out
    }
}
