//! Cluster configuration management

use crate::error::{ClusterError, Result};
use crate::retry::RetryPolicy;
use crate::types::{HostAddress, ServiceId};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix for overrides, e.g. `FLEET__AUTHORITY__BROADCAST_INTERVAL_MS`
pub const ENV_PREFIX: &str = "FLEET";

/// Main cluster configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Membership authority (state store) settings
    pub authority: AuthorityConfig,

    /// Membership client (subscription manager) settings
    pub subscriber: SubscriberConfig,

    /// Connection pool (client cache) settings
    pub pool: PoolConfig,

    /// Scheduler settings
    pub scheduler: SchedulerConfig,
}

/// Settings for the membership authority
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorityConfig {
    /// Address the authority binds to; `start(port)` overrides the port
    pub bind_address: SocketAddr,

    /// Interval between snapshot broadcasts
    pub broadcast_interval_ms: u64,

    /// Bound on a single snapshot push to one subscriber.
    ///
    /// May exceed the broadcast interval: a subscriber whose push is still
    /// pending is skipped on later ticks until it completes or times out.
    pub update_timeout_ms: u64,

    /// Consecutive failed pushes before a subscription is dropped (0 keeps it forever)
    pub failure_threshold: u32,

    /// Also deregister the services owned by a dropped subscriber
    pub evict_on_failure: bool,

    /// How long `stop()` waits for background tasks
    pub shutdown_timeout_ms: u64,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], 24000)),
            broadcast_interval_ms: 500,
            update_timeout_ms: 1000,
            failure_threshold: 5,
            evict_on_failure: false,
            shutdown_timeout_ms: 2000,
        }
    }
}

impl AuthorityConfig {
    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast_interval_ms)
    }

    pub fn update_timeout(&self) -> Duration {
        Duration::from_millis(self.update_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Settings for a membership client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriberConfig {
    /// `host:port` of the membership authority
    pub authority_address: String,

    /// Address of this client's update endpoint (port 0 picks a free port)
    pub bind_address: SocketAddr,

    /// Host name announced to the authority for pushes; defaults to the bind IP
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advertise_host: Option<String>,

    /// Interval of the background refresh loop
    pub refresh_interval_ms: u64,

    /// Age after which the cached snapshot counts as stale and is re-fetched
    pub stale_after_ms: u64,

    /// Per-call RPC timeout towards the authority
    pub rpc_timeout_ms: u64,

    /// Attempts for `register_service` before giving up
    pub registration_attempts: u32,

    /// First retry delay; doubles per attempt
    pub initial_backoff_ms: u64,

    /// Upper bound on the retry delay
    pub max_backoff_ms: u64,

    /// Consecutive refresh failures before health reports the authority unreachable
    pub unreachable_after_failures: u32,

    /// How long `stop()` waits for background tasks
    pub shutdown_timeout_ms: u64,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            authority_address: "127.0.0.1:24000".to_string(),
            bind_address: SocketAddr::from(([127, 0, 0, 1], 0)),
            advertise_host: None,
            refresh_interval_ms: 1000,
            stale_after_ms: 5000,
            rpc_timeout_ms: 5000,
            registration_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 2000,
            unreachable_after_failures: 3,
            shutdown_timeout_ms: 2000,
        }
    }
}

impl SubscriberConfig {
    /// Config pointing at an authority, everything else default
    pub fn for_authority(authority: &HostAddress) -> Self {
        Self {
            authority_address: authority.to_string(),
            ..Self::default()
        }
    }

    pub fn authority(&self) -> Result<HostAddress> {
        self.authority_address.parse()
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Retry policy applied to registration calls
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.registration_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            jitter: true,
        }
    }
}

/// Settings for the connection pool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of connections to one host, idle or in use
    pub max_connections_per_host: usize,

    /// Bound on establishing one connection
    pub connect_timeout_ms: u64,

    /// Connection attempts before `get_connection` fails
    pub connect_attempts: u32,

    /// Bound on waiting for a free slot when the host is at capacity
    pub acquire_timeout_ms: u64,

    /// Idle connections older than this are closed on checkout
    pub max_idle_ms: u64,

    /// Per-request timeout set on pooled gRPC channels
    pub rpc_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_host: 8,
            connect_timeout_ms: 2000,
            connect_attempts: 3,
            acquire_timeout_ms: 5000,
            max_idle_ms: 300_000,
            rpc_timeout_ms: 5000,
        }
    }
}

impl PoolConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn max_idle(&self) -> Duration {
        Duration::from_millis(self.max_idle_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

/// Settings for the coordinator's scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Service the scheduler places work on
    pub service_id: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            service_id: "exec".to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn service_id(&self) -> ServiceId {
        ServiceId::new(self.service_id.clone())
    }
}

impl ClusterConfig {
    /// Load configuration from a TOML file, then apply `FLEET__*` environment overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ClusterError::configuration(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Toml))
            .add_source(env_source())
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> Result<Self> {
        let settings = config::Config::builder().add_source(env_source()).build()?;
        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| {
            ClusterError::configuration(format!("Failed to serialize config: {}", e))
        })?;

        std::fs::write(path, content).map_err(|e| {
            ClusterError::configuration(format!("Failed to write config file: {}", e))
        })?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let authority = &self.authority;
        if authority.broadcast_interval_ms == 0 {
            return Err(ClusterError::configuration(
                "Broadcast interval must be greater than zero",
            ));
        }
        if authority.update_timeout_ms == 0 {
            return Err(ClusterError::configuration(
                "Update timeout must be greater than zero",
            ));
        }

        let subscriber = &self.subscriber;
        subscriber.authority()?;
        if subscriber.refresh_interval_ms == 0 || subscriber.rpc_timeout_ms == 0 {
            return Err(ClusterError::configuration(
                "Refresh interval and RPC timeout must be greater than zero",
            ));
        }
        if subscriber.stale_after_ms < subscriber.refresh_interval_ms {
            return Err(ClusterError::configuration(
                "stale_after_ms must be at least refresh_interval_ms",
            ));
        }
        if subscriber.registration_attempts == 0 {
            return Err(ClusterError::configuration(
                "Registration attempts must be at least 1",
            ));
        }
        if subscriber.max_backoff_ms < subscriber.initial_backoff_ms {
            return Err(ClusterError::configuration(
                "max_backoff_ms must be at least initial_backoff_ms",
            ));
        }

        let pool = &self.pool;
        if pool.max_connections_per_host == 0 {
            return Err(ClusterError::configuration(
                "Connection pool size cap must be at least 1",
            ));
        }
        if pool.connect_attempts == 0 {
            return Err(ClusterError::configuration(
                "Connect attempts must be at least 1",
            ));
        }
        if pool.connect_timeout_ms == 0 || pool.acquire_timeout_ms == 0 || pool.rpc_timeout_ms == 0
        {
            return Err(ClusterError::configuration(
                "Connection pool timeouts must be greater than zero",
            ));
        }

        if self.scheduler.service_id.is_empty() {
            return Err(ClusterError::configuration(
                "Scheduler service id cannot be empty",
            ));
        }

        Ok(())
    }
}

fn env_source() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(true)
}
