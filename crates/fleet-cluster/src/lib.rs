//! Fleet Cluster Membership
//!
//! This crate provides service registration, membership distribution and
//! locality-aware scheduling for a cluster of query-execution backends.
//!
//! A single [`MembershipAuthority`] owns the registry of which hosts offer
//! which services and pushes versioned snapshots to every subscribed
//! [`MembershipClient`]. Coordinators place work through a [`Scheduler`]
//! reading the client's cached snapshot, and reach remote hosts through a
//! [`ConnectionPool`].

pub mod authority;
pub mod config;
pub mod env;
pub mod error;
pub mod pool;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod subscriber;
pub mod testenv;
pub mod types;
pub mod view;
pub mod wire;

pub use authority::{MembershipAuthority, Subscription};
pub use config::{AuthorityConfig, ClusterConfig, PoolConfig, SchedulerConfig, SubscriberConfig};
pub use env::{ExecEnv, ExecRole};
pub use error::{ClusterError, Result};
pub use pool::{
    ChannelConnector, ConnectionPool, Connector, HostPoolStats, PoolStats, PooledConnection,
};
pub use registry::ServiceRegistry;
pub use retry::{poll_until, retry_with_backoff, wait_for_server, with_timeout, RetryPolicy};
pub use scheduler::{Scheduler, SchedulerStats, SimpleScheduler};
pub use subscriber::{HealthStatus, MembershipClient, SubscriberHealth};
pub use testenv::{wait_for_hosts, TestCluster};
pub use types::{
    Assignment, HostAddress, HostSet, MembershipSnapshot, Registration, ServiceId, SubscriberId,
    WorkItem, WorkItemId,
};
pub use view::{MembershipView, StaticMembership};

/// Service id under which backends register their execution service
pub const EXEC_SERVICE_ID: &str = "exec";
