//! Integration tests for membership distribution over loopback gRPC

use fleet_cluster::wire::proto::{HostPort, RegisterSubscriptionRequest};
use fleet_cluster::wire::StateStoreClient;
use fleet_cluster::{
    poll_until, wait_for_hosts, ClusterConfig, ClusterError, HealthStatus, HostAddress,
    MembershipAuthority, MembershipClient, ServiceId, SubscriberId, TestCluster, WorkItem,
    EXEC_SERVICE_ID,
};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tracing_subscriber::fmt::try_init;

fn fast_config() -> ClusterConfig {
    let mut config = ClusterConfig::default();
    config.authority.bind_address = "127.0.0.1:0".parse().unwrap();
    config.authority.broadcast_interval_ms = 100;
    config.authority.update_timeout_ms = 300;
    config.subscriber.refresh_interval_ms = 100;
    config.subscriber.stale_after_ms = 500;
    config.subscriber.rpc_timeout_ms = 1000;
    config.subscriber.initial_backoff_ms = 20;
    config.subscriber.max_backoff_ms = 100;
    config.subscriber.shutdown_timeout_ms = 1000;
    config.pool.connect_timeout_ms = 200;
    config.pool.connect_attempts = 1;
    config
}

async fn start_authority(config: &ClusterConfig, port: u16) -> (MembershipAuthority, HostAddress) {
    let authority = MembershipAuthority::new(config.authority.clone(), config.pool.clone());
    let addr = authority.start(port).await.unwrap();
    (authority, HostAddress::from(addr))
}

async fn start_client(config: &ClusterConfig, authority: &HostAddress) -> MembershipClient {
    let mut subscriber = config.subscriber.clone();
    subscriber.authority_address = authority.to_string();
    let client = MembershipClient::new(subscriber, config.pool.clone()).unwrap();
    client.start().await.unwrap();
    client
}

fn exec() -> ServiceId {
    ServiceId::new(EXEC_SERVICE_ID)
}

fn backend(port: u16) -> HostAddress {
    HostAddress::new("127.0.0.1", port)
}

/// Three backends register; the coordinator and a late subscriber see all of them
#[tokio::test]
async fn test_end_to_end_membership() {
    let _ = try_init();

    let mut cluster = TestCluster::new(3, 0);
    cluster.start_backends().await.unwrap();

    let expected: BTreeSet<HostAddress> = cluster.backend_addresses().into_iter().collect();
    assert_eq!(expected.len(), 3);

    let scheduler = cluster.scheduler().unwrap();
    assert_eq!(scheduler.get_all_known_hosts(), expected);

    // A fourth client joining later observes the same set
    let authority = cluster.authority_address().unwrap().clone();
    let late = start_client(&ClusterConfig::default(), &authority).await;
    wait_for_hosts(&late, &exec(), 3, 100, Duration::from_millis(50))
        .await
        .unwrap();
    assert_eq!(late.get_all_known_hosts(&exec()), expected);

    // Locality is honored against the live set
    let target = expected.iter().nth(1).unwrap().clone();
    let item = WorkItem::new("scan-0").with_preferred_host(target.clone());
    assert_eq!(scheduler.schedule_one(&item).unwrap(), target);

    let dump = cluster.debug_string();
    assert!(dump.starts_with("ConnectionPool("));

    late.stop().await;
    cluster.shutdown().await;
}

/// Bootstrap fails with the expected and observed counts when a backend never shows up
#[tokio::test]
async fn test_bootstrap_timeout_names_counts() {
    let _ = try_init();

    let config = fast_config();
    let (authority, authority_addr) = start_authority(&config, 0).await;

    let registrar = start_client(&config, &authority_addr).await;
    registrar.register_service(exec(), backend(22001)).await.unwrap();
    registrar.register_service(exec(), backend(22002)).await.unwrap();

    let coordinator = start_client(&config, &authority_addr).await;
    let result = wait_for_hosts(&coordinator, &exec(), 3, 100, Duration::from_millis(50)).await;

    match result {
        Err(ClusterError::BootstrapTimeout { expected, observed }) => {
            assert_eq!(expected, 3);
            assert_eq!(observed, 2);
        }
        other => panic!("expected bootstrap timeout, got {:?}", other),
    }

    coordinator.stop().await;
    registrar.stop().await;
    authority.stop().await;
}

/// Registering the same endpoint twice leaves the registry unchanged
#[tokio::test]
async fn test_registration_is_idempotent() {
    let _ = try_init();

    let config = fast_config();
    let (authority, authority_addr) = start_authority(&config, 0).await;
    let client = start_client(&config, &authority_addr).await;

    let first = client.register_service(exec(), backend(22000)).await.unwrap();
    let second = client.register_service(exec(), backend(22000)).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(authority.registry().len(), 1);
    assert_eq!(authority.registry().version(), first);
    assert_eq!(client.local_services().len(), 1);

    client.stop().await;
    authority.stop().await;
}

/// Deregistration reaches other subscribers
#[tokio::test]
async fn test_deregistration_propagates() {
    let _ = try_init();

    let config = fast_config();
    let (authority, authority_addr) = start_authority(&config, 0).await;
    let owner = start_client(&config, &authority_addr).await;
    let observer = start_client(&config, &authority_addr).await;

    owner.register_service(exec(), backend(22000)).await.unwrap();
    owner.register_service(exec(), backend(22001)).await.unwrap();
    wait_for_hosts(&observer, &exec(), 2, 100, Duration::from_millis(20))
        .await
        .unwrap();

    owner.unregister_service(&exec(), &backend(22000)).await.unwrap();
    let removed = poll_until(100, Duration::from_millis(20), || {
        !observer.get_all_known_hosts(&exec()).contains(&backend(22000))
    })
    .await;
    assert!(removed.is_some());
    assert_eq!(observer.get_all_known_hosts(&exec()).len(), 1);

    observer.stop().await;
    owner.stop().await;
    authority.stop().await;
}

/// A subscriber that never answers does not hold back the others
#[tokio::test]
async fn test_dead_subscriber_does_not_block_others() {
    let _ = try_init();

    let mut config = fast_config();
    config.authority.failure_threshold = 0;
    let (authority, authority_addr) = start_authority(&config, 0).await;

    // Accepts TCP but never speaks HTTP/2
    let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let silent_port = silent.local_addr().unwrap().port();
    let mut raw = StateStoreClient::connect(format!("http://{}", authority_addr))
        .await
        .unwrap();
    raw.register_subscription(RegisterSubscriptionRequest {
        subscriber_id: SubscriberId::new().to_string(),
        address: Some(HostPort {
            host: "127.0.0.1".to_string(),
            port: u32::from(silent_port),
        }),
    })
    .await
    .unwrap();

    let client = start_client(&config, &authority_addr).await;
    let observer = start_client(&config, &authority_addr).await;
    client.register_service(exec(), backend(22000)).await.unwrap();

    // Must arrive by push well within a few update timeouts
    wait_for_hosts(&observer, &exec(), 1, 100, Duration::from_millis(20))
        .await
        .unwrap();
    let all_subscribed = poll_until(50, Duration::from_millis(20), || {
        authority.subscriber_count() == 3
    })
    .await;
    assert!(all_subscribed.is_some());

    observer.stop().await;
    client.stop().await;
    authority.stop().await;
    drop(silent);
}

/// Stopping a client and the authority completes promptly
#[tokio::test]
async fn test_stop_is_prompt() {
    let _ = try_init();

    let config = fast_config();
    let (authority, authority_addr) = start_authority(&config, 0).await;
    let client = start_client(&config, &authority_addr).await;
    client.register_service(exec(), backend(22000)).await.unwrap();

    timeout(Duration::from_secs(2), client.stop())
        .await
        .expect("client stop hung");
    timeout(Duration::from_secs(2), authority.stop())
        .await
        .expect("authority stop hung");

    assert_eq!(client.health().status, HealthStatus::Stopped);
    // Last snapshot remains readable
    assert_eq!(client.get_all_known_hosts(&exec()).len(), 1);
}

/// Observed versions never go backwards, and each snapshot extends the previous one
#[tokio::test]
async fn test_versions_are_monotonic_under_concurrent_registration() {
    let _ = try_init();

    let config = fast_config();
    let (authority, authority_addr) = start_authority(&config, 0).await;
    let observer = start_client(&config, &authority_addr).await;
    let mut updates = observer.subscribe();

    let registrations: Vec<_> = (0..4u16)
        .map(|worker| {
            let config = config.clone();
            let authority_addr = authority_addr.clone();
            tokio::spawn(async move {
                let client = start_client(&config, &authority_addr).await;
                for i in 0..5u16 {
                    client
                        .register_service(exec(), backend(23000 + worker * 100 + i))
                        .await
                        .unwrap();
                }
                client
            })
        })
        .collect();

    let watcher = tokio::spawn(async move {
        let mut last_version = 0;
        let mut last_hosts = BTreeSet::new();
        loop {
            if updates.changed().await.is_err() {
                break;
            }
            let snapshot = updates.borrow_and_update().clone();
            assert!(snapshot.version() >= last_version);
            let hosts = snapshot.known_hosts(&exec());
            assert!(hosts.is_superset(&last_hosts));
            last_version = snapshot.version();
            last_hosts = hosts;
            if last_hosts.len() == 20 {
                break;
            }
        }
        last_version
    });

    let mut clients = Vec::new();
    for handle in registrations {
        clients.push(handle.await.unwrap());
    }

    let final_version = timeout(Duration::from_secs(5), watcher)
        .await
        .expect("observer never saw all registrations")
        .unwrap();
    assert_eq!(final_version, authority.registry().version());

    for client in clients {
        client.stop().await;
    }
    observer.stop().await;
    authority.stop().await;
}

/// A restarted authority learns the client's services again
#[tokio::test]
async fn test_authority_restart_recovery() {
    let _ = try_init();

    let config = fast_config();
    let (first, authority_addr) = start_authority(&config, 0).await;
    let client = start_client(&config, &authority_addr).await;
    client.register_service(exec(), backend(22000)).await.unwrap();
    let first_id = first.authority_id().to_string();
    first.stop().await;

    let second = MembershipAuthority::new(config.authority.clone(), config.pool.clone());
    second.start(authority_addr.port()).await.unwrap();

    let recovered = poll_until(100, Duration::from_millis(50), || {
        second.registry().snapshot().contains(&exec(), &backend(22000))
    })
    .await;
    assert!(recovered.is_some(), "client did not re-register");

    let switched = poll_until(100, Duration::from_millis(50), || {
        client.health().authority_id.as_deref() == Some(second.authority_id())
    })
    .await;
    assert!(switched.is_some());
    assert_ne!(first_id, second.authority_id());
    assert!(client.get_all_known_hosts(&exec()).contains(&backend(22000)));

    client.stop().await;
    second.stop().await;
}

/// Registration against an unreachable authority fails once the retry budget is spent
#[tokio::test]
async fn test_registration_gives_up_when_authority_down() {
    let _ = try_init();

    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let config = fast_config();
    let mut subscriber = config.subscriber.clone();
    subscriber.authority_address = format!("127.0.0.1:{}", port);
    subscriber.registration_attempts = 3;
    let client = MembershipClient::new(subscriber, config.pool.clone()).unwrap();

    let result = timeout(
        Duration::from_secs(5),
        client.register_service(exec(), backend(22000)),
    )
    .await
    .expect("registration retry budget was not bounded");
    assert!(matches!(result, Err(ClusterError::Connectivity(_))));
}
