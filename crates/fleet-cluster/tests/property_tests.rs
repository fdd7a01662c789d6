use fleet_cluster::{
    HostAddress, HostSet, MembershipSnapshot, Scheduler, ServiceId, ServiceRegistry,
    SimpleScheduler, StaticMembership, WorkItem,
};
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

fn exec() -> ServiceId {
    ServiceId::new("exec")
}

fn hosts_from(ports: &BTreeSet<u16>) -> HostSet {
    ports.iter().map(|port| HostAddress::new("10.0.0.1", *port)).collect()
}

fn scheduler_over(hosts: HostSet) -> SimpleScheduler {
    let mut services = BTreeMap::new();
    services.insert(exec(), hosts);
    let view = Arc::new(StaticMembership::new(MembershipSnapshot::new(1, services)));
    SimpleScheduler::init(view, exec()).unwrap()
}

// Property-based tests for scheduling
proptest! {
    #[test]
    fn test_locality_never_leaves_the_intersection(
        live in prop::collection::btree_set(1u16..200, 1..10),
        preferred in prop::collection::vec(1u16..400, 1..6),
        rounds in 1..20usize
    ) {
        let hosts = hosts_from(&live);
        let scheduler = scheduler_over(hosts.clone());
        let hints: Vec<HostAddress> = preferred
            .iter()
            .map(|p| HostAddress::new("10.0.0.1", *p))
            .collect();
        let intersection: HostSet = hints.iter().filter(|h| hosts.contains(h)).cloned().collect();

        for round in 0..rounds {
            let item = WorkItem::new(format!("item-{}", round)).with_preferred_hosts(hints.clone());
            let chosen = scheduler.schedule_one(&item).unwrap();
            prop_assert!(hosts.contains(&chosen));
            if !intersection.is_empty() {
                prop_assert!(intersection.contains(&chosen));
            }
        }
    }

    #[test]
    fn test_fallback_is_deterministic(
        live in prop::collection::btree_set(1u16..200, 1..10),
        id in "[a-z0-9-]{1,24}"
    ) {
        let first = scheduler_over(hosts_from(&live));
        // Same set built in reverse order
        let reversed: HostSet = live
            .iter()
            .rev()
            .map(|p| HostAddress::new("10.0.0.1", *p))
            .collect();
        let second = scheduler_over(reversed);

        let item = WorkItem::new(id).with_preferred_host(HostAddress::new("10.9.9.9", 1));
        let a = first.schedule_one(&item).unwrap();
        let b = first.schedule_one(&item).unwrap();
        let c = second.schedule_one(&item).unwrap();
        prop_assert_eq!(&a, &b);
        prop_assert_eq!(&a, &c);
    }

    #[test]
    fn test_batches_cover_every_distinct_item(
        live in prop::collection::btree_set(1u16..200, 1..6),
        ids in prop::collection::vec(0u8..30, 0..40)
    ) {
        let scheduler = scheduler_over(hosts_from(&live));
        let items: Vec<WorkItem> = ids.iter().map(|i| WorkItem::new(format!("w{}", i))).collect();
        let distinct: BTreeSet<u8> = ids.iter().copied().collect();

        let assignment = scheduler.schedule(&items).unwrap();
        prop_assert_eq!(assignment.len(), distinct.len());
        for item in &items {
            prop_assert!(assignment.get(&item.id).is_some());
        }
    }
}

// Property-based tests for the registry
proptest! {
    #[test]
    fn test_registration_is_idempotent(
        ops in prop::collection::vec((0u8..3, 1u16..20), 1..60)
    ) {
        let registry = ServiceRegistry::new();
        let mut distinct = BTreeSet::new();

        for (service, port) in &ops {
            let service_id = ServiceId::new(format!("svc-{}", service));
            let address = HostAddress::new("127.0.0.1", *port);
            let before = registry.version();
            let after = registry.register(service_id.clone(), address.clone());

            if distinct.insert((service_id, address)) {
                prop_assert_eq!(after, before + 1);
            } else {
                prop_assert_eq!(after, before);
            }
        }

        prop_assert_eq!(registry.len(), distinct.len());
        prop_assert_eq!(registry.version(), distinct.len() as u64);
        prop_assert_eq!(registry.snapshot().num_registrations(), distinct.len());
    }

    #[test]
    fn test_deregistration_only_bumps_on_change(
        registered in prop::collection::btree_set(1u16..30, 0..15),
        removed in prop::collection::vec(1u16..30, 0..30)
    ) {
        let registry = ServiceRegistry::new();
        for port in &registered {
            registry.register(exec(), HostAddress::new("127.0.0.1", *port));
        }

        let mut remaining = registered.clone();
        for port in &removed {
            let before = registry.version();
            let after = registry.deregister(&exec(), &HostAddress::new("127.0.0.1", *port));
            if remaining.remove(port) {
                prop_assert_eq!(after, before + 1);
            } else {
                prop_assert_eq!(after, before);
            }
        }

        prop_assert_eq!(registry.snapshot().known_hosts(&exec()), hosts_from_local(&remaining));
    }
}

fn hosts_from_local(ports: &BTreeSet<u16>) -> HostSet {
    ports.iter().map(|port| HostAddress::new("127.0.0.1", *port)).collect()
}
