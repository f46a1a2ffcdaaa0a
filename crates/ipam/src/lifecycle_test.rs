//! Unit tests for the allocation lifecycle

use crate::address::AddressRange;
use crate::lifecycle::{LifecycleController, PoolRefresh, ReconcileOutcome};
use crate::mock::{MockBindingTracker, MockIpamStore, test_allocation, test_pool, test_provider_config};
use chrono::{Duration, Utc};
use crds::*;
use std::net::Ipv4Addr;
use std::sync::Arc;

const NS: &str = "team-a";

fn pool_spec(cidr: &str) -> NetworkPoolSpec {
    NetworkPoolSpec {
        cidr: cidr.to_string(),
        ..Default::default()
    }
}

fn spec(pool: &str, allocation_type: IPAllocationType, count: Option<u32>) -> IPAllocationSpec {
    IPAllocationSpec {
        pool_ref: LocalObjectReference::new(pool),
        tenant_cluster_ref: NamespacedObjectReference {
            name: "tenant-a".to_string(),
            namespace: None,
        },
        allocation_type,
        count,
        pinned_range: None,
        provider_config_ref: None,
    }
}

fn setup() -> (MockIpamStore, LifecycleController) {
    let store = MockIpamStore::new();
    let controller = LifecycleController::new(Arc::new(store.clone()));
    (store, controller)
}

fn range_of(allocation: &IPAllocation) -> AddressRange {
    let status = allocation.status.as_ref().unwrap();
    AddressRange::parse_range(
        status.start_address.as_deref().unwrap(),
        status.end_address.as_deref().unwrap(),
    )
    .unwrap()
}

fn ready(allocation: &IPAllocation) -> Condition {
    find_condition(&allocation.status.as_ref().unwrap().conditions, CONDITION_READY)
        .cloned()
        .unwrap()
}

#[tokio::test]
async fn test_count_request_is_allocated_and_debited() {
    let (store, controller) = setup();
    store.add_pool(test_pool(NS, "dc1", pool_spec("10.0.0.0/24")));
    let request = store.add_allocation(test_allocation(NS, "nodes", spec("dc1", IPAllocationType::Nodes, Some(8))));

    let outcome = controller.reconcile(&request).await.unwrap();
    let stored = store.allocation(NS, "nodes").unwrap();
    let status = stored.status.as_ref().unwrap();

    assert!(matches!(outcome, ReconcileOutcome::Allocated { ref pool, .. } if pool == "dc1"));
    assert_eq!(status.phase, IPAllocationPhase::Allocated);
    assert_eq!(status.allocated_count, 8);
    assert_eq!(status.addresses.len(), 8);
    assert_eq!(status.cidr.as_deref(), Some("10.0.0.0/29"));
    assert_eq!(status.allocated_by.as_deref(), Some("dc1"));
    assert!(status.allocated_at.is_some());
    assert_eq!(ready(&stored).reason, reasons::ALLOCATED);

    let pool_status = store.pool(NS, "dc1").unwrap().status.unwrap();
    assert_eq!(pool_status.allocated_ips, 8);
    assert_eq!(pool_status.available_ips, 248);
    assert_eq!(pool_status.allocation_count, 1);
}

#[tokio::test]
async fn test_default_count_comes_from_pool() {
    let (store, controller) = setup();
    let mut with_defaults = pool_spec("10.0.0.0/24");
    with_defaults.tenant_allocation = Some(TenantAllocationConfig {
        start: None,
        end: None,
        defaults: Some(TenantAllocationDefaults {
            nodes_per_tenant: Some(3),
            lb_pool_per_tenant: Some(6),
        }),
    });
    store.add_pool(test_pool(NS, "dc1", with_defaults));
    let nodes = store.add_allocation(test_allocation(NS, "nodes", spec("dc1", IPAllocationType::Nodes, None)));
    let lb = store.add_allocation(test_allocation(NS, "lb", spec("dc1", IPAllocationType::LoadBalancer, None)));

    controller.reconcile(&nodes).await.unwrap();
    controller.reconcile(&lb).await.unwrap();

    assert_eq!(range_of(&store.allocation(NS, "nodes").unwrap()).len(), 3);
    assert_eq!(range_of(&store.allocation(NS, "lb").unwrap()).len(), 6);
}

#[tokio::test]
async fn test_reconcile_twice_keeps_the_same_range() {
    let (store, controller) = setup();
    store.add_pool(test_pool(NS, "dc1", pool_spec("10.0.0.0/24")));
    let request = store.add_allocation(test_allocation(NS, "nodes", spec("dc1", IPAllocationType::Nodes, Some(4))));

    controller.reconcile(&request).await.unwrap();
    let first = store.allocation(NS, "nodes").unwrap();
    let writes = store.allocation_writes();

    let outcome = controller.reconcile(&first).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::AlreadyAllocated);
    assert_eq!(range_of(&store.allocation(NS, "nodes").unwrap()), range_of(&first));
    assert_eq!(store.allocation_writes(), writes);

    // A restarted controller recognises the holding instead of allocating again
    let restarted = LifecycleController::new(Arc::new(store.clone()));
    assert_eq!(restarted.reconcile(&first).await.unwrap(), ReconcileOutcome::AlreadyAllocated);
    assert_eq!(store.pool(NS, "dc1").unwrap().status.unwrap().allocated_ips, 4);
}

#[tokio::test]
async fn test_count_and_pinned_together_is_terminal() {
    let (store, controller) = setup();
    store.add_pool(test_pool(NS, "dc1", pool_spec("10.0.0.0/24")));
    let mut both = spec("dc1", IPAllocationType::Nodes, Some(2));
    both.pinned_range = Some(PinnedIPRange {
        start_address: "10.0.0.5".into(),
        end_address: "10.0.0.6".into(),
    });
    let request = store.add_allocation(test_allocation(NS, "both", both));

    let outcome = controller.reconcile(&request).await.unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Failed { ref reason, .. } if reason == reasons::INVALID_REQUEST));

    let stored = store.allocation(NS, "both").unwrap();
    assert_eq!(stored.phase(), IPAllocationPhase::Failed);
    assert_eq!(controller.reconcile(&stored).await.unwrap(), ReconcileOutcome::Unchanged);
}

#[tokio::test]
async fn test_malformed_pinned_address_is_terminal() {
    let (store, controller) = setup();
    store.add_pool(test_pool(NS, "dc1", pool_spec("10.0.0.0/24")));
    let mut pinned = spec("dc1", IPAllocationType::Nodes, None);
    pinned.pinned_range = Some(PinnedIPRange {
        start_address: "10.0.0.300".into(),
        end_address: "10.0.0.6".into(),
    });
    let request = store.add_allocation(test_allocation(NS, "bad", pinned));

    controller.reconcile(&request).await.unwrap();
    let stored = store.allocation(NS, "bad").unwrap();
    assert_eq!(stored.phase(), IPAllocationPhase::Failed);
    assert_eq!(ready(&stored).reason, reasons::INVALID_REQUEST);
}

#[tokio::test]
async fn test_missing_pool_waits_without_rewriting() {
    let (store, controller) = setup();
    let request = store.add_allocation(test_allocation(NS, "early", spec("dc1", IPAllocationType::Nodes, Some(2))));

    let outcome = controller.reconcile(&request).await.unwrap();
    assert!(outcome.should_retry());

    let stored = store.allocation(NS, "early").unwrap();
    assert_eq!(stored.phase(), IPAllocationPhase::Pending);
    assert_eq!(ready(&stored).reason, reasons::POOL_NOT_FOUND);
    let writes = store.allocation_writes();

    controller.reconcile(&stored).await.unwrap();
    assert_eq!(store.allocation_writes(), writes);

    // Once the pool shows up the same request goes through
    store.add_pool(test_pool(NS, "dc1", pool_spec("10.0.0.0/24")));
    let stored = store.allocation(NS, "early").unwrap();
    assert!(matches!(
        controller.reconcile(&stored).await.unwrap(),
        ReconcileOutcome::Allocated { .. }
    ));
}

#[tokio::test]
async fn test_exhaustion_is_pending_until_space_frees() {
    let (store, controller) = setup();
    store.add_pool(test_pool(NS, "small", pool_spec("10.0.0.0/29")));
    let first = store.add_allocation(test_allocation(NS, "first", spec("small", IPAllocationType::Nodes, Some(6))));
    let second = store.add_allocation(test_allocation(NS, "second", spec("small", IPAllocationType::Nodes, Some(4))));

    controller.reconcile(&first).await.unwrap();
    let outcome = controller.reconcile(&second).await.unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Waiting { ref reason, .. } if reason == reasons::POOL_EXHAUSTED));
    assert_eq!(store.allocation(NS, "second").unwrap().phase(), IPAllocationPhase::Pending);

    let deleting = store.mark_deleting(NS, "first").unwrap();
    assert_eq!(controller.reconcile(&deleting).await.unwrap(), ReconcileOutcome::Released { freed: 6 });

    let retry = store.allocation(NS, "second").unwrap();
    assert!(matches!(
        controller.reconcile(&retry).await.unwrap(),
        ReconcileOutcome::Allocated { .. }
    ));
}

#[tokio::test]
async fn test_deleted_request_is_not_committed() {
    let (store, controller) = setup();
    store.add_pool(test_pool(NS, "dc1", pool_spec("10.0.0.0/24")));
    let request = store.add_allocation(test_allocation(NS, "gone", spec("dc1", IPAllocationType::Nodes, Some(4))));
    store.delete_allocation(NS, "gone");

    assert_eq!(controller.reconcile(&request).await.unwrap(), ReconcileOutcome::Cancelled);

    // Same name, new object: the old copy must not allocate for it either
    let recreated = store.add_allocation(test_allocation(NS, "gone", spec("dc1", IPAllocationType::Nodes, Some(4))));
    assert_ne!(recreated.metadata.uid, request.metadata.uid);
    assert_eq!(controller.reconcile(&request).await.unwrap(), ReconcileOutcome::Cancelled);

    let usage = controller.refresh_pool(NS, "dc1").await.unwrap();
    assert!(matches!(usage, PoolRefresh::Ready { ref status, .. } if status.allocated_ips == 0));
}

#[tokio::test]
async fn test_release_is_idempotent() {
    let (store, controller) = setup();
    store.add_pool(test_pool(NS, "dc1", pool_spec("10.0.0.0/24")));
    let request = store.add_allocation(test_allocation(NS, "nodes", spec("dc1", IPAllocationType::Nodes, Some(5))));
    controller.reconcile(&request).await.unwrap();

    let deleting = store.mark_deleting(NS, "nodes").unwrap();
    assert_eq!(controller.release(&deleting).await.unwrap(), ReconcileOutcome::Released { freed: 5 });

    let released = store.allocation(NS, "nodes").unwrap();
    let status = released.status.as_ref().unwrap();
    assert_eq!(status.phase, IPAllocationPhase::Released);
    assert!(status.released_at.is_some());
    assert!(status.addresses.is_empty());
    assert_eq!(ready(&released).reason, reasons::RELEASED);

    assert_eq!(controller.release(&released).await.unwrap(), ReconcileOutcome::Released { freed: 0 });
    assert_eq!(store.pool(NS, "dc1").unwrap().status.unwrap().allocated_ips, 0);
}

#[tokio::test]
async fn test_quota_per_tenant_is_terminal() {
    let (store, controller) = setup();
    store.add_pool(test_pool(NS, "dc1", pool_spec("10.0.0.0/24")));
    store.add_provider_config(test_provider_config(
        NS,
        "harvester",
        ProviderConfigSpec {
            provider: "harvester".into(),
            network: Some(ProviderNetworkConfig {
                pool_refs: vec![PoolPriorityRef {
                    name: "dc1".into(),
                    priority: 0,
                }],
                load_balancer: None,
                quota_per_tenant: Some(TenantQuota {
                    max_node_ips: Some(6),
                    max_load_balancer_ips: None,
                }),
            }),
        },
    ));

    let with_provider = |name: &str| {
        let mut s = spec("dc1", IPAllocationType::Nodes, Some(5));
        s.provider_config_ref = Some(NamespacedObjectReference {
            name: "harvester".into(),
            namespace: None,
        });
        test_allocation(NS, name, s)
    };
    let first = store.add_allocation(with_provider("first"));
    let second = store.add_allocation(with_provider("second"));

    assert!(matches!(controller.reconcile(&first).await.unwrap(), ReconcileOutcome::Allocated { .. }));
    let outcome = controller.reconcile(&second).await.unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Failed { ref reason, .. } if reason == reasons::QUOTA_EXCEEDED));
}

#[tokio::test]
async fn test_colliding_recorded_holding_is_reallocated() {
    let (store, controller) = setup();
    store.add_pool(test_pool(NS, "dc1", pool_spec("10.0.0.0/24")));

    let recorded = |name: &str, first: u8, minutes_ago: i64| {
        let mut allocation = test_allocation(NS, name, spec("dc1", IPAllocationType::Nodes, Some(5)));
        let block = AddressRange::new(
            u32::from(Ipv4Addr::new(10, 0, 0, first)),
            u32::from(Ipv4Addr::new(10, 0, 0, first + 4)),
        )
        .unwrap();
        allocation.status = Some(IPAllocationStatus {
            phase: IPAllocationPhase::Allocated,
            start_address: Some(block.start_addr().to_string()),
            end_address: Some(block.end_addr().to_string()),
            addresses: block.addresses().map(|ip| ip.to_string()).collect(),
            allocated_count: 5,
            allocated_at: Some(Utc::now() - Duration::minutes(minutes_ago)),
            allocated_by: Some("dc1".into()),
            ..Default::default()
        });
        store.add_allocation(allocation)
    };
    let winner = recorded("winner", 16, 10);
    let loser = recorded("loser", 18, 1);

    let outcome = controller.reconcile(&loser).await.unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Waiting { ref reason, .. } if reason == reasons::RANGE_CONFLICT));
    let reset = store.allocation(NS, "loser").unwrap();
    assert_eq!(reset.phase(), IPAllocationPhase::Pending);
    assert!(reset.status.as_ref().unwrap().addresses.is_empty());

    controller.reconcile(&reset).await.unwrap();
    let reallocated = range_of(&store.allocation(NS, "loser").unwrap());
    assert!(!reallocated.overlaps(&range_of(&winner)));
    assert_eq!(controller.reconcile(&winner).await.unwrap(), ReconcileOutcome::AlreadyAllocated);
}

#[tokio::test]
async fn test_lost_pool_write_forces_rebuild() {
    let (store, controller) = setup();
    store.add_pool(test_pool(NS, "dc1", pool_spec("10.0.0.0/24")));
    let a = store.add_allocation(test_allocation(NS, "a", spec("dc1", IPAllocationType::Nodes, Some(5))));
    let b = store.add_allocation(test_allocation(NS, "b", spec("dc1", IPAllocationType::Nodes, Some(5))));

    store.inject_pool_conflicts(1);
    controller.reconcile(&a).await.unwrap();
    controller.reconcile(&b).await.unwrap();

    let a = range_of(&store.allocation(NS, "a").unwrap());
    let b = range_of(&store.allocation(NS, "b").unwrap());
    assert!(!a.overlaps(&b));
    let pool_status = store.pool(NS, "dc1").unwrap().status.unwrap();
    assert_eq!(pool_status.allocated_ips, 10);
    assert_eq!(pool_status.allocation_count, 2);
}

#[tokio::test]
async fn test_invalid_pool_is_reported_on_the_pool() {
    let (store, controller) = setup();
    let mut bad = pool_spec("10.0.0.0/24");
    bad.reserved = vec![
        ReservedRange {
            cidr: "10.0.0.0/28".into(),
            description: Some("gateways".into()),
        },
        ReservedRange {
            cidr: "10.0.0.8/30".into(),
            description: None,
        },
    ];
    store.add_pool(test_pool(NS, "bad", bad));

    let refresh = controller.refresh_pool(NS, "bad").await.unwrap();
    assert!(matches!(refresh, PoolRefresh::Invalid(_)));
    let status = store.pool(NS, "bad").unwrap().status.unwrap();
    let condition = find_condition(&status.conditions, CONDITION_READY).unwrap();
    assert_eq!(condition.reason, reasons::INVALID_CONFIGURATION);

    let request = store.add_allocation(test_allocation(NS, "nodes", spec("bad", IPAllocationType::Nodes, Some(2))));
    assert!(controller.reconcile(&request).await.unwrap().should_retry());

    assert_eq!(controller.refresh_pool(NS, "missing").await.unwrap(), PoolRefresh::Missing);
}

#[tokio::test]
async fn test_elastic_holding_grows_and_shrinks() {
    let store = MockIpamStore::new();
    let tracker = MockBindingTracker::new();
    let controller = LifecycleController::new(Arc::new(store.clone())).with_binding_tracker(Arc::new(tracker.clone()));

    store.add_pool(test_pool(NS, "lb", pool_spec("10.0.0.0/24")));
    store.add_provider_config(test_provider_config(
        NS,
        "harvester",
        ProviderConfigSpec {
            provider: "harvester".into(),
            network: Some(ProviderNetworkConfig {
                pool_refs: Vec::new(),
                load_balancer: Some(ProviderLoadBalancerConfig {
                    allocation_mode: LoadBalancerAllocationMode::Elastic,
                    default_pool_size: None,
                    initial_pool_size: Some(4),
                    growth_increment: Some(2),
                }),
                quota_per_tenant: None,
            }),
        },
    ));
    let mut lb = spec("lb", IPAllocationType::LoadBalancer, None);
    lb.provider_config_ref = Some(NamespacedObjectReference {
        name: "harvester".into(),
        namespace: None,
    });
    let request = store.add_allocation(test_allocation(NS, "lb", lb));

    controller.reconcile(&request).await.unwrap();
    let allocated = store.allocation(NS, "lb").unwrap();
    assert_eq!(allocated.status.as_ref().unwrap().allocated_count, 4);

    // No signal yet: nothing moves
    assert_eq!(controller.reconcile(&allocated).await.unwrap(), ReconcileOutcome::AlreadyAllocated);

    let held: Vec<Ipv4Addr> = range_of(&allocated).addresses().collect();
    tracker.set_bound(NS, "lb", held.iter().copied());
    assert_eq!(
        controller.reconcile(&allocated).await.unwrap(),
        ReconcileOutcome::Resized { added: 2, removed: 0 }
    );
    let grown = store.allocation(NS, "lb").unwrap();
    let status = grown.status.as_ref().unwrap();
    assert_eq!(status.allocated_count, 6);
    assert_eq!(status.end_address.as_deref(), Some("10.0.0.5"));
    assert_eq!(status.cidr, None);

    tracker.set_bound(NS, "lb", [held[0]]);
    assert_eq!(
        controller.reconcile(&grown).await.unwrap(),
        ReconcileOutcome::Resized { added: 0, removed: 2 }
    );
    let shrunk = store.allocation(NS, "lb").unwrap();
    let status = shrunk.status.as_ref().unwrap();
    assert_eq!(status.allocated_count, 4);
    assert_eq!(status.cidr.as_deref(), Some("10.0.0.0/30"));
    assert_eq!(store.pool(NS, "lb").unwrap().status.unwrap().allocated_ips, 4);
}

#[tokio::test]
async fn test_recorded_reservation_is_confirmed() {
    let (store, controller) = setup();
    store.add_pool(test_pool(NS, "dc1", pool_spec("10.0.0.0/24")));

    // Range recorded, pool write and confirmation never happened
    let mut interrupted = test_allocation(NS, "interrupted", spec("dc1", IPAllocationType::Nodes, Some(3)));
    let block = AddressRange::parse_range("10.0.0.40", "10.0.0.42").unwrap();
    interrupted.status = Some(IPAllocationStatus {
        phase: IPAllocationPhase::Pending,
        start_address: Some("10.0.0.40".into()),
        end_address: Some("10.0.0.42".into()),
        addresses: block.addresses().map(|ip| ip.to_string()).collect(),
        allocated_count: 3,
        allocated_at: Some(Utc::now()),
        allocated_by: Some("dc1".into()),
        ..Default::default()
    });
    let interrupted = store.add_allocation(interrupted);

    let outcome = controller.reconcile(&interrupted).await.unwrap();
    assert_eq!(
        outcome,
        ReconcileOutcome::Allocated {
            pool: "dc1".into(),
            range: block
        }
    );
    let stored = store.allocation(NS, "interrupted").unwrap();
    assert_eq!(stored.phase(), IPAllocationPhase::Allocated);
    assert_eq!(range_of(&stored), block);
    assert_eq!(ready(&stored).reason, reasons::ALLOCATED);
    assert_eq!(store.pool(NS, "dc1").unwrap().status.unwrap().allocated_ips, 3);

    assert_eq!(controller.reconcile(&stored).await.unwrap(), ReconcileOutcome::AlreadyAllocated);
}

#[tokio::test]
async fn test_elastic_growth_is_withdrawn_when_pool_write_is_lost() {
    let store = MockIpamStore::new();
    let tracker = MockBindingTracker::new();
    let controller = LifecycleController::new(Arc::new(store.clone())).with_binding_tracker(Arc::new(tracker.clone()));

    store.add_pool(test_pool(NS, "lb", pool_spec("10.0.0.0/24")));
    store.add_provider_config(test_provider_config(
        NS,
        "harvester",
        ProviderConfigSpec {
            provider: "harvester".into(),
            network: Some(ProviderNetworkConfig {
                pool_refs: Vec::new(),
                load_balancer: Some(ProviderLoadBalancerConfig {
                    allocation_mode: LoadBalancerAllocationMode::Elastic,
                    default_pool_size: None,
                    initial_pool_size: Some(4),
                    growth_increment: Some(2),
                }),
                quota_per_tenant: None,
            }),
        },
    ));
    let mut lb = spec("lb", IPAllocationType::LoadBalancer, None);
    lb.provider_config_ref = Some(NamespacedObjectReference {
        name: "harvester".into(),
        namespace: None,
    });
    let request = store.add_allocation(test_allocation(NS, "lb", lb));
    controller.reconcile(&request).await.unwrap();

    let allocated = store.allocation(NS, "lb").unwrap();
    tracker.set_bound(NS, "lb", range_of(&allocated).addresses());
    store.inject_pool_conflicts(1);
    assert!(controller.reconcile(&allocated).await.is_err());

    let withdrawn = store.allocation(NS, "lb").unwrap();
    assert_eq!(withdrawn.status.as_ref().unwrap().allocated_count, 4);
    assert_eq!(store.pool(NS, "lb").unwrap().status.unwrap().allocated_ips, 4);

    assert_eq!(
        controller.reconcile(&withdrawn).await.unwrap(),
        ReconcileOutcome::Resized { added: 2, removed: 0 }
    );
    assert_eq!(store.pool(NS, "lb").unwrap().status.unwrap().allocated_ips, 6);
}

#[tokio::test]
async fn test_pool_event_from_own_write_keeps_slot() {
    use crate::store::IpamStore;

    let (store, controller) = setup();
    store.add_pool(test_pool(NS, "dc1", pool_spec("10.0.0.0/24")));
    let request = store.add_allocation(test_allocation(NS, "nodes", spec("dc1", IPAllocationType::Nodes, Some(8))));
    controller.reconcile(&request).await.unwrap();

    // Holding written behind the controller's back, with no pool write
    let mut sideloaded = test_allocation(NS, "sideloaded", spec("dc1", IPAllocationType::Nodes, Some(1)));
    sideloaded.status = Some(IPAllocationStatus {
        phase: IPAllocationPhase::Allocated,
        start_address: Some("10.0.0.100".into()),
        end_address: Some("10.0.0.100".into()),
        addresses: vec!["10.0.0.100".into()],
        allocated_count: 1,
        allocated_at: Some(Utc::now()),
        allocated_by: Some("dc1".into()),
        ..Default::default()
    });
    store.add_allocation(sideloaded);

    let PoolRefresh::Ready { status, .. } = controller.refresh_pool(NS, "dc1").await.unwrap() else {
        panic!("pool should be ready");
    };
    assert_eq!(status.allocated_ips, 8);

    let pool = store.pool(NS, "dc1").unwrap();
    let current = pool.status.clone().unwrap();
    store.update_pool_status(&pool, &current).await.unwrap();

    let PoolRefresh::Ready { status, .. } = controller.refresh_pool(NS, "dc1").await.unwrap() else {
        panic!("pool should be ready");
    };
    assert_eq!(status.allocated_ips, 9);
}
