//! Topology resolution and VIP planning across inventory shapes.
//!
//! Everything here runs before the first remote call, so no mock world is
//! involved: a bad inventory must be rejected with a configuration error.

use crate::mock_agents::config;
use ha_bootstrap::bootstrap::{Error, VipCoordinator, resolve};
use ha_bootstrap::inventory::{NodeInventoryEntry, NodeRole, PhaseStatus};
use ha_bootstrap::preflight;

fn configuration_message(err: Error) -> String {
    match err {
        Error::Configuration(msg) => msg,
        other => panic!("expected configuration error, got {other:?}"),
    }
}

// ============================================================================
// Primary designation
// ============================================================================

#[test]
fn test_single_control_plane_cluster() {
    let topology = resolve(&config(1, 0)).unwrap();
    assert_eq!(topology.primary().id, "ctrl-1");
    assert_eq!(topology.control_plane_count(), 1);
    assert_eq!(topology.worker_count(), 0);
    assert_eq!(topology.secondary_control_planes().count(), 0);
}

#[test]
fn test_primary_is_listed_first_regardless_of_inventory_order() {
    let mut cfg = config(3, 2);
    cfg.nodes.rotate_left(2);
    for entry in &mut cfg.nodes {
        entry.primary = entry.id == "ctrl-3";
    }

    let topology = resolve(&cfg).unwrap();
    let ids: Vec<&str> = topology.nodes().map(|n| n.id.as_str()).collect();
    assert_eq!(ids, vec!["ctrl-3", "work-1", "work-2", "ctrl-1", "ctrl-2"]);

    let secondaries: Vec<&str> = topology
        .secondary_control_planes()
        .map(|n| n.id.as_str())
        .collect();
    assert_eq!(secondaries, vec!["ctrl-1", "ctrl-2"]);
    assert!(topology.nodes().all(|n| n.phase_status == PhaseStatus::Pending));
}

#[test]
fn test_zero_primaries_rejected() {
    let mut cfg = config(3, 1);
    for entry in &mut cfg.nodes {
        entry.primary = false;
    }
    let msg = configuration_message(resolve(&cfg).unwrap_err());
    assert!(msg.contains("primary"), "{msg}");
}

#[test]
fn test_multiple_primaries_rejected() {
    let mut cfg = config(3, 1);
    cfg.nodes[1].primary = true;
    let msg = configuration_message(resolve(&cfg).unwrap_err());
    assert!(msg.contains("ctrl-1"), "{msg}");
    assert!(msg.contains("ctrl-2"), "{msg}");
}

#[test]
fn test_worker_primary_rejected() {
    let mut cfg = config(1, 1);
    cfg.nodes.push(NodeInventoryEntry::worker("work-9", "10.0.0.99").as_primary());
    cfg.nodes[0].primary = false;
    let msg = configuration_message(resolve(&cfg).unwrap_err());
    assert!(msg.contains("work-9"), "{msg}");
}

#[test]
fn test_workers_only_rejected() {
    let mut cfg = config(0, 2);
    cfg.nodes[0].primary = true;
    assert!(resolve(&cfg).unwrap_err().is_configuration());
}

#[test]
fn test_empty_inventory_rejected() {
    let cfg = config(0, 0);
    let msg = configuration_message(resolve(&cfg).unwrap_err());
    assert!(msg.contains("empty"), "{msg}");
}

// ============================================================================
// Identity
// ============================================================================

#[test]
fn test_duplicate_node_id_rejected() {
    let mut cfg = config(2, 1);
    cfg.nodes.push(NodeInventoryEntry::worker("work-1", "10.0.0.99"));
    let msg = configuration_message(resolve(&cfg).unwrap_err());
    assert!(msg.contains("duplicate node id"), "{msg}");
}

#[test]
fn test_duplicate_address_rejected() {
    let mut cfg = config(2, 1);
    cfg.nodes.push(NodeInventoryEntry::worker("work-9", "10.0.0.21"));
    let msg = configuration_message(resolve(&cfg).unwrap_err());
    assert!(msg.contains("duplicate node address"), "{msg}");
}

#[test]
fn test_hostname_addresses_accepted() {
    let mut cfg = config(1, 0);
    cfg.nodes
        .push(NodeInventoryEntry::worker("work-1", "worker-1.lab.example.com"));
    let topology = resolve(&cfg).unwrap();
    assert_eq!(
        topology.node("work-1").map(|n| n.address.as_str()),
        Some("worker-1.lab.example.com")
    );
}

#[test]
fn test_invalid_node_id_rejected() {
    let mut cfg = config(1, 0);
    cfg.nodes.push(NodeInventoryEntry::worker("Worker_1", "10.0.0.21"));
    assert!(resolve(&cfg).unwrap_err().is_configuration());
}

// ============================================================================
// Endpoints
// ============================================================================

#[test]
fn test_workers_default_to_vip_endpoint() {
    let topology = resolve(&config(3, 2)).unwrap();
    assert_eq!(topology.api_endpoint().to_string(), "10.0.0.100:6443");
    for worker in topology.workers() {
        assert_eq!(worker.role, NodeRole::Worker);
        assert_eq!(
            worker.control_plane_endpoint.as_deref(),
            Some("10.0.0.100:6443")
        );
    }
    for cp in topology.control_planes() {
        assert_eq!(cp.control_plane_endpoint, None);
    }
}

#[test]
fn test_worker_endpoint_override() {
    let mut cfg = config(1, 0);
    cfg.nodes.push(
        NodeInventoryEntry::worker("edge-1", "192.168.5.10").with_endpoint("api.lab.internal:8443"),
    );
    let topology = resolve(&cfg).unwrap();
    assert_eq!(
        topology
            .node("edge-1")
            .and_then(|n| n.control_plane_endpoint.as_deref()),
        Some("api.lab.internal:8443")
    );
}

#[test]
fn test_worker_endpoint_without_port_rejected() {
    let mut cfg = config(1, 0);
    cfg.nodes
        .push(NodeInventoryEntry::worker("edge-1", "192.168.5.10").with_endpoint("api.lab.internal"));
    let msg = configuration_message(resolve(&cfg).unwrap_err());
    assert!(msg.contains("edge-1"), "{msg}");
}

#[test]
fn test_custom_api_server_port() {
    let mut cfg = config(3, 1);
    cfg.cluster.api_server_port = 8443;
    let topology = resolve(&cfg).unwrap();
    assert_eq!(topology.api_endpoint().to_string(), "10.0.0.100:8443");
}

// ============================================================================
// VIP planning
// ============================================================================

#[test]
fn test_vip_priorities_descend_from_primary() {
    let plan = preflight(&config(5, 2)).unwrap();
    let priorities: Vec<(&str, u8)> = plan
        .failover
        .members
        .iter()
        .map(|m| (m.node_id.as_str(), m.priority))
        .collect();
    assert_eq!(
        priorities,
        vec![
            ("ctrl-1", 150),
            ("ctrl-2", 140),
            ("ctrl-3", 130),
            ("ctrl-4", 120),
            ("ctrl-5", 110)
        ]
    );
    assert_eq!(plan.failover.master, "ctrl-1");
    assert!(plan.topology.workers().all(|w| w.vip_priority.is_none()));
}

#[test]
fn test_vip_instances_peer_with_every_other_control_plane() {
    let plan = preflight(&config(3, 1)).unwrap();
    let member = plan.failover.member("ctrl-2").unwrap();
    let instance = plan.failover.instance_for(member);
    assert_eq!(instance.unicast_src, "10.0.0.12");
    assert_eq!(instance.unicast_peers, vec!["10.0.0.11", "10.0.0.13"]);

    let conf = instance.render_keepalived_conf();
    assert!(conf.contains("state BACKUP"), "{conf}");
    assert!(conf.contains("priority 140"), "{conf}");
    assert!(conf.contains("10.0.0.100"), "{conf}");
}

#[test]
fn test_vip_colliding_with_node_address_rejected() {
    let mut cfg = config(3, 1);
    cfg.vip.address = "10.0.0.12".parse().unwrap();
    let msg = configuration_message(preflight(&cfg).unwrap_err());
    assert!(msg.contains("ctrl-2"), "{msg}");
}

#[test]
fn test_vip_priorities_that_reach_zero_rejected() {
    let mut cfg = config(4, 0);
    cfg.vip.priority_base = 30;
    cfg.vip.priority_step = 10;
    let msg = configuration_message(preflight(&cfg).unwrap_err());
    assert!(msg.contains("ctrl-4"), "{msg}");
}

#[test]
fn test_slow_reelection_rejected() {
    let mut cfg = config(3, 0);
    cfg.vip.health_check.interval_secs = 10;
    let msg = configuration_message(preflight(&cfg).unwrap_err());
    assert!(msg.contains("re-election"), "{msg}");
}

#[test]
fn test_reelection_time_within_bound_by_default() {
    let cfg = config(3, 0);
    let coordinator = VipCoordinator::new(cfg.vip.clone(), cfg.cluster.api_server_port);
    assert!(coordinator.reelection_time().as_secs() <= u64::from(cfg.vip.reelection_bound_secs));
}
