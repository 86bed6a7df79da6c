// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Property-based tests for ha-bootstrap.
//!
//! Uses proptest to generate random inventories, add-on graphs and event
//! sequences and verify invariants.

use std::collections::HashMap;
use std::time::Duration;

use proptest::prelude::*;

use ha_bootstrap::bootstrap::{
    AddonGate, BootstrapEvent, BootstrapStateMachine, Error, TransitionContext, VipCoordinator,
    resolve,
};
use ha_bootstrap::bootstrap::state_machine::TransitionResult;
use ha_bootstrap::inventory::{AddonSpec, BootstrapConfig, BootstrapPhase, NodeInventoryEntry, VipSettings};
use ha_bootstrap::retry::RetryPolicy;

/// Strategy for generating any phase.
fn any_phase() -> impl Strategy<Value = BootstrapPhase> {
    prop::sample::select(BootstrapPhase::ALL.to_vec())
}

/// Strategy for generating any event.
fn any_event() -> impl Strategy<Value = BootstrapEvent> {
    prop::sample::select(BootstrapEvent::ALL.to_vec())
}

/// Context in which every guard is satisfied.
fn permissive_context() -> TransitionContext {
    TransitionContext {
        target_is_primary: true,
        primary_ready: true,
        join_in_flight: None,
        control_planes_expected: 3,
        control_planes_joined: 3,
        workers_expected: 2,
        workers_settled: 2,
        nodes_expected: 5,
        nodes_ready: 5,
        addons_expected: 0,
        addons_installed: 0,
    }
}

fn inventory(control_planes: usize, workers: usize, primaries: &[usize]) -> BootstrapConfig {
    let mut nodes = Vec::new();
    for i in 0..control_planes {
        let mut entry =
            NodeInventoryEntry::control_plane(format!("cp-{i}"), format!("10.1.0.{}", i + 1));
        entry.primary = primaries.contains(&i);
        nodes.push(entry);
    }
    for i in 0..workers {
        nodes.push(NodeInventoryEntry::worker(
            format!("wk-{i}"),
            format!("10.2.0.{}", i + 1),
        ));
    }
    BootstrapConfig {
        cluster: Default::default(),
        vip: VipSettings::new("10.9.0.1".parse().unwrap()),
        nodes,
        ssh: Default::default(),
        timeouts: Default::default(),
        retry: Default::default(),
        credentials: Default::default(),
        addons: Some(Vec::new()),
        metrics_addr: None,
    }
}

/// Random DAG: node `i` may only depend on nodes `< i`, then the listing
/// order is shuffled so the input order says nothing about dependencies.
fn addon_dag() -> impl Strategy<Value = Vec<AddonSpec>> {
    (1usize..12)
        .prop_flat_map(|n| {
            (
                prop::collection::vec(prop::collection::vec(any::<bool>(), n), n),
                Just((0..n).collect::<Vec<usize>>()).prop_shuffle(),
            )
        })
        .prop_map(|(edges, listing)| {
            listing
                .into_iter()
                .map(|i| {
                    let deps: Vec<String> = (0..i)
                        .filter(|j| edges[i][*j])
                        .map(|j| format!("addon-{j}"))
                        .collect();
                    AddonSpec::new(format!("addon-{i}"), "1.0.0", format!("repo/addon-{i}"), "addons")
                        .depends_on(deps)
                })
                .collect()
        })
}

// ============================================================================
// State machine
// ============================================================================

proptest! {
    /// Abort is accepted from every non-terminal phase, whatever the guards say.
    #[test]
    fn abort_always_valid_from_non_terminal(phase in any_phase()) {
        prop_assume!(!phase.is_terminal());
        let sm = BootstrapStateMachine::new();
        let result = sm.transition(&phase, BootstrapEvent::Abort, &TransitionContext::default());
        let aborted = matches!(result, TransitionResult::Success { to: BootstrapPhase::Aborted, .. });
        prop_assert!(aborted, "abort rejected from {}", phase);
    }

    /// Terminal phases accept no event.
    #[test]
    fn terminal_phases_accept_nothing(event in any_event()) {
        let sm = BootstrapStateMachine::new();
        for phase in [BootstrapPhase::AddonsComplete, BootstrapPhase::Aborted] {
            prop_assert!(!sm.can_transition(&phase, &event));
            let invalid = matches!(
                sm.transition(&phase, event.clone(), &permissive_context()),
                TransitionResult::InvalidTransition { .. }
            );
            prop_assert!(invalid);
        }
    }

    /// Random event streams only move forward: the phase ordinal never
    /// decreases, and once terminal the phase never changes.
    #[test]
    fn event_streams_never_move_backwards(events in prop::collection::vec(any_event(), 0..40)) {
        let sm = BootstrapStateMachine::new();
        let ctx = permissive_context();
        let mut phase = BootstrapPhase::Uninitialized;

        for event in events {
            if let TransitionResult::Success { to, .. } = sm.transition(&phase, event, &ctx) {
                prop_assert!(!phase.is_terminal(), "left terminal phase {}", phase);
                if let (Some(before), Some(after)) = (phase.ordinal(), to.ordinal()) {
                    prop_assert!(after >= before, "{} -> {}", phase, to);
                }
                phase = to;
            }
        }
    }

    /// A join cannot start while another join is in flight.
    #[test]
    fn joins_are_serialized(phase in any_phase(), node in "[a-z]{1,8}") {
        let sm = BootstrapStateMachine::new();
        let ctx = TransitionContext {
            join_in_flight: Some(node),
            ..permissive_context()
        };
        for event in [BootstrapEvent::ControlPlaneJoinStarted, BootstrapEvent::WorkerJoinStarted] {
            let started = matches!(
                sm.transition(&phase, event, &ctx),
                TransitionResult::Success { .. }
            );
            prop_assert!(!started);
        }
    }
}

// ============================================================================
// Topology and VIP
// ============================================================================

proptest! {
    /// Resolution succeeds exactly when one control plane is primary, and
    /// that node becomes the topology's primary.
    #[test]
    fn exactly_one_primary(
        control_planes in 1usize..8,
        workers in 0usize..8,
        picks in prop::collection::vec(0usize..8, 0..3),
    ) {
        let mut primaries: Vec<usize> = picks.into_iter().filter(|i| *i < control_planes).collect();
        primaries.sort_unstable();
        primaries.dedup();

        let config = inventory(control_planes, workers, &primaries);
        match (resolve(&config), primaries.as_slice()) {
            (Ok(topology), [only]) => {
                let expected = format!("cp-{only}");
                prop_assert_eq!(&topology.primary().id, &expected);
                prop_assert_eq!(topology.nodes().filter(|n| n.is_primary).count(), 1);
                prop_assert_eq!(topology.nodes().count(), control_planes + workers);
                prop_assert_eq!(topology.expected_node_ids().len(), control_planes + workers);
            }
            (Err(e), chosen) => {
                prop_assert!(chosen.len() != 1, "rejected valid inventory: {}", e);
                prop_assert!(e.is_configuration());
            }
            (Ok(_), chosen) => prop_assert!(false, "accepted {} primaries", chosen.len()),
        }
    }

    /// VIP priorities are unique, strictly descending, and the primary
    /// holds the highest one.
    #[test]
    fn vip_priorities_strictly_descending(
        control_planes in 1usize..10,
        workers in 0usize..4,
        base in 100u8..=255,
        step in 1u8..=10,
    ) {
        let config = inventory(control_planes, workers, &[0]);
        let topology = resolve(&config).unwrap();
        let mut vip = config.vip.clone();
        vip.priority_base = base;
        vip.priority_step = step;

        let group = VipCoordinator::new(vip, 6443).plan(&topology).unwrap();
        prop_assert_eq!(group.members.len(), control_planes);
        prop_assert_eq!(&group.master, &topology.primary().id);
        prop_assert_eq!(&group.members[0].node_id, &topology.primary().id);
        prop_assert_eq!(group.members[0].priority, base);
        for pair in group.members.windows(2) {
            prop_assert!(pair[0].priority > pair[1].priority);
        }
        prop_assert!(group.members.iter().all(|m| m.node_id.starts_with("cp-")));
    }
}

// ============================================================================
// Add-on ordering
// ============================================================================

proptest! {
    /// Every add-on comes after all of its dependencies.
    #[test]
    fn install_order_respects_dependencies(specs in addon_dag()) {
        let gate = AddonGate::new(specs.clone()).unwrap();
        let order = gate.order();
        prop_assert_eq!(order.len(), specs.len());

        let position: HashMap<&str, usize> =
            order.iter().enumerate().map(|(i, name)| (*name, i)).collect();
        for spec in &specs {
            for dep in &spec.depends_on {
                prop_assert!(
                    position[dep.as_str()] < position[spec.name.as_str()],
                    "{} installed before its dependency {}",
                    spec.name,
                    dep
                );
            }
        }
    }

    /// A dependency ring of any length is rejected as a cycle.
    #[test]
    fn dependency_rings_rejected(n in 1usize..8) {
        let specs: Vec<AddonSpec> = (0..n)
            .map(|i| {
                AddonSpec::new(format!("addon-{i}"), "1.0.0", format!("repo/addon-{i}"), "addons")
                    .depends_on([format!("addon-{}", (i + 1) % n)])
            })
            .collect();
        let err = AddonGate::new(specs).unwrap_err();
        prop_assert!(matches!(err, Error::AddonDependency(_)));
    }
}

// ============================================================================
// Retry
// ============================================================================

proptest! {
    /// Backoff grows monotonically and never exceeds the cap.
    #[test]
    fn backoff_monotonic_and_capped(
        initial_ms in 1u64..5_000,
        max_ms in 1u64..60_000,
        multiplier in 1.0f64..4.0,
    ) {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms),
            backoff_multiplier: multiplier,
        };
        let mut previous = Duration::ZERO;
        for attempt in 1..10 {
            let delay = policy.base_delay(attempt);
            prop_assert!(delay >= previous);
            prop_assert!(delay <= policy.max_delay);
            previous = delay;
        }
    }
}
