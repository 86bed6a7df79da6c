//! Bootstrap phases of a cluster formation run.

use serde::{Deserialize, Serialize};

/// Phase of the cluster formation run.
///
/// Forward order is `Uninitialized → PrimaryInitializing → PrimaryReady →
/// ControlPlaneJoining → ControlPlaneComplete → WorkerJoining →
/// WorkersComplete → ClusterReady → AddonsComplete`. `Aborted` is terminal
/// and reachable from every non-terminal phase.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapPhase {
    /// Nothing has been done yet.
    #[default]
    Uninitialized,
    /// `kubeadm init` is running on the designated primary.
    PrimaryInitializing,
    /// The primary serves the API and reports Ready.
    PrimaryReady,
    /// A secondary control-plane node is joining.
    ControlPlaneJoining,
    /// Every control-plane node is a Ready member.
    ControlPlaneComplete,
    /// A worker node is joining.
    WorkerJoining,
    /// Every worker has either joined or been flagged failed.
    WorkersComplete,
    /// Node count matches the topology and all nodes report Ready.
    ClusterReady,
    /// Every enabled add-on is installed.
    AddonsComplete,
    /// Forward progress stopped on a fatal error.
    Aborted,
}

impl BootstrapPhase {
    /// All phases, in forward order with `Aborted` last.
    pub const ALL: [BootstrapPhase; 10] = [
        BootstrapPhase::Uninitialized,
        BootstrapPhase::PrimaryInitializing,
        BootstrapPhase::PrimaryReady,
        BootstrapPhase::ControlPlaneJoining,
        BootstrapPhase::ControlPlaneComplete,
        BootstrapPhase::WorkerJoining,
        BootstrapPhase::WorkersComplete,
        BootstrapPhase::ClusterReady,
        BootstrapPhase::AddonsComplete,
        BootstrapPhase::Aborted,
    ];

    /// Position along the forward path. `Aborted` has no position.
    pub fn ordinal(&self) -> Option<u8> {
        match self {
            BootstrapPhase::Uninitialized => Some(0),
            BootstrapPhase::PrimaryInitializing => Some(1),
            BootstrapPhase::PrimaryReady => Some(2),
            BootstrapPhase::ControlPlaneJoining => Some(3),
            BootstrapPhase::ControlPlaneComplete => Some(4),
            BootstrapPhase::WorkerJoining => Some(5),
            BootstrapPhase::WorkersComplete => Some(6),
            BootstrapPhase::ClusterReady => Some(7),
            BootstrapPhase::AddonsComplete => Some(8),
            BootstrapPhase::Aborted => None,
        }
    }

    /// Whether this phase is at or past `other` on the forward path.
    pub fn has_reached(&self, other: BootstrapPhase) -> bool {
        match (self.ordinal(), other.ordinal()) {
            (Some(a), Some(b)) => a >= b,
            _ => false,
        }
    }

    /// Whether the join credentials may exist in this phase.
    pub fn credentials_available(&self) -> bool {
        self.has_reached(BootstrapPhase::PrimaryReady)
    }

    /// Terminal phases accept no further events.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BootstrapPhase::AddonsComplete | BootstrapPhase::Aborted)
    }

    /// snake_case name, matching the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            BootstrapPhase::Uninitialized => "uninitialized",
            BootstrapPhase::PrimaryInitializing => "primary_initializing",
            BootstrapPhase::PrimaryReady => "primary_ready",
            BootstrapPhase::ControlPlaneJoining => "control_plane_joining",
            BootstrapPhase::ControlPlaneComplete => "control_plane_complete",
            BootstrapPhase::WorkerJoining => "worker_joining",
            BootstrapPhase::WorkersComplete => "workers_complete",
            BootstrapPhase::ClusterReady => "cluster_ready",
            BootstrapPhase::AddonsComplete => "addons_complete",
            BootstrapPhase::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for BootstrapPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
