//! Diagnostic hints for failed or stuck nodes.
//!
//! Nothing is rolled back automatically. When a run stops, these hints
//! give the operator the commands to inspect the node and, if needed,
//! reset it before re-running.

use std::fmt;

use crate::inventory::BootstrapPhase;

const ADMIN_KUBECONFIG: &str = "/etc/kubernetes/admin.conf";

/// A diagnostic command that can be run to investigate an issue.
#[derive(Debug, Clone)]
pub struct DiagnosticCommand {
    /// Description of what this command checks.
    pub description: &'static str,
    /// The actual command to run.
    pub command: String,
}

impl DiagnosticCommand {
    fn new(description: &'static str, command: impl Into<String>) -> Self {
        Self {
            description,
            command: command.into(),
        }
    }
}

/// Where the hint points.
#[derive(Debug, Clone)]
pub struct HintTarget<'a> {
    /// Node the problem is attributed to.
    pub node: &'a str,
    /// SSH address of that node.
    pub address: &'a str,
    /// SSH address of the primary, where admin commands run.
    pub primary_address: &'a str,
    /// Shared control-plane endpoint (`host:port`).
    pub api_endpoint: &'a str,
}

/// Diagnostic hint for a failed phase.
///
/// Contains a description of the likely issue and a list of commands
/// that operators can run to diagnose the problem.
#[derive(Debug, Clone)]
pub struct DiagnosticHint {
    /// Summary of the likely issue.
    pub summary: &'static str,
    /// Common causes of this issue.
    pub common_causes: Vec<&'static str>,
    /// Commands to run to diagnose the issue.
    pub commands: Vec<DiagnosticCommand>,
}

impl DiagnosticHint {
    /// Generate a diagnostic hint for a node that stopped in `phase`.
    pub fn for_phase(phase: BootstrapPhase, target: &HintTarget<'_>) -> Self {
        match phase {
            BootstrapPhase::Uninitialized | BootstrapPhase::PrimaryInitializing => {
                Self::primary_init(target)
            }
            BootstrapPhase::PrimaryReady | BootstrapPhase::ControlPlaneJoining => {
                Self::control_plane_join(target)
            }
            BootstrapPhase::ControlPlaneComplete | BootstrapPhase::WorkerJoining => {
                Self::worker_join(target)
            }
            BootstrapPhase::WorkersComplete => Self::cluster_verification(target),
            BootstrapPhase::ClusterReady => Self::addons(target),
            BootstrapPhase::AddonsComplete | BootstrapPhase::Aborted => Self::general(target),
        }
    }

    fn primary_init(t: &HintTarget<'_>) -> Self {
        Self {
            summary: "kubeadm init did not produce a healthy API server",
            common_causes: vec![
                "Container runtime not running or misconfigured cgroup driver",
                "Swap enabled or required kernel modules missing",
                "VIP not bound on the primary, so the control-plane endpoint is unreachable",
                "Port 6443 or 2379-2380 already in use",
            ],
            commands: vec![
                DiagnosticCommand::new(
                    "Check kubelet logs",
                    format!("ssh {} sudo journalctl -u kubelet --no-pager -n 100", t.address),
                ),
                DiagnosticCommand::new(
                    "Check control-plane containers",
                    format!("ssh {} sudo crictl ps -a", t.address),
                ),
                DiagnosticCommand::new(
                    "Check which node holds the VIP",
                    format!("ssh {} sudo systemctl status keepalived --no-pager", t.address),
                ),
                DiagnosticCommand::new(
                    "Probe the API through the VIP",
                    format!("curl -k https://{}/healthz", t.api_endpoint),
                ),
                DiagnosticCommand::new(
                    "Reset the node before re-running (CAUTION: destroys local cluster state)",
                    format!("ssh {} sudo kubeadm reset -f", t.address),
                ),
            ],
        }
    }

    fn control_plane_join(t: &HintTarget<'_>) -> Self {
        Self {
            summary: "Control-plane join failed or the node never became Ready",
            common_causes: vec![
                "Uploaded certificates expired (they are deleted two hours after upload)",
                "Join token expired or deleted",
                "etcd cannot reach quorum with the new member",
                "Node cannot reach the control-plane endpoint",
            ],
            commands: vec![
                DiagnosticCommand::new(
                    "Check kubelet logs on the joining node",
                    format!("ssh {} sudo journalctl -u kubelet --no-pager -n 100", t.address),
                ),
                DiagnosticCommand::new(
                    "List bootstrap tokens on the primary",
                    format!(
                        "ssh {} sudo kubeadm token list --kubeconfig {ADMIN_KUBECONFIG}",
                        t.primary_address
                    ),
                ),
                DiagnosticCommand::new(
                    "Check registered nodes",
                    format!(
                        "ssh {} sudo kubectl --kubeconfig {ADMIN_KUBECONFIG} get nodes -o wide",
                        t.primary_address
                    ),
                ),
                DiagnosticCommand::new(
                    "Check etcd pods",
                    format!(
                        "ssh {} sudo kubectl --kubeconfig {ADMIN_KUBECONFIG} -n kube-system get pods -l component=etcd -o wide",
                        t.primary_address
                    ),
                ),
                DiagnosticCommand::new(
                    "Reset the node before re-running (CAUTION: also remove its etcd member)",
                    format!("ssh {} sudo kubeadm reset -f", t.address),
                ),
            ],
        }
    }

    fn worker_join(t: &HintTarget<'_>) -> Self {
        Self {
            summary: "Worker join failed or the node never became Ready",
            common_causes: vec![
                "Join token expired or deleted",
                "Worker cannot reach the control-plane endpoint",
                "CA certificate hash mismatch",
                "Container runtime not running on the worker",
            ],
            commands: vec![
                DiagnosticCommand::new(
                    "Check kubelet logs on the worker",
                    format!("ssh {} sudo journalctl -u kubelet --no-pager -n 100", t.address),
                ),
                DiagnosticCommand::new(
                    "Check the endpoint from the worker",
                    format!("ssh {} curl -k https://{}/healthz", t.address, t.api_endpoint),
                ),
                DiagnosticCommand::new(
                    "Describe the node",
                    format!(
                        "ssh {} sudo kubectl --kubeconfig {ADMIN_KUBECONFIG} describe node {}",
                        t.primary_address, t.node
                    ),
                ),
                DiagnosticCommand::new(
                    "Reset the worker before re-running",
                    format!("ssh {} sudo kubeadm reset -f", t.address),
                ),
            ],
        }
    }

    fn cluster_verification(t: &HintTarget<'_>) -> Self {
        Self {
            summary: "Nodes joined but the cluster did not report all nodes Ready",
            common_causes: vec![
                "Pod network not installed yet, so nodes stay NotReady",
                "A node registered under a different hostname",
                "kubelet on a node cannot renew its certificate",
            ],
            commands: vec![
                DiagnosticCommand::new(
                    "Check node status",
                    format!(
                        "ssh {} sudo kubectl --kubeconfig {ADMIN_KUBECONFIG} get nodes -o wide",
                        t.primary_address
                    ),
                ),
                DiagnosticCommand::new(
                    "Check node conditions",
                    format!(
                        "ssh {} sudo kubectl --kubeconfig {ADMIN_KUBECONFIG} describe node {}",
                        t.primary_address, t.node
                    ),
                ),
                DiagnosticCommand::new(
                    "Check system pods",
                    format!(
                        "ssh {} sudo kubectl --kubeconfig {ADMIN_KUBECONFIG} -n kube-system get pods -o wide",
                        t.primary_address
                    ),
                ),
            ],
        }
    }

    fn addons(t: &HintTarget<'_>) -> Self {
        Self {
            summary: "Add-on installation failed",
            common_causes: vec![
                "Chart repository unreachable",
                "Chart values rejected by the chart schema",
                "A dependency add-on is installed but its pods are not Ready",
            ],
            commands: vec![
                DiagnosticCommand::new("List Helm releases", "helm list -A"),
                DiagnosticCommand::new(
                    "Check failing pods",
                    format!(
                        "ssh {} sudo kubectl --kubeconfig {ADMIN_KUBECONFIG} get pods -A --field-selector=status.phase!=Running",
                        t.primary_address
                    ),
                ),
                DiagnosticCommand::new(
                    "Check recent events",
                    format!(
                        "ssh {} sudo kubectl --kubeconfig {ADMIN_KUBECONFIG} get events -A --sort-by=.lastTimestamp",
                        t.primary_address
                    ),
                ),
            ],
        }
    }

    fn general(t: &HintTarget<'_>) -> Self {
        Self {
            summary: "Run stopped, check the recorded error and the node state",
            common_causes: vec![
                "A fatal error was recorded earlier in the run",
                "The node is unreachable over SSH",
            ],
            commands: vec![
                DiagnosticCommand::new(
                    "Check SSH reachability",
                    format!("ssh {} true", t.address),
                ),
                DiagnosticCommand::new(
                    "Check the membership marker",
                    format!("ssh {} sudo test -f /etc/kubernetes/kubelet.conf && echo member", t.address),
                ),
                DiagnosticCommand::new(
                    "Check keepalived",
                    format!("ssh {} sudo journalctl -u keepalived --no-pager -n 50", t.address),
                ),
            ],
        }
    }
}

impl fmt::Display for DiagnosticHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Issue: {}", self.summary)?;
        writeln!(f)?;
        writeln!(f, "Common causes:")?;
        for cause in &self.common_causes {
            writeln!(f, "  - {cause}")?;
        }
        writeln!(f)?;
        writeln!(f, "Diagnostic commands:")?;
        for (i, cmd) in self.commands.iter().enumerate() {
            writeln!(f, "  {}. {}", i + 1, cmd.description)?;
            writeln!(f, "     $ {}", cmd.command)?;
        }
        Ok(())
    }
}
