//! Add-on installation gate.
//!
//! Add-ons form a dependency graph. The gate validates the whole graph up
//! front (unknown names, enabled-on-disabled edges, cycles) and computes a
//! deterministic topological order: among add-ons whose dependencies are
//! satisfied, the one listed first in the configuration goes first.
//!
//! Installation only starts from `cluster_ready`. A dependent is never
//! started unless every dependency reached `installed`; dependents of a
//! failed add-on stay `not_started` and are reported as blocked.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde::Serialize;
use tracing::{info, warn};

use crate::bootstrap::context::Context;
use crate::bootstrap::error::{Error, Result};
use crate::bootstrap::readiness::{Readiness, ReadinessTarget};
use crate::bootstrap::state_machine::BootstrapEvent;
use crate::inventory::{AddonSpec, BootstrapPhase, InstallState};
use crate::retry::retry_with_backoff;

/// An add-on whose installer failed after all retries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AddonFailure {
    pub name: String,
    pub error: String,
}

/// An add-on left untouched because a dependency is not installed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockedAddon {
    pub name: String,
    pub waiting_on: Vec<String>,
}

/// Outcome of the gate.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddonReport {
    /// Installed add-ons, in installation order.
    pub installed: Vec<String>,
    pub failed: Vec<AddonFailure>,
    pub blocked: Vec<BlockedAddon>,
    /// Disabled add-ons, never considered.
    pub skipped: Vec<String>,
    pub states: BTreeMap<String, InstallState>,
}

impl AddonReport {
    pub fn enabled_count(&self) -> usize {
        self.installed.len() + self.failed.len() + self.blocked.len()
    }

    /// Every enabled add-on is installed.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.blocked.is_empty()
    }
}

/// Validated add-on set with its installation order.
#[derive(Clone, Debug)]
pub struct AddonGate {
    specs: Vec<AddonSpec>,
    /// Indices into `specs`, enabled add-ons only.
    order: Vec<usize>,
}

impl AddonGate {
    /// Validate the add-on graph and compute the installation order.
    ///
    /// No installer is called here, so every rejection happens before the
    /// first install.
    pub fn new(specs: Vec<AddonSpec>) -> Result<Self> {
        validate(&specs)?;
        let order = install_order(&specs)?;
        Ok(Self { specs, order })
    }

    /// Enabled add-on names, in installation order.
    pub fn order(&self) -> Vec<&str> {
        self.order
            .iter()
            .filter_map(|i| self.specs.get(*i))
            .map(|s| s.name.as_str())
            .collect()
    }

    pub fn state_of(&self, name: &str) -> Option<InstallState> {
        self.specs
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.install_state)
    }

    /// Install every enabled add-on, dependencies first.
    ///
    /// `phase` must be `cluster_ready`. The cluster is re-verified Ready
    /// before the first installer runs.
    pub async fn install(
        &mut self,
        ctx: &Context,
        phase: BootstrapPhase,
        expected_nodes: BTreeSet<String>,
    ) -> Result<AddonReport> {
        if phase != BootstrapPhase::ClusterReady {
            return Err(Error::InvalidTransition {
                from: phase,
                event: BootstrapEvent::AddonsInstalled,
            });
        }

        let target = ReadinessTarget::Cluster {
            expected: expected_nodes,
        };
        if let Readiness::TimedOut { waited, .. } = ctx
            .verifier
            .wait_for_ready(
                &target,
                ctx.settings.timeouts.addon_ready(),
                ctx.poll_interval(),
            )
            .await
        {
            return Err(Error::BootstrapTimeout {
                node: ctx.settings.cluster.name.clone(),
                phase,
                waited,
            });
        }

        let mut report = AddonReport {
            skipped: self
                .specs
                .iter()
                .filter(|s| !s.enabled)
                .map(|s| s.name.clone())
                .collect(),
            ..Default::default()
        };

        let order = self.order.clone();
        for idx in order {
            let Some(spec) = self.specs.get(idx) else {
                continue;
            };
            let waiting_on: Vec<String> = spec
                .depends_on
                .iter()
                .filter(|dep| self.state_of(dep) != Some(InstallState::Installed))
                .cloned()
                .collect();
            if !waiting_on.is_empty() {
                warn!(
                    addon = %spec.name,
                    waiting_on = %waiting_on.join(","),
                    "Dependencies not installed, leaving add-on untouched"
                );
                report.blocked.push(BlockedAddon {
                    name: spec.name.clone(),
                    waiting_on,
                });
                continue;
            }

            let descriptor = spec.descriptor();
            self.set_state(idx, InstallState::Installing);
            info!(addon = %descriptor.name, version = %descriptor.version, "Installing add-on");

            let installer = ctx.installer.as_ref();
            let result = retry_with_backoff(ctx.retry(), "install_addon", || {
                installer.install(&descriptor)
            })
            .await;

            match result {
                Ok(()) => {
                    self.set_state(idx, InstallState::Installed);
                    ctx.record_addon(&descriptor.name, "installed");
                    report.installed.push(descriptor.name.clone());
                }
                Err(e) => {
                    warn!(addon = %descriptor.name, error = %e, "Add-on installation failed");
                    self.set_state(idx, InstallState::Failed);
                    ctx.record_addon(&descriptor.name, "failed");
                    report.failed.push(AddonFailure {
                        name: descriptor.name.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        report.states = self
            .specs
            .iter()
            .map(|s| (s.name.clone(), s.install_state))
            .collect();
        Ok(report)
    }

    fn set_state(&mut self, idx: usize, state: InstallState) {
        if let Some(spec) = self.specs.get_mut(idx) {
            spec.install_state = state;
        }
    }
}

fn validate(specs: &[AddonSpec]) -> Result<()> {
    let mut seen = HashSet::new();
    for spec in specs {
        if spec.name.trim().is_empty() {
            return Err(Error::Configuration("add-on with empty name".into()));
        }
        if !seen.insert(spec.name.as_str()) {
            return Err(Error::Configuration(format!(
                "duplicate add-on {:?}",
                spec.name
            )));
        }
        if spec.chart.trim().is_empty() || spec.namespace.trim().is_empty() {
            return Err(Error::Configuration(format!(
                "add-on {} needs a chart and a namespace",
                spec.name
            )));
        }
        let version = spec.version.trim_start_matches('v');
        if semver::Version::parse(version).is_err() {
            return Err(Error::Configuration(format!(
                "add-on {} has invalid version {:?}",
                spec.name, spec.version
            )));
        }
    }

    let enabled: HashMap<&str, bool> = specs
        .iter()
        .map(|s| (s.name.as_str(), s.enabled))
        .collect();
    for spec in specs {
        for dep in &spec.depends_on {
            match enabled.get(dep.as_str()) {
                None => {
                    return Err(Error::AddonDependency(format!(
                        "add-on {} depends on unknown add-on {}",
                        spec.name, dep
                    )));
                }
                Some(false) if spec.enabled => {
                    return Err(Error::AddonDependency(format!(
                        "add-on {} is enabled but depends on disabled add-on {}",
                        spec.name, dep
                    )));
                }
                Some(_) => {}
            }
        }
    }
    Ok(())
}

/// Kahn's algorithm over enabled add-ons, ties broken by input position.
fn install_order(specs: &[AddonSpec]) -> Result<Vec<usize>> {
    let index: HashMap<&str, usize> = specs
        .iter()
        .enumerate()
        .filter(|(_, s)| s.enabled)
        .map(|(i, s)| (s.name.as_str(), i))
        .collect();

    let mut indegree: BTreeMap<usize, usize> = BTreeMap::new();
    let mut dependents: HashMap<usize, Vec<usize>> = HashMap::new();
    for (i, spec) in specs.iter().enumerate().filter(|(_, s)| s.enabled) {
        indegree.entry(i).or_insert(0);
        for dep in &spec.depends_on {
            if let Some(&d) = index.get(dep.as_str()) {
                *indegree.entry(i).or_insert(0) += 1;
                dependents.entry(d).or_default().push(i);
            }
        }
    }

    let mut ready: BTreeSet<usize> = indegree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(i, _)| *i)
        .collect();
    let mut order = Vec::with_capacity(indegree.len());

    while let Some(next) = ready.pop_first() {
        order.push(next);
        for dependent in dependents.get(&next).into_iter().flatten() {
            if let Some(deg) = indegree.get_mut(dependent) {
                *deg = deg.saturating_sub(1);
                if *deg == 0 {
                    ready.insert(*dependent);
                }
            }
        }
    }

    if order.len() < indegree.len() {
        let placed: HashSet<usize> = order.iter().copied().collect();
        let cyclic: Vec<&str> = indegree
            .keys()
            .filter(|i| !placed.contains(i))
            .filter_map(|i| specs.get(*i))
            .map(|s| s.name.as_str())
            .collect();
        return Err(Error::AddonDependency(format!(
            "dependency cycle among add-ons: {}",
            cyclic.join(", ")
        )));
    }
    Ok(order)
}
