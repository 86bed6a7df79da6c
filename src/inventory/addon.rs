//! Add-on descriptors and the default add-on catalog.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Installation progress of an add-on.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InstallState {
    #[default]
    NotStarted,
    Installing,
    Installed,
    Failed,
}

impl std::fmt::Display for InstallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstallState::NotStarted => write!(f, "not_started"),
            InstallState::Installing => write!(f, "installing"),
            InstallState::Installed => write!(f, "installed"),
            InstallState::Failed => write!(f, "failed"),
        }
    }
}

/// Declarative add-on descriptor.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AddonSpec {
    /// Unique add-on name, also the Helm release name.
    pub name: String,
    /// Chart version.
    pub version: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Names of add-ons that must be installed first.
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    /// Chart reference (`repo/chart` or OCI URL).
    pub chart: String,
    /// Helm repository URL, when the chart is not OCI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    /// Target namespace.
    pub namespace: String,
    /// Helm values passed through to the installer.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub values: serde_json::Value,
    /// Owned by the add-on gate; never read from configuration.
    #[serde(default, skip_deserializing)]
    pub install_state: InstallState,
}

fn default_enabled() -> bool {
    true
}

impl AddonSpec {
    /// Create an enabled add-on with no dependencies.
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        chart: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            enabled: true,
            depends_on: BTreeSet::new(),
            chart: chart.into(),
            repository: None,
            namespace: namespace.into(),
            values: serde_json::Value::Null,
            install_state: InstallState::NotStarted,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn repository(mut self, url: impl Into<String>) -> Self {
        self.repository = Some(url.into());
        self
    }

    pub fn values(mut self, values: serde_json::Value) -> Self {
        self.values = values;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Desired-state descriptor handed to the installer.
    pub fn descriptor(&self) -> AddonDescriptor {
        AddonDescriptor {
            name: self.name.clone(),
            version: self.version.clone(),
            chart: self.chart.clone(),
            repository: self.repository.clone(),
            namespace: self.namespace.clone(),
            values: self.values.clone(),
        }
    }
}

/// What an installer receives. Installers must treat it as desired state.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct AddonDescriptor {
    pub name: String,
    pub version: String,
    pub chart: String,
    pub repository: Option<String>,
    pub namespace: String,
    pub values: serde_json::Value,
}

/// Built-in add-on set used when the configuration does not list add-ons.
///
/// `ingress-nginx` needs MetalLB for its LoadBalancer address and
/// cert-manager for TLS annotations. Everything depends on the CNI.
pub fn default_catalog() -> Vec<AddonSpec> {
    vec![
        AddonSpec::new(
            "cni",
            "v3.28.1",
            "projectcalico/tigera-operator",
            "tigera-operator",
        )
        .repository("https://docs.tigera.io/calico/charts"),
        AddonSpec::new("metallb", "0.14.8", "metallb/metallb", "metallb-system")
            .repository("https://metallb.github.io/metallb")
            .depends_on(["cni"]),
        AddonSpec::new(
            "cert-manager",
            "v1.15.3",
            "jetstack/cert-manager",
            "cert-manager",
        )
        .repository("https://charts.jetstack.io")
        .values(serde_json::json!({ "crds": { "enabled": true } }))
        .depends_on(["cni"]),
        AddonSpec::new(
            "ingress-nginx",
            "4.11.2",
            "ingress-nginx/ingress-nginx",
            "ingress-nginx",
        )
        .repository("https://kubernetes.github.io/ingress-nginx")
        .depends_on(["metallb", "cert-manager"]),
        AddonSpec::new("longhorn", "1.7.1", "longhorn/longhorn", "longhorn-system")
            .repository("https://charts.longhorn.io")
            .depends_on(["cni"]),
        AddonSpec::new(
            "nfs-csi",
            "v4.9.0",
            "csi-driver-nfs/csi-driver-nfs",
            "kube-system",
        )
        .repository("https://raw.githubusercontent.com/kubernetes-csi/csi-driver-nfs/master/charts")
        .depends_on(["cni"]),
    ]
}
