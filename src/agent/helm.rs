//! [`AddonInstaller`] that shells out to `helm upgrade --install`.
//!
//! `upgrade --install` converges a release to the descriptor, so a repeated
//! install of an unchanged add-on is a no-op on the cluster.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::agent::{AddonInstaller, AgentError, SshNodeAgent};
use crate::inventory::{AddonDescriptor, Node};

/// Extra time given to the process beyond helm's own `--timeout`.
const PROCESS_GRACE: Duration = Duration::from_secs(60);

/// Installs add-ons with the local `helm` binary.
pub struct HelmAddonInstaller {
    agent: SshNodeAgent,
    primary: Node,
    kubeconfig_path: PathBuf,
    timeout: Duration,
    kubeconfig: OnceCell<PathBuf>,
}

impl HelmAddonInstaller {
    /// `kubeconfig_path` is where the primary's admin kubeconfig is written
    /// before the first install.
    pub fn new(
        agent: SshNodeAgent,
        primary: Node,
        kubeconfig_path: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            agent,
            primary,
            kubeconfig_path: kubeconfig_path.into(),
            timeout,
            kubeconfig: OnceCell::new(),
        }
    }

    async fn kubeconfig(&self) -> Result<&PathBuf, AgentError> {
        self.kubeconfig
            .get_or_try_init(|| async {
                let raw = self.agent.admin_kubeconfig(&self.primary).await?;
                write_private(&self.kubeconfig_path, raw.as_bytes()).await?;
                info!(path = %self.kubeconfig_path.display(), "Wrote admin kubeconfig for helm");
                Ok(self.kubeconfig_path.clone())
            })
            .await
    }
}

async fn write_private(path: &Path, contents: &[u8]) -> Result<(), AgentError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, contents).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    Ok(())
}

/// Arguments for `helm upgrade --install`. Values are read from stdin.
pub fn helm_args(addon: &AddonDescriptor, kubeconfig: &str, timeout: Duration) -> Vec<String> {
    let mut args: Vec<String> = [
        "upgrade",
        "--install",
        addon.name.as_str(),
        addon.chart.as_str(),
        "--version",
        addon.version.as_str(),
        "--namespace",
        addon.namespace.as_str(),
        "--create-namespace",
        "--kubeconfig",
        kubeconfig,
        "--wait",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.push("--timeout".to_string());
    args.push(format!("{}s", timeout.as_secs()));
    if let Some(repo) = &addon.repository {
        args.push("--repo".to_string());
        args.push(repo.clone());
    }
    args.push("--values".to_string());
    args.push("-".to_string());
    args
}

/// Values document piped to helm. JSON is valid YAML.
fn values_document(addon: &AddonDescriptor) -> Result<Vec<u8>, AgentError> {
    let values = if addon.values.is_null() {
        serde_json::Value::Object(Default::default())
    } else {
        addon.values.clone()
    };
    serde_json::to_vec(&values)
        .map_err(|e| AgentError::Rejected(format!("values for {}: {e}", addon.name)))
}

#[async_trait]
impl AddonInstaller for HelmAddonInstaller {
    async fn install(&self, addon: &AddonDescriptor) -> Result<(), AgentError> {
        let kubeconfig = self.kubeconfig().await?;
        let args = helm_args(addon, &kubeconfig.display().to_string(), self.timeout);
        let values = values_document(addon)?;
        debug!(addon = %addon.name, args = ?args, "Running helm");

        let mut child = Command::new("helm")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&values).await?;
            stdin.shutdown().await?;
        }

        let limit = self.timeout + PROCESS_GRACE;
        let output = tokio::time::timeout(limit, child.wait_with_output())
            .await
            .map_err(|_| AgentError::Timeout {
                operation: format!("helm install {}", addon.name),
                duration: limit,
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AgentError::command_failed(
                "localhost",
                format!("helm upgrade --install {}", addon.name),
                output.status.code().unwrap_or(-1),
                stderr.trim(),
            ));
        }
        info!(addon = %addon.name, version = %addon.version, "Helm release converged");
        Ok(())
    }
}
