//! [`NodeAgent`] over `ssh`.
//!
//! Every operation is a single shell command run through the system `ssh`
//! client with batch mode on. Commands are bounded by the configured
//! command timeout and logged with secrets redacted.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::agent::parsing::{
    kubeadm_failure_summary, parse_ca_cert_hash, parse_credential_record, parse_membership,
    redact,
};
use crate::agent::{AgentError, InitRequest, JoinRequest, NodeAgent};
use crate::bootstrap::credentials::StoredCredentials;
use crate::bootstrap::vip::{CHECK_SCRIPT_PATH, FailoverApply, FailoverInstance, KEEPALIVED_CONF_PATH};
use crate::inventory::{Node, SshSettings};

/// Written once the kubelet has joined; the membership marker.
pub const KUBELET_CONF_PATH: &str = "/etc/kubernetes/kubelet.conf";
/// Credential record kept on the primary for re-runs.
pub const CREDENTIAL_RECORD_PATH: &str = "/etc/kubernetes/bootstrap-credentials.json";
pub const ADMIN_CONF_PATH: &str = "/etc/kubernetes/admin.conf";
const CA_CERT_PATH: &str = "/etc/kubernetes/pki/ca.crt";

/// Runs node operations through the system `ssh` client.
#[derive(Clone, Debug)]
pub struct SshNodeAgent {
    settings: SshSettings,
}

impl SshNodeAgent {
    pub fn new(settings: SshSettings) -> Self {
        Self { settings }
    }

    fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.command_timeout_secs)
    }

    fn ssh_args(&self, node: &Node) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.settings.connect_timeout_secs),
            "-p".to_string(),
            self.settings.port.to_string(),
        ];
        if let Some(identity) = &self.settings.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args.push(format!("{}@{}", self.settings.user, node.address));
        args
    }

    fn privileged(&self, command: &str) -> String {
        if self.settings.sudo {
            format!("sudo -n sh -c {}", shell_quote(command))
        } else {
            command.to_string()
        }
    }

    /// Run `command` on `node` and return its stdout.
    async fn exec(
        &self,
        node: &Node,
        operation: &str,
        command: &str,
        stdin: Option<&[u8]>,
        secrets: &[&str],
    ) -> Result<String, AgentError> {
        let logged = redact(command, secrets);
        debug!(node = %node.id, operation, command = %logged, "Running remote command");

        let mut child = Command::new("ssh")
            .args(self.ssh_args(node))
            .arg(self.privileged(command))
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input).await?;
            pipe.shutdown().await?;
        }

        let timeout = self.command_timeout();
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| AgentError::Timeout {
                operation: format!("{operation} on {}", node.id),
                duration: timeout,
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AgentError::command_failed(
                &node.id,
                logged,
                output.status.code().unwrap_or(-1),
                redact(&kubeadm_failure_summary(&stderr), secrets),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn write_file(
        &self,
        node: &Node,
        path: &str,
        mode: &str,
        contents: &[u8],
        secrets: &[&str],
    ) -> Result<(), AgentError> {
        let command = format!("install -D -m {mode} /dev/stdin {path}");
        self.exec(node, "write_file", &command, Some(contents), secrets)
            .await
            .map(|_| ())
    }

    async fn read_file(&self, node: &Node, path: &str) -> Result<String, AgentError> {
        let command = format!("cat {path} 2>/dev/null || true");
        self.exec(node, "read_file", &command, None, &[]).await
    }

    async fn store_credentials(
        &self,
        primary: &Node,
        credentials: &StoredCredentials,
    ) -> Result<(), AgentError> {
        let record = serde_json::to_vec(credentials)
            .map_err(|e| AgentError::Rejected(format!("serializing credential record: {e}")))?;
        self.write_file(
            primary,
            CREDENTIAL_RECORD_PATH,
            "600",
            &record,
            &[
                credentials.join_token.expose(),
                credentials.certificate_key.expose(),
            ],
        )
        .await
    }

    /// Admin kubeconfig of an initialized control-plane node.
    pub async fn admin_kubeconfig(&self, primary: &Node) -> Result<String, AgentError> {
        let kubeconfig = self
            .exec(primary, "read_admin_kubeconfig", &format!("cat {ADMIN_CONF_PATH}"), None, &[])
            .await?;
        if kubeconfig.trim().is_empty() {
            return Err(AgentError::Kubeconfig(format!(
                "{ADMIN_CONF_PATH} on {} is empty",
                primary.id
            )));
        }
        Ok(kubeconfig)
    }
}

#[async_trait]
impl NodeAgent for SshNodeAgent {
    async fn is_cluster_member(&self, node: &Node) -> Result<bool, AgentError> {
        let command =
            format!("if test -f {KUBELET_CONF_PATH}; then echo member; else echo absent; fi");
        let output = self
            .exec(node, "is_cluster_member", &command, None, &[])
            .await?;
        Ok(parse_membership(&output)?)
    }

    async fn init_primary(&self, node: &Node, request: &InitRequest) -> Result<(), AgentError> {
        let token = request.credentials.join_token.expose();
        let key = request.credentials.certificate_key.expose();

        let mut command = format!(
            "kubeadm init --control-plane-endpoint {} --apiserver-advertise-address {} \
             --apiserver-bind-port {} --upload-certs --certificate-key {key} --token {token} \
             --token-ttl {}s --pod-network-cidr {} --service-cidr {}",
            request.control_plane_endpoint,
            request.advertise_address,
            request.api_server_port,
            request.token_ttl.as_secs(),
            request.pod_network_cidr,
            request.service_cidr,
        );
        if let Some(version) = &request.kubernetes_version {
            command.push_str(&format!(" --kubernetes-version {version}"));
        }

        info!(node = %node.id, "Running kubeadm init");
        self.exec(node, "init_primary", &command, None, &[token, key])
            .await?;
        self.store_credentials(node, &request.credentials).await
    }

    async fn read_credentials(
        &self,
        primary: &Node,
    ) -> Result<Option<StoredCredentials>, AgentError> {
        let output = self.read_file(primary, CREDENTIAL_RECORD_PATH).await?;
        Ok(parse_credential_record(&output)?)
    }

    async fn publish_credentials(
        &self,
        primary: &Node,
        credentials: &StoredCredentials,
        ttl: Duration,
    ) -> Result<(), AgentError> {
        let token = credentials.join_token.expose();
        let key = credentials.certificate_key.expose();
        let command = format!(
            "kubeadm token create {token} --ttl {}s --kubeconfig {ADMIN_CONF_PATH} && \
             kubeadm init phase upload-certs --upload-certs --certificate-key {key}",
            ttl.as_secs()
        );
        self.exec(primary, "publish_credentials", &command, None, &[token, key])
            .await?;
        self.store_credentials(primary, credentials).await
    }

    async fn ca_cert_hash(&self, primary: &Node) -> Result<String, AgentError> {
        let command = format!(
            "openssl x509 -pubkey -in {CA_CERT_PATH} | \
             openssl rsa -pubin -outform der 2>/dev/null | \
             openssl dgst -sha256 -hex"
        );
        let output = self
            .exec(primary, "ca_cert_hash", &command, None, &[])
            .await?;
        Ok(parse_ca_cert_hash(&output)?)
    }

    async fn join(&self, node: &Node, request: &JoinRequest) -> Result<(), AgentError> {
        let token = request.credentials.join_token.expose();
        let key = request.credentials.cert_encryption_key.expose();

        let mut command = format!(
            "kubeadm join {} --token {token} --discovery-token-ca-cert-hash {}",
            request.api_endpoint, request.credentials.ca_cert_hash
        );
        if request.control_plane {
            command.push_str(&format!(
                " --control-plane --certificate-key {key} --apiserver-advertise-address {}",
                request.advertise_address
            ));
        }

        info!(node = %node.id, control_plane = request.control_plane, "Running kubeadm join");
        self.exec(node, "join", &command, None, &[token, key])
            .await
            .map(|_| ())
    }

    async fn configure_failover(
        &self,
        node: &Node,
        instance: &FailoverInstance,
    ) -> Result<FailoverApply, AgentError> {
        let conf = instance.render_keepalived_conf();
        let script = instance.render_check_script();

        let current_conf = self.read_file(node, KEEPALIVED_CONF_PATH).await?;
        let current_script = self.read_file(node, CHECK_SCRIPT_PATH).await?;
        let apply = if current_conf == conf && current_script == script {
            debug!(node = %node.id, "keepalived configuration unchanged");
            FailoverApply::Unchanged
        } else {
            self.write_file(node, CHECK_SCRIPT_PATH, "755", script.as_bytes(), &[])
                .await?;
            self.write_file(node, KEEPALIVED_CONF_PATH, "644", conf.as_bytes(), &[])
                .await?;
            FailoverApply::Changed
        };

        // keepalived may have stopped since the last run even if its files match.
        self.exec(node, "ensure_keepalived", keepalived_command(apply), None, &[])
            .await?;
        Ok(apply)
    }
}

/// Service command run after the failover files are in place.
fn keepalived_command(apply: FailoverApply) -> &'static str {
    match apply {
        FailoverApply::Unchanged => "systemctl enable --now keepalived",
        FailoverApply::Changed => {
            "systemctl enable --now keepalived && (systemctl reload keepalived || systemctl restart keepalived)"
        }
    }
}

/// Quote a string for a POSIX shell.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
