//! [`ClusterProbe`] backed by a `kube` client.
//!
//! The client is built from the primary's admin kubeconfig, which only
//! exists after `kubeadm init`. Until then every probe fails and the
//! readiness verifier treats the failure as "not ready yet".

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node as KubeNode;
use kube::api::{Api, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tokio::sync::OnceCell;
use tracing::debug;

use crate::agent::{AgentError, ClusterProbe, SshNodeAgent};
use crate::inventory::Node;

/// Probes the API server and node conditions.
pub struct KubeClusterProbe {
    agent: SshNodeAgent,
    primary: Node,
    client: OnceCell<Client>,
}

impl KubeClusterProbe {
    /// Probe that fetches the admin kubeconfig from `primary` on first use.
    pub fn new(agent: SshNodeAgent, primary: Node) -> Self {
        Self {
            agent,
            primary,
            client: OnceCell::new(),
        }
    }

    async fn client(&self) -> Result<&Client, AgentError> {
        self.client
            .get_or_try_init(|| async {
                let raw = self.agent.admin_kubeconfig(&self.primary).await?;
                let client = client_from_kubeconfig(&raw).await?;
                debug!(primary = %self.primary.id, "Built API client from admin kubeconfig");
                Ok(client)
            })
            .await
    }
}

/// Build a client from kubeconfig YAML.
pub async fn client_from_kubeconfig(raw: &str) -> Result<Client, AgentError> {
    let kubeconfig =
        Kubeconfig::from_yaml(raw).map_err(|e| AgentError::Kubeconfig(e.to_string()))?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| AgentError::Kubeconfig(e.to_string()))?;
    Ok(Client::try_from(config)?)
}

/// `Ready` condition of a node is `True`.
pub fn is_node_ready(node: &KubeNode) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

#[async_trait]
impl ClusterProbe for KubeClusterProbe {
    async fn api_server_healthy(&self) -> Result<bool, AgentError> {
        let client = self.client().await?;
        let version = client.apiserver_version().await?;
        debug!(version = %version.git_version, "API server answered");
        Ok(true)
    }

    async fn node_ready(&self, node_id: &str) -> Result<bool, AgentError> {
        let nodes: Api<KubeNode> = Api::all(self.client().await?.clone());
        Ok(nodes.get_opt(node_id).await?.is_some_and(|n| is_node_ready(&n)))
    }

    async fn node_readiness(&self) -> Result<BTreeMap<String, bool>, AgentError> {
        let nodes: Api<KubeNode> = Api::all(self.client().await?.clone());
        let list = nodes.list(&ListParams::default()).await?;
        Ok(list
            .items
            .iter()
            .filter_map(|n| n.metadata.name.clone().map(|name| (name, is_node_ready(n))))
            .collect())
    }
}
