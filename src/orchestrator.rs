//! Workload-inventory capability.
//!
//! The daemon needs exactly two things from the orchestrator: whether a
//! workload still exists (to decide if a persisted lease is still wanted)
//! and the ability to flag this node's DHCP service as unavailable. The
//! trait keeps the daemon decoupled from any particular client library.

use std::env;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::debug;

use crate::error::{Error, Result};

#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Whether a workload with this namespace and name currently exists.
    /// `Err` means the inventory could not be consulted at all.
    async fn workload_exists(&self, namespace: &str, name: &str) -> Result<bool>;

    /// Posts (or clears) the node condition saying DHCP is down here.
    async fn set_node_offline(&self, node: &str, offline: bool) -> Result<()>;
}

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Talks to the Kubernetes API using the in-cluster service account.
pub struct KubeOrchestrator {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl KubeOrchestrator {
    /// Builds a client from the in-cluster environment: the API service
    /// host/port variables, the mounted service-account token, and the
    /// cluster CA bundle.
    pub fn from_cluster_env(timeout: Option<Duration>) -> Result<Self> {
        let host = env::var("KUBERNETES_SERVICE_HOST").map_err(|_| {
            Error::OrchestratorUnreachable(
                "KUBERNETES_SERVICE_HOST is not set; not running in a cluster".to_string(),
            )
        })?;
        let port = env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());

        let token = std::fs::read_to_string(format!("{}/token", SERVICE_ACCOUNT_DIR))
            .map_err(|error| {
                Error::OrchestratorUnreachable(format!("reading service account token: {}", error))
            })?
            .trim()
            .to_string();

        let ca_bundle = std::fs::read(format!("{}/ca.crt", SERVICE_ACCOUNT_DIR)).map_err(
            |error| Error::OrchestratorUnreachable(format!("reading cluster CA: {}", error)),
        )?;
        let certificate = reqwest::Certificate::from_pem(&ca_bundle).map_err(|error| {
            Error::OrchestratorUnreachable(format!("parsing cluster CA: {}", error))
        })?;

        let mut builder = reqwest::Client::builder().add_root_certificate(certificate);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(|error| {
            Error::OrchestratorUnreachable(format!("building API client: {}", error))
        })?;

        Ok(Self {
            client,
            base_url: format!("https://{}:{}", host, port),
            token,
        })
    }
}

#[async_trait]
impl Orchestrator for KubeOrchestrator {
    async fn workload_exists(&self, namespace: &str, name: &str) -> Result<bool> {
        let url = format!(
            "{}/api/v1/namespaces/{}/pods/{}",
            self.base_url, namespace, name
        );
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|error| Error::OrchestratorUnreachable(error.to_string()))?;

        let status = response.status();
        debug!("GET {} -> {}", url, status);
        if status == reqwest::StatusCode::OK {
            Ok(true)
        } else if status == reqwest::StatusCode::NOT_FOUND {
            Ok(false)
        } else {
            Err(Error::OrchestratorUnreachable(format!(
                "unexpected status {} for pod {}/{}",
                status, namespace, name
            )))
        }
    }

    async fn set_node_offline(&self, node: &str, offline: bool) -> Result<()> {
        let (status, reason, message) = if offline {
            (
                "True",
                "DHCPIsDown",
                "DHCP daemon is shutting down on this node",
            )
        } else {
            ("False", "DHCPIsUp", "DHCP daemon is running on this node")
        };

        let now = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        let patch = json!({
            "status": {
                "conditions": [{
                    "type": "NetworkUnavailable",
                    "status": status,
                    "reason": reason,
                    "message": message,
                    "lastTransitionTime": now,
                    "lastHeartbeatTime": now,
                }]
            }
        });

        let url = format!("{}/api/v1/nodes/{}/status", self.base_url, node);
        let response = self
            .client
            .patch(&url)
            .bearer_auth(&self.token)
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/strategic-merge-patch+json",
            )
            .json(&patch)
            .send()
            .await
            .map_err(|error| Error::OrchestratorUnreachable(error.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::OrchestratorUnreachable(format!(
                "patching node {} status: {}",
                node,
                response.status()
            )));
        }
        Ok(())
    }
}
