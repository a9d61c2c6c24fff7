use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use atoll_common::{ResourceDescriptor, ResourceKind};

use crate::ClusterApi;

/// Drives a remote cluster agent over its management REST API.
///
/// The agent translates provider-agnostic descriptors into whatever the
/// underlying orchestration platform wants; this client only speaks the
/// agent contract.
pub struct AgentCluster {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct ReadyResponse {
    ready: bool,
}

impl AgentCluster {
    pub fn new(base_url: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build cluster agent client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn kind_segment(kind: ResourceKind) -> &'static str {
        match kind {
            ResourceKind::Namespace => "namespaces",
            ResourceKind::Secret => "secrets",
            ResourceKind::PersistentVolumeClaim => "pvcs",
            ResourceKind::ConfigMap => "configmaps",
            ResourceKind::Workload => "workloads",
            ResourceKind::Service => "services",
        }
    }
}

#[async_trait::async_trait]
impl ClusterApi for AgentCluster {
    async fn apply(&self, resource: &ResourceDescriptor) -> Result<()> {
        let url = format!(
            "{}/v1/namespaces/{}/{}/{}",
            self.base_url,
            resource.namespace,
            Self::kind_segment(resource.kind),
            resource.name
        );
        let resp = self.http.put(&url).json(resource).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("agent rejected apply of {} ({status}): {body}", resource.name);
        }
        Ok(())
    }

    async fn delete_resource(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<()> {
        let url = format!(
            "{}/v1/namespaces/{}/{}/{}",
            self.base_url,
            namespace,
            Self::kind_segment(kind),
            name
        );
        let resp = self.http.delete(&url).send().await?;
        // 404 counts as deleted.
        if !resp.status().is_success() && resp.status().as_u16() != 404 {
            bail!("agent rejected delete of {name}: {}", resp.status());
        }
        Ok(())
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<()> {
        let url = format!("{}/v1/namespaces/{}", self.base_url, namespace);
        let resp = self.http.delete(&url).send().await?;
        if !resp.status().is_success() && resp.status().as_u16() != 404 {
            bail!("agent rejected namespace delete: {}", resp.status());
        }
        Ok(())
    }

    async fn workloads_ready(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<bool> {
        let labels = selector
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        let url = format!(
            "{}/v1/namespaces/{}/workloads/ready",
            self.base_url, namespace
        );
        let resp = self
            .http
            .get(&url)
            .query(&[("selector", labels.as_str())])
            .send()
            .await?;
        if !resp.status().is_success() {
            bail!("agent readiness query failed: {}", resp.status());
        }
        let body: ReadyResponse = resp.json().await?;
        Ok(body.ready)
    }
}
