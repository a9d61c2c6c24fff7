use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, Result};
use dashmap::{DashMap, DashSet};

use atoll_common::{ResourceDescriptor, ResourceKind};

use crate::ClusterApi;

/// In-process cluster used by tests and single-node dev mode.
///
/// Workload readiness ramps up: a workload reports ready once it has
/// been observed `ready_after_checks` times, which exercises the
/// orchestrator's polling loop without real scheduling latency.
/// Failures are injected per resource name.
pub struct SimCluster {
    resources: DashMap<(String, ResourceKind, String), ResourceDescriptor>,
    readiness_checks: DashMap<String, u64>,
    failing: DashSet<String>,
    ready_after_checks: u64,
    apply_calls: AtomicU64,
}

impl SimCluster {
    pub fn new() -> Self {
        Self::with_readiness_ramp(1)
    }

    pub fn with_readiness_ramp(ready_after_checks: u64) -> Self {
        Self {
            resources: DashMap::new(),
            readiness_checks: DashMap::new(),
            failing: DashSet::new(),
            ready_after_checks,
            apply_calls: AtomicU64::new(0),
        }
    }

    /// Every apply of a resource with this name fails until cleared.
    pub fn fail_applies_for(&self, name: &str) {
        self.failing.insert(name.to_string());
    }

    pub fn clear_failures(&self) {
        self.failing.clear();
    }

    /// Resources currently live in a namespace, in canonical
    /// (kind, name) order — the same order manifests use, so tests can
    /// checksum-compare live state against a manifest.
    pub fn namespace_resources(&self, namespace: &str) -> Vec<ResourceDescriptor> {
        let mut out: Vec<ResourceDescriptor> = self
            .resources
            .iter()
            .filter(|e| e.key().0 == namespace)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(|a, b| (a.kind, a.name.clone()).cmp(&(b.kind, b.name.clone())));
        out
    }

    pub fn apply_calls(&self) -> u64 {
        self.apply_calls.load(Ordering::Relaxed)
    }
}

impl Default for SimCluster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ClusterApi for SimCluster {
    async fn apply(&self, resource: &ResourceDescriptor) -> Result<()> {
        self.apply_calls.fetch_add(1, Ordering::Relaxed);
        if self.failing.contains(&resource.name) {
            bail!("simulated apply failure for {}", resource.name);
        }
        let key = (
            resource.namespace.clone(),
            resource.kind,
            resource.name.clone(),
        );
        // Replacing a workload resets its readiness ramp.
        if resource.kind == ResourceKind::Workload {
            self.readiness_checks
                .remove(&format!("{}/{}", resource.namespace, resource.name));
        }
        self.resources.insert(key, resource.clone());
        Ok(())
    }

    async fn delete_resource(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<()> {
        self.resources
            .remove(&(namespace.to_string(), kind, name.to_string()));
        Ok(())
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<()> {
        self.resources.retain(|key, _| key.0 != namespace);
        self.readiness_checks
            .retain(|k, _| !k.starts_with(&format!("{namespace}/")));
        Ok(())
    }

    async fn workloads_ready(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<bool> {
        let matching: Vec<String> = self
            .resources
            .iter()
            .filter(|e| {
                let (ns, kind, _) = e.key();
                ns == namespace
                    && *kind == ResourceKind::Workload
                    && selector
                        .iter()
                        .all(|(k, v)| e.value().labels.get(k) == Some(v))
            })
            .map(|e| format!("{}/{}", namespace, e.key().2))
            .collect();

        if matching.is_empty() {
            return Ok(false);
        }

        let mut all_ready = true;
        for key in matching {
            let mut checks = self.readiness_checks.entry(key).or_insert(0);
            *checks += 1;
            if *checks < self.ready_after_checks {
                all_ready = false;
            }
        }
        Ok(all_ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn workload(ns: &str, name: &str) -> ResourceDescriptor {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), name.to_string());
        ResourceDescriptor {
            kind: ResourceKind::Workload,
            name: name.to_string(),
            namespace: ns.to_string(),
            labels,
            spec: json!({"replicas": 1}),
        }
    }

    fn selector(name: &str) -> BTreeMap<String, String> {
        let mut s = BTreeMap::new();
        s.insert("app".to_string(), name.to_string());
        s
    }

    #[tokio::test]
    async fn readiness_ramps_up() {
        let sim = SimCluster::with_readiness_ramp(2);
        sim.apply(&workload("ns", "web")).await.unwrap();
        assert!(!sim.workloads_ready("ns", &selector("web")).await.unwrap());
        assert!(sim.workloads_ready("ns", &selector("web")).await.unwrap());
    }

    #[tokio::test]
    async fn no_matching_workload_is_not_ready() {
        let sim = SimCluster::new();
        assert!(!sim.workloads_ready("ns", &selector("web")).await.unwrap());
    }

    #[tokio::test]
    async fn injected_failures_reject_apply() {
        let sim = SimCluster::new();
        sim.fail_applies_for("web");
        assert!(sim.apply(&workload("ns", "web")).await.is_err());
        sim.clear_failures();
        assert!(sim.apply(&workload("ns", "web")).await.is_ok());
    }

    #[tokio::test]
    async fn delete_namespace_clears_resources() {
        let sim = SimCluster::new();
        sim.apply(&workload("ns-a", "web")).await.unwrap();
        sim.apply(&workload("ns-b", "web")).await.unwrap();
        sim.delete_namespace("ns-a").await.unwrap();
        assert!(sim.namespace_resources("ns-a").is_empty());
        assert_eq!(sim.namespace_resources("ns-b").len(), 1);
    }
}
