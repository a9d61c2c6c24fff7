use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;

use atoll_common::{ResourceDescriptor, ResourceKind};

pub mod agent;
pub mod sim;

pub use agent::AgentCluster;
pub use sim::SimCluster;

/// Provider-agnostic cluster-management surface.
///
/// The orchestrator only ever drives a cluster through this trait;
/// namespace creation is an `apply` of a Namespace descriptor, and
/// readiness is observed, never awaited, so callers control their own
/// polling budget.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Create or update one resource. Idempotent: re-applying an
    /// identical descriptor is a no-op on the cluster side.
    async fn apply(&self, resource: &ResourceDescriptor) -> Result<()>;

    async fn delete_resource(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<()>;

    /// Delete a namespace and everything in it.
    async fn delete_namespace(&self, namespace: &str) -> Result<()>;

    /// Whether every workload matching the label selector in the
    /// namespace currently reports ready. False when no matching
    /// workload exists yet.
    async fn workloads_ready(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<bool>;
}
