use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Resource kinds the platform knows how to drive on a cluster.
///
/// Declaration order is apply order: namespace first, workloads and
/// their exposures last.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Namespace,
    Secret,
    PersistentVolumeClaim,
    ConfigMap,
    Workload,
    Service,
}

/// One cluster resource in provider-agnostic form. The `spec` payload is
/// opaque to the orchestrator; only the cluster adapter interprets it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub kind: ResourceKind,
    pub name: String,
    pub namespace: String,

    /// BTreeMap so serialization order is stable across renders.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    pub spec: serde_json::Value,
}

/// Immutable rendering output for one deployment attempt.
///
/// Stored under `/manifests/{deployment_id}` and never mutated; rollback
/// reapplies the last one whose deployment completed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub deployment_id: String,
    pub tenant_id: String,
    pub namespace: String,

    /// Caller-supplied render timestamp (ms). Excluded from the checksum
    /// so identical inputs re-render to an identical checksum.
    pub version_ms: u64,

    /// Sorted by (kind, name); the apply order.
    pub resources: Vec<ResourceDescriptor>,

    /// blake3 over the canonical JSON of `resources`.
    pub checksum: String,
}

impl Manifest {
    /// Checksum of a descriptor set. Resources must already be in their
    /// canonical (kind, name) order; the caller-supplied version field
    /// stays outside the checksum domain.
    pub fn checksum_of(resources: &[ResourceDescriptor]) -> String {
        let bytes = serde_json::to_vec(resources).unwrap_or_default();
        blake3::hash(&bytes).to_hex().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(kind: ResourceKind, name: &str) -> ResourceDescriptor {
        ResourceDescriptor {
            kind,
            name: name.to_string(),
            namespace: "tenant-acme".to_string(),
            labels: BTreeMap::new(),
            spec: serde_json::json!({"a": 1}),
        }
    }

    #[test]
    fn checksum_stable_across_calls() {
        let rs = vec![
            descriptor(ResourceKind::Namespace, "tenant-acme"),
            descriptor(ResourceKind::Workload, "dashboard"),
        ];
        assert_eq!(Manifest::checksum_of(&rs), Manifest::checksum_of(&rs));
    }

    #[test]
    fn checksum_sensitive_to_content() {
        let a = vec![descriptor(ResourceKind::Workload, "dashboard")];
        let b = vec![descriptor(ResourceKind::Workload, "mail")];
        assert_ne!(Manifest::checksum_of(&a), Manifest::checksum_of(&b));
    }

    #[test]
    fn kind_order_is_apply_order() {
        assert!(ResourceKind::Namespace < ResourceKind::Secret);
        assert!(ResourceKind::ConfigMap < ResourceKind::Workload);
        assert!(ResourceKind::Workload < ResourceKind::Service);
    }
}
