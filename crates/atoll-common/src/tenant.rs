use serde::{Deserialize, Serialize};

use crate::branding::BrandingConfig;

/// Where a tenant's stack runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeployTarget {
    /// Shared central cluster managed by the platform.
    Central,
    /// A cluster the platform manages on the tenant's behalf.
    ExternalCluster,
    /// Tenant-operated cluster; the platform only renders manifests.
    SelfHosted,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    Pending,
    Active,
    Suspended,
    Deleted,
}

/// A company record — the unit of isolation.
///
/// Stored under `/tenants/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    /// Globally unique identifier. Immutable after creation.
    pub id: String,

    /// URL- and DNS-safe short name (e.g. "acme").
    /// Format: `[a-z0-9][a-z0-9-]*`, max 40 chars.
    pub slug: String,

    /// Isolation boundary on the cluster. Derived from the slug at
    /// creation time and never changed afterwards.
    pub namespace: String,

    pub target: DeployTarget,

    pub status: TenantStatus,

    /// Service types this tenant has selected (subset of the catalog).
    #[serde(default)]
    pub services: Vec<String>,

    #[serde(default)]
    pub branding: BrandingConfig,

    /// Creation timestamp (ms since epoch).
    #[serde(default)]
    pub created_at_ms: u64,

    /// Last update timestamp (ms since epoch).
    #[serde(default)]
    pub updated_at_ms: u64,
}

impl Tenant {
    pub fn new(id: String, slug: String, target: DeployTarget, now_ms: u64) -> Self {
        let namespace = Self::namespace_for(&slug);
        Self {
            id,
            slug,
            namespace,
            target,
            status: TenantStatus::Pending,
            services: Vec::new(),
            branding: BrandingConfig::default(),
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        }
    }

    pub fn namespace_for(slug: &str) -> String {
        format!("tenant-{slug}")
    }

    pub fn valid_slug(slug: &str) -> bool {
        if slug.is_empty() || slug.len() > 40 {
            return false;
        }
        let mut chars = slug.chars();
        let first = chars.next().unwrap_or('-');
        if !first.is_ascii_lowercase() && !first.is_ascii_digit() {
            return false;
        }
        slug.chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_derived_from_slug() {
        let t = Tenant::new("t1".into(), "acme".into(), DeployTarget::Central, 0);
        assert_eq!(t.namespace, "tenant-acme");
    }

    #[test]
    fn slug_validation() {
        assert!(Tenant::valid_slug("acme"));
        assert!(Tenant::valid_slug("acme-corp-2"));
        assert!(!Tenant::valid_slug(""));
        assert!(!Tenant::valid_slug("-acme"));
        assert!(!Tenant::valid_slug("Acme"));
        assert!(!Tenant::valid_slug("acme corp"));
    }
}
