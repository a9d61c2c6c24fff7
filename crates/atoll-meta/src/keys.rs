//! Key layout for every record the platform persists.
//!
//! Events are zero-padded so a prefix listing returns them in seq order.

pub fn tenant(tenant_id: &str) -> String {
    format!("/tenants/{tenant_id}")
}

pub const TENANTS_PREFIX: &str = "/tenants/";

/// Uniqueness domain for company slugs; freed when the tenant is
/// deleted.
pub fn slug(slug: &str) -> String {
    format!("/slugs/{slug}")
}

/// Uniqueness domain for port ownership.
pub fn port(port: u16) -> String {
    format!("/ports/{port:05}")
}

pub const PORTS_PREFIX: &str = "/ports/";

pub fn allocation(tenant_id: &str, service_type: &str) -> String {
    format!("/allocations/{tenant_id}/{service_type}")
}

pub fn allocations_prefix(tenant_id: &str) -> String {
    format!("/allocations/{tenant_id}/")
}

/// Mutual-exclusion marker: present while the tenant has a non-terminal
/// deployment.
pub fn active(tenant_id: &str) -> String {
    format!("/active/{tenant_id}")
}

pub fn deployment(deployment_id: &str) -> String {
    format!("/deployments/{deployment_id}")
}

/// Listing index: deployment ids per tenant.
pub fn tenant_deployment(tenant_id: &str, deployment_id: &str) -> String {
    format!("/tenant_deployments/{tenant_id}/{deployment_id}")
}

pub fn tenant_deployments_prefix(tenant_id: &str) -> String {
    format!("/tenant_deployments/{tenant_id}/")
}

pub fn manifest(deployment_id: &str) -> String {
    format!("/manifests/{deployment_id}")
}

/// Points at the deployment id of the tenant's last completed deploy.
pub fn last_good(tenant_id: &str) -> String {
    format!("/last_good/{tenant_id}")
}

pub fn event(deployment_id: &str, seq: u64) -> String {
    format!("/events/{deployment_id}/{seq:08}")
}

pub fn events_prefix(deployment_id: &str) -> String {
    format!("/events/{deployment_id}/")
}
