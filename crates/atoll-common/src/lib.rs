pub mod branding;
pub mod deployment;
pub mod error;
pub mod event;
pub mod manifest;
pub mod service;
pub mod tenant;

pub use branding::BrandingConfig;
pub use deployment::{Deployment, DeploymentKind, DeploymentStatus};
pub use error::ProvisionError;
pub use event::{DeploymentEvent, EventLevel};
pub use manifest::{Manifest, ResourceDescriptor, ResourceKind};
pub use service::ServiceSpec;
pub use tenant::{DeployTarget, Tenant, TenantStatus};

pub mod telemetry;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}
