use thiserror::Error;

/// Closed failure taxonomy for the provisioning core.
///
/// Allocation and rendering variants are raised before any cluster
/// mutation; cluster variants always leave at least one terminal event
/// in the deployment's history.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("port range {start}-{end} exhausted: {missing} more port(s) needed")]
    PortRangeExhausted { start: u16, end: u16, missing: usize },

    #[error("port {port} is already allocated to tenant {holder}")]
    AlreadyAllocated { port: u16, holder: String },

    #[error("unknown service type \"{0}\"")]
    InvalidServiceSpec(String),

    #[error("no port allocated for service \"{0}\"")]
    MissingPortAllocation(String),

    #[error("cluster apply failed for {resource}: {reason}")]
    ClusterApply { resource: String, reason: String },

    #[error("workloads not ready after {timeout_secs}s")]
    ReadinessTimeout { timeout_secs: u64 },

    #[error("tenant {0} already has a deployment in progress")]
    DeploymentInProgress(String),

    #[error("tenant {0} has no completed deployment to roll back to")]
    NoPriorManifest(String),

    #[error("deployment cancelled")]
    Cancelled,

    #[error("tenant {0} not found")]
    TenantNotFound(String),

    #[error("deployment {0} not found")]
    DeploymentNotFound(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}
