use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Deploying,
    Completed,
    Failed,
    RolledBack,
}

impl DeploymentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DeploymentStatus::Completed | DeploymentStatus::Failed | DeploymentStatus::RolledBack
        )
    }

    /// Valid transitions of the provisioning state machine. `RolledBack`
    /// is only reachable from `Failed`, and only terminal states have no
    /// successors besides that one edge.
    pub fn can_transition_to(self, next: DeploymentStatus) -> bool {
        use DeploymentStatus::*;
        matches!(
            (self, next),
            (Pending, Deploying)
                | (Pending, Failed)
                | (Deploying, Completed)
                | (Deploying, Failed)
                | (Failed, RolledBack)
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentKind {
    Deploy,
    Rollback,
}

/// One provisioning attempt for a tenant.
///
/// Stored under `/deployments/{id}`; a tenant accumulates many of these
/// but holds at most one in a non-terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub tenant_id: String,
    pub kind: DeploymentKind,

    /// Service types requested for this attempt.
    pub services: Vec<String>,

    /// When true, existing resources are deleted and recreated rather
    /// than updated in place. Ports are reused either way.
    #[serde(default)]
    pub force: bool,

    pub status: DeploymentStatus,

    /// Human-readable outcome; filled on every failure transition.
    #[serde(default)]
    pub status_message: String,

    /// Checksum of the manifest rendered for this attempt, if rendering
    /// got that far.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_checksum: Option<String>,

    pub started_at_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl Deployment {
    pub fn new(
        id: String,
        tenant_id: String,
        kind: DeploymentKind,
        services: Vec<String>,
        force: bool,
        now_ms: u64,
    ) -> Self {
        let status = match kind {
            // Rollbacks reapply an already-rendered manifest, so they
            // skip Pending and start applying immediately.
            DeploymentKind::Rollback => DeploymentStatus::Deploying,
            DeploymentKind::Deploy => DeploymentStatus::Pending,
        };
        Self {
            id,
            tenant_id,
            kind,
            services,
            force,
            status,
            status_message: String::new(),
            manifest_checksum: None,
            started_at_ms: now_ms,
            finished_at_ms: None,
            duration_ms: None,
        }
    }

    /// Move to `next`, recording the message and finish time on terminal
    /// transitions. Returns false (and leaves the record untouched) if
    /// the edge is not part of the state machine.
    pub fn transition(&mut self, next: DeploymentStatus, message: &str, now_ms: u64) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        if !message.is_empty() {
            self.status_message = message.to_string();
        }
        if next.is_terminal() {
            self.finished_at_ms = Some(now_ms);
            self.duration_ms = Some(now_ms.saturating_sub(self.started_at_ms));
        }
        true
    }
}
