use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

/// One line in a deployment's log stream.
///
/// `seq` counts from 1 and is gap-free per deployment, so stream
/// consumers can detect missed events. Stored under
/// `/events/{deployment_id}/{seq:08}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentEvent {
    pub deployment_id: String,
    pub seq: u64,
    pub timestamp_ms: u64,
    pub level: EventLevel,
    pub message: String,
}
