use std::sync::Arc;

use atoll_meta::MetaStore;
use atoll_provision::{EventHub, Orchestrator, RollbackManager};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn MetaStore>,
    pub orch: Arc<Orchestrator>,
    pub rollback: Arc<RollbackManager>,
    pub events: Arc<EventHub>,
}
