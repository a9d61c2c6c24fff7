pub mod events;
pub mod orchestrator;
pub mod ports;
pub mod render;
pub mod rollback;

pub use events::{EventHub, Subscription};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use ports::{PortAllocation, PortAllocator, PortRange};
pub use rollback::RollbackManager;
