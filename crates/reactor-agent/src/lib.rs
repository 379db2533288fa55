pub mod approval;
pub mod checkpoint;
pub mod graph;
pub mod instance;
pub mod manager;
pub mod prebuilt;

pub use approval::{ApprovalDecision, RequestApprovalNode};
pub use checkpoint::{MemoryCheckpointer, SqliteCheckpointer};
pub use graph::{
    from_async, from_fn, Edge, GraphBuilder, GraphDefinition, GraphExecutor, Outcome, Router,
    StepObserver, StepReport, END,
};
pub use instance::{AgentInstance, CallbackFailure, Delivery, InstanceConfig, InstanceSummary};
pub use manager::{AgentManager, ManagerStats, SpawnOptions};

use std::sync::Arc;

use reactor_core::config::{AppConfig, CheckpointBackend};
use reactor_core::error::Result;
use reactor_core::Checkpointer;

/// Open the checkpoint backend named in the config.
pub fn open_checkpointer(config: &AppConfig) -> Result<Arc<dyn Checkpointer>> {
    match config.checkpoint.backend {
        CheckpointBackend::Memory => Ok(Arc::new(MemoryCheckpointer::new())),
        CheckpointBackend::Sqlite => {
            let path = config.checkpoint.sqlite_path();
            Ok(Arc::new(SqliteCheckpointer::open(&path)?))
        }
    }
}
