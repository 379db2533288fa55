pub mod checkpoint;
pub mod config;
pub mod error;
pub mod event;
pub mod safety;
pub mod state;
pub mod traits;
pub mod types;

pub use checkpoint::{Checkpoint, Checkpointer};
pub use config::AppConfig;
pub use error::{NodeError, ReactorError, Result};
pub use event::EventBus;
pub use state::{ExecutionState, NextStep, StateError, StateUpdate};
pub use traits::{Node, ProgressCallback};
pub use types::*;
