//! The engine's typed error taxonomy.
//!
//! Library code returns [`EngineError`]; adapters (`muster-server`,
//! `muster-cli`) wrap it with `anyhow::Context` at the boundary:
//! `thiserror` in the core, `anyhow` in the binaries.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("spawning {requested} workers would exceed max_instances ({max_instances})")]
    CapacityExceeded {
        requested: usize,
        max_instances: usize,
    },

    #[error("worker failed to start: {0}")]
    WorkerStartFailure(String),

    #[error("worker execution error: {0}")]
    WorkerExecutionError(String),

    #[error("task {task_id} exceeded its timeout")]
    Timeout { task_id: Uuid },

    #[error("submitting task {task_id:?} would create a dependency cycle")]
    CycleDetected { task_id: Option<Uuid> },

    #[error("workflow document is invalid: {0}")]
    WorkflowInvalid(String),

    #[error("unknown id: {0}")]
    UnknownId(Uuid),

    #[error("dependency of task {task_id} failed or was cancelled")]
    UpstreamFailed { task_id: Uuid },
}

pub type Result<T> = std::result::Result<T, EngineError>;
