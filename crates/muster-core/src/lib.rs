//! In-memory orchestration engine for long-lived external worker
//! processes: an instance pool, a priority/dependency task queue, a
//! dispatch loop, and a YAML workflow executor.
//!
//! Adapters (`muster-server`'s REST/WebSocket API, `muster-cli`) are
//! thin wrappers over [`orchestrator::OrchestratorHandle`], the single
//! entry point this crate exposes.

pub mod config;
pub mod error;
pub mod event;
pub mod orchestrator;
pub mod pool;
pub mod queue;
pub mod types;
pub mod worker;
pub mod workflow;

pub use error::{EngineError, Result};
pub use orchestrator::OrchestratorHandle;
pub use types::{Event, Payload, Priority, Task, TaskId, TaskResult, TaskState, WorkerId, WorkerMeta, WorkerState};
pub use workflow::{WorkflowDocument, WorkflowExecutor, WorkflowTaskSpec};
