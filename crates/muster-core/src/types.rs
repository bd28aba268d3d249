//! Shared data types for tasks, workers, and results.
//!
//! Mirrors the data model: a [`Task`] carries a [`Payload`] (prompt or
//! shell command), moves through the [`TaskState`] transition graph, and
//! records a terminal [`TaskResult`]. A [`Worker`] wraps one external
//! process and moves through [`WorkerState`].

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Globally unique task identifier, assigned on submit.
pub type TaskId = Uuid;

/// Globally unique worker identifier, stable for the worker's lifetime.
pub type WorkerId = Uuid;

/// Scheduling priority, totally ordered with `Critical` highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Priority {
    /// All priorities in dispatch order, highest first.
    pub const DISPATCH_ORDER: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

/// Exactly one of a natural-language prompt or a shell command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    Prompt { prompt: String },
    Command { command: String, working_directory: Option<String> },
}

/// A task's position in the state machine.
///
/// Transitions: `Pending -> Ready -> Running -> {Completed, Failed}`; from
/// any non-terminal state, `-> Cancelled` is permitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::Ready => "ready",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// The outcome recorded on a task once it reaches a terminal state.
///
/// Immutable once written (P3: read-only after termination).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub output: String,
    pub exit_code: i32,
    pub error: Option<String>,
    pub duration: Duration,
}

impl TaskResult {
    pub fn success(output: String, duration: Duration) -> Self {
        Self {
            output,
            exit_code: 0,
            error: None,
            duration,
        }
    }

    pub fn failure(error: impl Into<String>, duration: Duration) -> Self {
        Self {
            output: String::new(),
            exit_code: 1,
            error: Some(error.into()),
            duration,
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0 && self.error.is_none()
    }
}

/// One unit of submitted work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub payload: Payload,
    pub priority: Priority,
    pub depends_on: HashSet<TaskId>,
    pub pinned_instance: Option<WorkerId>,
    pub timeout: Duration,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub state: TaskState,
    pub result: Option<TaskResult>,
}

impl Task {
    /// Build a new task in `Pending` state, not yet assigned to the queue.
    pub fn new(
        name: impl Into<String>,
        payload: Payload,
        priority: Priority,
        depends_on: HashSet<TaskId>,
        pinned_instance: Option<WorkerId>,
        timeout: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            payload,
            priority,
            depends_on,
            pinned_instance,
            timeout,
            submitted_at: Utc::now(),
            started_at: None,
            completed_at: None,
            state: TaskState::Pending,
            result: None,
        }
    }
}

/// A worker's lifecycle position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Starting,
    Idle,
    Busy,
    Unhealthy,
    Terminated,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::Starting => "starting",
            WorkerState::Idle => "idle",
            WorkerState::Busy => "busy",
            WorkerState::Unhealthy => "unhealthy",
            WorkerState::Terminated => "terminated",
        };
        write!(f, "{s}")
    }
}

/// Public-facing metadata for one instance, returned by pool listing APIs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerMeta {
    pub id: WorkerId,
    pub state: WorkerState,
    pub current_task_id: Option<TaskId>,
    pub working_directory: Option<String>,
    pub model_profile: String,
    pub started_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub draining: bool,
}

/// Structured events published on the [`crate::event::EventBus`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Event {
    InstanceSpawned { worker_id: WorkerId },
    InstanceTerminated { worker_id: WorkerId },
    TaskSubmitted { task_id: TaskId, name: String },
    TaskReady { task_id: TaskId },
    TaskStarted { task_id: TaskId, worker_id: WorkerId },
    TaskCompleted { task_id: TaskId, state: TaskState },
    TaskCancelled { task_id: TaskId, reason: String },
    WorkflowCompleted { workflow_name: String, task_ids: Vec<TaskId> },
    EventsDropped { count: u64 },
}
