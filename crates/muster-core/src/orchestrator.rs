//! The dispatch loop: the thing that actually drives ready tasks onto
//! idle workers, forever, until told to stop.
//!
//! A cancellable loop racing a wakeup signal against a polling fallback,
//! handling completions as they land rather than in lockstep batches,
//! running until stopped rather than until one fixed batch of work
//! drains. In-flight executions are tracked in a `JoinSet` so `stop()`
//! can drain them against a deadline instead of abandoning them.

use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use tokio::sync::{Mutex, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::event::EventBus;
use crate::pool::InstancePool;
use crate::queue::TaskQueue;
use crate::types::{Event, Task, TaskId, TaskResult, TaskState, WorkerId, WorkerMeta};
use crate::worker::Worker;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

struct Engine {
    pool: InstancePool,
    queue: TaskQueue,
    events: EventBus,
    config: EngineConfig,
    ready_notify: Notify,
    inflight: Mutex<JoinSet<()>>,
}

/// Owns the running dispatch and health-sweep loops, and is the single
/// entry point adapters (`muster-server`, `muster-cli`) talk to.
pub struct OrchestratorHandle {
    engine: Arc<Engine>,
    shutdown: CancellationToken,
    dispatch_task: JoinHandle<()>,
    health_task: JoinHandle<()>,
}

impl OrchestratorHandle {
    pub fn start(config: EngineConfig) -> Self {
        let pool = InstancePool::new(
            config.max_instances,
            config.worker_command.clone(),
            config.output_buffer_bytes,
        );
        let engine = Arc::new(Engine {
            pool,
            queue: TaskQueue::new(),
            events: EventBus::default(),
            config,
            ready_notify: Notify::new(),
            inflight: Mutex::new(JoinSet::new()),
        });

        let shutdown = CancellationToken::new();
        let dispatch_task = tokio::spawn(dispatch_loop(engine.clone(), shutdown.clone()));
        let health_task = tokio::spawn(health_loop(engine.clone(), shutdown.clone()));

        Self {
            engine,
            shutdown,
            dispatch_task,
            health_task,
        }
    }

    pub async fn submit(&self, task: Task) -> Result<TaskId, EngineError> {
        let name = task.name.clone();
        let id = self.engine.queue.add(task)?;
        self.engine.events.publish(Event::TaskSubmitted { task_id: id, name });
        self.announce_if_ready(id);
        self.engine.ready_notify.notify_waiters();
        Ok(id)
    }

    pub async fn submit_batch(&self, tasks: Vec<Task>) -> Result<Vec<TaskId>, EngineError> {
        let submitted: Vec<(TaskId, String)> = tasks.iter().map(|t| (t.id, t.name.clone())).collect();
        let ids = self.engine.queue.add_batch(tasks)?;
        for (id, name) in submitted {
            self.engine.events.publish(Event::TaskSubmitted { task_id: id, name });
        }
        for id in &ids {
            self.announce_if_ready(*id);
        }
        self.engine.ready_notify.notify_waiters();
        Ok(ids)
    }

    fn announce_if_ready(&self, task_id: TaskId) {
        if let Some(task) = self.engine.queue.get(task_id) {
            if task.state == TaskState::Ready {
                self.engine.events.publish(Event::TaskReady { task_id });
            }
        }
    }

    /// Cancel a task. Returns `false` if it was already in a terminal
    /// state (no-op).
    pub async fn cancel(&self, task_id: TaskId) -> Result<bool, EngineError> {
        let cancelled = self.engine.queue.cancel(task_id)?;
        if cancelled {
            self.engine.events.publish(Event::TaskCancelled {
                task_id,
                reason: "requested".to_string(),
            });
            self.engine.ready_notify.notify_waiters();
        }
        Ok(cancelled)
    }

    pub fn get_task(&self, task_id: TaskId) -> Option<Task> {
        self.engine.queue.get(task_id)
    }

    pub fn snapshot_tasks(&self) -> Vec<Task> {
        self.engine.queue.snapshot()
    }

    pub fn snapshot_workers(&self) -> Vec<WorkerMeta> {
        self.engine.pool.list()
    }

    pub async fn spawn_instances(&self, n: usize) -> Result<Vec<WorkerId>, EngineError> {
        self.engine.pool.spawn(n).await
    }

    pub async fn scale_to(&self, target: usize) -> Result<usize, EngineError> {
        self.engine.pool.scale_to(target).await
    }

    pub async fn terminate_instance(&self, worker_id: WorkerId) {
        self.engine.pool.terminate(worker_id).await;
    }

    pub fn subscribe(&self) -> impl Stream<Item = Event> + Send + 'static {
        self.engine.events.subscribe()
    }

    pub fn default_task_timeout(&self) -> Duration {
        self.engine.config.default_task_timeout
    }

    /// Poll until every id in `task_ids` reaches a terminal state.
    /// Used by the workflow executor to wait out a batch.
    pub async fn await_terminal(&self, task_ids: &[TaskId]) -> Vec<Task> {
        loop {
            let snapshot: Vec<Task> = task_ids
                .iter()
                .filter_map(|id| self.engine.queue.get(*id))
                .collect();
            if snapshot.len() == task_ids.len() && snapshot.iter().all(|t| t.state.is_terminal()) {
                return snapshot;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Stop the dispatch and health loops, drain in-flight executions
    /// up to `stop_grace`, then tear down every worker.
    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.dispatch_task.await;
        let _ = self.health_task.await;

        let drained = {
            let mut inflight = self.engine.inflight.lock().await;
            tokio::time::timeout(self.engine.config.stop_grace, async {
                while inflight.join_next().await.is_some() {}
            })
            .await
        };
        if drained.is_err() {
            warn!("in-flight tasks did not drain before shutdown deadline, abandoning them");
        }

        let worker_ids: Vec<WorkerId> = self.engine.pool.list().iter().map(|m| m.id).collect();
        for id in worker_ids {
            self.engine.pool.terminate(id).await;
        }
    }
}

async fn dispatch_loop(engine: Arc<Engine>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("dispatch loop stopping");
                return;
            }
            _ = engine.ready_notify.notified() => {}
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }

        loop {
            let Some(task) = engine.queue.next_ready() else {
                break;
            };
            match engine.pool.acquire(task.id, task.pinned_instance) {
                Some((worker_id, worker, kill)) => {
                    engine.events.publish(Event::TaskStarted {
                        task_id: task.id,
                        worker_id,
                    });
                    spawn_execution(engine.clone(), task, worker_id, worker, kill).await;
                }
                None => {
                    engine.queue.requeue_front(task.id);
                    break;
                }
            }
        }
    }
}

/// Worker-reported failures that mean the *process* is suspect, as
/// opposed to an ordinary non-zero exit the worker is perfectly healthy
/// after. Only these should ever demote a worker to `Unhealthy`.
fn is_io_failure(error: Option<&str>) -> bool {
    matches!(error, Some(e) if e == "timeout" || e == "worker not started" || e.starts_with("process-exited"))
}

async fn spawn_execution(
    engine: Arc<Engine>,
    task: Task,
    worker_id: WorkerId,
    mut worker: Box<dyn Worker>,
    kill: CancellationToken,
) {
    let task_id = task.id;
    let token = engine.queue.cancellation_token(task_id);

    let fut = async move {
        let task_cancelled = async {
            match &token {
                Some(tok) => tok.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        };

        let mut killed = false;
        let result: TaskResult = tokio::select! {
            r = worker.execute(&task.payload, task.timeout) => r,
            _ = task_cancelled => TaskResult::failure("cancelled", Duration::ZERO),
            _ = kill.cancelled() => {
                killed = true;
                worker.stop(Duration::from_secs(10)).await;
                TaskResult::failure("worker-terminated", Duration::ZERO)
            }
        };

        let final_state = if result.error.as_deref() == Some("cancelled") {
            TaskState::Cancelled
        } else if result.is_success() {
            TaskState::Completed
        } else {
            TaskState::Failed
        };

        let healthy = if killed {
            false
        } else if is_io_failure(result.error.as_deref()) {
            false
        } else {
            worker.health_probe().await
        };
        engine.pool.release(worker_id, worker, healthy).await;

        let newly_ready = engine.queue.complete(task_id, final_state, Some(result));
        engine.events.publish(Event::TaskCompleted {
            task_id,
            state: final_state,
        });
        for ready_id in newly_ready {
            engine.events.publish(Event::TaskReady { task_id: ready_id });
        }
        engine.ready_notify.notify_waiters();
    };

    engine.inflight.lock().await.spawn(fut);
}

async fn health_loop(engine: Arc<Engine>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(engine.config.health_sweep_interval);
    interval.tick().await; // first tick fires immediately; skip it
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = interval.tick() => {
                engine.pool.health_sweep().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Payload, Priority};
    use futures::StreamExt;
    use std::collections::HashSet;

    fn make_config() -> EngineConfig {
        EngineConfig {
            max_instances: 2,
            default_task_timeout: Duration::from_secs(5),
            output_buffer_bytes: 64 * 1024,
            worker_command: vec!["/bin/sh".to_string()],
            health_sweep_interval: Duration::from_secs(30),
            stop_grace: Duration::from_secs(2),
        }
    }

    #[tokio::test]
    async fn submitted_command_task_runs_to_completion() {
        let handle = OrchestratorHandle::start(make_config());
        handle.spawn_instances(1).await.unwrap();

        let task = Task::new(
            "greet",
            Payload::Command {
                command: "echo hi".to_string(),
                working_directory: None,
            },
            Priority::Normal,
            HashSet::new(),
            None,
            Duration::from_secs(5),
        );
        let id = handle.submit(task).await.unwrap();

        let results = handle.await_terminal(&[id]).await;
        assert_eq!(results[0].state, TaskState::Completed);
        handle.stop().await;
    }

    #[tokio::test]
    async fn dependent_task_waits_for_its_parent() {
        let handle = OrchestratorHandle::start(make_config());
        handle.spawn_instances(1).await.unwrap();

        let parent = Task::new(
            "parent",
            Payload::Command {
                command: "echo parent".to_string(),
                working_directory: None,
            },
            Priority::Normal,
            HashSet::new(),
            None,
            Duration::from_secs(5),
        );
        let parent_id = parent.id;
        let mut deps = HashSet::new();
        deps.insert(parent_id);
        let child = Task::new(
            "child",
            Payload::Command {
                command: "echo child".to_string(),
                working_directory: None,
            },
            Priority::Normal,
            deps,
            None,
            Duration::from_secs(5),
        );
        let child_id = child.id;

        handle.submit_batch(vec![parent, child]).await.unwrap();
        let results = handle.await_terminal(&[parent_id, child_id]).await;
        assert!(results.iter().all(|t| t.state == TaskState::Completed));
        handle.stop().await;
    }

    #[tokio::test]
    async fn event_stream_reports_task_lifecycle() {
        let handle = OrchestratorHandle::start(make_config());
        handle.spawn_instances(1).await.unwrap();
        let mut events = Box::pin(handle.subscribe());

        let task = Task::new(
            "noisy",
            Payload::Command {
                command: "echo noisy".to_string(),
                working_directory: None,
            },
            Priority::Normal,
            HashSet::new(),
            None,
            Duration::from_secs(5),
        );
        let id = handle.submit(task).await.unwrap();
        handle.await_terminal(&[id]).await;

        let mut saw_completed = false;
        for _ in 0..20 {
            match tokio::time::timeout(Duration::from_millis(200), events.next()).await {
                Ok(Some(Event::TaskCompleted { task_id, .. })) if task_id == id => {
                    saw_completed = true;
                    break;
                }
                Ok(Some(_)) => continue,
                _ => break,
            }
        }
        assert!(saw_completed);
        handle.stop().await;
    }
}
