//! The Task Queue: priority buckets plus a dependency DAG.
//!
//! All state -- task table, per-priority ready buckets, the
//! not-yet-ready pending set, and the reverse-dependency index used for
//! cascading cancellation -- lives behind one `Mutex`, mirroring the
//! single-lock-per-subsystem discipline used throughout this crate.
//! Cycle checking on `add_batch` is Kahn's algorithm.

use std::collections::{HashMap, HashSet, VecDeque};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::EngineError;
use crate::types::{Priority, Task, TaskId, TaskResult, TaskState};

struct Inner {
    tasks: HashMap<TaskId, Task>,
    /// FIFO-per-priority ready buckets, consulted in `Priority::DISPATCH_ORDER`.
    ready: HashMap<Priority, VecDeque<TaskId>>,
    /// Pending tasks and the set of dependencies still unmet.
    pending: HashMap<TaskId, HashSet<TaskId>>,
    /// dependency -> dependents, used to propagate completion and cancellation.
    dependents: HashMap<TaskId, Vec<TaskId>>,
    /// Cancellation handles for tasks currently `Running`.
    running_tokens: HashMap<TaskId, CancellationToken>,
}

impl Inner {
    fn new() -> Self {
        let mut ready = HashMap::new();
        for p in Priority::DISPATCH_ORDER {
            ready.insert(p, VecDeque::new());
        }
        Self {
            tasks: HashMap::new(),
            ready,
            pending: HashMap::new(),
            dependents: HashMap::new(),
            running_tokens: HashMap::new(),
        }
    }

    fn make_ready(&mut self, task_id: TaskId) {
        if let Some(task) = self.tasks.get_mut(&task_id) {
            task.state = TaskState::Ready;
            self.ready.get_mut(&task.priority).unwrap().push_back(task_id);
        }
    }

    fn insert_one(&mut self, task: Task) {
        let id = task.id;
        for dep in &task.depends_on {
            self.dependents.entry(*dep).or_default().push(id);
        }
        let unmet: HashSet<TaskId> = task
            .depends_on
            .iter()
            .filter(|dep| {
                self.tasks
                    .get(dep)
                    .map(|t| !matches!(t.state, TaskState::Completed))
                    .unwrap_or(false)
            })
            .copied()
            .collect();

        self.tasks.insert(id, task);
        if unmet.is_empty() {
            self.make_ready(id);
        } else {
            self.pending.insert(id, unmet);
        }
    }
}

pub struct TaskQueue {
    inner: std::sync::Mutex<Inner>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            inner: std::sync::Mutex::new(Inner::new()),
        }
    }

    /// Submit one task. Rejects a self-dependency or a reference to an
    /// unknown task id outright.
    pub fn add(&self, task: Task) -> Result<TaskId, EngineError> {
        let mut inner = self.inner.lock().unwrap();

        if task.depends_on.contains(&task.id) {
            return Err(EngineError::CycleDetected {
                task_id: Some(task.id),
            });
        }
        for dep in &task.depends_on {
            if !inner.tasks.contains_key(dep) {
                return Err(EngineError::UnknownId(*dep));
            }
        }

        let id = task.id;
        inner.insert_one(task);
        debug!(task_id = %id, "task submitted");
        Ok(id)
    }

    /// Submit a whole batch atomically: either every task is accepted,
    /// or none are and the whole batch is rejected for a cycle or
    /// dangling reference.
    pub fn add_batch(&self, tasks: Vec<Task>) -> Result<Vec<TaskId>, EngineError> {
        let mut inner = self.inner.lock().unwrap();
        check_for_cycles(&inner.tasks, &tasks)?;

        let ids: Vec<TaskId> = tasks.iter().map(|t| t.id).collect();
        for task in tasks {
            inner.insert_one(task);
        }
        debug!(count = ids.len(), "task batch submitted");
        Ok(ids)
    }

    /// Pop the highest-priority ready task and mark it `Running`.
    pub fn next_ready(&self) -> Option<Task> {
        let mut inner = self.inner.lock().unwrap();
        for p in Priority::DISPATCH_ORDER {
            if let Some(id) = inner.ready.get_mut(&p).unwrap().pop_front() {
                let token = CancellationToken::new();
                inner.running_tokens.insert(id, token);
                let task = inner.tasks.get_mut(&id).unwrap();
                task.state = TaskState::Running;
                task.started_at = Some(chrono::Utc::now());
                return Some(task.clone());
            }
        }
        None
    }

    /// Return a popped task to the front of its priority bucket --
    /// used when dispatch picked it up but no worker was available.
    pub fn requeue_front(&self, task_id: TaskId) {
        let mut inner = self.inner.lock().unwrap();
        inner.running_tokens.remove(&task_id);
        if let Some(task) = inner.tasks.get_mut(&task_id) {
            task.state = TaskState::Ready;
            task.started_at = None;
            inner.ready.get_mut(&task.priority).unwrap().push_front(task_id);
        }
    }

    pub fn cancellation_token(&self, task_id: TaskId) -> Option<CancellationToken> {
        self.inner.lock().unwrap().running_tokens.get(&task_id).cloned()
    }

    /// Record a terminal outcome. Returns the ids that newly became
    /// `Ready` as a result (for `TaskReady` event emission).
    ///
    /// If `state` is `Failed` or `Cancelled`, every transitive
    /// dependent is cascaded to `Cancelled` with reason
    /// `"upstream-failed"` instead of ever becoming ready.
    pub fn complete(&self, task_id: TaskId, state: TaskState, result: Option<TaskResult>) -> Vec<TaskId> {
        let mut inner = self.inner.lock().unwrap();
        inner.running_tokens.remove(&task_id);

        if let Some(task) = inner.tasks.get_mut(&task_id) {
            task.state = state;
            task.completed_at = Some(chrono::Utc::now());
            task.result = result;
        } else {
            return Vec::new();
        }

        if state == TaskState::Failed || state == TaskState::Cancelled {
            self.cascade_cancel(&mut inner, task_id);
            return Vec::new();
        }

        let mut newly_ready = Vec::new();
        let dependents = inner.dependents.get(&task_id).cloned().unwrap_or_default();
        for dep_id in dependents {
            let mut became_ready = false;
            if let Some(unmet) = inner.pending.get_mut(&dep_id) {
                unmet.remove(&task_id);
                became_ready = unmet.is_empty();
            }
            if became_ready {
                inner.pending.remove(&dep_id);
                inner.make_ready(dep_id);
                newly_ready.push(dep_id);
            }
        }
        newly_ready
    }

    fn cascade_cancel(&self, inner: &mut Inner, from: TaskId) {
        let mut queue: VecDeque<TaskId> = inner.dependents.get(&from).cloned().unwrap_or_default().into();
        let mut seen = HashSet::new();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            let already_terminal = inner.tasks.get(&id).map(|t| t.state.is_terminal()).unwrap_or(true);
            if already_terminal {
                continue;
            }
            inner.pending.remove(&id);
            if let Some(task) = inner.tasks.get_mut(&id) {
                task.state = TaskState::Cancelled;
                task.completed_at = Some(chrono::Utc::now());
                task.result = Some(TaskResult::failure("upstream-failed", std::time::Duration::ZERO));
            }
            if let Some(next) = inner.dependents.get(&id) {
                queue.extend(next.iter().copied());
            }
        }
    }

    /// Cancel a task directly. `Pending`/`Ready` tasks are cancelled in
    /// place (and cascade to their dependents); `Running` tasks have
    /// their cancellation token triggered -- the dispatcher observes it
    /// and stops the worker, then calls `complete` itself. Returns
    /// `false` for a task already in a terminal state (no-op).
    pub fn cancel(&self, task_id: TaskId) -> Result<bool, EngineError> {
        let mut inner = self.inner.lock().unwrap();
        let state = inner
            .tasks
            .get(&task_id)
            .map(|t| t.state)
            .ok_or(EngineError::UnknownId(task_id))?;

        match state {
            TaskState::Running => {
                if let Some(token) = inner.running_tokens.get(&task_id) {
                    token.cancel();
                }
                Ok(true)
            }
            s if s.is_terminal() => Ok(false),
            _ => {
                inner.pending.remove(&task_id);
                for p in Priority::DISPATCH_ORDER {
                    inner.ready.get_mut(&p).unwrap().retain(|id| *id != task_id);
                }
                if let Some(task) = inner.tasks.get_mut(&task_id) {
                    task.state = TaskState::Cancelled;
                    task.completed_at = Some(chrono::Utc::now());
                }
                self.cascade_cancel(&mut inner, task_id);
                Ok(true)
            }
        }
    }

    pub fn get(&self, task_id: TaskId) -> Option<Task> {
        self.inner.lock().unwrap().tasks.get(&task_id).cloned()
    }

    pub fn snapshot(&self) -> Vec<Task> {
        let inner = self.inner.lock().unwrap();
        let mut tasks: Vec<Task> = inner.tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.submitted_at);
        tasks
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Kahn's algorithm over `batch`, treating dependencies on tasks already
/// in `existing` as pre-satisfied (the existing graph is acyclic by
/// induction, so cross edges can never close a cycle back into the
/// batch). Also rejects references to unknown ids.
fn check_for_cycles(existing: &HashMap<TaskId, Task>, batch: &[Task]) -> Result<(), EngineError> {
    let batch_ids: HashSet<TaskId> = batch.iter().map(|t| t.id).collect();

    for task in batch {
        if task.depends_on.contains(&task.id) {
            return Err(EngineError::CycleDetected {
                task_id: Some(task.id),
            });
        }
        for dep in &task.depends_on {
            if !existing.contains_key(dep) && !batch_ids.contains(dep) {
                return Err(EngineError::UnknownId(*dep));
            }
        }
    }

    let idx_of: HashMap<TaskId, usize> = batch.iter().enumerate().map(|(i, t)| (t.id, i)).collect();
    let n = batch.len();
    let mut in_degree = vec![0usize; n];
    let mut adj: Vec<Vec<usize>> = vec![Vec::new(); n];

    for task in batch {
        let to = idx_of[&task.id];
        for dep in &task.depends_on {
            if let Some(&from) = idx_of.get(dep) {
                adj[from].push(to);
                in_degree[to] += 1;
            }
        }
    }

    let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut sorted_count = 0;
    while let Some(i) = queue.pop_front() {
        sorted_count += 1;
        for &next in &adj[i] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    if sorted_count != n {
        return Err(EngineError::CycleDetected { task_id: None });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Payload;
    use std::time::Duration;

    fn task(name: &str, deps: HashSet<TaskId>) -> Task {
        Task::new(
            name,
            Payload::Command {
                command: "echo hi".to_string(),
                working_directory: None,
            },
            Priority::Normal,
            deps,
            None,
            Duration::from_secs(60),
        )
    }

    #[test]
    fn task_with_no_deps_is_immediately_ready() {
        let q = TaskQueue::new();
        let t = task("a", HashSet::new());
        let id = t.id;
        q.add(t).unwrap();
        let popped = q.next_ready().unwrap();
        assert_eq!(popped.id, id);
    }

    #[test]
    fn self_dependency_is_rejected() {
        let q = TaskQueue::new();
        let mut t = task("a", HashSet::new());
        t.depends_on.insert(t.id);
        assert!(matches!(q.add(t), Err(EngineError::CycleDetected { .. })));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let q = TaskQueue::new();
        let mut deps = HashSet::new();
        deps.insert(uuid::Uuid::new_v4());
        let t = task("a", deps);
        assert!(matches!(q.add(t), Err(EngineError::UnknownId(_))));
    }

    #[test]
    fn dependent_becomes_ready_after_completion() {
        let q = TaskQueue::new();
        let a = task("a", HashSet::new());
        let a_id = a.id;
        let mut b_deps = HashSet::new();
        b_deps.insert(a_id);
        let b = task("b", b_deps);
        let b_id = b.id;

        q.add_batch(vec![a, b]).unwrap();
        assert!(q.next_ready().is_some());
        assert!(q.get(b_id).unwrap().state == TaskState::Pending);

        let newly_ready = q.complete(a_id, TaskState::Completed, Some(TaskResult::success("ok".into(), Duration::ZERO)));
        assert_eq!(newly_ready, vec![b_id]);
        assert_eq!(q.get(b_id).unwrap().state, TaskState::Ready);
    }

    #[test]
    fn failed_dependency_cascades_cancellation() {
        let q = TaskQueue::new();
        let a = task("a", HashSet::new());
        let a_id = a.id;
        let mut b_deps = HashSet::new();
        b_deps.insert(a_id);
        let b = task("b", b_deps);
        let b_id = b.id;

        q.add_batch(vec![a, b]).unwrap();
        q.next_ready();
        q.complete(a_id, TaskState::Failed, Some(TaskResult::failure("boom", Duration::ZERO)));
        assert_eq!(q.get(b_id).unwrap().state, TaskState::Cancelled);
    }

    #[test]
    fn batch_with_direct_cycle_is_rejected_atomically() {
        let q = TaskQueue::new();
        let mut a = task("a", HashSet::new());
        let mut b = task("b", HashSet::new());
        a.depends_on.insert(b.id);
        b.depends_on.insert(a.id);
        let a_id = a.id;
        assert!(matches!(
            q.add_batch(vec![a, b]),
            Err(EngineError::CycleDetected { .. })
        ));
        assert!(q.get(a_id).is_none());
    }

    #[test]
    fn diamond_shaped_dag_is_accepted() {
        let q = TaskQueue::new();
        let a = task("a", HashSet::new());
        let a_id = a.id;
        let mut b = task("b", HashSet::new());
        b.depends_on.insert(a_id);
        let mut c = task("c", HashSet::new());
        c.depends_on.insert(a_id);
        let mut d = task("d", HashSet::new());
        d.depends_on.insert(b.id);
        d.depends_on.insert(c.id);
        assert!(q.add_batch(vec![a, b, c, d]).is_ok());
    }

    #[test]
    fn priority_order_is_respected_at_dispatch() {
        let q = TaskQueue::new();
        let mut low = task("low", HashSet::new());
        low.priority = Priority::Low;
        let mut crit = task("crit", HashSet::new());
        crit.priority = Priority::Critical;
        let crit_id = crit.id;

        q.add(low).unwrap();
        q.add(crit).unwrap();

        let first = q.next_ready().unwrap();
        assert_eq!(first.id, crit_id);
    }

    #[test]
    fn cancel_pending_task_marks_cancelled() {
        let q = TaskQueue::new();
        let t = task("a", HashSet::new());
        let id = t.id;
        q.add(t).unwrap();
        assert!(q.cancel(id).unwrap());
        assert_eq!(q.get(id).unwrap().state, TaskState::Cancelled);
    }

    #[test]
    fn cancel_of_already_terminal_task_is_a_no_op() {
        let q = TaskQueue::new();
        let t = task("a", HashSet::new());
        let id = t.id;
        q.add(t).unwrap();
        q.next_ready();
        q.complete(id, TaskState::Completed, Some(TaskResult::success("ok".into(), Duration::ZERO)));

        assert!(!q.cancel(id).unwrap());
        assert_eq!(q.get(id).unwrap().state, TaskState::Completed);
    }
}
