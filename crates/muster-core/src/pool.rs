//! The Instance Pool: a set of [`Worker`]s and their allocation to tasks.
//!
//! The roster lives behind one `std::sync::Mutex`: pool mutations are
//! synchronous bookkeeping, only `execute` itself suspends.
//! `acquire()` checks a live worker out of the roster --
//! removing it from the internal map -- and hands it to the caller as
//! sole owner for the duration of `execute`; `release()` puts it back.
//! This realizes the "single owner during execute" invariant without
//! holding the lock across the long-running I/O.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::types::{TaskId, WorkerId, WorkerMeta, WorkerState};
use crate::worker::{ProcessWorker, Worker};

struct Slot {
    meta: WorkerMeta,
    /// `None` while checked out by a dispatcher.
    worker: Option<Box<dyn Worker>>,
    draining: bool,
    /// Cancelled by `terminate()` to interrupt whoever currently holds
    /// `worker` checked out. Lives on the slot, not the worker, so it
    /// survives being checked out.
    kill: CancellationToken,
}

struct Roster {
    slots: HashMap<WorkerId, Slot>,
    max_instances: usize,
}

/// The pool's public API: spawn/terminate/scale/acquire/release/health_sweep.
pub struct InstancePool {
    roster: Mutex<Roster>,
    worker_available: Notify,
    worker_command: Vec<String>,
    output_buffer_bytes: usize,
}

impl InstancePool {
    pub fn new(max_instances: usize, worker_command: Vec<String>, output_buffer_bytes: usize) -> Self {
        Self {
            roster: Mutex::new(Roster {
                slots: HashMap::new(),
                max_instances,
            }),
            worker_available: Notify::new(),
            worker_command,
            output_buffer_bytes,
        }
    }

    /// Create up to `n` workers, subject to `current + n <= max_instances`.
    /// Failures to spawn leave the pool unchanged for the failed slots;
    /// returns the ids that were successfully spawned.
    pub async fn spawn(&self, n: usize) -> Result<Vec<WorkerId>, EngineError> {
        let allowed = {
            let roster = self.roster.lock().unwrap();
            let current = roster.slots.len();
            if current >= roster.max_instances {
                return Err(EngineError::CapacityExceeded {
                    requested: n,
                    max_instances: roster.max_instances,
                });
            }
            (roster.max_instances - current).min(n)
        };

        let mut spawned = Vec::new();
        for _ in 0..allowed {
            let mut worker = ProcessWorker::new(self.worker_command.clone(), self.output_buffer_bytes);
            if let Err(e) = worker.start().await {
                warn!(error = %e, "failed to start worker, leaving slot unfilled");
                continue;
            }
            let id = Uuid::new_v4();
            let now = Utc::now();
            let meta = WorkerMeta {
                id,
                state: WorkerState::Idle,
                current_task_id: None,
                working_directory: None,
                model_profile: self.worker_command.join(" "),
                started_at: now,
                last_active_at: now,
                draining: false,
            };
            let mut roster = self.roster.lock().unwrap();
            roster.slots.insert(
                id,
                Slot {
                    meta,
                    worker: Some(Box::new(worker)),
                    draining: false,
                    kill: CancellationToken::new(),
                },
            );
            drop(roster);
            info!(worker_id = %id, "instance spawned");
            spawned.push(id);
        }

        self.worker_available.notify_waiters();
        Ok(spawned)
    }

    /// Idempotent: spawns or terminates idle workers to reach `target`.
    /// Busy workers are never preempted; excess busy workers are marked
    /// "draining" and terminated on their next release.
    pub async fn scale_to(&self, target: usize) -> Result<usize, EngineError> {
        let current = {
            let roster = self.roster.lock().unwrap();
            roster.slots.len()
        };

        if target > current {
            self.spawn(target - current).await?;
        } else if target < current {
            let idle_ids: Vec<WorkerId> = {
                let roster = self.roster.lock().unwrap();
                roster
                    .slots
                    .iter()
                    .filter(|(_, s)| s.meta.state == WorkerState::Idle)
                    .map(|(id, _)| *id)
                    .collect()
            };
            let mut to_remove = current - target;
            for id in idle_ids {
                if to_remove == 0 {
                    break;
                }
                self.terminate(id).await;
                to_remove -= 1;
            }
            if to_remove > 0 {
                // Remaining excess is busy; mark for post-completion drain.
                let mut roster = self.roster.lock().unwrap();
                let mut marked = 0;
                for slot in roster.slots.values_mut() {
                    if marked >= to_remove {
                        break;
                    }
                    if slot.meta.state == WorkerState::Busy && !slot.draining {
                        slot.draining = true;
                        marked += 1;
                    }
                }
                if marked < to_remove {
                    warn!(
                        requested = target,
                        marked_for_drain = marked,
                        still_needed = to_remove - marked,
                        "scale_to could not mark enough busy workers for drain; will retry as workers free up"
                    );
                }
            }
        }

        Ok(self.roster.lock().unwrap().slots.len())
    }

    /// Terminate one worker. If it is idle, the process is stopped and
    /// the roster entry removed immediately. If it is checked out
    /// (`Busy`), the worker can't be reached directly here -- instead
    /// this cancels its kill token and marks the slot draining, so the
    /// execution holding it stops the process and completes the task
    /// with `error="worker-terminated"`, and `release()` tears the slot
    /// down instead of returning it to `Idle`.
    pub async fn terminate(&self, worker_id: WorkerId) {
        enum Action {
            StopNow(Box<dyn Worker>),
            Signalled,
            NotFound,
        }

        let action = {
            let mut roster = self.roster.lock().unwrap();
            let checked_out = roster.slots.get(&worker_id).map(|s| s.worker.is_none());
            match checked_out {
                Some(true) => {
                    if let Some(slot) = roster.slots.get_mut(&worker_id) {
                        slot.draining = true;
                        slot.kill.cancel();
                    }
                    Action::Signalled
                }
                Some(false) => {
                    let mut slot = roster.slots.remove(&worker_id).unwrap();
                    Action::StopNow(slot.worker.take().unwrap())
                }
                None => Action::NotFound,
            }
        };

        match action {
            Action::StopNow(mut worker) => {
                worker.stop(Duration::from_secs(10)).await;
                info!(worker_id = %worker_id, "instance terminated");
            }
            Action::Signalled => {
                info!(worker_id = %worker_id, "busy instance signalled for forced termination");
            }
            Action::NotFound => {}
        }
        self.worker_available.notify_waiters();
    }

    /// Return an `Idle` worker and mark it `Busy`. Non-blocking: returns
    /// `None` rather than waiting -- the dispatch loop retries.
    ///
    /// If `pinned` is set, returns only that worker (or `None`).
    /// Otherwise: least-recently-used `Idle` worker, tie-broken by
    /// ascending id (deterministic for testability).
    pub fn acquire(&self, task_id: TaskId, pinned: Option<WorkerId>) -> Option<(WorkerId, Box<dyn Worker>, CancellationToken)> {
        let mut roster = self.roster.lock().unwrap();

        let chosen = match pinned {
            Some(id) => {
                let is_idle = roster
                    .slots
                    .get(&id)
                    .is_some_and(|s| s.meta.state == WorkerState::Idle);
                if is_idle { Some(id) } else { None }
            }
            None => roster
                .slots
                .iter()
                .filter(|(_, s)| s.meta.state == WorkerState::Idle)
                .min_by_key(|(id, s)| (s.meta.last_active_at, **id))
                .map(|(id, _)| *id),
        }?;

        let slot = roster.slots.get_mut(&chosen)?;
        let worker = slot.worker.take()?;
        slot.meta.state = WorkerState::Busy;
        slot.meta.current_task_id = Some(task_id);
        slot.meta.last_active_at = Utc::now();
        let kill = slot.kill.clone();
        Some((chosen, worker, kill))
    }

    /// Return a checked-out worker to the roster, transitioning
    /// `Busy -> {Idle, Unhealthy, Terminated}`. Draining workers always
    /// go to `Terminated`.
    pub async fn release(&self, worker_id: WorkerId, worker: Box<dyn Worker>, healthy: bool) {
        let should_terminate = {
            let mut roster = self.roster.lock().unwrap();
            match roster.slots.get_mut(&worker_id) {
                Some(slot) => {
                    slot.meta.current_task_id = None;
                    slot.meta.last_active_at = Utc::now();
                    if slot.draining {
                        true
                    } else {
                        slot.meta.state = if healthy {
                            WorkerState::Idle
                        } else {
                            WorkerState::Unhealthy
                        };
                        slot.worker = Some(worker);
                        false
                    }
                }
                None => false,
            }
        };

        if should_terminate {
            let mut w = worker;
            w.stop(Duration::from_secs(10)).await;
            let mut roster = self.roster.lock().unwrap();
            roster.slots.remove(&worker_id);
        }

        self.worker_available.notify_waiters();
    }

    /// Wait until a worker may be available. Best-effort: callers must
    /// still call `acquire` and handle `None`.
    pub async fn wait_for_worker(&self) {
        self.worker_available.notified().await;
    }

    /// Probe every worker, demote dead ones to `Unhealthy` and remove
    /// terminated/unhealthy idle slots so the pool can respawn.
    pub async fn health_sweep(&self) {
        let ids: Vec<WorkerId> = {
            let roster = self.roster.lock().unwrap();
            roster.slots.keys().copied().collect()
        };

        for id in ids {
            let mut worker_opt = {
                let mut roster = self.roster.lock().unwrap();
                match roster.slots.get_mut(&id) {
                    Some(slot) if slot.meta.state == WorkerState::Idle => slot.worker.take(),
                    _ => None,
                }
            };

            if let Some(worker) = worker_opt.as_mut() {
                let alive = worker.health_probe().await;
                let mut roster = self.roster.lock().unwrap();
                if let Some(slot) = roster.slots.get_mut(&id) {
                    if alive {
                        slot.worker = worker_opt.take();
                    } else {
                        slot.meta.state = WorkerState::Unhealthy;
                        warn!(worker_id = %id, "health sweep found dead process, marking unhealthy");
                    }
                }
            }
        }

        let dead: Vec<WorkerId> = {
            let roster = self.roster.lock().unwrap();
            roster
                .slots
                .iter()
                .filter(|(_, s)| s.meta.state == WorkerState::Unhealthy)
                .map(|(id, _)| *id)
                .collect()
        };
        for id in dead {
            self.terminate(id).await;
        }
    }

    pub fn size(&self) -> usize {
        self.roster.lock().unwrap().slots.len()
    }

    pub fn get(&self, worker_id: WorkerId) -> Option<WorkerMeta> {
        self.roster.lock().unwrap().slots.get(&worker_id).map(|s| s.meta.clone())
    }

    pub fn list(&self) -> Vec<WorkerMeta> {
        let roster = self.roster.lock().unwrap();
        let mut metas: Vec<WorkerMeta> = roster.slots.values().map(|s| s.meta.clone()).collect();
        metas.sort_by_key(|m| m.id);
        metas
    }

    pub fn counts(&self) -> (usize, usize, usize) {
        let roster = self.roster.lock().unwrap();
        let total = roster.slots.len();
        let idle = roster
            .slots
            .values()
            .filter(|s| s.meta.state == WorkerState::Idle)
            .count();
        let unhealthy = roster
            .slots
            .values()
            .filter(|s| s.meta.state == WorkerState::Unhealthy)
            .count();
        (total, idle, unhealthy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_respects_max_instances() {
        let pool = InstancePool::new(2, vec!["/bin/sh".to_string()], 4096);
        let ids = pool.spawn(5).await.unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(pool.size(), 2);
    }

    #[tokio::test]
    async fn acquire_and_release_roundtrip() {
        let pool = InstancePool::new(1, vec!["/bin/sh".to_string()], 4096);
        pool.spawn(1).await.unwrap();
        let task_id = Uuid::new_v4();
        let (id, worker, _kill) = pool.acquire(task_id, None).expect("should acquire idle worker");
        assert!(pool.acquire(Uuid::new_v4(), None).is_none());
        pool.release(id, worker, true).await;
        assert!(pool.acquire(Uuid::new_v4(), None).is_some());
    }

    #[tokio::test]
    async fn pinned_acquire_only_returns_matching_worker() {
        let pool = InstancePool::new(2, vec!["/bin/sh".to_string()], 4096);
        let ids = pool.spawn(2).await.unwrap();
        let other = ids.iter().find(|&&id| id != ids[0]).copied().unwrap();
        assert!(pool.acquire(Uuid::new_v4(), Some(Uuid::new_v4())).is_none());
        let (chosen, worker, _kill) = pool.acquire(Uuid::new_v4(), Some(other)).unwrap();
        assert_eq!(chosen, other);
        pool.release(chosen, worker, true).await;
    }

    #[tokio::test]
    async fn scale_to_is_idempotent() {
        let pool = InstancePool::new(4, vec!["/bin/sh".to_string()], 4096);
        pool.scale_to(3).await.unwrap();
        assert_eq!(pool.size(), 3);
        pool.scale_to(3).await.unwrap();
        assert_eq!(pool.size(), 3);
    }

    #[tokio::test]
    async fn scale_down_terminates_idle_workers() {
        let pool = InstancePool::new(4, vec!["/bin/sh".to_string()], 4096);
        pool.scale_to(3).await.unwrap();
        pool.scale_to(1).await.unwrap();
        assert_eq!(pool.size(), 1);
    }

    #[tokio::test]
    async fn terminate_removes_from_roster() {
        let pool = InstancePool::new(1, vec!["/bin/sh".to_string()], 4096);
        let ids = pool.spawn(1).await.unwrap();
        pool.terminate(ids[0]).await;
        assert_eq!(pool.size(), 0);
    }

    #[tokio::test]
    async fn terminate_of_busy_worker_signals_kill_and_marks_draining() {
        let pool = InstancePool::new(1, vec!["/bin/sh".to_string()], 4096);
        let ids = pool.spawn(1).await.unwrap();
        let (id, worker, kill) = pool.acquire(Uuid::new_v4(), None).unwrap();
        assert_eq!(id, ids[0]);

        pool.terminate(id).await;
        assert!(kill.is_cancelled());
        // Still checked out, so the slot survives until release() runs.
        assert_eq!(pool.size(), 1);

        pool.release(id, worker, true).await;
        assert_eq!(pool.size(), 0);
    }
}
