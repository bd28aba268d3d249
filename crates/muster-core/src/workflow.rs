//! YAML-driven workflow execution: a document describing a batch of
//! named, interdependent tasks, submitted to the queue as one atomic
//! unit and awaited to completion.
//!
//! Document parsing is `serde_yaml` over a small struct; validation
//! (duplicate names, dangling `depends_on`, cycles) runs over task
//! *names* before `TaskId`s exist, since a workflow author writes
//! names, not ids.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use serde::Deserialize;
use uuid::Uuid;

use crate::error::EngineError;
use crate::orchestrator::OrchestratorHandle;
use crate::types::{Payload, Priority, Task, TaskId, TaskState, WorkerState};

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowDocument {
    pub name: String,
    #[serde(default)]
    pub instances: Option<usize>,
    pub tasks: Vec<WorkflowTaskSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowTaskSpec {
    pub name: String,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub priority: Priority,
    /// 1-based index into the pool's current worker roster; pins this
    /// task to that specific instance rather than letting the
    /// dispatcher pick one.
    #[serde(default)]
    pub instance: Option<usize>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

pub struct WorkflowExecutor;

impl WorkflowExecutor {
    pub fn parse(yaml: &str) -> Result<WorkflowDocument, EngineError> {
        serde_yaml::from_str(yaml).map_err(|e| EngineError::WorkflowInvalid(e.to_string()))
    }

    /// Validate, scale the pool if `instances` is set, submit every
    /// task as one atomic batch, then await the whole batch's terminal
    /// states.
    pub async fn run(handle: &OrchestratorHandle, doc: WorkflowDocument) -> Result<Vec<Task>, EngineError> {
        validate(&doc)?;

        if let Some(n) = doc.instances {
            handle
                .scale_to(n)
                .await
                .map_err(|e| EngineError::WorkflowInvalid(e.to_string()))?;
        }

        let workers = handle.snapshot_workers();
        let idle_workers: Vec<_> = workers.iter().filter(|w| w.state == WorkerState::Idle).collect();
        let id_by_name: HashMap<String, TaskId> =
            doc.tasks.iter().map(|t| (t.name.clone(), Uuid::new_v4())).collect();

        let mut tasks = Vec::with_capacity(doc.tasks.len());
        for spec in &doc.tasks {
            let payload = match (&spec.prompt, &spec.command) {
                (Some(prompt), None) => Payload::Prompt { prompt: prompt.clone() },
                (None, Some(command)) => Payload::Command {
                    command: command.clone(),
                    working_directory: spec.working_directory.clone(),
                },
                (None, None) => {
                    return Err(EngineError::WorkflowInvalid(format!(
                        "task '{}' must set one of prompt or command",
                        spec.name
                    )));
                }
                (Some(_), Some(_)) => {
                    return Err(EngineError::WorkflowInvalid(format!(
                        "task '{}' must not set both prompt and command",
                        spec.name
                    )));
                }
            };

            let depends_on: HashSet<TaskId> = spec
                .depends_on
                .iter()
                .map(|name| id_by_name[name])
                .collect();

            let pinned_instance = match spec.instance {
                Some(idx) => match idle_workers.get(idx.saturating_sub(1)) {
                    Some(worker) => Some(worker.id),
                    None => {
                        tracing::warn!(
                            task = %spec.name,
                            instance = idx,
                            idle_count = idle_workers.len(),
                            "workflow task references an instance that cannot be pinned; downgrading to unpinned"
                        );
                        None
                    }
                },
                None => None,
            };

            let timeout = spec
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| handle.default_task_timeout());

            tasks.push(Task {
                id: id_by_name[&spec.name],
                name: spec.name.clone(),
                payload,
                priority: spec.priority,
                depends_on,
                pinned_instance,
                timeout,
                submitted_at: chrono::Utc::now(),
                started_at: None,
                completed_at: None,
                state: TaskState::Pending,
                result: None,
            });
        }

        let ids = handle.submit_batch(tasks).await?;
        Ok(handle.await_terminal(&ids).await)
    }
}

fn validate(doc: &WorkflowDocument) -> Result<(), EngineError> {
    if doc.tasks.is_empty() {
        return Err(EngineError::WorkflowInvalid(
            "workflow must declare at least one task".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for t in &doc.tasks {
        if !seen.insert(t.name.as_str()) {
            return Err(EngineError::WorkflowInvalid(format!(
                "duplicate task name '{}'",
                t.name
            )));
        }
    }
    for t in &doc.tasks {
        for dep in &t.depends_on {
            if !seen.contains(dep.as_str()) {
                return Err(EngineError::WorkflowInvalid(format!(
                    "task '{}' depends on unknown task '{}'",
                    t.name, dep
                )));
            }
        }
    }

    let idx: HashMap<&str, usize> = doc
        .tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.name.as_str(), i))
        .collect();
    let n = doc.tasks.len();
    let mut in_degree = vec![0usize; n];
    let mut adj: Vec<Vec<usize>> = vec![Vec::new(); n];
    for t in &doc.tasks {
        let to = idx[t.name.as_str()];
        for dep in &t.depends_on {
            let from = idx[dep.as_str()];
            adj[from].push(to);
            in_degree[to] += 1;
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
        return Err(EngineError::WorkflowInvalid(
            "workflow task graph contains a cycle".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

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
    async fn out_of_range_instance_downgrades_to_unpinned() {
        let handle = OrchestratorHandle::start(make_config());
        handle.spawn_instances(1).await.unwrap();

        let yaml = r#"
name: demo
tasks:
  - name: build
    command: echo hi
    instance: 5
"#;
        let doc = WorkflowExecutor::parse(yaml).unwrap();
        let results = WorkflowExecutor::run(&handle, doc).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].state, TaskState::Completed);
        handle.stop().await;
    }

    #[test]
    fn parses_minimal_document() {
        let yaml = r#"
name: demo
tasks:
  - name: build
    command: cargo build
"#;
        let doc = WorkflowExecutor::parse(yaml).unwrap();
        assert_eq!(doc.name, "demo");
        assert_eq!(doc.tasks.len(), 1);
        assert_eq!(doc.tasks[0].priority, Priority::Normal);
    }

    #[test]
    fn rejects_duplicate_names() {
        let doc = WorkflowDocument {
            name: "d".to_string(),
            instances: None,
            tasks: vec![
                WorkflowTaskSpec {
                    name: "a".to_string(),
                    prompt: None,
                    command: Some("echo a".to_string()),
                    working_directory: None,
                    depends_on: vec![],
                    priority: Priority::Normal,
                    instance: None,
                    timeout_secs: None,
                },
                WorkflowTaskSpec {
                    name: "a".to_string(),
                    prompt: None,
                    command: Some("echo b".to_string()),
                    working_directory: None,
                    depends_on: vec![],
                    priority: Priority::Normal,
                    instance: None,
                    timeout_secs: None,
                },
            ],
        };
        assert!(validate(&doc).is_err());
    }

    #[test]
    fn rejects_unknown_dependency() {
        let doc = WorkflowDocument {
            name: "d".to_string(),
            instances: None,
            tasks: vec![WorkflowTaskSpec {
                name: "a".to_string(),
                prompt: None,
                command: Some("echo a".to_string()),
                working_directory: None,
                depends_on: vec!["ghost".to_string()],
                priority: Priority::Normal,
                instance: None,
                timeout_secs: None,
            }],
        };
        assert!(validate(&doc).is_err());
    }

    #[test]
    fn rejects_cyclic_graph() {
        let doc = WorkflowDocument {
            name: "d".to_string(),
            instances: None,
            tasks: vec![
                WorkflowTaskSpec {
                    name: "a".to_string(),
                    prompt: None,
                    command: Some("echo a".to_string()),
                    working_directory: None,
                    depends_on: vec!["b".to_string()],
                    priority: Priority::Normal,
                    instance: None,
                    timeout_secs: None,
                },
                WorkflowTaskSpec {
                    name: "b".to_string(),
                    prompt: None,
                    command: Some("echo b".to_string()),
                    working_directory: None,
                    depends_on: vec!["a".to_string()],
                    priority: Priority::Normal,
                    instance: None,
                    timeout_secs: None,
                },
            ],
        };
        assert!(validate(&doc).is_err());
    }
}
