//! A small REST client for talking to a running `muster-server`.
//!
//! Used by the `status`/`instances` subcommands and by `submit`/
//! `workflow run` when invoked with `--server`.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use muster_core::types::{Task, TaskId, WorkerId, WorkerMeta};
use serde::Deserialize;

/// A non-2xx response from the server, carrying the status so callers
/// can distinguish e.g. a 400 (bad workflow document) from a 5xx.
#[derive(Debug)]
pub struct HttpStatusError {
    pub status: reqwest::StatusCode,
    pub body: String,
}

impl std::fmt::Display for HttpStatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "server returned {}: {}", self.status, self.body)
    }
}

impl std::error::Error for HttpStatusError {}

pub struct ServerClient {
    base: String,
    http: reqwest::Client,
}

impl ServerClient {
    pub fn new(base: String) -> Self {
        Self {
            base,
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base.trim_end_matches('/'), path)
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T> {
        let resp = self.http.get(self.url(path)).send().await?;
        check_status(&resp)?;
        Ok(resp.json().await.context("failed to parse server response")?)
    }

    async fn post_json<B: serde::Serialize, T: for<'de> Deserialize<'de>>(&self, path: &str, body: &B) -> Result<T> {
        let resp = self.http.post(self.url(path)).json(body).send().await?;
        check_status(&resp)?;
        Ok(resp.json().await.context("failed to parse server response")?)
    }

    pub async fn status(&self) -> Result<serde_json::Value> {
        self.get_json("/status").await
    }

    pub async fn spawn_instances(&self, count: usize) -> Result<Vec<WorkerId>> {
        #[derive(Deserialize)]
        struct SpawnResponse {
            worker_ids: Vec<WorkerId>,
        }
        let resp: SpawnResponse = self
            .post_json("/instances/spawn", &serde_json::json!({ "count": count }))
            .await?;
        Ok(resp.worker_ids)
    }

    pub async fn scale_instances(&self, target: usize) -> Result<usize> {
        #[derive(Deserialize)]
        struct ScaleResponse {
            current: usize,
        }
        let resp: ScaleResponse = self
            .post_json("/instances/scale", &serde_json::json!({ "target": target }))
            .await?;
        Ok(resp.current)
    }

    pub async fn list_instances(&self) -> Result<Vec<WorkerMeta>> {
        self.get_json("/instances").await
    }

    pub async fn terminate_instance(&self, id: WorkerId) -> Result<bool> {
        #[derive(Deserialize)]
        struct TerminateResponse {
            terminated: bool,
        }
        let resp = self.http.delete(self.url(&format!("/instances/{id}"))).send().await?;
        check_status(&resp)?;
        let parsed: TerminateResponse = resp.json().await?;
        Ok(parsed.terminated)
    }

    pub async fn submit_task(&self, body: serde_json::Value) -> Result<TaskId> {
        #[derive(Deserialize)]
        struct SubmitResponse {
            task_id: TaskId,
        }
        let resp: SubmitResponse = self.post_json("/tasks", &body).await?;
        Ok(resp.task_id)
    }

    pub async fn get_task(&self, id: TaskId) -> Result<Task> {
        self.get_json(&format!("/tasks/{id}")).await
    }

    pub async fn execute_workflow(&self, yaml: String) -> Result<(uuid::Uuid, Vec<TaskId>)> {
        #[derive(Deserialize)]
        struct WorkflowResponse {
            workflow_id: uuid::Uuid,
            task_ids: Vec<TaskId>,
        }
        let resp = self
            .http
            .post(self.url("/workflows/execute"))
            .header("content-type", "text/yaml")
            .body(yaml)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(HttpStatusError { status, body }.into());
        }
        let parsed: WorkflowResponse = resp.json().await?;
        Ok((parsed.workflow_id, parsed.task_ids))
    }

    /// Poll `/tasks/{id}` until the task reaches a terminal state.
    pub async fn await_terminal(&self, id: TaskId) -> Result<Task> {
        loop {
            let task = self.get_task(id).await?;
            if task.state.is_terminal() {
                return Ok(task);
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }
}

fn check_status(resp: &reqwest::Response) -> Result<()> {
    if resp.status().is_success() {
        Ok(())
    } else {
        bail!("server returned {}", resp.status())
    }
}
