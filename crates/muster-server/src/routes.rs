//! The REST surface: one handler per endpoint, all going through
//! [`crate::AppState`].

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use muster_core::error::EngineError;
use muster_core::types::{Payload, Priority, Task, TaskId, TaskState, WorkerId, WorkerMeta};
use muster_core::workflow::WorkflowExecutor;
use serde::{Deserialize, Serialize};

use crate::AppState;

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: msg.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: msg.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

impl From<EngineError> for AppError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::UnknownId(_) => AppError::not_found(e.to_string()),
            EngineError::CapacityExceeded { .. } => AppError::conflict(e.to_string()),
            EngineError::CycleDetected { .. } | EngineError::WorkflowInvalid(_) => {
                AppError::bad_request(e.to_string())
            }
            _ => AppError::internal(e.to_string()),
        }
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/instances/spawn", post(spawn_instances))
        .route("/instances", get(list_instances))
        .route("/instances/{id}", get(get_instance).delete(terminate_instance))
        .route("/instances/scale", post(scale_instances))
        .route("/tasks", post(submit_task).get(list_tasks))
        .route("/tasks/batch", post(submit_batch))
        .route("/tasks/{id}", get(get_task).delete(cancel_task))
        .route("/workflows/execute", post(execute_workflow))
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "ok": true }))
}

#[derive(Serialize)]
struct InstanceCounts {
    total: usize,
    idle: usize,
    busy: usize,
    unhealthy: usize,
}

#[derive(Serialize)]
struct StatusResponse {
    instances: InstanceCounts,
    tasks: HashMap<String, usize>,
    queue_depth: usize,
}

async fn status(State(handle): State<AppState>) -> impl IntoResponse {
    let workers = handle.snapshot_workers();
    let tasks = handle.snapshot_tasks();

    let mut instance_counts = InstanceCounts {
        total: workers.len(),
        idle: 0,
        busy: 0,
        unhealthy: 0,
    };
    for w in &workers {
        match w.state {
            muster_core::types::WorkerState::Idle => instance_counts.idle += 1,
            muster_core::types::WorkerState::Busy => instance_counts.busy += 1,
            muster_core::types::WorkerState::Unhealthy => instance_counts.unhealthy += 1,
            _ => {}
        }
    }

    let mut by_state: HashMap<String, usize> = HashMap::new();
    let mut queue_depth = 0;
    for t in &tasks {
        *by_state.entry(t.state.to_string()).or_insert(0) += 1;
        if matches!(t.state, TaskState::Pending | TaskState::Ready) {
            queue_depth += 1;
        }
    }

    Json(StatusResponse {
        instances: instance_counts,
        tasks: by_state,
        queue_depth,
    })
}

#[derive(Deserialize)]
struct SpawnRequest {
    count: usize,
    #[serde(default)]
    #[allow(dead_code)]
    working_directory: Option<String>,
}

#[derive(Serialize)]
struct SpawnResponse {
    worker_ids: Vec<WorkerId>,
}

async fn spawn_instances(
    State(handle): State<AppState>,
    Json(req): Json<SpawnRequest>,
) -> Result<Json<SpawnResponse>, AppError> {
    let worker_ids = handle.spawn_instances(req.count).await?;
    Ok(Json(SpawnResponse { worker_ids }))
}

async fn list_instances(State(handle): State<AppState>) -> Json<Vec<WorkerMeta>> {
    Json(handle.snapshot_workers())
}

async fn get_instance(
    State(handle): State<AppState>,
    Path(id): Path<WorkerId>,
) -> Result<Json<WorkerMeta>, AppError> {
    handle
        .snapshot_workers()
        .into_iter()
        .find(|w| w.id == id)
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("instance {id} not found")))
}

#[derive(Serialize)]
struct TerminateResponse {
    terminated: bool,
}

async fn terminate_instance(
    State(handle): State<AppState>,
    Path(id): Path<WorkerId>,
) -> Json<TerminateResponse> {
    let existed = handle.snapshot_workers().iter().any(|w| w.id == id);
    if existed {
        handle.terminate_instance(id).await;
    }
    Json(TerminateResponse { terminated: existed })
}

#[derive(Deserialize)]
struct ScaleRequest {
    target: usize,
}

#[derive(Serialize)]
struct ScaleResponse {
    current: usize,
}

async fn scale_instances(
    State(handle): State<AppState>,
    Json(req): Json<ScaleRequest>,
) -> Result<Json<ScaleResponse>, AppError> {
    let current = handle.scale_to(req.target).await?;
    Ok(Json(ScaleResponse { current }))
}

#[derive(Deserialize)]
struct SubmitTaskRequest {
    name: Option<String>,
    prompt: Option<String>,
    command: Option<String>,
    directory: Option<String>,
    #[serde(default)]
    priority: Priority,
    #[serde(default)]
    depends_on: Vec<TaskId>,
    pinned_instance: Option<WorkerId>,
    timeout_secs: Option<u64>,
}

impl SubmitTaskRequest {
    fn into_task(self, default_timeout: Duration) -> Result<Task, AppError> {
        let payload = match (self.prompt, self.command) {
            (Some(prompt), None) => Payload::Prompt { prompt },
            (None, Some(command)) => Payload::Command {
                command,
                working_directory: self.directory,
            },
            (None, None) => {
                return Err(AppError::bad_request("must set one of prompt or command"));
            }
            (Some(_), Some(_)) => {
                return Err(AppError::bad_request("must not set both prompt and command"));
            }
        };

        let name = self.name.unwrap_or_else(|| "task".to_string());
        let depends_on: HashSet<TaskId> = self.depends_on.into_iter().collect();
        let timeout = self.timeout_secs.map(Duration::from_secs).unwrap_or(default_timeout);

        Ok(Task::new(
            name,
            payload,
            self.priority,
            depends_on,
            self.pinned_instance,
            timeout,
        ))
    }
}

#[derive(Serialize)]
struct SubmitResponse {
    task_id: TaskId,
}

async fn submit_task(
    State(handle): State<AppState>,
    Json(req): Json<SubmitTaskRequest>,
) -> Result<Json<SubmitResponse>, AppError> {
    let task = req.into_task(handle.default_task_timeout())?;
    let task_id = handle.submit(task).await?;
    Ok(Json(SubmitResponse { task_id }))
}

#[derive(Serialize)]
struct SubmitBatchResponse {
    task_ids: Vec<TaskId>,
}

async fn submit_batch(
    State(handle): State<AppState>,
    Json(reqs): Json<Vec<SubmitTaskRequest>>,
) -> Result<Json<SubmitBatchResponse>, AppError> {
    let default_timeout = handle.default_task_timeout();
    let tasks: Result<Vec<Task>, AppError> = reqs.into_iter().map(|r| r.into_task(default_timeout)).collect();
    let task_ids = handle.submit_batch(tasks?).await?;
    Ok(Json(SubmitBatchResponse { task_ids }))
}

#[derive(Deserialize)]
struct TaskFilter {
    state: Option<String>,
}

async fn list_tasks(State(handle): State<AppState>, Query(filter): Query<TaskFilter>) -> Json<Vec<Task>> {
    let mut tasks = handle.snapshot_tasks();
    if let Some(state) = filter.state {
        tasks.retain(|t| t.state.to_string().eq_ignore_ascii_case(&state));
    }
    Json(tasks)
}

async fn get_task(State(handle): State<AppState>, Path(id): Path<TaskId>) -> Result<Json<Task>, AppError> {
    handle
        .get_task(id)
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("task {id} not found")))
}

#[derive(Serialize)]
struct CancelResponse {
    cancelled: bool,
}

async fn cancel_task(
    State(handle): State<AppState>,
    Path(id): Path<TaskId>,
) -> Result<Json<CancelResponse>, AppError> {
    let cancelled = handle.cancel(id).await?;
    Ok(Json(CancelResponse { cancelled }))
}

#[derive(Serialize)]
struct WorkflowResponse {
    workflow_id: uuid::Uuid,
    task_ids: Vec<TaskId>,
}

async fn execute_workflow(State(handle): State<AppState>, body: String) -> Result<Json<WorkflowResponse>, AppError> {
    let doc = WorkflowExecutor::parse(&body).map_err(AppError::from)?;
    let results = WorkflowExecutor::run(&handle, doc).await.map_err(AppError::from)?;
    Ok(Json(WorkflowResponse {
        workflow_id: uuid::Uuid::new_v4(),
        task_ids: results.iter().map(|t| t.id).collect(),
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use muster_core::config::EngineConfig;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let config = EngineConfig {
            max_instances: 2,
            default_task_timeout: Duration::from_secs(5),
            output_buffer_bytes: 64 * 1024,
            worker_command: vec!["/bin/sh".to_string()],
            health_sweep_interval: Duration::from_secs(30),
            stop_grace: Duration::from_secs(2),
        };
        Arc::new(muster_core::OrchestratorHandle::start(config))
    }

    async fn send(state: AppState, method: Method, uri: &str, body: Option<serde_json::Value>) -> axum::response::Response {
        let app = crate::build_router(state);
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        app.oneshot(builder.body(body).unwrap()).await.unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let state = test_state();
        let resp = send(state, Method::GET, "/health", None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["ok"], true);
    }

    #[tokio::test]
    async fn list_instances_reflects_spawned_workers() {
        let state = test_state();
        state.spawn_instances(1).await.unwrap();

        let resp = send(state, Method::GET, "/instances", None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn submit_and_fetch_task_roundtrip() {
        let state = test_state();
        let resp = send(
            state.clone(),
            Method::POST,
            "/tasks",
            Some(serde_json::json!({ "command": "echo hi" })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        let task_id = json["task_id"].as_str().unwrap().to_string();

        let resp = send(state, Method::GET, &format!("/tasks/{task_id}"), None).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn get_unknown_task_returns_not_found() {
        let state = test_state();
        let resp = send(state, Method::GET, &format!("/tasks/{}", uuid::Uuid::new_v4()), None).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cancel_of_already_terminal_task_reports_false() {
        let state = test_state();
        state.spawn_instances(1).await.unwrap();

        let resp = send(
            state.clone(),
            Method::POST,
            "/tasks",
            Some(serde_json::json!({ "command": "echo hi" })),
        )
        .await;
        let json = body_json(resp).await;
        let task_id: uuid::Uuid = json["task_id"].as_str().unwrap().parse().unwrap();
        state.await_terminal(&[task_id]).await;

        let resp = send(state, Method::DELETE, &format!("/tasks/{task_id}"), None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["cancelled"], false);
    }

    #[tokio::test]
    async fn terminate_of_unknown_instance_reports_not_existed() {
        let state = test_state();
        let resp = send(
            state,
            Method::DELETE,
            &format!("/instances/{}", uuid::Uuid::new_v4()),
            None,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["terminated"], false);
    }
}
