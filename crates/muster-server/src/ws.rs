//! `/ws/stream`: push a snapshot on connect, then forward the event bus.
//!
//! An `on_upgrade` closure hands off to a single socket-owning loop that
//! reads client control messages and forwards server-side events with
//! `tokio::select!`, rather than splitting reads and writes across two
//! independent tasks.

use std::collections::HashSet;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::StreamExt;
use muster_core::types::Event;
use serde::Deserialize;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/ws/stream", get(ws_handler))
}

async fn ws_handler(ws: WebSocketUpgrade, State(handle): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, handle))
}

#[derive(Deserialize)]
struct SubscribeMessage {
    subscribe: Vec<String>,
}

fn event_kind(event: &Event) -> &'static str {
    match event {
        Event::InstanceSpawned { .. } => "instance-spawned",
        Event::InstanceTerminated { .. } => "instance-terminated",
        Event::TaskSubmitted { .. } => "task-submitted",
        Event::TaskReady { .. } => "task-ready",
        Event::TaskStarted { .. } => "task-started",
        Event::TaskCompleted { .. } => "task-completed",
        Event::TaskCancelled { .. } => "task-cancelled",
        Event::WorkflowCompleted { .. } => "workflow-completed",
        Event::EventsDropped { .. } => "events-dropped",
    }
}

async fn handle_socket(mut socket: WebSocket, handle: AppState) {
    let snapshot = serde_json::json!({
        "type": "snapshot",
        "tasks": handle.snapshot_tasks(),
        "instances": handle.snapshot_workers(),
    });
    if socket.send(Message::Text(snapshot.to_string().into())).await.is_err() {
        return;
    }

    let mut kinds: Option<HashSet<String>> = None;
    let mut events = Box::pin(handle.subscribe());

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(msg) = serde_json::from_str::<SubscribeMessage>(&text) {
                            kinds = Some(msg.subscribe.into_iter().collect());
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
            event = events.next() => {
                let Some(event) = event else { break };
                if let Some(ref allowed) = kinds {
                    if !allowed.contains(event_kind(&event)) {
                        continue;
                    }
                }
                let payload = serde_json::to_string(&event).unwrap_or_default();
                if socket.send(Message::Text(payload.into())).await.is_err() {
                    break;
                }
            }
        }
    }
}
