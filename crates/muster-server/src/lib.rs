//! Thin HTTP/WebSocket adapter over `muster_core::OrchestratorHandle`.
//!
//! Every handler is a one-to-one translation of a REST endpoint onto a
//! single `OrchestratorHandle` call: one `Router::new().route(...)` per
//! endpoint, a shared `AppError` for fallible handlers, a permissive
//! CORS layer, and `axum::serve(...).with_graceful_shutdown(...)`.

pub mod routes;
pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use muster_core::OrchestratorHandle;
use tower_http::cors::CorsLayer;

pub type AppState = Arc<OrchestratorHandle>;

pub fn build_router(handle: AppState) -> Router {
    Router::new()
        .merge(routes::router())
        .merge(ws::router())
        .layer(CorsLayer::permissive())
        .with_state(handle)
}

pub async fn run_serve(handle: AppState, bind: &str, port: u16) -> anyhow::Result<()> {
    let app = build_router(handle);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("muster serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("muster serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}
