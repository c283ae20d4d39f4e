//! HTTP server exposing the agent operations

use crate::agent::InstanceAgent;
use crate::error::{AgentError, Result};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use cohost_core::{HardwareSignature, Identity, LockAck, LockRequest, ProbeReport};
use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Query parameters of `/probe`
#[derive(Debug, Default, Deserialize)]
pub struct ProbeQuery {
    pub repetitions: Option<usize>,
}

/// Build the router with every agent route
pub fn create_router(agent: Arc<InstanceAgent>) -> Router {
    Router::new()
        .route("/lock", get(lock_handler))
        .route("/stop", get(stop_handler))
        .route("/probe", get(probe_handler))
        .route("/identity", get(identity_handler))
        .route("/info", get(info_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(agent)
}

/// Serve the agent on `bind` until `shutdown` resolves
pub async fn serve<F>(agent: Arc<InstanceAgent>, bind: SocketAddr, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(bind)
        .await
        .map_err(|e| AgentError::Configuration(format!("Failed to bind to {}: {}", bind, e)))?;
    info!("Agent listening on {}", listener.local_addr()?);

    let app = create_router(Arc::clone(&agent));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    agent.shutdown();
    info!("Agent stopped");
    Ok(())
}

async fn lock_handler(
    State(agent): State<Arc<InstanceAgent>>,
    Query(request): Query<LockRequest>,
) -> Result<Json<LockAck>> {
    Ok(Json(agent.lock(request).await?))
}

async fn stop_handler(State(agent): State<Arc<InstanceAgent>>) -> Json<LockAck> {
    Json(agent.stop())
}

async fn probe_handler(
    State(agent): State<Arc<InstanceAgent>>,
    Query(query): Query<ProbeQuery>,
) -> Result<Json<ProbeReport>> {
    Ok(Json(agent.probe(query.repetitions).await?))
}

async fn identity_handler(State(agent): State<Arc<InstanceAgent>>) -> Json<Identity> {
    Json(agent.identity())
}

async fn info_handler(State(agent): State<Arc<InstanceAgent>>) -> Json<HardwareSignature> {
    Json(agent.signature().clone())
}

async fn health_handler(State(agent): State<Arc<InstanceAgent>>) -> Response {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "stable_id": agent.identity().stable_id,
            "version": env!("CARGO_PKG_VERSION"),
            "timestamp": chrono::Utc::now().to_rfc3339()
        })),
    )
        .into_response()
}

async fn metrics_handler(State(agent): State<Arc<InstanceAgent>>) -> Result<Response> {
    let body = agent.metrics().export()?;
    Ok((
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response())
}
