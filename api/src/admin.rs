use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::AppState;
use crate::{ApiError, ApiResult};

/// Read-only cluster status plus a manual rebalance trigger.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(cluster_status))
        .route("/rebalance", post(trigger_rebalance))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .fallback(not_found)
}

async fn health_check(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    let nodes = state.index.node_count().await;
    let required = state.index.replication_factor();

    let health = serde_json::json!({
        "status": if nodes >= required { "healthy" } else { "degraded" },
        "nodes": nodes,
        "replication_factor": required,
    });

    Ok((StatusCode::OK, Json(health)).into_response())
}

async fn cluster_status(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    let view = state.index.cluster_view().await;
    Ok((StatusCode::OK, Json(view)).into_response())
}

async fn trigger_rebalance(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    state.rebalancer.trigger();
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "rebalance scheduled" })),
    )
        .into_response())
}

async fn not_found() -> ApiResult<Response> {
    Err(ApiError::NotFound("no such admin route".to_string()))
}
