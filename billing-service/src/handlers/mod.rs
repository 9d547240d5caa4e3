//! HTTP handlers for billing-service.

pub mod compliance;
pub mod items;
pub mod payments;
pub mod registrations;
pub mod sales;
pub mod webhooks;

use axum::extract::State;
use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::services;
use crate::startup::AppState;

pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.db.health_check().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "status": "ok", "service": "billing-service" })),
        ),
        Err(err) => {
            tracing::error!(error = %err, "Health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unavailable", "service": "billing-service" })),
            )
        }
    }
}

pub async fn metrics() -> impl IntoResponse {
    (StatusCode::OK, services::get_metrics())
}
