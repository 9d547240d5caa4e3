//! GST e-invoice filing handlers.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use service_core::error::AppError;
use uuid::Uuid;

use crate::middleware::ActorContext;
use crate::models::EInvoiceSubmission;
use crate::services::gst::FilingStatus;
use crate::startup::AppState;

/// `POST /sales/:id/gst/submit` — file the sale with the tax authority.
/// 202: the verdict (or pending state on transport failure) is in the body.
pub async fn submit(
    State(state): State<AppState>,
    actor: ActorContext,
    Path(sale_id): Path<Uuid>,
) -> Result<(StatusCode, Json<EInvoiceSubmission>), AppError> {
    let submission = state.gst.submit(&actor.actor, sale_id).await?;
    Ok((StatusCode::ACCEPTED, Json(submission)))
}

pub async fn status(
    State(state): State<AppState>,
    Path(sale_id): Path<Uuid>,
) -> Result<Json<FilingStatus>, AppError> {
    let status = state.gst.status(sale_id).await?;
    Ok(Json(status))
}

/// `POST /sales/:id/gst/retry` — open a fresh filing attempt.
pub async fn retry(
    State(state): State<AppState>,
    actor: ActorContext,
    Path(sale_id): Path<Uuid>,
) -> Result<(StatusCode, Json<EInvoiceSubmission>), AppError> {
    let submission = state.gst.retry(&actor.actor, sale_id).await?;
    Ok((StatusCode::ACCEPTED, Json(submission)))
}

pub async fn submissions(
    State(state): State<AppState>,
    Path(sale_id): Path<Uuid>,
) -> Result<Json<Vec<EInvoiceSubmission>>, AppError> {
    let submissions = state.gst.list_submissions(sale_id).await?;
    Ok(Json(submissions))
}
