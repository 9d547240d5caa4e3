//! Sale recording, retrieval and period-lock handlers.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use uuid::Uuid;

use crate::middleware::ActorContext;
use crate::models::{ListSalesFilter, NewSale, PeriodLock, Sale, SaleLine};
use crate::startup::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateSaleRequest {
    #[serde(flatten)]
    pub sale: NewSale,
    /// Record into a locked period. Honored only for elevated actors; the
    /// override itself is audited.
    #[serde(default)]
    pub override_lock: bool,
}

#[derive(Debug, Serialize)]
pub struct SaleResponse {
    #[serde(flatten)]
    pub sale: Sale,
    pub lines: Vec<SaleLine>,
}

pub async fn create_sale(
    State(state): State<AppState>,
    actor: ActorContext,
    Json(request): Json<CreateSaleRequest>,
) -> Result<(StatusCode, Json<SaleResponse>), AppError> {
    let override_locked = request.override_lock && actor.is_elevated();

    let (sale, lines) = state
        .db
        .record_sale(
            &actor.actor,
            override_locked,
            &request.sale,
            &state.config.billing,
        )
        .await?;

    Ok((StatusCode::CREATED, Json(SaleResponse { sale, lines })))
}

pub async fn get_sale(
    State(state): State<AppState>,
    Path(sale_id): Path<Uuid>,
) -> Result<Json<SaleResponse>, AppError> {
    let sale = state
        .db
        .get_sale(sale_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Sale {} not found", sale_id)))?;
    let lines = state.db.get_sale_lines(sale_id).await?;

    Ok(Json(SaleResponse { sale, lines }))
}

pub async fn list_sales(
    State(state): State<AppState>,
    Query(filter): Query<ListSalesFilter>,
) -> Result<Json<Vec<Sale>>, AppError> {
    let sales = state.db.list_sales(&filter).await?;
    Ok(Json(sales))
}

#[derive(Debug, Deserialize, Default)]
pub struct MarkPaidRequest {
    pub payment_method: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MarkPaidResponse {
    #[serde(flatten)]
    pub sale: Sale,
    /// False when the sale was already paid and nothing changed.
    pub changed: bool,
}

pub async fn mark_paid(
    State(state): State<AppState>,
    actor: ActorContext,
    Path(sale_id): Path<Uuid>,
    Json(request): Json<MarkPaidRequest>,
) -> Result<Json<MarkPaidResponse>, AppError> {
    let (sale, changed) = state
        .db
        .mark_paid(&actor.actor, sale_id, request.payment_method.as_deref())
        .await?;

    Ok(Json(MarkPaidResponse { sale, changed }))
}

#[derive(Debug, Deserialize)]
pub struct LockPeriodRequest {
    pub date: NaiveDate,
    pub reason: Option<String>,
}

pub async fn lock_period(
    State(state): State<AppState>,
    actor: ActorContext,
    Json(request): Json<LockPeriodRequest>,
) -> Result<(StatusCode, Json<PeriodLock>), AppError> {
    let lock = state
        .db
        .lock_period(&actor.actor, request.date, request.reason)
        .await?;

    Ok((StatusCode::CREATED, Json(lock)))
}

#[derive(Debug, Deserialize)]
pub struct UnlockPeriodQuery {
    pub reason: Option<String>,
}

pub async fn unlock_period(
    State(state): State<AppState>,
    actor: ActorContext,
    Path(date): Path<NaiveDate>,
    Query(query): Query<UnlockPeriodQuery>,
) -> Result<StatusCode, AppError> {
    let reason = query
        .reason
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .ok_or_else(|| {
            AppError::ValidationError("unlocking a period requires a reason".to_string())
        })?;

    state.db.unlock_period(&actor.actor, date, reason).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_period_locks(
    State(state): State<AppState>,
) -> Result<Json<Vec<PeriodLock>>, AppError> {
    let locks = state.db.list_period_locks().await?;
    Ok(Json(locks))
}
