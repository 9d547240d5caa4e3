//! Inbound webhook ingestion and operator reconciliation handlers.
//!
//! A delivery always leaves a durable `webhook_events` row: rejected when
//! authentication fails (before the 403 goes out), matched when a sale
//! resolves, pending otherwise. The matched path writes the event row, the
//! payment projection and the audit trail in one transaction.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use service_core::error::AppError;
use service_core::utils::signature::secrets_match;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::middleware::ActorContext;
use crate::models::{
    AuditRecord, ListWebhookEventsFilter, RegistrationStatus, WebhookEvent, WebhookEventStatus,
};
use crate::services::database::Database;
use crate::services::payments::PaymentService;
use crate::services::{metrics, reconcile};
use crate::startup::AppState;

/// Header carrying the registration's shared secret.
pub const WEBHOOK_SECRET_HEADER: &str = "x-webhook-secret";
/// Alternate secret header some providers send instead.
pub const WEBHOOK_SIGNATURE_HEADER: &str = "x-webhook-signature";

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub status: String,
    pub event_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sale_id: Option<Uuid>,
}

/// `POST /webhooks/:provider/:event`
#[instrument(skip(state, headers, body), fields(provider = %provider, event = %event))]
pub async fn receive(
    State(state): State<AppState>,
    Path((provider, event)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<WebhookAck>), AppError> {
    // Registrations are stored lowercased.
    let provider = provider.to_lowercase();
    let event = event.to_lowercase();

    let registration = state
        .db
        .find_registration(&provider, &event)
        .await?
        .filter(|r| r.status == RegistrationStatus::Active.as_str())
        .ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!(
                "No active webhook registration for {}/{}",
                provider,
                event
            ))
        })?;

    // Authentication first. The payload is parsed best-effort so even a
    // rejected delivery is retained verbatim.
    let presented = headers
        .get(WEBHOOK_SECRET_HEADER)
        .or_else(|| headers.get(WEBHOOK_SIGNATURE_HEADER))
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if !secrets_match(presented, &registration.secret) {
        let payload = reconcile::parse_payload(&body)
            .unwrap_or_else(|_| json!({ "raw": String::from_utf8_lossy(&body) }));
        let external_id = reconcile::extract_external_id(&payload, &headers);

        let rejected = state
            .db
            .store_rejected_event(
                &registration,
                external_id.as_deref(),
                &payload,
                "secret mismatch",
            )
            .await?;

        metrics::record_webhook_event(&provider, "rejected");
        warn!(event_id = %rejected.id, "Webhook delivery rejected: secret mismatch");

        return Err(AppError::Forbidden(anyhow::anyhow!(
            "webhook secret mismatch"
        )));
    }

    let payload = reconcile::parse_payload(&body)?;
    let external_id = reconcile::extract_external_id(&payload, &headers);
    let plan = reconcile::sale_match_plan(&payload);
    let sale = state.db.resolve_sale_reference(&plan).await?;

    let actor = format!("provider:{}", registration.provider);
    let mut tx = state.db.pool().begin().await.map_err(|e| {
        AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
    })?;

    let (status_code, ack) = match sale {
        Some(sale) => {
            let stored = Database::insert_webhook_event_on_conn(
                &mut tx,
                &registration,
                WebhookEventStatus::Matched,
                external_id.as_deref(),
                &payload,
                Some(sale.id),
                None,
                None,
            )
            .await?;

            PaymentService::apply_event_on_conn(
                &mut tx,
                &actor,
                &registration.provider,
                &payload,
                external_id.as_deref(),
                Some(sale.id),
            )
            .await?;

            Database::stamp_registration_success_on_conn(&mut tx, registration.id).await?;
            Database::append_audit_on_conn(
                &mut tx,
                &AuditRecord::new(&actor, "webhook_matched")
                    .resource("webhook_event", stored.id)
                    .after(json!({
                        "sale_id": sale.id,
                        "invoice_number": sale.invoice_number,
                        "external_id": external_id,
                    })),
            )
            .await?;

            metrics::record_webhook_event(&registration.provider, "matched");
            info!(event_id = %stored.id, sale_id = %sale.id, "Webhook matched");

            (
                StatusCode::ACCEPTED,
                WebhookAck {
                    status: "matched".to_string(),
                    event_id: stored.id,
                    sale_id: Some(sale.id),
                },
            )
        }
        None => {
            let window = reconcile::clamp_retry_window(Some(registration.retry_window_minutes));
            let next_retry_at = Utc::now() + Duration::minutes(window as i64);

            let stored = Database::insert_webhook_event_on_conn(
                &mut tx,
                &registration,
                WebhookEventStatus::Pending,
                external_id.as_deref(),
                &payload,
                None,
                Some("no sale reference resolved"),
                Some(next_retry_at),
            )
            .await?;

            Database::append_audit_on_conn(
                &mut tx,
                &AuditRecord::new(&actor, "webhook_pending")
                    .resource("webhook_event", stored.id)
                    .after(json!({ "external_id": external_id })),
            )
            .await?;

            metrics::record_webhook_event(&registration.provider, "pending");
            info!(event_id = %stored.id, "Webhook held for reconciliation");

            (
                StatusCode::ACCEPTED,
                WebhookAck {
                    status: "pending".to_string(),
                    event_id: stored.id,
                    sale_id: None,
                },
            )
        }
    };

    tx.commit().await.map_err(|e| {
        AppError::DatabaseError(anyhow::anyhow!("Failed to commit webhook delivery: {}", e))
    })?;

    Ok((status_code, Json(ack)))
}

pub async fn list_events(
    State(state): State<AppState>,
    Query(filter): Query<ListWebhookEventsFilter>,
) -> Result<Json<Vec<WebhookEvent>>, AppError> {
    let events = state.db.list_webhook_events(&filter).await?;
    Ok(Json(events))
}

pub async fn get_event(
    State(state): State<AppState>,
    Path(event_id): Path<Uuid>,
) -> Result<Json<WebhookEvent>, AppError> {
    let event = state
        .db
        .get_webhook_event(event_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Webhook event {} not found", event_id)))?;
    Ok(Json(event))
}

/// `POST /webhook-events/:id/retry` — re-run matching over the stored
/// payload. A rejected event can be retried by an operator; the original
/// rejection stays on record through the audit trail and attempt counter.
pub async fn retry_event(
    State(state): State<AppState>,
    actor: ActorContext,
    Path(event_id): Path<Uuid>,
) -> Result<Json<WebhookEvent>, AppError> {
    let event = state.db.retry_webhook_event(&actor.actor, event_id).await?;

    // An event past its retry window expires instead of re-matching.
    if event.status == WebhookEventStatus::Expired.as_str() {
        return Ok(Json(event));
    }

    let plan = reconcile::sale_match_plan(&event.payload);
    let Some(sale) = state.db.resolve_sale_reference(&plan).await? else {
        return Ok(Json(event));
    };

    let matched = finalize_match(&state, &actor.actor, &event, sale.id).await?;
    Ok(Json(matched))
}

#[derive(Debug, Deserialize)]
pub struct ManualMatchRequest {
    pub sale_id: Uuid,
}

/// `POST /webhook-events/:id/match` — operator binds a held event to a sale.
pub async fn match_event(
    State(state): State<AppState>,
    actor: ActorContext,
    Path(event_id): Path<Uuid>,
    Json(request): Json<ManualMatchRequest>,
) -> Result<Json<WebhookEvent>, AppError> {
    let event = state
        .db
        .get_webhook_event(event_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Webhook event {} not found", event_id)))?;

    if event.status == WebhookEventStatus::Matched.as_str()
        || event.status == WebhookEventStatus::Expired.as_str()
    {
        return Err(AppError::Conflict(anyhow::anyhow!(
            "event {} is {} and cannot be matched",
            event_id,
            event.status
        )));
    }

    state
        .db
        .get_sale(request.sale_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Sale {} not found", request.sale_id)))?;

    let matched = finalize_match(&state, &actor.actor, &event, request.sale_id).await?;
    Ok(Json(matched))
}

/// Bind an event to a sale and project its payment payload, atomically.
async fn finalize_match(
    state: &AppState,
    actor: &str,
    event: &WebhookEvent,
    sale_id: Uuid,
) -> Result<WebhookEvent, AppError> {
    let mut tx = state.db.pool().begin().await.map_err(|e| {
        AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
    })?;

    let matched = Database::match_webhook_event_on_conn(&mut tx, event.id, sale_id).await?;

    PaymentService::apply_event_on_conn(
        &mut tx,
        actor,
        &event.provider,
        &event.payload,
        event.external_id.as_deref(),
        Some(sale_id),
    )
    .await?;

    Database::append_audit_on_conn(
        &mut tx,
        &AuditRecord::new(actor, "webhook_matched")
            .resource("webhook_event", event.id)
            .after(json!({ "sale_id": sale_id, "external_id": event.external_id })),
    )
    .await?;

    tx.commit().await.map_err(|e| {
        AppError::DatabaseError(anyhow::anyhow!("Failed to commit event match: {}", e))
    })?;

    metrics::record_webhook_event(&event.provider, "matched");
    info!(event_id = %event.id, sale_id = %sale_id, "Webhook event matched");

    Ok(matched)
}
