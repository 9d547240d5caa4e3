//! Payment intent and provider handlers.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use service_core::error::AppError;
use uuid::Uuid;

use crate::middleware::ActorContext;
use crate::models::{CreatePaymentIntent, PaymentIntent, PaymentTransaction};
use crate::services::providers::ProviderInfo;
use crate::services::razorpay::PaymentVerification;
use crate::startup::AppState;

#[derive(Debug, Serialize)]
pub struct IntentResponse {
    #[serde(flatten)]
    pub intent: PaymentIntent,
    pub transactions: Vec<PaymentTransaction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collect_uri: Option<String>,
}

pub async fn create_intent(
    State(state): State<AppState>,
    actor: ActorContext,
    Json(input): Json<CreatePaymentIntent>,
) -> Result<(StatusCode, Json<IntentResponse>), AppError> {
    let opened = state
        .payments
        .create_intent(&actor.actor, &input, &state.config.billing.currency)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(IntentResponse {
            intent: opened.intent,
            transactions: vec![opened.transaction],
            collect_uri: opened.collect_uri,
        }),
    ))
}

pub async fn get_intent(
    State(state): State<AppState>,
    Path(intent_id): Path<Uuid>,
) -> Result<Json<IntentResponse>, AppError> {
    let intent = state.db.get_intent(intent_id).await?.ok_or_else(|| {
        AppError::NotFound(anyhow::anyhow!("Payment intent {} not found", intent_id))
    })?;
    let transactions = state.db.intent_transactions(intent_id).await?;

    Ok(Json(IntentResponse {
        intent,
        transactions,
        collect_uri: None,
    }))
}

#[derive(Debug, Deserialize, Default)]
pub struct ListIntentsQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list_intents(
    State(state): State<AppState>,
    Query(query): Query<ListIntentsQuery>,
) -> Result<Json<Vec<PaymentIntent>>, AppError> {
    let intents = state
        .db
        .list_intents(query.limit.unwrap_or(50), query.offset.unwrap_or(0))
        .await?;
    Ok(Json(intents))
}

pub async fn list_providers(State(state): State<AppState>) -> Json<Vec<ProviderInfo>> {
    Json(state.providers.list())
}

/// Checkout confirmation posted by the storefront after Razorpay's client
/// SDK completes.
#[derive(Debug, Deserialize)]
pub struct VerifyPaymentRequest {
    pub razorpay_order_id: String,
    pub razorpay_payment_id: String,
    pub razorpay_signature: String,
    pub sale_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct VerifyPaymentResponse {
    pub verified: bool,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<PaymentIntent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sale_paid: Option<Uuid>,
}

pub async fn verify_razorpay_payment(
    State(state): State<AppState>,
    actor: ActorContext,
    Json(request): Json<VerifyPaymentRequest>,
) -> Result<Json<VerifyPaymentResponse>, AppError> {
    let verification = PaymentVerification {
        razorpay_order_id: request.razorpay_order_id.clone(),
        razorpay_payment_id: request.razorpay_payment_id.clone(),
        razorpay_signature: request.razorpay_signature,
    };

    let valid = state
        .razorpay
        .verify_payment_signature(&verification)
        .map_err(AppError::from)?;

    if !valid {
        return Err(AppError::AuthError(anyhow::anyhow!(
            "checkout signature verification failed"
        )));
    }

    // A verified checkout is a capture reported by the storefront. The
    // order id doubles as the match reference since orders are created with
    // the invoice number as receipt.
    let payload = json!({
        "status": "captured",
        "payment_id": request.razorpay_payment_id,
        "order_id": request.razorpay_order_id,
    });

    let applied = state
        .payments
        .apply_provider_event(
            &actor.actor,
            "razorpay",
            &payload,
            Some(&request.razorpay_payment_id),
            request.sale_id,
        )
        .await?;

    Ok(Json(VerifyPaymentResponse {
        verified: true,
        status: applied.status,
        intent: applied.intent,
        sale_paid: applied.sale_paid,
    }))
}
