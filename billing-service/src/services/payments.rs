//! Payment intent lifecycle and provider-event projection.
//!
//! Intents are the billing-side record of a requested collection; every
//! provider-reported event lands as a transaction row first, and only legal
//! transitions are projected onto the intent. Out-of-order or contradictory
//! events are recorded as anomalies and never applied.

use rust_decimal::Decimal;
use serde_json::{json, Value};
use service_core::error::AppError;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::models::{
    AuditRecord, CreatePaymentIntent, IntentStatus, PaymentIntent, PaymentTransaction,
    TransactionPatch,
};
use crate::services::database::Database;
use crate::services::metrics;
use crate::services::providers::{CollectRequest, ProviderRegistry};
use sqlx::postgres::PgConnection;

pub struct PaymentService {
    db: Arc<Database>,
    providers: Arc<ProviderRegistry>,
}

/// What a created intent hands back to the caller.
pub struct OpenedIntent {
    pub intent: PaymentIntent,
    pub transaction: PaymentTransaction,
    /// Deep link for providers that collect through one (UPI).
    pub collect_uri: Option<String>,
}

/// Outcome of projecting one provider event.
#[derive(Debug, Default)]
pub struct AppliedEvent {
    pub intent: Option<PaymentIntent>,
    pub transaction: Option<PaymentTransaction>,
    /// Sale marked paid as a consequence of a capture.
    pub sale_paid: Option<Uuid>,
    /// The event contradicted the intent's terminal state and was recorded
    /// without being applied.
    pub anomaly: bool,
    pub status: String,
}

impl PaymentService {
    pub fn new(db: Arc<Database>, providers: Arc<ProviderRegistry>) -> Self {
        Self { db, providers }
    }

    /// Open a payment intent. The intent, its initial `created` transaction
    /// and the audit row commit together; the provider collection is opened
    /// before anything is persisted so a provider failure leaves no residue.
    #[instrument(skip(self, input), fields(provider = %input.provider, actor = %actor))]
    pub async fn create_intent(
        &self,
        actor: &str,
        input: &CreatePaymentIntent,
        default_currency: &str,
    ) -> Result<OpenedIntent, AppError> {
        if input.amount <= Decimal::ZERO {
            return Err(AppError::ValidationError(
                "amount must be positive".to_string(),
            ));
        }

        let provider = self.providers.resolve_enabled(&input.provider)?;
        let currency = input
            .currency
            .clone()
            .unwrap_or_else(|| default_currency.to_string());

        // When the intent is tied to a sale, the invoice number doubles as
        // the reference the provider echoes back.
        let mut reference = input.customer_reference.clone();
        let mut description = None;
        if let Some(sale_id) = input.sale_id {
            let sale = self
                .db
                .get_sale(sale_id)
                .await?
                .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Sale {} not found", sale_id)))?;
            if reference.is_none() {
                reference = sale.invoice_number.clone();
            }
            description = sale
                .invoice_number
                .map(|number| format!("Payment for {}", number));
        }

        let collect = provider
            .create_collect(&CollectRequest {
                amount: input.amount,
                currency: currency.clone(),
                reference: reference.clone(),
                description,
            })
            .await?;

        let (intent, transaction) = self
            .db
            .create_intent(
                actor,
                input.sale_id,
                provider.name(),
                input.amount,
                &currency,
                reference,
                collect.provider_reference,
            )
            .await?;

        metrics::record_payment_event(provider.name(), "created");

        Ok(OpenedIntent {
            intent,
            transaction,
            collect_uri: collect.collect_uri,
        })
    }

    /// Project one provider event in its own transaction. The webhook path
    /// uses [`Self::apply_event_on_conn`] directly so the event row, the
    /// projection and the audit trail share the delivery's transaction.
    #[instrument(skip(self, payload), fields(provider = %provider))]
    pub async fn apply_provider_event(
        &self,
        actor: &str,
        provider: &str,
        payload: &Value,
        external_id: Option<&str>,
        sale_hint: Option<Uuid>,
    ) -> Result<AppliedEvent, AppError> {
        let mut tx = self.db.pool().begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let applied =
            Self::apply_event_on_conn(&mut tx, actor, provider, payload, external_id, sale_hint)
                .await?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit event projection: {}", e))
        })?;

        Ok(applied)
    }

    /// Project one provider event on the caller's connection.
    ///
    /// Resolution order: the provider's transaction id locates an existing
    /// transaction (and through it the intent); failing that, the sale hint
    /// locates the sale's most recent intent. The event is always recorded
    /// as a transaction row; the intent status only moves on a legal
    /// transition, and a capture additionally marks the owning sale paid.
    pub async fn apply_event_on_conn(
        conn: &mut PgConnection,
        actor: &str,
        provider: &str,
        payload: &Value,
        external_id: Option<&str>,
        sale_hint: Option<Uuid>,
    ) -> Result<AppliedEvent, AppError> {
        let status = normalize_status(payload);
        let projected = map_status(&status);

        let existing_transaction = match external_id {
            Some(id) => Database::find_transaction_by_external_id_on_conn(conn, id).await?,
            None => None,
        };

        let intent = match &existing_transaction {
            Some(transaction) => Database::get_intent_on_conn(conn, transaction.intent_id).await?,
            None => match sale_hint {
                Some(sale_id) => Database::latest_intent_for_sale_on_conn(conn, sale_id).await?,
                None => None,
            },
        };

        let mut applied = AppliedEvent {
            status: status.clone(),
            ..Default::default()
        };

        let Some(intent) = intent else {
            // No intent to project onto; a capture against a known sale
            // still settles the sale.
            if let (Some(sale_id), Some(IntentStatus::Captured)) = (sale_hint, projected) {
                if let Some((sale, changed)) =
                    Database::mark_sale_paid_on_conn(conn, actor, sale_id, Some(provider)).await?
                {
                    if changed {
                        applied.sale_paid = Some(sale.id);
                    }
                }
            }
            return Ok(applied);
        };

        let current = IntentStatus::from_string(&intent.status);
        let mismatch = amount_mismatch(payload, intent.amount);

        let mut patch = TransactionPatch {
            status: status.clone(),
            transaction_id: external_id.map(str::to_string),
            amount: payload_amount(payload),
            reference: payload
                .get("reference")
                .and_then(Value::as_str)
                .map(str::to_string),
            raw_response: Some(payload.clone()),
            error: mismatch.clone(),
        };

        let legal = match projected {
            Some(next) => next == current || transition_allowed(current, next),
            None => true,
        };

        if !legal {
            patch.error = Some(match mismatch {
                Some(mismatch) => format!(
                    "illegal transition {} -> {}; {}",
                    current.as_str(),
                    status,
                    mismatch
                ),
                None => format!("illegal transition {} -> {}", current.as_str(), status),
            });
        }

        let transaction = match &existing_transaction {
            Some(existing) => Database::update_transaction_on_conn(conn, existing.id, &patch).await?,
            None => Database::insert_transaction_on_conn(conn, intent.id, &patch).await?,
        };
        applied.transaction = Some(transaction);

        if let Some(mismatch) = &patch.error {
            warn!(intent_id = %intent.id, provider, issue = %mismatch, "Payment event recorded with issue");
        }

        match projected {
            Some(next) if !legal => {
                Database::append_audit_on_conn(
                    conn,
                    &AuditRecord::new(actor, "payment_anomaly")
                        .resource("payment_intent", intent.id)
                        .before(json!({ "status": current.as_str() }))
                        .after(json!({ "reported_status": next.as_str(), "external_id": external_id })),
                )
                .await?;
                metrics::record_payment_anomaly(provider);
                applied.anomaly = true;
                applied.intent = Some(intent);
            }
            Some(next) if next != current => {
                let updated = Database::update_intent_status_on_conn(conn, intent.id, next).await?;
                metrics::record_payment_event(provider, next.as_str());
                info!(
                    intent_id = %updated.id,
                    from = current.as_str(),
                    to = next.as_str(),
                    "Payment intent transitioned"
                );

                if next == IntentStatus::Captured {
                    let sale_id = updated.sale_id.or(sale_hint);
                    if let Some(sale_id) = sale_id {
                        if let Some((sale, changed)) =
                            Database::mark_sale_paid_on_conn(conn, actor, sale_id, Some(provider))
                                .await?
                        {
                            if changed {
                                applied.sale_paid = Some(sale.id);
                            }
                        }
                    }
                }
                applied.intent = Some(updated);
            }
            _ => {
                // Duplicate delivery or informational status: the
                // transaction row is the whole record.
                applied.intent = Some(intent);
            }
        }

        Ok(applied)
    }
}

/// Whether an intent may move from `current` to `next`. Terminal states are
/// final, with the single exception of a captured intent being refunded.
pub fn transition_allowed(current: IntentStatus, next: IntentStatus) -> bool {
    if !current.is_terminal() {
        return true;
    }
    current == IntentStatus::Captured && next == IntentStatus::Refunded
}

/// Normalize a provider-reported status: take `status`, else `event`,
/// lowercase it, keep the last dot-segment (`payment.captured` ->
/// `captured`) and fold provider synonyms onto the canonical lifecycle.
pub fn normalize_status(payload: &Value) -> String {
    let raw = payload
        .get("status")
        .and_then(Value::as_str)
        .or_else(|| payload.get("event").and_then(Value::as_str))
        .unwrap_or("");

    let token = raw
        .to_lowercase()
        .rsplit('.')
        .next()
        .unwrap_or("")
        .trim()
        .to_string();

    match token.as_str() {
        "captured" | "paid" | "succeeded" | "success" | "completed" => "captured".to_string(),
        "failed" | "failure" => "failed".to_string(),
        "cancelled" | "canceled" => "cancelled".to_string(),
        "refunded" | "refund" => "refunded".to_string(),
        "created" => "created".to_string(),
        other => other.to_string(),
    }
}

/// Map a normalized status onto the intent lifecycle. Statuses outside the
/// lifecycle are recorded but never projected.
fn map_status(status: &str) -> Option<IntentStatus> {
    match status {
        "created" => Some(IntentStatus::Created),
        "captured" => Some(IntentStatus::Captured),
        "failed" => Some(IntentStatus::Failed),
        "cancelled" => Some(IntentStatus::Cancelled),
        "refunded" => Some(IntentStatus::Refunded),
        _ => None,
    }
}

/// Amount carried by the payload, if any. Accepts a numeric or string field.
fn payload_amount(payload: &Value) -> Option<Decimal> {
    match payload.get("amount") {
        Some(Value::Number(n)) => Decimal::from_str(&n.to_string()).ok(),
        Some(Value::String(s)) => Decimal::from_str(s.trim()).ok(),
        _ => None,
    }
}

/// A reported amount that disagrees with the intent is evidence worth
/// keeping, not grounds for rejection.
fn amount_mismatch(payload: &Value, expected: Decimal) -> Option<String> {
    let reported = payload_amount(payload)?;
    if reported == expected {
        None
    } else {
        Some(format!(
            "amount mismatch: event reports {}, intent expects {}",
            reported, expected
        ))
    }
}
