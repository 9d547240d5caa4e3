//! Payment intent and transaction models.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Payment intent lifecycle.
///
/// `pending -> created -> captured | failed | cancelled | refunded`.
/// Terminal states never transition again, with one exception: a captured
/// intent may later be refunded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    Pending,
    Created,
    Captured,
    Failed,
    Cancelled,
    Refunded,
}

impl IntentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentStatus::Pending => "pending",
            IntentStatus::Created => "created",
            IntentStatus::Captured => "captured",
            IntentStatus::Failed => "failed",
            IntentStatus::Cancelled => "cancelled",
            IntentStatus::Refunded => "refunded",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "created" => IntentStatus::Created,
            "captured" => IntentStatus::Captured,
            "failed" => IntentStatus::Failed,
            "cancelled" => IntentStatus::Cancelled,
            "refunded" => IntentStatus::Refunded,
            _ => IntentStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IntentStatus::Captured
                | IntentStatus::Failed
                | IntentStatus::Cancelled
                | IntentStatus::Refunded
        )
    }
}

/// A requested collection of money against zero or one sale.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PaymentIntent {
    pub id: Uuid,
    pub sale_id: Option<Uuid>,
    pub provider: String,
    pub amount: Decimal,
    pub currency: String,
    pub status: String,
    pub customer_reference: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One provider-reported event against an intent. Append-mostly.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PaymentTransaction {
    pub id: Uuid,
    pub intent_id: Uuid,
    pub transaction_id: Option<String>,
    pub status: String,
    pub amount: Option<Decimal>,
    pub reference: Option<String>,
    pub raw_response: Option<serde_json::Value>,
    pub error: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Input for intent creation.
#[derive(Debug, Clone, Deserialize)]
pub struct CreatePaymentIntent {
    pub sale_id: Option<Uuid>,
    pub amount: Decimal,
    pub provider: String,
    pub currency: Option<String>,
    pub customer_reference: Option<String>,
}

/// Field updates merged into a transaction when a provider event lands.
/// `None` fields leave the stored value untouched; previously recorded
/// references are never blanked by a partial event.
#[derive(Debug, Clone, Default)]
pub struct TransactionPatch {
    pub status: String,
    pub transaction_id: Option<String>,
    pub amount: Option<Decimal>,
    pub reference: Option<String>,
    pub raw_response: Option<serde_json::Value>,
    pub error: Option<String>,
}
