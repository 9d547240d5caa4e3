//! E-invoice submission model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Filing attempt lifecycle: `pending -> submitted -> acknowledged | rejected`.
/// A transport failure leaves the row pending with the error recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Pending,
    Submitted,
    Acknowledged,
    Rejected,
}

impl SubmissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionStatus::Pending => "pending",
            SubmissionStatus::Submitted => "submitted",
            SubmissionStatus::Acknowledged => "acknowledged",
            SubmissionStatus::Rejected => "rejected",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "submitted" => SubmissionStatus::Submitted,
            "acknowledged" => SubmissionStatus::Acknowledged,
            "rejected" => SubmissionStatus::Rejected,
            _ => SubmissionStatus::Pending,
        }
    }
}

/// One attempt to file a sale with the tax authority. Retries create new
/// rows, never mutate old ones.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EInvoiceSubmission {
    pub id: Uuid,
    pub sale_id: Uuid,
    pub provider: String,
    pub status: String,
    pub payload: serde_json::Value,
    pub response: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
