//! Webhook registration and inbound event models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStatus {
    Active,
    Inactive,
}

impl RegistrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrationStatus::Active => "active",
            RegistrationStatus::Inactive => "inactive",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "inactive" => RegistrationStatus::Inactive,
            _ => RegistrationStatus::Active,
        }
    }
}

/// Inbound delivery state. `received` is transient and never stored: a
/// delivery lands as rejected, pending or matched. A pending event whose
/// retry window lapses becomes expired; matched and expired are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventStatus {
    Rejected,
    Pending,
    Matched,
    Expired,
}

impl WebhookEventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookEventStatus::Rejected => "rejected",
            WebhookEventStatus::Pending => "pending",
            WebhookEventStatus::Matched => "matched",
            WebhookEventStatus::Expired => "expired",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "rejected" => WebhookEventStatus::Rejected,
            "matched" => WebhookEventStatus::Matched,
            "expired" => WebhookEventStatus::Expired,
            _ => WebhookEventStatus::Pending,
        }
    }
}

/// Static per-(provider, event) webhook configuration.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WebhookRegistration {
    pub id: Uuid,
    pub provider: String,
    pub event: String,
    #[serde(skip_serializing)]
    pub secret: String,
    pub status: String,
    pub retry_window_minutes: i32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One inbound delivery, retained indefinitely.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WebhookEvent {
    pub id: Uuid,
    pub registration_id: Uuid,
    pub provider: String,
    pub event: String,
    pub external_id: Option<String>,
    pub status: String,
    pub attempts: i32,
    pub payload: serde_json::Value,
    pub matched_sale_id: Option<Uuid>,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateWebhookRegistration {
    pub provider: String,
    pub event: String,
    /// Generated server-side when omitted.
    pub secret: Option<String>,
    pub retry_window_minutes: Option<i32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateWebhookRegistration {
    pub secret: Option<String>,
    pub retry_window_minutes: Option<i32>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListWebhookEventsFilter {
    pub status: Option<String>,
    pub provider: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}
