//! Sale (invoice) model and its two status axes.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Payment axis of a sale. Independent of the GST filing axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Due,
    Paid,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Due => "due",
            PaymentStatus::Paid => "paid",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "paid" => PaymentStatus::Paid,
            _ => PaymentStatus::Due,
        }
    }
}

/// GST filing axis of a sale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GstStatus {
    Pending,
    Queued,
    Acknowledged,
    Rejected,
}

impl GstStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GstStatus::Pending => "pending",
            GstStatus::Queued => "queued",
            GstStatus::Acknowledged => "acknowledged",
            GstStatus::Rejected => "rejected",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "queued" => GstStatus::Queued,
            "acknowledged" => GstStatus::Acknowledged,
            "rejected" => GstStatus::Rejected,
            _ => GstStatus::Pending,
        }
    }
}

/// One purchase transaction. Never hard-deleted.
///
/// Invariants: `grand_total == subtotal - discount + tax_total + round_off`
/// exactly, and at most one of (cgst + sgst) or igst is non-zero.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Sale {
    pub id: Uuid,
    pub invoice_number: Option<String>,
    pub sold_on: NaiveDate,
    pub sold_at: DateTime<Utc>,
    pub customer_name: Option<String>,
    pub customer_phone: Option<String>,
    pub discount: Decimal,
    pub subtotal: Decimal,
    pub cgst: Decimal,
    pub sgst: Decimal,
    pub igst: Decimal,
    pub tax_total: Decimal,
    pub round_off: Decimal,
    pub grand_total: Decimal,
    pub seller_state_code: String,
    pub buyer_state_code: String,
    pub seller_gstin: Option<String>,
    pub buyer_gstin: Option<String>,
    pub payment_method: String,
    pub payment_status: String,
    pub paid_at: Option<DateTime<Utc>>,
    pub locked: bool,
    pub gst_status: String,
    pub irn: Option<String>,
    pub ack_no: Option<String>,
    pub eway_bill_no: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-line tax breakdown, retained for traceability even when a line
/// contributes zero tax.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SaleLine {
    pub id: Uuid,
    pub sale_id: Uuid,
    pub line_no: i32,
    pub item_id: Option<Uuid>,
    pub description: String,
    pub quantity: Decimal,
    pub rate: Decimal,
    pub tax_rate: Decimal,
    pub base_amount: Decimal,
    pub cgst: Decimal,
    pub sgst: Decimal,
    pub igst: Decimal,
}

/// Input line for sale recording. When `item_id` is set, description, rate
/// and tax rate default from the item and the stock check applies.
#[derive(Debug, Clone, Deserialize)]
pub struct NewSaleLine {
    pub item_id: Option<Uuid>,
    pub description: Option<String>,
    pub quantity: Decimal,
    pub rate: Option<Decimal>,
    pub tax_rate: Option<Decimal>,
    #[serde(default)]
    pub discount: Option<Decimal>,
}

/// Input for sale recording.
#[derive(Debug, Clone, Deserialize)]
pub struct NewSale {
    pub lines: Vec<NewSaleLine>,
    pub customer_name: Option<String>,
    pub customer_phone: Option<String>,
    pub buyer_state_code: Option<String>,
    pub buyer_gstin: Option<String>,
    pub payment_method: Option<String>,
    pub sold_at: Option<DateTime<Utc>>,
}

/// Filter for sale listings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListSalesFilter {
    pub payment_status: Option<String>,
    pub gst_status: Option<String>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// An administratively closed accounting day.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PeriodLock {
    pub id: Uuid,
    pub locked_date: NaiveDate,
    pub locked_by: String,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}
