//! Webhook reconciliation logic: payload parsing, external-id extraction and
//! the ordered sale-matching plan.
//!
//! Everything here is pure so the matching rules can be tested without a
//! database; the lookups themselves live on [`super::Database`].

use axum::http::HeaderMap;
use serde_json::{Map, Value};
use service_core::error::AppError;
use uuid::Uuid;

/// Ordered payload keys consulted for the external (dedup/audit) identifier.
const EXTERNAL_ID_KEYS: [&str; 7] = [
    "event_id",
    "id",
    "transaction_id",
    "payment_id",
    "reference",
    "order_id",
    "invoice_number",
];

/// Transport-level fallbacks when the payload itself carries no identifier.
const EXTERNAL_ID_HEADERS: [&str; 2] = ["x-request-id", "x-webhook-id"];

/// Default and bounds for a registration's retry window, in minutes.
pub const DEFAULT_RETRY_WINDOW_MINUTES: i32 = 15;
pub const MIN_RETRY_WINDOW_MINUTES: i32 = 5;
pub const MAX_RETRY_WINDOW_MINUTES: i32 = 120;

/// One step of the sale-matching plan. Steps are attempted in order; the
/// first lookup that resolves wins, and no fuzzy matching ever happens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaleRef {
    /// Explicit sale id supplied by the provider.
    Id(Uuid),
    /// Invoice number (or provider order id, which callers set to the
    /// invoice number when creating orders).
    InvoiceNumber(String),
    /// Generic transaction reference, resolved against invoice numbers.
    Reference(String),
}

/// Parse an inbound webhook body as JSON, falling back to form encoding.
///
/// An empty body is an empty object; a body that is neither JSON nor a form
/// is a validation error, surfaced as 400 before anything is stored.
pub fn parse_payload(body: &[u8]) -> Result<Value, AppError> {
    if body.is_empty() {
        return Ok(Value::Object(Map::new()));
    }

    if let Ok(value) = serde_json::from_slice::<Value>(body) {
        return Ok(value);
    }

    match serde_urlencoded::from_bytes::<Vec<(String, String)>>(body) {
        Ok(pairs) if !pairs.is_empty() => {
            let mut map = Map::new();
            for (key, value) in pairs {
                map.insert(key, Value::String(value));
            }
            Ok(Value::Object(map))
        }
        _ => Err(AppError::ValidationError(
            "payload is neither JSON nor form-encoded".to_string(),
        )),
    }
}

/// Extract the external identifier for dedup bookkeeping and audit.
///
/// Repeated identifiers are tolerated rather than rejected; matching is
/// idempotent downstream, so reprocessing a duplicate delivery is safe.
pub fn extract_external_id(payload: &Value, headers: &HeaderMap) -> Option<String> {
    for key in EXTERNAL_ID_KEYS {
        if let Some(value) = scalar_to_string(payload.get(key)) {
            return Some(value);
        }
    }

    for header in EXTERNAL_ID_HEADERS {
        if let Some(value) = headers.get(header).and_then(|h| h.to_str().ok()) {
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }

    None
}

/// Build the ordered matching plan for a payload: explicit sale id, then
/// invoice-number-like fields, then generic references.
pub fn sale_match_plan(payload: &Value) -> Vec<SaleRef> {
    let mut plan = Vec::new();

    for key in ["sale_id", "saleId", "transaction_sale_id"] {
        if let Some(raw) = scalar_to_string(payload.get(key)) {
            if let Ok(id) = Uuid::parse_str(raw.trim()) {
                plan.push(SaleRef::Id(id));
            }
        }
    }

    for key in ["invoice_number", "invoice", "order_id"] {
        if let Some(value) = scalar_to_string(payload.get(key)) {
            plan.push(SaleRef::InvoiceNumber(value));
        }
    }

    for key in ["reference", "txn_reference"] {
        if let Some(value) = scalar_to_string(payload.get(key)) {
            plan.push(SaleRef::Reference(value));
        }
    }

    plan
}

/// Clamp a requested retry window to the permitted range, defaulting when
/// absent or unparseable.
pub fn clamp_retry_window(minutes: Option<i32>) -> i32 {
    minutes
        .unwrap_or(DEFAULT_RETRY_WINDOW_MINUTES)
        .clamp(MIN_RETRY_WINDOW_MINUTES, MAX_RETRY_WINDOW_MINUTES)
}

fn scalar_to_string(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn external_id_prefers_event_id_over_other_keys() {
        let payload = json!({
            "id": "pay_2",
            "event_id": "evt_1",
            "transaction_id": "txn_3",
        });
        let headers = HeaderMap::new();

        assert_eq!(
            extract_external_id(&payload, &headers),
            Some("evt_1".to_string())
        );
    }

    #[test]
    fn external_id_walks_fallback_keys_in_order() {
        let payload = json!({ "order_id": "ord_9", "reference": "ref_5" });
        let headers = HeaderMap::new();

        assert_eq!(
            extract_external_id(&payload, &headers),
            Some("ref_5".to_string())
        );
    }

    #[test]
    fn external_id_accepts_numeric_values() {
        let payload = json!({ "id": 42 });
        let headers = HeaderMap::new();

        assert_eq!(
            extract_external_id(&payload, &headers),
            Some("42".to_string())
        );
    }

    #[test]
    fn external_id_falls_back_to_request_headers() {
        let payload = json!({});
        let mut headers = HeaderMap::new();
        headers.insert("x-request-id", "req-123".parse().unwrap());

        assert_eq!(
            extract_external_id(&payload, &headers),
            Some("req-123".to_string())
        );
    }

    #[test]
    fn external_id_is_none_when_nothing_resolves() {
        let payload = json!({ "unrelated": "value", "id": "" });
        let headers = HeaderMap::new();

        assert_eq!(extract_external_id(&payload, &headers), None);
    }

    #[test]
    fn match_plan_orders_id_then_invoice_then_reference() {
        let sale_id = Uuid::new_v4();
        let payload = json!({
            "reference": "ref_1",
            "invoice_number": "INV-20250101-00001",
            "sale_id": sale_id.to_string(),
        });

        let plan = sale_match_plan(&payload);
        assert_eq!(
            plan,
            vec![
                SaleRef::Id(sale_id),
                SaleRef::InvoiceNumber("INV-20250101-00001".to_string()),
                SaleRef::Reference("ref_1".to_string()),
            ]
        );
    }

    #[test]
    fn match_plan_skips_malformed_sale_ids() {
        let payload = json!({ "sale_id": "not-a-uuid", "invoice": "INV-1" });

        let plan = sale_match_plan(&payload);
        assert_eq!(plan, vec![SaleRef::InvoiceNumber("INV-1".to_string())]);
    }

    #[test]
    fn match_plan_is_empty_without_references() {
        let payload = json!({ "status": "captured", "amount": 100 });
        assert!(sale_match_plan(&payload).is_empty());
    }

    #[test]
    fn parse_payload_accepts_json() {
        let value = parse_payload(br#"{"status":"captured"}"#).unwrap();
        assert_eq!(value["status"], "captured");
    }

    #[test]
    fn parse_payload_accepts_form_encoding() {
        let value = parse_payload(b"status=captured&order_id=INV-1").unwrap();
        assert_eq!(value["status"], "captured");
        assert_eq!(value["order_id"], "INV-1");
    }

    #[test]
    fn parse_payload_treats_empty_body_as_empty_object() {
        let value = parse_payload(b"").unwrap();
        assert!(value.as_object().unwrap().is_empty());
    }

    #[test]
    fn parse_payload_rejects_garbage() {
        assert!(parse_payload(&[0xff, 0xfe, 0x00]).is_err());
    }

    #[test]
    fn retry_window_clamps_to_bounds() {
        assert_eq!(clamp_retry_window(None), 15);
        assert_eq!(clamp_retry_window(Some(1)), 5);
        assert_eq!(clamp_retry_window(Some(45)), 45);
        assert_eq!(clamp_retry_window(Some(600)), 120);
    }
}
