//! Webhook ingestion and reconciliation tests.

mod common;

use common::TestApp;
use serde_json::{json, Value};

async fn deliver(
    app: &TestApp,
    provider: &str,
    event: &str,
    secret: &str,
    payload: &Value,
) -> reqwest::Response {
    app.client
        .post(app.url(&format!("/webhooks/{}/{}", provider, event)))
        .header("x-webhook-secret", secret)
        .json(payload)
        .send()
        .await
        .unwrap()
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn unregistered_webhook_is_not_found() {
    let app = TestApp::spawn().await;

    let response = deliver(&app, "razorpay", "payment.captured", "any", &json!({})).await;
    assert_eq!(response.status(), 404);

    app.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn bad_secret_is_rejected_but_persisted() {
    let app = TestApp::spawn().await;
    let item_id = app.seed_item("Pen", "10.00", "12", "10").await;
    let sale = app.seed_sale(&item_id, "1").await;
    let (_, _secret) = app.seed_registration("razorpay", "payment.captured").await;

    // A valid reference cannot rescue a delivery that fails authentication.
    let payload = json!({
        "event_id": "evt_bad_1",
        "status": "captured",
        "invoice_number": sale["invoice_number"],
    });
    let response = deliver(&app, "razorpay", "payment.captured", "wrong", &payload).await;
    assert_eq!(response.status(), 403);

    let events: Value = app
        .get("/webhook-events?status=rejected")
        .await
        .json()
        .await
        .unwrap();
    let events = events.as_array().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["external_id"], "evt_bad_1");
    assert_eq!(events[0]["status"], "rejected");

    // The sale stayed unpaid.
    let sale_after: Value = app
        .get(&format!("/sales/{}", sale["id"].as_str().unwrap()))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(sale_after["payment_status"], "due");

    app.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn matched_delivery_settles_the_sale() {
    let app = TestApp::spawn().await;
    let item_id = app.seed_item("Pen", "10.00", "12", "10").await;
    let sale = app.seed_sale(&item_id, "1").await;
    let (_, secret) = app.seed_registration("razorpay", "payment.captured").await;

    let payload = json!({
        "event_id": "evt_ok_1",
        "event": "payment.captured",
        "invoice_number": sale["invoice_number"],
    });
    let response = deliver(&app, "razorpay", "payment.captured", &secret, &payload).await;
    assert_eq!(response.status(), 202);

    let ack: Value = response.json().await.unwrap();
    assert_eq!(ack["status"], "matched");
    assert_eq!(ack["sale_id"], sale["id"]);

    let sale_after: Value = app
        .get(&format!("/sales/{}", sale["id"].as_str().unwrap()))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(sale_after["payment_status"], "paid");

    app.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn duplicate_delivery_is_safe() {
    let app = TestApp::spawn().await;
    let item_id = app.seed_item("Pen", "10.00", "12", "10").await;
    let sale = app.seed_sale(&item_id, "1").await;
    let (_, secret) = app.seed_registration("razorpay", "payment.captured").await;

    let payload = json!({
        "event_id": "evt_dup_1",
        "status": "captured",
        "invoice_number": sale["invoice_number"],
    });

    for _ in 0..2 {
        let response = deliver(&app, "razorpay", "payment.captured", &secret, &payload).await;
        assert_eq!(response.status(), 202);
        let ack: Value = response.json().await.unwrap();
        assert_eq!(ack["status"], "matched");
    }

    let sale_after: Value = app
        .get(&format!("/sales/{}", sale["id"].as_str().unwrap()))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(sale_after["payment_status"], "paid");

    app.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn referenceless_delivery_is_held_and_can_be_matched_later() {
    let app = TestApp::spawn().await;
    let (_, secret) = app.seed_registration("upi", "collect.completed").await;

    let response = deliver(
        &app,
        "upi",
        "collect.completed",
        &secret,
        &json!({ "event_id": "evt_orphan_1", "status": "captured" }),
    )
    .await;
    assert_eq!(response.status(), 202);

    let ack: Value = response.json().await.unwrap();
    assert_eq!(ack["status"], "pending");
    let event_id = ack["event_id"].as_str().unwrap().to_string();

    // Operator finds the held event and binds it to a sale manually.
    let item_id = app.seed_item("Pen", "10.00", "12", "10").await;
    let sale = app.seed_sale(&item_id, "1").await;

    let matched: Value = app
        .post(
            &format!("/webhook-events/{}/match", event_id),
            &json!({ "sale_id": sale["id"] }),
        )
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(matched["status"], "matched");
    assert_eq!(matched["matched_sale_id"], sale["id"]);

    let sale_after: Value = app
        .get(&format!("/sales/{}", sale["id"].as_str().unwrap()))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(sale_after["payment_status"], "paid");

    // A matched event cannot be matched again.
    let again = app
        .post(
            &format!("/webhook-events/{}/match", event_id),
            &json!({ "sale_id": sale["id"] }),
        )
        .await;
    assert_eq!(again.status(), 409);

    app.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn retry_rematches_once_the_sale_exists() {
    let app = TestApp::spawn().await;
    let (_, secret) = app.seed_registration("razorpay", "payment.captured").await;

    // Delivery arrives before the sale is recorded: references don't resolve.
    let response = deliver(
        &app,
        "razorpay",
        "payment.captured",
        &secret,
        &json!({
            "event_id": "evt_early_1",
            "status": "captured",
            "invoice_number": "INV-unknown-yet",
        }),
    )
    .await;
    let ack: Value = response.json().await.unwrap();
    assert_eq!(ack["status"], "pending");
    let event_id = ack["event_id"].as_str().unwrap().to_string();

    // Retry while still unresolved keeps the event pending. The delivery
    // itself was attempt one; the retry is attempt two.
    let retried: Value = app
        .post(&format!("/webhook-events/{}/retry", event_id), &json!({}))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(retried["status"], "pending");
    assert_eq!(retried["attempts"], 2);

    app.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn pending_event_expires_once_its_retry_window_lapses() {
    let app = TestApp::spawn().await;
    let (_, secret) = app.seed_registration("razorpay", "payment.captured").await;

    let response = deliver(
        &app,
        "razorpay",
        "payment.captured",
        &secret,
        &json!({ "event_id": "evt_stale_1", "status": "captured" }),
    )
    .await;
    let ack: Value = response.json().await.unwrap();
    assert_eq!(ack["status"], "pending");
    let event_id = ack["event_id"].as_str().unwrap().to_string();

    // Age the event past its window.
    sqlx::query("UPDATE webhook_events SET next_retry_at = now() - interval '1 hour' WHERE id = $1")
        .bind(uuid::Uuid::parse_str(&event_id).unwrap())
        .execute(app.db.pool())
        .await
        .unwrap();

    let expired: Value = app
        .post(&format!("/webhook-events/{}/retry", event_id), &json!({}))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(expired["status"], "expired");
    assert_eq!(expired["last_error"], "retry window exhausted");

    // Expired is terminal: neither retry nor manual match reopens it.
    let again = app
        .post(&format!("/webhook-events/{}/retry", event_id), &json!({}))
        .await;
    assert_eq!(again.status(), 404);

    let item_id = app.seed_item("Pen", "10.00", "12", "10").await;
    let sale = app.seed_sale(&item_id, "1").await;
    let matched = app
        .post(
            &format!("/webhook-events/{}/match", event_id),
            &json!({ "sale_id": sale["id"] }),
        )
        .await;
    assert_eq!(matched.status(), 409);

    app.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn malformed_payload_with_valid_secret_is_a_validation_error() {
    let app = TestApp::spawn().await;
    let (_, secret) = app.seed_registration("razorpay", "payment.captured").await;

    let response = app
        .client
        .post(app.url("/webhooks/razorpay/payment.captured"))
        .header("x-webhook-secret", &secret)
        .header("content-type", "application/octet-stream")
        .body(vec![0xffu8, 0xfe, 0x00])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    app.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn delivery_path_is_matched_case_insensitively() {
    let app = TestApp::spawn().await;
    let item_id = app.seed_item("Pen", "10.00", "12", "10").await;
    let sale = app.seed_sale(&item_id, "1").await;
    let (_, secret) = app.seed_registration("razorpay", "payment.captured").await;

    let payload = json!({
        "event_id": "evt_case_1",
        "status": "captured",
        "invoice_number": sale["invoice_number"],
    });
    let response = deliver(&app, "Razorpay", "Payment.Captured", &secret, &payload).await;
    assert_eq!(response.status(), 202);

    let ack: Value = response.json().await.unwrap();
    assert_eq!(ack["status"], "matched");

    app.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn signature_header_is_accepted_in_place_of_the_secret_header() {
    let app = TestApp::spawn().await;
    let item_id = app.seed_item("Pen", "10.00", "12", "10").await;
    let sale = app.seed_sale(&item_id, "1").await;
    let (_, secret) = app.seed_registration("razorpay", "payment.captured").await;

    let response = app
        .client
        .post(app.url("/webhooks/razorpay/payment.captured"))
        .header("x-webhook-signature", &secret)
        .json(&json!({
            "event_id": "evt_alt_header_1",
            "status": "captured",
            "invoice_number": sale["invoice_number"],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);

    let ack: Value = response.json().await.unwrap();
    assert_eq!(ack["status"], "matched");

    app.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn rotated_secret_invalidates_the_old_one() {
    let app = TestApp::spawn().await;
    let (registration, old_secret) = app.seed_registration("upi", "collect.completed").await;
    let registration_id = registration["id"].as_str().unwrap();

    let rotated: Value = app
        .post(
            &format!("/webhook-registrations/{}/rotate-secret", registration_id),
            &json!({}),
        )
        .await
        .json()
        .await
        .unwrap();
    let new_secret = rotated["secret"].as_str().unwrap();
    assert_ne!(new_secret, old_secret);

    let stale = deliver(&app, "upi", "collect.completed", &old_secret, &json!({})).await;
    assert_eq!(stale.status(), 403);

    let fresh = deliver(&app, "upi", "collect.completed", new_secret, &json!({})).await;
    assert_eq!(fresh.status(), 202);

    app.cleanup().await;
}
