//! Payment intent creation and provider capability tests.

mod common;

use common::TestApp;
use serde_json::{json, Value};

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn cash_intent_is_created_with_its_initial_transaction() {
    let app = TestApp::spawn().await;
    let item_id = app.seed_item("Pen", "10.00", "12", "10").await;
    let sale = app.seed_sale(&item_id, "1").await;

    let response = app
        .post(
            "/payments/intents",
            &json!({
                "sale_id": sale["id"],
                "provider": "cash",
                "amount": "11.20",
            }),
        )
        .await;
    assert_eq!(response.status(), 201);

    let intent: Value = response.json().await.unwrap();
    assert_eq!(intent["provider"], "cash");
    assert_eq!(intent["status"], "pending");
    assert_eq!(intent["currency"], "INR");
    // The sale's invoice number becomes the customer reference.
    assert_eq!(intent["customer_reference"], sale["invoice_number"]);

    let transactions = intent["transactions"].as_array().unwrap();
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0]["status"], "created");

    app.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn upi_intent_returns_a_collect_link() {
    let app = TestApp::spawn().await;

    let response = app
        .post(
            "/payments/intents",
            &json!({ "provider": "upi", "amount": "50.00" }),
        )
        .await;
    assert_eq!(response.status(), 201);

    let intent: Value = response.json().await.unwrap();
    let uri = intent["collect_uri"].as_str().unwrap();
    assert!(uri.starts_with("upi://pay?pa=store@okbank"));

    app.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn non_positive_amounts_are_rejected() {
    let app = TestApp::spawn().await;

    for amount in ["0", "-5.00"] {
        let response = app
            .post(
                "/payments/intents",
                &json!({ "provider": "cash", "amount": amount }),
            )
            .await;
        assert_eq!(response.status(), 400, "amount {}", amount);
    }

    app.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn unknown_and_unconfigured_providers_are_unavailable() {
    let app = TestApp::spawn().await;

    let unknown = app
        .post(
            "/payments/intents",
            &json!({ "provider": "stripe", "amount": "10.00" }),
        )
        .await;
    assert_eq!(unknown.status(), 422);

    // Razorpay is enabled in config but has no credentials.
    let unconfigured = app
        .post(
            "/payments/intents",
            &json!({ "provider": "razorpay", "amount": "10.00" }),
        )
        .await;
    assert_eq!(unconfigured.status(), 422);

    app.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn provider_listing_reports_capability_state() {
    let app = TestApp::spawn().await;

    let response = app.get("/payments/providers").await;
    assert_eq!(response.status(), 200);

    let providers: Value = response.json().await.unwrap();
    let by_name: std::collections::HashMap<&str, bool> = providers
        .as_array()
        .unwrap()
        .iter()
        .map(|p| (p["name"].as_str().unwrap(), p["enabled"].as_bool().unwrap()))
        .collect();

    assert_eq!(by_name["cash"], true);
    assert_eq!(by_name["upi"], true);
    assert_eq!(by_name["razorpay"], false);

    app.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn intent_lookup_includes_transaction_history() {
    let app = TestApp::spawn().await;

    let created: Value = app
        .post(
            "/payments/intents",
            &json!({ "provider": "cash", "amount": "25.00" }),
        )
        .await
        .json()
        .await
        .unwrap();

    let response = app
        .get(&format!("/payments/intents/{}", created["id"].as_str().unwrap()))
        .await;
    assert_eq!(response.status(), 200);

    let intent: Value = response.json().await.unwrap();
    assert_eq!(intent["id"], created["id"]);
    assert_eq!(intent["transactions"].as_array().unwrap().len(), 1);

    let missing = app
        .get(&format!("/payments/intents/{}", uuid::Uuid::new_v4()))
        .await;
    assert_eq!(missing.status(), 404);

    app.cleanup().await;
}
