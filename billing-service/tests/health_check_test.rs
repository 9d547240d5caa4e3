//! Health and metrics endpoint tests.

mod common;

use common::TestApp;

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn health_check_works() {
    let app = TestApp::spawn().await;

    let response = app.get("/health").await;
    assert_eq!(response.status(), 200);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "billing-service");

    app.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn metrics_endpoint_exposes_prometheus_text() {
    let app = TestApp::spawn().await;

    // Generate at least one request so counters exist.
    app.get("/health").await;

    let response = app.get("/metrics").await;
    assert_eq!(response.status(), 200);

    let body = response.text().await.unwrap();
    assert!(body.contains("billing_http_requests_total"));

    app.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn mutating_endpoints_require_an_actor() {
    let app = TestApp::spawn().await;

    let response = app
        .client
        .post(app.url("/items"))
        .json(&serde_json::json!({ "name": "Pen", "unit_price": "10.00" }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 401);

    app.cleanup().await;
}
