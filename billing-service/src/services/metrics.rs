//! Metrics module for billing-service.
//! Provides Prometheus metrics for sale recording, webhook reconciliation
//! and payment/GST activity.

use axum::{extract::Request, middleware::Next, response::Response};
use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec,
    IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;
use std::time::Instant;

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "billing_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// HTTP request counter
pub static HTTP_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// HTTP request duration histogram
pub static HTTP_REQUEST_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Recorded sales counter
pub static SALES_RECORDED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Inbound webhook deliveries by terminal ingest status
pub static WEBHOOK_EVENTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Provider payment events by normalized status
pub static PAYMENT_EVENTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Payment events contradicting a terminal intent state
pub static PAYMENT_ANOMALIES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// E-invoice submission attempts by outcome
pub static GST_SUBMISSIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Error counter for alerting
pub static ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    HTTP_REQUESTS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("billing_http_requests_total", "Total HTTP requests"),
            &["method", "path", "status"]
        )
        .expect("Failed to register HTTP_REQUESTS_TOTAL")
    });

    HTTP_REQUEST_DURATION.get_or_init(|| {
        register_histogram_vec!(
            histogram_opts!(
                "billing_http_request_duration_seconds",
                "HTTP request duration",
                vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
            ),
            &["method", "path"]
        )
        .expect("Failed to register HTTP_REQUEST_DURATION")
    });

    SALES_RECORDED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_sales_recorded_total",
                "Total sales recorded by payment method"
            ),
            &["payment_method"]
        )
        .expect("Failed to register SALES_RECORDED_TOTAL")
    });

    WEBHOOK_EVENTS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_webhook_events_total",
                "Total webhook deliveries by provider and outcome"
            ),
            &["provider", "status"]
        )
        .expect("Failed to register WEBHOOK_EVENTS_TOTAL")
    });

    PAYMENT_EVENTS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_payment_events_total",
                "Total provider payment events by normalized status"
            ),
            &["provider", "status"]
        )
        .expect("Failed to register PAYMENT_EVENTS_TOTAL")
    });

    PAYMENT_ANOMALIES_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_payment_anomalies_total",
                "Payment events contradicting a terminal intent state"
            ),
            &["provider"]
        )
        .expect("Failed to register PAYMENT_ANOMALIES_TOTAL")
    });

    GST_SUBMISSIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_gst_submissions_total",
                "E-invoice submission attempts by outcome"
            ),
            &["status"]
        )
        .expect("Failed to register GST_SUBMISSIONS_TOTAL")
    });

    ERRORS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("billing_errors_total", "Total errors by type for alerting"),
            &["error_type", "operation"]
        )
        .expect("Failed to register ERRORS_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*DB_QUERY_DURATION;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .expect("Failed to encode metrics");
    String::from_utf8(buffer).expect("Failed to convert metrics to string")
}

/// Record request count and latency for every HTTP request.
pub async fn http_metrics_middleware(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().to_string();
    let path = req.uri().path().to_string();

    let response = next.run(req).await;

    let status = response.status().as_u16().to_string();
    if let Some(counter) = HTTP_REQUESTS_TOTAL.get() {
        counter.with_label_values(&[&method, &path, &status]).inc();
    }
    if let Some(histogram) = HTTP_REQUEST_DURATION.get() {
        histogram
            .with_label_values(&[&method, &path])
            .observe(start.elapsed().as_secs_f64());
    }

    response
}

/// Record a completed sale.
pub fn record_sale_recorded(payment_method: &str) {
    if let Some(counter) = SALES_RECORDED_TOTAL.get() {
        counter.with_label_values(&[payment_method]).inc();
    }
}

/// Record a webhook delivery outcome.
pub fn record_webhook_event(provider: &str, status: &str) {
    if let Some(counter) = WEBHOOK_EVENTS_TOTAL.get() {
        counter.with_label_values(&[provider, status]).inc();
    }
}

/// Record a provider payment event.
pub fn record_payment_event(provider: &str, status: &str) {
    if let Some(counter) = PAYMENT_EVENTS_TOTAL.get() {
        counter.with_label_values(&[provider, status]).inc();
    }
}

/// Record an out-of-order terminal transition kept for manual review.
pub fn record_payment_anomaly(provider: &str) {
    if let Some(counter) = PAYMENT_ANOMALIES_TOTAL.get() {
        counter.with_label_values(&[provider]).inc();
    }
}

/// Record an e-invoice submission outcome.
pub fn record_gst_submission(status: &str) {
    if let Some(counter) = GST_SUBMISSIONS_TOTAL.get() {
        counter.with_label_values(&[status]).inc();
    }
}

/// Record an error for alerting.
pub fn record_error(error_type: &str, operation: &str) {
    if let Some(counter) = ERRORS_TOTAL.get() {
        counter.with_label_values(&[error_type, operation]).inc();
    }
}
