//! Application assembly: state, router and server lifecycle.

use axum::middleware::from_fn;
use axum::{
    routing::{delete, get, post},
    Router,
};
use secrecy::ExposeSecret;
use service_core::middleware::tracing::request_id_middleware;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::handlers;
use crate::services::razorpay::RazorpayClient;
use crate::services::{
    http_metrics_middleware, Database, GstService, PaymentService, ProviderRegistry,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub db: Arc<Database>,
    pub providers: Arc<ProviderRegistry>,
    pub payments: Arc<PaymentService>,
    pub gst: Arc<GstService>,
    pub razorpay: RazorpayClient,
}

pub struct Application {
    port: u16,
    listener: tokio::net::TcpListener,
    router: Router,
}

impl Application {
    /// Connect, migrate and assemble the router. The listener is bound here
    /// so callers (tests included) can read the effective port before the
    /// server runs.
    pub async fn build(config: Config) -> anyhow::Result<Self> {
        let db = Database::new(
            config.database.url.expose_secret(),
            config.database.max_connections,
            config.database.min_connections,
        )
        .await?;
        db.run_migrations().await?;

        Self::build_with_database(config, db).await
    }

    pub async fn build_with_database(config: Config, db: Database) -> anyhow::Result<Self> {
        let db = Arc::new(db);
        let providers = Arc::new(ProviderRegistry::from_config(&config.providers));
        let payments = Arc::new(PaymentService::new(db.clone(), providers.clone()));
        let gst = Arc::new(GstService::new(db.clone(), config.providers.gst.clone()));
        let razorpay = RazorpayClient::new(config.providers.razorpay.clone());

        if razorpay.is_configured() {
            tracing::info!("Razorpay client initialized");
        } else {
            tracing::warn!("Razorpay credentials not configured - card collections unavailable");
        }
        if gst.is_configured() {
            tracing::info!("Tax authority client initialized");
        } else {
            tracing::warn!("Tax authority endpoint not configured - e-invoice filing unavailable");
        }

        let state = AppState {
            config: config.clone(),
            db,
            providers,
            payments,
            gst,
            razorpay,
        };

        let router = Router::new()
            .route("/health", get(handlers::health_check))
            .route("/metrics", get(handlers::metrics))
            // Catalogue
            .route(
                "/items",
                post(handlers::items::create_item).get(handlers::items::list_items),
            )
            // Sales
            .route(
                "/sales",
                post(handlers::sales::create_sale).get(handlers::sales::list_sales),
            )
            .route("/sales/:id", get(handlers::sales::get_sale))
            .route("/sales/:id/mark-paid", post(handlers::sales::mark_paid))
            // GST filing
            .route("/sales/:id/gst", get(handlers::compliance::status))
            .route("/sales/:id/gst/submit", post(handlers::compliance::submit))
            .route("/sales/:id/gst/retry", post(handlers::compliance::retry))
            .route(
                "/sales/:id/gst/submissions",
                get(handlers::compliance::submissions),
            )
            // Period locks
            .route(
                "/period-locks",
                post(handlers::sales::lock_period).get(handlers::sales::list_period_locks),
            )
            .route("/period-locks/:date", delete(handlers::sales::unlock_period))
            // Payments
            .route(
                "/payments/intents",
                post(handlers::payments::create_intent).get(handlers::payments::list_intents),
            )
            .route("/payments/intents/:id", get(handlers::payments::get_intent))
            .route("/payments/providers", get(handlers::payments::list_providers))
            .route(
                "/payments/razorpay/verify",
                post(handlers::payments::verify_razorpay_payment),
            )
            // Webhook ingestion and reconciliation
            .route("/webhooks/:provider/:event", post(handlers::webhooks::receive))
            .route("/webhook-events", get(handlers::webhooks::list_events))
            .route("/webhook-events/:id", get(handlers::webhooks::get_event))
            .route(
                "/webhook-events/:id/retry",
                post(handlers::webhooks::retry_event),
            )
            .route(
                "/webhook-events/:id/match",
                post(handlers::webhooks::match_event),
            )
            // Webhook registrations
            .route(
                "/webhook-registrations",
                post(handlers::registrations::create_registration)
                    .get(handlers::registrations::list_registrations),
            )
            .route(
                "/webhook-registrations/:id",
                get(handlers::registrations::get_registration)
                    .patch(handlers::registrations::update_registration),
            )
            .route(
                "/webhook-registrations/:id/rotate-secret",
                post(handlers::registrations::rotate_secret),
            )
            .route(
                "/webhook-registrations/:id/toggle",
                post(handlers::registrations::toggle_registration),
            )
            .layer(from_fn(http_metrics_middleware))
            .layer(from_fn(request_id_middleware))
            .layer(
                TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                    let request_id = request
                        .headers()
                        .get("x-request-id")
                        .and_then(|value| value.to_str().ok())
                        .unwrap_or("-");

                    tracing::info_span!(
                        "http_request",
                        request_id = %request_id,
                        method = %request.method(),
                        uri = %request.uri(),
                        version = ?request.version(),
                    )
                }),
            )
            .with_state(state);

        let addr = format!("{}:{}", config.server.host, config.server.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();

        Ok(Self {
            port,
            listener,
            router,
        })
    }

    pub async fn run_until_stopped(self) -> anyhow::Result<()> {
        tracing::info!("Listening on {}", self.listener.local_addr()?);
        axum::serve(self.listener, self.router).await?;
        Ok(())
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}
