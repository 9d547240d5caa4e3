//! Services module for billing-service.

pub mod database;
pub mod gst;
pub mod metrics;
pub mod numbering;
pub mod payments;
pub mod providers;
pub mod razorpay;
pub mod reconcile;
pub mod tax;
pub mod upi;

pub use database::Database;
pub use gst::GstService;
pub use metrics::{get_metrics, http_metrics_middleware, init_metrics};
pub use payments::PaymentService;
pub use providers::ProviderRegistry;
