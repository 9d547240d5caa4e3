//! service-core: Shared infrastructure for the billing platform services.
pub mod error;
pub mod middleware;
pub mod utils;

pub use axum;
pub use serde;
pub use serde_json;
pub use tracing;
