//! Environment-driven configuration.
//!
//! Every capability gets an explicit, enumerated section; nothing is read
//! from free-form maps at call time. Secrets stay wrapped in
//! [`secrecy::Secret`] and are exposed only where the value is used.

use anyhow::Result;
use dotenvy::dotenv;
use secrecy::Secret;
use serde::Deserialize;
use std::env;

#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub billing: BillingSettings,
    pub providers: ProvidersConfig,
    pub service_name: String,
    pub log_level: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Deserialize, Clone, Debug)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    pub max_connections: u32,
    pub min_connections: u32,
}

/// Seller-side invoicing settings applied to every recorded sale.
#[derive(Deserialize, Clone, Debug)]
pub struct BillingSettings {
    pub invoice_prefix: String,
    pub seller_state_code: String,
    pub seller_gstin: Option<String>,
    pub currency: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct ProvidersConfig {
    pub razorpay: RazorpayConfig,
    pub upi: UpiConfig,
    pub cash: CashConfig,
    pub gst: GstConfig,
}

#[derive(Deserialize, Clone, Debug)]
pub struct RazorpayConfig {
    pub enabled: bool,
    pub key_id: String,
    pub key_secret: Secret<String>,
    pub api_base_url: String,
    pub timeout_seconds: u64,
}

#[derive(Deserialize, Clone, Debug)]
pub struct UpiConfig {
    pub enabled: bool,
    /// Merchant virtual payment address collect links point at.
    pub vpa: String,
    pub merchant_name: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct CashConfig {
    pub enabled: bool,
}

/// Tax-authority (e-invoice) capability. Left unconfigured, filing is
/// reported as unavailable rather than attempted. The literal base URL
/// `sandbox` selects the offline stub used in development and tests.
#[derive(Deserialize, Clone, Debug)]
pub struct GstConfig {
    pub provider: String,
    pub api_base_url: String,
    pub api_key: Secret<String>,
    pub timeout_seconds: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let host = env::var("BILLING_SERVICE_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("BILLING_SERVICE_PORT")
            .unwrap_or_else(|_| "3010".to_string())
            .parse()?;

        let db_url = env::var("BILLING_DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("BILLING_DATABASE_URL must be set"))?;
        let max_connections = env::var("BILLING_DB_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()?;
        let min_connections = env::var("BILLING_DB_MIN_CONNECTIONS")
            .unwrap_or_else(|_| "1".to_string())
            .parse()?;

        let invoice_prefix = env::var("BILLING_INVOICE_PREFIX").unwrap_or_else(|_| "INV".to_string());
        let seller_state_code = env::var("BILLING_SELLER_STATE_CODE").unwrap_or_default();
        let seller_gstin = env::var("BILLING_SELLER_GSTIN").ok().filter(|v| !v.is_empty());
        let currency = env::var("BILLING_CURRENCY").unwrap_or_else(|_| "INR".to_string());

        let razorpay = RazorpayConfig {
            enabled: env_flag("BILLING_RAZORPAY_ENABLED", true),
            key_id: env::var("BILLING_RAZORPAY_KEY_ID").unwrap_or_default(),
            key_secret: Secret::new(env::var("BILLING_RAZORPAY_KEY_SECRET").unwrap_or_default()),
            api_base_url: env::var("BILLING_RAZORPAY_API_BASE_URL")
                .unwrap_or_else(|_| "https://api.razorpay.com/v1".to_string()),
            timeout_seconds: env_u64("BILLING_RAZORPAY_TIMEOUT_SECONDS", 10),
        };

        let upi = UpiConfig {
            enabled: env_flag("BILLING_UPI_ENABLED", true),
            vpa: env::var("BILLING_UPI_VPA").unwrap_or_default(),
            merchant_name: env::var("BILLING_UPI_MERCHANT_NAME")
                .unwrap_or_else(|_| "Store".to_string()),
        };

        let cash = CashConfig {
            enabled: env_flag("BILLING_CASH_ENABLED", true),
        };

        let gst = GstConfig {
            provider: env::var("BILLING_GST_PROVIDER").unwrap_or_else(|_| "gsp".to_string()),
            api_base_url: env::var("BILLING_GST_API_BASE_URL").unwrap_or_default(),
            api_key: Secret::new(env::var("BILLING_GST_API_KEY").unwrap_or_default()),
            timeout_seconds: env_u64("BILLING_GST_TIMEOUT_SECONDS", 15),
        };

        Ok(Self {
            server: ServerConfig { host, port },
            database: DatabaseConfig {
                url: Secret::new(db_url),
                max_connections,
                min_connections,
            },
            billing: BillingSettings {
                invoice_prefix,
                seller_state_code,
                seller_gstin,
                currency,
            },
            providers: ProvidersConfig {
                razorpay,
                upi,
                cash,
                gst,
            },
            service_name: "billing-service".to_string(),
            log_level: env::var("BILLING_LOG_LEVEL")
                .unwrap_or_else(|_| "info,billing_service=debug".to_string()),
        })
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
