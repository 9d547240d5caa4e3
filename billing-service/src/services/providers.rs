//! Payment-provider capability interface and registry.
//!
//! Every provider is an explicit implementation of [`PaymentProvider`],
//! registered once at startup under its name. Callers resolve providers
//! through the registry and get a typed error that distinguishes a
//! capability that is switched off from one that is broken.

use async_trait::async_trait;
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::ProvidersConfig;
use crate::services::razorpay::RazorpayClient;
use crate::services::upi::UpiProvider;

/// Capability outcome a caller can act on: off, transiently broken, or
/// definitively failed. Timeouts are always `Transient`.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("transient provider failure: {0}")]
    Transient(#[source] anyhow::Error),

    #[error("provider error: {0}")]
    Fatal(String),
}

impl From<ProviderError> for AppError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Unavailable(msg) => AppError::ProviderUnavailable(msg),
            ProviderError::Transient(source) => AppError::TransientError(source),
            ProviderError::Fatal(msg) => AppError::BadRequest(anyhow::anyhow!(msg)),
        }
    }
}

/// A collection request handed to a provider when an intent is opened.
#[derive(Debug, Clone)]
pub struct CollectRequest {
    pub amount: Decimal,
    pub currency: String,
    /// Internal reference the provider should echo back, usually the
    /// invoice number.
    pub reference: Option<String>,
    pub description: Option<String>,
}

/// Provider-side artifacts of an opened collection.
#[derive(Debug, Clone, Default)]
pub struct CollectResponse {
    /// Provider-assigned order/collection id, stored on the transaction.
    pub provider_reference: Option<String>,
    /// Deep link the customer can pay through (UPI collect links).
    pub collect_uri: Option<String>,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the provider is switched on and fully configured.
    fn is_enabled(&self) -> bool;

    /// Open a collection with the provider. Implementations must apply a
    /// bounded timeout to any outbound call.
    async fn create_collect(&self, request: &CollectRequest)
        -> Result<CollectResponse, ProviderError>;

    /// Verify the authenticity of a provider-signed event body. Providers
    /// that never deliver signed events report the capability unavailable.
    fn verify_event(&self, _body: &str, _signature: &str) -> Result<bool, ProviderError> {
        Err(ProviderError::Unavailable(format!(
            "{} does not sign events",
            self.name()
        )))
    }
}

/// Over-the-counter settlement. No external calls, no events.
pub struct CashProvider {
    enabled: bool,
}

impl CashProvider {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

#[async_trait]
impl PaymentProvider for CashProvider {
    fn name(&self) -> &'static str {
        "cash"
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn create_collect(
        &self,
        _request: &CollectRequest,
    ) -> Result<CollectResponse, ProviderError> {
        Ok(CollectResponse::default())
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ProviderInfo {
    pub name: String,
    pub enabled: bool,
}

/// Name-keyed provider registry, resolved once from configuration.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn PaymentProvider>>,
}

impl ProviderRegistry {
    pub fn from_config(config: &ProvidersConfig) -> Self {
        let mut providers: HashMap<String, Arc<dyn PaymentProvider>> = HashMap::new();

        let razorpay = Arc::new(RazorpayClient::new(config.razorpay.clone()));
        let upi = Arc::new(UpiProvider::new(config.upi.clone()));
        let cash = Arc::new(CashProvider::new(config.cash.enabled));

        providers.insert(razorpay.name().to_string(), razorpay);
        providers.insert(upi.name().to_string(), upi);
        providers.insert(cash.name().to_string(), cash);

        Self { providers }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn PaymentProvider>> {
        self.providers.get(&name.trim().to_lowercase()).cloned()
    }

    /// Resolve a provider that must be usable right now: unknown names and
    /// disabled capabilities both surface as [`ProviderError::Unavailable`].
    pub fn resolve_enabled(&self, name: &str) -> Result<Arc<dyn PaymentProvider>, ProviderError> {
        let provider = self
            .get(name)
            .ok_or_else(|| ProviderError::Unavailable(format!("unknown provider '{}'", name)))?;

        if !provider.is_enabled() {
            return Err(ProviderError::Unavailable(format!(
                "provider '{}' is disabled or not configured",
                provider.name()
            )));
        }

        Ok(provider)
    }

    pub fn list(&self) -> Vec<ProviderInfo> {
        let mut infos: Vec<ProviderInfo> = self
            .providers
            .values()
            .map(|p| ProviderInfo {
                name: p.name().to_string(),
                enabled: p.is_enabled(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CashConfig, GstConfig, RazorpayConfig, UpiConfig};
    use secrecy::Secret;

    fn test_config() -> ProvidersConfig {
        ProvidersConfig {
            razorpay: RazorpayConfig {
                enabled: true,
                key_id: String::new(),
                key_secret: Secret::new(String::new()),
                api_base_url: "https://api.razorpay.com/v1".to_string(),
                timeout_seconds: 10,
            },
            upi: UpiConfig {
                enabled: true,
                vpa: "store@upi".to_string(),
                merchant_name: "Test Store".to_string(),
            },
            cash: CashConfig { enabled: true },
            gst: GstConfig {
                provider: "gsp".to_string(),
                api_base_url: String::new(),
                api_key: Secret::new(String::new()),
                timeout_seconds: 15,
            },
        }
    }

    #[test]
    fn registry_resolves_by_name_case_insensitively() {
        let registry = ProviderRegistry::from_config(&test_config());

        assert!(registry.get("cash").is_some());
        assert!(registry.get(" Cash ").is_some());
        assert!(registry.get("stripe").is_none());
    }

    #[test]
    fn unknown_provider_is_unavailable() {
        let registry = ProviderRegistry::from_config(&test_config());

        assert!(matches!(
            registry.resolve_enabled("stripe"),
            Err(ProviderError::Unavailable(_))
        ));
    }

    #[test]
    fn unconfigured_razorpay_is_unavailable_even_when_enabled() {
        // Enabled flag is on but credentials are empty.
        let registry = ProviderRegistry::from_config(&test_config());

        assert!(matches!(
            registry.resolve_enabled("razorpay"),
            Err(ProviderError::Unavailable(_))
        ));
    }

    #[test]
    fn list_reports_every_registered_provider() {
        let registry = ProviderRegistry::from_config(&test_config());
        let infos = registry.list();

        let names: Vec<&str> = infos.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["cash", "razorpay", "upi"]);
    }
}
