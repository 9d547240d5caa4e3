//! UPI collect-link provider.
//!
//! Builds `upi://pay` intent links a customer can open in any UPI app. The
//! transaction reference (`tr`) is set to the internal reference so inbound
//! confirmations can be matched back to the sale.

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::config::UpiConfig;
use crate::services::providers::{
    CollectRequest, CollectResponse, PaymentProvider, ProviderError,
};

pub struct UpiProvider {
    config: UpiConfig,
}

impl UpiProvider {
    pub fn new(config: UpiConfig) -> Self {
        Self { config }
    }

    pub fn is_configured(&self) -> bool {
        !self.config.vpa.is_empty()
    }

    /// Assemble the collect link:
    /// `upi://pay?pa=<vpa>&pn=<merchant>&am=<amount>&cu=INR&tn=<note>[&tr=<ref>]`.
    pub fn collect_uri(
        &self,
        amount: Decimal,
        description: Option<&str>,
        reference: Option<&str>,
    ) -> String {
        let note = description.unwrap_or("Payment");
        let mut link = format!(
            "upi://pay?pa={}&pn={}&am={}&cu=INR&tn={}",
            self.config.vpa,
            urlencoding::encode(&self.config.merchant_name),
            amount.round_dp(2),
            urlencoding::encode(note),
        );

        if let Some(reference) = reference {
            link.push_str("&tr=");
            link.push_str(&urlencoding::encode(reference));
        }

        link
    }
}

#[async_trait]
impl PaymentProvider for UpiProvider {
    fn name(&self) -> &'static str {
        "upi"
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled && self.is_configured()
    }

    async fn create_collect(
        &self,
        request: &CollectRequest,
    ) -> Result<CollectResponse, ProviderError> {
        if !self.is_configured() {
            return Err(ProviderError::Unavailable(
                "UPI merchant VPA not configured".to_string(),
            ));
        }

        let uri = self.collect_uri(
            request.amount,
            request.description.as_deref(),
            request.reference.as_deref(),
        );

        Ok(CollectResponse {
            provider_reference: request.reference.clone(),
            collect_uri: Some(uri),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn provider() -> UpiProvider {
        UpiProvider::new(UpiConfig {
            enabled: true,
            vpa: "store@okbank".to_string(),
            merchant_name: "Corner Store".to_string(),
        })
    }

    #[test]
    fn collect_uri_carries_all_fields() {
        let uri = provider().collect_uri(
            Decimal::from_str("236.00").unwrap(),
            Some("Invoice payment"),
            Some("INV-20250107-00001"),
        );

        assert!(uri.starts_with("upi://pay?pa=store@okbank&pn=Corner%20Store&am=236.00&cu=INR"));
        assert!(uri.contains("&tn=Invoice%20payment"));
        assert!(uri.ends_with("&tr=INV-20250107-00001"));
    }

    #[test]
    fn reference_is_optional() {
        let uri = provider().collect_uri(Decimal::from_str("10.5").unwrap(), None, None);

        assert!(uri.contains("&tn=Payment"));
        assert!(!uri.contains("&tr="));
    }

    #[test]
    fn missing_vpa_disables_the_provider() {
        let provider = UpiProvider::new(UpiConfig {
            enabled: true,
            vpa: String::new(),
            merchant_name: "Corner Store".to_string(),
        });

        assert!(!provider.is_enabled());
    }
}
