//! Razorpay payment provider client.
//!
//! Implements the Orders API for opening collections and HMAC-SHA256
//! verification for both checkout confirmations and webhook bodies.

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use service_core::utils::signature::verify_hmac_sha256;
use std::time::Duration;

use crate::config::RazorpayConfig;
use crate::services::providers::{
    CollectRequest, CollectResponse, PaymentProvider, ProviderError,
};

#[derive(Clone)]
pub struct RazorpayClient {
    client: Client,
    config: RazorpayConfig,
}

#[derive(Debug, Serialize)]
struct CreateOrderRequest {
    /// Amount in the smallest currency unit (paise for INR).
    amount: u64,
    currency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    receipt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    notes: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct RazorpayOrder {
    pub id: String,
    pub amount: u64,
    pub currency: String,
    pub receipt: Option<String>,
    pub status: String,
}

#[derive(Debug, Deserialize)]
struct RazorpayError {
    error: RazorpayErrorDetail,
}

#[derive(Debug, Deserialize)]
struct RazorpayErrorDetail {
    code: String,
    description: String,
}

/// Checkout confirmation parameters signed by Razorpay.
#[derive(Debug)]
pub struct PaymentVerification {
    pub razorpay_order_id: String,
    pub razorpay_payment_id: String,
    pub razorpay_signature: String,
}

impl RazorpayClient {
    pub fn new(config: RazorpayConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .unwrap_or_default();

        Self { client, config }
    }

    /// Whether credentials are present.
    pub fn is_configured(&self) -> bool {
        !self.config.key_id.is_empty() && !self.config.key_secret.expose_secret().is_empty()
    }

    /// Create an order. `amount` is in currency units and is converted to
    /// the smallest unit for the wire.
    pub async fn create_order(
        &self,
        amount: Decimal,
        currency: &str,
        receipt: Option<String>,
    ) -> Result<RazorpayOrder, ProviderError> {
        if !self.is_configured() {
            return Err(ProviderError::Unavailable(
                "razorpay credentials not configured".to_string(),
            ));
        }

        let minor_units = (amount * Decimal::ONE_HUNDRED)
            .round()
            .to_u64()
            .ok_or_else(|| {
                ProviderError::Fatal(format!("amount {} cannot be expressed in minor units", amount))
            })?;

        let request = CreateOrderRequest {
            amount: minor_units,
            currency: currency.to_string(),
            receipt,
            notes: None,
        };

        let url = format!("{}/orders", self.config.api_base_url);
        let response = self
            .client
            .post(&url)
            .basic_auth(
                &self.config.key_id,
                Some(self.config.key_secret.expose_secret()),
            )
            .json(&request)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        let body = response.text().await.map_err(classify_transport_error)?;

        tracing::debug!(status = %status, "Razorpay create_order response");

        if status.is_success() {
            let order: RazorpayOrder = serde_json::from_str(&body).map_err(|e| {
                ProviderError::Fatal(format!("unparseable Razorpay order response: {}", e))
            })?;
            tracing::info!(
                order_id = %order.id,
                amount = order.amount,
                currency = %order.currency,
                "Razorpay order created"
            );
            Ok(order)
        } else {
            let error: RazorpayError = serde_json::from_str(&body).unwrap_or(RazorpayError {
                error: RazorpayErrorDetail {
                    code: "UNKNOWN".to_string(),
                    description: body.clone(),
                },
            });
            tracing::error!(
                code = %error.error.code,
                description = %error.error.description,
                "Razorpay order creation failed"
            );
            if status.is_server_error() {
                Err(ProviderError::Transient(anyhow::anyhow!(
                    "Razorpay {}: {}",
                    error.error.code,
                    error.error.description
                )))
            } else {
                Err(ProviderError::Fatal(format!(
                    "Razorpay {}: {}",
                    error.error.code, error.error.description
                )))
            }
        }
    }

    /// Verify the checkout signature: `HMAC-SHA256("{order_id}|{payment_id}",
    /// key_secret)`, compared in constant time.
    pub fn verify_payment_signature(
        &self,
        verification: &PaymentVerification,
    ) -> Result<bool, ProviderError> {
        let payload = format!(
            "{}|{}",
            verification.razorpay_order_id, verification.razorpay_payment_id
        );

        let is_valid = verify_hmac_sha256(
            self.config.key_secret.expose_secret(),
            &payload,
            &verification.razorpay_signature,
        )
        .map_err(|e| ProviderError::Fatal(format!("signature computation failed: {}", e)))?;

        if !is_valid {
            tracing::warn!(
                order_id = %verification.razorpay_order_id,
                payment_id = %verification.razorpay_payment_id,
                "Razorpay checkout signature verification failed"
            );
        }

        Ok(is_valid)
    }
}

fn classify_transport_error(err: reqwest::Error) -> ProviderError {
    // A timeout or connection failure says nothing definitive about the
    // payment, so it must stay retryable.
    if err.is_timeout() || err.is_connect() {
        ProviderError::Transient(anyhow::Error::new(err))
    } else {
        ProviderError::Fatal(err.to_string())
    }
}

#[async_trait]
impl PaymentProvider for RazorpayClient {
    fn name(&self) -> &'static str {
        "razorpay"
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled && self.is_configured()
    }

    async fn create_collect(
        &self,
        request: &CollectRequest,
    ) -> Result<CollectResponse, ProviderError> {
        let order = self
            .create_order(request.amount, &request.currency, request.reference.clone())
            .await?;

        Ok(CollectResponse {
            provider_reference: Some(order.id),
            collect_uri: None,
        })
    }

    fn verify_event(&self, body: &str, signature: &str) -> Result<bool, ProviderError> {
        verify_hmac_sha256(self.config.key_secret.expose_secret(), body, signature)
            .map_err(|e| ProviderError::Fatal(format!("signature computation failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::Secret;
    use service_core::utils::signature::hmac_sha256_hex;

    fn test_config() -> RazorpayConfig {
        RazorpayConfig {
            enabled: true,
            key_id: "rzp_test_123".to_string(),
            key_secret: Secret::new("my_secret_key".to_string()),
            api_base_url: "https://api.razorpay.com/v1".to_string(),
            timeout_seconds: 10,
        }
    }

    #[test]
    fn is_configured_requires_both_credentials() {
        assert!(RazorpayClient::new(test_config()).is_configured());

        let mut config = test_config();
        config.key_secret = Secret::new(String::new());
        assert!(!RazorpayClient::new(config).is_configured());

        let mut config = test_config();
        config.key_id = String::new();
        assert!(!RazorpayClient::new(config).is_configured());
    }

    #[test]
    fn disabled_flag_overrides_configuration() {
        let mut config = test_config();
        config.enabled = false;
        assert!(!RazorpayClient::new(config).is_enabled());
    }

    #[test]
    fn checkout_signature_round_trips() {
        let client = RazorpayClient::new(test_config());

        let expected = hmac_sha256_hex("my_secret_key", "order_123|pay_456").unwrap();
        let verification = PaymentVerification {
            razorpay_order_id: "order_123".to_string(),
            razorpay_payment_id: "pay_456".to_string(),
            razorpay_signature: expected,
        };

        assert!(client.verify_payment_signature(&verification).unwrap());
    }

    #[test]
    fn tampered_checkout_signature_fails() {
        let client = RazorpayClient::new(test_config());

        let verification = PaymentVerification {
            razorpay_order_id: "order_123".to_string(),
            razorpay_payment_id: "pay_456".to_string(),
            razorpay_signature: "deadbeef".to_string(),
        };

        assert!(!client.verify_payment_signature(&verification).unwrap());
    }

    #[test]
    fn event_signature_uses_raw_body() {
        let client = RazorpayClient::new(test_config());
        let body = r#"{"event":"payment.captured"}"#;

        let signature = hmac_sha256_hex("my_secret_key", body).unwrap();
        assert!(client.verify_event(body, &signature).unwrap());
        assert!(!client.verify_event(r#"{"event":"payment.failed"}"#, &signature).unwrap());
    }
}
