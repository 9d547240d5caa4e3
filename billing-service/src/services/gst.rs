//! GST e-invoice filing.
//!
//! Every filing attempt is its own `einvoice_submissions` row; retries open
//! fresh rows and never mutate earlier attempts. The outbound call happens
//! between two transactions so no database lock is held across the network:
//! the first records the attempt and queues the sale, the second applies the
//! authority's verdict.

use chrono::Utc;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::Serialize;
use serde_json::{json, Value};
use service_core::error::AppError;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::GstConfig;
use crate::models::{
    AuditRecord, EInvoiceSubmission, GstStatus, Sale, SaleLine, SubmissionStatus,
};
use crate::services::database::Database;
use crate::services::metrics;
use crate::services::providers::ProviderError;

/// Base URL literal that selects the offline stub.
const SANDBOX_BASE_URL: &str = "sandbox";

/// The authority's verdict on one filing attempt.
#[derive(Debug, Clone)]
pub struct FilingOutcome {
    pub status: SubmissionStatus,
    pub irn: Option<String>,
    pub ack_no: Option<String>,
    pub eway_bill_no: Option<String>,
    pub response: Value,
}

/// HTTP client for the tax-authority (GSP) endpoint.
#[derive(Clone)]
pub struct TaxAuthorityClient {
    client: Client,
    config: GstConfig,
}

impl TaxAuthorityClient {
    pub fn new(config: GstConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .unwrap_or_default();

        Self { client, config }
    }

    pub fn is_sandbox(&self) -> bool {
        self.config.api_base_url == SANDBOX_BASE_URL
    }

    /// Whether filing can be attempted at all. The sandbox stub needs no
    /// credentials.
    pub fn is_configured(&self) -> bool {
        if self.is_sandbox() {
            return true;
        }
        !self.config.api_base_url.is_empty() && !self.config.api_key.expose_secret().is_empty()
    }

    /// File one invoice payload with the authority.
    pub async fn submit(&self, payload: &Value) -> Result<FilingOutcome, ProviderError> {
        if !self.is_configured() {
            return Err(ProviderError::Unavailable(
                "tax authority endpoint not configured".to_string(),
            ));
        }

        if self.is_sandbox() {
            return Ok(self.sandbox_acknowledge(payload));
        }

        let url = format!("{}/einvoice", self.config.api_base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(self.config.api_key.expose_secret())
            .json(payload)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Fatal(format!("unparseable authority response: {}", e)))?;

        if status.is_server_error() {
            return Err(ProviderError::Transient(anyhow::anyhow!(
                "authority returned {}: {}",
                status,
                body
            )));
        }

        let verdict = body
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_uppercase();

        let outcome = if status.is_success() && verdict != "REJ" {
            FilingOutcome {
                status: SubmissionStatus::Acknowledged,
                irn: body.get("irn").and_then(Value::as_str).map(str::to_string),
                ack_no: body
                    .get("ack_no")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                eway_bill_no: body
                    .get("eway_bill_no")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                response: body,
            }
        } else {
            FilingOutcome {
                status: SubmissionStatus::Rejected,
                irn: None,
                ack_no: None,
                eway_bill_no: None,
                response: body,
            }
        };

        Ok(outcome)
    }

    /// Query the live status of a previously acknowledged invoice.
    pub async fn lookup(&self, irn: &str) -> Result<Value, ProviderError> {
        if self.is_sandbox() {
            return Ok(json!({ "irn": irn, "status": "ACK", "source": "sandbox" }));
        }
        if !self.is_configured() {
            return Err(ProviderError::Unavailable(
                "tax authority endpoint not configured".to_string(),
            ));
        }

        let url = format!("{}/einvoice/{}", self.config.api_base_url, irn);
        let response = self
            .client
            .get(&url)
            .bearer_auth(self.config.api_key.expose_secret())
            .send()
            .await
            .map_err(classify_transport_error)?;

        if response.status().is_server_error() {
            return Err(ProviderError::Transient(anyhow::anyhow!(
                "authority returned {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| ProviderError::Fatal(format!("unparseable authority response: {}", e)))
    }

    /// Deterministic acknowledgement used in development and tests.
    fn sandbox_acknowledge(&self, payload: &Value) -> FilingOutcome {
        let irn = format!("IRN-{}", Uuid::new_v4().simple());
        let ack_no = format!("{}", Utc::now().timestamp_millis());
        let response = json!({
            "status": "ACK",
            "irn": irn,
            "ack_no": ack_no,
            "ack_date": Utc::now().to_rfc3339(),
            "invoice_number": payload.get("invoice_number").cloned().unwrap_or(Value::Null),
            "source": "sandbox",
        });

        FilingOutcome {
            status: SubmissionStatus::Acknowledged,
            irn: Some(irn),
            ack_no: Some(ack_no),
            eway_bill_no: None,
            response,
        }
    }
}

fn classify_transport_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() || err.is_connect() {
        ProviderError::Transient(anyhow::Error::new(err))
    } else {
        ProviderError::Fatal(err.to_string())
    }
}

/// Serializable filing payload assembled from a sale.
#[derive(Debug, Serialize)]
struct FilingLine<'a> {
    line_no: i32,
    description: &'a str,
    quantity: rust_decimal::Decimal,
    rate: rust_decimal::Decimal,
    tax_rate: rust_decimal::Decimal,
    base_amount: rust_decimal::Decimal,
    cgst: rust_decimal::Decimal,
    sgst: rust_decimal::Decimal,
    igst: rust_decimal::Decimal,
}

/// Assemble the authority payload from a persisted sale.
pub fn build_filing_payload(sale: &Sale, lines: &[SaleLine]) -> Value {
    let filing_lines: Vec<FilingLine> = lines
        .iter()
        .map(|line| FilingLine {
            line_no: line.line_no,
            description: &line.description,
            quantity: line.quantity,
            rate: line.rate,
            tax_rate: line.tax_rate,
            base_amount: line.base_amount,
            cgst: line.cgst,
            sgst: line.sgst,
            igst: line.igst,
        })
        .collect();

    json!({
        "invoice_number": sale.invoice_number,
        "invoice_date": sale.sold_on,
        "seller_gstin": sale.seller_gstin,
        "buyer_gstin": sale.buyer_gstin,
        "seller_state_code": sale.seller_state_code,
        "buyer_state_code": sale.buyer_state_code,
        "subtotal": sale.subtotal,
        "discount": sale.discount,
        "cgst": sale.cgst,
        "sgst": sale.sgst,
        "igst": sale.igst,
        "tax_total": sale.tax_total,
        "round_off": sale.round_off,
        "grand_total": sale.grand_total,
        "lines": filing_lines,
    })
}

/// Consolidated filing view returned by the status endpoint.
#[derive(Debug, Serialize)]
pub struct FilingStatus {
    pub sale_id: Uuid,
    pub gst_status: String,
    pub irn: Option<String>,
    pub ack_no: Option<String>,
    pub eway_bill_no: Option<String>,
    pub latest_submission: Option<EInvoiceSubmission>,
    /// Live authority view, present when an IRN exists and the authority
    /// answered; absent on transient failure (the cached view stands).
    pub live: Option<Value>,
}

pub struct GstService {
    db: Arc<Database>,
    client: TaxAuthorityClient,
    provider_name: String,
}

impl GstService {
    pub fn new(db: Arc<Database>, config: GstConfig) -> Self {
        let provider_name = config.provider.clone();
        Self {
            db,
            client: TaxAuthorityClient::new(config),
            provider_name,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.client.is_configured()
    }

    /// File a sale with the tax authority.
    ///
    /// Refuses a sale that is already acknowledged; `retry` skips that
    /// guard and files again regardless.
    #[instrument(skip(self), fields(sale_id = %sale_id, actor = %actor))]
    pub async fn submit(&self, actor: &str, sale_id: Uuid) -> Result<EInvoiceSubmission, AppError> {
        let sale = self
            .db
            .get_sale(sale_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Sale {} not found", sale_id)))?;

        if sale.gst_status == GstStatus::Acknowledged.as_str() {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "sale {} is already acknowledged under IRN {}",
                sale_id,
                sale.irn.as_deref().unwrap_or("?")
            )));
        }

        self.file(actor, &sale).await
    }

    /// One filing attempt: open a pending submission row and queue the sale
    /// first, then call out, then apply the verdict. A transport failure
    /// leaves the attempt pending with the error recorded; the caller
    /// retries later.
    async fn file(&self, actor: &str, sale: &Sale) -> Result<EInvoiceSubmission, AppError> {
        let sale_id = sale.id;

        if !self.client.is_configured() {
            return Err(AppError::ProviderUnavailable(
                "tax authority endpoint not configured".to_string(),
            ));
        }

        let lines = self.db.get_sale_lines(sale_id).await?;
        let payload = build_filing_payload(sale, &lines);

        // First transaction: durable record of the attempt before any
        // network traffic.
        let mut tx = self.db.pool().begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let submission =
            Database::insert_submission_on_conn(&mut tx, sale_id, &self.provider_name, &payload)
                .await?;
        Database::update_sale_filing_on_conn(
            &mut tx,
            sale_id,
            GstStatus::Queued.as_str(),
            None,
            None,
            None,
        )
        .await?;
        Database::append_audit_on_conn(
            &mut tx,
            &AuditRecord::new(actor, "gst_submission_opened")
                .resource("einvoice_submission", submission.id)
                .after(json!({ "sale_id": sale_id, "provider": self.provider_name })),
        )
        .await?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit submission open: {}", e))
        })?;

        match self.client.submit(&payload).await {
            Ok(outcome) => self.apply_outcome(actor, sale_id, submission.id, outcome).await,
            Err(ProviderError::Transient(source)) => {
                warn!(
                    submission_id = %submission.id,
                    error = %source,
                    "Authority unreachable, attempt stays pending"
                );
                self.record_transport_failure(submission.id, &source.to_string())
                    .await
            }
            Err(err) => {
                error!(submission_id = %submission.id, error = %err, "Filing failed");
                let outcome = FilingOutcome {
                    status: SubmissionStatus::Rejected,
                    irn: None,
                    ack_no: None,
                    eway_bill_no: None,
                    response: json!({ "error": err.to_string() }),
                };
                self.apply_outcome(actor, sale_id, submission.id, outcome).await
            }
        }
    }

    async fn apply_outcome(
        &self,
        actor: &str,
        sale_id: Uuid,
        submission_id: Uuid,
        outcome: FilingOutcome,
    ) -> Result<EInvoiceSubmission, AppError> {
        let mut tx = self.db.pool().begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let error = match outcome.status {
            SubmissionStatus::Rejected => Some(
                outcome
                    .response
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("rejected by authority")
                    .to_string(),
            ),
            _ => None,
        };

        let submission = Database::update_submission_on_conn(
            &mut tx,
            submission_id,
            outcome.status,
            Some(&outcome.response),
            error.as_deref(),
        )
        .await?;

        let gst_status = match outcome.status {
            SubmissionStatus::Acknowledged => GstStatus::Acknowledged,
            SubmissionStatus::Rejected => GstStatus::Rejected,
            _ => GstStatus::Queued,
        };
        Database::update_sale_filing_on_conn(
            &mut tx,
            sale_id,
            gst_status.as_str(),
            outcome.irn.as_deref(),
            outcome.ack_no.as_deref(),
            outcome.eway_bill_no.as_deref(),
        )
        .await?;

        Database::append_audit_on_conn(
            &mut tx,
            &AuditRecord::new(actor, "gst_submission_resolved")
                .resource("einvoice_submission", submission_id)
                .after(json!({
                    "sale_id": sale_id,
                    "status": submission.status,
                    "irn": outcome.irn,
                })),
        )
        .await?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit submission result: {}", e))
        })?;

        metrics::record_gst_submission(&submission.status);
        info!(
            submission_id = %submission_id,
            sale_id = %sale_id,
            status = %submission.status,
            "Filing attempt resolved"
        );

        Ok(submission)
    }

    async fn record_transport_failure(
        &self,
        submission_id: Uuid,
        error: &str,
    ) -> Result<EInvoiceSubmission, AppError> {
        let mut tx = self.db.pool().begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let submission = Database::update_submission_on_conn(
            &mut tx,
            submission_id,
            SubmissionStatus::Pending,
            None,
            Some(error),
        )
        .await?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit pending attempt: {}", e))
        })?;

        metrics::record_gst_submission("pending");

        Ok(submission)
    }

    /// Filing status of a sale: the cached view, plus the authority's live
    /// answer when an IRN exists and the authority is reachable.
    #[instrument(skip(self), fields(sale_id = %sale_id))]
    pub async fn status(&self, sale_id: Uuid) -> Result<FilingStatus, AppError> {
        let sale = self
            .db
            .get_sale(sale_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Sale {} not found", sale_id)))?;

        let latest_submission = self.db.latest_submission(sale_id).await?;

        let live = match &sale.irn {
            Some(irn) if self.client.is_configured() => match self.client.lookup(irn).await {
                Ok(view) => Some(view),
                Err(err) => {
                    warn!(irn = %irn, error = %err, "Live filing lookup failed, serving cached view");
                    None
                }
            },
            _ => None,
        };

        Ok(FilingStatus {
            sale_id,
            gst_status: sale.gst_status,
            irn: sale.irn,
            ack_no: sale.ack_no,
            eway_bill_no: sale.eway_bill_no,
            latest_submission,
            live,
        })
    }

    /// Open a fresh filing attempt unconditionally, even for an already
    /// acknowledged sale. Earlier attempts stay untouched; repeated calls
    /// each queue their own row.
    #[instrument(skip(self), fields(sale_id = %sale_id, actor = %actor))]
    pub async fn retry(&self, actor: &str, sale_id: Uuid) -> Result<EInvoiceSubmission, AppError> {
        let sale = self
            .db
            .get_sale(sale_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Sale {} not found", sale_id)))?;

        self.file(actor, &sale).await
    }

    pub async fn list_submissions(
        &self,
        sale_id: Uuid,
    ) -> Result<Vec<EInvoiceSubmission>, AppError> {
        self.db.list_submissions(sale_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::Secret;

    fn sandbox_config() -> GstConfig {
        GstConfig {
            provider: "gsp".to_string(),
            api_base_url: SANDBOX_BASE_URL.to_string(),
            api_key: Secret::new(String::new()),
            timeout_seconds: 5,
        }
    }

    #[test]
    fn sandbox_needs_no_credentials() {
        assert!(TaxAuthorityClient::new(sandbox_config()).is_configured());
    }

    #[test]
    fn empty_base_url_is_unconfigured() {
        let mut config = sandbox_config();
        config.api_base_url = String::new();
        assert!(!TaxAuthorityClient::new(config).is_configured());
    }

    #[test]
    fn live_endpoint_requires_api_key() {
        let mut config = sandbox_config();
        config.api_base_url = "https://gsp.example.com/v1".to_string();
        assert!(!TaxAuthorityClient::new(config.clone()).is_configured());

        config.api_key = Secret::new("key".to_string());
        assert!(TaxAuthorityClient::new(config).is_configured());
    }

    #[tokio::test]
    async fn sandbox_acknowledges_with_references() {
        let client = TaxAuthorityClient::new(sandbox_config());
        let outcome = client
            .submit(&json!({ "invoice_number": "INV-20250107-00001" }))
            .await
            .unwrap();

        assert_eq!(outcome.status, SubmissionStatus::Acknowledged);
        assert!(outcome.irn.as_deref().unwrap().starts_with("IRN-"));
        assert!(outcome.ack_no.is_some());
        assert_eq!(
            outcome.response["invoice_number"],
            json!("INV-20250107-00001")
        );
    }

    #[tokio::test]
    async fn sandbox_lookup_echoes_the_irn() {
        let client = TaxAuthorityClient::new(sandbox_config());
        let view = client.lookup("IRN-abc").await.unwrap();
        assert_eq!(view["irn"], json!("IRN-abc"));
    }
}
