//! Database service for billing-service.
//!
//! Owns the connection pool and every durable mutation. State-changing
//! operations couple their audit row with the entity update in one
//! transaction; `*_on_conn` variants exist so callers composing larger
//! transactions (webhook ingestion, payment-event application) can reuse
//! the same statements inside their own transaction.

use crate::config::BillingSettings;
use crate::models::{
    AuditRecord, CreateItem, EInvoiceSubmission, IntentStatus, Item, ListSalesFilter,
    ListWebhookEventsFilter, NewSale, PaymentIntent, PaymentTransaction, PeriodLock, Sale,
    SaleLine, SubmissionStatus, TransactionPatch, UpdateWebhookRegistration, WebhookEvent,
    WebhookEventStatus, WebhookRegistration,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::reconcile::SaleRef;
use crate::services::tax::{self, TaxLine};
use crate::services::{metrics, numbering};
use chrono::{DateTime, NaiveDate, Utc};
use service_core::error::AppError;
use rust_decimal::Decimal;
use serde_json::json;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

const SALE_COLUMNS: &str = "id, invoice_number, sold_on, sold_at, customer_name, customer_phone, \
     discount, subtotal, cgst, sgst, igst, tax_total, round_off, grand_total, \
     seller_state_code, buyer_state_code, seller_gstin, buyer_gstin, payment_method, \
     payment_status, paid_at, locked, gst_status, irn, ack_no, eway_bill_no, created_at, updated_at";

const SALE_LINE_COLUMNS: &str =
    "id, sale_id, line_no, item_id, description, quantity, rate, tax_rate, base_amount, cgst, sgst, igst";

const INTENT_COLUMNS: &str =
    "id, sale_id, provider, amount, currency, status, customer_reference, created_at, updated_at";

const TRANSACTION_COLUMNS: &str = "id, intent_id, transaction_id, status, amount, reference, \
     raw_response, error, processed_at, created_at";

const REGISTRATION_COLUMNS: &str = "id, provider, event, secret, status, retry_window_minutes, \
     last_success_at, created_at, updated_at";

const EVENT_COLUMNS: &str = "id, registration_id, provider, event, external_id, status, attempts, \
     payload, matched_sale_id, last_error, next_retry_at, processed_at, created_at";

const SUBMISSION_COLUMNS: &str =
    "id, sale_id, provider, status, payload, response, error, created_at, updated_at";

/// How many times a sale insert is retried when the allocated invoice
/// number loses a race.
const SALE_INSERT_ATTEMPTS: u32 = 3;

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "billing-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    fn is_unique_violation(err: &sqlx::Error) -> bool {
        matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
    }

    // =========================================================================
    // Audit
    // =========================================================================

    /// Append an audit entry on the caller's connection so it commits (or
    /// rolls back) together with the mutation it describes.
    pub async fn append_audit_on_conn(
        conn: &mut PgConnection,
        record: &AuditRecord,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (id, actor, action, resource_type, resource_id, before_state, after_state)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&record.actor)
        .bind(&record.action)
        .bind(&record.resource_type)
        .bind(&record.resource_id)
        .bind(&record.before_state)
        .bind(&record.after_state)
        .execute(conn)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to append audit row: {}", e)))?;

        Ok(())
    }

    // =========================================================================
    // Items
    // =========================================================================

    /// Create a sellable item.
    #[instrument(skip(self, input), fields(name = %input.name))]
    pub async fn create_item(&self, actor: &str, input: &CreateItem) -> Result<Item, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_item"])
            .start_timer();

        if input.unit_price < Decimal::ZERO {
            return Err(AppError::ValidationError(
                "unit price must not be negative".to_string(),
            ));
        }

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let item = sqlx::query_as::<_, Item>(
            r#"
            INSERT INTO items (id, name, unit_price, tax_rate, stock_quantity)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, name, unit_price, tax_rate, stock_quantity, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&input.name)
        .bind(input.unit_price)
        .bind(input.tax_rate.unwrap_or(Decimal::ZERO))
        .bind(input.stock_quantity.unwrap_or(Decimal::ZERO))
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to create item: {}", e)))?;

        Self::append_audit_on_conn(
            &mut tx,
            &AuditRecord::new(actor, "item_created")
                .resource("item", item.id)
                .after(json!({ "name": item.name, "unit_price": item.unit_price })),
        )
        .await?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit item creation: {}", e))
        })?;

        timer.observe_duration();
        info!(item_id = %item.id, name = %item.name, "Item created");

        Ok(item)
    }

    /// Get an item by ID.
    pub async fn get_item(&self, item_id: Uuid) -> Result<Option<Item>, AppError> {
        let item = sqlx::query_as::<_, Item>(
            "SELECT id, name, unit_price, tax_rate, stock_quantity, created_at, updated_at
             FROM items WHERE id = $1",
        )
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get item: {}", e)))?;

        Ok(item)
    }

    /// List items ordered by name.
    #[instrument(skip(self))]
    pub async fn list_items(&self) -> Result<Vec<Item>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_items"])
            .start_timer();

        let items = sqlx::query_as::<_, Item>(
            "SELECT id, name, unit_price, tax_rate, stock_quantity, created_at, updated_at
             FROM items ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list items: {}", e)))?;

        timer.observe_duration();

        Ok(items)
    }

    // =========================================================================
    // Period Locks
    // =========================================================================

    /// Find the lock row for an accounting day, if any.
    pub async fn find_period_lock(&self, date: NaiveDate) -> Result<Option<PeriodLock>, AppError> {
        let lock = sqlx::query_as::<_, PeriodLock>(
            "SELECT id, locked_date, locked_by, reason, created_at
             FROM period_locks WHERE locked_date = $1",
        )
        .bind(date)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to read period lock: {}", e)))?;

        Ok(lock)
    }

    /// Administratively close an accounting day.
    #[instrument(skip(self), fields(date = %date))]
    pub async fn lock_period(
        &self,
        actor: &str,
        date: NaiveDate,
        reason: Option<String>,
    ) -> Result<PeriodLock, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["lock_period"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let lock = sqlx::query_as::<_, PeriodLock>(
            r#"
            INSERT INTO period_locks (id, locked_date, locked_by, reason)
            VALUES ($1, $2, $3, $4)
            RETURNING id, locked_date, locked_by, reason, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(date)
        .bind(actor)
        .bind(&reason)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if Self::is_unique_violation(&e) {
                AppError::Conflict(anyhow::anyhow!("Period {} is already locked", date))
            } else {
                AppError::DatabaseError(anyhow::anyhow!("Failed to lock period: {}", e))
            }
        })?;

        Self::append_audit_on_conn(
            &mut tx,
            &AuditRecord::new(actor, "period_locked")
                .resource("period_lock", lock.id)
                .after(json!({ "date": date, "reason": reason })),
        )
        .await?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit period lock: {}", e))
        })?;

        timer.observe_duration();
        info!(date = %date, "Accounting period locked");

        Ok(lock)
    }

    /// Reopen a locked accounting day. The unlock itself is an audited
    /// action and carries a mandatory reason.
    #[instrument(skip(self), fields(date = %date))]
    pub async fn unlock_period(
        &self,
        actor: &str,
        date: NaiveDate,
        reason: &str,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["unlock_period"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let removed = sqlx::query("DELETE FROM period_locks WHERE locked_date = $1")
            .bind(date)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to unlock period: {}", e))
            })?;

        if removed.rows_affected() == 0 {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Period {} is not locked",
                date
            )));
        }

        Self::append_audit_on_conn(
            &mut tx,
            &AuditRecord::new(actor, "period_unlocked")
                .resource("period_lock", date)
                .after(json!({ "date": date, "reason": reason })),
        )
        .await?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit period unlock: {}", e))
        })?;

        timer.observe_duration();
        info!(date = %date, "Accounting period unlocked");

        Ok(())
    }

    /// List locked accounting days.
    pub async fn list_period_locks(&self) -> Result<Vec<PeriodLock>, AppError> {
        let locks = sqlx::query_as::<_, PeriodLock>(
            "SELECT id, locked_date, locked_by, reason, created_at
             FROM period_locks ORDER BY locked_date DESC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list period locks: {}", e)))?;

        Ok(locks)
    }

    // =========================================================================
    // Sales
    // =========================================================================

    /// Record a sale: price the lines, allocate an invoice number, persist
    /// the sale with its breakdown, decrement stock and write the audit row,
    /// all in one transaction.
    ///
    /// The whole transaction is retried a bounded number of times when the
    /// allocated invoice number loses a race to a concurrent insert.
    #[instrument(skip(self, input, settings), fields(actor = %actor))]
    pub async fn record_sale(
        &self,
        actor: &str,
        override_locked: bool,
        input: &NewSale,
        settings: &BillingSettings,
    ) -> Result<(Sale, Vec<SaleLine>), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_sale"])
            .start_timer();

        let sold_at = input.sold_at.unwrap_or_else(Utc::now);
        let sold_on = sold_at.date_naive();

        let period_locked = self.find_period_lock(sold_on).await?.is_some();
        if period_locked && !override_locked {
            return Err(AppError::LockedPeriod(format!(
                "accounting day {} is closed",
                sold_on
            )));
        }

        let (tax_lines, stock_moves) = self.resolve_lines(input).await?;
        let buyer_state = input.buyer_state_code.as_deref().unwrap_or("");
        let split = tax::compute_split(&tax_lines, &settings.seller_state_code, buyer_state)?;
        let payment_method = input
            .payment_method
            .clone()
            .unwrap_or_else(|| "cash".to_string());

        let mut attempt = 0;
        loop {
            attempt += 1;

            match self
                .insert_sale_tx(
                    actor,
                    input,
                    settings,
                    &split,
                    &stock_moves,
                    sold_at,
                    sold_on,
                    &payment_method,
                    period_locked,
                )
                .await
            {
                Ok(result) => {
                    timer.observe_duration();
                    metrics::record_sale_recorded(&payment_method);
                    info!(
                        sale_id = %result.0.id,
                        invoice_number = ?result.0.invoice_number,
                        grand_total = %result.0.grand_total,
                        "Sale recorded"
                    );
                    return Ok(result);
                }
                Err(AppError::Conflict(err)) if attempt < SALE_INSERT_ATTEMPTS => {
                    warn!(attempt, error = %err, "Invoice number raced, retrying sale insert");
                    continue;
                }
                Err(AppError::Conflict(err)) => {
                    metrics::record_error("conflict", "record_sale");
                    return Err(AppError::TransientError(anyhow::anyhow!(
                        "invoice numbering contention persisted after {} attempts: {}",
                        SALE_INSERT_ATTEMPTS,
                        err
                    )));
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// Resolve input lines against the item catalogue and collect the stock
    /// decrements to apply. Stock is pre-checked here for a friendly error;
    /// the transactional guard in `insert_sale_tx` is what actually prevents
    /// overselling.
    async fn resolve_lines(
        &self,
        input: &NewSale,
    ) -> Result<(Vec<TaxLine>, Vec<(Uuid, Decimal)>), AppError> {
        let mut tax_lines = Vec::with_capacity(input.lines.len());
        let mut stock_moves = Vec::new();

        for line in &input.lines {
            let (description, rate, tax_rate) = match line.item_id {
                Some(item_id) => {
                    let item = self.get_item(item_id).await?.ok_or_else(|| {
                        AppError::ValidationError(format!("unknown item {}", item_id))
                    })?;

                    if item.stock_quantity < line.quantity {
                        return Err(AppError::ValidationError(format!(
                            "insufficient stock for '{}': requested {}, available {}",
                            item.name, line.quantity, item.stock_quantity
                        )));
                    }
                    if line.quantity > Decimal::ZERO {
                        stock_moves.push((item_id, line.quantity));
                    }

                    (
                        line.description.clone().unwrap_or(item.name),
                        line.rate.unwrap_or(item.unit_price),
                        line.tax_rate.unwrap_or(item.tax_rate),
                    )
                }
                None => {
                    let description = line.description.clone().ok_or_else(|| {
                        AppError::ValidationError(
                            "line without item_id requires a description".to_string(),
                        )
                    })?;
                    let rate = line.rate.ok_or_else(|| {
                        AppError::ValidationError(format!(
                            "line '{}' without item_id requires a rate",
                            description
                        ))
                    })?;
                    (description, rate, line.tax_rate.unwrap_or(Decimal::ZERO))
                }
            };

            tax_lines.push(TaxLine {
                description,
                quantity: line.quantity,
                rate,
                tax_rate,
                discount: line.discount.unwrap_or(Decimal::ZERO),
            });
        }

        Ok((tax_lines, stock_moves))
    }

    #[allow(clippy::too_many_arguments)]
    async fn insert_sale_tx(
        &self,
        actor: &str,
        input: &NewSale,
        settings: &BillingSettings,
        split: &tax::TaxSplit,
        stock_moves: &[(Uuid, Decimal)],
        sold_at: DateTime<Utc>,
        sold_on: NaiveDate,
        payment_method: &str,
        period_locked: bool,
    ) -> Result<(Sale, Vec<SaleLine>), AppError> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let invoice_number =
            numbering::allocate_invoice_number(&mut tx, &settings.invoice_prefix, sold_on).await?;

        let sale = sqlx::query_as::<_, Sale>(&format!(
            r#"
            INSERT INTO sales (id, invoice_number, sold_on, sold_at, customer_name, customer_phone,
                               discount, subtotal, cgst, sgst, igst, tax_total, round_off, grand_total,
                               seller_state_code, buyer_state_code, seller_gstin, buyer_gstin,
                               payment_method)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            RETURNING {SALE_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(&invoice_number)
        .bind(sold_on)
        .bind(sold_at)
        .bind(&input.customer_name)
        .bind(&input.customer_phone)
        .bind(split.discount_total)
        .bind(split.subtotal)
        .bind(split.cgst)
        .bind(split.sgst)
        .bind(split.igst)
        .bind(split.tax_total)
        .bind(split.round_off)
        .bind(split.grand_total)
        .bind(&settings.seller_state_code)
        .bind(input.buyer_state_code.as_deref().unwrap_or(""))
        .bind(&settings.seller_gstin)
        .bind(&input.buyer_gstin)
        .bind(payment_method)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if Self::is_unique_violation(&e) {
                AppError::Conflict(anyhow::anyhow!("invoice number already taken"))
            } else {
                AppError::DatabaseError(anyhow::anyhow!("Failed to insert sale: {}", e))
            }
        })?;

        let mut lines = Vec::with_capacity(split.lines.len());
        for (index, (amounts, source)) in split.lines.iter().zip(&input.lines).enumerate() {
            let line = sqlx::query_as::<_, SaleLine>(&format!(
                r#"
                INSERT INTO sale_lines (id, sale_id, line_no, item_id, description, quantity, rate,
                                        tax_rate, base_amount, cgst, sgst, igst)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                RETURNING {SALE_LINE_COLUMNS}
                "#
            ))
            .bind(Uuid::new_v4())
            .bind(sale.id)
            .bind((index + 1) as i32)
            .bind(source.item_id)
            .bind(&amounts.description)
            .bind(amounts.quantity)
            .bind(amounts.rate)
            .bind(amounts.tax_rate)
            .bind(amounts.base_amount)
            .bind(amounts.cgst)
            .bind(amounts.sgst)
            .bind(amounts.igst)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to insert sale line: {}", e))
            })?;
            lines.push(line);
        }

        for (item_id, quantity) in stock_moves {
            let updated = sqlx::query(
                "UPDATE items SET stock_quantity = stock_quantity - $2, updated_at = now()
                 WHERE id = $1 AND stock_quantity >= $2",
            )
            .bind(item_id)
            .bind(quantity)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to decrement stock: {}", e))
            })?;

            if updated.rows_affected() == 0 {
                // A concurrent sale consumed the stock between the pre-check
                // and this guard; the transaction rolls back on drop.
                return Err(AppError::ValidationError(format!(
                    "insufficient stock for item {}",
                    item_id
                )));
            }
        }

        Self::append_audit_on_conn(
            &mut tx,
            &AuditRecord::new(actor, "sale_recorded")
                .resource("sale", sale.id)
                .after(json!({
                    "invoice_number": invoice_number,
                    "grand_total": sale.grand_total,
                    "payment_method": payment_method,
                })),
        )
        .await?;

        if period_locked {
            Self::append_audit_on_conn(
                &mut tx,
                &AuditRecord::new(actor, "period_lock_override")
                    .resource("sale", sale.id)
                    .after(json!({ "date": sold_on })),
            )
            .await?;
        }

        tx.commit().await.map_err(|e| {
            if Self::is_unique_violation(&e) {
                AppError::Conflict(anyhow::anyhow!("invoice number already taken"))
            } else {
                AppError::DatabaseError(anyhow::anyhow!("Failed to commit sale: {}", e))
            }
        })?;

        Ok((sale, lines))
    }

    /// Get a sale by ID.
    pub async fn get_sale(&self, sale_id: Uuid) -> Result<Option<Sale>, AppError> {
        let sale = sqlx::query_as::<_, Sale>(&format!(
            "SELECT {SALE_COLUMNS} FROM sales WHERE id = $1"
        ))
        .bind(sale_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get sale: {}", e)))?;

        Ok(sale)
    }

    /// Get a sale by invoice number.
    pub async fn get_sale_by_invoice_number(
        &self,
        invoice_number: &str,
    ) -> Result<Option<Sale>, AppError> {
        let sale = sqlx::query_as::<_, Sale>(&format!(
            "SELECT {SALE_COLUMNS} FROM sales WHERE invoice_number = $1"
        ))
        .bind(invoice_number)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get sale: {}", e)))?;

        Ok(sale)
    }

    /// Get the line breakdown of a sale.
    pub async fn get_sale_lines(&self, sale_id: Uuid) -> Result<Vec<SaleLine>, AppError> {
        let lines = sqlx::query_as::<_, SaleLine>(&format!(
            "SELECT {SALE_LINE_COLUMNS} FROM sale_lines WHERE sale_id = $1 ORDER BY line_no"
        ))
        .bind(sale_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get sale lines: {}", e)))?;

        Ok(lines)
    }

    /// List sales, newest first.
    #[instrument(skip(self, filter))]
    pub async fn list_sales(&self, filter: &ListSalesFilter) -> Result<Vec<Sale>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_sales"])
            .start_timer();

        let limit = filter.limit.unwrap_or(50).clamp(1, 200);
        let offset = filter.offset.unwrap_or(0).max(0);

        let sales = sqlx::query_as::<_, Sale>(&format!(
            r#"
            SELECT {SALE_COLUMNS} FROM sales
            WHERE ($1::text IS NULL OR payment_status = $1)
              AND ($2::text IS NULL OR gst_status = $2)
              AND ($3::date IS NULL OR sold_on >= $3)
              AND ($4::date IS NULL OR sold_on <= $4)
            ORDER BY sold_at DESC
            LIMIT $5 OFFSET $6
            "#
        ))
        .bind(&filter.payment_status)
        .bind(&filter.gst_status)
        .bind(filter.from)
        .bind(filter.to)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list sales: {}", e)))?;

        timer.observe_duration();

        Ok(sales)
    }

    /// Resolve the first matching sale of an ordered reference plan.
    pub async fn resolve_sale_reference(&self, plan: &[SaleRef]) -> Result<Option<Sale>, AppError> {
        for step in plan {
            let sale = match step {
                SaleRef::Id(id) => self.get_sale(*id).await?,
                SaleRef::InvoiceNumber(number) | SaleRef::Reference(number) => {
                    self.get_sale_by_invoice_number(number).await?
                }
            };
            if sale.is_some() {
                return Ok(sale);
            }
        }
        Ok(None)
    }

    /// Mark a sale paid. Idempotent: an already-paid sale is returned
    /// unchanged with no new audit row.
    #[instrument(skip(self), fields(sale_id = %sale_id))]
    pub async fn mark_paid(
        &self,
        actor: &str,
        sale_id: Uuid,
        payment_method: Option<&str>,
    ) -> Result<(Sale, bool), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["mark_paid"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let result = Self::mark_sale_paid_on_conn(&mut tx, actor, sale_id, payment_method).await?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit payment mark: {}", e))
        })?;

        timer.observe_duration();

        match result {
            Some((sale, changed)) => Ok((sale, changed)),
            None => Err(AppError::NotFound(anyhow::anyhow!("Sale not found"))),
        }
    }

    /// Connection-scoped variant of [`Self::mark_paid`], used inside webhook
    /// and payment-event transactions. Returns `None` when the sale does not
    /// exist, `Some((sale, changed))` otherwise.
    pub async fn mark_sale_paid_on_conn(
        conn: &mut PgConnection,
        actor: &str,
        sale_id: Uuid,
        payment_method: Option<&str>,
    ) -> Result<Option<(Sale, bool)>, AppError> {
        let existing = sqlx::query_as::<_, Sale>(&format!(
            "SELECT {SALE_COLUMNS} FROM sales WHERE id = $1 FOR UPDATE"
        ))
        .bind(sale_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to load sale: {}", e)))?;

        let Some(existing) = existing else {
            return Ok(None);
        };

        if existing.payment_status == "paid" {
            return Ok(Some((existing, false)));
        }

        let sale = sqlx::query_as::<_, Sale>(&format!(
            r#"
            UPDATE sales
            SET payment_status = 'paid',
                paid_at = now(),
                payment_method = COALESCE($2, payment_method),
                updated_at = now()
            WHERE id = $1
            RETURNING {SALE_COLUMNS}
            "#
        ))
        .bind(sale_id)
        .bind(payment_method)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to mark sale paid: {}", e)))?;

        Self::append_audit_on_conn(
            conn,
            &AuditRecord::new(actor, "sale_marked_paid")
                .resource("sale", sale_id)
                .before(json!({ "payment_status": existing.payment_status }))
                .after(json!({
                    "payment_status": "paid",
                    "payment_method": sale.payment_method,
                })),
        )
        .await?;

        Ok(Some((sale, true)))
    }

    /// Update a sale's GST filing state on the caller's connection. Filing
    /// references are only overwritten where a new value is present, so a
    /// partial response never blanks out an earlier acknowledgement.
    pub async fn update_sale_filing_on_conn(
        conn: &mut PgConnection,
        sale_id: Uuid,
        gst_status: &str,
        irn: Option<&str>,
        ack_no: Option<&str>,
        eway_bill_no: Option<&str>,
    ) -> Result<Sale, AppError> {
        let sale = sqlx::query_as::<_, Sale>(&format!(
            r#"
            UPDATE sales
            SET gst_status = $2,
                irn = COALESCE($3, irn),
                ack_no = COALESCE($4, ack_no),
                eway_bill_no = COALESCE($5, eway_bill_no),
                updated_at = now()
            WHERE id = $1
            RETURNING {SALE_COLUMNS}
            "#
        ))
        .bind(sale_id)
        .bind(gst_status)
        .bind(irn)
        .bind(ack_no)
        .bind(eway_bill_no)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to update sale filing state: {}", e))
        })?;

        Ok(sale)
    }

    // =========================================================================
    // Payment Intents
    // =========================================================================

    /// Create a payment intent and its initial `created` transaction in one
    /// transaction with the audit row.
    #[instrument(skip(self, provider_reference), fields(provider = %provider))]
    #[allow(clippy::too_many_arguments)]
    pub async fn create_intent(
        &self,
        actor: &str,
        sale_id: Option<Uuid>,
        provider: &str,
        amount: Decimal,
        currency: &str,
        customer_reference: Option<String>,
        provider_reference: Option<String>,
    ) -> Result<(PaymentIntent, PaymentTransaction), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_intent"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let intent = sqlx::query_as::<_, PaymentIntent>(&format!(
            r#"
            INSERT INTO payment_intents (id, sale_id, provider, amount, currency, status, customer_reference)
            VALUES ($1, $2, $3, $4, $5, 'pending', $6)
            RETURNING {INTENT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(sale_id)
        .bind(provider)
        .bind(amount)
        .bind(currency)
        .bind(&customer_reference)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to create intent: {}", e)))?;

        let transaction = Self::insert_transaction_on_conn(
            &mut tx,
            intent.id,
            &TransactionPatch {
                status: IntentStatus::Created.as_str().to_string(),
                reference: provider_reference,
                ..Default::default()
            },
        )
        .await?;

        Self::append_audit_on_conn(
            &mut tx,
            &AuditRecord::new(actor, "payment_intent_created")
                .resource("payment_intent", intent.id)
                .after(json!({
                    "provider": provider,
                    "amount": amount,
                    "sale_id": sale_id,
                })),
        )
        .await?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit intent creation: {}", e))
        })?;

        timer.observe_duration();
        info!(intent_id = %intent.id, provider = %provider, "Payment intent created");

        Ok((intent, transaction))
    }

    /// Get an intent by ID.
    pub async fn get_intent(&self, intent_id: Uuid) -> Result<Option<PaymentIntent>, AppError> {
        let intent = sqlx::query_as::<_, PaymentIntent>(&format!(
            "SELECT {INTENT_COLUMNS} FROM payment_intents WHERE id = $1"
        ))
        .bind(intent_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get intent: {}", e)))?;

        Ok(intent)
    }

    /// List intents, newest first.
    pub async fn list_intents(&self, limit: i64, offset: i64) -> Result<Vec<PaymentIntent>, AppError> {
        let intents = sqlx::query_as::<_, PaymentIntent>(&format!(
            "SELECT {INTENT_COLUMNS} FROM payment_intents ORDER BY created_at DESC LIMIT $1 OFFSET $2"
        ))
        .bind(limit.clamp(1, 200))
        .bind(offset.max(0))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list intents: {}", e)))?;

        Ok(intents)
    }

    /// Transaction history of an intent, in arrival order.
    pub async fn intent_transactions(
        &self,
        intent_id: Uuid,
    ) -> Result<Vec<PaymentTransaction>, AppError> {
        let transactions = sqlx::query_as::<_, PaymentTransaction>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM payment_transactions
             WHERE intent_id = $1 ORDER BY created_at"
        ))
        .bind(intent_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list transactions: {}", e))
        })?;

        Ok(transactions)
    }

    pub async fn get_intent_on_conn(
        conn: &mut PgConnection,
        intent_id: Uuid,
    ) -> Result<Option<PaymentIntent>, AppError> {
        let intent = sqlx::query_as::<_, PaymentIntent>(&format!(
            "SELECT {INTENT_COLUMNS} FROM payment_intents WHERE id = $1 FOR UPDATE"
        ))
        .bind(intent_id)
        .fetch_optional(conn)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to load intent: {}", e)))?;

        Ok(intent)
    }

    /// Locate a transaction by the provider's external transaction id.
    pub async fn find_transaction_by_external_id_on_conn(
        conn: &mut PgConnection,
        external_id: &str,
    ) -> Result<Option<PaymentTransaction>, AppError> {
        let transaction = sqlx::query_as::<_, PaymentTransaction>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM payment_transactions
             WHERE transaction_id = $1 ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(external_id)
        .fetch_optional(conn)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to locate transaction: {}", e))
        })?;

        Ok(transaction)
    }

    /// The most recent transaction of an intent.
    pub async fn latest_transaction_on_conn(
        conn: &mut PgConnection,
        intent_id: Uuid,
    ) -> Result<Option<PaymentTransaction>, AppError> {
        let transaction = sqlx::query_as::<_, PaymentTransaction>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM payment_transactions
             WHERE intent_id = $1 ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(intent_id)
        .fetch_optional(conn)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to load latest transaction: {}", e))
        })?;

        Ok(transaction)
    }

    /// The most recent intent opened against a sale.
    pub async fn latest_intent_for_sale_on_conn(
        conn: &mut PgConnection,
        sale_id: Uuid,
    ) -> Result<Option<PaymentIntent>, AppError> {
        let intent = sqlx::query_as::<_, PaymentIntent>(&format!(
            "SELECT {INTENT_COLUMNS} FROM payment_intents
             WHERE sale_id = $1 ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(sale_id)
        .fetch_optional(conn)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to load intent for sale: {}", e))
        })?;

        Ok(intent)
    }

    /// Append a transaction row to an intent.
    pub async fn insert_transaction_on_conn(
        conn: &mut PgConnection,
        intent_id: Uuid,
        patch: &TransactionPatch,
    ) -> Result<PaymentTransaction, AppError> {
        let transaction = sqlx::query_as::<_, PaymentTransaction>(&format!(
            r#"
            INSERT INTO payment_transactions (id, intent_id, transaction_id, status, amount,
                                              reference, raw_response, error, processed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, now())
            RETURNING {TRANSACTION_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(intent_id)
        .bind(&patch.transaction_id)
        .bind(&patch.status)
        .bind(patch.amount)
        .bind(&patch.reference)
        .bind(&patch.raw_response)
        .bind(&patch.error)
        .fetch_one(conn)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to insert transaction: {}", e))
        })?;

        Ok(transaction)
    }

    /// Merge a provider event into an existing transaction. `None` fields of
    /// the patch keep the stored value; references are never blanked.
    pub async fn update_transaction_on_conn(
        conn: &mut PgConnection,
        transaction_row_id: Uuid,
        patch: &TransactionPatch,
    ) -> Result<PaymentTransaction, AppError> {
        let transaction = sqlx::query_as::<_, PaymentTransaction>(&format!(
            r#"
            UPDATE payment_transactions
            SET status = $2,
                transaction_id = COALESCE($3, transaction_id),
                amount = COALESCE($4, amount),
                reference = COALESCE($5, reference),
                raw_response = COALESCE($6, raw_response),
                error = COALESCE($7, error),
                processed_at = now()
            WHERE id = $1
            RETURNING {TRANSACTION_COLUMNS}
            "#
        ))
        .bind(transaction_row_id)
        .bind(&patch.status)
        .bind(&patch.transaction_id)
        .bind(patch.amount)
        .bind(&patch.reference)
        .bind(&patch.raw_response)
        .bind(&patch.error)
        .fetch_one(conn)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to update transaction: {}", e))
        })?;

        Ok(transaction)
    }

    /// Project a status onto an intent.
    pub async fn update_intent_status_on_conn(
        conn: &mut PgConnection,
        intent_id: Uuid,
        status: IntentStatus,
    ) -> Result<PaymentIntent, AppError> {
        let intent = sqlx::query_as::<_, PaymentIntent>(&format!(
            r#"
            UPDATE payment_intents
            SET status = $2, updated_at = now()
            WHERE id = $1
            RETURNING {INTENT_COLUMNS}
            "#
        ))
        .bind(intent_id)
        .bind(status.as_str())
        .fetch_one(conn)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to update intent status: {}", e))
        })?;

        Ok(intent)
    }

    // =========================================================================
    // Webhook Registrations & Events
    // =========================================================================

    /// Look up the registration for a (provider, event) pair.
    pub async fn find_registration(
        &self,
        provider: &str,
        event: &str,
    ) -> Result<Option<WebhookRegistration>, AppError> {
        let registration = sqlx::query_as::<_, WebhookRegistration>(&format!(
            "SELECT {REGISTRATION_COLUMNS} FROM webhook_registrations
             WHERE provider = $1 AND event = $2"
        ))
        .bind(provider)
        .bind(event)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to find registration: {}", e))
        })?;

        Ok(registration)
    }

    /// Get a registration by ID.
    pub async fn get_registration(
        &self,
        registration_id: Uuid,
    ) -> Result<Option<WebhookRegistration>, AppError> {
        let registration = sqlx::query_as::<_, WebhookRegistration>(&format!(
            "SELECT {REGISTRATION_COLUMNS} FROM webhook_registrations WHERE id = $1"
        ))
        .bind(registration_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get registration: {}", e))
        })?;

        Ok(registration)
    }

    /// List registrations.
    pub async fn list_registrations(&self) -> Result<Vec<WebhookRegistration>, AppError> {
        let registrations = sqlx::query_as::<_, WebhookRegistration>(&format!(
            "SELECT {REGISTRATION_COLUMNS} FROM webhook_registrations ORDER BY provider, event"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list registrations: {}", e))
        })?;

        Ok(registrations)
    }

    /// Create a webhook registration. The secret is audited by presence
    /// only, never by value.
    #[instrument(skip(self, secret), fields(provider = %provider, event = %event))]
    pub async fn create_registration(
        &self,
        actor: &str,
        provider: &str,
        event: &str,
        secret: &str,
        retry_window_minutes: i32,
    ) -> Result<WebhookRegistration, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_registration"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let registration = sqlx::query_as::<_, WebhookRegistration>(&format!(
            r#"
            INSERT INTO webhook_registrations (id, provider, event, secret, retry_window_minutes)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {REGISTRATION_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(provider)
        .bind(event)
        .bind(secret)
        .bind(retry_window_minutes)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if Self::is_unique_violation(&e) {
                AppError::Conflict(anyhow::anyhow!(
                    "registration for {}/{} already exists",
                    provider,
                    event
                ))
            } else {
                AppError::DatabaseError(anyhow::anyhow!("Failed to create registration: {}", e))
            }
        })?;

        Self::append_audit_on_conn(
            &mut tx,
            &AuditRecord::new(actor, "webhook_registration_created")
                .resource("webhook_registration", registration.id)
                .after(json!({
                    "provider": provider,
                    "event": event,
                    "retry_window_minutes": retry_window_minutes,
                })),
        )
        .await?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit registration: {}", e))
        })?;

        timer.observe_duration();
        info!(registration_id = %registration.id, "Webhook registration created");

        Ok(registration)
    }

    /// Update a registration's secret, retry window or status.
    #[instrument(skip(self, input), fields(registration_id = %registration_id))]
    pub async fn update_registration(
        &self,
        actor: &str,
        registration_id: Uuid,
        input: &UpdateWebhookRegistration,
    ) -> Result<Option<WebhookRegistration>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_registration"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let registration = sqlx::query_as::<_, WebhookRegistration>(&format!(
            r#"
            UPDATE webhook_registrations
            SET secret = COALESCE($2, secret),
                retry_window_minutes = COALESCE($3, retry_window_minutes),
                status = COALESCE($4, status),
                updated_at = now()
            WHERE id = $1
            RETURNING {REGISTRATION_COLUMNS}
            "#
        ))
        .bind(registration_id)
        .bind(&input.secret)
        .bind(input.retry_window_minutes)
        .bind(&input.status)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to update registration: {}", e))
        })?;

        let Some(registration) = registration else {
            return Ok(None);
        };

        Self::append_audit_on_conn(
            &mut tx,
            &AuditRecord::new(actor, "webhook_registration_updated")
                .resource("webhook_registration", registration_id)
                .after(json!({
                    "secret_rotated": input.secret.is_some(),
                    "retry_window_minutes": registration.retry_window_minutes,
                    "status": registration.status,
                })),
        )
        .await?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit registration update: {}", e))
        })?;

        timer.observe_duration();

        Ok(Some(registration))
    }

    /// Persist an inbound delivery on the caller's connection.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_webhook_event_on_conn(
        conn: &mut PgConnection,
        registration: &WebhookRegistration,
        status: WebhookEventStatus,
        external_id: Option<&str>,
        payload: &serde_json::Value,
        matched_sale_id: Option<Uuid>,
        last_error: Option<&str>,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<WebhookEvent, AppError> {
        let processed_at = match status {
            WebhookEventStatus::Matched => Some(Utc::now()),
            _ => None,
        };

        let event = sqlx::query_as::<_, WebhookEvent>(&format!(
            r#"
            INSERT INTO webhook_events (id, registration_id, provider, event, external_id, status,
                                        payload, matched_sale_id, last_error, next_retry_at, processed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING {EVENT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(registration.id)
        .bind(&registration.provider)
        .bind(&registration.event)
        .bind(external_id)
        .bind(status.as_str())
        .bind(payload)
        .bind(matched_sale_id)
        .bind(last_error)
        .bind(next_retry_at)
        .bind(processed_at)
        .fetch_one(conn)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to persist webhook event: {}", e))
        })?;

        Ok(event)
    }

    /// Persist a delivery that failed authentication. Runs in its own
    /// transaction so the rejection is durable before the 403 goes out.
    #[instrument(skip(self, registration, payload))]
    pub async fn store_rejected_event(
        &self,
        registration: &WebhookRegistration,
        external_id: Option<&str>,
        payload: &serde_json::Value,
        reason: &str,
    ) -> Result<WebhookEvent, AppError> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let event = Self::insert_webhook_event_on_conn(
            &mut tx,
            registration,
            WebhookEventStatus::Rejected,
            external_id,
            payload,
            None,
            Some(reason),
            None,
        )
        .await?;

        Self::append_audit_on_conn(
            &mut tx,
            &AuditRecord::new(format!("provider:{}", registration.provider), "webhook_rejected")
                .resource("webhook_event", event.id)
                .after(json!({ "reason": reason, "external_id": external_id })),
        )
        .await?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit rejected event: {}", e))
        })?;

        Ok(event)
    }

    /// Stamp the registration's last successful delivery.
    pub async fn stamp_registration_success_on_conn(
        conn: &mut PgConnection,
        registration_id: Uuid,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE webhook_registrations SET last_success_at = now(), updated_at = now()
             WHERE id = $1",
        )
        .bind(registration_id)
        .execute(conn)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to stamp registration: {}", e))
        })?;

        Ok(())
    }

    /// Get a webhook event by ID.
    pub async fn get_webhook_event(&self, event_id: Uuid) -> Result<Option<WebhookEvent>, AppError> {
        let event = sqlx::query_as::<_, WebhookEvent>(&format!(
            "SELECT {EVENT_COLUMNS} FROM webhook_events WHERE id = $1"
        ))
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get webhook event: {}", e)))?;

        Ok(event)
    }

    /// List webhook events, newest first.
    #[instrument(skip(self, filter))]
    pub async fn list_webhook_events(
        &self,
        filter: &ListWebhookEventsFilter,
    ) -> Result<Vec<WebhookEvent>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_webhook_events"])
            .start_timer();

        let limit = filter.limit.unwrap_or(50).clamp(1, 200);
        let offset = filter.offset.unwrap_or(0).max(0);

        let events = sqlx::query_as::<_, WebhookEvent>(&format!(
            r#"
            SELECT {EVENT_COLUMNS} FROM webhook_events
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR provider = $2)
            ORDER BY created_at DESC
            LIMIT $3 OFFSET $4
            "#
        ))
        .bind(&filter.status)
        .bind(&filter.provider)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list webhook events: {}", e))
        })?;

        timer.observe_duration();

        Ok(events)
    }

    /// Re-queue a pending or rejected event for another matching attempt.
    /// A pending event whose retry window has lapsed expires here instead;
    /// matched and expired events are final and cannot be retried.
    #[instrument(skip(self), fields(event_id = %event_id))]
    pub async fn retry_webhook_event(
        &self,
        actor: &str,
        event_id: Uuid,
    ) -> Result<WebhookEvent, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["retry_webhook_event"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let expired = sqlx::query_as::<_, WebhookEvent>(&format!(
            r#"
            UPDATE webhook_events
            SET status = 'expired', last_error = 'retry window exhausted'
            WHERE id = $1 AND status = 'pending'
              AND next_retry_at IS NOT NULL AND next_retry_at < now()
            RETURNING {EVENT_COLUMNS}
            "#
        ))
        .bind(event_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to expire webhook event: {}", e))
        })?;

        if let Some(event) = expired {
            Self::append_audit_on_conn(
                &mut tx,
                &AuditRecord::new(actor, "webhook_expired")
                    .resource("webhook_event", event_id)
                    .after(json!({ "attempts": event.attempts })),
            )
            .await?;

            tx.commit().await.map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to commit event expiry: {}", e))
            })?;

            timer.observe_duration();

            return Ok(event);
        }

        let event = sqlx::query_as::<_, WebhookEvent>(&format!(
            r#"
            UPDATE webhook_events
            SET status = 'pending', attempts = attempts + 1, last_error = NULL,
                next_retry_at = now() + make_interval(mins => (
                    SELECT r.retry_window_minutes FROM webhook_registrations r
                    WHERE r.id = webhook_events.registration_id))
            WHERE id = $1 AND status NOT IN ('matched', 'expired')
            RETURNING {EVENT_COLUMNS}
            "#
        ))
        .bind(event_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to retry webhook event: {}", e))
        })?
        .ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("No retryable webhook event {}", event_id))
        })?;

        Self::append_audit_on_conn(
            &mut tx,
            &AuditRecord::new(actor, "webhook_retry_queued")
                .resource("webhook_event", event_id)
                .after(json!({ "attempts": event.attempts })),
        )
        .await?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit event retry: {}", e))
        })?;

        timer.observe_duration();

        Ok(event)
    }

    /// Bind an event to a sale on the caller's connection (manual match or
    /// a successful automatic match during re-resolution).
    pub async fn match_webhook_event_on_conn(
        conn: &mut PgConnection,
        event_id: Uuid,
        sale_id: Uuid,
    ) -> Result<WebhookEvent, AppError> {
        let event = sqlx::query_as::<_, WebhookEvent>(&format!(
            r#"
            UPDATE webhook_events
            SET status = 'matched', matched_sale_id = $2, processed_at = now(), last_error = NULL
            WHERE id = $1
            RETURNING {EVENT_COLUMNS}
            "#
        ))
        .bind(event_id)
        .bind(sale_id)
        .fetch_one(conn)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to match webhook event: {}", e))
        })?;

        Ok(event)
    }

    // =========================================================================
    // E-invoice Submissions
    // =========================================================================

    /// Open a new filing attempt on the caller's connection.
    pub async fn insert_submission_on_conn(
        conn: &mut PgConnection,
        sale_id: Uuid,
        provider: &str,
        payload: &serde_json::Value,
    ) -> Result<EInvoiceSubmission, AppError> {
        let submission = sqlx::query_as::<_, EInvoiceSubmission>(&format!(
            r#"
            INSERT INTO einvoice_submissions (id, sale_id, provider, status, payload)
            VALUES ($1, $2, $3, 'pending', $4)
            RETURNING {SUBMISSION_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(sale_id)
        .bind(provider)
        .bind(payload)
        .fetch_one(conn)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to insert submission: {}", e))
        })?;

        Ok(submission)
    }

    /// Advance a filing attempt's lifecycle on the caller's connection.
    pub async fn update_submission_on_conn(
        conn: &mut PgConnection,
        submission_id: Uuid,
        status: SubmissionStatus,
        response: Option<&serde_json::Value>,
        error: Option<&str>,
    ) -> Result<EInvoiceSubmission, AppError> {
        let submission = sqlx::query_as::<_, EInvoiceSubmission>(&format!(
            r#"
            UPDATE einvoice_submissions
            SET status = $2, response = COALESCE($3, response), error = $4, updated_at = now()
            WHERE id = $1
            RETURNING {SUBMISSION_COLUMNS}
            "#
        ))
        .bind(submission_id)
        .bind(status.as_str())
        .bind(response)
        .bind(error)
        .fetch_one(conn)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to update submission: {}", e))
        })?;

        Ok(submission)
    }

    /// The most recent filing attempt for a sale.
    pub async fn latest_submission(
        &self,
        sale_id: Uuid,
    ) -> Result<Option<EInvoiceSubmission>, AppError> {
        let submission = sqlx::query_as::<_, EInvoiceSubmission>(&format!(
            "SELECT {SUBMISSION_COLUMNS} FROM einvoice_submissions
             WHERE sale_id = $1 ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(sale_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to load latest submission: {}", e))
        })?;

        Ok(submission)
    }

    /// All filing attempts for a sale, newest first.
    pub async fn list_submissions(
        &self,
        sale_id: Uuid,
    ) -> Result<Vec<EInvoiceSubmission>, AppError> {
        let submissions = sqlx::query_as::<_, EInvoiceSubmission>(&format!(
            "SELECT {SUBMISSION_COLUMNS} FROM einvoice_submissions
             WHERE sale_id = $1 ORDER BY created_at DESC"
        ))
        .bind(sale_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list submissions: {}", e))
        })?;

        Ok(submissions)
    }
}
