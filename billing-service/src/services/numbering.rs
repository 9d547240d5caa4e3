//! Sequential invoice-number allocation.
//!
//! Identifiers look like `INV-20250101-00042`. The durable counter row is
//! taken `FOR UPDATE` inside the caller's transaction, so concurrent
//! allocators serialize on it; gaps are acceptable, duplicates are not.

use chrono::NaiveDate;
use service_core::error::AppError;
use sqlx::PgConnection;

pub const DEFAULT_SCOPE: &str = "default";

/// Compose a `PREFIX-YYYYMMDD-NNNNN` identifier. The sequence is zero-padded
/// to five digits and widens naturally beyond 99999.
pub fn compose_invoice_number(prefix: &str, date: NaiveDate, sequence: i64) -> String {
    format!("{}-{}-{:05}", prefix, date.format("%Y%m%d"), sequence)
}

/// Allocate the next invoice number within the caller's transaction.
///
/// The counter resets when the date rolls over. After composing, the number
/// is checked against existing sales (historical data can be imported out of
/// band) and bumped once more on collision, all before the row lock is
/// released at commit time.
pub async fn allocate_invoice_number(
    conn: &mut PgConnection,
    prefix: &str,
    date: NaiveDate,
) -> Result<String, AppError> {
    sqlx::query(
        "INSERT INTO invoice_counters (scope, counter_date, value) VALUES ($1, $2, 0)
         ON CONFLICT (scope) DO NOTHING",
    )
    .bind(DEFAULT_SCOPE)
    .bind(date)
    .execute(&mut *conn)
    .await
    .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to seed invoice counter: {}", e)))?;

    let (counter_date, value): (NaiveDate, i64) = sqlx::query_as(
        "SELECT counter_date, value FROM invoice_counters WHERE scope = $1 FOR UPDATE",
    )
    .bind(DEFAULT_SCOPE)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to lock invoice counter: {}", e)))?;

    let mut sequence = if counter_date == date { value + 1 } else { 1 };
    let mut identifier = compose_invoice_number(prefix, date, sequence);

    let (exists,): (bool,) =
        sqlx::query_as("SELECT EXISTS (SELECT 1 FROM sales WHERE invoice_number = $1)")
            .bind(&identifier)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!(
                    "Failed to check invoice number collision: {}",
                    e
                ))
            })?;

    if exists {
        tracing::warn!(
            invoice_number = %identifier,
            "Allocated invoice number already taken, bumping sequence"
        );
        sequence += 1;
        identifier = compose_invoice_number(prefix, date, sequence);
    }

    sqlx::query(
        "UPDATE invoice_counters SET counter_date = $2, value = $3, updated_at = now()
         WHERE scope = $1",
    )
    .bind(DEFAULT_SCOPE)
    .bind(date)
    .bind(sequence)
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        AppError::DatabaseError(anyhow::anyhow!("Failed to advance invoice counter: {}", e))
    })?;

    tracing::debug!(invoice_number = %identifier, sequence, "Invoice number allocated");
    Ok(identifier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composes_zero_padded_identifier() {
        let date = NaiveDate::from_ymd_opt(2025, 1, 7).unwrap();
        assert_eq!(compose_invoice_number("INV", date, 1), "INV-20250107-00001");
        assert_eq!(
            compose_invoice_number("INV", date, 42),
            "INV-20250107-00042"
        );
    }

    #[test]
    fn sequence_widens_past_five_digits() {
        let date = NaiveDate::from_ymd_opt(2025, 12, 31).unwrap();
        assert_eq!(
            compose_invoice_number("POS", date, 123_456),
            "POS-20251231-123456"
        );
    }
}
