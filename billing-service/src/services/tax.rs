//! GST split calculation.
//!
//! Intra-state sales split the tax equally into CGST and SGST; inter-state
//! sales carry a single IGST leg. All arithmetic is exact decimal; only the
//! grand total is rounded (half-up, two places) and the rounding delta is
//! tracked explicitly as `round_off` instead of being discarded.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use service_core::error::AppError;

/// One line of a sale before tax computation. `discount` reduces the taxable
/// base of this line only.
#[derive(Debug, Clone)]
pub struct TaxLine {
    pub description: String,
    pub quantity: Decimal,
    pub rate: Decimal,
    pub tax_rate: Decimal,
    pub discount: Decimal,
}

/// Per-line result, retained even for zero-tax lines.
#[derive(Debug, Clone, Serialize)]
pub struct TaxLineAmounts {
    pub description: String,
    pub quantity: Decimal,
    pub rate: Decimal,
    pub tax_rate: Decimal,
    pub base_amount: Decimal,
    pub cgst: Decimal,
    pub sgst: Decimal,
    pub igst: Decimal,
    pub gross: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaxSplit {
    pub subtotal: Decimal,
    pub discount_total: Decimal,
    pub cgst: Decimal,
    pub sgst: Decimal,
    pub igst: Decimal,
    pub tax_total: Decimal,
    pub round_off: Decimal,
    pub grand_total: Decimal,
    pub intra_state: bool,
    pub lines: Vec<TaxLineAmounts>,
}

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;
const TWO: Decimal = Decimal::TWO;

/// Compute the GST split for a set of lines.
///
/// Jurisdiction codes are trimmed and upper-cased before comparison. Equal
/// codes select the intra-state CGST/SGST split; differing codes select
/// IGST. A missing code on either side defaults to the intra-state split.
pub fn compute_split(
    lines: &[TaxLine],
    seller_state: &str,
    buyer_state: &str,
) -> Result<TaxSplit, AppError> {
    if lines.is_empty() {
        return Err(AppError::ValidationError(
            "at least one line item is required".to_string(),
        ));
    }

    let seller = seller_state.trim().to_uppercase();
    let buyer = buyer_state.trim().to_uppercase();
    let intra_state = seller.is_empty() || buyer.is_empty() || seller == buyer;

    let mut subtotal = Decimal::ZERO;
    let mut discount_total = Decimal::ZERO;
    let mut cgst = Decimal::ZERO;
    let mut sgst = Decimal::ZERO;
    let mut igst = Decimal::ZERO;
    let mut breakdown = Vec::with_capacity(lines.len());

    for line in lines {
        if line.quantity < Decimal::ZERO {
            return Err(AppError::ValidationError(format!(
                "negative quantity on line '{}'",
                line.description
            )));
        }
        if line.rate < Decimal::ZERO {
            return Err(AppError::ValidationError(format!(
                "negative rate on line '{}'",
                line.description
            )));
        }
        if line.tax_rate < Decimal::ZERO {
            return Err(AppError::ValidationError(format!(
                "negative tax rate on line '{}'",
                line.description
            )));
        }
        if line.discount < Decimal::ZERO {
            return Err(AppError::ValidationError(format!(
                "negative discount on line '{}'",
                line.description
            )));
        }

        let base = line.quantity * line.rate;
        // Discount reduces the taxable base, floored at zero.
        let taxable = (base - line.discount).max(Decimal::ZERO);
        subtotal += base;
        discount_total += base - taxable;

        let (line_cgst, line_sgst, line_igst) = if intra_state {
            let half = (taxable * line.tax_rate / HUNDRED) / TWO;
            cgst += half;
            sgst += half;
            (half, half, Decimal::ZERO)
        } else {
            let full = taxable * line.tax_rate / HUNDRED;
            igst += full;
            (Decimal::ZERO, Decimal::ZERO, full)
        };

        breakdown.push(TaxLineAmounts {
            description: line.description.clone(),
            quantity: line.quantity,
            rate: line.rate,
            tax_rate: line.tax_rate,
            base_amount: base,
            cgst: line_cgst,
            sgst: line_sgst,
            igst: line_igst,
            gross: taxable + line_cgst + line_sgst + line_igst,
        });
    }

    let tax_total = cgst + sgst + igst;
    let raw_total = subtotal - discount_total + tax_total;
    let grand_total = round_half_up(raw_total);
    let round_off = grand_total - raw_total;

    Ok(TaxSplit {
        subtotal,
        discount_total,
        cgst,
        sgst,
        igst,
        tax_total,
        round_off,
        grand_total,
        intra_state,
        lines: breakdown,
    })
}

/// Round to two decimal places, half away from zero.
///
/// Invoicing convention requires half-up; the default banker's rounding
/// would turn 0.125 into 0.12 instead of 0.13.
pub fn round_half_up(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn line(qty: &str, rate: &str, tax_rate: &str) -> TaxLine {
        TaxLine {
            description: "test item".to_string(),
            quantity: dec(qty),
            rate: dec(rate),
            tax_rate: dec(tax_rate),
            discount: Decimal::ZERO,
        }
    }

    #[test]
    fn intra_state_splits_tax_equally() {
        let split = compute_split(&[line("2", "100", "18")], "27", "27").unwrap();

        assert_eq!(split.subtotal, dec("200"));
        assert_eq!(split.cgst, dec("18"));
        assert_eq!(split.sgst, dec("18"));
        assert_eq!(split.igst, Decimal::ZERO);
        assert_eq!(split.grand_total, dec("236.00"));
        assert!(split.intra_state);
    }

    #[test]
    fn inter_state_uses_single_igst_leg() {
        let split = compute_split(&[line("2", "100", "18")], "27", "29").unwrap();

        assert_eq!(split.cgst, Decimal::ZERO);
        assert_eq!(split.sgst, Decimal::ZERO);
        assert_eq!(split.igst, dec("36"));
        assert_eq!(split.grand_total, dec("236.00"));
        assert!(!split.intra_state);
    }

    #[test]
    fn cgst_always_equals_sgst() {
        let lines = [
            line("3", "33.33", "18"),
            line("1", "14.99", "5"),
            line("7", "250", "28"),
        ];
        let split = compute_split(&lines, "KA", "KA").unwrap();

        assert_eq!(split.cgst, split.sgst);
        assert_eq!(split.igst, Decimal::ZERO);
    }

    #[test]
    fn inter_state_total_matches_intra_state_total() {
        let lines = [line("3", "33.33", "18"), line("1", "14.99", "5")];
        let intra = compute_split(&lines, "27", "27").unwrap();
        let inter = compute_split(&lines, "27", "29").unwrap();

        assert_eq!(inter.igst, intra.cgst + intra.sgst);
        assert_eq!(inter.grand_total, intra.grand_total);
    }

    #[test]
    fn grand_total_identity_holds_exactly() {
        let lines = [
            line("3", "33.33", "18"),
            line("2", "9.99", "12"),
            line("1", "0.01", "28"),
        ];
        let split = compute_split(&lines, "27", "29").unwrap();

        assert_eq!(
            split.grand_total,
            split.subtotal - split.discount_total + split.tax_total + split.round_off
        );
        assert!(split.round_off.abs() < dec("0.01"));
        // The rounded total carries exactly two decimal places.
        assert_eq!(split.grand_total, round_half_up(split.grand_total));
    }

    #[test]
    fn rounds_half_away_from_zero() {
        // 3 * 33.33 * 1.18 = 118.0282... per line; craft a .005 boundary.
        assert_eq!(round_half_up(dec("236.005")), dec("236.01"));
        assert_eq!(round_half_up(dec("236.004")), dec("236.00"));
        assert_eq!(round_half_up(dec("-236.005")), dec("-236.01"));
    }

    #[test]
    fn empty_state_codes_default_to_intra_state() {
        let split = compute_split(&[line("1", "100", "18")], "", "").unwrap();
        assert!(split.intra_state);
        assert_eq!(split.cgst, dec("9"));

        let split = compute_split(&[line("1", "100", "18")], "27", "").unwrap();
        assert!(split.intra_state);
    }

    #[test]
    fn state_codes_compared_case_insensitively() {
        let split = compute_split(&[line("1", "100", "18")], " ka ", "KA").unwrap();
        assert!(split.intra_state);
    }

    #[test]
    fn zero_quantity_lines_are_kept_in_breakdown() {
        let lines = [line("0", "100", "18"), line("2", "50", "5")];
        let split = compute_split(&lines, "27", "27").unwrap();

        assert_eq!(split.lines.len(), 2);
        assert_eq!(split.lines[0].base_amount, Decimal::ZERO);
        assert_eq!(split.lines[0].cgst, Decimal::ZERO);
        assert_eq!(split.subtotal, dec("100"));
    }

    #[test]
    fn line_discount_reduces_taxable_base() {
        let mut discounted = line("2", "100", "18");
        discounted.discount = dec("50");
        let split = compute_split(&[discounted], "27", "27").unwrap();

        // Tax applies to 150, not 200.
        assert_eq!(split.subtotal, dec("200"));
        assert_eq!(split.discount_total, dec("50"));
        assert_eq!(split.cgst, dec("13.50"));
        assert_eq!(split.grand_total, dec("177.00"));
        assert_eq!(
            split.grand_total,
            split.subtotal - split.discount_total + split.tax_total + split.round_off
        );
    }

    #[test]
    fn discount_larger_than_base_floors_at_zero() {
        let mut discounted = line("1", "100", "18");
        discounted.discount = dec("500");
        let split = compute_split(&[discounted], "27", "27").unwrap();

        assert_eq!(split.discount_total, dec("100"));
        assert_eq!(split.tax_total, Decimal::ZERO);
        assert_eq!(split.grand_total, Decimal::ZERO);
    }

    #[test]
    fn rejects_negative_inputs() {
        assert!(compute_split(&[line("-1", "100", "18")], "27", "27").is_err());
        assert!(compute_split(&[line("1", "-100", "18")], "27", "27").is_err());
        assert!(compute_split(&[line("1", "100", "-18")], "27", "27").is_err());
        assert!(compute_split(&[], "27", "27").is_err());
    }
}
