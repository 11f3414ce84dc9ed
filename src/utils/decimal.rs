//! Decimal arithmetic utilities for financial calculations.

use rust_decimal::{Decimal, MathematicalOps};

/// Round a decimal to a specific number of decimal places.
pub fn round_to_precision(value: Decimal, decimals: u32) -> Decimal {
    value.round_dp(decimals)
}

/// Safe division that returns zero if divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator == Decimal::ZERO {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

/// Arithmetic mean, `None` for an empty slice.
pub fn mean(values: &[Decimal]) -> Option<Decimal> {
    if values.is_empty() {
        return None;
    }
    let sum: Decimal = values.iter().copied().sum();
    Some(sum / Decimal::from(values.len()))
}

/// Upper median (element at `len / 2` after sorting), `None` for an empty slice.
pub fn median(values: &[Decimal]) -> Option<Decimal> {
    let mut sorted = values.to_vec();
    sorted.sort();
    sorted.get(sorted.len() / 2).copied()
}

/// Sample standard deviation, `None` with fewer than two values.
pub fn std_dev(values: &[Decimal]) -> Option<Decimal> {
    if values.len() < 2 {
        return None;
    }
    let avg = mean(values)?;
    let sum_sq: Decimal = values.iter().map(|v| (*v - avg) * (*v - avg)).sum();
    let variance = sum_sq / Decimal::from(values.len() - 1);
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_round_to_precision() {
        assert_eq!(round_to_precision(dec!(58299.999), 2), dec!(58300.00));
        assert_eq!(round_to_precision(dec!(59724.994), 2), dec!(59724.99));
    }

    #[test]
    fn test_safe_div() {
        assert_eq!(safe_div(dec!(10), Decimal::ZERO), Decimal::ZERO);
        assert_eq!(safe_div(dec!(500), dec!(10000)), dec!(0.05));
    }

    #[test]
    fn test_mean_median() {
        let values = [dec!(0.02), dec!(-0.01), dec!(0.05)];
        assert_eq!(mean(&values), Some(dec!(0.02)));
        assert_eq!(median(&values), Some(dec!(0.02)));
        assert_eq!(mean(&[]), None);
        assert_eq!(median(&[]), None);
    }

    #[test]
    fn test_std_dev() {
        assert_eq!(std_dev(&[dec!(1)]), None);
        // values 2, 4, 4, 4, 5, 5, 7, 9: sample variance = 32 / 7
        let values = [
            dec!(2), dec!(4), dec!(4), dec!(4), dec!(5), dec!(5), dec!(7), dec!(9),
        ];
        let sd = std_dev(&values).unwrap();
        assert!((sd - dec!(2.138)).abs() < dec!(0.001));
    }
}
