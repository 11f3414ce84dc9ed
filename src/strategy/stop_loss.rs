//! Volatility-scaled stop-loss calculation.

use rust_decimal::Decimal;

use super::StrategyProfile;
use crate::error::{LedgerError, LedgerResult};
use crate::utils::round_to_precision;

/// Stop prices are quoted in cents.
const STOP_PRICE_DP: u32 = 2;

/// Compute the long-side stop price for a new position.
///
/// `stop = entry - multiplier * volatility`, floored at zero and rounded to cents.
pub fn compute_stop(
    entry_price: Decimal,
    volatility: Decimal,
    profile: &StrategyProfile,
) -> LedgerResult<Decimal> {
    if entry_price <= Decimal::ZERO {
        return Err(LedgerError::InvalidInput(format!(
            "entry price must be positive, got {entry_price}"
        )));
    }
    if volatility < Decimal::ZERO {
        return Err(LedgerError::InvalidInput(format!(
            "volatility must be non-negative, got {volatility}"
        )));
    }

    // A distance past the decimal range is past any entry price too
    let raw = match profile.volatility_multiplier.checked_mul(volatility) {
        Some(distance) => entry_price - distance,
        None => Decimal::ZERO,
    };
    Ok(round_to_precision(raw.max(Decimal::ZERO), STOP_PRICE_DP))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::{StrategyCatalog, StrategyKind};
    use rust_decimal_macros::dec;

    #[test]
    fn test_stop_per_strategy() {
        let catalog = StrategyCatalog::default();

        let dca = compute_stop(dec!(60000), dec!(850), catalog.get(StrategyKind::Dca)).unwrap();
        let swing =
            compute_stop(dec!(60000), dec!(850), catalog.get(StrategyKind::Swing)).unwrap();
        let day = compute_stop(dec!(60000), dec!(850), catalog.get(StrategyKind::Day)).unwrap();

        assert_eq!(dca, dec!(58300));
        assert_eq!(swing, dec!(58725));
        assert_eq!(day, dec!(59150));
    }

    #[test]
    fn test_stop_floored_at_zero() {
        let catalog = StrategyCatalog::default();
        let stop = compute_stop(dec!(100), dec!(80), catalog.get(StrategyKind::Dca)).unwrap();
        assert_eq!(stop, Decimal::ZERO);
    }

    #[test]
    fn test_zero_volatility_stops_at_entry() {
        let catalog = StrategyCatalog::default();
        let stop = compute_stop(dec!(61234.567), Decimal::ZERO, catalog.get(StrategyKind::Swing))
            .unwrap();
        assert_eq!(stop, dec!(61234.57));
    }

    #[test]
    fn test_huge_volatility_floors_instead_of_panicking() {
        let catalog = StrategyCatalog::default();
        let stop = compute_stop(dec!(60000), Decimal::MAX, catalog.get(StrategyKind::Dca)).unwrap();
        assert_eq!(stop, Decimal::ZERO);
    }

    #[test]
    fn test_invalid_inputs() {
        let catalog = StrategyCatalog::default();
        let profile = catalog.get(StrategyKind::Dca);

        assert!(matches!(
            compute_stop(Decimal::ZERO, dec!(10), profile),
            Err(LedgerError::InvalidInput(_))
        ));
        assert!(matches!(
            compute_stop(dec!(100), dec!(-1), profile),
            Err(LedgerError::InvalidInput(_))
        ));
    }
}
