//! Funding-rate arithmetic.

use crate::decimal::Decimal;
use crate::types::{EngineResult, PositionSide};

/// `clamp(damping × (mark − index) / index, −max_rate, max_rate)`.
/// A non-positive index yields a zero rate rather than an abort; the oracle
/// feeding it is the broken party, not the block.
pub fn funding_rate(
    mark: Decimal,
    index: Decimal,
    damping: Decimal,
    max_rate: Decimal,
) -> EngineResult<Decimal> {
    if !index.is_positive() {
        return Ok(Decimal::ZERO);
    }
    let premium = mark.safe_sub(index)?.safe_div(index)?;
    let rate = damping.safe_mul(premium)?;
    Ok(rate.clamp(max_rate.neg(), max_rate))
}

/// Signed cash delta for one position: longs pay a positive rate, shorts
/// are the symmetric counterparty.
pub fn funding_payment(
    side: PositionSide,
    notional: Decimal,
    rate: Decimal,
) -> EngineResult<Decimal> {
    let transfer = notional.safe_mul(rate)?;
    Ok(match side {
        PositionSide::Long => transfer.neg(),
        PositionSide::Short => transfer,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{FUNDING_DAMPING, MAX_FUNDING_RATE};

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn test_rate_at_seed_numbers() {
        // mark 3060, index 3000 -> 0.03 * 60/3000 = 0.0006
        let rate = funding_rate(dec("3060"), dec("3000"), FUNDING_DAMPING, MAX_FUNDING_RATE)
            .unwrap();
        assert_eq!(rate, dec("0.0006"));
    }

    #[test]
    fn test_rate_clamps() {
        let rate = funding_rate(dec("6000"), dec("3000"), FUNDING_DAMPING, MAX_FUNDING_RATE)
            .unwrap();
        assert_eq!(rate, dec("0.001"));
        let rate = funding_rate(dec("1000"), dec("3000"), FUNDING_DAMPING, MAX_FUNDING_RATE)
            .unwrap();
        assert_eq!(rate, dec("-0.001"));
    }

    #[test]
    fn test_mark_equals_index_is_zero() {
        let rate = funding_rate(dec("3000"), dec("3000"), FUNDING_DAMPING, MAX_FUNDING_RATE)
            .unwrap();
        assert_eq!(rate, Decimal::ZERO);
    }

    #[test]
    fn test_payment_symmetry() {
        let rate = dec("0.0006");
        let notional = dec("30600");
        let long = funding_payment(PositionSide::Long, notional, rate).unwrap();
        let short = funding_payment(PositionSide::Short, notional, rate).unwrap();
        assert_eq!(long, dec("-18.36"));
        assert_eq!(short, dec("18.36"));
        assert_eq!(long.safe_add(short).unwrap(), Decimal::ZERO);
    }
}
