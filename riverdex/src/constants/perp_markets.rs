//! The market set installed out of the box.

use crate::decimal::Decimal;
use crate::market::MarketConfig;
use crate::types::MarketId;

use super::{DEFAULT_FUNDING_INTERVAL_SECS, FUNDING_DAMPING, MAX_FUNDING_RATE};

fn d(s: &str) -> Decimal {
    s.parse().expect("static market constant")
}

fn market(
    id: &str,
    base: &str,
    tick_size: &str,
    lot_size: &str,
    min_order: &str,
    max_order: &str,
    max_position: &str,
) -> MarketConfig {
    MarketConfig {
        id: MarketId::new(id),
        base: base.to_string(),
        quote: "USDC".to_string(),
        tick_size: d(tick_size),
        lot_size: d(lot_size),
        // 10x max leverage
        initial_margin_rate: d("0.1"),
        maintenance_margin_rate: d("0.005"),
        taker_fee_rate: d("0.0005"),
        maker_fee_rate: d("0.0002"),
        min_order: d(min_order),
        max_order: d(max_order),
        max_position: d(max_position),
        funding_interval_secs: DEFAULT_FUNDING_INTERVAL_SECS,
        funding_damping: FUNDING_DAMPING,
        max_funding_rate: MAX_FUNDING_RATE,
    }
}

pub fn default_markets() -> Vec<MarketConfig> {
    vec![
        market("BTC-USDC", "BTC", "0.1", "0.0001", "0.0001", "100", "1000"),
        market("ETH-USDC", "ETH", "0.01", "0.001", "0.001", "1000", "10000"),
        market("SOL-USDC", "SOL", "0.001", "0.01", "0.01", "50000", "500000"),
        market("ARB-USDC", "ARB", "0.0001", "0.1", "0.1", "1000000", "10000000"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_markets_valid() {
        let markets = default_markets();
        assert_eq!(markets.len(), 4);
        for cfg in &markets {
            cfg.validate().unwrap();
        }
        assert_eq!(markets[0].id, MarketId::new("BTC-USDC"));
        assert_eq!(markets[0].tick_size, d("0.1"));
        assert_eq!(markets[3].lot_size, d("0.1"));
    }
}
