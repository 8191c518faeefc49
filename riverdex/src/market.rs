//! Market configuration and the registry that owns it.

use std::collections::BTreeMap;

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

use crate::decimal::Decimal;
use crate::types::{EngineError, EngineResult, MarketId, MarketStatus};

/// Creation parameters for a market. Everything here except `id`, `base` and
/// `quote` stays tunable through [`MarketPatch`].
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct MarketConfig {
    pub id: MarketId,
    pub base: String,
    pub quote: String,
    pub tick_size: Decimal,
    pub lot_size: Decimal,
    pub initial_margin_rate: Decimal,
    pub maintenance_margin_rate: Decimal,
    pub taker_fee_rate: Decimal,
    pub maker_fee_rate: Decimal,
    pub min_order: Decimal,
    pub max_order: Decimal,
    pub max_position: Decimal,
    pub funding_interval_secs: i64,
    /// Attenuates the mark/index premium in the funding rate.
    pub funding_damping: Decimal,
    /// Per-interval funding rate clamp; the floor is its negation.
    pub max_funding_rate: Decimal,
}

impl MarketConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.id.0.is_empty() || self.base.is_empty() || self.quote.is_empty() {
            return Err(EngineError::InvalidMarketConfig);
        }
        if !self.tick_size.is_positive() || !self.lot_size.is_positive() {
            return Err(EngineError::InvalidMarketConfig);
        }
        validate_rates(
            self.initial_margin_rate,
            self.maintenance_margin_rate,
            self.taker_fee_rate,
            self.maker_fee_rate,
        )?;
        if self.min_order.is_negative()
            || self.max_order < self.min_order
            || !self.max_position.is_positive()
        {
            return Err(EngineError::InvalidMarketConfig);
        }
        if !self.min_order.is_multiple_of(self.lot_size)?
            || !self.max_order.is_multiple_of(self.lot_size)?
        {
            return Err(EngineError::InvalidMarketConfig);
        }
        if self.funding_interval_secs <= 0 {
            return Err(EngineError::InvalidMarketConfig);
        }
        if self.funding_damping.is_negative()
            || self.funding_damping >= Decimal::ONE
            || self.max_funding_rate.is_negative()
            || self.max_funding_rate >= Decimal::ONE
        {
            return Err(EngineError::InvalidMarketConfig);
        }
        Ok(())
    }
}

fn validate_rates(
    initial_margin_rate: Decimal,
    maintenance_margin_rate: Decimal,
    taker_fee_rate: Decimal,
    maker_fee_rate: Decimal,
) -> EngineResult<()> {
    // 0 < mmr <= imr < 1
    if !maintenance_margin_rate.is_positive()
        || maintenance_margin_rate > initial_margin_rate
        || initial_margin_rate >= Decimal::ONE
    {
        return Err(EngineError::InvalidMarketConfig);
    }
    // taker in [0, 1); maker in (-1, 1), negative maker = rebate
    if taker_fee_rate.is_negative() || taker_fee_rate >= Decimal::ONE {
        return Err(EngineError::InvalidMarketConfig);
    }
    if maker_fee_rate >= Decimal::ONE || maker_fee_rate <= Decimal::ONE.neg() {
        return Err(EngineError::InvalidMarketConfig);
    }
    Ok(())
}

/// Tunable subset of a market. `None` leaves the field untouched.
#[derive(Debug, Default, Clone, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct MarketPatch {
    pub initial_margin_rate: Option<Decimal>,
    pub maintenance_margin_rate: Option<Decimal>,
    pub taker_fee_rate: Option<Decimal>,
    pub maker_fee_rate: Option<Decimal>,
    pub min_order: Option<Decimal>,
    pub max_order: Option<Decimal>,
    pub max_position: Option<Decimal>,
    pub funding_interval_secs: Option<i64>,
    pub funding_damping: Option<Decimal>,
    pub max_funding_rate: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Market {
    pub id: MarketId,
    pub base: String,
    pub quote: String,
    pub tick_size: Decimal,
    pub lot_size: Decimal,
    pub initial_margin_rate: Decimal,
    pub maintenance_margin_rate: Decimal,
    pub taker_fee_rate: Decimal,
    pub maker_fee_rate: Decimal,
    pub min_order: Decimal,
    pub max_order: Decimal,
    pub max_position: Decimal,
    pub funding_interval_secs: i64,
    pub funding_damping: Decimal,
    pub max_funding_rate: Decimal,
    pub status: MarketStatus,
    pub insurance_fund_id: MarketId,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Market {
    pub fn from_config(cfg: MarketConfig, now: i64) -> Market {
        let insurance_fund_id = cfg.id.clone();
        Market {
            id: cfg.id,
            base: cfg.base,
            quote: cfg.quote,
            tick_size: cfg.tick_size,
            lot_size: cfg.lot_size,
            initial_margin_rate: cfg.initial_margin_rate,
            maintenance_margin_rate: cfg.maintenance_margin_rate,
            taker_fee_rate: cfg.taker_fee_rate,
            maker_fee_rate: cfg.maker_fee_rate,
            min_order: cfg.min_order,
            max_order: cfg.max_order,
            max_position: cfg.max_position,
            funding_interval_secs: cfg.funding_interval_secs,
            funding_damping: cfg.funding_damping,
            max_funding_rate: cfg.max_funding_rate,
            status: MarketStatus::Active,
            insurance_fund_id,
            created_at: now,
            updated_at: now,
        }
    }

    /// Reported maximum leverage, `1 / initial_margin_rate`.
    pub fn max_leverage(&self) -> EngineResult<Decimal> {
        Decimal::ONE.safe_div(self.initial_margin_rate)
    }

    pub fn check_price_alignment(&self, price: Decimal) -> EngineResult<()> {
        if !price.is_positive() || !price.is_multiple_of(self.tick_size)? {
            return Err(EngineError::InvalidTick);
        }
        Ok(())
    }

    pub fn check_quantity_alignment(&self, quantity: Decimal) -> EngineResult<()> {
        if !quantity.is_positive() || !quantity.is_multiple_of(self.lot_size)? {
            return Err(EngineError::InvalidLot);
        }
        Ok(())
    }

    pub fn check_order_size(&self, quantity: Decimal) -> EngineResult<()> {
        if quantity < self.min_order || quantity > self.max_order {
            return Err(EngineError::OrderSizeOutOfRange);
        }
        Ok(())
    }

    /// Placement gate. `Paused` rejects everything; `Settling` accepts only
    /// reduce-only orders; `Inactive` never accepts.
    pub fn check_accepts_orders(&self, reduce_only: bool) -> EngineResult<()> {
        match self.status {
            MarketStatus::Active => Ok(()),
            MarketStatus::Settling if reduce_only => Ok(()),
            MarketStatus::Paused | MarketStatus::Settling => Err(EngineError::MarketPaused),
            MarketStatus::Inactive => Err(EngineError::MarketNotFound),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct MarketRegistry {
    markets: BTreeMap<MarketId, Market>,
}

impl MarketRegistry {
    pub fn new() -> MarketRegistry {
        MarketRegistry {
            markets: BTreeMap::new(),
        }
    }

    pub fn create(&mut self, cfg: MarketConfig, now: i64) -> EngineResult<&Market> {
        cfg.validate()?;
        if self.markets.contains_key(&cfg.id) {
            return Err(EngineError::MarketExists);
        }
        let id = cfg.id.clone();
        self.markets.insert(id.clone(), Market::from_config(cfg, now));
        Ok(&self.markets[&id])
    }

    pub fn update(&mut self, id: &MarketId, patch: &MarketPatch, now: i64) -> EngineResult<&Market> {
        let market = self
            .markets
            .get_mut(id)
            .ok_or(EngineError::MarketNotFound)?;

        let mut next = market.clone();
        if let Some(v) = patch.initial_margin_rate {
            next.initial_margin_rate = v;
        }
        if let Some(v) = patch.maintenance_margin_rate {
            next.maintenance_margin_rate = v;
        }
        if let Some(v) = patch.taker_fee_rate {
            next.taker_fee_rate = v;
        }
        if let Some(v) = patch.maker_fee_rate {
            next.maker_fee_rate = v;
        }
        if let Some(v) = patch.min_order {
            next.min_order = v;
        }
        if let Some(v) = patch.max_order {
            next.max_order = v;
        }
        if let Some(v) = patch.max_position {
            next.max_position = v;
        }
        if let Some(v) = patch.funding_interval_secs {
            next.funding_interval_secs = v;
        }
        if let Some(v) = patch.funding_damping {
            next.funding_damping = v;
        }
        if let Some(v) = patch.max_funding_rate {
            next.max_funding_rate = v;
        }

        validate_rates(
            next.initial_margin_rate,
            next.maintenance_margin_rate,
            next.taker_fee_rate,
            next.maker_fee_rate,
        )?;
        if next.min_order.is_negative()
            || next.max_order < next.min_order
            || !next.max_position.is_positive()
            || next.funding_interval_secs <= 0
            || next.funding_damping.is_negative()
            || next.funding_damping >= Decimal::ONE
            || next.max_funding_rate.is_negative()
            || next.max_funding_rate >= Decimal::ONE
        {
            return Err(EngineError::InvalidMarketConfig);
        }

        next.updated_at = now;
        *market = next;
        Ok(market)
    }

    pub fn set_status(
        &mut self,
        id: &MarketId,
        status: MarketStatus,
        now: i64,
    ) -> EngineResult<&Market> {
        let market = self
            .markets
            .get_mut(id)
            .ok_or(EngineError::MarketNotFound)?;
        market.status = status;
        market.updated_at = now;
        Ok(market)
    }

    pub fn get(&self, id: &MarketId) -> EngineResult<&Market> {
        self.markets.get(id).ok_or(EngineError::MarketNotFound)
    }

    pub fn contains(&self, id: &MarketId) -> bool {
        self.markets.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MarketId, &Market)> {
        self.markets.iter()
    }

    pub fn insert_loaded(&mut self, market: Market) {
        self.markets.insert(market.id.clone(), market);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::default_markets;

    fn btc() -> MarketConfig {
        default_markets().remove(0)
    }

    #[test]
    fn test_create_and_duplicate() {
        let mut registry = MarketRegistry::new();
        registry.create(btc(), 0).unwrap();
        assert_eq!(registry.create(btc(), 0), Err(EngineError::MarketExists));
    }

    #[test]
    fn test_config_invariants() {
        let mut cfg = btc();
        cfg.maintenance_margin_rate = "0.2".parse().unwrap(); // above imr
        assert_eq!(cfg.validate(), Err(EngineError::InvalidMarketConfig));

        let mut cfg = btc();
        cfg.tick_size = Decimal::ZERO;
        assert_eq!(cfg.validate(), Err(EngineError::InvalidMarketConfig));

        let mut cfg = btc();
        cfg.taker_fee_rate = Decimal::ONE;
        assert_eq!(cfg.validate(), Err(EngineError::InvalidMarketConfig));

        // maker rebate is allowed
        let mut cfg = btc();
        cfg.maker_fee_rate = "-0.0001".parse().unwrap();
        cfg.validate().unwrap();
    }

    #[test]
    fn test_alignment_boundary_is_exact() {
        let market = Market::from_config(btc(), 0);
        let on_tick: Decimal = "50000.1".parse().unwrap();
        market.check_price_alignment(on_tick).unwrap();
        // one ULP off the tick grid is a rejection, not a rounding
        let off_by_ulp = Decimal::from_scaled(on_tick.mantissa() + 1);
        assert_eq!(
            market.check_price_alignment(off_by_ulp),
            Err(EngineError::InvalidTick)
        );

        let on_lot: Decimal = "0.0001".parse().unwrap();
        market.check_quantity_alignment(on_lot).unwrap();
        let off_by_ulp = Decimal::from_scaled(on_lot.mantissa() + 1);
        assert_eq!(
            market.check_quantity_alignment(off_by_ulp),
            Err(EngineError::InvalidLot)
        );
    }

    #[test]
    fn test_max_leverage_reported() {
        let market = Market::from_config(btc(), 0);
        assert_eq!(market.max_leverage().unwrap(), Decimal::int(10));
    }

    #[test]
    fn test_status_gates() {
        let mut registry = MarketRegistry::new();
        registry.create(btc(), 0).unwrap();
        let id = MarketId::new("BTC-USDC");

        registry.set_status(&id, MarketStatus::Paused, 1).unwrap();
        let market = registry.get(&id).unwrap();
        assert_eq!(
            market.check_accepts_orders(false),
            Err(EngineError::MarketPaused)
        );
        assert_eq!(
            market.check_accepts_orders(true),
            Err(EngineError::MarketPaused)
        );

        registry.set_status(&id, MarketStatus::Settling, 2).unwrap();
        let market = registry.get(&id).unwrap();
        assert_eq!(
            market.check_accepts_orders(false),
            Err(EngineError::MarketPaused)
        );
        market.check_accepts_orders(true).unwrap();
    }

    #[test]
    fn test_update_keeps_invariants() {
        let mut registry = MarketRegistry::new();
        registry.create(btc(), 0).unwrap();
        let id = MarketId::new("BTC-USDC");

        let patch = MarketPatch {
            taker_fee_rate: Some("0.001".parse().unwrap()),
            ..MarketPatch::default()
        };
        let market = registry.update(&id, &patch, 5).unwrap();
        assert_eq!(market.taker_fee_rate, "0.001".parse().unwrap());
        assert_eq!(market.updated_at, 5);

        let bad = MarketPatch {
            maintenance_margin_rate: Some("0.5".parse().unwrap()),
            ..MarketPatch::default()
        };
        assert_eq!(
            registry.update(&id, &bad, 6),
            Err(EngineError::InvalidMarketConfig)
        );
    }
}
