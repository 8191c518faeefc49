//! Positions and the fill-application rules that maintain them.

use std::collections::BTreeMap;

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

use crate::decimal::Decimal;
use crate::market::Market;
use crate::types::{EngineResult, MarginMode, MarketId, PositionSide, Side, TraderId};

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Position {
    pub trader_id: TraderId,
    pub market_id: MarketId,
    pub side: PositionSide,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub margin: Decimal,
    pub leverage: Decimal,
    pub margin_mode: MarginMode,
    pub opened_at: i64,
    pub updated_at: i64,
}

/// Cash and margin consequences of applying one fill to the store. The
/// caller settles these against the account ledger.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FillEffect {
    pub realized_pnl: Decimal,
    /// Isolated margin newly locked for opened/added size.
    pub margin_locked: Decimal,
    /// Isolated margin released by reduced size.
    pub margin_released: Decimal,
    pub opened: bool,
    pub closed: bool,
}

impl FillEffect {
    fn merge(self, other: FillEffect) -> EngineResult<FillEffect> {
        Ok(FillEffect {
            realized_pnl: self.realized_pnl.safe_add(other.realized_pnl)?,
            margin_locked: self.margin_locked.safe_add(other.margin_locked)?,
            margin_released: self.margin_released.safe_add(other.margin_released)?,
            opened: self.opened || other.opened,
            closed: self.closed || other.closed,
        })
    }
}

/// One position per (market, trader). Key order doubles as the
/// deterministic liquidation-scan order.
#[derive(Debug, Default, Clone)]
pub struct PositionStore {
    positions: BTreeMap<(MarketId, TraderId), Position>,
}

impl PositionStore {
    pub fn new() -> PositionStore {
        PositionStore {
            positions: BTreeMap::new(),
        }
    }

    pub fn get(&self, market: &MarketId, trader: &TraderId) -> Option<&Position> {
        self.positions.get(&(market.clone(), trader.clone()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&(MarketId, TraderId), &Position)> {
        self.positions.iter()
    }

    pub fn iter_market<'a>(
        &'a self,
        market: &'a MarketId,
    ) -> impl Iterator<Item = &'a Position> + 'a {
        self.positions
            .range((market.clone(), TraderId::new(""))..)
            .take_while(move |((m, _), _)| m == market)
            .map(|(_, p)| p)
    }

    pub fn iter_trader<'a>(
        &'a self,
        trader: &'a TraderId,
    ) -> impl Iterator<Item = &'a Position> + 'a {
        self.positions
            .values()
            .filter(move |p| &p.trader_id == trader)
    }

    pub fn has_any(&self, trader: &TraderId) -> bool {
        self.iter_trader(trader).next().is_some()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Size available for reduce-only orders on `order_side`, i.e. the
    /// trader's opposite-side position size.
    pub fn reduce_capacity(
        &self,
        market: &MarketId,
        trader: &TraderId,
        order_side: Side,
    ) -> Decimal {
        match self.get(market, trader) {
            Some(pos) if pos.side == order_side.position_side().opposite() => pos.size,
            _ => Decimal::ZERO,
        }
    }

    /// Applies a fill of `quantity` at `price`, following the add / reduce /
    /// flip rule. Position records mutate here; cash stays with the caller.
    pub fn apply_fill(
        &mut self,
        market: &Market,
        trader: &TraderId,
        order_side: Side,
        quantity: Decimal,
        price: Decimal,
        margin_mode: MarginMode,
        now: i64,
    ) -> EngineResult<FillEffect> {
        let fill_side = order_side.position_side();
        let key = (market.id.clone(), trader.clone());

        let Some(position) = self.positions.get_mut(&key) else {
            let effect = self.open(market, trader, fill_side, quantity, price, margin_mode, now)?;
            return Ok(effect);
        };

        if position.side == fill_side {
            // Same side: weighted-average entry, margin for the added slice.
            let old_notional = position.entry_price.safe_mul(position.size)?;
            let add_notional = price.safe_mul(quantity)?;
            let new_size = position.size.safe_add(quantity)?;
            position.entry_price = old_notional.safe_add(add_notional)?.safe_div(new_size)?;
            position.size = new_size;
            position.updated_at = now;
            let margin_locked = match margin_mode {
                MarginMode::Isolated => {
                    let locked = add_notional.safe_mul(market.initial_margin_rate)?;
                    position.margin = position.margin.safe_add(locked)?;
                    locked
                }
                MarginMode::Cross => Decimal::ZERO,
            };
            return Ok(FillEffect {
                margin_locked,
                ..FillEffect::default()
            });
        }

        // Opposite side: realize on the overlap, flip any excess.
        let reduced = position.size.min(quantity);
        let pnl_per_unit = match position.side {
            PositionSide::Long => price.safe_sub(position.entry_price)?,
            PositionSide::Short => position.entry_price.safe_sub(price)?,
        };
        let realized_pnl = pnl_per_unit.safe_mul(reduced)?;
        let margin_released = if position.margin.is_zero() {
            Decimal::ZERO
        } else {
            position
                .margin
                .safe_mul(reduced)?
                .safe_div(position.size)?
        };
        position.margin = position.margin.safe_sub(margin_released)?;
        position.size = position.size.safe_sub(reduced)?;
        position.updated_at = now;

        let mut effect = FillEffect {
            realized_pnl,
            margin_released,
            ..FillEffect::default()
        };

        if position.size.is_zero() {
            // Residual margin from truncation goes back with the release.
            if !position.margin.is_zero() {
                effect.margin_released = effect.margin_released.safe_add(position.margin)?;
            }
            self.positions.remove(&key);
            effect.closed = true;
        }

        let excess = quantity.safe_sub(reduced)?;
        if excess.is_positive() {
            let opened =
                self.open(market, trader, fill_side, excess, price, margin_mode, now)?;
            effect = effect.merge(opened)?;
        }
        Ok(effect)
    }

    fn open(
        &mut self,
        market: &Market,
        trader: &TraderId,
        side: PositionSide,
        size: Decimal,
        price: Decimal,
        margin_mode: MarginMode,
        now: i64,
    ) -> EngineResult<FillEffect> {
        let margin = match margin_mode {
            MarginMode::Isolated => price
                .safe_mul(size)?
                .safe_mul(market.initial_margin_rate)?,
            MarginMode::Cross => Decimal::ZERO,
        };
        let position = Position {
            trader_id: trader.clone(),
            market_id: market.id.clone(),
            side,
            size,
            entry_price: price,
            margin,
            leverage: market.max_leverage()?,
            margin_mode,
            opened_at: now,
            updated_at: now,
        };
        self.positions
            .insert((market.id.clone(), trader.clone()), position);
        Ok(FillEffect {
            margin_locked: margin,
            opened: true,
            ..FillEffect::default()
        })
    }

    /// Removes a position outright (backstop takeover / full ADL).
    pub fn remove(&mut self, market: &MarketId, trader: &TraderId) -> Option<Position> {
        self.positions.remove(&(market.clone(), trader.clone()))
    }

    pub fn insert_loaded(&mut self, position: Position) {
        self.positions.insert(
            (position.market_id.clone(), position.trader_id.clone()),
            position,
        );
    }
}
