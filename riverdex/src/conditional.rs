//! Conditional orders, TWAP schedules and scale fan-out.
//!
//! All three live outside the book until the trigger phase (or, for scale,
//! placement) turns them into ordinary orders.

use borsh::{BorshDeserialize, BorshSerialize};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::decimal::Decimal;
use crate::engine::{Engine, QueuedOrder};
use crate::events::EngineEvent;
use crate::matching::{MatchResult, OrderParams};
use crate::types::{
    ConditionalId, EngineError, EngineResult, MarketId, OrderFlags, OrderId, OrderType,
    ScaleDistribution, ScaleId, Side, TimeInForce, TraderId, TriggerDirection, TwapId,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionalParams {
    pub trader: TraderId,
    pub market: MarketId,
    pub side: Side,
    pub order_type: OrderType,
    pub limit_price: Option<Decimal>,
    pub quantity: Decimal,
    pub trigger_price: Decimal,
    pub reduce_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct ConditionalOrder {
    pub conditional_id: ConditionalId,
    pub trader: TraderId,
    pub market: MarketId,
    pub side: Side,
    pub order_type: OrderType,
    pub limit_price: Option<Decimal>,
    pub quantity: Decimal,
    pub trigger_price: Decimal,
    pub direction: TriggerDirection,
    pub reduce_only: bool,
    pub created_at: i64,
}

/// Stop-loss sells and take-profit buys arm below the market; their mirror
/// images arm above it.
fn trigger_direction(order_type: OrderType, side: Side) -> EngineResult<TriggerDirection> {
    match (order_type, side) {
        (OrderType::StopLoss | OrderType::StopLimit, Side::Sell) => Ok(TriggerDirection::Below),
        (OrderType::StopLoss | OrderType::StopLimit, Side::Buy) => Ok(TriggerDirection::Above),
        (OrderType::TakeProfit | OrderType::TakeProfitLimit, Side::Sell) => {
            Ok(TriggerDirection::Above)
        }
        (OrderType::TakeProfit | OrderType::TakeProfitLimit, Side::Buy) => {
            Ok(TriggerDirection::Below)
        }
        _ => Err(EngineError::InvalidTriggerPrice),
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub enum ScheduleStatus {
    Active,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TwapParams {
    pub trader: TraderId,
    pub market: MarketId,
    pub side: Side,
    pub total_quantity: Decimal,
    pub slice_count: u32,
    pub interval_secs: i64,
    pub slippage_tolerance: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct TwapSchedule {
    pub twap_id: TwapId,
    pub trader: TraderId,
    pub market: MarketId,
    pub side: Side,
    pub total_quantity: Decimal,
    pub executed_quantity: Decimal,
    pub slice_quantity: Decimal,
    pub interval_secs: i64,
    pub next_fire_time: i64,
    pub slippage_tolerance: Decimal,
    /// Catch-up multiplier for the next child, 1..=3. An under-filled child
    /// bumps it; a fully-filled child resets it.
    pub escalation: u32,
    pub status: ScheduleStatus,
}

impl TwapSchedule {
    pub fn remaining(&self) -> Decimal {
        self.total_quantity
            .safe_sub(self.executed_quantity)
            .unwrap_or(Decimal::ZERO)
    }

    /// A rejected child counts as a full under-fill.
    pub fn mark_rejected(&mut self) {
        self.escalation = (self.escalation + 1).min(crate::constants::TWAP_MAX_ESCALATION);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleParams {
    pub trader: TraderId,
    pub market: MarketId,
    pub side: Side,
    pub total_quantity: Decimal,
    pub price_start: Decimal,
    pub price_end: Decimal,
    pub child_count: u32,
    pub distribution: ScaleDistribution,
}

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct ScaleParent {
    pub scale_id: ScaleId,
    pub trader: TraderId,
    pub market: MarketId,
    pub side: Side,
    pub total_quantity: Decimal,
    pub price_start: Decimal,
    pub price_end: Decimal,
    pub child_count: u32,
    pub distribution: ScaleDistribution,
    pub children: Vec<OrderId>,
    pub status: ScheduleStatus,
}

impl Engine {
    // ---- conditionals ---------------------------------------------------

    pub(crate) fn place_conditional(
        &mut self,
        params: ConditionalParams,
    ) -> EngineResult<ConditionalId> {
        let market = self.market(&params.market)?;
        market.check_accepts_orders(params.reduce_only)?;

        let direction = trigger_direction(params.order_type, params.side)?;
        if !params.trigger_price.is_positive()
            || !params.trigger_price.is_multiple_of(market.tick_size)?
        {
            return Err(EngineError::InvalidTriggerPrice);
        }
        let limit_price = if params.order_type.triggers_to_market() {
            None
        } else {
            let price = params.limit_price.ok_or(EngineError::InvalidTick)?;
            market.check_price_alignment(price)?;
            Some(price)
        };
        market.check_quantity_alignment(params.quantity)?;
        market.check_order_size(params.quantity)?;

        let conditional_id = self.counters.next_conditional_id();
        self.conditionals.insert(
            conditional_id,
            ConditionalOrder {
                conditional_id,
                trader: params.trader.clone(),
                market: params.market.clone(),
                side: params.side,
                order_type: params.order_type,
                limit_price,
                quantity: params.quantity,
                trigger_price: params.trigger_price,
                direction,
                reduce_only: params.reduce_only,
                created_at: self.block_time,
            },
        );
        self.events.emit(
            self.block_height,
            EngineEvent::ConditionalPlaced {
                conditional_id,
                market: params.market,
                trader: params.trader,
            },
        );
        Ok(conditional_id)
    }

    pub(crate) fn cancel_conditional(
        &mut self,
        trader: &TraderId,
        conditional_id: ConditionalId,
    ) -> EngineResult<()> {
        let conditional = self
            .conditionals
            .get(&conditional_id)
            .ok_or(EngineError::OrderNotFound)?;
        if &conditional.trader != trader {
            return Err(EngineError::NotOrderOwner);
        }
        let conditional = self
            .conditionals
            .remove(&conditional_id)
            .ok_or(EngineError::OrderNotFound)?;
        self.events.emit(
            self.block_height,
            EngineEvent::ConditionalCancelled {
                conditional_id,
                market: conditional.market,
                trader: conditional.trader,
            },
        );
        Ok(())
    }

    // ---- trigger phase --------------------------------------------------

    /// Phase 2: collect conditionals whose trigger condition holds against
    /// this block's mark and TWAP slices that are due. The returned orders
    /// run after this block's transactions, in the order returned here:
    /// conditionals by `(market, trigger_price, id)`, then TWAP children by
    /// `(market, id)`.
    pub(crate) fn run_trigger_phase(&mut self) -> Vec<QueuedOrder> {
        let mut queued = Vec::new();

        let mut triggered: Vec<(MarketId, Decimal, ConditionalId)> = Vec::new();
        for conditional in self.conditionals.values() {
            let Some(mark) = self.mark_price(&conditional.market) else {
                continue;
            };
            let Ok(market) = self.market(&conditional.market) else {
                continue;
            };
            // A paused market keeps its conditionals armed but dormant.
            if market.check_accepts_orders(conditional.reduce_only).is_err() {
                continue;
            }
            let fires = match conditional.direction {
                TriggerDirection::Above => mark >= conditional.trigger_price,
                TriggerDirection::Below => mark <= conditional.trigger_price,
            };
            if fires {
                triggered.push((
                    conditional.market.clone(),
                    conditional.trigger_price,
                    conditional.conditional_id,
                ));
            }
        }
        triggered.sort();

        for (_, _, conditional_id) in triggered {
            let Some(conditional) = self.conditionals.remove(&conditional_id) else {
                continue;
            };
            debug!(
                "conditional {conditional_id} fires on {} at trigger {}",
                conditional.market, conditional.trigger_price
            );
            let time_in_force = if conditional.order_type.triggers_to_market() {
                TimeInForce::Ioc
            } else {
                TimeInForce::Gtc
            };
            queued.push(QueuedOrder {
                params: OrderParams {
                    trader: conditional.trader.clone(),
                    market: conditional.market.clone(),
                    side: conditional.side,
                    order_type: conditional.order_type,
                    price: conditional.limit_price,
                    quantity: conditional.quantity,
                    time_in_force,
                    flags: OrderFlags {
                        reduce_only: conditional.reduce_only,
                        post_only: false,
                        hidden: false,
                    },
                    trigger_price: Some(conditional.trigger_price),
                    client_order_id: None,
                },
                conditional_id: Some(conditional_id),
                twap_id: None,
            });
        }

        let due_twaps: Vec<TwapId> = self
            .twaps
            .values()
            .filter(|s| s.status == ScheduleStatus::Active && s.next_fire_time <= self.block_time)
            .map(|s| s.twap_id)
            .collect();
        for twap_id in due_twaps {
            if let Some(order) = self.fire_twap_slice(twap_id) {
                queued.push(order);
            }
        }

        queued
    }

    fn fire_twap_slice(&mut self, twap_id: TwapId) -> Option<QueuedOrder> {
        let block_time = self.block_time;
        let block_height = self.block_height;
        let (market_ok, child) = {
            let schedule = self.twaps.get(&twap_id)?;
            let market = self.market(&schedule.market).ok()?;
            let market_ok = market.check_accepts_orders(false).is_ok();
            let escalated = schedule
                .slice_quantity
                .safe_mul(Decimal::int(schedule.escalation as i64))
                .ok()?;
            let child = schedule
                .remaining()
                .min(escalated)
                .align_down(market.lot_size)
                .ok()?;
            (market_ok, child)
        };
        if !market_ok {
            // Hold the schedule; it fires once the market accepts orders.
            return None;
        }

        let schedule = self.twaps.get_mut(&twap_id)?;
        schedule.next_fire_time += schedule.interval_secs;
        if child.is_zero() {
            // Remainder below one lot: nothing left worth slicing.
            schedule.status = ScheduleStatus::Completed;
            let market = schedule.market.clone();
            self.events
                .emit(block_height, EngineEvent::TwapCompleted { twap_id, market });
            return None;
        }
        let params = OrderParams {
            trader: schedule.trader.clone(),
            market: schedule.market.clone(),
            side: schedule.side,
            order_type: OrderType::Market,
            price: None,
            quantity: child,
            time_in_force: TimeInForce::Ioc,
            flags: OrderFlags::default(),
            trigger_price: None,
            client_order_id: None,
        };
        let market = schedule.market.clone();
        debug!("twap {twap_id} fires {child} on {market} at {block_time}");
        self.events.emit(
            block_height,
            EngineEvent::TwapFired {
                twap_id,
                market,
                order_id: 0, // assigned when the child executes
                quantity: child,
            },
        );
        Some(QueuedOrder {
            params,
            conditional_id: None,
            twap_id: Some(twap_id),
        })
    }

    /// Bookkeeping after a TWAP child order finished matching.
    pub(crate) fn twap_child_completed(
        &mut self,
        twap_id: TwapId,
        result: &MatchResult,
    ) -> EngineResult<()> {
        let mark = self
            .twaps
            .get(&twap_id)
            .and_then(|s| self.mark_price(&s.market));
        let Some(schedule) = self.twaps.get_mut(&twap_id) else {
            return Ok(());
        };
        let child_quantity = result
            .filled_quantity
            .safe_add(result.remaining_quantity)?;
        schedule.executed_quantity = schedule
            .executed_quantity
            .safe_add(result.filled_quantity)?;

        // Slippage gate: child VWAP against this block's mark.
        if let (Some(mark), false) = (mark, result.trades.is_empty()) {
            let mut notional = Decimal::ZERO;
            for trade in &result.trades {
                notional = notional.safe_add(trade.price.safe_mul(trade.quantity)?)?;
            }
            let vwap = notional.safe_div(result.filled_quantity)?;
            let deviation = vwap.safe_sub(mark)?.abs().safe_div(mark)?;
            if deviation > schedule.slippage_tolerance {
                schedule.status = ScheduleStatus::Cancelled;
                let market = schedule.market.clone();
                self.events.emit(
                    self.block_height,
                    EngineEvent::TwapCancelled { twap_id, market },
                );
                return Ok(());
            }
        }

        if schedule.remaining().is_zero() {
            schedule.status = ScheduleStatus::Completed;
            let market = schedule.market.clone();
            self.events.emit(
                self.block_height,
                EngineEvent::TwapCompleted { twap_id, market },
            );
            return Ok(());
        }

        // Escalate on under-fill, reset on a full fill.
        let tolerated = child_quantity.safe_mul(
            Decimal::ONE.safe_sub(schedule.slippage_tolerance)?,
        )?;
        if result.filled_quantity < tolerated {
            schedule.escalation =
                (schedule.escalation + 1).min(crate::constants::TWAP_MAX_ESCALATION);
        } else {
            schedule.escalation = 1;
        }
        Ok(())
    }

    // ---- TWAP placement -------------------------------------------------

    pub(crate) fn place_twap(&mut self, params: TwapParams) -> EngineResult<TwapId> {
        let market = self.market(&params.market)?;
        market.check_accepts_orders(false)?;
        market.check_quantity_alignment(params.total_quantity)?;
        if params.slice_count == 0
            || params.interval_secs <= 0
            || params.slippage_tolerance.is_negative()
            || params.slippage_tolerance >= Decimal::ONE
        {
            return Err(EngineError::InvalidAmount);
        }
        let slice_quantity = params
            .total_quantity
            .safe_div(Decimal::int(params.slice_count as i64))?
            .align_down(market.lot_size)?;
        if slice_quantity.is_zero() {
            return Err(EngineError::OrderSizeOutOfRange);
        }

        let twap_id = self.counters.next_twap_id();
        self.twaps.insert(
            twap_id,
            TwapSchedule {
                twap_id,
                trader: params.trader.clone(),
                market: params.market.clone(),
                side: params.side,
                total_quantity: params.total_quantity,
                executed_quantity: Decimal::ZERO,
                slice_quantity,
                interval_secs: params.interval_secs,
                next_fire_time: self.block_time + params.interval_secs,
                slippage_tolerance: params.slippage_tolerance,
                escalation: 1,
                status: ScheduleStatus::Active,
            },
        );
        self.events.emit(
            self.block_height,
            EngineEvent::TwapPlaced {
                twap_id,
                market: params.market,
                trader: params.trader,
            },
        );
        Ok(twap_id)
    }

    pub(crate) fn cancel_twap(&mut self, trader: &TraderId, twap_id: TwapId) -> EngineResult<()> {
        let schedule = self.twaps.get_mut(&twap_id).ok_or(EngineError::OrderNotFound)?;
        if &schedule.trader != trader {
            return Err(EngineError::NotOrderOwner);
        }
        if schedule.status != ScheduleStatus::Active {
            return Err(EngineError::OrderAlreadyClosed);
        }
        schedule.status = ScheduleStatus::Cancelled;
        let market = schedule.market.clone();
        self.events.emit(
            self.block_height,
            EngineEvent::TwapCancelled { twap_id, market },
        );
        Ok(())
    }

    // ---- scale orders ---------------------------------------------------

    /// Fans the parent out into limit children immediately and atomically:
    /// a rejected child rejects the whole placement (transaction snapshot).
    pub(crate) fn place_scale(
        &mut self,
        params: ScaleParams,
    ) -> EngineResult<(ScaleId, Vec<OrderId>)> {
        let market = self.market(&params.market)?;
        market.check_accepts_orders(false)?;
        market.check_quantity_alignment(params.total_quantity)?;
        market.check_price_alignment(params.price_start)?;
        market.check_price_alignment(params.price_end)?;
        if params.child_count == 0 {
            return Err(EngineError::InvalidAmount);
        }

        let count = Decimal::int(params.child_count as i64);
        let child_quantity = params
            .total_quantity
            .safe_div(count)?
            .align_down(market.lot_size)?;
        if child_quantity.is_zero() || child_quantity < market.min_order {
            return Err(EngineError::OrderSizeOutOfRange);
        }
        let last_quantity = params.total_quantity.safe_sub(
            child_quantity.safe_mul(count.safe_sub(Decimal::ONE)?)?,
        )?;

        let scale_id = self.counters.next_scale_id();
        let mut children = Vec::with_capacity(params.child_count as usize);
        for i in 0..params.child_count {
            let price = scale_child_price(&params, i)?.align_down(market.tick_size)?;
            let quantity = if i + 1 == params.child_count {
                last_quantity
            } else {
                child_quantity
            };
            let (order_id, _) = self.place_order(OrderParams {
                trader: params.trader.clone(),
                market: params.market.clone(),
                side: params.side,
                order_type: OrderType::Limit,
                price: Some(price),
                quantity,
                time_in_force: TimeInForce::Gtc,
                flags: OrderFlags::default(),
                trigger_price: None,
                client_order_id: None,
            })?;
            children.push(order_id);
        }

        self.scales.insert(
            scale_id,
            ScaleParent {
                scale_id,
                trader: params.trader.clone(),
                market: params.market.clone(),
                side: params.side,
                total_quantity: params.total_quantity,
                price_start: params.price_start,
                price_end: params.price_end,
                child_count: params.child_count,
                distribution: params.distribution,
                children: children.clone(),
                status: ScheduleStatus::Active,
            },
        );
        self.events.emit(
            self.block_height,
            EngineEvent::ScalePlaced {
                scale_id,
                market: params.market,
                trader: params.trader,
                children: children.clone(),
            },
        );
        Ok((scale_id, children))
    }

    pub(crate) fn cancel_scale(&mut self, trader: &TraderId, scale_id: ScaleId) -> EngineResult<()> {
        let parent = self.scales.get(&scale_id).ok_or(EngineError::OrderNotFound)?;
        if &parent.trader != trader {
            return Err(EngineError::NotOrderOwner);
        }
        if parent.status != ScheduleStatus::Active {
            return Err(EngineError::OrderAlreadyClosed);
        }
        let children = parent.children.clone();
        let market = parent.market.clone();
        for order_id in children {
            match self.cancel_resting(order_id) {
                Ok(()) | Err(EngineError::OrderAlreadyClosed) => {}
                Err(err) => return Err(err),
            }
        }
        let parent = self.scales.get_mut(&scale_id).ok_or(EngineError::OrderNotFound)?;
        parent.status = ScheduleStatus::Cancelled;
        self.events.emit(
            self.block_height,
            EngineEvent::ScaleCancelled { scale_id, market },
        );
        Ok(())
    }
}

/// Child `i` of a scale ladder. Linear spacing steps evenly from start to
/// end; exponential spacing doubles each step's share of the range.
fn scale_child_price(params: &ScaleParams, i: u32) -> EngineResult<Decimal> {
    if params.child_count == 1 || params.price_start == params.price_end {
        return Ok(params.price_start);
    }
    let range = params.price_end.safe_sub(params.price_start)?;
    let index = Decimal::int(i as i64);
    // Multiply before dividing so evenly-divisible ladders stay exact.
    match params.distribution {
        ScaleDistribution::Linear => {
            let offset = range
                .safe_mul(index)?
                .safe_div(Decimal::int(params.child_count as i64 - 1))?;
            params.price_start.safe_add(offset)
        }
        ScaleDistribution::Exponential => {
            // range * (2^i - 1) / (2^(n-1) - 1)
            let mut numerator = Decimal::ONE;
            for _ in 0..i {
                numerator = numerator.safe_mul(Decimal::int(2))?;
            }
            numerator = numerator.safe_sub(Decimal::ONE)?;
            let mut denominator = Decimal::ONE;
            for _ in 0..(params.child_count - 1) {
                denominator = denominator.safe_mul(Decimal::int(2))?;
            }
            denominator = denominator.safe_sub(Decimal::ONE)?;
            let offset = range.safe_mul(numerator)?.safe_div(denominator)?;
            params.price_start.safe_add(offset)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::MarkIndex;
    use crate::types::OrderStatus;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn engine() -> Engine {
        let mut engine = Engine::with_default_markets(TraderId::new("gov"));
        engine.prices.insert(
            MarketId::new("BTC-USDC"),
            MarkIndex {
                mark: dec("50000"),
                index: dec("50000"),
            },
        );
        for name in ["alice", "bob"] {
            engine
                .ledger
                .deposit(&TraderId::new(name), dec("10000000"))
                .unwrap();
        }
        engine
    }

    fn stop_loss_sell(trigger: &str) -> ConditionalParams {
        ConditionalParams {
            trader: TraderId::new("alice"),
            market: MarketId::new("BTC-USDC"),
            side: Side::Sell,
            order_type: OrderType::StopLoss,
            limit_price: None,
            quantity: dec("1"),
            trigger_price: dec(trigger),
            reduce_only: false,
        }
    }

    #[test]
    fn test_trigger_direction_table() {
        assert_eq!(
            trigger_direction(OrderType::StopLoss, Side::Sell).unwrap(),
            TriggerDirection::Below
        );
        assert_eq!(
            trigger_direction(OrderType::StopLoss, Side::Buy).unwrap(),
            TriggerDirection::Above
        );
        assert_eq!(
            trigger_direction(OrderType::TakeProfit, Side::Sell).unwrap(),
            TriggerDirection::Above
        );
        assert_eq!(
            trigger_direction(OrderType::TakeProfit, Side::Buy).unwrap(),
            TriggerDirection::Below
        );
        assert!(trigger_direction(OrderType::Limit, Side::Buy).is_err());
    }

    #[test]
    fn test_conditional_trigger_validation() {
        let mut engine = engine();
        let mut params = stop_loss_sell("49000");
        params.trigger_price = dec("49000.05"); // off-tick
        assert_eq!(
            engine.place_conditional(params),
            Err(EngineError::InvalidTriggerPrice)
        );

        let mut params = stop_loss_sell("49000");
        params.order_type = OrderType::StopLimit;
        params.limit_price = None;
        assert_eq!(engine.place_conditional(params), Err(EngineError::InvalidTick));
    }

    #[test]
    fn test_stop_loss_fires_below_mark() {
        let mut engine = engine();
        let conditional_id = engine.place_conditional(stop_loss_sell("49000")).unwrap();

        // mark above trigger: stays armed
        let queued = engine.run_trigger_phase();
        assert!(queued.is_empty());
        assert!(engine.conditionals.contains_key(&conditional_id));

        // mark at trigger: fires as an IOC market order
        engine.prices.insert(
            MarketId::new("BTC-USDC"),
            MarkIndex {
                mark: dec("49000"),
                index: dec("49000"),
            },
        );
        let queued = engine.run_trigger_phase();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].conditional_id, Some(conditional_id));
        assert_eq!(queued[0].params.order_type, OrderType::StopLoss);
        assert_eq!(queued[0].params.time_in_force, TimeInForce::Ioc);
        assert!(!engine.conditionals.contains_key(&conditional_id));
    }

    #[test]
    fn test_trigger_ordering_tuple() {
        let mut engine = engine();
        let high = engine.place_conditional(stop_loss_sell("49500")).unwrap();
        let low = engine.place_conditional(stop_loss_sell("49000")).unwrap();
        engine.prices.insert(
            MarketId::new("BTC-USDC"),
            MarkIndex {
                mark: dec("48000"),
                index: dec("48000"),
            },
        );
        let queued = engine.run_trigger_phase();
        assert_eq!(queued.len(), 2);
        // sorted by trigger price, not placement order
        assert_eq!(queued[0].conditional_id, Some(low));
        assert_eq!(queued[1].conditional_id, Some(high));
    }

    #[test]
    fn test_twap_slices_and_completion() {
        let mut engine = engine();
        engine.block_time = 100;
        let twap_id = engine
            .place_twap(TwapParams {
                trader: TraderId::new("alice"),
                market: MarketId::new("BTC-USDC"),
                side: Side::Buy,
                total_quantity: dec("0.4"),
                slice_count: 4,
                interval_secs: 60,
                slippage_tolerance: dec("0.05"),
            })
            .unwrap();
        assert_eq!(engine.twaps[&twap_id].slice_quantity, dec("0.1"));
        assert_eq!(engine.twaps[&twap_id].next_fire_time, 160);

        engine.block_time = 159;
        assert!(engine.run_trigger_phase().is_empty());

        engine.block_time = 160;
        let queued = engine.run_trigger_phase();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].params.quantity, dec("0.1"));
        assert_eq!(engine.twaps[&twap_id].next_fire_time, 220);

        // a fully-filled child keeps escalation at 1 and advances the total
        let result = MatchResult {
            trades: Vec::new(),
            filled_quantity: dec("0.1"),
            remaining_quantity: Decimal::ZERO,
            status: OrderStatus::Filled,
        };
        engine.twap_child_completed(twap_id, &result).unwrap();
        assert_eq!(engine.twaps[&twap_id].executed_quantity, dec("0.1"));
        assert_eq!(engine.twaps[&twap_id].escalation, 1);

        // an empty child escalates the next slice
        let result = MatchResult {
            trades: Vec::new(),
            filled_quantity: Decimal::ZERO,
            remaining_quantity: dec("0.1"),
            status: OrderStatus::Cancelled,
        };
        engine.twap_child_completed(twap_id, &result).unwrap();
        assert_eq!(engine.twaps[&twap_id].escalation, 2);

        engine.block_time = 220;
        let queued = engine.run_trigger_phase();
        assert_eq!(queued[0].params.quantity, dec("0.2"));
    }

    #[test]
    fn test_scale_fan_out_seed_scenario() {
        let mut engine = engine();
        let (scale_id, children) = engine
            .place_scale(ScaleParams {
                trader: TraderId::new("alice"),
                market: MarketId::new("BTC-USDC"),
                side: Side::Buy,
                total_quantity: dec("0.4"),
                price_start: dec("49000"),
                price_end: dec("49600"),
                child_count: 4,
                distribution: ScaleDistribution::Linear,
            })
            .unwrap();
        assert_eq!(children.len(), 4);

        let expected = ["49000", "49200", "49400", "49600"];
        for (order_id, price) in children.iter().zip(expected) {
            let order = engine.get_order(*order_id).unwrap();
            assert_eq!(order.price, Some(dec(price)));
            assert_eq!(order.quantity, dec("0.1"));
            assert_eq!(order.status, OrderStatus::Open);
        }

        engine
            .cancel_scale(&TraderId::new("alice"), scale_id)
            .unwrap();
        for order_id in &children {
            assert_eq!(
                engine.get_order(*order_id).unwrap().status,
                OrderStatus::Cancelled
            );
        }
        let book = engine.book(&MarketId::new("BTC-USDC")).unwrap();
        assert!(book.is_empty());
    }

    #[test]
    fn test_scale_exponential_spacing() {
        let params = ScaleParams {
            trader: TraderId::new("alice"),
            market: MarketId::new("BTC-USDC"),
            side: Side::Buy,
            total_quantity: dec("0.4"),
            price_start: dec("49000"),
            price_end: dec("49700"),
            child_count: 4,
            distribution: ScaleDistribution::Exponential,
        };
        // weights 0, 1/7, 3/7, 1 over a 700 range
        assert_eq!(scale_child_price(&params, 0).unwrap(), dec("49000"));
        assert_eq!(scale_child_price(&params, 1).unwrap(), dec("49100"));
        assert_eq!(scale_child_price(&params, 2).unwrap(), dec("49300"));
        assert_eq!(scale_child_price(&params, 3).unwrap(), dec("49700"));
    }
}
