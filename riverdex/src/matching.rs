//! Order intake and matching: validation, time-in-force semantics, fill
//! application, fee accounting.
//!
//! Matching is two-phase. `plan_match` reads the book without touching it;
//! the plan is then committed fill by fill. FOK and post-only rejections
//! therefore never leave a trace on the book, and the transaction snapshot
//! in the engine guarantees the same for any later failure.

use borsh::{BorshDeserialize, BorshSerialize};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::book::{BookOrder, MatchPlan};
use crate::conditional::ConditionalParams;
use crate::decimal::Decimal;
use crate::engine::Engine;
use crate::events::EngineEvent;
use crate::market::Market;
use crate::types::{
    EngineError, EngineResult, MarginMode, MarketId, OrderFlags, OrderId, OrderStatus, OrderType,
    Side, TimeInForce, TradeId, TraderId,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderParams {
    pub trader: TraderId,
    pub market: MarketId,
    pub side: Side,
    pub order_type: OrderType,
    pub price: Option<Decimal>,
    pub quantity: Decimal,
    pub time_in_force: TimeInForce,
    pub flags: OrderFlags,
    pub trigger_price: Option<Decimal>,
    pub client_order_id: Option<u64>,
}

impl OrderParams {
    pub fn limit(
        trader: impl Into<String>,
        market: impl Into<String>,
        side: Side,
        price: Decimal,
        quantity: Decimal,
    ) -> OrderParams {
        OrderParams {
            trader: TraderId::new(trader),
            market: MarketId::new(market),
            side,
            order_type: OrderType::Limit,
            price: Some(price),
            quantity,
            time_in_force: TimeInForce::Gtc,
            flags: OrderFlags::default(),
            trigger_price: None,
            client_order_id: None,
        }
    }

    pub fn market(
        trader: impl Into<String>,
        market: impl Into<String>,
        side: Side,
        quantity: Decimal,
    ) -> OrderParams {
        OrderParams {
            trader: TraderId::new(trader),
            market: MarketId::new(market),
            side,
            order_type: OrderType::Market,
            price: None,
            quantity,
            time_in_force: TimeInForce::Ioc,
            flags: OrderFlags::default(),
            trigger_price: None,
            client_order_id: None,
        }
    }

    pub fn with_tif(mut self, tif: TimeInForce) -> OrderParams {
        self.time_in_force = tif;
        self
    }

    pub fn reduce_only(mut self) -> OrderParams {
        self.flags.reduce_only = true;
        self
    }

    pub fn hidden(mut self) -> OrderParams {
        self.flags.hidden = true;
        self
    }

    /// Reinterprets a conditional-typed `PlaceOrder` as a conditional
    /// placement. The trigger price is mandatory there.
    pub(crate) fn into_conditional(self) -> EngineResult<ConditionalParams> {
        let trigger_price = self.trigger_price.ok_or(EngineError::InvalidTriggerPrice)?;
        Ok(ConditionalParams {
            trader: self.trader,
            market: self.market,
            side: self.side,
            order_type: self.order_type,
            limit_price: self.price,
            quantity: self.quantity,
            trigger_price,
            reduce_only: self.flags.reduce_only,
        })
    }

    /// True for order types that cross without a price bound.
    fn is_market_like(&self) -> bool {
        matches!(
            self.order_type,
            OrderType::Market | OrderType::StopLoss | OrderType::TakeProfit
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Order {
    pub order_id: OrderId,
    pub client_order_id: Option<u64>,
    pub trader: TraderId,
    pub market: MarketId,
    pub side: Side,
    pub order_type: OrderType,
    pub price: Option<Decimal>,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    pub status: OrderStatus,
    pub time_in_force: TimeInForce,
    pub flags: OrderFlags,
    pub trigger_price: Option<Decimal>,
    /// Isolated collateral reserved for the resting remainder.
    pub locked_margin: Decimal,
    pub created_at: i64,
    pub sequence: u64,
}

impl Order {
    pub fn remaining(&self) -> Decimal {
        self.quantity
            .safe_sub(self.filled_quantity)
            .unwrap_or(Decimal::ZERO)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: TradeId,
    pub market: MarketId,
    pub maker_order: OrderId,
    pub taker_order: OrderId,
    pub maker_trader: TraderId,
    pub taker_trader: TraderId,
    pub price: Decimal,
    pub quantity: Decimal,
    /// As charged; a maker rebate shows up negative.
    pub maker_fee: Decimal,
    pub taker_fee: Decimal,
    pub timestamp: i64,
    pub block_height: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub trades: Vec<Trade>,
    pub filled_quantity: Decimal,
    pub remaining_quantity: Decimal,
    pub status: OrderStatus,
}

/// How the engine settles the aggressing side of a plan.
pub(crate) struct TakerSettlement<'a> {
    pub order_id: OrderId,
    pub trader: &'a TraderId,
    pub side: Side,
    /// Liquidation closes skip the taker fee; the penalty replaces it.
    pub charge_taker_fee: bool,
    /// Liquidation handles the liquidated position itself.
    pub update_taker_position: bool,
}

impl Engine {
    // ---- public order operations ---------------------------------------

    pub(crate) fn place_order(
        &mut self,
        params: OrderParams,
    ) -> EngineResult<(OrderId, MatchResult)> {
        self.execute_order(params)
    }

    pub(crate) fn cancel_order(
        &mut self,
        trader: &TraderId,
        order_id: OrderId,
    ) -> EngineResult<()> {
        let order = self.orders.get(&order_id).ok_or(EngineError::OrderNotFound)?;
        if &order.trader != trader {
            return Err(EngineError::NotOrderOwner);
        }
        self.cancel_resting(order_id)
    }

    /// Cancels a live order regardless of ownership (engine-internal path:
    /// scale-parent cancellation, liquidation cleanup).
    pub(crate) fn cancel_resting(&mut self, order_id: OrderId) -> EngineResult<()> {
        let order = self.orders.get(&order_id).ok_or(EngineError::OrderNotFound)?;
        if order.status.is_closed() {
            return Err(EngineError::OrderAlreadyClosed);
        }
        let market = order.market.clone();
        let trader = order.trader.clone();
        let locked = order.locked_margin;

        self.book_mut(&market)?.cancel(order_id)?;
        if locked.is_positive() {
            self.ledger.release_margin(&trader, locked)?;
        }
        let order = self
            .orders
            .get_mut(&order_id)
            .ok_or(EngineError::OrderNotFound)?;
        order.locked_margin = Decimal::ZERO;
        order.status = OrderStatus::Cancelled;
        self.events.emit(
            self.block_height,
            EngineEvent::OrderCancelled {
                order_id,
                market,
                trader,
            },
        );
        Ok(())
    }

    /// Cancel-and-replace: the remainder of the old order is cancelled and a
    /// fresh order (new id, new sequence) goes through the full intake path.
    pub(crate) fn modify_order(
        &mut self,
        trader: &TraderId,
        order_id: OrderId,
        new_price: Option<Decimal>,
        new_quantity: Option<Decimal>,
    ) -> EngineResult<(OrderId, MatchResult)> {
        let order = self.orders.get(&order_id).ok_or(EngineError::OrderNotFound)?;
        if &order.trader != trader {
            return Err(EngineError::NotOrderOwner);
        }
        if order.status.is_closed() {
            return Err(EngineError::OrderAlreadyClosed);
        }
        let params = OrderParams {
            trader: trader.clone(),
            market: order.market.clone(),
            side: order.side,
            order_type: OrderType::Limit,
            price: new_price.or(order.price),
            quantity: new_quantity.unwrap_or(order.remaining()),
            time_in_force: order.time_in_force,
            flags: order.flags,
            trigger_price: None,
            client_order_id: order.client_order_id,
        };
        self.cancel_resting(order_id)?;
        self.execute_order(params)
    }

    /// Entry point for orders derived in the trigger phase (conditionals,
    /// TWAP children). Same semantics as user orders.
    pub(crate) fn execute_triggered(
        &mut self,
        queued: crate::engine::QueuedOrder,
    ) -> EngineResult<OrderId> {
        let twap_id = queued.twap_id;
        let (order_id, result) = self.execute_order(queued.params)?;
        if let Some(twap_id) = twap_id {
            self.twap_child_completed(twap_id, &result)?;
        }
        Ok(order_id)
    }

    // ---- intake and matching -------------------------------------------

    fn execute_order(&mut self, params: OrderParams) -> EngineResult<(OrderId, MatchResult)> {
        let market = self.market(&params.market)?;
        market.check_accepts_orders(params.flags.reduce_only)?;

        let market_like = params.is_market_like();
        if market_like && params.time_in_force == TimeInForce::PostOnly {
            return Err(EngineError::PostOnlyCrossed);
        }
        let limit_price = if market_like {
            None
        } else {
            let price = params.price.ok_or(EngineError::InvalidTick)?;
            market.check_price_alignment(price)?;
            Some(price)
        };
        market.check_quantity_alignment(params.quantity)?;
        market.check_order_size(params.quantity)?;

        // Reduce-only caps at the live opposite position.
        let quantity = if params.flags.reduce_only {
            let capacity =
                self.positions
                    .reduce_capacity(&market.id, &params.trader, params.side);
            if capacity.is_zero() {
                return Err(EngineError::ReduceOnlyNoPosition);
            }
            params.quantity.min(capacity)
        } else {
            self.check_position_cap(&market, &params)?;
            self.check_initial_margin(&market, &params, limit_price)?;
            params.quantity
        };

        let margin_mode = self.ledger.ensure(&params.trader).margin_mode;
        let order_id = self.counters.next_order_id();
        let sequence = self.book_mut(&market.id)?.next_sequence();

        let mut order = Order {
            order_id,
            client_order_id: params.client_order_id,
            trader: params.trader.clone(),
            market: market.id.clone(),
            side: params.side,
            order_type: params.order_type,
            price: limit_price,
            quantity,
            filled_quantity: Decimal::ZERO,
            status: OrderStatus::Open,
            time_in_force: params.time_in_force,
            flags: params.flags,
            trigger_price: params.trigger_price,
            locked_margin: Decimal::ZERO,
            created_at: self.block_time,
            sequence,
        };
        self.events.emit(
            self.block_height,
            EngineEvent::OrderPlaced {
                order_id,
                market: market.id.clone(),
                trader: params.trader.clone(),
                side: params.side,
                quantity,
                price: limit_price,
            },
        );

        let plan = {
            let positions = &self.positions;
            let market_id = &market.id;
            let maker_limit = move |resting: &BookOrder| {
                if resting.reduce_only {
                    positions
                        .reduce_capacity(market_id, &resting.trader, resting.side)
                        .min(resting.remaining)
                } else {
                    resting.remaining
                }
            };
            self.book(&market.id)?.plan_match_with(
                params.side,
                quantity,
                limit_price,
                &params.trader,
                &maker_limit,
            )?
        };

        match params.time_in_force {
            TimeInForce::PostOnly => {
                if !plan.fills.is_empty() {
                    return Err(EngineError::PostOnlyCrossed);
                }
            }
            TimeInForce::Fok => {
                if plan.remaining.is_positive() {
                    return Err(EngineError::FokUnfillable);
                }
            }
            TimeInForce::Gtc | TimeInForce::Ioc => {}
        }

        let settlement = TakerSettlement {
            order_id,
            trader: &params.trader,
            side: params.side,
            charge_taker_fee: true,
            update_taker_position: true,
        };
        let trades = self.apply_plan(&market, &settlement, &plan)?;
        order.filled_quantity = plan.filled;

        let rests = !market_like
            && plan.remaining.is_positive()
            && matches!(
                params.time_in_force,
                TimeInForce::Gtc | TimeInForce::PostOnly
            );
        if rests {
            let price = limit_price.ok_or(EngineError::InvalidTick)?;
            if margin_mode == MarginMode::Isolated && !params.flags.reduce_only {
                let reservation = price
                    .safe_mul(plan.remaining)?
                    .safe_mul(market.initial_margin_rate)?;
                self.ledger.lock_margin(&params.trader, reservation)?;
                order.locked_margin = reservation;
            }
            self.book_mut(&market.id)?.insert(BookOrder {
                order_id,
                trader: params.trader.clone(),
                side: params.side,
                price,
                remaining: plan.remaining,
                hidden: params.flags.hidden,
                reduce_only: params.flags.reduce_only,
                sequence,
            });
            order.status = if plan.filled.is_positive() {
                OrderStatus::PartiallyFilled
            } else {
                OrderStatus::Open
            };
        } else {
            order.status = if plan.remaining.is_zero() {
                OrderStatus::Filled
            } else {
                // IOC remainder, or a market order that ran out of book.
                OrderStatus::Cancelled
            };
        }

        debug!(
            "order {order_id} on {}: filled {} remaining {} -> {:?}",
            market.id, plan.filled, plan.remaining, order.status
        );
        let status = order.status;
        self.orders.insert(order_id, order);
        Ok((
            order_id,
            MatchResult {
                trades,
                filled_quantity: plan.filled,
                remaining_quantity: plan.remaining,
                status,
            },
        ))
    }

    fn check_position_cap(&self, market: &Market, params: &OrderParams) -> EngineResult<()> {
        let prospective = match self.positions.get(&market.id, &params.trader) {
            None => params.quantity,
            Some(position) if position.side == params.side.position_side() => {
                position.size.safe_add(params.quantity)?
            }
            Some(position) => {
                if params.quantity <= position.size {
                    position.size
                } else {
                    params.quantity.safe_sub(position.size)?
                }
            }
        };
        if prospective > market.max_position {
            return Err(EngineError::PositionSizeExceeded);
        }
        Ok(())
    }

    /// Initial-margin gate on the exposure the order can add. Reference
    /// price: the limit price, else mark, else best opposite level; with
    /// none of those the order cannot fill and the gate is moot.
    fn check_initial_margin(
        &mut self,
        market: &Market,
        params: &OrderParams,
        limit_price: Option<Decimal>,
    ) -> EngineResult<()> {
        let exposure = match self.positions.get(&market.id, &params.trader) {
            None => params.quantity,
            Some(position) if position.side == params.side.position_side() => params.quantity,
            Some(position) => {
                if params.quantity <= position.size {
                    Decimal::ZERO
                } else {
                    params.quantity.safe_sub(position.size)?
                }
            }
        };
        if exposure.is_zero() {
            return Ok(());
        }
        let reference = limit_price
            .or_else(|| self.mark_price(&market.id))
            .or_else(|| {
                let book = self.books.get(&market.id)?;
                match params.side {
                    Side::Buy => book.best_ask().map(|(p, _)| p),
                    Side::Sell => book.best_bid().map(|(p, _)| p),
                }
            });
        let Some(reference) = reference else {
            return Ok(());
        };
        let required = exposure
            .safe_mul(reference)?
            .safe_mul(market.initial_margin_rate)?;

        let (mode, balance, free) = {
            let account = self.ledger.ensure(&params.trader);
            (account.margin_mode, account.balance, account.free_balance())
        };
        match mode {
            MarginMode::Isolated => {
                if free < required {
                    return Err(EngineError::InsufficientMargin);
                }
            }
            MarginMode::Cross => {
                let summary = self.cross_summary_for(&params.trader)?;
                let equity = crate::math::margin::cross_equity(balance, &summary)?;
                let headroom = equity.safe_sub(summary.initial)?;
                if headroom < required {
                    return Err(EngineError::InsufficientMargin);
                }
            }
        }
        Ok(())
    }

    /// Position, margin-lock and realized-PnL settlement for one party of a
    /// fill. Shared by book matching and the off-book liquidation closes.
    pub(crate) fn settle_leg(
        &mut self,
        market: &Market,
        trader: &TraderId,
        order_side: Side,
        quantity: Decimal,
        price: Decimal,
    ) -> EngineResult<()> {
        let mode = self.ledger.ensure(trader).margin_mode;
        let effect = self.positions.apply_fill(
            market,
            trader,
            order_side,
            quantity,
            price,
            mode,
            self.block_time,
        )?;
        if effect.margin_locked.is_positive() {
            self.ledger.lock_margin(trader, effect.margin_locked)?;
        }
        if effect.margin_released.is_positive() {
            self.ledger.release_margin(trader, effect.margin_released)?;
        }
        if !effect.realized_pnl.is_zero() {
            self.settle_cash(&market.id, trader, effect.realized_pnl)?;
        }
        Ok(())
    }

    /// Commits a fill plan: book state, order records, both sides'
    /// positions, cash and fees, trade records, events.
    pub(crate) fn apply_plan(
        &mut self,
        market: &Market,
        taker: &TakerSettlement<'_>,
        plan: &MatchPlan,
    ) -> EngineResult<Vec<Trade>> {
        let mut trades = Vec::with_capacity(plan.fills.len());
        let mut taker_outstanding = plan.filled;

        for fill in &plan.fills {
            let maker_remaining = self
                .book_mut(&market.id)?
                .apply_fill(fill.maker_order_id, fill.quantity)?;
            let notional = fill.price.safe_mul(fill.quantity)?;

            // Maker order record and reservation release.
            let maker_order = self
                .orders
                .get_mut(&fill.maker_order_id)
                .ok_or(EngineError::OrderNotFound)?;
            maker_order.filled_quantity =
                maker_order.filled_quantity.safe_add(fill.quantity)?;
            maker_order.status = if maker_remaining.is_zero() {
                OrderStatus::Filled
            } else {
                OrderStatus::PartiallyFilled
            };
            let release = if maker_order.locked_margin.is_positive() {
                let slice = if maker_remaining.is_zero() {
                    maker_order.locked_margin
                } else {
                    notional
                        .safe_mul(market.initial_margin_rate)?
                        .min(maker_order.locked_margin)
                };
                maker_order.locked_margin = maker_order.locked_margin.safe_sub(slice)?;
                slice
            } else {
                Decimal::ZERO
            };
            if release.is_positive() {
                self.ledger.release_margin(&fill.maker, release)?;
            }

            // Maker position and cash.
            self.settle_leg(
                market,
                &fill.maker,
                taker.side.opposite(),
                fill.quantity,
                fill.price,
            )?;

            // Maker fee; a negative rate is a rebate paid by the fund.
            let maker_fee = notional.safe_mul(market.maker_fee_rate)?;
            if maker_fee.is_positive() {
                self.settle_cash(&market.id, &fill.maker, maker_fee.neg())?;
                self.fund_credit(&market.id, maker_fee)?;
            } else if maker_fee.is_negative() {
                let rebate = self.fund_draw(&market.id, maker_fee.neg())?;
                self.ledger.credit(&fill.maker, rebate)?;
            }

            // Taker side.
            if taker.update_taker_position {
                self.settle_leg(market, taker.trader, taker.side, fill.quantity, fill.price)?;
            }
            let taker_fee = if taker.charge_taker_fee {
                let fee = notional.safe_mul(market.taker_fee_rate)?;
                if fee.is_positive() {
                    self.settle_cash(&market.id, taker.trader, fee.neg())?;
                    self.fund_credit(&market.id, fee)?;
                }
                fee
            } else {
                Decimal::ZERO
            };

            taker_outstanding = taker_outstanding.safe_sub(fill.quantity)?;

            let trade_id = self.counters.next_trade_id();
            let trade = Trade {
                trade_id,
                market: market.id.clone(),
                maker_order: fill.maker_order_id,
                taker_order: taker.order_id,
                maker_trader: fill.maker.clone(),
                taker_trader: taker.trader.clone(),
                price: fill.price,
                quantity: fill.quantity,
                maker_fee,
                taker_fee,
                timestamp: self.block_time,
                block_height: self.block_height,
            };
            self.events.emit(
                self.block_height,
                EngineEvent::Trade {
                    trade_id,
                    market: market.id.clone(),
                    maker_order: fill.maker_order_id,
                    taker_order: taker.order_id,
                    price: fill.price,
                    quantity: fill.quantity,
                },
            );
            self.events.emit(
                self.block_height,
                EngineEvent::OrderFilled {
                    order_id: fill.maker_order_id,
                    market: market.id.clone(),
                    trader: fill.maker.clone(),
                    quantity: fill.quantity,
                    price: fill.price,
                    remaining: maker_remaining,
                },
            );
            self.events.emit(
                self.block_height,
                EngineEvent::OrderFilled {
                    order_id: taker.order_id,
                    market: market.id.clone(),
                    trader: taker.trader.clone(),
                    quantity: fill.quantity,
                    price: fill.price,
                    remaining: taker_outstanding,
                },
            );
            self.trades.push(trade.clone());
            trades.push(trade);
        }
        Ok(trades)
    }
}
