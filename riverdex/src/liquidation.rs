//! Three-tier liquidation: market-order close, partial close with
//! cool-down, and the insurance-fund / auto-deleveraging backstop.

use borsh::{BorshDeserialize, BorshSerialize};
use log::{error, info};
use serde::{Deserialize, Serialize};

use crate::book::BookOrder;
use crate::constants::{
    LIQUIDATION_COOLDOWN_SECS, LIQUIDATION_PENALTY_RATE, LIQUIDATOR_SHARE,
    PARTIAL_LIQUIDATION_FRACTION, PARTIAL_LIQUIDATION_THRESHOLD,
};
use crate::decimal::Decimal;
use crate::engine::{backstop_vault, protocol_ledger, Engine};
use crate::events::EngineEvent;
use crate::market::Market;
use crate::matching::{Order, TakerSettlement};
use crate::math::margin;
use crate::position::Position;
use crate::types::{
    EngineError, EngineResult, LiquidationTier, MarginMode, MarketId, OrderFlags, OrderStatus,
    OrderType, PositionSide, TimeInForce, TraderId,
};

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Liquidation {
    pub liquidation_id: u64,
    pub trader: TraderId,
    pub market: MarketId,
    pub tier: LiquidationTier,
    pub size_liquidated: Decimal,
    pub liquidation_price: Decimal,
    pub penalty: Decimal,
    pub timestamp: i64,
}

impl Engine {
    /// Phase 5: walk every position in `(market, trader)` order and push
    /// unhealthy ones through the tiers. Each liquidation is isolated
    /// behind its own snapshot; a failed one logs and leaves state intact.
    pub(crate) fn run_liquidation_phase(&mut self) {
        let keys: Vec<(MarketId, TraderId)> = self
            .positions
            .iter()
            .map(|(key, _)| key.clone())
            .collect();

        for (market_id, trader) in keys {
            if trader == backstop_vault() {
                continue;
            }
            if self.positions.get(&market_id, &trader).is_none() {
                // closed earlier in this scan (ADL counterparty)
                continue;
            }
            if let Some(until) = self.cooldowns.get(&(market_id.clone(), trader.clone())) {
                if self.block_time < *until {
                    continue;
                }
            }
            let Some(mark) = self.mark_price(&market_id) else {
                continue;
            };
            let Ok(market) = self.market(&market_id) else {
                continue;
            };
            match self.position_is_healthy(&market, &trader, mark) {
                Ok(true) => continue,
                Ok(false) => {}
                Err(err) => {
                    error!("health check failed for {trader} on {market_id}: {err}");
                    continue;
                }
            }

            let snapshot = self.clone();
            if let Err(err) = self.liquidate_position(&market, &trader, mark) {
                *self = snapshot;
                error!("liquidation of {trader} on {market_id} failed: {err}");
            }
        }
    }

    pub(crate) fn position_is_healthy(
        &self,
        market: &Market,
        trader: &TraderId,
        mark: Decimal,
    ) -> EngineResult<bool> {
        let Some(position) = self.positions.get(&market.id, trader) else {
            return Ok(true);
        };
        match position.margin_mode {
            MarginMode::Isolated => {
                margin::isolated_healthy(position, mark, market.maintenance_margin_rate)
            }
            MarginMode::Cross => {
                let summary = self.cross_summary_for(trader)?;
                let balance = self
                    .ledger
                    .get(trader)
                    .map(|a| a.balance)
                    .unwrap_or(Decimal::ZERO);
                margin::cross_healthy(balance, &summary)
            }
        }
    }

    fn liquidate_position(
        &mut self,
        market: &Market,
        trader: &TraderId,
        mark: Decimal,
    ) -> EngineResult<()> {
        // Free the trader's resting orders first; their reservations are
        // collateral the close can use.
        let open_orders = self.book(&market.id)?.orders_of(trader);
        for order_id in open_orders {
            self.cancel_resting(order_id)?;
        }

        let position = self
            .positions
            .get(&market.id, trader)
            .ok_or(EngineError::OrderNotFound)?
            .clone();
        let notional = margin::position_notional(&position, mark)?;

        let (tier, target) = if notional > PARTIAL_LIQUIDATION_THRESHOLD {
            let step = position
                .size
                .safe_mul(PARTIAL_LIQUIDATION_FRACTION)?
                .align_down(market.lot_size)?
                .max(market.lot_size)
                .min(position.size);
            (LiquidationTier::Partial, step)
        } else {
            (LiquidationTier::Market, position.size)
        };
        let close_side = position.side.closing_side();

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
            self.book(&market.id)?
                .plan_match_with(close_side, target, None, trader, &maker_limit)?
        };

        if plan.filled.is_positive() {
            let order_id = self.counters.next_order_id();
            let sequence = self.book_mut(&market.id)?.next_sequence();
            let settlement = TakerSettlement {
                order_id,
                trader,
                side: close_side,
                charge_taker_fee: false,
                update_taker_position: true,
            };
            let trades = self.apply_plan(market, &settlement, &plan)?;
            self.orders.insert(
                order_id,
                Order {
                    order_id,
                    client_order_id: None,
                    trader: trader.clone(),
                    market: market.id.clone(),
                    side: close_side,
                    order_type: OrderType::Market,
                    price: None,
                    quantity: target,
                    filled_quantity: plan.filled,
                    status: if plan.remaining.is_zero() {
                        OrderStatus::Filled
                    } else {
                        OrderStatus::Cancelled
                    },
                    time_in_force: TimeInForce::Ioc,
                    flags: OrderFlags {
                        reduce_only: true,
                        post_only: false,
                        hidden: false,
                    },
                    trigger_price: None,
                    locked_margin: Decimal::ZERO,
                    created_at: self.block_time,
                    sequence,
                },
            );

            let mut close_notional = Decimal::ZERO;
            for trade in &trades {
                close_notional = close_notional.safe_add(trade.price.safe_mul(trade.quantity)?)?;
            }
            let vwap = close_notional.safe_div(plan.filled)?;

            // Penalty on the liquidated notional at mark; what the account
            // cannot pay is simply not collected.
            let penalty = plan
                .filled
                .safe_mul(mark)?
                .safe_mul(LIQUIDATION_PENALTY_RATE)?;
            let balance = self
                .ledger
                .get(trader)
                .map(|a| a.balance)
                .unwrap_or(Decimal::ZERO);
            let collected = penalty.min(balance);
            if collected.is_positive() {
                self.ledger.debit(trader, collected)?;
                let liquidator_cut = collected.safe_mul(LIQUIDATOR_SHARE)?;
                self.ledger.credit(&protocol_ledger(), liquidator_cut)?;
                self.fund_credit(&market.id, collected.safe_sub(liquidator_cut)?)?;
            }

            info!(
                "liquidated {} of {trader} on {} at vwap {vwap} (tier {:?})",
                plan.filled, market.id, tier
            );
            self.record_liquidation(trader, &market.id, tier, plan.filled, vwap, collected);

            if tier == LiquidationTier::Partial {
                self.cooldowns.insert(
                    (market.id.clone(), trader.clone()),
                    self.block_time + LIQUIDATION_COOLDOWN_SECS,
                );
            }
        }

        // Book liquidity exhausted with the position still under water:
        // the backstop takes over.
        if plan.remaining.is_positive()
            && self.positions.get(&market.id, trader).is_some()
            && !self.position_is_healthy(market, trader, mark)?
        {
            self.backstop(market, trader, mark)?;
        }
        Ok(())
    }

    /// Tier 3. Insurance-funded branch: the backstop vault assumes the
    /// position at mark and the fund absorbs the bankrupt remainder.
    /// Depleted-fund branch: auto-deleveraging against the opposite side at
    /// the bankruptcy price.
    fn backstop(&mut self, market: &Market, trader: &TraderId, mark: Decimal) -> EngineResult<()> {
        let position = self
            .positions
            .get(&market.id, trader)
            .ok_or(EngineError::OrderNotFound)?
            .clone();
        let equity = self.position_equity(&position, mark)?;
        let shortfall = if equity.is_negative() {
            equity.neg()
        } else {
            Decimal::ZERO
        };
        let fund = self.get_insurance_fund(&market.id);

        if fund >= shortfall {
            let close_side = position.side.closing_side();
            let open_side = close_side.opposite();
            // Trader out at mark; settle_cash draws the shortfall from the
            // fund when the balance cannot absorb the realized loss.
            self.settle_leg(market, trader, close_side, position.size, mark)?;
            self.settle_leg(market, &backstop_vault(), open_side, position.size, mark)?;
            info!(
                "backstop vault assumed {} {:?} on {} from {trader} at {mark}",
                position.size, position.side, market.id
            );
            self.record_liquidation(
                trader,
                &market.id,
                LiquidationTier::Backstop,
                position.size,
                mark,
                Decimal::ZERO,
            );
            return Ok(());
        }

        // ADL. Counterparties close at the bankruptcy price, worst-ranked
        // first by (ROI, leverage, trader id).
        self.events.emit(
            self.block_height,
            EngineEvent::OrderRejected {
                market: market.id.clone(),
                trader: trader.clone(),
                client_order_id: None,
                code: EngineError::InsuranceFundDepleted.code(),
            },
        );
        // Negative equity pushes the close beyond mark: the counterparties
        // give up exactly the profit the bankrupt margin cannot pay.
        let bankruptcy =
            margin::bankruptcy_price(position.side, mark, equity, position.size)?;
        let close_side = position.side.closing_side();
        let mut remaining = position.size;

        for candidate in self.rank_adl_candidates(market, trader, position.side, mark)? {
            if remaining.is_zero() {
                break;
            }
            let quantity = candidate.size.min(remaining);
            self.settle_leg(
                market,
                &candidate.trader,
                candidate.side.closing_side(),
                quantity,
                bankruptcy,
            )?;
            self.settle_leg(market, trader, close_side, quantity, bankruptcy)?;
            remaining = remaining.safe_sub(quantity)?;
            self.record_liquidation(
                &candidate.trader,
                &market.id,
                LiquidationTier::Adl,
                quantity,
                bankruptcy,
                Decimal::ZERO,
            );
        }

        if remaining.is_positive() {
            // Open interest balance makes this unreachable.
            return Err(EngineError::InsuranceFundDepleted);
        }
        info!(
            "adl closed {} of {trader} on {} at bankruptcy {bankruptcy}",
            position.size, market.id
        );
        self.record_liquidation(
            trader,
            &market.id,
            LiquidationTier::Adl,
            position.size,
            bankruptcy,
            Decimal::ZERO,
        );
        Ok(())
    }

    /// Per-position equity used by the backstop decision. Cross positions
    /// are attributed a balance share proportional to their maintenance
    /// requirement.
    fn position_equity(&self, position: &Position, mark: Decimal) -> EngineResult<Decimal> {
        let pnl = margin::position_unrealized_pnl(position, mark)?;
        match position.margin_mode {
            MarginMode::Isolated => position.margin.safe_add(pnl),
            MarginMode::Cross => {
                let summary = self.cross_summary_for(&position.trader_id)?;
                let balance = self
                    .ledger
                    .get(&position.trader_id)
                    .map(|a| a.balance)
                    .unwrap_or(Decimal::ZERO);
                if summary.maintenance.is_zero() {
                    return balance.safe_add(pnl);
                }
                let market = self.registry.get(&position.market_id)?;
                let own_maintenance = margin::maintenance_margin(
                    margin::position_notional(position, mark)?,
                    market.maintenance_margin_rate,
                )?;
                let share = balance
                    .safe_mul(own_maintenance)?
                    .safe_div(summary.maintenance)?;
                share.safe_add(pnl)
            }
        }
    }

    fn rank_adl_candidates(
        &self,
        market: &Market,
        liquidated: &TraderId,
        liquidated_side: PositionSide,
        mark: Decimal,
    ) -> EngineResult<Vec<AdlCandidate>> {
        let opposite = liquidated_side.opposite();
        let mut candidates = Vec::new();
        for position in self.positions.iter_market(&market.id) {
            if position.side != opposite || &position.trader_id == liquidated {
                continue;
            }
            let pnl = margin::position_unrealized_pnl(position, mark)?;
            let entry_notional = position.entry_price.safe_mul(position.size)?;
            let margin_basis = entry_notional.safe_mul(market.initial_margin_rate)?;
            let roi = if margin_basis.is_zero() {
                Decimal::ZERO
            } else {
                pnl.safe_div(margin_basis)?
            };
            let equity = self.position_equity(position, mark)?;
            let leverage = if equity.is_positive() {
                margin::position_notional(position, mark)?.safe_div(equity)?
            } else {
                Decimal::int(1_000_000_000)
            };
            candidates.push(AdlCandidate {
                trader: position.trader_id.clone(),
                side: position.side,
                size: position.size,
                roi,
                leverage,
            });
        }
        candidates.sort_by(|a, b| {
            b.roi
                .cmp(&a.roi)
                .then(b.leverage.cmp(&a.leverage))
                .then(a.trader.cmp(&b.trader))
        });
        Ok(candidates)
    }

    fn record_liquidation(
        &mut self,
        trader: &TraderId,
        market: &MarketId,
        tier: LiquidationTier,
        size: Decimal,
        price: Decimal,
        penalty: Decimal,
    ) {
        let liquidation_id = self.counters.next_liquidation_id();
        self.liquidations.push(Liquidation {
            liquidation_id,
            trader: trader.clone(),
            market: market.clone(),
            tier,
            size_liquidated: size,
            liquidation_price: price,
            penalty,
            timestamp: self.block_time,
        });
        self.events.emit(
            self.block_height,
            EngineEvent::Liquidation {
                liquidation_id,
                market: market.clone(),
                trader: trader.clone(),
                tier,
                size,
                price,
                penalty,
            },
        );
    }
}

#[derive(Debug, Clone)]
struct AdlCandidate {
    trader: TraderId,
    side: PositionSide,
    size: Decimal,
    roi: Decimal,
    leverage: Decimal,
}
