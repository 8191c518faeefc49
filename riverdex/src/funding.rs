//! Periodic funding settlement between longs and shorts.

use borsh::{BorshDeserialize, BorshSerialize};
use log::info;
use serde::{Deserialize, Serialize};

use crate::decimal::Decimal;
use crate::engine::Engine;
use crate::events::EngineEvent;
use crate::math::funding::{funding_payment, funding_rate};
use crate::types::{MarketId, MarketStatus, PositionSide, TraderId};

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct FundingRate {
    pub market: MarketId,
    pub rate: Decimal,
    pub mark_price: Decimal,
    pub index_price: Decimal,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct FundingPayment {
    pub payment_id: u64,
    pub trader: TraderId,
    pub market: MarketId,
    /// Signed account delta: negative means the trader paid.
    pub amount: Decimal,
    pub rate: Decimal,
    pub timestamp: i64,
}

impl Engine {
    /// Phase 4: settle every market whose funding time has arrived. Paused
    /// and settling markets keep funding; only `Inactive` is skipped. A
    /// market with no pinned price holds until one arrives.
    pub(crate) fn run_funding_phase(&mut self) {
        let due: Vec<MarketId> = self
            .registry
            .iter()
            .filter(|(_, m)| m.status != MarketStatus::Inactive)
            .map(|(id, _)| id.clone())
            .filter(|id| {
                self.next_funding
                    .get(id)
                    .is_some_and(|next| self.block_time >= *next)
            })
            .collect();

        for market_id in due {
            if let Err(err) = self.settle_market_funding(&market_id) {
                log::error!("funding settlement failed for {market_id}: {err}");
            }
        }
    }

    fn settle_market_funding(&mut self, market_id: &MarketId) -> crate::types::EngineResult<()> {
        let Some(price) = self.prices.get(market_id).copied() else {
            return Ok(());
        };
        let market = self.market(market_id)?;
        let rate = funding_rate(
            price.mark,
            price.index,
            market.funding_damping,
            market.max_funding_rate,
        )?;

        // Snapshot first; settlement mutates balances.
        let holdings: Vec<(TraderId, PositionSide, Decimal)> = self
            .positions
            .iter_market(market_id)
            .map(|p| (p.trader_id.clone(), p.side, p.size))
            .collect();

        if !rate.is_zero() {
            for (trader, side, size) in holdings {
                let notional = size.safe_mul(price.mark)?;
                let amount = funding_payment(side, notional, rate)?;
                if amount.is_zero() {
                    continue;
                }
                self.settle_cash(market_id, &trader, amount)?;
                let payment_id = self.counters.next_funding_payment_id();
                self.funding_payments.push(FundingPayment {
                    payment_id,
                    trader: trader.clone(),
                    market: market_id.clone(),
                    amount,
                    rate,
                    timestamp: self.block_time,
                });
                self.events.emit(
                    self.block_height,
                    EngineEvent::FundingPayment {
                        payment_id,
                        market: market_id.clone(),
                        trader,
                        amount,
                        rate,
                    },
                );
            }
        }

        self.last_funding.insert(
            market_id.clone(),
            FundingRate {
                market: market_id.clone(),
                rate,
                mark_price: price.mark,
                index_price: price.index,
                timestamp: self.block_time,
            },
        );
        let next = self
            .next_funding
            .get(market_id)
            .copied()
            .unwrap_or(self.block_time);
        self.next_funding
            .insert(market_id.clone(), next + market.funding_interval_secs);

        info!("funding settled on {market_id}: rate {rate}");
        self.events.emit(
            self.block_height,
            EngineEvent::FundingSettled {
                market: market_id.clone(),
                rate,
                mark_price: price.mark,
                index_price: price.index,
            },
        );
        Ok(())
    }
}
