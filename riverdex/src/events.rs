//! Append-only event records drained by the host after each block.

use std::collections::BTreeMap;

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

use crate::decimal::Decimal;
use crate::types::{
    ConditionalId, LiquidationTier, MarginMode, MarketId, MarketStatus, OrderId, ScaleId, Side,
    TradeId, TraderId, TwapId,
};

#[derive(Debug, Clone, PartialEq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub enum EngineEvent {
    MarketCreated {
        market: MarketId,
    },
    MarketUpdated {
        market: MarketId,
    },
    MarketStatusChanged {
        market: MarketId,
        status: MarketStatus,
    },
    OrderPlaced {
        order_id: OrderId,
        market: MarketId,
        trader: TraderId,
        side: Side,
        quantity: Decimal,
        price: Option<Decimal>,
    },
    OrderFilled {
        order_id: OrderId,
        market: MarketId,
        trader: TraderId,
        quantity: Decimal,
        price: Decimal,
        remaining: Decimal,
    },
    OrderCancelled {
        order_id: OrderId,
        market: MarketId,
        trader: TraderId,
    },
    OrderRejected {
        market: MarketId,
        trader: TraderId,
        client_order_id: Option<u64>,
        code: u32,
    },
    Trade {
        trade_id: TradeId,
        market: MarketId,
        maker_order: OrderId,
        taker_order: OrderId,
        price: Decimal,
        quantity: Decimal,
    },
    ConditionalPlaced {
        conditional_id: ConditionalId,
        market: MarketId,
        trader: TraderId,
    },
    ConditionalTriggered {
        conditional_id: ConditionalId,
        market: MarketId,
        trader: TraderId,
        order_id: OrderId,
    },
    ConditionalCancelled {
        conditional_id: ConditionalId,
        market: MarketId,
        trader: TraderId,
    },
    TwapPlaced {
        twap_id: TwapId,
        market: MarketId,
        trader: TraderId,
    },
    TwapFired {
        twap_id: TwapId,
        market: MarketId,
        order_id: OrderId,
        quantity: Decimal,
    },
    TwapCompleted {
        twap_id: TwapId,
        market: MarketId,
    },
    TwapCancelled {
        twap_id: TwapId,
        market: MarketId,
    },
    ScalePlaced {
        scale_id: ScaleId,
        market: MarketId,
        trader: TraderId,
        children: Vec<OrderId>,
    },
    ScaleCancelled {
        scale_id: ScaleId,
        market: MarketId,
    },
    FundingSettled {
        market: MarketId,
        rate: Decimal,
        mark_price: Decimal,
        index_price: Decimal,
    },
    FundingPayment {
        payment_id: u64,
        market: MarketId,
        trader: TraderId,
        amount: Decimal,
        rate: Decimal,
    },
    Liquidation {
        liquidation_id: u64,
        market: MarketId,
        trader: TraderId,
        tier: LiquidationTier,
        size: Decimal,
        price: Decimal,
        penalty: Decimal,
    },
    MarginModeChanged {
        trader: TraderId,
        mode: MarginMode,
    },
}

impl EngineEvent {
    /// Stable stream name; also the key of the per-type sequence counter.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::MarketCreated { .. } => "market_created",
            EngineEvent::MarketUpdated { .. } => "market_updated",
            EngineEvent::MarketStatusChanged { .. } => "market_status_changed",
            EngineEvent::OrderPlaced { .. } => "order_placed",
            EngineEvent::OrderFilled { .. } => "order_filled",
            EngineEvent::OrderCancelled { .. } => "order_cancelled",
            EngineEvent::OrderRejected { .. } => "order_rejected",
            EngineEvent::Trade { .. } => "trade",
            EngineEvent::ConditionalPlaced { .. } => "conditional_placed",
            EngineEvent::ConditionalTriggered { .. } => "conditional_triggered",
            EngineEvent::ConditionalCancelled { .. } => "conditional_cancelled",
            EngineEvent::TwapPlaced { .. } => "twap_placed",
            EngineEvent::TwapFired { .. } => "twap_fired",
            EngineEvent::TwapCompleted { .. } => "twap_completed",
            EngineEvent::TwapCancelled { .. } => "twap_cancelled",
            EngineEvent::ScalePlaced { .. } => "scale_placed",
            EngineEvent::ScaleCancelled { .. } => "scale_cancelled",
            EngineEvent::FundingSettled { .. } => "funding_settled",
            EngineEvent::FundingPayment { .. } => "funding_payment",
            EngineEvent::Liquidation { tier, .. } => match tier {
                LiquidationTier::Market => "liquidation_tier1",
                LiquidationTier::Partial => "liquidation_tier2",
                LiquidationTier::Backstop => "liquidation_tier3",
                LiquidationTier::Adl => "liquidation_adl",
            },
            EngineEvent::MarginModeChanged { .. } => "margin_mode_changed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct EventRecord {
    pub block_height: u64,
    /// Monotonic within the event's `kind()` stream.
    pub sequence: u64,
    pub event: EngineEvent,
}

/// Buffers records for the current block and owns the per-type sequence
/// counters, which outlive blocks.
#[derive(Debug, Default, Clone)]
pub struct EventQueue {
    pending: Vec<EventRecord>,
    sequences: BTreeMap<String, u64>,
}

impl EventQueue {
    pub fn new() -> EventQueue {
        EventQueue::default()
    }

    pub fn emit(&mut self, block_height: u64, event: EngineEvent) {
        let sequence = self
            .sequences
            .entry(event.kind().to_string())
            .and_modify(|s| *s += 1)
            .or_insert(1);
        self.pending.push(EventRecord {
            block_height,
            sequence: *sequence,
            event,
        });
    }

    pub fn drain(&mut self) -> Vec<EventRecord> {
        std::mem::take(&mut self.pending)
    }

    pub fn pending(&self) -> &[EventRecord] {
        &self.pending
    }

    pub fn sequences(&self) -> &BTreeMap<String, u64> {
        &self.sequences
    }

    pub fn restore_sequences(&mut self, sequences: BTreeMap<String, u64>) {
        self.sequences = sequences;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_kind_sequences() {
        let mut queue = EventQueue::new();
        let market = MarketId::new("BTC-USDC");
        queue.emit(1, EngineEvent::MarketCreated { market: market.clone() });
        queue.emit(
            1,
            EngineEvent::MarketStatusChanged {
                market: market.clone(),
                status: MarketStatus::Paused,
            },
        );
        queue.emit(2, EngineEvent::MarketCreated { market });

        let records = queue.drain();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].sequence, 1);
        assert_eq!(records[1].sequence, 1); // independent stream
        assert_eq!(records[2].sequence, 2);
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn test_record_json_shape_for_indexers() {
        let mut queue = EventQueue::new();
        queue.emit(
            7,
            EngineEvent::Trade {
                trade_id: 3,
                market: MarketId::new("BTC-USDC"),
                maker_order: 1,
                taker_order: 2,
                price: "50000.1".parse().unwrap(),
                quantity: "0.5".parse().unwrap(),
            },
        );
        let record = &queue.drain()[0];
        let json = serde_json::to_value(record).unwrap();
        assert_eq!(json["block_height"], 7);
        assert_eq!(json["sequence"], 1);
        assert_eq!(json["event"]["Trade"]["price"], "50000.1");
        assert_eq!(json["event"]["Trade"]["quantity"], "0.5");
    }

    #[test]
    fn test_liquidation_kinds_by_tier() {
        let event = |tier| EngineEvent::Liquidation {
            liquidation_id: 1,
            market: MarketId::new("BTC-USDC"),
            trader: TraderId::new("t"),
            tier,
            size: Decimal::ONE,
            price: Decimal::ONE,
            penalty: Decimal::ZERO,
        };
        assert_eq!(event(LiquidationTier::Market).kind(), "liquidation_tier1");
        assert_eq!(event(LiquidationTier::Partial).kind(), "liquidation_tier2");
        assert_eq!(event(LiquidationTier::Backstop).kind(), "liquidation_tier3");
        assert_eq!(event(LiquidationTier::Adl).kind(), "liquidation_adl");
    }
}
