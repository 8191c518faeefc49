//! Price oracle boundary. The core never fetches prices; the host hands a
//! pre-fetched snapshot to `end_block` and the engine pins it for the block.

use std::collections::BTreeMap;

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

use crate::decimal::Decimal;
use crate::types::MarketId;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub struct MarkIndex {
    pub mark: Decimal,
    pub index: Decimal,
}

pub trait PriceOracle {
    /// `(mark, index)` for one market, or `None` when the oracle has no
    /// fresh observation this block (the previous snapshot stays pinned).
    fn price(&self, market: &MarketId) -> Option<MarkIndex>;
}

/// Fixed price table; the oracle used by tests and the replay driver.
#[derive(Debug, Default, Clone)]
pub struct StaticOracle {
    prices: BTreeMap<MarketId, MarkIndex>,
}

impl StaticOracle {
    pub fn new() -> StaticOracle {
        StaticOracle {
            prices: BTreeMap::new(),
        }
    }

    pub fn set(&mut self, market: MarketId, mark: Decimal, index: Decimal) {
        self.prices.insert(market, MarkIndex { mark, index });
    }

    pub fn set_both(&mut self, market: MarketId, price: Decimal) {
        self.set(market, price, price);
    }
}

impl PriceOracle for StaticOracle {
    fn price(&self, market: &MarketId) -> Option<MarkIndex> {
        self.prices.get(market).copied()
    }
}
