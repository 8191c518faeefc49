//! Aggregated depth views served to queries.

use serde::{Deserialize, Serialize};

use crate::decimal::Decimal;
use crate::types::Side;

use super::orderbook::OrderBook;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthLevel {
    pub price: Decimal,
    pub size: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBookDepth {
    pub bids: Vec<DepthLevel>,
    pub asks: Vec<DepthLevel>,
}

/// Top `n` levels per side with per-level visible quantity. Levels whose
/// resting size is entirely hidden are skipped.
pub fn top_levels(book: &OrderBook, side: Side, n: usize) -> Vec<DepthLevel> {
    book.side_list(side)
        .iter_best()
        .filter(|(_, level)| level.visible.is_positive())
        .take(n)
        .map(|(price, level)| DepthLevel {
            price: *price,
            size: level.visible,
        })
        .collect()
}

pub fn depth(book: &OrderBook, n: usize) -> OrderBookDepth {
    OrderBookDepth {
        bids: top_levels(book, Side::Buy, n),
        asks: top_levels(book, Side::Sell, n),
    }
}
