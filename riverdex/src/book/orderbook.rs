//! Per-market order book: arena of live orders plus the two side lists.

use std::collections::BTreeMap;

use crate::decimal::Decimal;
use crate::types::{EngineError, EngineResult, MarketId, OrderId, Side, TraderId};

use super::order_list::{BookOrder, OrderList};

/// Fill the matching engine intends to take against one resting order.
/// Planning never mutates the book; [`OrderBook::apply_fill`] commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedFill {
    pub maker_order_id: OrderId,
    pub maker: TraderId,
    pub price: Decimal,
    pub quantity: Decimal,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MatchPlan {
    pub fills: Vec<PlannedFill>,
    pub filled: Decimal,
    pub remaining: Decimal,
}

#[derive(Debug, Clone)]
pub struct OrderBook {
    pub market_id: MarketId,
    bids: OrderList,
    asks: OrderList,
    /// Live orders; doubles as the O(log N) cancel index.
    orders: BTreeMap<OrderId, BookOrder>,
    next_sequence: u64,
}

impl OrderBook {
    pub fn new(market_id: MarketId) -> OrderBook {
        OrderBook {
            market_id,
            bids: OrderList::new(Side::Buy),
            asks: OrderList::new(Side::Sell),
            orders: BTreeMap::new(),
            next_sequence: 0,
        }
    }

    /// Hands out the per-market monotonic sequence. Every accepted order
    /// consumes one, resting or not.
    pub fn next_sequence(&mut self) -> u64 {
        self.next_sequence += 1;
        self.next_sequence
    }

    pub fn sequence_watermark(&self) -> u64 {
        self.next_sequence
    }

    pub fn set_sequence_watermark(&mut self, watermark: u64) {
        self.next_sequence = watermark;
    }

    fn list(&self, side: Side) -> &OrderList {
        match side {
            Side::Buy => &self.bids,
            Side::Sell => &self.asks,
        }
    }

    fn list_mut(&mut self, side: Side) -> &mut OrderList {
        match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        }
    }

    pub fn get(&self, order_id: OrderId) -> Option<&BookOrder> {
        self.orders.get(&order_id)
    }

    pub fn contains(&self, order_id: OrderId) -> bool {
        self.orders.contains_key(&order_id)
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    pub fn insert(&mut self, order: BookOrder) {
        self.list_mut(order.side).insert(&order);
        self.orders.insert(order.order_id, order);
    }

    pub fn cancel(&mut self, order_id: OrderId) -> EngineResult<BookOrder> {
        let order = self
            .orders
            .remove(&order_id)
            .ok_or(EngineError::OrderNotFound)?;
        self.list_mut(order.side).remove(&order);
        Ok(order)
    }

    pub fn best_bid(&self) -> Option<(Decimal, Decimal)> {
        let price = self.bids.best_price()?;
        let level = self.bids.level(&price)?;
        Some((price, level.total))
    }

    pub fn best_ask(&self) -> Option<(Decimal, Decimal)> {
        let price = self.asks.best_price()?;
        let level = self.asks.level(&price)?;
        Some((price, level.total))
    }

    pub fn side_list(&self, side: Side) -> &OrderList {
        self.list(side)
    }

    /// Walks the opposite side from the best price, FIFO within a level,
    /// until `quantity` is covered, the price limit cuts off, or liquidity
    /// runs out. The taker's own resting orders are skipped and left behind.
    pub fn plan_match(
        &self,
        taker_side: Side,
        quantity: Decimal,
        limit: Option<Decimal>,
        taker: &TraderId,
    ) -> EngineResult<MatchPlan> {
        self.plan_match_with(taker_side, quantity, limit, taker, &|o| o.remaining)
    }

    /// [`OrderBook::plan_match`] with a per-maker fill bound. The engine
    /// uses it to cap reduce-only makers at their live position size; a
    /// bound of zero skips the maker entirely.
    pub fn plan_match_with(
        &self,
        taker_side: Side,
        quantity: Decimal,
        limit: Option<Decimal>,
        taker: &TraderId,
        maker_limit: &dyn Fn(&BookOrder) -> Decimal,
    ) -> EngineResult<MatchPlan> {
        let opposite = self.list(taker_side.opposite());
        let mut plan = MatchPlan {
            remaining: quantity,
            ..MatchPlan::default()
        };

        'levels: for (price, level) in opposite.iter_best() {
            if !opposite.crosses(*price, limit) {
                break;
            }
            for order_id in &level.queue {
                if plan.remaining.is_zero() {
                    break 'levels;
                }
                let resting = match self.orders.get(order_id) {
                    Some(o) => o,
                    None => continue,
                };
                if &resting.trader == taker {
                    continue;
                }
                let bound = maker_limit(resting).min(resting.remaining);
                let quantity = plan.remaining.min(bound);
                if quantity.is_zero() {
                    continue;
                }
                plan.fills.push(PlannedFill {
                    maker_order_id: resting.order_id,
                    maker: resting.trader.clone(),
                    price: *price,
                    quantity,
                });
                plan.filled = plan.filled.safe_add(quantity)?;
                plan.remaining = plan.remaining.safe_sub(quantity)?;
            }
            if plan.remaining.is_zero() {
                break;
            }
        }
        Ok(plan)
    }

    /// Commits one planned fill. Returns the remaining quantity of the
    /// resting order after the fill.
    pub fn apply_fill(&mut self, order_id: OrderId, quantity: Decimal) -> EngineResult<Decimal> {
        let order = self
            .orders
            .get_mut(&order_id)
            .ok_or(EngineError::OrderNotFound)?;
        if order.remaining < quantity {
            return Err(EngineError::OrderSizeOutOfRange);
        }
        order.remaining = order.remaining.safe_sub(quantity)?;
        let done = order.remaining.is_zero();
        let snapshot = order.clone();
        match snapshot.side {
            Side::Buy => self.bids.reduce(&snapshot, quantity, done),
            Side::Sell => self.asks.reduce(&snapshot, quantity, done),
        }
        if done {
            self.orders.remove(&order_id);
        }
        Ok(snapshot.remaining)
    }

    /// Live order ids of one trader, ascending.
    pub fn orders_of(&self, trader: &TraderId) -> Vec<OrderId> {
        self.orders
            .values()
            .filter(|o| &o.trader == trader)
            .map(|o| o.order_id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn book() -> OrderBook {
        OrderBook::new(MarketId::new("BTC-USDC"))
    }

    fn rest(book: &mut OrderBook, id: OrderId, trader: &str, side: Side, price: &str, qty: &str) {
        let sequence = book.next_sequence();
        book.insert(BookOrder {
            order_id: id,
            trader: TraderId::new(trader),
            side,
            price: dec(price),
            remaining: dec(qty),
            hidden: false,
            reduce_only: false,
            sequence,
        });
    }

    #[test]
    fn test_price_time_priority_within_level() {
        let mut book = book();
        rest(&mut book, 1, "a", Side::Sell, "50000", "1");
        rest(&mut book, 2, "b", Side::Sell, "50000", "1");

        let plan = book
            .plan_match(Side::Buy, dec("1"), None, &TraderId::new("c"))
            .unwrap();
        assert_eq!(plan.fills.len(), 1);
        assert_eq!(plan.fills[0].maker_order_id, 1);
        assert_eq!(plan.fills[0].price, dec("50000"));
        assert_eq!(plan.remaining, Decimal::ZERO);
    }

    #[test]
    fn test_better_price_first() {
        let mut book = book();
        rest(&mut book, 1, "a", Side::Sell, "50010", "1");
        rest(&mut book, 2, "b", Side::Sell, "50000", "1");

        let plan = book
            .plan_match(Side::Buy, dec("2"), None, &TraderId::new("c"))
            .unwrap();
        assert_eq!(plan.fills[0].maker_order_id, 2);
        assert_eq!(plan.fills[1].maker_order_id, 1);
    }

    #[test]
    fn test_limit_cutoff() {
        let mut book = book();
        rest(&mut book, 1, "a", Side::Sell, "50000", "1");
        rest(&mut book, 2, "b", Side::Sell, "50010", "1");

        let plan = book
            .plan_match(Side::Buy, dec("2"), Some(dec("50000")), &TraderId::new("c"))
            .unwrap();
        assert_eq!(plan.fills.len(), 1);
        assert_eq!(plan.filled, dec("1"));
        assert_eq!(plan.remaining, dec("1"));
    }

    #[test]
    fn test_self_match_skipped() {
        let mut book = book();
        rest(&mut book, 1, "a", Side::Sell, "50000", "1");
        rest(&mut book, 2, "b", Side::Sell, "50010", "1");

        let plan = book
            .plan_match(Side::Buy, dec("1"), None, &TraderId::new("a"))
            .unwrap();
        assert_eq!(plan.fills.len(), 1);
        assert_eq!(plan.fills[0].maker_order_id, 2);
    }

    #[test]
    fn test_plan_does_not_mutate() {
        let mut book = book();
        rest(&mut book, 1, "a", Side::Sell, "50000", "1");
        let before = book.best_ask();
        let _ = book
            .plan_match(Side::Buy, dec("1"), None, &TraderId::new("c"))
            .unwrap();
        assert_eq!(book.best_ask(), before);
        assert!(book.contains(1));
    }

    #[test]
    fn test_apply_fill_removes_exhausted_order() {
        let mut book = book();
        rest(&mut book, 1, "a", Side::Sell, "50000", "1");
        let remaining = book.apply_fill(1, dec("0.4")).unwrap();
        assert_eq!(remaining, dec("0.6"));
        assert!(book.contains(1));
        assert_eq!(book.best_ask(), Some((dec("50000"), dec("0.6"))));

        let remaining = book.apply_fill(1, dec("0.6")).unwrap();
        assert_eq!(remaining, Decimal::ZERO);
        assert!(!book.contains(1));
        assert_eq!(book.best_ask(), None);
    }

    #[test]
    fn test_cancel_unknown_order() {
        let mut book = book();
        assert_eq!(book.cancel(42), Err(EngineError::OrderNotFound));
    }
}
