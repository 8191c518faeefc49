//! One side of a book: price levels in a sorted map, FIFO queues inside.

use std::collections::{BTreeMap, VecDeque};

use crate::decimal::Decimal;
use crate::types::{OrderId, Side, TraderId};

/// A live resting order as the book sees it. `remaining` mirrors
/// `quantity − filled_quantity` of the owning order record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookOrder {
    pub order_id: OrderId,
    pub trader: TraderId,
    pub side: Side,
    pub price: Decimal,
    pub remaining: Decimal,
    pub hidden: bool,
    pub reduce_only: bool,
    pub sequence: u64,
}

#[derive(Debug, Default, Clone)]
pub struct PriceLevel {
    /// Resting quantity including hidden orders.
    pub total: Decimal,
    /// Resting quantity shown in depth queries.
    pub visible: Decimal,
    /// Order ids in strict arrival order.
    pub queue: VecDeque<OrderId>,
}

/// Price levels for one side. Iteration from the best price is `iter()` for
/// asks and `iter().rev()` for bids; [`OrderList::iter_best`] hides the
/// difference.
#[derive(Debug, Clone)]
pub struct OrderList {
    side: Side,
    levels: BTreeMap<Decimal, PriceLevel>,
}

impl OrderList {
    pub fn new(side: Side) -> OrderList {
        OrderList {
            side,
            levels: BTreeMap::new(),
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn insert(&mut self, order: &BookOrder) {
        let level = self.levels.entry(order.price).or_default();
        level.total = level
            .total
            .safe_add(order.remaining)
            .unwrap_or(level.total);
        if !order.hidden {
            level.visible = level
                .visible
                .safe_add(order.remaining)
                .unwrap_or(level.visible);
        }
        level.queue.push_back(order.order_id);
    }

    pub fn remove(&mut self, order: &BookOrder) {
        let Some(level) = self.levels.get_mut(&order.price) else {
            return;
        };
        level.queue.retain(|id| *id != order.order_id);
        level.total = level
            .total
            .safe_sub(order.remaining)
            .unwrap_or(Decimal::ZERO);
        if !order.hidden {
            level.visible = level
                .visible
                .safe_sub(order.remaining)
                .unwrap_or(Decimal::ZERO);
        }
        if level.queue.is_empty() {
            self.levels.remove(&order.price);
        }
    }

    /// Shrinks the level aggregates after a fill of `quantity` against
    /// `order`; drops the order from the queue when it is done.
    pub fn reduce(&mut self, order: &BookOrder, quantity: Decimal, done: bool) {
        let Some(level) = self.levels.get_mut(&order.price) else {
            return;
        };
        level.total = level.total.safe_sub(quantity).unwrap_or(Decimal::ZERO);
        if !order.hidden {
            level.visible = level.visible.safe_sub(quantity).unwrap_or(Decimal::ZERO);
        }
        if done {
            level.queue.retain(|id| *id != order.order_id);
        }
        if level.queue.is_empty() {
            self.levels.remove(&order.price);
        }
    }

    pub fn best_price(&self) -> Option<Decimal> {
        match self.side {
            Side::Buy => self.levels.keys().next_back().copied(),
            Side::Sell => self.levels.keys().next().copied(),
        }
    }

    pub fn level(&self, price: &Decimal) -> Option<&PriceLevel> {
        self.levels.get(price)
    }

    /// Levels from the best price outward.
    pub fn iter_best(&self) -> Box<dyn Iterator<Item = (&Decimal, &PriceLevel)> + '_> {
        match self.side {
            Side::Buy => Box::new(self.levels.iter().rev()),
            Side::Sell => Box::new(self.levels.iter()),
        }
    }

    /// True when `price` is at or beyond the crossing bound for a taker
    /// hitting this side.
    pub fn crosses(&self, level_price: Decimal, limit: Option<Decimal>) -> bool {
        match limit {
            None => true,
            Some(limit) => match self.side {
                // taker sells into bids: match while bid >= limit
                Side::Buy => level_price >= limit,
                // taker buys into asks: match while ask <= limit
                Side::Sell => level_price <= limit,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn order(id: OrderId, side: Side, price: &str, qty: &str, seq: u64) -> BookOrder {
        BookOrder {
            order_id: id,
            trader: TraderId::new("t"),
            side,
            price: dec(price),
            remaining: dec(qty),
            hidden: false,
            reduce_only: false,
            sequence: seq,
        }
    }

    #[test]
    fn test_best_price_per_side() {
        let mut asks = OrderList::new(Side::Sell);
        asks.insert(&order(1, Side::Sell, "101", "1", 1));
        asks.insert(&order(2, Side::Sell, "100", "1", 2));
        assert_eq!(asks.best_price(), Some(dec("100")));

        let mut bids = OrderList::new(Side::Buy);
        bids.insert(&order(3, Side::Buy, "99", "1", 3));
        bids.insert(&order(4, Side::Buy, "98", "1", 4));
        assert_eq!(bids.best_price(), Some(dec("99")));
    }

    #[test]
    fn test_fifo_within_level() {
        let mut asks = OrderList::new(Side::Sell);
        asks.insert(&order(1, Side::Sell, "100", "1", 1));
        asks.insert(&order(2, Side::Sell, "100", "1", 2));
        let level = asks.level(&dec("100")).unwrap();
        assert_eq!(level.queue.iter().copied().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(level.total, dec("2"));
    }

    #[test]
    fn test_remove_clears_empty_level() {
        let mut asks = OrderList::new(Side::Sell);
        let o = order(1, Side::Sell, "100", "1", 1);
        asks.insert(&o);
        asks.remove(&o);
        assert!(asks.is_empty());
    }

    #[test]
    fn test_hidden_excluded_from_visible() {
        let mut asks = OrderList::new(Side::Sell);
        let mut o = order(1, Side::Sell, "100", "1", 1);
        o.hidden = true;
        asks.insert(&o);
        asks.insert(&order(2, Side::Sell, "100", "2", 2));
        let level = asks.level(&dec("100")).unwrap();
        assert_eq!(level.total, dec("3"));
        assert_eq!(level.visible, dec("2"));
    }

    #[test]
    fn test_crossing_bounds() {
        let asks = OrderList::new(Side::Sell);
        assert!(asks.crosses(dec("100"), Some(dec("100"))));
        assert!(asks.crosses(dec("99"), Some(dec("100"))));
        assert!(!asks.crosses(dec("101"), Some(dec("100"))));
        assert!(asks.crosses(dec("101"), None));

        let bids = OrderList::new(Side::Buy);
        assert!(bids.crosses(dec("100"), Some(dec("100"))));
        assert!(bids.crosses(dec("101"), Some(dec("100"))));
        assert!(!bids.crosses(dec("99"), Some(dec("100"))));
    }
}
