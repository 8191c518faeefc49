pub mod levels;
pub mod order_list;
pub mod orderbook;

pub use levels::{depth, top_levels, DepthLevel, OrderBookDepth};
pub use order_list::{BookOrder, OrderList, PriceLevel};
pub use orderbook::{MatchPlan, OrderBook, PlannedFill};
