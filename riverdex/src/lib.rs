//! Deterministic matching and risk core for the riverdex perpetual futures
//! exchange.
//!
//! The crate is the trading state machine only: the consensus layer feeds
//! [`engine::Engine::end_block`] an ordered transaction list plus a block
//! time/height, and drains the returned event records. No clocks, no
//! randomness, no I/O; every number is an 18-digit fixed-point
//! [`decimal::Decimal`].

pub mod account;
pub mod book;
pub mod conditional;
pub mod constants;
pub mod decimal;
pub mod engine;
pub mod events;
pub mod funding;
pub mod liquidation;
pub mod market;
pub mod matching;
pub mod math;
pub mod oracle;
pub mod position;
pub mod storage;
pub mod types;

pub use account::{Account, AccountLedger};
pub use book::{DepthLevel, OrderBook, OrderBookDepth};
pub use conditional::{
    ConditionalOrder, ConditionalParams, ScaleParams, ScaleParent, ScheduleStatus, TwapParams,
    TwapSchedule,
};
pub use decimal::Decimal;
pub use engine::{
    backstop_vault, protocol_ledger, BlockOutcome, Engine, PositionHealth, Transaction, TxReceipt,
    TxResponse,
};
pub use events::{EngineEvent, EventRecord};
pub use funding::{FundingPayment, FundingRate};
pub use liquidation::Liquidation;
pub use market::{Market, MarketConfig, MarketPatch};
pub use matching::{MatchResult, Order, OrderParams, Trade};
pub use oracle::{MarkIndex, PriceOracle, StaticOracle};
pub use position::Position;
pub use storage::{KvStore, MemStore, StorageError};
pub use types::{
    EngineError, EngineResult, MarginMode, MarketId, MarketStatus, OrderFlags, OrderId,
    OrderStatus, OrderType, PositionSide, ScaleDistribution, Side, TimeInForce, TraderId,
};
