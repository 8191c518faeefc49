//! Shared identifiers, enums and the engine error type.

use std::fmt;

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

pub type OrderId = u64;
pub type TradeId = u64;
pub type ConditionalId = u64;
pub type TwapId = u64;
pub type ScaleId = u64;

/// Market identifier, e.g. `BTC-USDC`. Byte order of the symbol is the
/// deterministic iteration order everywhere markets are walked.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    BorshSerialize,
    BorshDeserialize,
    Serialize,
    Deserialize,
)]
pub struct MarketId(pub String);

impl MarketId {
    pub fn new(s: impl Into<String>) -> Self {
        MarketId(s.into())
    }
}

impl fmt::Display for MarketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    BorshSerialize,
    BorshDeserialize,
    Serialize,
    Deserialize,
)]
pub struct TraderId(pub String);

impl TraderId {
    pub fn new(s: impl Into<String>) -> Self {
        TraderId(s.into())
    }
}

impl fmt::Display for TraderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    BorshSerialize,
    BorshDeserialize,
    Serialize,
    Deserialize,
)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// The position side a fill on this order side opens.
    pub fn position_side(&self) -> PositionSide {
        match self {
            Side::Buy => PositionSide::Long,
            Side::Sell => PositionSide::Short,
        }
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    BorshSerialize,
    BorshDeserialize,
    Serialize,
    Deserialize,
)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn opposite(&self) -> PositionSide {
        match self {
            PositionSide::Long => PositionSide::Short,
            PositionSide::Short => PositionSide::Long,
        }
    }

    /// The order side that reduces a position on this side.
    pub fn closing_side(&self) -> Side {
        match self {
            PositionSide::Long => Side::Sell,
            PositionSide::Short => Side::Buy,
        }
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    BorshSerialize,
    BorshDeserialize,
    Serialize,
    Deserialize,
)]
pub enum OrderType {
    Limit,
    Market,
    StopLoss,
    TakeProfit,
    StopLimit,
    TakeProfitLimit,
}

impl OrderType {
    pub fn is_conditional(&self) -> bool {
        matches!(
            self,
            OrderType::StopLoss
                | OrderType::TakeProfit
                | OrderType::StopLimit
                | OrderType::TakeProfitLimit
        )
    }

    pub fn requires_price(&self) -> bool {
        matches!(
            self,
            OrderType::Limit | OrderType::StopLimit | OrderType::TakeProfitLimit
        )
    }

    pub fn requires_trigger(&self) -> bool {
        self.is_conditional()
    }

    /// Conditional types that convert to market orders on trigger.
    pub fn triggers_to_market(&self) -> bool {
        matches!(self, OrderType::StopLoss | OrderType::TakeProfit)
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    BorshSerialize,
    BorshDeserialize,
    Serialize,
    Deserialize,
)]
pub enum TimeInForce {
    Gtc,
    Ioc,
    Fok,
    PostOnly,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    BorshSerialize,
    BorshDeserialize,
    Serialize,
    Deserialize,
)]
pub enum OrderStatus {
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }
}

#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    BorshSerialize,
    BorshDeserialize,
    Serialize,
    Deserialize,
)]
pub struct OrderFlags {
    pub reduce_only: bool,
    pub post_only: bool,
    pub hidden: bool,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    BorshSerialize,
    BorshDeserialize,
    Serialize,
    Deserialize,
)]
pub enum MarginMode {
    Isolated,
    Cross,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    BorshSerialize,
    BorshDeserialize,
    Serialize,
    Deserialize,
)]
pub enum MarketStatus {
    Inactive,
    Active,
    Settling,
    Paused,
}

/// Price comparison a pending conditional waits on.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    BorshSerialize,
    BorshDeserialize,
    Serialize,
    Deserialize,
)]
pub enum TriggerDirection {
    /// Fires when mark >= trigger price.
    Above,
    /// Fires when mark <= trigger price.
    Below,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    BorshSerialize,
    BorshDeserialize,
    Serialize,
    Deserialize,
)]
pub enum LiquidationTier {
    Market,
    Partial,
    Backstop,
    Adl,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    BorshSerialize,
    BorshDeserialize,
    Serialize,
    Deserialize,
)]
pub enum ScaleDistribution {
    Linear,
    Exponential,
}

/// Stable rejection kinds. `code()` values are part of the host contract and
/// never reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("market not found")]
    MarketNotFound,
    #[error("market already exists")]
    MarketExists,
    #[error("market paused")]
    MarketPaused,
    #[error("invalid market config")]
    InvalidMarketConfig,
    #[error("price not a multiple of tick size")]
    InvalidTick,
    #[error("quantity not a multiple of lot size")]
    InvalidLot,
    #[error("order size out of range")]
    OrderSizeOutOfRange,
    #[error("position size limit exceeded")]
    PositionSizeExceeded,
    #[error("insufficient balance")]
    InsufficientBalance,
    #[error("insufficient margin")]
    InsufficientMargin,
    #[error("insufficient free collateral")]
    InsufficientFree,
    #[error("reduce-only order without opposite position")]
    ReduceOnlyNoPosition,
    #[error("post-only order would cross")]
    PostOnlyCrossed,
    #[error("fill-or-kill order cannot fill completely")]
    FokUnfillable,
    #[error("invalid trigger price")]
    InvalidTriggerPrice,
    #[error("order not found")]
    OrderNotFound,
    #[error("order already closed")]
    OrderAlreadyClosed,
    #[error("not the order owner")]
    NotOrderOwner,
    #[error("arithmetic overflow")]
    ArithmeticOverflow,
    #[error("division by zero")]
    DivisionByZero,
    #[error("position in liquidation cool-down")]
    LiquidationCooldown,
    #[error("insurance fund depleted")]
    InsuranceFundDepleted,
    #[error("account has open positions")]
    HasOpenPositions,
    #[error("amount must be positive")]
    InvalidAmount,
}

impl EngineError {
    /// Deterministic rejection code surfaced to gateways.
    pub fn code(&self) -> u32 {
        match self {
            EngineError::Unauthorized => 1,
            EngineError::MarketNotFound => 2,
            EngineError::MarketExists => 3,
            EngineError::MarketPaused => 4,
            EngineError::InvalidMarketConfig => 5,
            EngineError::InvalidTick => 6,
            EngineError::InvalidLot => 7,
            EngineError::OrderSizeOutOfRange => 8,
            EngineError::PositionSizeExceeded => 9,
            EngineError::InsufficientBalance => 10,
            EngineError::InsufficientMargin => 11,
            EngineError::InsufficientFree => 12,
            EngineError::ReduceOnlyNoPosition => 13,
            EngineError::PostOnlyCrossed => 14,
            EngineError::FokUnfillable => 15,
            EngineError::InvalidTriggerPrice => 16,
            EngineError::OrderNotFound => 17,
            EngineError::OrderAlreadyClosed => 18,
            EngineError::NotOrderOwner => 19,
            EngineError::ArithmeticOverflow => 20,
            EngineError::DivisionByZero => 21,
            EngineError::LiquidationCooldown => 22,
            EngineError::InsuranceFundDepleted => 23,
            EngineError::HasOpenPositions => 24,
            EngineError::InvalidAmount => 25,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_conversions() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Buy.position_side(), PositionSide::Long);
        assert_eq!(PositionSide::Long.closing_side(), Side::Sell);
        assert_eq!(PositionSide::Short.closing_side(), Side::Buy);
    }

    #[test]
    fn test_order_type_tables() {
        assert!(OrderType::StopLimit.requires_price());
        assert!(!OrderType::Market.requires_price());
        assert!(OrderType::StopLoss.triggers_to_market());
        assert!(!OrderType::StopLimit.triggers_to_market());
        assert!(OrderType::TakeProfitLimit.is_conditional());
        assert!(!OrderType::Limit.is_conditional());
    }

    #[test]
    fn test_error_codes_stable() {
        assert_eq!(EngineError::Unauthorized.code(), 1);
        assert_eq!(EngineError::FokUnfillable.code(), 15);
        assert_eq!(EngineError::InvalidAmount.code(), 25);
    }
}
