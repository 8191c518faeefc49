//! Engine-wide constants and default risk parameters.

pub mod perp_markets;

use crate::decimal::Decimal;

pub use perp_markets::default_markets;

/// Funding premium damping factor (0.03).
pub const FUNDING_DAMPING: Decimal = Decimal::from_scaled(30_000_000_000_000_000);

/// Funding rate clamp per interval (±0.001).
pub const MAX_FUNDING_RATE: Decimal = Decimal::from_scaled(1_000_000_000_000_000);

/// Liquidation penalty as a fraction of liquidated notional (0.01).
pub const LIQUIDATION_PENALTY_RATE: Decimal = Decimal::from_scaled(10_000_000_000_000_000);

/// Share of the collected penalty paid to the liquidator (0.3).
pub const LIQUIDATOR_SHARE: Decimal = Decimal::from_scaled(300_000_000_000_000_000);

/// Notional above which liquidation takes the partial path (100 000 quote).
pub const PARTIAL_LIQUIDATION_THRESHOLD: Decimal = Decimal::int(100_000);

/// Fraction of position size closed per partial-liquidation step (0.2).
pub const PARTIAL_LIQUIDATION_FRACTION: Decimal = Decimal::from_scaled(200_000_000_000_000_000);

/// Block-time cool-down between partial liquidations of one position.
pub const LIQUIDATION_COOLDOWN_SECS: i64 = 30;

pub const DEFAULT_FUNDING_INTERVAL_SECS: i64 = 28_800;

/// Upper bound on the TWAP catch-up multiplier.
pub const TWAP_MAX_ESCALATION: u32 = 3;

/// Ledger account that assumes positions in a backstop takeover.
pub const BACKSTOP_VAULT: &str = "__backstop__";

/// Ledger account credited with the liquidator share when no external
/// liquidator is attached (the in-pipeline case).
pub const PROTOCOL_LEDGER: &str = "__protocol__";
