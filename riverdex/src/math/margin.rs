//! Margin arithmetic: notionals, unrealized PnL, health checks.

use crate::decimal::Decimal;
use crate::position::Position;
use crate::types::{EngineResult, MarketId, PositionSide};

pub fn notional(size: Decimal, mark: Decimal) -> EngineResult<Decimal> {
    size.safe_mul(mark)
}

pub fn unrealized_pnl(
    side: PositionSide,
    size: Decimal,
    entry: Decimal,
    mark: Decimal,
) -> EngineResult<Decimal> {
    let per_unit = match side {
        PositionSide::Long => mark.safe_sub(entry)?,
        PositionSide::Short => entry.safe_sub(mark)?,
    };
    per_unit.safe_mul(size)
}

pub fn position_notional(position: &Position, mark: Decimal) -> EngineResult<Decimal> {
    notional(position.size, mark)
}

pub fn position_unrealized_pnl(position: &Position, mark: Decimal) -> EngineResult<Decimal> {
    unrealized_pnl(position.side, position.size, position.entry_price, mark)
}

pub fn initial_margin(notional: Decimal, initial_margin_rate: Decimal) -> EngineResult<Decimal> {
    notional.safe_mul(initial_margin_rate)
}

pub fn maintenance_margin(
    notional: Decimal,
    maintenance_margin_rate: Decimal,
) -> EngineResult<Decimal> {
    notional.safe_mul(maintenance_margin_rate)
}

/// `margin + uPnL` of an isolated position.
pub fn isolated_equity(position: &Position, mark: Decimal) -> EngineResult<Decimal> {
    position
        .margin
        .safe_add(position_unrealized_pnl(position, mark)?)
}

pub fn isolated_healthy(
    position: &Position,
    mark: Decimal,
    maintenance_margin_rate: Decimal,
) -> EngineResult<bool> {
    let equity = isolated_equity(position, mark)?;
    let required = maintenance_margin(position_notional(position, mark)?, maintenance_margin_rate)?;
    Ok(equity >= required)
}

/// Aggregates over a trader's cross positions.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CrossSummary {
    pub notional: Decimal,
    pub unrealized_pnl: Decimal,
    pub maintenance: Decimal,
    pub initial: Decimal,
}

/// Walks cross positions, resolving `(mark, maintenance_rate, initial_rate)`
/// per market through `rates`. Positions whose market has no price this
/// block contribute nothing.
pub fn cross_summary<'a, I, F>(positions: I, rates: F) -> EngineResult<CrossSummary>
where
    I: Iterator<Item = &'a Position>,
    F: Fn(&MarketId) -> Option<(Decimal, Decimal, Decimal)>,
{
    let mut summary = CrossSummary::default();
    for position in positions {
        let Some((mark, maintenance_rate, initial_rate)) = rates(&position.market_id) else {
            continue;
        };
        let notional = position_notional(position, mark)?;
        summary.notional = summary.notional.safe_add(notional)?;
        summary.unrealized_pnl = summary
            .unrealized_pnl
            .safe_add(position_unrealized_pnl(position, mark)?)?;
        summary.maintenance = summary
            .maintenance
            .safe_add(maintenance_margin(notional, maintenance_rate)?)?;
        summary.initial = summary
            .initial
            .safe_add(initial_margin(notional, initial_rate)?)?;
    }
    Ok(summary)
}

pub fn cross_equity(balance: Decimal, summary: &CrossSummary) -> EngineResult<Decimal> {
    balance.safe_add(summary.unrealized_pnl)
}

pub fn cross_healthy(balance: Decimal, summary: &CrossSummary) -> EngineResult<bool> {
    Ok(cross_equity(balance, summary)? >= summary.maintenance)
}

/// Collateral a withdrawal must leave behind for cross positions:
/// maintenance plus unrealized losses. Unrealized profit adds no headroom.
pub fn cross_withdraw_reservation(summary: &CrossSummary) -> EngineResult<Decimal> {
    let losses = summary.unrealized_pnl.min(Decimal::ZERO).neg();
    summary.maintenance.safe_add(losses)
}

/// Price at which `equity` reaches zero, moving from `mark`.
pub fn bankruptcy_price(
    side: PositionSide,
    mark: Decimal,
    equity: Decimal,
    size: Decimal,
) -> EngineResult<Decimal> {
    let per_unit = equity.safe_div(size)?;
    let price = match side {
        PositionSide::Long => mark.safe_sub(per_unit)?,
        PositionSide::Short => mark.safe_add(per_unit)?,
    };
    Ok(price.max(Decimal::ZERO))
}
