//! Trader balances and margin locks.

use std::collections::BTreeMap;

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

use crate::decimal::Decimal;
use crate::types::{EngineError, EngineResult, MarginMode, TraderId};

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Account {
    pub trader_id: TraderId,
    pub balance: Decimal,
    pub locked_margin: Decimal,
    pub margin_mode: MarginMode,
    /// Unrealized PnL across cross positions, refreshed at oracle time.
    /// Query convenience only; health checks recompute from positions.
    pub cross_unrealized_pnl_cache: Decimal,
}

impl Account {
    pub fn new(trader_id: TraderId) -> Account {
        Account {
            trader_id,
            balance: Decimal::ZERO,
            locked_margin: Decimal::ZERO,
            margin_mode: MarginMode::Cross,
            cross_unrealized_pnl_cache: Decimal::ZERO,
        }
    }

    /// Collateral not pinned under isolated positions.
    pub fn free_balance(&self) -> Decimal {
        self.balance.safe_sub(self.locked_margin).unwrap_or(Decimal::ZERO)
    }
}

#[derive(Debug, Default, Clone)]
pub struct AccountLedger {
    accounts: BTreeMap<TraderId, Account>,
}

impl AccountLedger {
    pub fn new() -> AccountLedger {
        AccountLedger {
            accounts: BTreeMap::new(),
        }
    }

    pub fn get(&self, trader: &TraderId) -> Option<&Account> {
        self.accounts.get(trader)
    }

    pub fn ensure(&mut self, trader: &TraderId) -> &mut Account {
        self.accounts
            .entry(trader.clone())
            .or_insert_with(|| Account::new(trader.clone()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TraderId, &Account)> {
        self.accounts.iter()
    }

    pub fn deposit(&mut self, trader: &TraderId, amount: Decimal) -> EngineResult<Decimal> {
        if !amount.is_positive() {
            return Err(EngineError::InvalidAmount);
        }
        let account = self.ensure(trader);
        account.balance = account.balance.safe_add(amount)?;
        Ok(account.balance)
    }

    /// Withdraw against free collateral. `cross_reservation` is the
    /// maintenance the caller computed over the trader's cross positions.
    pub fn withdraw(
        &mut self,
        trader: &TraderId,
        amount: Decimal,
        cross_reservation: Decimal,
    ) -> EngineResult<Decimal> {
        if !amount.is_positive() {
            return Err(EngineError::InvalidAmount);
        }
        let account = self
            .accounts
            .get_mut(trader)
            .ok_or(EngineError::InsufficientBalance)?;
        let headroom = account
            .balance
            .safe_sub(account.locked_margin)?
            .safe_sub(cross_reservation)?;
        if headroom < amount {
            return Err(EngineError::InsufficientFree);
        }
        account.balance = account.balance.safe_sub(amount)?;
        Ok(account.balance)
    }

    pub fn set_margin_mode(
        &mut self,
        trader: &TraderId,
        mode: MarginMode,
        has_open_positions: bool,
    ) -> EngineResult<()> {
        if has_open_positions {
            return Err(EngineError::HasOpenPositions);
        }
        let account = self.ensure(trader);
        account.margin_mode = mode;
        Ok(())
    }

    pub fn credit(&mut self, trader: &TraderId, amount: Decimal) -> EngineResult<()> {
        let account = self.ensure(trader);
        account.balance = account.balance.safe_add(amount)?;
        Ok(())
    }

    pub fn debit(&mut self, trader: &TraderId, amount: Decimal) -> EngineResult<()> {
        let account = self
            .accounts
            .get_mut(trader)
            .ok_or(EngineError::InsufficientBalance)?;
        if account.balance < amount {
            return Err(EngineError::InsufficientBalance);
        }
        account.balance = account.balance.safe_sub(amount)?;
        Ok(())
    }

    /// Applies a signed cash delta, clamping the balance at zero. Returns the
    /// uncovered remainder (positive when `delta` exceeded the balance) so the
    /// caller can draw it from the insurance fund.
    pub fn settle_signed(&mut self, trader: &TraderId, delta: Decimal) -> EngineResult<Decimal> {
        let account = self.ensure(trader);
        let next = account.balance.safe_add(delta)?;
        if next.is_negative() {
            account.balance = Decimal::ZERO;
            return Ok(next.neg());
        }
        account.balance = next;
        Ok(Decimal::ZERO)
    }

    /// Moves free balance under an isolated position.
    pub fn lock_margin(&mut self, trader: &TraderId, amount: Decimal) -> EngineResult<()> {
        let account = self
            .accounts
            .get_mut(trader)
            .ok_or(EngineError::InsufficientMargin)?;
        if account.free_balance() < amount {
            return Err(EngineError::InsufficientMargin);
        }
        account.locked_margin = account.locked_margin.safe_add(amount)?;
        Ok(())
    }

    /// Releases locked margin back to free balance. The amount stays inside
    /// `balance`; only the lock moves.
    pub fn release_margin(&mut self, trader: &TraderId, amount: Decimal) -> EngineResult<()> {
        let account = self
            .accounts
            .get_mut(trader)
            .ok_or(EngineError::InsufficientMargin)?;
        account.locked_margin = account.locked_margin.safe_sub(amount)?;
        if account.locked_margin.is_negative() {
            account.locked_margin = Decimal::ZERO;
        }
        Ok(())
    }

    pub fn insert_loaded(&mut self, account: Account) {
        self.accounts.insert(account.trader_id.clone(), account);
    }
}
