//! The state root and the end-of-block pipeline.
//!
//! One [`Engine`] is the replicated state machine's trading state. Inputs
//! are an ordered transaction list per block; every mutation funnels through
//! [`Engine::end_block`], which runs the fixed phase order:
//!
//! oracle refresh -> conditional/TWAP triggering -> matching -> funding ->
//! liquidations -> event flush.

use std::collections::BTreeMap;

use log::{error, warn};

use crate::account::AccountLedger;
use crate::book::{depth, OrderBook, OrderBookDepth};
use crate::conditional::{ConditionalOrder, ConditionalParams, ScaleParams, ScaleParent, TwapParams, TwapSchedule};
use crate::constants::{BACKSTOP_VAULT, PROTOCOL_LEDGER};
use crate::decimal::Decimal;
use crate::events::{EngineEvent, EventQueue, EventRecord};
use crate::funding::{FundingPayment, FundingRate};
use crate::liquidation::Liquidation;
use crate::market::{Market, MarketConfig, MarketPatch, MarketRegistry};
use crate::matching::{MatchResult, Order, OrderParams, Trade};
use crate::math::margin::{self, CrossSummary};
use crate::oracle::{MarkIndex, PriceOracle};
use crate::position::PositionStore;
use crate::types::{
    ConditionalId, EngineError, EngineResult, MarginMode, MarketId, MarketStatus, OrderId,
    ScaleId, TraderId, TwapId,
};

/// Global id counters. Persisted; never reset.
#[derive(
    Debug,
    Default,
    Clone,
    PartialEq,
    Eq,
    borsh::BorshSerialize,
    borsh::BorshDeserialize,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Counters {
    pub order_id: u64,
    pub trade_id: u64,
    pub conditional_id: u64,
    pub twap_id: u64,
    pub scale_id: u64,
    pub liquidation_id: u64,
    pub funding_payment_id: u64,
}

impl Counters {
    pub fn next_order_id(&mut self) -> u64 {
        self.order_id += 1;
        self.order_id
    }

    pub fn next_trade_id(&mut self) -> u64 {
        self.trade_id += 1;
        self.trade_id
    }

    pub fn next_conditional_id(&mut self) -> u64 {
        self.conditional_id += 1;
        self.conditional_id
    }

    pub fn next_twap_id(&mut self) -> u64 {
        self.twap_id += 1;
        self.twap_id
    }

    pub fn next_scale_id(&mut self) -> u64 {
        self.scale_id += 1;
        self.scale_id
    }

    pub fn next_liquidation_id(&mut self) -> u64 {
        self.liquidation_id += 1;
        self.liquidation_id
    }

    pub fn next_funding_payment_id(&mut self) -> u64 {
        self.funding_payment_id += 1;
        self.funding_payment_id
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Transaction {
    CreateMarket {
        auth: TraderId,
        config: MarketConfig,
    },
    UpdateMarket {
        auth: TraderId,
        market: MarketId,
        patch: MarketPatch,
    },
    SetMarketStatus {
        auth: TraderId,
        market: MarketId,
        status: MarketStatus,
    },
    Deposit {
        trader: TraderId,
        amount: Decimal,
    },
    Withdraw {
        trader: TraderId,
        amount: Decimal,
    },
    SetMarginMode {
        trader: TraderId,
        mode: MarginMode,
    },
    PlaceOrder(OrderParams),
    CancelOrder {
        trader: TraderId,
        order_id: OrderId,
    },
    ModifyOrder {
        trader: TraderId,
        order_id: OrderId,
        new_price: Option<Decimal>,
        new_quantity: Option<Decimal>,
    },
    PlaceConditional(ConditionalParams),
    CancelConditional {
        trader: TraderId,
        conditional_id: ConditionalId,
    },
    PlaceTwap(TwapParams),
    CancelTwap {
        trader: TraderId,
        twap_id: TwapId,
    },
    PlaceScale(ScaleParams),
    CancelScale {
        trader: TraderId,
        scale_id: ScaleId,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum TxResponse {
    Unit,
    Balance(Decimal),
    Order {
        order_id: OrderId,
        result: MatchResult,
    },
    Conditional {
        conditional_id: ConditionalId,
    },
    Twap {
        twap_id: TwapId,
    },
    Scale {
        scale_id: ScaleId,
        children: Vec<OrderId>,
    },
}

#[derive(Debug, Clone)]
pub struct TxReceipt {
    pub index: usize,
    pub result: Result<TxResponse, EngineError>,
}

#[derive(Debug, Clone)]
pub struct BlockOutcome {
    pub height: u64,
    pub receipts: Vec<TxReceipt>,
    pub events: Vec<EventRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionHealth {
    pub market: MarketId,
    pub trader: TraderId,
    pub margin_mode: MarginMode,
    pub notional: Decimal,
    pub unrealized_pnl: Decimal,
    pub equity: Decimal,
    pub maintenance: Decimal,
    pub healthy: bool,
}

/// An order the trigger phase queued for matching later in the same block.
#[derive(Debug, Clone)]
pub(crate) struct QueuedOrder {
    pub params: OrderParams,
    pub conditional_id: Option<ConditionalId>,
    pub twap_id: Option<TwapId>,
}

#[derive(Debug, Clone)]
pub struct Engine {
    pub(crate) governance: TraderId,
    pub(crate) registry: MarketRegistry,
    pub(crate) ledger: AccountLedger,
    pub(crate) positions: PositionStore,
    pub(crate) books: BTreeMap<MarketId, OrderBook>,
    pub(crate) orders: BTreeMap<OrderId, Order>,
    pub(crate) trades: Vec<Trade>,
    pub(crate) conditionals: BTreeMap<ConditionalId, ConditionalOrder>,
    pub(crate) twaps: BTreeMap<TwapId, TwapSchedule>,
    pub(crate) scales: BTreeMap<ScaleId, ScaleParent>,
    pub(crate) insurance: BTreeMap<MarketId, Decimal>,
    pub(crate) prices: BTreeMap<MarketId, MarkIndex>,
    pub(crate) next_funding: BTreeMap<MarketId, i64>,
    pub(crate) last_funding: BTreeMap<MarketId, FundingRate>,
    pub(crate) funding_payments: Vec<FundingPayment>,
    pub(crate) liquidations: Vec<Liquidation>,
    pub(crate) cooldowns: BTreeMap<(MarketId, TraderId), i64>,
    pub(crate) events: EventQueue,
    pub(crate) counters: Counters,
    pub(crate) block_time: i64,
    pub(crate) block_height: u64,
}

impl Engine {
    pub fn new(governance: TraderId) -> Engine {
        Engine {
            governance,
            registry: MarketRegistry::new(),
            ledger: AccountLedger::new(),
            positions: PositionStore::new(),
            books: BTreeMap::new(),
            orders: BTreeMap::new(),
            trades: Vec::new(),
            conditionals: BTreeMap::new(),
            twaps: BTreeMap::new(),
            scales: BTreeMap::new(),
            insurance: BTreeMap::new(),
            prices: BTreeMap::new(),
            next_funding: BTreeMap::new(),
            last_funding: BTreeMap::new(),
            funding_payments: Vec::new(),
            liquidations: Vec::new(),
            cooldowns: BTreeMap::new(),
            events: EventQueue::new(),
            counters: Counters::default(),
            block_time: 0,
            block_height: 0,
        }
    }

    /// Engine with the stock market set installed at genesis.
    pub fn with_default_markets(governance: TraderId) -> Engine {
        let mut engine = Engine::new(governance.clone());
        for config in crate::constants::default_markets() {
            engine
                .install_market(config, 0)
                .expect("default market set is valid");
        }
        engine
    }

    pub fn governance(&self) -> &TraderId {
        &self.governance
    }

    pub fn block_time(&self) -> i64 {
        self.block_time
    }

    pub fn block_height(&self) -> u64 {
        self.block_height
    }

    // ---- block pipeline ------------------------------------------------

    pub fn end_block(
        &mut self,
        oracle: &dyn PriceOracle,
        txs: Vec<Transaction>,
        time: i64,
        height: u64,
    ) -> BlockOutcome {
        self.block_time = time;
        self.block_height = height;

        // Phase 1: pin this block's oracle snapshot.
        self.refresh_prices(oracle);

        // Phase 2: conditional and TWAP triggering.
        let queued = self.run_trigger_phase();

        // Phase 3: transactions in consensus order, then triggered orders.
        let mut receipts = Vec::with_capacity(txs.len());
        for (index, tx) in txs.into_iter().enumerate() {
            let result = self.execute_transaction(tx);
            receipts.push(TxReceipt { index, result });
        }
        for queued_order in queued {
            self.execute_queued_order(queued_order);
        }

        // Phase 4: funding settlement where due.
        self.run_funding_phase();

        // Phase 5: liquidation scan.
        self.run_liquidation_phase();

        // Phase 6: event flush.
        BlockOutcome {
            height,
            receipts,
            events: self.events.drain(),
        }
    }

    fn refresh_prices(&mut self, oracle: &dyn PriceOracle) {
        let markets: Vec<MarketId> = self.registry.iter().map(|(id, _)| id.clone()).collect();
        for market in markets {
            if let Some(price) = oracle.price(&market) {
                self.prices.insert(market, price);
            }
        }
        self.refresh_cross_caches();
    }

    fn refresh_cross_caches(&mut self) {
        let mut caches: BTreeMap<TraderId, Decimal> = BTreeMap::new();
        for (_, position) in self.positions.iter() {
            if position.margin_mode != MarginMode::Cross {
                continue;
            }
            let Some(price) = self.prices.get(&position.market_id) else {
                continue;
            };
            let Ok(pnl) = margin::position_unrealized_pnl(position, price.mark) else {
                continue;
            };
            let entry = caches
                .entry(position.trader_id.clone())
                .or_insert(Decimal::ZERO);
            *entry = entry.safe_add(pnl).unwrap_or(*entry);
        }
        let traders: Vec<TraderId> = self.ledger.iter().map(|(id, _)| id.clone()).collect();
        for trader in traders {
            let cache = caches.remove(&trader).unwrap_or(Decimal::ZERO);
            self.ledger.ensure(&trader).cross_unrealized_pnl_cache = cache;
        }
    }

    /// Runs one transaction against a snapshot; any error restores the
    /// pre-transaction state, mirroring the host's rollback guarantee.
    pub fn execute_transaction(&mut self, tx: Transaction) -> Result<TxResponse, EngineError> {
        let rejection_keys = order_rejection_keys(&tx);
        let snapshot = self.clone();
        match self.dispatch(tx) {
            Ok(response) => Ok(response),
            Err(err) => {
                *self = snapshot;
                if let Some((market, trader, client_order_id)) = rejection_keys {
                    self.events.emit(
                        self.block_height,
                        EngineEvent::OrderRejected {
                            market,
                            trader,
                            client_order_id,
                            code: err.code(),
                        },
                    );
                }
                Err(err)
            }
        }
    }

    fn dispatch(&mut self, tx: Transaction) -> Result<TxResponse, EngineError> {
        match tx {
            Transaction::CreateMarket { auth, config } => {
                self.require_governance(&auth)?;
                self.create_market(config)?;
                Ok(TxResponse::Unit)
            }
            Transaction::UpdateMarket { auth, market, patch } => {
                self.require_governance(&auth)?;
                self.registry.update(&market, &patch, self.block_time)?;
                self.events
                    .emit(self.block_height, EngineEvent::MarketUpdated { market });
                Ok(TxResponse::Unit)
            }
            Transaction::SetMarketStatus { auth, market, status } => {
                self.require_governance(&auth)?;
                self.registry.set_status(&market, status, self.block_time)?;
                self.events.emit(
                    self.block_height,
                    EngineEvent::MarketStatusChanged { market, status },
                );
                Ok(TxResponse::Unit)
            }
            Transaction::Deposit { trader, amount } => {
                let balance = self.ledger.deposit(&trader, amount)?;
                Ok(TxResponse::Balance(balance))
            }
            Transaction::Withdraw { trader, amount } => {
                let reservation = self.cross_withdraw_reservation(&trader)?;
                let balance = self.ledger.withdraw(&trader, amount, reservation)?;
                Ok(TxResponse::Balance(balance))
            }
            Transaction::SetMarginMode { trader, mode } => {
                let has_positions = self.positions.has_any(&trader);
                self.ledger.set_margin_mode(&trader, mode, has_positions)?;
                self.events.emit(
                    self.block_height,
                    EngineEvent::MarginModeChanged { trader, mode },
                );
                Ok(TxResponse::Unit)
            }
            Transaction::PlaceOrder(params) => {
                if params.order_type.is_conditional() {
                    let conditional_id = self.place_conditional(params.into_conditional()?)?;
                    return Ok(TxResponse::Conditional { conditional_id });
                }
                let (order_id, result) = self.place_order(params)?;
                Ok(TxResponse::Order { order_id, result })
            }
            Transaction::CancelOrder { trader, order_id } => {
                self.cancel_order(&trader, order_id)?;
                Ok(TxResponse::Unit)
            }
            Transaction::ModifyOrder {
                trader,
                order_id,
                new_price,
                new_quantity,
            } => {
                let (order_id, result) =
                    self.modify_order(&trader, order_id, new_price, new_quantity)?;
                Ok(TxResponse::Order { order_id, result })
            }
            Transaction::PlaceConditional(params) => {
                let conditional_id = self.place_conditional(params)?;
                Ok(TxResponse::Conditional { conditional_id })
            }
            Transaction::CancelConditional {
                trader,
                conditional_id,
            } => {
                self.cancel_conditional(&trader, conditional_id)?;
                Ok(TxResponse::Unit)
            }
            Transaction::PlaceTwap(params) => {
                let twap_id = self.place_twap(params)?;
                Ok(TxResponse::Twap { twap_id })
            }
            Transaction::CancelTwap { trader, twap_id } => {
                self.cancel_twap(&trader, twap_id)?;
                Ok(TxResponse::Unit)
            }
            Transaction::PlaceScale(params) => {
                let (scale_id, children) = self.place_scale(params)?;
                Ok(TxResponse::Scale { scale_id, children })
            }
            Transaction::CancelScale { trader, scale_id } => {
                self.cancel_scale(&trader, scale_id)?;
                Ok(TxResponse::Unit)
            }
        }
    }

    /// Triggered/TWAP orders run after user transactions. Failures reject
    /// quietly (event only): there is no submitter to receive an error.
    fn execute_queued_order(&mut self, queued: QueuedOrder) {
        let snapshot = self.clone();
        let market = queued.params.market.clone();
        let trader = queued.params.trader.clone();
        let conditional_id = queued.conditional_id;
        let twap_id = queued.twap_id;
        match self.execute_triggered(queued) {
            Ok(order_id) => {
                if let Some(conditional_id) = conditional_id {
                    self.events.emit(
                        self.block_height,
                        EngineEvent::ConditionalTriggered {
                            conditional_id,
                            market,
                            trader,
                            order_id,
                        },
                    );
                }
            }
            Err(err) => {
                *self = snapshot;
                warn!("queued order for {trader} on {market} rejected: {err}");
                // A triggered conditional is consumed even when its order is
                // rejected; it must not re-arm next block.
                if let Some(conditional_id) = conditional_id {
                    self.conditionals.remove(&conditional_id);
                }
                if let Some(twap_id) = twap_id {
                    if let Some(schedule) = self.twaps.get_mut(&twap_id) {
                        schedule.mark_rejected();
                    }
                }
                self.events.emit(
                    self.block_height,
                    EngineEvent::OrderRejected {
                        market,
                        trader,
                        client_order_id: None,
                        code: err.code(),
                    },
                );
            }
        }
    }

    // ---- market administration ----------------------------------------

    pub(crate) fn require_governance(&self, auth: &TraderId) -> EngineResult<()> {
        if auth != &self.governance {
            return Err(EngineError::Unauthorized);
        }
        Ok(())
    }

    fn create_market(&mut self, config: MarketConfig) -> EngineResult<()> {
        let market = self.install_market(config, self.block_time)?;
        self.events
            .emit(self.block_height, EngineEvent::MarketCreated { market });
        Ok(())
    }

    /// Registry insert plus the per-market satellites (book, insurance
    /// fund, funding clock).
    pub(crate) fn install_market(
        &mut self,
        config: MarketConfig,
        now: i64,
    ) -> EngineResult<MarketId> {
        let market = self.registry.create(config, now)?;
        let id = market.id.clone();
        let interval = market.funding_interval_secs;
        self.books.insert(id.clone(), OrderBook::new(id.clone()));
        self.insurance.entry(id.clone()).or_insert(Decimal::ZERO);
        self.next_funding.insert(id.clone(), now + interval);
        Ok(id)
    }

    // ---- shared helpers -------------------------------------------------

    pub(crate) fn market(&self, id: &MarketId) -> EngineResult<Market> {
        Ok(self.registry.get(id)?.clone())
    }

    pub(crate) fn book_mut(&mut self, id: &MarketId) -> EngineResult<&mut OrderBook> {
        self.books.get_mut(id).ok_or(EngineError::MarketNotFound)
    }

    pub(crate) fn book(&self, id: &MarketId) -> EngineResult<&OrderBook> {
        self.books.get(id).ok_or(EngineError::MarketNotFound)
    }

    pub(crate) fn mark_price(&self, id: &MarketId) -> Option<Decimal> {
        self.prices.get(id).map(|p| p.mark)
    }

    /// `(mark, maintenance_rate, initial_rate)` resolver for cross margin
    /// walks. Markets without a pinned price resolve to `None`.
    pub(crate) fn cross_rates(
        &self,
    ) -> impl Fn(&MarketId) -> Option<(Decimal, Decimal, Decimal)> + '_ {
        move |id: &MarketId| {
            let price = self.prices.get(id)?;
            let market = self.registry.get(id).ok()?;
            Some((
                price.mark,
                market.maintenance_margin_rate,
                market.initial_margin_rate,
            ))
        }
    }

    pub(crate) fn cross_summary_for(&self, trader: &TraderId) -> EngineResult<CrossSummary> {
        let positions = self
            .positions
            .iter_trader(trader)
            .filter(|p| p.margin_mode == MarginMode::Cross);
        margin::cross_summary(positions, self.cross_rates())
    }

    fn cross_withdraw_reservation(&self, trader: &TraderId) -> EngineResult<Decimal> {
        let summary = self.cross_summary_for(trader)?;
        margin::cross_withdraw_reservation(&summary)
    }

    pub(crate) fn fund_credit(&mut self, market: &MarketId, amount: Decimal) -> EngineResult<()> {
        if amount.is_negative() {
            self.fund_draw(market, amount.neg())?;
            return Ok(());
        }
        let fund = self
            .insurance
            .entry(market.clone())
            .or_insert(Decimal::ZERO);
        *fund = fund.safe_add(amount)?;
        Ok(())
    }

    /// Draws up to `amount` from the market's insurance fund; returns what
    /// was actually covered. The fund never goes negative.
    pub(crate) fn fund_draw(&mut self, market: &MarketId, amount: Decimal) -> EngineResult<Decimal> {
        let fund = self
            .insurance
            .entry(market.clone())
            .or_insert(Decimal::ZERO);
        let drawn = amount.min(*fund);
        *fund = fund.safe_sub(drawn)?;
        if drawn < amount {
            error!(
                "insurance fund of {market} depleted: uncovered {}",
                amount.safe_sub(drawn)?
            );
        }
        Ok(drawn)
    }

    /// Signed cash settlement with bad-debt absorption: a balance shortfall
    /// is drawn from the market's insurance fund.
    pub(crate) fn settle_cash(
        &mut self,
        market: &MarketId,
        trader: &TraderId,
        delta: Decimal,
    ) -> EngineResult<()> {
        let shortfall = self.ledger.settle_signed(trader, delta)?;
        if shortfall.is_positive() {
            self.fund_draw(market, shortfall)?;
        }
        Ok(())
    }

    // ---- queries --------------------------------------------------------

    pub fn get_market(&self, id: &MarketId) -> EngineResult<&Market> {
        self.registry.get(id)
    }

    pub fn list_markets(&self) -> Vec<&Market> {
        self.registry.iter().map(|(_, m)| m).collect()
    }

    pub fn order_book_depth(&self, id: &MarketId, levels: usize) -> EngineResult<OrderBookDepth> {
        Ok(depth(self.book(id)?, levels))
    }

    pub fn get_order(&self, order_id: OrderId) -> EngineResult<&Order> {
        self.orders.get(&order_id).ok_or(EngineError::OrderNotFound)
    }

    pub fn list_open_orders(&self, trader: &TraderId) -> Vec<&Order> {
        self.orders
            .values()
            .filter(|o| &o.trader == trader && !o.status.is_closed())
            .collect()
    }

    pub fn get_position(
        &self,
        market: &MarketId,
        trader: &TraderId,
    ) -> Option<&crate::position::Position> {
        self.positions.get(market, trader)
    }

    pub fn list_positions<'a>(&'a self, trader: &'a TraderId) -> Vec<&'a crate::position::Position> {
        self.positions.iter_trader(trader).collect()
    }

    pub fn get_funding(&self, market: &MarketId) -> Option<&FundingRate> {
        self.last_funding.get(market)
    }

    pub fn next_funding_time(&self, market: &MarketId) -> Option<i64> {
        self.next_funding.get(market).copied()
    }

    pub fn get_insurance_fund(&self, market: &MarketId) -> Decimal {
        self.insurance
            .get(market)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    pub fn get_account(&self, trader: &TraderId) -> Option<&crate::account::Account> {
        self.ledger.get(trader)
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    pub fn liquidations(&self) -> &[Liquidation] {
        &self.liquidations
    }

    pub fn funding_payments(&self) -> &[FundingPayment] {
        &self.funding_payments
    }

    /// `None` when the trader holds no position there. Arithmetic trouble
    /// cannot occur on committed state; it also reads as `None`.
    pub fn position_health(
        &self,
        market_id: &MarketId,
        trader: &TraderId,
    ) -> Option<PositionHealth> {
        let market = self.registry.get(market_id).ok()?;
        let position = self.positions.get(market_id, trader)?;
        let mark = self.mark_price(market_id).unwrap_or(position.entry_price);
        let notional = margin::position_notional(position, mark).ok()?;
        let unrealized_pnl = margin::position_unrealized_pnl(position, mark).ok()?;
        match position.margin_mode {
            MarginMode::Isolated => {
                let equity = margin::isolated_equity(position, mark).ok()?;
                let maintenance =
                    margin::maintenance_margin(notional, market.maintenance_margin_rate).ok()?;
                Some(PositionHealth {
                    market: market_id.clone(),
                    trader: trader.clone(),
                    margin_mode: MarginMode::Isolated,
                    notional,
                    unrealized_pnl,
                    equity,
                    maintenance,
                    healthy: equity >= maintenance,
                })
            }
            MarginMode::Cross => {
                let summary = self.cross_summary_for(trader).ok()?;
                let balance = self
                    .ledger
                    .get(trader)
                    .map(|a| a.balance)
                    .unwrap_or(Decimal::ZERO);
                let equity = margin::cross_equity(balance, &summary).ok()?;
                Some(PositionHealth {
                    market: market_id.clone(),
                    trader: trader.clone(),
                    margin_mode: MarginMode::Cross,
                    notional,
                    unrealized_pnl,
                    equity,
                    maintenance: summary.maintenance,
                    healthy: equity >= summary.maintenance,
                })
            }
        }
    }

    // ---- invariant audit ------------------------------------------------

    /// Post-block structural invariants. A violation is state corruption:
    /// callers (tests, the sim driver) treat `Err` as a halt.
    pub fn audit_invariants(&self) -> Result<(), String> {
        // open interest balances per market
        for (market_id, _) in self.registry.iter() {
            let mut long = Decimal::ZERO;
            let mut short = Decimal::ZERO;
            for position in self.positions.iter_market(market_id) {
                if position.size.is_negative() || position.size.is_zero() {
                    return Err(format!(
                        "position {}/{} has non-positive size",
                        market_id, position.trader_id
                    ));
                }
                match position.side {
                    crate::types::PositionSide::Long => {
                        long = long.safe_add(position.size).map_err(|e| e.to_string())?
                    }
                    crate::types::PositionSide::Short => {
                        short = short.safe_add(position.size).map_err(|e| e.to_string())?
                    }
                }
            }
            if long != short {
                return Err(format!(
                    "open interest imbalance on {market_id}: long {long} short {short}"
                ));
            }
        }

        // locked margin equals the sum of isolated position margins
        let mut locked: BTreeMap<TraderId, Decimal> = BTreeMap::new();
        for (_, position) in self.positions.iter() {
            if position.margin_mode == MarginMode::Isolated {
                let entry = locked
                    .entry(position.trader_id.clone())
                    .or_insert(Decimal::ZERO);
                *entry = entry.safe_add(position.margin).map_err(|e| e.to_string())?;
            }
        }
        for (trader, account) in self.ledger.iter() {
            let mut expected = locked.remove(trader).unwrap_or(Decimal::ZERO);
            for order in self.orders.values() {
                if &order.trader == trader && !order.status.is_closed() {
                    expected = expected
                        .safe_add(order.locked_margin)
                        .map_err(|e| e.to_string())?;
                }
            }
            if account.balance.is_negative() {
                return Err(format!("negative balance for {trader}"));
            }
            if account.locked_margin != expected {
                return Err(format!(
                    "locked margin mismatch for {trader}: ledger {} expected {}",
                    account.locked_margin, expected
                ));
            }
        }

        // insurance funds never negative
        for (market, fund) in &self.insurance {
            if fund.is_negative() {
                return Err(format!("negative insurance fund for {market}"));
            }
        }

        // order fill bookkeeping
        for order in self.orders.values() {
            if order.filled_quantity > order.quantity {
                return Err(format!("order {} overfilled", order.order_id));
            }
        }
        Ok(())
    }
}

fn order_rejection_keys(tx: &Transaction) -> Option<(MarketId, TraderId, Option<u64>)> {
    match tx {
        Transaction::PlaceOrder(params) => Some((
            params.market.clone(),
            params.trader.clone(),
            params.client_order_id,
        )),
        Transaction::PlaceConditional(params) => {
            Some((params.market.clone(), params.trader.clone(), None))
        }
        _ => None,
    }
}

/// Ledger identities reserved by the engine itself.
pub fn backstop_vault() -> TraderId {
    TraderId::new(BACKSTOP_VAULT)
}

pub fn protocol_ledger() -> TraderId {
    TraderId::new(PROTOCOL_LEDGER)
}
