//! Key-value persistence with stable key prefixes and borsh values.
//!
//! Keys are `prefix ‖ component ‖ …` with NUL-terminated string components
//! and big-endian integers, so a sorted scan of one family walks entities
//! in their deterministic engine order. Order books are not stored level by
//! level; they rebuild from the open orders of family 0x08, with family
//! 0x09 keeping each market's sequence watermark.

use std::collections::BTreeMap;
use std::fmt;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::account::Account;
use crate::book::{BookOrder, OrderBook};
use crate::conditional::{ConditionalOrder, ScaleParent, TwapSchedule};
use crate::decimal::Decimal;
use crate::engine::{Counters, Engine};
use crate::funding::{FundingPayment, FundingRate};
use crate::liquidation::Liquidation;
use crate::market::Market;
use crate::matching::{Order, Trade};
use crate::oracle::MarkIndex;
use crate::types::{MarketId, TraderId};

pub mod prefix {
    pub const MARKET: u8 = 0x01;
    pub const POSITION: u8 = 0x02;
    pub const ACCOUNT: u8 = 0x03;
    pub const PRICE: u8 = 0x04;
    pub const FUNDING_RATE: u8 = 0x05;
    pub const FUNDING_PAYMENT: u8 = 0x06;
    pub const NEXT_FUNDING_TIME: u8 = 0x07;
    pub const ORDER: u8 = 0x08;
    pub const ORDER_BOOK: u8 = 0x09;
    pub const TRADE: u8 = 0x0A;
    pub const CONDITIONAL: u8 = 0x0B;
    pub const LIQUIDATION: u8 = 0x0C;
    pub const INSURANCE_FUND: u8 = 0x0D;
    pub const TWAP: u8 = 0x0E;
    pub const SCALE: u8 = 0x0F;
    pub const COUNTERS: u8 = 0x10;
    pub const EVENT_SEQUENCE: u8 = 0x11;
    pub const COOLDOWN: u8 = 0x12;
    pub const META: u8 = 0x13;
}

#[derive(Debug)]
pub enum StorageError {
    Encode(std::io::Error),
    Decode(std::io::Error),
    MissingFamily(u8),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Encode(e) => write!(f, "encode failed: {e}"),
            StorageError::Decode(e) => write!(f, "decode failed: {e}"),
            StorageError::MissingFamily(p) => write!(f, "missing key family 0x{p:02x}"),
        }
    }
}

impl std::error::Error for StorageError {}

pub trait KvStore {
    fn set(&mut self, key: Vec<u8>, value: Vec<u8>);
    fn get(&self, key: &[u8]) -> Option<&[u8]>;
    fn scan_prefix<'a>(
        &'a self,
        prefix: &'a [u8],
    ) -> Box<dyn Iterator<Item = (&'a [u8], &'a [u8])> + 'a>;
    fn clear(&mut self);
}

/// Sorted in-memory store; the shape the host's database is expected to
/// mirror.
#[derive(Debug, Default, Clone)]
pub struct MemStore {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl MemStore {
    pub fn new() -> MemStore {
        MemStore::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KvStore for MemStore {
    fn set(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.entries.insert(key, value);
    }

    fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.entries.get(key).map(|v| v.as_slice())
    }

    fn scan_prefix<'a>(
        &'a self,
        prefix: &'a [u8],
    ) -> Box<dyn Iterator<Item = (&'a [u8], &'a [u8])> + 'a> {
        Box::new(
            self.entries
                .range(prefix.to_vec()..)
                .take_while(move |(k, _)| k.starts_with(prefix))
                .map(|(k, v)| (k.as_slice(), v.as_slice())),
        )
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

fn key1(prefix: u8, id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 + id.len());
    key.push(prefix);
    key.extend_from_slice(id.as_bytes());
    key.push(0);
    key
}

fn key2(prefix: u8, a: &str, b: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(3 + a.len() + b.len());
    key.push(prefix);
    key.extend_from_slice(a.as_bytes());
    key.push(0);
    key.extend_from_slice(b.as_bytes());
    key.push(0);
    key
}

fn key_u64(prefix: u8, id: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(prefix);
    key.extend_from_slice(&id.to_be_bytes());
    key
}

fn encode<T: BorshSerialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    borsh::to_vec(value).map_err(StorageError::Encode)
}

fn decode<T: BorshDeserialize>(bytes: &[u8]) -> Result<T, StorageError> {
    T::try_from_slice(bytes).map_err(StorageError::Decode)
}

#[derive(Debug, Clone, BorshSerialize, BorshDeserialize)]
struct EngineMeta {
    governance: TraderId,
    block_time: i64,
    block_height: u64,
}

impl Engine {
    /// Writes the full engine state as one deterministic snapshot.
    pub fn persist(&self, store: &mut dyn KvStore) -> Result<(), StorageError> {
        store.clear();

        for (id, market) in self.registry.iter() {
            store.set(key1(prefix::MARKET, &id.0), encode(market)?);
        }
        for ((market, trader), position) in self.positions.iter() {
            store.set(
                key2(prefix::POSITION, &market.0, &trader.0),
                encode(position)?,
            );
        }
        for (trader, account) in self.ledger.iter() {
            store.set(key1(prefix::ACCOUNT, &trader.0), encode(account)?);
        }
        for (market, price) in &self.prices {
            store.set(key1(prefix::PRICE, &market.0), encode(price)?);
        }
        for (market, rate) in &self.last_funding {
            store.set(key1(prefix::FUNDING_RATE, &market.0), encode(rate)?);
        }
        for payment in &self.funding_payments {
            store.set(
                key_u64(prefix::FUNDING_PAYMENT, payment.payment_id),
                encode(payment)?,
            );
        }
        for (market, next) in &self.next_funding {
            store.set(key1(prefix::NEXT_FUNDING_TIME, &market.0), encode(next)?);
        }
        for (order_id, order) in &self.orders {
            store.set(key_u64(prefix::ORDER, *order_id), encode(order)?);
        }
        for (market, book) in &self.books {
            store.set(
                key1(prefix::ORDER_BOOK, &market.0),
                encode(&book.sequence_watermark())?,
            );
        }
        for trade in &self.trades {
            store.set(key_u64(prefix::TRADE, trade.trade_id), encode(trade)?);
        }
        for (conditional_id, conditional) in &self.conditionals {
            store.set(
                key_u64(prefix::CONDITIONAL, *conditional_id),
                encode(conditional)?,
            );
        }
        for liquidation in &self.liquidations {
            store.set(
                key_u64(prefix::LIQUIDATION, liquidation.liquidation_id),
                encode(liquidation)?,
            );
        }
        for (market, fund) in &self.insurance {
            store.set(key1(prefix::INSURANCE_FUND, &market.0), encode(fund)?);
        }
        for (twap_id, schedule) in &self.twaps {
            store.set(key_u64(prefix::TWAP, *twap_id), encode(schedule)?);
        }
        for (scale_id, parent) in &self.scales {
            store.set(key_u64(prefix::SCALE, *scale_id), encode(parent)?);
        }
        store.set(vec![prefix::COUNTERS], encode(&self.counters)?);
        for (kind, sequence) in self.events.sequences() {
            store.set(key1(prefix::EVENT_SEQUENCE, kind), encode(sequence)?);
        }
        for ((market, trader), until) in &self.cooldowns {
            store.set(
                key2(prefix::COOLDOWN, &market.0, &trader.0),
                encode(until)?,
            );
        }
        store.set(
            vec![prefix::META],
            encode(&EngineMeta {
                governance: self.governance.clone(),
                block_time: self.block_time,
                block_height: self.block_height,
            })?,
        );
        Ok(())
    }

    /// Rebuilds an engine from a snapshot written by [`Engine::persist`].
    pub fn restore(store: &dyn KvStore) -> Result<Engine, StorageError> {
        let meta_bytes = store
            .get(&[prefix::META])
            .ok_or(StorageError::MissingFamily(prefix::META))?;
        let meta: EngineMeta = decode(meta_bytes)?;

        let mut engine = Engine::new(meta.governance);
        engine.block_time = meta.block_time;
        engine.block_height = meta.block_height;

        for (_, bytes) in store.scan_prefix(&[prefix::MARKET]) {
            let market: Market = decode(bytes)?;
            let id = market.id.clone();
            engine.registry.insert_loaded(market);
            engine.books.insert(id.clone(), OrderBook::new(id));
        }
        for (_, bytes) in store.scan_prefix(&[prefix::POSITION]) {
            let position: crate::position::Position = decode(bytes)?;
            engine.positions.insert_loaded(position);
        }
        for (_, bytes) in store.scan_prefix(&[prefix::ACCOUNT]) {
            let account: Account = decode(bytes)?;
            engine.ledger.insert_loaded(account);
        }
        for (key, bytes) in store.scan_prefix(&[prefix::PRICE]) {
            let market = string_component(key)?;
            let price: MarkIndex = decode(bytes)?;
            engine.prices.insert(MarketId::new(market), price);
        }
        for (_, bytes) in store.scan_prefix(&[prefix::FUNDING_RATE]) {
            let rate: FundingRate = decode(bytes)?;
            engine.last_funding.insert(rate.market.clone(), rate);
        }
        for (_, bytes) in store.scan_prefix(&[prefix::FUNDING_PAYMENT]) {
            let payment: FundingPayment = decode(bytes)?;
            engine.funding_payments.push(payment);
        }
        for (key, bytes) in store.scan_prefix(&[prefix::NEXT_FUNDING_TIME]) {
            let market = string_component(key)?;
            let next: i64 = decode(bytes)?;
            engine.next_funding.insert(MarketId::new(market), next);
        }
        for (_, bytes) in store.scan_prefix(&[prefix::ORDER]) {
            let order: Order = decode(bytes)?;
            engine.orders.insert(order.order_id, order);
        }
        for (key, bytes) in store.scan_prefix(&[prefix::ORDER_BOOK]) {
            let market = MarketId::new(string_component(key)?);
            let watermark: u64 = decode(bytes)?;
            if let Some(book) = engine.books.get_mut(&market) {
                book.set_sequence_watermark(watermark);
            }
        }
        for (_, bytes) in store.scan_prefix(&[prefix::TRADE]) {
            let trade: Trade = decode(bytes)?;
            engine.trades.push(trade);
        }
        for (_, bytes) in store.scan_prefix(&[prefix::CONDITIONAL]) {
            let conditional: ConditionalOrder = decode(bytes)?;
            engine
                .conditionals
                .insert(conditional.conditional_id, conditional);
        }
        for (_, bytes) in store.scan_prefix(&[prefix::LIQUIDATION]) {
            let liquidation: Liquidation = decode(bytes)?;
            engine.liquidations.push(liquidation);
        }
        for (key, bytes) in store.scan_prefix(&[prefix::INSURANCE_FUND]) {
            let market = string_component(key)?;
            let fund: Decimal = decode(bytes)?;
            engine.insurance.insert(MarketId::new(market), fund);
        }
        for (_, bytes) in store.scan_prefix(&[prefix::TWAP]) {
            let schedule: TwapSchedule = decode(bytes)?;
            engine.twaps.insert(schedule.twap_id, schedule);
        }
        for (_, bytes) in store.scan_prefix(&[prefix::SCALE]) {
            let parent: ScaleParent = decode(bytes)?;
            engine.scales.insert(parent.scale_id, parent);
        }
        if let Some(bytes) = store.get(&[prefix::COUNTERS]) {
            engine.counters = decode::<Counters>(bytes)?;
        }
        let mut sequences = BTreeMap::new();
        for (key, bytes) in store.scan_prefix(&[prefix::EVENT_SEQUENCE]) {
            sequences.insert(string_component(key)?, decode::<u64>(bytes)?);
        }
        engine.events.restore_sequences(sequences);
        for (key, bytes) in store.scan_prefix(&[prefix::COOLDOWN]) {
            let (market, trader) = two_string_components(key)?;
            engine.cooldowns.insert(
                (MarketId::new(market), TraderId::new(trader)),
                decode(bytes)?,
            );
        }

        // Resting orders flow back onto their books.
        let resting: Vec<(MarketId, BookOrder)> = engine
            .orders
            .values()
            .filter(|o| !o.status.is_closed())
            .filter_map(|o| {
                Some((
                    o.market.clone(),
                    BookOrder {
                        order_id: o.order_id,
                        trader: o.trader.clone(),
                        side: o.side,
                        price: o.price?,
                        remaining: o.remaining(),
                        hidden: o.flags.hidden,
                        reduce_only: o.flags.reduce_only,
                        sequence: o.sequence,
                    },
                ))
            })
            .collect();
        for (market, order) in resting {
            if let Some(book) = engine.books.get_mut(&market) {
                book.insert(order);
            }
        }
        Ok(engine)
    }
}

fn string_component(key: &[u8]) -> Result<String, StorageError> {
    let body = &key[1..];
    let end = body
        .iter()
        .position(|b| *b == 0)
        .unwrap_or(body.len());
    Ok(String::from_utf8_lossy(&body[..end]).into_owned())
}

fn two_string_components(key: &[u8]) -> Result<(String, String), StorageError> {
    let body = &key[1..];
    let first_end = body.iter().position(|b| *b == 0).unwrap_or(body.len());
    let rest = &body[(first_end + 1).min(body.len())..];
    let second_end = rest.iter().position(|b| *b == 0).unwrap_or(rest.len());
    Ok((
        String::from_utf8_lossy(&body[..first_end]).into_owned(),
        String::from_utf8_lossy(&rest[..second_end]).into_owned(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::OrderParams;
    use crate::oracle::MarkIndex;
    use crate::types::{OrderType, Side};

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn populated_engine() -> Engine {
        let mut engine = Engine::with_default_markets(TraderId::new("gov"));
        engine.prices.insert(
            MarketId::new("BTC-USDC"),
            MarkIndex {
                mark: dec("50000"),
                index: dec("49990"),
            },
        );
        for name in ["alice", "bob"] {
            engine
                .ledger
                .deposit(&TraderId::new(name), dec("1000000"))
                .unwrap();
        }
        engine
            .place_order(OrderParams::limit(
                "alice", "BTC-USDC", Side::Sell, dec("50000"), dec("2"),
            ))
            .unwrap();
        engine
            .place_order(OrderParams::market("bob", "BTC-USDC", Side::Buy, dec("1")))
            .unwrap();
        engine
            .place_conditional(crate::conditional::ConditionalParams {
                trader: TraderId::new("bob"),
                market: MarketId::new("BTC-USDC"),
                side: Side::Sell,
                order_type: OrderType::StopLoss,
                limit_price: None,
                quantity: dec("1"),
                trigger_price: dec("48000"),
                reduce_only: true,
            })
            .unwrap();
        engine
    }

    #[test]
    fn test_round_trip_preserves_state() {
        let engine = populated_engine();
        let mut store = MemStore::new();
        engine.persist(&mut store).unwrap();
        assert!(!store.is_empty());

        let restored = Engine::restore(&store).unwrap();

        // entities
        assert_eq!(restored.list_markets().len(), 4);
        assert_eq!(
            restored.get_account(&TraderId::new("bob")).unwrap(),
            engine.get_account(&TraderId::new("bob")).unwrap()
        );
        let market = MarketId::new("BTC-USDC");
        assert_eq!(
            restored.get_position(&market, &TraderId::new("bob")),
            engine.get_position(&market, &TraderId::new("bob"))
        );
        assert_eq!(restored.trades(), engine.trades());
        assert_eq!(restored.conditionals, engine.conditionals);
        assert_eq!(restored.counters, engine.counters);
        assert_eq!(
            restored.get_insurance_fund(&market),
            engine.get_insurance_fund(&market)
        );
        assert_eq!(
            restored.next_funding_time(&market),
            engine.next_funding_time(&market)
        );

        // book rebuilt: alice's remaining 1 BTC ask is live again
        let depth = restored.order_book_depth(&market, 5).unwrap();
        assert_eq!(depth.asks.len(), 1);
        assert_eq!(depth.asks[0].price, dec("50000"));
        assert_eq!(depth.asks[0].size, dec("1"));

        // sequence watermark survives: the next order continues the stream
        assert_eq!(
            restored.book(&market).unwrap().sequence_watermark(),
            engine.book(&market).unwrap().sequence_watermark()
        );
    }

    #[test]
    fn test_restore_requires_meta() {
        let store = MemStore::new();
        assert!(matches!(
            Engine::restore(&store),
            Err(StorageError::MissingFamily(_))
        ));
    }

    #[test]
    fn test_prefix_scan_isolation() {
        let mut store = MemStore::new();
        store.set(key1(prefix::MARKET, "BTC-USDC"), vec![1]);
        store.set(key1(prefix::ACCOUNT, "alice"), vec![2]);
        store.set(key1(prefix::MARKET, "ETH-USDC"), vec![3]);

        let markets: Vec<_> = store.scan_prefix(&[prefix::MARKET]).collect();
        assert_eq!(markets.len(), 2);
        let accounts: Vec<_> = store.scan_prefix(&[prefix::ACCOUNT]).collect();
        assert_eq!(accounts.len(), 1);
    }
}
