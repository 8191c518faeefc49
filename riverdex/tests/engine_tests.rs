//! End-to-end pipeline tests: ordered transactions in, state mutations and
//! events out, everything through `end_block`.

use riverdex::{
    Decimal, Engine, EngineError, EngineEvent, MarketId, MarketStatus, OrderParams, OrderStatus,
    ScaleDistribution, ScaleParams, Side, StaticOracle, TimeInForce, TraderId, Transaction,
    TxResponse,
};

fn dec(s: &str) -> Decimal {
    s.parse().unwrap()
}

fn btc() -> MarketId {
    MarketId::new("BTC-USDC")
}

fn trader(s: &str) -> TraderId {
    TraderId::new(s)
}

fn oracle(prices: &[(&str, &str)]) -> StaticOracle {
    let mut oracle = StaticOracle::new();
    for (market, price) in prices {
        oracle.set_both(MarketId::new(*market), dec(price));
    }
    oracle
}

fn deposits(names: &[&str], amount: &str) -> Vec<Transaction> {
    names
        .iter()
        .map(|name| Transaction::Deposit {
            trader: trader(name),
            amount: dec(amount),
        })
        .collect()
}

fn order_id_of(response: &Result<TxResponse, EngineError>) -> u64 {
    match response.as_ref().unwrap() {
        TxResponse::Order { order_id, .. } => *order_id,
        other => panic!("expected order response, got {other:?}"),
    }
}

#[test]
fn test_price_time_priority_across_one_block() {
    let mut engine = Engine::with_default_markets(trader("gov"));
    let oracle = oracle(&[("BTC-USDC", "50000")]);

    let mut txs = deposits(&["a", "b", "c"], "1000000");
    txs.push(Transaction::PlaceOrder(OrderParams::limit(
        "a",
        "BTC-USDC",
        Side::Sell,
        dec("50000"),
        dec("1"),
    )));
    txs.push(Transaction::PlaceOrder(OrderParams::limit(
        "b",
        "BTC-USDC",
        Side::Sell,
        dec("50000"),
        dec("1"),
    )));
    txs.push(Transaction::PlaceOrder(OrderParams::market(
        "c",
        "BTC-USDC",
        Side::Buy,
        dec("1"),
    )));

    let outcome = engine.end_block(&oracle, txs, 1, 1);
    let a_order = order_id_of(&outcome.receipts[3].result);
    let b_order = order_id_of(&outcome.receipts[4].result);

    match outcome.receipts[5].result.as_ref().unwrap() {
        TxResponse::Order { result, .. } => {
            assert_eq!(result.trades.len(), 1);
            assert_eq!(result.trades[0].maker_order, a_order);
            assert_eq!(result.trades[0].price, dec("50000"));
            assert_eq!(result.trades[0].quantity, dec("1"));
            assert_eq!(result.status, OrderStatus::Filled);
        }
        other => panic!("unexpected response {other:?}"),
    }

    // seller B untouched at the top of the book
    let depth = engine.order_book_depth(&btc(), 5).unwrap();
    assert_eq!(depth.asks.len(), 1);
    assert_eq!(depth.asks[0].size, dec("1"));
    assert_eq!(engine.get_order(b_order).unwrap().status, OrderStatus::Open);

    // one trade event, block height stamped
    let trades: Vec<_> = outcome
        .events
        .iter()
        .filter(|r| matches!(r.event, EngineEvent::Trade { .. }))
        .collect();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].block_height, 1);

    engine.audit_invariants().unwrap();
}

#[test]
fn test_rejections_leave_no_trace() {
    let mut engine = Engine::with_default_markets(trader("gov"));
    let oracle = oracle(&[("BTC-USDC", "50000")]);

    let mut txs = deposits(&["maker", "taker"], "1000000");
    txs.push(Transaction::PlaceOrder(OrderParams::limit(
        "maker",
        "BTC-USDC",
        Side::Sell,
        dec("50000"),
        dec("0.4"),
    )));
    txs.push(Transaction::PlaceOrder(OrderParams::limit(
        "maker",
        "BTC-USDC",
        Side::Sell,
        dec("50010"),
        dec("0.4"),
    )));
    // FOK for more than the book holds
    txs.push(Transaction::PlaceOrder(
        OrderParams::market("taker", "BTC-USDC", Side::Buy, dec("1"))
            .with_tif(TimeInForce::Fok),
    ));
    // post-only that would cross
    txs.push(Transaction::PlaceOrder(
        OrderParams::limit("taker", "BTC-USDC", Side::Buy, dec("50000"), dec("0.1"))
            .with_tif(TimeInForce::PostOnly),
    ));

    let outcome = engine.end_block(&oracle, txs, 1, 1);
    assert_eq!(
        outcome.receipts[4].result.as_ref().unwrap_err(),
        &EngineError::FokUnfillable
    );
    assert_eq!(
        outcome.receipts[5].result.as_ref().unwrap_err(),
        &EngineError::PostOnlyCrossed
    );

    // book exactly as the maker left it; no trades anywhere
    let depth = engine.order_book_depth(&btc(), 5).unwrap();
    assert_eq!(depth.asks.len(), 2);
    assert_eq!(depth.asks[0].size, dec("0.4"));
    assert_eq!(depth.asks[1].size, dec("0.4"));
    assert_eq!(depth.bids.len(), 0);
    assert!(engine.trades().is_empty());

    // both rejections surfaced as events with deterministic codes
    let rejected: Vec<_> = outcome
        .events
        .iter()
        .filter_map(|r| match &r.event {
            EngineEvent::OrderRejected { code, .. } => Some(*code),
            _ => None,
        })
        .collect();
    assert_eq!(
        rejected,
        vec![
            EngineError::FokUnfillable.code(),
            EngineError::PostOnlyCrossed.code()
        ]
    );
}

#[test]
fn test_paused_market_blocks_placement_allows_cancel() {
    let mut engine = Engine::with_default_markets(trader("gov"));
    let oracle = oracle(&[("BTC-USDC", "50000")]);

    let mut txs = deposits(&["maker"], "1000000");
    txs.push(Transaction::PlaceOrder(OrderParams::limit(
        "maker",
        "BTC-USDC",
        Side::Sell,
        dec("50000"),
        dec("1"),
    )));
    let outcome = engine.end_block(&oracle, txs, 1, 1);
    let resting = order_id_of(&outcome.receipts[1].result);

    let txs = vec![
        Transaction::SetMarketStatus {
            auth: trader("gov"),
            market: btc(),
            status: MarketStatus::Paused,
        },
        Transaction::PlaceOrder(OrderParams::limit(
            "maker",
            "BTC-USDC",
            Side::Sell,
            dec("50100"),
            dec("1"),
        )),
        Transaction::CancelOrder {
            trader: trader("maker"),
            order_id: resting,
        },
    ];
    let outcome = engine.end_block(&oracle, txs, 2, 2);

    assert!(outcome.receipts[0].result.is_ok());
    assert_eq!(
        outcome.receipts[1].result.as_ref().unwrap_err(),
        &EngineError::MarketPaused
    );
    assert!(outcome.receipts[2].result.is_ok());
    assert_eq!(
        engine.get_order(resting).unwrap().status,
        OrderStatus::Cancelled
    );
}

#[test]
fn test_admin_requires_governance() {
    let mut engine = Engine::with_default_markets(trader("gov"));
    let oracle = oracle(&[]);

    let txs = vec![Transaction::SetMarketStatus {
        auth: trader("mallory"),
        market: btc(),
        status: MarketStatus::Paused,
    }];
    let outcome = engine.end_block(&oracle, txs, 1, 1);
    assert_eq!(
        outcome.receipts[0].result.as_ref().unwrap_err(),
        &EngineError::Unauthorized
    );
    assert_eq!(
        engine.get_market(&btc()).unwrap().status,
        MarketStatus::Active
    );
}

#[test]
fn test_deposit_withdraw_identity() {
    let mut engine = Engine::with_default_markets(trader("gov"));
    let oracle = oracle(&[]);

    let txs = vec![
        Transaction::Deposit {
            trader: trader("t"),
            amount: dec("1000"),
        },
        Transaction::Deposit {
            trader: trader("t"),
            amount: dec("250"),
        },
        Transaction::Withdraw {
            trader: trader("t"),
            amount: dec("150"),
        },
        Transaction::Withdraw {
            trader: trader("t"),
            amount: dec("100"),
        },
    ];
    let outcome = engine.end_block(&oracle, txs, 1, 1);
    assert!(outcome.receipts.iter().all(|r| r.result.is_ok()));
    assert_eq!(engine.get_account(&trader("t")).unwrap().balance, dec("1000"));

    // over-withdrawal is a clean rejection
    let txs = vec![Transaction::Withdraw {
        trader: trader("t"),
        amount: dec("1001"),
    }];
    let outcome = engine.end_block(&oracle, txs, 2, 2);
    assert_eq!(
        outcome.receipts[0].result.as_ref().unwrap_err(),
        &EngineError::InsufficientFree
    );
}

#[test]
fn test_conditional_triggers_through_pipeline() {
    let mut engine = Engine::with_default_markets(trader("gov"));

    // block 1: open bob long 1 against alice, arm a stop-loss, leave a bid
    let mut txs = deposits(&["alice", "bob", "carol"], "1000000");
    txs.push(Transaction::PlaceOrder(OrderParams::limit(
        "alice",
        "BTC-USDC",
        Side::Sell,
        dec("50000"),
        dec("1"),
    )));
    txs.push(Transaction::PlaceOrder(OrderParams::market(
        "bob",
        "BTC-USDC",
        Side::Buy,
        dec("1"),
    )));
    txs.push(Transaction::PlaceOrder(
        OrderParams {
            order_type: riverdex::OrderType::StopLoss,
            trigger_price: Some(dec("49000")),
            ..OrderParams::market("bob", "BTC-USDC", Side::Sell, dec("1"))
        }
        .reduce_only(),
    ));
    txs.push(Transaction::PlaceOrder(OrderParams::limit(
        "carol",
        "BTC-USDC",
        Side::Buy,
        dec("48900"),
        dec("2"),
    )));
    let outcome = engine.end_block(&oracle(&[("BTC-USDC", "50000")]), txs, 1, 1);
    assert!(outcome.receipts.iter().all(|r| r.result.is_ok()));
    assert!(engine.get_position(&btc(), &trader("bob")).is_some());

    // block 2: mark at the trigger, stop fires and closes into carol's bid
    let outcome = engine.end_block(&oracle(&[("BTC-USDC", "48900")]), Vec::new(), 2, 2);
    assert!(outcome
        .events
        .iter()
        .any(|r| matches!(r.event, EngineEvent::ConditionalTriggered { .. })));
    assert!(engine.get_position(&btc(), &trader("bob")).is_none());
    assert_eq!(
        engine.get_position(&btc(), &trader("carol")).unwrap().size,
        dec("1")
    );
    engine.audit_invariants().unwrap();
}

#[test]
fn test_twap_slices_through_pipeline() {
    let mut engine = Engine::with_default_markets(trader("gov"));
    let px = oracle(&[("BTC-USDC", "50000")]);

    let mut txs = deposits(&["maker", "twapper"], "10000000");
    txs.push(Transaction::PlaceTwap(riverdex::TwapParams {
        trader: trader("twapper"),
        market: btc(),
        side: Side::Buy,
        total_quantity: dec("0.3"),
        slice_count: 3,
        interval_secs: 60,
        slippage_tolerance: dec("0.05"),
    }));
    let outcome = engine.end_block(&px, txs, 0, 1);
    assert!(outcome.receipts.iter().all(|r| r.result.is_ok()));

    for (height, time) in [(2u64, 60i64), (3, 120), (4, 180)] {
        let txs = vec![Transaction::PlaceOrder(OrderParams::limit(
            "maker",
            "BTC-USDC",
            Side::Sell,
            dec("50000"),
            dec("0.1"),
        ))];
        engine.end_block(&px, txs, time, height);
    }

    // three slices of 0.1 accumulated; schedule completed
    let position = engine.get_position(&btc(), &trader("twapper")).unwrap();
    assert_eq!(position.size, dec("0.3"));
    engine.audit_invariants().unwrap();
}

#[test]
fn test_scale_fan_out_and_parent_cancel() {
    let mut engine = Engine::with_default_markets(trader("gov"));
    let px = oracle(&[("BTC-USDC", "50000")]);

    let mut txs = deposits(&["ladder"], "10000000");
    txs.push(Transaction::PlaceScale(ScaleParams {
        trader: trader("ladder"),
        market: btc(),
        side: Side::Buy,
        total_quantity: dec("0.4"),
        price_start: dec("49000"),
        price_end: dec("49600"),
        child_count: 4,
        distribution: ScaleDistribution::Linear,
    }));
    let outcome = engine.end_block(&px, txs, 1, 1);

    let (scale_id, children) = match outcome.receipts[1].result.as_ref().unwrap() {
        TxResponse::Scale { scale_id, children } => (*scale_id, children.clone()),
        other => panic!("unexpected response {other:?}"),
    };
    assert_eq!(children.len(), 4);

    let depth = engine.order_book_depth(&btc(), 10).unwrap();
    let prices: Vec<Decimal> = depth.bids.iter().map(|l| l.price).collect();
    assert_eq!(
        prices,
        vec![dec("49600"), dec("49400"), dec("49200"), dec("49000")]
    );
    assert!(depth.bids.iter().all(|l| l.size == dec("0.1")));

    let txs = vec![Transaction::CancelScale {
        trader: trader("ladder"),
        scale_id,
    }];
    engine.end_block(&px, txs, 2, 2);
    let depth = engine.order_book_depth(&btc(), 10).unwrap();
    assert!(depth.bids.is_empty());
    for child in children {
        assert_eq!(
            engine.get_order(child).unwrap().status,
            OrderStatus::Cancelled
        );
    }
}

#[test]
fn test_event_sequences_monotonic_per_kind() {
    let mut engine = Engine::with_default_markets(trader("gov"));
    let px = oracle(&[("BTC-USDC", "50000")]);

    let mut all = Vec::new();
    for height in 1..=3u64 {
        let mut txs = deposits(&["m", "t"], "1000000");
        txs.push(Transaction::PlaceOrder(OrderParams::limit(
            "m",
            "BTC-USDC",
            Side::Sell,
            dec("50000"),
            dec("0.1"),
        )));
        txs.push(Transaction::PlaceOrder(OrderParams::market(
            "t",
            "BTC-USDC",
            Side::Buy,
            dec("0.1"),
        )));
        let outcome = engine.end_block(&px, txs, height as i64, height);
        all.extend(outcome.events);
    }

    let mut last_seen: std::collections::BTreeMap<&'static str, u64> =
        std::collections::BTreeMap::new();
    for record in &all {
        let kind = record.event.kind();
        let previous = last_seen.insert(kind, record.sequence);
        if let Some(previous) = previous {
            assert_eq!(record.sequence, previous + 1, "gap in {kind} stream");
        } else {
            assert_eq!(record.sequence, 1, "stream {kind} must start at 1");
        }
    }

    let trade_events = all
        .iter()
        .filter(|r| matches!(r.event, EngineEvent::Trade { .. }))
        .count();
    assert_eq!(trade_events, 3);
}

#[test]
fn test_persistence_round_trip_through_pipeline() {
    let mut engine = Engine::with_default_markets(trader("gov"));
    let px = oracle(&[("BTC-USDC", "50000")]);

    let mut txs = deposits(&["m", "t"], "1000000");
    txs.push(Transaction::PlaceOrder(OrderParams::limit(
        "m",
        "BTC-USDC",
        Side::Sell,
        dec("50000"),
        dec("2"),
    )));
    txs.push(Transaction::PlaceOrder(OrderParams::market(
        "t",
        "BTC-USDC",
        Side::Buy,
        dec("1"),
    )));
    engine.end_block(&px, txs, 1, 1);

    let mut store = riverdex::MemStore::new();
    engine.persist(&mut store).unwrap();
    let mut restored = Engine::restore(&store).unwrap();

    assert_eq!(
        restored.order_book_depth(&btc(), 5).unwrap(),
        engine.order_book_depth(&btc(), 5).unwrap()
    );
    assert_eq!(
        restored.get_position(&btc(), &trader("t")),
        engine.get_position(&btc(), &trader("t"))
    );
    assert_eq!(restored.trades(), engine.trades());

    // the restored engine keeps running identically
    let txs = vec![Transaction::PlaceOrder(OrderParams::market(
        "t",
        "BTC-USDC",
        Side::Buy,
        dec("1"),
    ))];
    let a = engine.end_block(&px, txs.clone(), 2, 2);
    let b = restored.end_block(&px, txs, 2, 2);
    assert_eq!(a.events, b.events);
    restored.audit_invariants().unwrap();
}
