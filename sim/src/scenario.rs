//! Scenario inputs: a block list either loaded from JSON or generated by
//! the built-in demo script.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use riverdex::{
    Decimal, MarginMode, MarketId, OrderFlags, OrderParams, OrderType, ScaleDistribution,
    ScaleParams, Side, TimeInForce, TraderId, Transaction, TwapParams,
};

pub const GOVERNANCE: &str = "governance";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricePoint {
    pub market: MarketId,
    pub mark: Decimal,
    pub index: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockInput {
    pub time: i64,
    pub height: u64,
    pub prices: Vec<PricePoint>,
    pub txs: Vec<Transaction>,
}

pub fn load(path: &Path) -> Result<Vec<BlockInput>, Box<dyn std::error::Error>> {
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

pub fn tx_trader(tx: &Transaction) -> Option<TraderId> {
    match tx {
        Transaction::Deposit { trader, .. }
        | Transaction::Withdraw { trader, .. }
        | Transaction::SetMarginMode { trader, .. }
        | Transaction::CancelOrder { trader, .. }
        | Transaction::ModifyOrder { trader, .. }
        | Transaction::CancelConditional { trader, .. }
        | Transaction::CancelTwap { trader, .. }
        | Transaction::CancelScale { trader, .. } => Some(trader.clone()),
        Transaction::PlaceOrder(params) => Some(params.trader.clone()),
        Transaction::PlaceConditional(params) => Some(params.trader.clone()),
        Transaction::PlaceTwap(params) => Some(params.trader.clone()),
        Transaction::PlaceScale(params) => Some(params.trader.clone()),
        Transaction::CreateMarket { .. }
        | Transaction::UpdateMarket { .. }
        | Transaction::SetMarketStatus { .. } => None,
    }
}

fn dec(s: &str) -> Decimal {
    s.parse().expect("scenario constant")
}

/// Per-block BTC drift of the demo path. Down-trending tail so the stop
/// loss and the liquidation both get exercised.
const DRIFTS: [i64; 16] = [
    0, 150, -100, 200, -250, 100, -400, -300, 150, -600, -500, -800, -1200, -900, -400, 300,
];

/// Scripted session on BTC-USDC: a market maker quoting a ladder, a TWAP
/// buyer, a scale ladder, a stop-loss and an over-levered long that the
/// down-leg forces through liquidation.
pub fn demo(blocks: u64) -> Vec<BlockInput> {
    let market = MarketId::new("BTC-USDC");
    let mut out = Vec::new();
    let mut price = 50_000i64;

    for height in 1..=blocks {
        let time = height as i64 * 60;
        price += DRIFTS[((height - 1) as usize) % DRIFTS.len()];
        let price_dec = Decimal::int(price);

        let mut txs: Vec<Transaction> = Vec::new();
        if height == 1 {
            for (name, amount) in [
                ("mm", "5000000"),
                ("twapper", "1000000"),
                ("ladder", "1000000"),
                ("degen", "6000"),
            ] {
                txs.push(Transaction::Deposit {
                    trader: TraderId::new(name),
                    amount: dec(amount),
                });
            }
            txs.push(Transaction::SetMarginMode {
                trader: TraderId::new("degen"),
                mode: MarginMode::Isolated,
            });
        }

        // the maker keeps a two-sided ladder around the path
        for step in 1..=3i64 {
            let offset = Decimal::int(step * 20);
            txs.push(Transaction::PlaceOrder(OrderParams::limit(
                "mm",
                "BTC-USDC",
                Side::Sell,
                price_dec.safe_add(offset).expect("demo price"),
                dec("0.5"),
            )));
            txs.push(Transaction::PlaceOrder(OrderParams::limit(
                "mm",
                "BTC-USDC",
                Side::Buy,
                price_dec.safe_sub(offset).expect("demo price"),
                dec("0.5"),
            )));
        }

        match height {
            2 => {
                // over-levered isolated long, with a protective stop that
                // will not save it on the deep leg
                txs.push(Transaction::PlaceOrder(OrderParams::market(
                    "degen",
                    "BTC-USDC",
                    Side::Buy,
                    dec("1"),
                )));
                txs.push(Transaction::PlaceOrder(OrderParams {
                    trader: TraderId::new("degen"),
                    market: market.clone(),
                    side: Side::Sell,
                    order_type: OrderType::StopLoss,
                    price: None,
                    quantity: dec("0.5"),
                    time_in_force: TimeInForce::Ioc,
                    flags: OrderFlags {
                        reduce_only: true,
                        post_only: false,
                        hidden: false,
                    },
                    trigger_price: Decimal::int(price - 700).into(),
                    client_order_id: Some(7),
                }));
            }
            3 => {
                txs.push(Transaction::PlaceTwap(TwapParams {
                    trader: TraderId::new("twapper"),
                    market: market.clone(),
                    side: Side::Buy,
                    total_quantity: dec("0.6"),
                    slice_count: 6,
                    interval_secs: 60,
                    slippage_tolerance: dec("0.02"),
                }));
            }
            4 => {
                txs.push(Transaction::PlaceScale(ScaleParams {
                    trader: TraderId::new("ladder"),
                    market: market.clone(),
                    side: Side::Buy,
                    total_quantity: dec("0.4"),
                    price_start: Decimal::int(price - 400),
                    price_end: Decimal::int(price - 100),
                    child_count: 4,
                    distribution: ScaleDistribution::Linear,
                }));
            }
            _ => {}
        }

        out.push(BlockInput {
            time,
            height,
            prices: vec![PricePoint {
                market: market.clone(),
                mark: price_dec,
                index: price_dec,
            }],
            txs,
        });
    }
    out
}
