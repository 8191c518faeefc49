//! Deterministic block-replay driver for the riverdex core.
//!
//! Feeds scripted blocks (oracle prices + ordered transactions) through the
//! engine and prints the event stream as JSON lines. `demo` runs a built-in
//! session; `replay` takes a scenario file.

mod scenario;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use log::{error, warn};
use riverdex::{Engine, StaticOracle, TraderId};

use crate::scenario::BlockInput;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the built-in demo session
    Demo {
        /// Number of blocks to simulate
        #[arg(long, default_value_t = 16)]
        blocks: u64,
    },

    /// Replay a JSON scenario file
    Replay {
        /// Path to a JSON array of block inputs
        path: PathBuf,
    },
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let blocks = match cli.command {
        Commands::Demo { blocks } => scenario::demo(blocks),
        Commands::Replay { path } => match scenario::load(&path) {
            Ok(blocks) => blocks,
            Err(err) => {
                error!("failed to load scenario {}: {err}", path.display());
                return ExitCode::FAILURE;
            }
        },
    };

    run(blocks)
}

fn run(blocks: Vec<BlockInput>) -> ExitCode {
    let mut engine = Engine::with_default_markets(TraderId::new(scenario::GOVERNANCE));
    let mut traders = std::collections::BTreeSet::new();

    for block in blocks {
        let mut oracle = StaticOracle::new();
        for point in &block.prices {
            oracle.set(point.market.clone(), point.mark, point.index);
        }
        for tx in &block.txs {
            if let Some(trader) = scenario::tx_trader(tx) {
                traders.insert(trader);
            }
        }

        let outcome = engine.end_block(&oracle, block.txs, block.time, block.height);

        for receipt in &outcome.receipts {
            if let Err(err) = &receipt.result {
                warn!(
                    "block {} tx {} rejected: {err} (code {})",
                    block.height,
                    receipt.index,
                    err.code()
                );
            }
        }
        for record in &outcome.events {
            match serde_json::to_string(record) {
                Ok(line) => println!("{line}"),
                Err(err) => warn!("unencodable event: {err}"),
            }
        }

        if let Err(violation) = engine.audit_invariants() {
            error!("invariant violation after block {}: {violation}", block.height);
            return ExitCode::FAILURE;
        }
    }

    print_summary(&engine, &traders);
    ExitCode::SUCCESS
}

fn print_summary(engine: &Engine, traders: &std::collections::BTreeSet<TraderId>) {
    println!("--- final state ---");
    for trader in traders {
        let Some(account) = engine.get_account(trader) else {
            continue;
        };
        println!(
            "{trader}: balance {} locked {}",
            account.balance, account.locked_margin
        );
        for position in engine.list_positions(trader) {
            println!(
                "  {} {:?} {} @ {} (margin {})",
                position.market_id,
                position.side,
                position.size,
                position.entry_price,
                position.margin
            );
        }
    }
    for market in engine.list_markets() {
        let fund = engine.get_insurance_fund(&market.id);
        if !fund.is_zero() {
            println!("insurance {}: {fund}", market.id);
        }
    }
}
