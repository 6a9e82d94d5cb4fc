//! Offline inspection tool for a settlement database.
//!
//! Opens the data directory directly and prints rounds, balances, and
//! pending withdrawals, or re-verifies stored rounds from their disclosed
//! seed material.

use clap::{Parser, Subcommand};
use monetka::fairness::{self, OutcomeTable, PayoutTable};
use monetka::{
    ConfigLoader, EngineResult, Ledger, LedgerStore, RoundRecord, SettlementEngine,
};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "monetka-inspect", about = "Inspect a settlement database")]
struct Args {
    /// Path to a TOML config file.
    #[arg(long)]
    config: Option<String>,

    /// Data directory; overrides the configured one.
    #[arg(long)]
    data_dir: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the most recent rounds.
    Recent {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Print one round in full.
    Round { id: u64 },
    /// Re-verify stored rounds against their commitments and outcomes.
    Verify {
        /// Verify a single round instead of the whole history.
        #[arg(long)]
        id: Option<u64>,
    },
    /// Print an account balance.
    Balance { account: u64 },
    /// List withdrawal requests awaiting manual fulfillment.
    Pending,
    /// Print the house's net position.
    House,
}

fn print_round(record: &RoundRecord) {
    println!(
        "round {} account {} side {} stake {} -> {} payout {} (roll {:.6}, nonce {})",
        record.round_id,
        record.account,
        record.side,
        record.stake,
        record.outcome,
        record.payout,
        record.roll,
        record.nonce
    );
    println!("  server_seed {}", record.server_seed);
    println!("  client_seed {}", record.client_seed);
    println!("  commitment  {}", record.commitment);
}

fn verify_all(
    store: &LedgerStore,
    outcomes: &OutcomeTable,
    payouts: &PayoutTable,
) -> EngineResult<()> {
    let mut cursor: Option<String> = None;
    let mut checked = 0u64;
    let mut bad = 0u64;

    loop {
        let (ids, next) = monetka::rounds::load_recent_round_ids(store, cursor.as_deref(), 256)?;
        if ids.is_empty() {
            break;
        }
        for id in ids {
            let Some(record) = monetka::rounds::load_round(store, id)? else {
                continue;
            };
            checked += 1;
            if !fairness::verify_round(&record, outcomes, payouts) {
                bad += 1;
                println!("round {} FAILED verification", id);
            }
        }
        cursor = next;
    }

    println!("{} rounds checked, {} failed", checked, bad);
    Ok(())
}

fn run(args: Args) -> EngineResult<()> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = &args.config {
        loader = loader.with_path(path);
    }
    let mut config = loader.load()?;
    if let Some(dir) = &args.data_dir {
        config.storage.data_dir = dir.clone();
    }

    let store = Arc::new(LedgerStore::open(&config.storage.data_dir)?);
    let ledger = Arc::new(Ledger::new(store.clone()));
    let engine = SettlementEngine::new(store.clone(), ledger.clone(), &config)?;

    match args.command {
        Command::Recent { limit } => {
            let (records, _) = engine.recent_rounds(None, limit)?;
            for record in &records {
                print_round(record);
            }
            println!("{} rounds", records.len());
        }
        Command::Round { id } => match monetka::rounds::load_round(&store, id)? {
            Some(record) => print_round(&record),
            None => println!("round {} not found", id),
        },
        Command::Verify { id } => match id {
            Some(id) => {
                let ok = engine.verify_round(id)?;
                println!("round {}: {}", id, if ok { "ok" } else { "FAILED" });
            }
            None => {
                let outcomes = OutcomeTable::new(&config.odds)?;
                let payouts = PayoutTable::new(&config.payouts);
                verify_all(&store, &outcomes, &payouts)?;
            }
        },
        Command::Balance { account } => {
            println!("account {} balance {}", account, ledger.balance(account)?);
        }
        Command::Pending => {
            let gateway = Arc::new(NoopGateway);
            let reconciler = monetka::Reconciler::new(store, ledger, gateway)?;
            let pending = reconciler.pending_withdrawals()?;
            for request in &pending {
                println!(
                    "request {} account {} requested {} auto_reversed {} shortfall {}",
                    request.id,
                    request.account,
                    request.requested,
                    request.auto_reversed,
                    request.shortfall()
                );
            }
            println!("{} pending", pending.len());
        }
        Command::House => {
            println!("house net {}", ledger.house_net()?);
        }
    }

    Ok(())
}

// Inspection never issues reversals; the reconciler is only used to read.
struct NoopGateway;

#[async_trait::async_trait]
impl monetka::ReversalGateway for NoopGateway {
    async fn reverse(&self, _charge_id: &str, _amount: u64) -> Result<(), monetka::ReversalError> {
        Err(monetka::ReversalError::Failed(
            "inspection tool does not reverse payments".to_string(),
        ))
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
