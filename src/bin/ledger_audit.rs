//! Ledger Audit Tool
//!
//! Operator CLI for chain verification and shadow ledger reconciliation
//! against the ledger database.
//!
//! Usage:
//!   cargo run --release --bin ledger_audit -- --db-path ./brokerops_ledger.db partitions --stream audit
//!   cargo run --release --bin ledger_audit -- --db-path ./brokerops_ledger.db verify --stream exposure
//!   cargo run --release --bin ledger_audit -- --db-path ./brokerops_ledger.db consistency --client-id C1
//!   cargo run --release --bin ledger_audit -- --db-path ./brokerops_ledger.db resync --client-id C1
//!   cargo run --release --bin ledger_audit -- --db-path ./brokerops_ledger.db release --stream audit --partition trace-1
//!   cargo run --release --bin ledger_audit -- --db-path ./brokerops_ledger.db deliveries

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use brokerops_ledger::{
    config::Config,
    emitter::Outbox,
    hash_chain::ChainLedger,
    models::ChainStream,
    shadow_ledger::ShadowLedger,
    storage::LedgerDb,
    webhooks::{WebhookDispatcher, WebhookRegistry},
};

/// Verify and reconcile the BrokerOps ledger
#[derive(Parser, Debug)]
#[command(name = "ledger_audit")]
#[command(about = "Verify hash chains and reconcile the shadow exposure ledger")]
struct Cli {
    /// Path to the SQLite ledger (defaults to LEDGER_DB_PATH)
    #[arg(short, long, env = "LEDGER_DB_PATH")]
    db_path: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StreamArg {
    Audit,
    Exposure,
}

impl From<StreamArg> for ChainStream {
    fn from(s: StreamArg) -> Self {
        match s {
            StreamArg::Audit => ChainStream::Audit,
            StreamArg::Exposure => ChainStream::Exposure,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List partitions with their head pointer and halt state
    Partitions {
        #[arg(short, long, value_enum, default_value = "audit")]
        stream: StreamArg,
    },

    /// Walk partitions from genesis; violations halt the partition
    Verify {
        #[arg(short, long, value_enum, default_value = "audit")]
        stream: StreamArg,

        /// Only this partition (otherwise all)
        #[arg(short, long)]
        partition: Option<String>,
    },

    /// Compare a client's live exposure rows with the chain replay
    Consistency {
        #[arg(short, long)]
        client_id: String,
    },

    /// Rebuild a client's exposure rows from the chain
    Resync {
        #[arg(short, long)]
        client_id: String,
    },

    /// Lift a halt after manual reconciliation
    Release {
        #[arg(short, long, value_enum)]
        stream: StreamArg,

        #[arg(short, long)]
        partition: String,
    },

    /// Webhook deliveries that ran out of attempts, plus the outbox backlog
    Deliveries,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();
    let db_path = cli.db_path.unwrap_or(config.database_path.clone());

    let db = LedgerDb::open(&db_path, Duration::from_secs(30))
        .with_context(|| format!("Failed to open ledger: {db_path}"))?;
    let chain = ChainLedger::new(db.clone());
    let shadow = ShadowLedger::new(db.clone(), config.default_limits.clone());

    println!("Ledger: {db_path}\n");

    match cli.command {
        Commands::Partitions { stream } => list_partitions(&chain, stream.into()).await,
        Commands::Verify { stream, partition } => {
            verify(&chain, stream.into(), partition.as_deref()).await
        }
        Commands::Consistency { client_id } => {
            let report = shadow
                .check_consistency(&client_id)
                .await
                .map_err(|e| anyhow!("❌ {e}"))?;
            println!(
                "✓ {}: {} symbol(s) match replay of {} chain row(s)",
                report.client_id, report.symbols_checked, report.chain_rows
            );
            Ok(())
        }
        Commands::Resync { client_id } => {
            let report = shadow
                .resync(&client_id)
                .await
                .with_context(|| format!("Resync refused for {client_id}"))?;
            println!(
                "✓ {}: rebuilt {} row(s) from {} chain row(s)",
                report.client_id, report.rows_rebuilt, report.chain_rows
            );
            Ok(())
        }
        Commands::Release { stream, partition } => {
            let report = chain
                .release(stream.into(), &partition)
                .await
                .with_context(|| format!("Release refused for {partition}"))?;
            println!(
                "✓ released {}/{} ({} rows verified)",
                report.stream, report.partition_key, report.rows
            );
            Ok(())
        }
        Commands::Deliveries => deliveries(db, &config).await,
    }
}

async fn deliveries(db: LedgerDb, config: &Config) -> Result<()> {
    let registry = WebhookRegistry::load(db.clone()).await?;
    let dispatcher = WebhookDispatcher::new(
        registry,
        db.clone(),
        config.emit_timeout,
        config.redelivery_max_attempts,
    )?;

    let exhausted = dispatcher.exhausted_deliveries().await?;
    println!(
        "{:<6} {:<24} {:<20} {:>8}  {}",
        "Id", "Event", "Last attempt", "Attempts", "URL"
    );
    println!("{}", "-".repeat(80));
    for d in &exhausted {
        println!(
            "{:<6} {:<24} {:<20} {:>8}  {}",
            d.id,
            d.event.event_type,
            d.last_attempt_at.format("%Y-%m-%d %H:%M:%S"),
            d.attempts,
            d.url
        );
        println!("    trace: {}  error: {}", d.event.trace_id, d.last_error);
    }

    let backlog = Outbox::new(db).count().await?;
    println!(
        "\n{} exhausted delivery(ies), {backlog} event(s) waiting in the outbox",
        exhausted.len()
    );
    Ok(())
}

async fn list_partitions(chain: &ChainLedger, stream: ChainStream) -> Result<()> {
    let heads = chain.partitions(stream).await?;
    println!(
        "{:<40} {:>10} {:<18} {:<8}",
        "Partition", "Rows", "Head", "State"
    );
    println!("{}", "-".repeat(80));
    for head in &heads {
        let state = if head.halted { "HALTED" } else { "ok" };
        println!(
            "{:<40} {:>10} {:<18} {:<8}",
            head.partition_key,
            head.last_sequence,
            &head.last_hash[..head.last_hash.len().min(16)],
            state
        );
        if let Some(reason) = &head.halted_reason {
            println!("    reason: {reason}");
        }
    }
    println!("\n{} partition(s) in {stream}", heads.len());
    Ok(())
}

async fn verify(chain: &ChainLedger, stream: ChainStream, partition: Option<&str>) -> Result<()> {
    let results = match partition {
        Some(p) => vec![(p.to_string(), chain.verify(stream, p).await)],
        None => chain.verify_all(stream).await?,
    };

    let mut failures = 0usize;
    for (partition, result) in &results {
        match result {
            Ok(report) => println!("✓ {partition}: {} rows", report.rows),
            Err(e) => {
                failures += 1;
                println!("✗ {partition}: {e}");
            }
        }
    }

    println!("\n{} partition(s) checked, {failures} violation(s)", results.len());
    if failures > 0 {
        bail!("{failures} partition(s) failed verification and are now halted");
    }
    Ok(())
}
