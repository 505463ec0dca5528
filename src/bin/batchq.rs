//! batchq CLI: operator interface to a shared content root.

use std::path::PathBuf;
use std::time::Duration;

use batchq::config::Config;
use batchq::model::{ItemId, Status};
use batchq::telemetry::{TelemetryConfig, init_telemetry};
use batchq::{Admission, Coordinator};
use clap::{Parser, Subcommand};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "batchq", about = "Coordinate batch workers over a shared content root")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Reserve the next identifier in a batch
    Next {
        /// Batch key (YYYY-MM-DD); defaults to today
        batch: Option<String>,
    },
    /// Register a URL for processing, reusing its identifier if already known
    Admit {
        batch: String,
        url: String,
    },
    /// Record a status for an identifier
    Status {
        batch: String,
        id: String,
        /// pending, processing, completed, failed, retrying or skipped
        status: String,
        /// URL, required when the record does not exist yet
        #[arg(long)]
        url: Option<String>,
        /// Failure or skip reason
        #[arg(long)]
        error: Option<String>,
    },
    /// List the records of a batch
    Show {
        batch: String,
    },
    /// Repair records left in processing or retrying
    Reconcile {
        /// Only this batch; all batches otherwise
        #[arg(long)]
        batch: Option<String>,
    },
    /// Write the URLs of retry-eligible failures
    RetryList {
        /// Output file; defaults to the layout's retry list under the content root
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Remove records and artifacts of URLs processed more than once
    Dedupe {
        /// Report without deleting anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Run reconciliation periodically until interrupted
    Watch {
        #[arg(long, default_value_t = 300)]
        interval_secs: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::from_env()?;
    let _guard = init_telemetry(TelemetryConfig::from_config(&config, "batchq"))?;

    let coordinator = Coordinator::new(config)?;

    match cli.command {
        Command::Next { batch } => cmd_next(&coordinator, batch),
        Command::Admit { batch, url } => cmd_admit(&coordinator, &batch, &url),
        Command::Status {
            batch,
            id,
            status,
            url,
            error,
        } => cmd_status(&coordinator, &batch, &id, &status, url, error),
        Command::Show { batch } => cmd_show(&coordinator, &batch),
        Command::Reconcile { batch } => cmd_reconcile(&coordinator, batch),
        Command::RetryList { output } => cmd_retry_list(&coordinator, output),
        Command::Dedupe { dry_run } => cmd_dedupe(&coordinator, dry_run),
        Command::Watch { interval_secs } => cmd_watch(coordinator, interval_secs).await,
    }
}

fn cmd_next(coordinator: &Coordinator, batch: Option<String>) -> anyhow::Result<()> {
    let key = match batch {
        Some(key) => key,
        None => coordinator.workspace().today().key,
    };
    let allocation = coordinator.next_identifier(&key)?;
    if !allocation.is_reserved() {
        eprintln!("warning: placeholder not written; identifier is not reserved");
    }
    println!("{}", allocation.id);
    Ok(())
}

fn cmd_admit(coordinator: &Coordinator, batch: &str, url: &str) -> anyhow::Result<()> {
    match coordinator.admit(batch, url)? {
        Admission::Assigned(allocation) => println!("assigned {}", allocation.id),
        Admission::Reused { id, previous } => println!("reused {id} (was {previous})"),
        Admission::AlreadyCompleted { batch, id } => {
            println!("already completed as {id} in {batch}")
        }
    }
    Ok(())
}

fn cmd_status(
    coordinator: &Coordinator,
    batch: &str,
    id: &str,
    status: &str,
    url: Option<String>,
    reason: Option<String>,
) -> anyhow::Result<()> {
    let id: ItemId = id.parse()?;
    let status: Status = status
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid status: {status}"))?;

    let transition =
        coordinator.record_status(batch, id, status, url.as_deref(), reason.as_deref())?;
    match transition.from {
        Some(from) => println!("{id}: {from} -> {}", transition.to),
        None => println!("{id}: created as {}", transition.to),
    }
    Ok(())
}

fn cmd_show(coordinator: &Coordinator, batch: &str) -> anyhow::Result<()> {
    let records = coordinator.records(batch)?;
    if records.is_empty() {
        println!("No records in {batch}.");
        return Ok(());
    }

    println!("{:<5}  {:<10}  {:<16}  {:<50}  ERROR", "ID", "STATUS", "ASSIGNED", "URL");
    println!("{}", "-".repeat(100));
    for (id, record) in records.iter() {
        let assigned = record
            .assigned_at
            .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        let url: String = record.url.chars().take(50).collect();
        println!(
            "{:<5}  {:<10}  {:<16}  {:<50}  {}",
            id.to_string(),
            record.status.as_str(),
            assigned,
            url,
            record.error.as_deref().unwrap_or("-")
        );
    }
    println!("\n{} record(s)", records.len());
    Ok(())
}

fn cmd_reconcile(coordinator: &Coordinator, batch: Option<String>) -> anyhow::Result<()> {
    let report = match batch {
        Some(key) => coordinator.reconcile(&key)?,
        None => coordinator.reconcile_all()?,
    };
    for repair in &report.repairs {
        println!("{} {}: {}", repair.batch, repair.id, repair.kind.as_str());
    }
    for (batch, reason) in &report.failed_batches {
        eprintln!("{batch}: not reconciled: {reason}");
    }
    println!("{} record(s) repaired", report.repairs.len());
    Ok(())
}

fn cmd_retry_list(coordinator: &Coordinator, output: Option<PathBuf>) -> anyhow::Result<()> {
    let (path, list) = coordinator.write_retry_list(output.as_deref())?;
    println!(
        "{} url(s) written to {} ({} permanent, {} completed elsewhere excluded)",
        list.urls.len(),
        path.display(),
        list.excluded_permanent,
        list.excluded_completed
    );
    Ok(())
}

fn cmd_dedupe(coordinator: &Coordinator, dry_run: bool) -> anyhow::Result<()> {
    let report = coordinator.resolve_duplicates(dry_run)?;
    let verb = if dry_run { "would remove" } else { "removed" };
    for removal in &report.removals {
        println!(
            "{verb} {} {} (kept {} {}): {}",
            removal.removed.batch, removal.removed.id, removal.kept.batch, removal.kept.id, removal.url
        );
    }
    for (location, reason) in &report.failed_removals {
        eprintln!("{} {}: not removed: {reason}", location.batch, location.id);
    }
    for (batch, reason) in &report.failed_batches {
        eprintln!("{batch}: skipped: {reason}");
    }
    println!("{} duplicate(s)", report.removals.len());
    Ok(())
}

async fn cmd_watch(coordinator: Coordinator, interval_secs: u64) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    info!(interval_secs, "watching for stuck records");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("watch shutting down");
                return Ok(());
            }
            _ = ticker.tick() => {
                let worker = coordinator.clone();
                match tokio::task::spawn_blocking(move || worker.reconcile_all()).await? {
                    Ok(report) => {
                        if !report.repairs.is_empty() || !report.failed_batches.is_empty() {
                            info!(
                                repaired = report.repairs.len(),
                                failed_batches = report.failed_batches.len(),
                                "reconciliation pass"
                            );
                        }
                    }
                    Err(e) => error!("reconciliation pass failed: {e}"),
                }
            }
        }
    }
}
