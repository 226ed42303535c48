//! pagevault - maintenance tool for a pagevault data directory

use anyhow::{Context, Result};
use clap::{Parser as ClapParser, Subcommand};
use pagevault::database::{Database, DatabaseConfig};
use pagevault::storage::wal::{LogRecord, WriteAheadLog};
use std::path::PathBuf;

/// pagevault - inspect and maintain a pagevault data directory
#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Data directory
    #[arg(short = 'D', long, default_value = "./pagevault_data")]
    data_dir: PathBuf,

    /// Page size in bytes
    #[arg(short, long, default_value = "4096")]
    page_size: usize,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run crash recovery and report what it did
    Recover,
    /// Recover, then checkpoint and truncate the log
    Checkpoint,
    /// Print every record in the log
    DumpLog,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let config = DatabaseConfig {
        page_size: args.page_size,
        ..DatabaseConfig::new(&args.data_dir)
    };

    match args.command {
        Command::Recover => {
            let db = Database::open(config).context("Failed to open database")?;
            let report = db.recovery_report();
            println!("Recovery started at log offset {}", report.start_offset);
            println!("  committed transactions redone: {}", report.redone);
            println!("  transactions undone:           {}", report.undone);
            println!("  pages written:                 {}", report.pages_written.len());
            if let Some(max) = report.max_txn {
                println!("  highest transaction id:        {max}");
            }
        }
        Command::Checkpoint => {
            let db = Database::open(config).context("Failed to open database")?;
            let offset = db.checkpoint()?;
            let removed = db.truncate_log()?;
            println!("Checkpoint written at offset {offset}; {removed} log byte(s) truncated");
        }
        Command::DumpLog => dump_log(&config)?,
    }

    Ok(())
}

/// Reads the log without recovering, so it is safe on a crashed directory.
fn dump_log(config: &DatabaseConfig) -> Result<()> {
    let path = config.log_path();
    let wal = WriteAheadLog::open(&path).with_context(|| format!("Failed to open {path:?}"))?;

    match wal.checkpoint_offset()? {
        Some(offset) => println!("checkpoint pointer: {offset}"),
        None => println!("checkpoint pointer: none"),
    }
    for (offset, record) in wal.records()? {
        match record {
            LogRecord::Begin { txn } => println!("{offset:>10}  BEGIN       {txn}"),
            LogRecord::Commit { txn } => println!("{offset:>10}  COMMIT      {txn}"),
            LogRecord::Abort { txn } => println!("{offset:>10}  ABORT       {txn}"),
            LogRecord::Update { txn, after, .. } => {
                println!("{offset:>10}  UPDATE      {txn} {} ({} bytes)", after.id, after.data.len())
            }
            LogRecord::Checkpoint { active } => {
                let active: Vec<String> = active
                    .iter()
                    .map(|(txn, first)| format!("{txn}@{first}"))
                    .collect();
                println!("{offset:>10}  CHECKPOINT  [{}]", active.join(", "));
            }
        }
    }
    Ok(())
}
