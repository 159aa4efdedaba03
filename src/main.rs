//! sftp-sync CLI - mirror a local directory to a remote host over SFTP
//!
//! Usage: sftp-sync <COMMAND>
//!
//! Commands:
//!   push  Synchronize the local source to the remote target
//!   plan  Preview the operations a push would run

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::LevelFilter;

use sftp_sync::sync::{OpStatus, TransferResult};
use sftp_sync::{CancelToken, SyncConfig, SyncEngine};

/// sftp-sync - idempotent directory synchronization over SFTP
#[derive(Parser, Debug)]
#[command(name = "sftp-sync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Output format for CI
    #[arg(long)]
    json: bool,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Synchronize the local source to the remote target
    Push {
        /// Path to the configuration file
        #[arg(short, long, default_value = "sftp-sync.toml")]
        config: PathBuf,

        /// Delete remote paths with no local counterpart
        #[arg(long)]
        delete: bool,

        /// Keep going after a permanent failure
        #[arg(long)]
        continue_on_error: bool,

        /// Plan only, transfer nothing
        #[arg(long)]
        dry_run: bool,
    },

    /// Preview the operations a push would run
    Plan {
        /// Path to the configuration file
        #[arg(short, long, default_value = "sftp-sync.toml")]
        config: PathBuf,

        /// Delete remote paths with no local counterpart
        #[arg(long)]
        delete: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();

    let outcome = match cli.command {
        Commands::Push {
            config,
            delete,
            continue_on_error,
            dry_run,
        } => cmd_push(&config, delete, continue_on_error, dry_run, cli.json),
        Commands::Plan { config, delete } => cmd_plan(&config, delete, cli.json),
    };

    match outcome {
        Ok(success) if success => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: &PathBuf, delete: bool, continue_on_error: bool) -> Result<SyncConfig> {
    let mut config = SyncConfig::load(path)
        .with_context(|| format!("loading configuration from {}", path.display()))?;
    if delete {
        config.transfer.delete_extraneous = true;
    }
    if continue_on_error {
        config.transfer.continue_on_error = true;
    }
    Ok(config)
}

fn cmd_push(
    config_path: &PathBuf,
    delete: bool,
    continue_on_error: bool,
    dry_run: bool,
    json: bool,
) -> Result<bool> {
    let config = load_config(config_path, delete, continue_on_error)?;
    let engine = SyncEngine::new(config);

    if dry_run {
        return print_plan(&engine, json);
    }

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        eprintln!("interrupt received, finishing the current operation");
        handler_token.cancel();
    })
    .context("installing interrupt handler")?;

    let result = engine.sync(&cancel)?;
    print_result(&result, json)?;
    Ok(result.is_success())
}

fn cmd_plan(config_path: &PathBuf, delete: bool, json: bool) -> Result<bool> {
    let config = load_config(config_path, delete, false)?;
    let engine = SyncEngine::new(config);
    print_plan(&engine, json)
}

fn print_plan(engine: &SyncEngine, json: bool) -> Result<bool> {
    let plan = engine.preview()?;

    if json {
        let ops: Vec<_> = plan
            .iter()
            .map(|op| {
                serde_json::json!({
                    "op": op.kind().label(),
                    "path": op.path().display().to_string(),
                })
            })
            .collect();
        let output = serde_json::json!({
            "event": "plan",
            "operations": ops,
        });
        println!("{}", serde_json::to_string(&output)?);
    } else if plan.is_empty() {
        println!("Nothing to do, remote is up to date.");
    } else {
        println!("Plan ({} operations):", plan.len());
        for op in plan.iter() {
            println!("  {op}");
        }
    }

    Ok(true)
}

fn print_result(result: &TransferResult, json: bool) -> Result<()> {
    if json {
        let records: Vec<_> = result
            .records
            .iter()
            .map(|r| {
                let (status, attempts, error) = match &r.status {
                    OpStatus::Succeeded => ("ok", 1, None),
                    OpStatus::Retried(n) => ("retried", n + 1, None),
                    OpStatus::Failed { attempts, error } => {
                        ("failed", *attempts, Some(error.to_string()))
                    }
                };
                serde_json::json!({
                    "op": r.kind.label(),
                    "path": r.path.display().to_string(),
                    "status": status,
                    "attempts": attempts,
                    "error": error,
                })
            })
            .collect();
        let output = serde_json::json!({
            "event": "push",
            "status": if result.is_success() { "success" } else { "failed" },
            "aborted": result.aborted,
            "succeeded": result.succeeded(),
            "retried": result.retried(),
            "failed": result.failed(),
            "records": records,
        });
        println!("{}", serde_json::to_string(&output)?);
        return Ok(());
    }

    if result.records.is_empty() {
        println!("Nothing to do, remote is up to date.");
        return Ok(());
    }

    println!(
        "Transferred: {} succeeded ({} after retries), {} failed",
        result.succeeded(),
        result.retried(),
        result.failed()
    );
    for (record, error) in result.failures() {
        println!("  ✗ {} {}: {}", record.kind.label(), record.path.display(), error);
    }
    if result.aborted {
        println!("Run aborted after a permanent failure.");
    }
    Ok(())
}
