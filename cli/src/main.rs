//! chainreader — run a fork-aware block reader from a config file.
//!
//! Usage:
//! ```bash
//! chainreader run reader.json
//! chainreader info
//! ```

mod config;
mod logging;

use std::env;
use std::path::Path;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info, warn};

use chainreader_core::{IndexerError, JobPriority, JobQueue, ReaderConfig, ReaderState, Store, Watchdog};
use chainreader_handlers::{TokenCache, TokenHandler, TOKEN_ABI};
use chainreader_ship::{Abi, ReaderBuilder};
use chainreader_storage::{MemoryStore, SqliteStore};

use crate::config::AppConfig;
use crate::logging::init_tracing;

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    match args[1].as_str() {
        "run" => {
            let Some(path) = args.get(2) else {
                eprintln!("Missing config file");
                print_usage();
                process::exit(1);
            };
            if let Err(e) = cmd_run(Path::new(path)) {
                eprintln!("Error: {e:#}");
                process::exit(1);
            }
        }
        "info" => cmd_info(),
        "version" | "--version" | "-V" => {
            println!("chainreader {}", env!("CARGO_PKG_VERSION"));
        }
        "help" | "--help" | "-h" => print_usage(),
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    }
}

fn print_usage() {
    println!("chainreader {}", env!("CARGO_PKG_VERSION"));
    println!("Fork-aware blockchain state ingestion\n");
    println!("USAGE:");
    println!("    chainreader <COMMAND>\n");
    println!("COMMANDS:");
    println!("    run <config.json>  Run a reader until stopped (Ctrl-C) or its end block");
    println!("    info               Show default configuration");
    println!("    version            Print version");
    println!("    help               Print this help");
}

fn cmd_info() {
    let defaults = ReaderConfig::default();
    println!("ChainReader v{}", env!("CARGO_PKG_VERSION"));
    println!("  Default endpoint: {}", defaults.endpoint);
    println!("  Default prefetch: {} blocks", defaults.prefetch);
    println!("  Default decode workers: {}", defaults.decode_workers);
    println!("  Default live threshold: {} blocks", defaults.live_threshold);
    println!(
        "  Default watchdog: every {}s, stall after {}s",
        defaults.watchdog_interval_secs, defaults.stall_timeout_secs
    );
    println!("  Storage backends: memory, SQLite");
    println!("  Handlers: token");
}

fn cmd_run(path: &Path) -> anyhow::Result<()> {
    let config = AppConfig::load(path)?;
    init_tracing(&config.log);
    let runtime = tokio::runtime::Runtime::new().context("starting tokio runtime")?;
    runtime.block_on(run(config))
}

async fn open_store(config: &AppConfig) -> anyhow::Result<Arc<dyn Store>> {
    if config.database.is_memory() {
        warn!("using an in-memory store, nothing will persist");
        return Ok(Arc::new(MemoryStore::new()));
    }
    let store = SqliteStore::open(&config.database.path)
        .await
        .with_context(|| format!("opening database {}", config.database.path))?;
    Ok(Arc::new(store))
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
    let store = open_store(&config).await?;

    let mut builder = ReaderBuilder::new().config(config.reader.clone()).store(Arc::clone(&store));
    for (contract, abi_path) in &config.abis {
        let text = std::fs::read_to_string(abi_path).with_context(|| format!("reading ABI {abi_path}"))?;
        let abi = Abi::from_json(&text).with_context(|| format!("parsing ABI {abi_path}"))?;
        builder = builder.abi(contract.clone(), &abi);
    }
    if let Some(token) = &config.token {
        if !config.abis.contains_key(&token.contract) {
            builder = builder.abi(token.contract.clone(), &Abi::from_json(TOKEN_ABI)?);
        }
        let handler = TokenHandler::new(token.contract.clone(), TokenCache::new()).start_block(token.start_block);
        builder = builder.handler(Arc::new(handler));
    }
    let (reader, handle) = builder.build()?;

    // ─── Watchdog ───
    let watchdog = Watchdog::new(
        handle.status(),
        config.reader.watchdog_interval(),
        config.reader.stall_timeout(),
    );
    let watchdog_task = tokio::spawn(watchdog.run(handle.shutdown_signal()));

    // ─── Maintenance jobs ───
    let mut jobs = JobQueue::new(
        Duration::from_secs(config.jobs.start_delay_secs),
        Duration::from_secs(config.jobs.tick_secs),
    );
    let status_handle = handle.clone();
    jobs.add("status-report", config.jobs.status_interval_secs, JobPriority::Low, move || {
        let status = status_handle.current();
        async move {
            info!(
                reader = %status.reader,
                state = %status.state,
                block = status.block,
                head = status.head,
                blocks_per_sec = %format_args!("{:.1}", status.blocks_per_sec),
                writes_per_sec = %format_args!("{:.1}", status.writes_per_sec),
                eta_secs = ?status.eta_secs.map(|s| s.round()),
                "reader status"
            );
            Ok(())
        }
    });
    let checkpoint_store = Arc::clone(&store);
    let reader_name = config.reader.name.clone();
    jobs.add(
        "checkpoint-audit",
        config.jobs.checkpoint_interval_secs,
        JobPriority::Medium,
        move || {
            let store = Arc::clone(&checkpoint_store);
            let name = reader_name.clone();
            async move {
                let checkpoint = store
                    .load_checkpoint(&name)
                    .await?
                    .ok_or_else(|| IndexerError::Storage(format!("no checkpoint for reader '{name}'")))?;
                info!(
                    reader = %name,
                    block = checkpoint.block_num,
                    irreversible = checkpoint.irreversible,
                    live = checkpoint.live,
                    "checkpoint"
                );
                Ok(())
            }
        },
    );
    let jobs_task = tokio::spawn(jobs.run(handle.shutdown_signal()));

    // ─── Ctrl-C ───
    let signal_handle = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current block");
            signal_handle.stop();
        }
    });

    let outcome = reader.run().await;
    handle.stop();
    let _ = jobs_task.await;
    let _ = watchdog_task.await;

    match outcome {
        Ok(checkpoint) => {
            info!(reader = %checkpoint.reader, block = checkpoint.block_num, "done");
            Ok(())
        }
        Err(e) => {
            error!(reader = %config.reader.name, state = %ReaderState::Failed, error = %e, "reader failed");
            Err(e.into())
        }
    }
}
