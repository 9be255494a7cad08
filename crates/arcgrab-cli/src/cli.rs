//! CLI for the arcgrab bulk archive downloader.
//!
//! Thin surface over the engine contract: flags map onto `EngineConfig`,
//! Ctrl-C triggers a clean stop, and exit codes follow the contract
//! (0 = complete, 1 = error or failed files, 2 = interrupted).

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use arcgrab_core::metrics::{Phase, Snapshot};
use arcgrab_core::{Engine, EngineConfig, JobHandle, Overrides};

/// Top-level CLI for the arcgrab bulk archive downloader.
#[derive(Debug, Parser)]
#[command(name = "arcgrab")]
#[command(about = "Resumable, rate-aware bulk archive downloader", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Start (or restart) a bulk download job.
    Download {
        /// Item list: one identifier per line, or delimited text with an
        /// `identifier` header column.
        items: PathBuf,
        /// Output directory; also holds the job's state file.
        #[arg(long, value_name = "DIR")]
        out: PathBuf,
        /// Maximum concurrent file fetches (1-64).
        #[arg(long, default_value = "4", value_name = "N")]
        workers: usize,
        /// Bandwidth cap in bytes/sec shared by all workers (0 = unlimited).
        #[arg(long, default_value = "0", value_name = "BPS")]
        limit_rate: u64,
        /// Skip files already on disk with matching size and digest.
        #[arg(long)]
        sync: bool,
        /// Start with one worker and scale with observed server behavior.
        #[arg(long)]
        dynamic: bool,
        /// Download only manifest/metadata files.
        #[arg(long)]
        metadata_only: bool,
        /// Retain only files whose name matches this regex.
        #[arg(long, value_name = "REGEX")]
        name_regex: Option<String>,
        /// Retain only these extensions (comma-separated, case-insensitive).
        #[arg(long, value_name = "EXT,EXT", value_delimiter = ',')]
        ext: Vec<String>,
        /// Credentials file with S3_ACCESS_KEY / S3_SECRET_KEY lines.
        #[arg(long, value_name = "FILE")]
        auth: Option<PathBuf>,
        /// Archive base URL (testing / private mirrors).
        #[arg(long, value_name = "URL")]
        endpoint: Option<String>,
    },

    /// Resume a persisted job from its output directory.
    Resume {
        /// Output directory holding the state file.
        #[arg(long, value_name = "DIR")]
        out: PathBuf,
        /// Override the persisted worker ceiling.
        #[arg(long, value_name = "N")]
        workers: Option<usize>,
        /// Override the persisted bandwidth cap (bytes/sec, 0 = unlimited).
        #[arg(long, value_name = "BPS")]
        limit_rate: Option<u64>,
        /// Enable sync mode for this run.
        #[arg(long)]
        sync: bool,
        /// Enable dynamic scaling for this run.
        #[arg(long)]
        dynamic: bool,
    },

    /// Show a snapshot of a persisted job without touching the network.
    Status {
        /// Output directory holding the state file.
        #[arg(long, value_name = "DIR")]
        out: PathBuf,
    },
}

/// Parse arguments, run, and map the outcome to an exit code.
pub async fn run_from_args() -> i32 {
    let cli = Cli::parse();
    match run(cli.command).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("arcgrab error: {:#}", err);
            1
        }
    }
}

async fn run(command: CliCommand) -> Result<i32> {
    match command {
        CliCommand::Download {
            items,
            out,
            workers,
            limit_rate,
            sync,
            dynamic,
            metadata_only,
            name_regex,
            ext,
            auth,
            endpoint,
        } => {
            let mut cfg = EngineConfig::new(items, out);
            cfg.worker_ceiling = workers;
            cfg.bandwidth_ceiling_bps = limit_rate;
            cfg.sync = sync;
            cfg.dynamic = dynamic;
            cfg.metadata_only = metadata_only;
            cfg.name_regex = name_regex;
            cfg.extension_whitelist = ext;
            cfg.auth_path = auth;
            if let Some(endpoint) = endpoint {
                cfg.endpoint = endpoint;
            }
            tracing::debug!("download config: {:?}", cfg);
            let handle = Engine::start(cfg).await?;
            drive(handle).await
        }
        CliCommand::Resume {
            out,
            workers,
            limit_rate,
            sync,
            dynamic,
        } => {
            let overrides = Overrides {
                worker_ceiling: workers,
                bandwidth_ceiling_bps: limit_rate,
                sync: sync.then_some(true),
                dynamic: dynamic.then_some(true),
            };
            let handle = Engine::resume(&out, overrides).await?;
            drive(handle).await
        }
        CliCommand::Status { out } => {
            let snapshot = Engine::status(&out).await?;
            print_status(&snapshot);
            Ok(if snapshot.failed > 0 { 1 } else { 0 })
        }
    }
}

/// Run a job to completion: progress line per snapshot, Ctrl-C stops.
async fn drive(handle: JobHandle) -> Result<i32> {
    let mut rx = handle.metrics();
    let printer = tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let s = rx.borrow().clone();
            print_progress(&s);
            if s.phase == Phase::Stopped {
                break;
            }
        }
        println!();
    });

    // First Ctrl-C stops the job cleanly; a second abandons the process.
    let stopper = handle.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\ninterrupt: stopping workers (press again to abandon)");
            stopper.cancel();
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(2);
        }
    });

    let report = handle.wait().await?;
    let _ = printer.await;

    println!(
        "{} done, {} skipped, {} failed, {} pending ({:.1} MiB this session)",
        report.done,
        report.skipped,
        report.failed,
        report.pending,
        report.bytes_done as f64 / 1_048_576.0
    );
    if report.interrupted {
        return Ok(2);
    }
    Ok(if report.is_complete() { 0 } else { 1 })
}

fn print_progress(s: &Snapshot) {
    let rate_mib = s.bytes_per_sec as f64 / 1_048_576.0;
    let eta = s
        .eta_secs
        .map(|secs| format!("{}s", secs))
        .unwrap_or_else(|| "?".to_string());
    let quiet = s
        .quiet_until_secs
        .map(|secs| format!("  backoff {}s", secs))
        .unwrap_or_default();
    println!(
        "\r[{}] {}/{} files  {:.1} MiB  {:.2} MiB/s  ETA {}  workers {}/{}{}",
        s.phase.as_str(),
        s.done + s.skipped,
        s.total_files,
        s.bytes_done as f64 / 1_048_576.0,
        rate_mib,
        eta,
        s.workers_active,
        s.workers_target,
        quiet
    );
}

fn print_status(s: &Snapshot) {
    println!("files:      {}", s.total_files);
    println!("done:       {}", s.done);
    println!("skipped:    {}", s.skipped);
    println!("failed:     {}", s.failed);
    println!("in-progress:{}", s.in_progress);
    println!("pending:    {}", s.pending);
    println!(
        "bytes:      {:.1} / {:.1} MiB",
        s.bytes_done as f64 / 1_048_576.0,
        s.bytes_total as f64 / 1_048_576.0
    );
}
