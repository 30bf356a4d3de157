//! `kms-etl-worker` — bulk card-data protection binary.
//!
//! Modes:
//! - default: encrypt every source row into the destination table;
//! - `--verify`: PCI-safe spot check of a few destination rows (masked output);
//! - `--verify-full`: run the ETL, verify every record, write a CSV report.
//!
//! Exit code is 0 on clean completion; per-record failures are counted and
//! reported, not fatal. Only initialisation failures (config, database,
//! KMS preflight) exit nonzero.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use kms_etl_worker::config::AppConfig;
use kms_etl_worker::kms_client::{self, KmsApi};
use kms_etl_worker::pipeline::{run_etl, EtlOptions};
use kms_etl_worker::verify::{run_safe_verification, verify_all, VerifyOptions};
use kms_etl_worker::{db, report};

#[derive(Debug, Parser)]
#[command(name = "kms-etl-worker", about = "Encrypt card data through the KMS")]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Spot-check a few destination rows (masked output) instead of running
    /// the ETL.
    #[arg(long, conflicts_with = "verify_full")]
    verify: bool,

    /// Run the ETL, then verify every record and write a CSV report.
    #[arg(long)]
    verify_full: bool,

    /// Where to write the verification report (with --verify-full).
    #[arg(long, default_value = "verification_results.csv")]
    report: PathBuf,

    /// Mask decrypted values in the report.
    #[arg(long)]
    mask_data: bool,

    /// Encrypt worker pool size.
    #[arg(long, default_value_t = 20)]
    workers: usize,

    /// Rows per destination insert batch.
    #[arg(long, default_value_t = 500)]
    batch_size: usize,

    /// Tracing log level.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level)?;

    let cfg = AppConfig::from_file(&args.config)?;
    info!(config = %args.config.display(), kms = %cfg.kms.addr, "kms-etl-worker starting");

    // Databases.
    let (source, _) = db::connect(&cfg.source_db.driver, &cfg.source_db.dsn).await?;
    let (dest, dest_dialect) = db::connect(&cfg.dest_db.driver, &cfg.dest_db.dsn).await?;

    // KMS channel and token.
    let channel = kms_client::open_channel(&cfg.kms.addr)?;
    let token = kms_client::resolve_token(&channel, &cfg).await?;
    let kms = KmsApi::new(channel, token)?;

    if args.verify {
        return run_safe_verification(&dest, &kms).await;
    }

    let etl_opts = EtlOptions {
        workers: args.workers,
        batch_size: args.batch_size,
        ..EtlOptions::default()
    };
    let summary = run_etl(&source, &dest, dest_dialect, &kms, &etl_opts).await?;
    println!("=== ETL completed ===");
    println!("scanned:   {}", summary.scanned);
    println!("processed: {}", summary.processed);
    println!("errors:    {}", summary.errors);
    println!("elapsed:   {:.1?}", summary.elapsed);

    if !args.verify_full {
        return Ok(());
    }

    // Full verification pass over everything the ETL produced.
    let encrypted_rows = db::count_encrypted(&dest).await?;
    if encrypted_rows == 0 {
        anyhow::bail!("no encrypted records found in the destination; nothing to verify");
    }
    info!(rows = encrypted_rows, "verifying encrypted records");

    let records = verify_all(&source, &dest, &kms, &VerifyOptions::default()).await?;
    let verify_summary = report::summarize(&records);
    report::write_csv(&records, &args.report, args.mask_data)?;

    println!("=== Verification completed ===");
    println!("total records:   {}", verify_summary.total);
    println!("pan matches:     {}", verify_summary.pan_matches);
    println!("cvv matches:     {}", verify_summary.cvv_matches);
    println!("perfect matches: {}", verify_summary.perfect_matches);
    println!("errors:          {}", verify_summary.errors);
    println!("report:          {}", args.report.display());

    Ok(())
}

fn init_tracing(log_level: &str) -> Result<()> {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialise tracing subscriber: {e}"))
}
