//! Bulk encryption pipeline: source scan → encrypt fan-out → batch commit.
//!
//! Shape: one producer streams source rows into a bounded job queue; a fixed
//! pool of workers each encrypts PAN and CVV through the KMS and emits an
//! [`EncryptedRecord`] into a bounded results queue; a single writer commits
//! results in multi-row batches. Bounded queues push backpressure all the way
//! back to the source scan, keeping memory flat regardless of table size.
//!
//! Failure discipline: a row either lands in the destination with both
//! envelopes intact or not at all. Worker errors skip the row; a failed batch
//! insert counts every row in the batch as an error and the pipeline moves on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use futures::StreamExt;
use sqlx::AnyPool;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info, warn};

use kms_common::envelope;

use crate::db::{self, CardRecord, Dialect, EncryptedRecord};
use crate::kms_client::KmsApi;

/// Tunables for one ETL run.
#[derive(Debug, Clone)]
pub struct EtlOptions {
    /// Size of the encrypt worker pool.
    pub workers: usize,
    /// Rows accumulated per destination insert.
    pub batch_size: usize,
    /// Capacity of the job and result queues.
    pub queue_capacity: usize,
}

impl Default for EtlOptions {
    fn default() -> Self {
        Self {
            workers: 20,
            batch_size: 500,
            queue_capacity: 100,
        }
    }
}

/// Outcome of one ETL run. Counters are cumulative and monotonic.
#[derive(Debug)]
pub struct EtlSummary {
    /// Rows committed to the destination.
    pub processed: u64,
    /// Rows lost to encryption or insert failures.
    pub errors: u64,
    /// Rows read from the source.
    pub scanned: u64,
    pub elapsed: std::time::Duration,
}

/// Run the full pipeline until the source is drained and the final partial
/// batch is flushed.
///
/// # Errors
///
/// Returns an error only for fatal conditions: the preflight encryption probe
/// or the source scan failing outright. Per-row and per-batch failures are
/// counted in the summary instead.
pub async fn run_etl(
    source: &AnyPool,
    dest: &AnyPool,
    dest_dialect: Dialect,
    kms: &KmsApi,
    opts: &EtlOptions,
) -> Result<EtlSummary> {
    let started = Instant::now();
    info!(
        workers = opts.workers,
        batch_size = opts.batch_size,
        "starting batch ETL"
    );

    // Preflight: one encryption proves the KMS is reachable and the token is
    // accepted before any source rows are consumed.
    kms.encrypt(b"test")
        .await
        .map_err(|status| anyhow::anyhow!("KMS connection test failed: {status}"))?;
    info!("KMS connection test passed");

    let processed = Arc::new(AtomicU64::new(0));
    let errors = Arc::new(AtomicU64::new(0));

    let (job_tx, job_rx) = mpsc::channel::<CardRecord>(opts.queue_capacity);
    let (result_tx, result_rx) = mpsc::channel::<EncryptedRecord>(opts.queue_capacity);

    // Single producer: stream the source table into the job queue.
    let feeder = {
        let source = source.clone();
        tokio::spawn(async move { db::stream_source_rows(&source, job_tx).await })
    };

    // Worker pool: bounded fan-out over the job stream.
    let workers = {
        let kms = kms.clone();
        let errors = Arc::clone(&errors);
        let result_tx = result_tx.clone();
        let concurrency = opts.workers;
        tokio::spawn(async move {
            ReceiverStream::new(job_rx)
                .for_each_concurrent(concurrency, |record| {
                    let kms = kms.clone();
                    let errors = Arc::clone(&errors);
                    let result_tx = result_tx.clone();
                    async move {
                        match encrypt_record(&kms, &record).await {
                            Ok(encrypted) => {
                                // Writer gone means shutdown; nothing to count.
                                let _ = result_tx.send(encrypted).await;
                            }
                            Err(status) => {
                                errors.fetch_add(1, Ordering::Relaxed);
                                warn!(
                                    record = record.id,
                                    error = %status,
                                    "skipping record after encryption failure"
                                );
                            }
                        }
                    }
                })
                .await;
        })
    };
    // The writer must observe channel closure once all workers finish.
    drop(result_tx);

    // Single consumer: batch commit.
    let writer = {
        let dest = dest.clone();
        let processed = Arc::clone(&processed);
        let errors = Arc::clone(&errors);
        let batch_size = opts.batch_size;
        tokio::spawn(async move {
            batch_writer(&dest, dest_dialect, result_rx, batch_size, &processed, &errors).await;
        })
    };

    let scanned = feeder
        .await
        .context("source scan task panicked")?
        .unwrap_or_else(|e| {
            error!(error = %e, "source scan failed");
            0
        });
    workers.await.context("worker pool task panicked")?;
    writer.await.context("batch writer task panicked")?;

    let summary = EtlSummary {
        processed: processed.load(Ordering::Relaxed),
        errors: errors.load(Ordering::Relaxed),
        scanned,
        elapsed: started.elapsed(),
    };
    info!(
        processed = summary.processed,
        errors = summary.errors,
        scanned = summary.scanned,
        elapsed_ms = summary.elapsed.as_millis() as u64,
        "ETL completed"
    );
    Ok(summary)
}

/// Encrypt both sensitive fields of one row. Any failure drops the whole row
/// so no partial record is ever emitted.
async fn encrypt_record(
    kms: &KmsApi,
    record: &CardRecord,
) -> Result<EncryptedRecord, tonic::Status> {
    let (pan_ct, pan_nonce) = kms.encrypt(record.pan.as_bytes()).await?;
    let (cvv_ct, cvv_nonce) = kms.encrypt(record.cvv.as_bytes()).await?;

    Ok(EncryptedRecord {
        source_id: record.id,
        encrypted_pan: envelope::combine(&pan_nonce, &pan_ct),
        encrypted_cvv: envelope::combine(&cvv_nonce, &cvv_ct),
        other_data: record.other_data.clone(),
    })
}

/// Accumulate results and issue one multi-row insert per full batch, plus a
/// final flush for the partial tail.
async fn batch_writer(
    dest: &AnyPool,
    dialect: Dialect,
    mut results: mpsc::Receiver<EncryptedRecord>,
    batch_size: usize,
    processed: &AtomicU64,
    errors: &AtomicU64,
) {
    let mut batch: Vec<EncryptedRecord> = Vec::with_capacity(batch_size);

    while let Some(record) = results.recv().await {
        batch.push(record);
        if batch.len() >= batch_size {
            flush(dest, dialect, &mut batch, processed, errors).await;
        }
    }
    flush(dest, dialect, &mut batch, processed, errors).await;
}

async fn flush(
    dest: &AnyPool,
    dialect: Dialect,
    batch: &mut Vec<EncryptedRecord>,
    processed: &AtomicU64,
    errors: &AtomicU64,
) {
    if batch.is_empty() {
        return;
    }
    match db::insert_batch(dest, dialect, batch).await {
        Ok(()) => {
            processed.fetch_add(batch.len() as u64, Ordering::Relaxed);
        }
        Err(e) => {
            errors.fetch_add(batch.len() as u64, Ordering::Relaxed);
            error!(rows = batch.len(), error = %e, "batch insert failed; dropping batch");
        }
    }
    batch.clear();
}
