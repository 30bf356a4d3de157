//! Verification pipeline: decrypt every destination row and compare against
//! the source.
//!
//! Layout: the destination table is loaded into a map keyed by `source_id`,
//! source rows are joined against it, and decrypt jobs run on a capped worker
//! pool, narrower than the encrypt pool (an HSM serialises operations, so a
//! wider pool would only queue). Each job runs under its own per-record
//! timeout which cancels the in-flight decrypt instead of leaking it. A
//! collector task accumulates records, reports progress, warns when the count
//! stops advancing, and enforces a hard collection cap. The coordinator
//! bounds the whole phase with an overall deadline and returns whatever has
//! been collected when it expires.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use sqlx::AnyPool;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{info, warn};

use kms_common::{envelope, NONCE_SIZE};

use crate::db::{self, CardRecord, EncryptedRecord};
use crate::kms_client::KmsApi;
use crate::report::{mask_pan, summarize};

/// Tunables for one verification run.
#[derive(Debug, Clone)]
pub struct VerifyOptions {
    /// Size of the decrypt worker pool.
    pub workers: usize,
    /// Outer timeout for one record (both field decrypts).
    pub per_record_timeout: Duration,
    /// Hard cap on result collection after dispatch ends.
    pub collection_timeout: Duration,
    /// Deadline for the whole phase.
    pub overall_deadline: Duration,
    /// Warn when the collected count stalls this long.
    pub stuck_warn_after: Duration,
    /// Emit a progress line every this many records.
    pub progress_every: usize,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            workers: 10,
            per_record_timeout: Duration::from_secs(15),
            collection_timeout: Duration::from_secs(600),
            overall_deadline: Duration::from_secs(1800),
            stuck_warn_after: Duration::from_secs(30),
            progress_every: 50,
        }
    }
}

/// Outcome of verifying one record. Terminal: nothing downstream mutates it.
#[derive(Debug, Clone, Default)]
pub struct VerificationRecord {
    pub source_id: i64,
    pub original_pan: String,
    pub original_cvv: String,
    pub encrypted_pan: String,
    pub encrypted_cvv: String,
    pub decrypted_pan: String,
    pub decrypted_cvv: String,
    pub pan_match: bool,
    pub cvv_match: bool,
    pub pan_error: String,
    pub cvv_error: String,
    pub other_data: String,
}

impl VerificationRecord {
    fn base(original: &CardRecord) -> Self {
        Self {
            source_id: original.id,
            original_pan: original.pan.clone(),
            original_cvv: original.cvv.clone(),
            other_data: original.other_data.clone(),
            ..Self::default()
        }
    }

    /// Perfect match: both fields decrypted, compared equal, no errors.
    pub fn is_perfect(&self) -> bool {
        self.pan_match && self.cvv_match && self.pan_error.is_empty() && self.cvv_error.is_empty()
    }
}

/// Verify every source row against the destination table.
///
/// The returned records carry no ordering guarantee.
///
/// # Errors
///
/// Returns an error only if reading either table fails; decrypt failures and
/// timeouts are recorded per record.
pub async fn verify_all(
    source: &AnyPool,
    dest: &AnyPool,
    kms: &KmsApi,
    opts: &VerifyOptions,
) -> Result<Vec<VerificationRecord>> {
    let started = Instant::now();

    let encrypted = db::load_encrypted(dest).await?;
    info!(rows = encrypted.len(), "loaded encrypted records");
    let originals = db::load_source_rows(source).await?;
    info!(rows = originals.len(), "loaded original records; starting verification");

    let expected = originals.len();
    // At least one slot per input row so no worker ever blocks on send.
    let (result_tx, result_rx) = mpsc::channel::<VerificationRecord>(expected.max(1));

    let collector = tokio::spawn(collect_results(result_rx, expected, opts.clone()));

    let deadline = tokio::time::Instant::now() + opts.overall_deadline;
    let semaphore = Arc::new(Semaphore::new(opts.workers));
    let timeouts = Arc::new(AtomicU64::new(0));
    let mut tasks: JoinSet<()> = JoinSet::new();

    for original in originals {
        if tokio::time::Instant::now() >= deadline {
            warn!("overall verification deadline reached; stopping dispatch");
            break;
        }

        let Some(record) = encrypted.get(&original.id) else {
            let mut missing = VerificationRecord::base(&original);
            missing.pan_error = "encrypted record not found".into();
            missing.cvv_error = "encrypted record not found".into();
            let _ = result_tx.send(missing).await;
            continue;
        };

        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
            break;
        };
        let kms = kms.clone();
        let encrypted_record = record.clone();
        let result_tx = result_tx.clone();
        let timeouts = Arc::clone(&timeouts);
        let per_record_timeout = opts.per_record_timeout;

        tasks.spawn(async move {
            let _permit = permit;
            let record = match tokio::time::timeout(
                per_record_timeout,
                verify_record(&kms, &original, &encrypted_record),
            )
            .await
            {
                Ok(record) => record,
                // The timeout drops the in-flight decrypt future, so the
                // straggler RPC is cancelled rather than leaked.
                Err(_) => {
                    let total = timeouts.fetch_add(1, Ordering::Relaxed) + 1;
                    if total <= 5 || total % 10 == 0 {
                        warn!(
                            record = original.id,
                            total_timeouts = total,
                            "record verification timed out"
                        );
                    }
                    timeout_record(&original, &encrypted_record, per_record_timeout)
                }
            };
            let _ = result_tx.send(record).await;
        });
    }
    drop(result_tx);

    // Wait for in-flight jobs, but never past the overall deadline.
    let drained = tokio::time::timeout_at(deadline, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!("overall verification deadline reached; cancelling in-flight records");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    let results = collector.await.context("collector task panicked")?;

    let timed_out = timeouts.load(Ordering::Relaxed);
    if timed_out > 0 {
        warn!(timeouts = timed_out, "records timed out during verification");
    }
    let summary = summarize(&results);
    info!(
        total = summary.total,
        perfect = summary.perfect_matches,
        pan_matches = summary.pan_matches,
        cvv_matches = summary.cvv_matches,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "verification complete"
    );
    Ok(results)
}

/// Accumulate verification records, reporting progress and stalls.
async fn collect_results(
    mut results_rx: mpsc::Receiver<VerificationRecord>,
    expected: usize,
    opts: VerifyOptions,
) -> Vec<VerificationRecord> {
    let mut results = Vec::with_capacity(expected);
    let started = Instant::now();
    let hard_deadline = tokio::time::Instant::now() + opts.collection_timeout;

    loop {
        tokio::select! {
            maybe = results_rx.recv() => match maybe {
                Some(record) => {
                    results.push(record);
                    let count = results.len();
                    if count % opts.progress_every == 0 || count == expected {
                        let rate = count as f64 / started.elapsed().as_secs_f64().max(0.001);
                        info!(collected = count, expected, rate = format!("{rate:.1}/s"), "collection progress");
                    }
                    if count >= expected {
                        break;
                    }
                }
                None => break,
            },
            // Re-armed on every received record: fires only after a true stall.
            _ = tokio::time::sleep(opts.stuck_warn_after) => {
                warn!(
                    collected = results.len(),
                    expected,
                    stalled_secs = opts.stuck_warn_after.as_secs(),
                    "no verification progress; continuing to wait"
                );
            }
            _ = tokio::time::sleep_until(hard_deadline) => {
                warn!(
                    collected = results.len(),
                    expected,
                    "collection cap reached; forcing completion"
                );
                break;
            }
        }
    }
    results
}

/// Decrypt both fields of one record and compare against the originals.
async fn verify_record(
    kms: &KmsApi,
    original: &CardRecord,
    encrypted: &EncryptedRecord,
) -> VerificationRecord {
    let mut record = VerificationRecord::base(original);
    record.encrypted_pan = encrypted.encrypted_pan.clone();
    record.encrypted_cvv = encrypted.encrypted_cvv.clone();

    match decrypt_envelope(kms, &encrypted.encrypted_pan).await {
        Ok(plaintext) => {
            record.decrypted_pan = plaintext;
            record.pan_match = record.decrypted_pan == record.original_pan;
        }
        Err(message) => record.pan_error = message,
    }

    match decrypt_envelope(kms, &encrypted.encrypted_cvv).await {
        Ok(plaintext) => {
            record.decrypted_cvv = plaintext;
            record.cvv_match = record.decrypted_cvv == record.original_cvv;
        }
        Err(message) => record.cvv_error = message,
    }

    record
}

async fn decrypt_envelope(kms: &KmsApi, env: &str) -> Result<String, String> {
    let (nonce, ciphertext) =
        envelope::split(env, NONCE_SIZE).map_err(|e| format!("split error: {e}"))?;
    let plaintext = kms
        .decrypt(&ciphertext, &nonce)
        .await
        .map_err(|status| format!("decrypt error: {}", status.message()))?;
    Ok(String::from_utf8_lossy(&plaintext).into_owned())
}

fn timeout_record(
    original: &CardRecord,
    encrypted: &EncryptedRecord,
    timeout: Duration,
) -> VerificationRecord {
    let mut record = VerificationRecord::base(original);
    record.encrypted_pan = encrypted.encrypted_pan.clone();
    record.encrypted_cvv = encrypted.encrypted_cvv.clone();
    let message = format!("timeout after {}s", timeout.as_secs());
    record.pan_error = message.clone();
    record.cvv_error = message;
    record
}

/// PCI-safe spot check: decrypt a handful of destination rows and print only
/// masked PANs.
pub async fn run_safe_verification(dest: &AnyPool, kms: &KmsApi) -> Result<()> {
    println!("=== Running PCI-compliant spot check ===");
    let sample = db::sample_encrypted(dest, 5).await?;
    if sample.is_empty() {
        println!("destination table is empty; nothing to verify");
        return Ok(());
    }

    println!("{:<10} | {:<6} | masked PAN", "source_id", "status");
    println!("-------------------------------------------");
    for (source_id, encrypted_pan) in sample {
        match decrypt_envelope(kms, &encrypted_pan).await {
            Ok(plaintext) => {
                println!("{source_id:<10} | OK     | {}", mask_pan(&plaintext));
            }
            Err(message) => {
                println!("{source_id:<10} | FAIL   | {message}");
            }
        }
    }
    println!("=== Spot check done ===");
    Ok(())
}
