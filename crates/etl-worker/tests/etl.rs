//! End-to-end pipeline tests: SQLite source/destination and an in-process
//! KMS server over a loopback listener.

use std::sync::Arc;
use std::time::{Duration, Instant};

use sqlx::AnyPool;
use tempfile::TempDir;
use tokio::net::TcpListener;

use kms_common::{envelope, NONCE_SIZE};
use kms_etl_worker::db::{self, Dialect};
use kms_etl_worker::kms_client::KmsApi;
use kms_etl_worker::pipeline::{run_etl, EtlOptions};
use kms_etl_worker::verify::{verify_all, VerifyOptions};
use kms_etl_worker::report::summarize;
use kms_server::auth::JwtConfig;
use kms_server::grpc::{serve_with_listener, LoginCredentials};
use kms_server::keymgr::{KeyError, KeyManager, SoftwareKeyManager};

const ZERO_KEY_HEX: &str = "0000000000000000000000000000000000000000000000000000000000000000";

async fn start_kms(manager: Arc<dyn KeyManager>, jwt: JwtConfig) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let credentials = LoginCredentials {
        username: "demo".into(),
        password: "demo123".into(),
    };
    tokio::spawn(async move {
        serve_with_listener(listener, manager, jwt, credentials)
            .await
            .unwrap();
    });
    addr.to_string()
}

async fn kms_api(addr: &str, token: Option<String>) -> KmsApi {
    let channel = kms_etl_worker::kms_client::open_channel(addr).unwrap();
    KmsApi::new(channel, token).unwrap()
}

async fn software_kms() -> KmsApi {
    let manager = Arc::new(SoftwareKeyManager::from_hex(ZERO_KEY_HEX).unwrap());
    let addr = start_kms(manager, JwtConfig::disabled()).await;
    kms_api(&addr, None).await
}

/// Create source and destination SQLite databases, seeding `rows` source rows
/// of the shape `(id, "pan"+id, "cvv"+id, "x")`.
async fn databases(dir: &TempDir, rows: i64) -> (AnyPool, AnyPool) {
    let source_dsn = format!("sqlite://{}?mode=rwc", dir.path().join("source.db").display());
    let dest_dsn = format!("sqlite://{}?mode=rwc", dir.path().join("dest.db").display());

    let (source, _) = db::connect("sqlite", &source_dsn).await.unwrap();
    let (dest, _) = db::connect("sqlite", &dest_dsn).await.unwrap();

    sqlx::query(
        "CREATE TABLE cards_to_encrypt (
            id INTEGER PRIMARY KEY,
            card_no TEXT,
            cvv TEXT,
            other_data TEXT
        )",
    )
    .execute(&source)
    .await
    .unwrap();
    sqlx::query(
        "CREATE TABLE encrypted_cards (
            source_id INTEGER PRIMARY KEY,
            encrypted_pan TEXT,
            encrypted_cvv TEXT,
            other_data TEXT
        )",
    )
    .execute(&dest)
    .await
    .unwrap();

    for id in 1..=rows {
        sqlx::query("INSERT INTO cards_to_encrypt (id, card_no, cvv, other_data) VALUES (?, ?, ?, ?)")
            .bind(id)
            .bind(format!("pan{id}"))
            .bind(format!("cvv{id}"))
            .bind("x")
            .execute(&source)
            .await
            .unwrap();
    }

    (source, dest)
}

#[tokio::test]
async fn etl_encrypts_every_row_and_verification_matches() {
    let dir = tempfile::tempdir().unwrap();
    let (source, dest) = databases(&dir, 1000).await;
    let kms = software_kms().await;

    let summary = run_etl(&source, &dest, Dialect::Sqlite, &kms, &EtlOptions::default())
        .await
        .unwrap();
    assert_eq!(summary.scanned, 1000);
    assert_eq!(summary.processed, 1000);
    assert_eq!(summary.errors, 0);
    assert_eq!(db::count_encrypted(&dest).await.unwrap(), 1000);

    // Each destination row decrypts back to its source values.
    let encrypted = db::load_encrypted(&dest).await.unwrap();
    let (nonce, ciphertext) = envelope::split(&encrypted[&7].encrypted_pan, NONCE_SIZE).unwrap();
    assert_eq!(kms.decrypt(&ciphertext, &nonce).await.unwrap(), b"pan7");

    let records = verify_all(&source, &dest, &kms, &VerifyOptions::default())
        .await
        .unwrap();
    let verify_summary = summarize(&records);
    assert_eq!(verify_summary.total, 1000);
    assert_eq!(verify_summary.perfect_matches, 1000);
    assert_eq!(verify_summary.errors, 0);
}

#[tokio::test]
async fn etl_holds_across_worker_and_batch_size_combinations() {
    let kms = software_kms().await;

    for workers in [1usize, 4, 20] {
        for batch_size in [1usize, 100, 500] {
            let dir = tempfile::tempdir().unwrap();
            let (source, dest) = databases(&dir, 120).await;
            let opts = EtlOptions {
                workers,
                batch_size,
                ..EtlOptions::default()
            };
            let summary = run_etl(&source, &dest, Dialect::Sqlite, &kms, &opts)
                .await
                .unwrap();
            assert_eq!(summary.processed, 120, "workers={workers} batch={batch_size}");
            assert_eq!(summary.errors, 0);
            assert_eq!(db::count_encrypted(&dest).await.unwrap(), 120);
        }
    }
}

#[tokio::test]
async fn verification_flags_missing_destination_rows() {
    let dir = tempfile::tempdir().unwrap();
    let (source, dest) = databases(&dir, 10).await;
    let kms = software_kms().await;

    run_etl(&source, &dest, Dialect::Sqlite, &kms, &EtlOptions::default())
        .await
        .unwrap();
    sqlx::query("DELETE FROM encrypted_cards WHERE source_id = 3")
        .execute(&dest)
        .await
        .unwrap();

    let records = verify_all(&source, &dest, &kms, &VerifyOptions::default())
        .await
        .unwrap();
    assert_eq!(records.len(), 10);
    let missing = records.iter().find(|r| r.source_id == 3).unwrap();
    assert_eq!(missing.pan_error, "encrypted record not found");
    assert_eq!(missing.cvv_error, "encrypted record not found");
    assert!(!missing.is_perfect());
    assert_eq!(summarize(&records).perfect_matches, 9);
}

#[tokio::test]
async fn verification_flags_tampered_envelopes() {
    let dir = tempfile::tempdir().unwrap();
    let (source, dest) = databases(&dir, 5).await;
    let kms = software_kms().await;

    run_etl(&source, &dest, Dialect::Sqlite, &kms, &EtlOptions::default())
        .await
        .unwrap();

    // Flip the last ciphertext byte of one PAN envelope and write it back.
    let encrypted = db::load_encrypted(&dest).await.unwrap();
    let (nonce, mut ciphertext) =
        envelope::split(&encrypted[&2].encrypted_pan, NONCE_SIZE).unwrap();
    *ciphertext.last_mut().unwrap() ^= 0x01;
    let tampered = envelope::combine(&nonce, &ciphertext);
    sqlx::query("UPDATE encrypted_cards SET encrypted_pan = ? WHERE source_id = 2")
        .bind(&tampered)
        .execute(&dest)
        .await
        .unwrap();

    let records = verify_all(&source, &dest, &kms, &VerifyOptions::default())
        .await
        .unwrap();
    let flagged = records.iter().find(|r| r.source_id == 2).unwrap();
    assert!(flagged.pan_error.contains("decrypt error"));
    assert!(!flagged.pan_match);
    // The CVV field of the same record still verifies.
    assert!(flagged.cvv_match);
}

/// Key manager whose decrypts never complete, standing in for a wedged HSM.
struct StalledManager {
    inner: SoftwareKeyManager,
}

#[async_trait::async_trait]
impl KeyManager for StalledManager {
    async fn encrypt(&self, plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>), KeyError> {
        self.inner.encrypt(plaintext).await
    }

    async fn decrypt(&self, _ciphertext: &[u8], _nonce: &[u8]) -> Result<Vec<u8>, KeyError> {
        futures::future::pending::<()>().await;
        unreachable!()
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

#[tokio::test]
async fn verification_of_stalled_backend_is_bounded() {
    let dir = tempfile::tempdir().unwrap();
    let (source, dest) = databases(&dir, 8).await;

    let manager = Arc::new(StalledManager {
        inner: SoftwareKeyManager::from_hex(ZERO_KEY_HEX).unwrap(),
    });
    let addr = start_kms(manager, JwtConfig::disabled()).await;
    let kms = kms_api(&addr, None).await;

    run_etl(&source, &dest, Dialect::Sqlite, &kms, &EtlOptions::default())
        .await
        .unwrap();

    let opts = VerifyOptions {
        workers: 4,
        per_record_timeout: Duration::from_millis(300),
        collection_timeout: Duration::from_secs(20),
        overall_deadline: Duration::from_secs(20),
        stuck_warn_after: Duration::from_secs(5),
        progress_every: 50,
    };
    let started = Instant::now();
    let records = verify_all(&source, &dest, &kms, &opts).await.unwrap();

    // Every record comes back flagged as timed out, well within the deadline.
    assert_eq!(records.len(), 8);
    assert!(records.iter().all(|r| r.pan_error.starts_with("timeout")));
    assert!(records.iter().all(|r| r.cvv_error.starts_with("timeout")));
    assert!(started.elapsed() < opts.overall_deadline + Duration::from_secs(5));
    assert_eq!(summarize(&records).perfect_matches, 0);
}

#[tokio::test]
async fn etl_preflight_fails_fast_without_credentials() {
    let dir = tempfile::tempdir().unwrap();
    let (source, dest) = databases(&dir, 3).await;

    let manager = Arc::new(SoftwareKeyManager::from_hex(ZERO_KEY_HEX).unwrap());
    let jwt = JwtConfig {
        secret: "etl-secret".into(),
        audience: None,
        issuer: None,
        ttl: Duration::from_secs(60),
    };
    let addr = start_kms(manager, jwt).await;
    let kms = kms_api(&addr, None).await;

    let err = run_etl(&source, &dest, Dialect::Sqlite, &kms, &EtlOptions::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("KMS connection test failed"));
    assert_eq!(db::count_encrypted(&dest).await.unwrap(), 0);
}

#[tokio::test]
async fn authenticated_etl_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let (source, dest) = databases(&dir, 25).await;

    let manager = Arc::new(SoftwareKeyManager::from_hex(ZERO_KEY_HEX).unwrap());
    let jwt = JwtConfig {
        secret: "etl-secret".into(),
        audience: None,
        issuer: None,
        ttl: Duration::from_secs(60),
    };
    let addr = start_kms(manager, jwt).await;

    // Obtain a token the way the worker does: login with credentials.
    let channel = kms_etl_worker::kms_client::open_channel(&addr).unwrap();
    let token = kms_etl_worker::kms_client::login(channel.clone(), "demo", "demo123")
        .await
        .unwrap();
    let kms = KmsApi::new(channel, Some(token)).unwrap();

    let summary = run_etl(&source, &dest, Dialect::Sqlite, &kms, &EtlOptions::default())
        .await
        .unwrap();
    assert_eq!(summary.processed, 25);

    let records = verify_all(&source, &dest, &kms, &VerifyOptions::default())
        .await
        .unwrap();
    assert_eq!(summarize(&records).perfect_matches, 25);
}
