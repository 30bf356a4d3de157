//! Database access for both ends of the pipeline.
//!
//! One binary serves Postgres, MySQL and SQLite through sqlx's `Any` driver;
//! the only dialect difference that matters here is the placeholder style of
//! the multi-row insert, handled by [`Dialect`].
//!
//! Schemas:
//! - source: `cards_to_encrypt(id, card_no, cvv, other_data)`
//! - destination: `encrypted_cards(source_id, encrypted_pan, encrypted_cvv, other_data)`

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Once;

use anyhow::{Context, Result};
use futures::TryStreamExt;
use sqlx::any::AnyPoolOptions;
use sqlx::{AnyPool, Row};
use tokio::sync::mpsc;
use tracing::warn;

/// A row read from the source table. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct CardRecord {
    pub id: i64,
    pub pan: String,
    pub cvv: String,
    pub other_data: String,
}

/// A row destined for (or read back from) the destination table. Both
/// envelope fields are `base64(nonce ‖ ciphertext)` strings.
#[derive(Debug, Clone)]
pub struct EncryptedRecord {
    pub source_id: i64,
    pub encrypted_pan: String,
    pub encrypted_cvv: String,
    pub other_data: String,
}

/// SQL placeholder dialect, derived from the configured driver name.
///
/// Postgres numbers its parameters (`$1`); MySQL and SQLite use positional
/// `?`. Guessing here would produce inserts that fail only at runtime, so an
/// unknown driver name is a startup error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    MySql,
    Sqlite,
}

impl Dialect {
    /// Map a configured driver name onto a dialect.
    pub fn from_driver(driver: &str) -> Result<Self> {
        match driver {
            "postgres" | "postgresql" => Ok(Dialect::Postgres),
            "mysql" => Ok(Dialect::MySql),
            "sqlite" | "sqlite3" => Ok(Dialect::Sqlite),
            other => anyhow::bail!("unsupported database driver: {other}"),
        }
    }

    /// Append one `(…, …, …, …)` value tuple for row number `row` (0-based)
    /// with `cols` columns.
    fn push_value_tuple(&self, sql: &mut String, row: usize, cols: usize) {
        sql.push('(');
        for col in 0..cols {
            if col > 0 {
                sql.push_str(", ");
            }
            match self {
                Dialect::Postgres => {
                    let _ = write!(sql, "${}", row * cols + col + 1);
                }
                Dialect::MySql | Dialect::Sqlite => sql.push('?'),
            }
        }
        sql.push(')');
    }
}

static INSTALL_DRIVERS: Once = Once::new();

/// Open a connection pool for the configured driver + DSN.
pub async fn connect(driver: &str, dsn: &str) -> Result<(AnyPool, Dialect)> {
    let dialect = Dialect::from_driver(driver)?;
    INSTALL_DRIVERS.call_once(sqlx::any::install_default_drivers);

    let pool = AnyPoolOptions::new()
        .max_connections(5)
        .connect(dsn)
        .await
        .with_context(|| format!("failed to connect to {driver} database"))?;
    Ok((pool, dialect))
}

/// Stream every source row into `tx`, in whatever order the database returns
/// them. Returns the number of rows sent. A send failing means the receiving
/// side shut down; the scan stops quietly in that case.
pub async fn stream_source_rows(pool: &AnyPool, tx: mpsc::Sender<CardRecord>) -> Result<u64> {
    let mut rows =
        sqlx::query("SELECT id, card_no, cvv, other_data FROM cards_to_encrypt").fetch(pool);

    let mut count = 0u64;
    while let Some(row) = rows
        .try_next()
        .await
        .context("failed to read from source table")?
    {
        let record = CardRecord {
            id: row.try_get("id")?,
            pan: row.try_get("card_no")?,
            cvv: row.try_get("cvv")?,
            other_data: row.try_get("other_data")?,
        };
        if tx.send(record).await.is_err() {
            break;
        }
        count += 1;
    }

    if count == 0 {
        warn!("no records found in source table cards_to_encrypt");
    }
    Ok(count)
}

/// Load every source row into memory. Used by the verification pipeline.
pub async fn load_source_rows(pool: &AnyPool) -> Result<Vec<CardRecord>> {
    let rows = sqlx::query("SELECT id, card_no, cvv, other_data FROM cards_to_encrypt")
        .fetch_all(pool)
        .await
        .context("failed to read source table")?;

    rows.into_iter()
        .map(|row| {
            Ok(CardRecord {
                id: row.try_get("id")?,
                pan: row.try_get("card_no")?,
                cvv: row.try_get("cvv")?,
                other_data: row.try_get("other_data")?,
            })
        })
        .collect()
}

/// Load the whole destination table into a map keyed by `source_id`.
pub async fn load_encrypted(pool: &AnyPool) -> Result<HashMap<i64, EncryptedRecord>> {
    let rows = sqlx::query(
        "SELECT source_id, encrypted_pan, encrypted_cvv, other_data FROM encrypted_cards",
    )
    .fetch_all(pool)
    .await
    .context("failed to read destination table")?;

    let mut map = HashMap::with_capacity(rows.len());
    for row in rows {
        let record = EncryptedRecord {
            source_id: row.try_get("source_id")?,
            encrypted_pan: row.try_get("encrypted_pan")?,
            encrypted_cvv: row.try_get("encrypted_cvv")?,
            other_data: row.try_get("other_data")?,
        };
        map.insert(record.source_id, record);
    }
    Ok(map)
}

/// Count destination rows.
pub async fn count_encrypted(pool: &AnyPool) -> Result<i64> {
    let row = sqlx::query("SELECT COUNT(*) AS n FROM encrypted_cards")
        .fetch_one(pool)
        .await
        .context("failed to count destination rows")?;
    Ok(row.try_get("n")?)
}

/// Fetch up to `limit` destination rows for the PCI-safe spot check.
pub async fn sample_encrypted(pool: &AnyPool, limit: i64) -> Result<Vec<(i64, String)>> {
    let sql = format!("SELECT source_id, encrypted_pan FROM encrypted_cards LIMIT {limit}");
    let rows = sqlx::query(&sql)
        .fetch_all(pool)
        .await
        .context("failed to sample destination rows")?;

    rows.into_iter()
        .map(|row| Ok((row.try_get("source_id")?, row.try_get("encrypted_pan")?)))
        .collect()
}

/// Insert a batch with one multi-row statement.
pub async fn insert_batch(
    pool: &AnyPool,
    dialect: Dialect,
    batch: &[EncryptedRecord],
) -> Result<()> {
    if batch.is_empty() {
        return Ok(());
    }

    let mut sql = String::from(
        "INSERT INTO encrypted_cards (source_id, encrypted_pan, encrypted_cvv, other_data) VALUES ",
    );
    for row in 0..batch.len() {
        if row > 0 {
            sql.push_str(", ");
        }
        dialect.push_value_tuple(&mut sql, row, 4);
    }

    let mut query = sqlx::query(&sql);
    for record in batch {
        query = query
            .bind(record.source_id)
            .bind(&record.encrypted_pan)
            .bind(&record.encrypted_cvv)
            .bind(&record.other_data);
    }

    query
        .execute(pool)
        .await
        .with_context(|| format!("batch insert of {} rows failed", batch.len()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialect_from_driver_names() {
        assert_eq!(Dialect::from_driver("postgres").unwrap(), Dialect::Postgres);
        assert_eq!(
            Dialect::from_driver("postgresql").unwrap(),
            Dialect::Postgres
        );
        assert_eq!(Dialect::from_driver("mysql").unwrap(), Dialect::MySql);
        assert_eq!(Dialect::from_driver("sqlite").unwrap(), Dialect::Sqlite);
        assert!(Dialect::from_driver("mssql").is_err());
    }

    #[test]
    fn postgres_placeholders_are_numbered_across_rows() {
        let mut sql = String::new();
        Dialect::Postgres.push_value_tuple(&mut sql, 0, 4);
        sql.push_str(", ");
        Dialect::Postgres.push_value_tuple(&mut sql, 1, 4);
        assert_eq!(sql, "($1, $2, $3, $4), ($5, $6, $7, $8)");
    }

    #[test]
    fn mysql_placeholders_are_positional() {
        let mut sql = String::new();
        Dialect::MySql.push_value_tuple(&mut sql, 3, 4);
        assert_eq!(sql, "(?, ?, ?, ?)");
    }

    async fn sqlite_pool() -> (AnyPool, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let dsn = format!(
            "sqlite://{}?mode=rwc",
            dir.path().join("db.sqlite").display()
        );
        let (pool, _) = connect("sqlite", &dsn).await.unwrap();
        sqlx::query(
            "CREATE TABLE encrypted_cards (
                source_id INTEGER PRIMARY KEY,
                encrypted_pan TEXT,
                encrypted_cvv TEXT,
                other_data TEXT
            )",
        )
        .execute(&pool)
        .await
        .unwrap();
        (pool, dir)
    }

    #[tokio::test]
    async fn insert_and_load_round_trip() {
        let (pool, _dir) = sqlite_pool().await;
        let batch: Vec<EncryptedRecord> = (1..=3)
            .map(|i| EncryptedRecord {
                source_id: i,
                encrypted_pan: format!("pan-env-{i}"),
                encrypted_cvv: format!("cvv-env-{i}"),
                other_data: "x".into(),
            })
            .collect();

        insert_batch(&pool, Dialect::Sqlite, &batch).await.unwrap();
        assert_eq!(count_encrypted(&pool).await.unwrap(), 3);

        let map = load_encrypted(&pool).await.unwrap();
        assert_eq!(map.len(), 3);
        assert_eq!(map[&2].encrypted_pan, "pan-env-2");

        let sample = sample_encrypted(&pool, 2).await.unwrap();
        assert_eq!(sample.len(), 2);
    }

    #[tokio::test]
    async fn duplicate_source_id_fails_whole_batch() {
        let (pool, _dir) = sqlite_pool().await;
        let record = EncryptedRecord {
            source_id: 1,
            encrypted_pan: "a".into(),
            encrypted_cvv: "b".into(),
            other_data: "c".into(),
        };
        insert_batch(&pool, Dialect::Sqlite, &[record.clone()])
            .await
            .unwrap();
        // Same primary key again: the statement fails and inserts nothing.
        let err = insert_batch(&pool, Dialect::Sqlite, &[record]).await;
        assert!(err.is_err());
        assert_eq!(count_encrypted(&pool).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn empty_batch_is_a_noop() {
        let (pool, _dir) = sqlite_pool().await;
        insert_batch(&pool, Dialect::Sqlite, &[]).await.unwrap();
        assert_eq!(count_encrypted(&pool).await.unwrap(), 0);
    }
}
