use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use tally_core::{Amount, Annotation, Transaction, TransactionId, TransactionType};
use tally_import::{ColumnMapping, ImportSummary, Resolution};
use tracing::{debug, info};

use crate::{StoreError, TransactionStore};

pub type DbPool = Pool<Sqlite>;

type TransactionRow = (String, String, String, String, String, String, String, String, String);

/// One row of a user's upload history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub file_id: String,
    pub kind: String,
    pub rows_read: i64,
    pub accepted: i64,
    pub rejected: i64,
    pub imported_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    /// Open or create a database file.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&format!("sqlite:{}?mode=rwc", path.display()))
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
        sqlx::query("PRAGMA synchronous = NORMAL").execute(&pool).await?;
        sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

        run_migrations(&pool).await?;
        info!(path = %path.display(), "Opened store");
        Ok(Self { pool })
    }

    /// Private database for tests and one-off runs. A single connection keeps
    /// every query on the same in-memory database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn record_import(&self, user: &str, summary: &ImportSummary) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO import_history (user_key, file_id, kind, rows_read, accepted, rejected, imported_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(user)
        .bind(&summary.file_id)
        .bind(summary.kind.tag())
        .bind(summary.rows_read as i64)
        .bind(summary.accepted as i64)
        .bind(summary.rejected as i64)
        .bind(summary.imported_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Newest first.
    pub async fn import_history(&self, user: &str) -> Result<Vec<HistoryEntry>, StoreError> {
        let rows = sqlx::query_as::<_, (String, String, i64, i64, i64, String)>(
            "SELECT file_id, kind, rows_read, accepted, rejected, imported_at FROM import_history WHERE user_key = ? ORDER BY id DESC",
        )
        .bind(user)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(file_id, kind, rows_read, accepted, rejected, imported_at)| {
                let imported_at = DateTime::parse_from_rfc3339(&imported_at)
                    .map_err(|e| StoreError::Corrupt(format!("imported_at '{imported_at}': {e}")))?
                    .with_timezone(&Utc);
                Ok(HistoryEntry {
                    file_id,
                    kind,
                    rows_read,
                    accepted,
                    rejected,
                    imported_at,
                })
            })
            .collect()
    }
}

async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS transactions (
            user_key TEXT NOT NULL,
            seq INTEGER NOT NULL,
            id TEXT NOT NULL,
            date TEXT NOT NULL,
            description TEXT NOT NULL,
            category TEXT NOT NULL,
            amount TEXT NOT NULL,
            kind TEXT NOT NULL,
            source_file TEXT NOT NULL,
            raw_ref TEXT NOT NULL,
            annotations TEXT NOT NULL DEFAULT '[]',
            PRIMARY KEY (user_key, id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS mapping_templates (
            user_key TEXT NOT NULL,
            layout_key TEXT NOT NULL,
            mapping TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (user_key, layout_key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS import_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_key TEXT NOT NULL,
            file_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            rows_read INTEGER NOT NULL,
            accepted INTEGER NOT NULL,
            rejected INTEGER NOT NULL,
            imported_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cluster_resolutions (
            user_key TEXT NOT NULL,
            cluster_id TEXT NOT NULL,
            resolution TEXT NOT NULL,
            resolved_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (user_key, cluster_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

fn transaction_from_row(row: TransactionRow) -> Result<Transaction, StoreError> {
    let (id, date, description, category, amount, kind, source_file, raw_ref, annotations) = row;
    let date = NaiveDate::parse_from_str(&date, "%Y-%m-%d")
        .map_err(|e| StoreError::Corrupt(format!("date '{date}' of {id}: {e}")))?;
    let amount = Decimal::from_str(&amount)
        .map(Amount::from_decimal)
        .map_err(|e| StoreError::Corrupt(format!("amount '{amount}' of {id}: {e}")))?;
    let kind = TransactionType::from_label(&kind)
        .ok_or_else(|| StoreError::Corrupt(format!("type '{kind}' of {id}")))?;
    let annotations: BTreeSet<Annotation> = serde_json::from_str(&annotations)?;

    Ok(Transaction {
        id: TransactionId(id),
        date,
        description,
        category,
        amount,
        kind,
        source_file,
        raw_ref,
        annotations,
    })
}

#[async_trait]
impl TransactionStore for SqliteStore {
    async fn load(&self, user: &str) -> Result<Vec<Transaction>, StoreError> {
        let rows = sqlx::query_as::<_, TransactionRow>(
            "SELECT id, date, description, category, amount, kind, source_file, raw_ref, annotations FROM transactions WHERE user_key = ? ORDER BY seq",
        )
        .bind(user)
        .fetch_all(&self.pool)
        .await?;
        debug!(user, rows = rows.len(), "Loaded transactions");
        rows.into_iter().map(transaction_from_row).collect()
    }

    async fn save(&self, user: &str, transactions: &[Transaction]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM transactions WHERE user_key = ?")
            .bind(user)
            .execute(&mut *tx)
            .await?;

        for (seq, t) in transactions.iter().enumerate() {
            let annotations = serde_json::to_string(&t.annotations)?;
            sqlx::query(
                "INSERT INTO transactions (user_key, seq, id, date, description, category, amount, kind, source_file, raw_ref, annotations) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(user)
            .bind(seq as i64)
            .bind(t.id.as_str())
            .bind(t.date.format("%Y-%m-%d").to_string())
            .bind(&t.description)
            .bind(&t.category)
            .bind(t.amount.to_string())
            .bind(t.kind.to_string())
            .bind(&t.source_file)
            .bind(&t.raw_ref)
            .bind(annotations)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        info!(user, rows = transactions.len(), "Saved transactions");
        Ok(())
    }

    async fn list_users(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query_as::<_, (String,)>(
            "SELECT user_key FROM transactions UNION SELECT user_key FROM mapping_templates ORDER BY user_key",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(u,)| u).collect())
    }

    async fn load_templates(&self, user: &str) -> Result<HashMap<String, ColumnMapping>, StoreError> {
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT layout_key, mapping FROM mapping_templates WHERE user_key = ?",
        )
        .bind(user)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(key, json)| Ok((key, serde_json::from_str(&json)?)))
            .collect()
    }

    async fn save_template(&self, user: &str, layout_key: &str, mapping: &ColumnMapping) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO mapping_templates (user_key, layout_key, mapping, updated_at) VALUES (?, ?, ?, datetime('now'))",
        )
        .bind(user)
        .bind(layout_key)
        .bind(serde_json::to_string(mapping)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_resolutions(&self, user: &str) -> Result<HashMap<String, Resolution>, StoreError> {
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT cluster_id, resolution FROM cluster_resolutions WHERE user_key = ?",
        )
        .bind(user)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(id, json)| Ok((id, serde_json::from_str(&json)?)))
            .collect()
    }

    async fn save_resolution(&self, user: &str, cluster_id: &str, resolution: &Resolution) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO cluster_resolutions (user_key, cluster_id, resolution, resolved_at) VALUES (?, ?, ?, datetime('now'))",
        )
        .bind(user)
        .bind(cluster_id)
        .bind(serde_json::to_string(resolution)?)
        .execute(&self.pool)
        .await?;
        debug!(user, cluster = cluster_id, "Recorded cluster resolution");
        Ok(())
    }
}
