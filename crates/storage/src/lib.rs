pub mod db;
pub mod memory;

use std::collections::HashMap;

use async_trait::async_trait;
use tally_core::Transaction;
use tally_import::{ColumnMapping, Resolution};
use thiserror::Error;

pub use db::{HistoryEntry, SqliteStore};
pub use memory::MemoryStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Stored row is invalid: {0}")]
    Corrupt(String),
}

/// Per-user transaction sets and mapping templates. The engine never holds
/// state between imports; callers load the prior set from here and save the
/// merged result back.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// The user's committed transactions in insertion order; empty for an unknown user.
    async fn load(&self, user: &str) -> Result<Vec<Transaction>, StoreError>;

    /// Replace the user's set in one step.
    async fn save(&self, user: &str, transactions: &[Transaction]) -> Result<(), StoreError>;

    async fn list_users(&self) -> Result<Vec<String>, StoreError>;

    /// Confirmed mappings keyed by layout key.
    async fn load_templates(&self, user: &str) -> Result<HashMap<String, ColumnMapping>, StoreError>;

    async fn save_template(&self, user: &str, layout_key: &str, mapping: &ColumnMapping) -> Result<(), StoreError>;

    /// Decisions taken on duplicate clusters, keyed by cluster id.
    async fn load_resolutions(&self, user: &str) -> Result<HashMap<String, Resolution>, StoreError>;

    /// Record a decision; a later decision for the same cluster replaces it.
    async fn save_resolution(&self, user: &str, cluster_id: &str, resolution: &Resolution) -> Result<(), StoreError>;
}
