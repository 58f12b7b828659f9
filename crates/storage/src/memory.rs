use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tally_core::Transaction;
use tally_import::{ColumnMapping, Resolution};
use tokio::sync::RwLock;

use crate::{StoreError, TransactionStore};

#[derive(Default)]
struct UserState {
    transactions: Vec<Transaction>,
    templates: HashMap<String, ColumnMapping>,
    resolutions: HashMap<String, Resolution>,
}

/// Process-local store with the same contract as [`crate::SqliteStore`].
#[derive(Default)]
pub struct MemoryStore {
    users: RwLock<BTreeMap<String, UserState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransactionStore for MemoryStore {
    async fn load(&self, user: &str) -> Result<Vec<Transaction>, StoreError> {
        let users = self.users.read().await;
        Ok(users.get(user).map(|u| u.transactions.clone()).unwrap_or_default())
    }

    async fn save(&self, user: &str, transactions: &[Transaction]) -> Result<(), StoreError> {
        let mut users = self.users.write().await;
        users.entry(user.to_string()).or_default().transactions = transactions.to_vec();
        Ok(())
    }

    async fn list_users(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.users.read().await.keys().cloned().collect())
    }

    async fn load_templates(&self, user: &str) -> Result<HashMap<String, ColumnMapping>, StoreError> {
        let users = self.users.read().await;
        Ok(users.get(user).map(|u| u.templates.clone()).unwrap_or_default())
    }

    async fn save_template(&self, user: &str, layout_key: &str, mapping: &ColumnMapping) -> Result<(), StoreError> {
        let mut users = self.users.write().await;
        users
            .entry(user.to_string())
            .or_default()
            .templates
            .insert(layout_key.to_string(), mapping.clone());
        Ok(())
    }

    async fn load_resolutions(&self, user: &str) -> Result<HashMap<String, Resolution>, StoreError> {
        let users = self.users.read().await;
        Ok(users.get(user).map(|u| u.resolutions.clone()).unwrap_or_default())
    }

    async fn save_resolution(&self, user: &str, cluster_id: &str, resolution: &Resolution) -> Result<(), StoreError> {
        let mut users = self.users.write().await;
        users
            .entry(user.to_string())
            .or_default()
            .resolutions
            .insert(cluster_id.to_string(), resolution.clone());
        Ok(())
    }
}
