// Job ledger abstraction and the in-memory implementation

use crate::errors::{LedgerError, ValidationError};
use crate::models::JobRecord;
use async_trait::async_trait;
use std::path::Path;
use tokio::sync::RwLock;
use tracing::{info, instrument};
use uuid::Uuid;

/// Which records a sync cycle selects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Every record in the ledger
    Full,
    /// Only records with `synced = false`
    Incremental,
}

/// Persistent store of job records
#[async_trait]
pub trait JobLedger: Send + Sync {
    /// Records flagged with `pending_deletion = true`
    async fn find_pending_deletion(&self) -> Result<Vec<JobRecord>, LedgerError>;

    /// Records to materialize, in discovery order
    async fn find_for_sync(&self, mode: SyncMode) -> Result<Vec<JobRecord>, LedgerError>;

    /// Set `synced = true` on all given records as one batch.
    ///
    /// Either every record is updated or none is.
    async fn mark_synced(&self, ids: &[Uuid]) -> Result<u64, LedgerError>;

    /// Delete a record; deleting an absent record is not an error
    async fn delete(&self, id: Uuid) -> Result<(), LedgerError>;

    async fn insert(&self, record: &JobRecord) -> Result<(), LedgerError>;

    async fn get(&self, id: Uuid) -> Result<Option<JobRecord>, LedgerError>;

    async fn set_synced(&self, id: Uuid, synced: bool) -> Result<(), LedgerError>;

    async fn mark_for_deletion(&self, id: Uuid) -> Result<(), LedgerError>;
}

/// Ledger held in process memory, preserving insertion order
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    records: RwLock<Vec<JobRecord>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a ledger from a JSON array of job records
    #[instrument]
    pub async fn from_seed_file(path: &Path) -> Result<Self, LedgerError> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            LedgerError::ConnectionFailed(format!("Failed to read seed file {}: {}", path.display(), e))
        })?;

        let records: Vec<JobRecord> = serde_json::from_str(&raw).map_err(ValidationError::from)?;

        let ledger = Self::new();
        for record in &records {
            ledger.insert(record).await?;
        }

        info!(path = %path.display(), count = records.len(), "Seeded in-memory ledger");
        Ok(ledger)
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl JobLedger for InMemoryLedger {
    async fn find_pending_deletion(&self) -> Result<Vec<JobRecord>, LedgerError> {
        let records = self.records.read().await;
        Ok(records.iter().filter(|r| r.pending_deletion).cloned().collect())
    }

    async fn find_for_sync(&self, mode: SyncMode) -> Result<Vec<JobRecord>, LedgerError> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .filter(|r| mode == SyncMode::Full || !r.synced)
            .cloned()
            .collect())
    }

    async fn mark_synced(&self, ids: &[Uuid]) -> Result<u64, LedgerError> {
        let mut records = self.records.write().await;
        let mut updated = 0;
        for record in records.iter_mut().filter(|r| ids.contains(&r.id)) {
            record.synced = true;
            updated += 1;
        }
        Ok(updated)
    }

    async fn delete(&self, id: Uuid) -> Result<(), LedgerError> {
        self.records.write().await.retain(|r| r.id != id);
        Ok(())
    }

    async fn insert(&self, record: &JobRecord) -> Result<(), LedgerError> {
        record.validate()?;

        let mut records = self.records.write().await;
        if records.iter().any(|r| r.id == record.id) {
            return Err(LedgerError::DuplicateKey(record.id.to_string()));
        }
        records.push(record.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<JobRecord>, LedgerError> {
        let records = self.records.read().await;
        Ok(records.iter().find(|r| r.id == id).cloned())
    }

    async fn set_synced(&self, id: Uuid, synced: bool) -> Result<(), LedgerError> {
        let mut records = self.records.write().await;
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| LedgerError::NotFound(id.to_string()))?;
        record.synced = synced;
        Ok(())
    }

    async fn mark_for_deletion(&self, id: Uuid) -> Result<(), LedgerError> {
        let mut records = self.records.write().await;
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| LedgerError::NotFound(id.to_string()))?;
        record.pending_deletion = true;
        Ok(())
    }
}
