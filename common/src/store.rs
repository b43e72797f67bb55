// In-memory bucket store
// Maps canonical bucket keys to the ordered Units scheduled under them.

use crate::models::BucketKey;
use crate::sandbox::Unit;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

/// BucketKey → ordered Units.
///
/// One lock guards the whole map; every read hands out a copy of the bucket,
/// so callers never observe a half-applied mutation.
#[derive(Debug, Default)]
pub struct BucketStore {
    buckets: RwLock<HashMap<BucketKey, Vec<Unit>>>,
}

impl BucketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bucket contents, creating the bucket empty on first reference
    pub async fn get_or_create(&self, key: &BucketKey) -> Vec<Unit> {
        if let Some(units) = self.buckets.read().await.get(key) {
            return units.clone();
        }

        self.buckets
            .write()
            .await
            .entry(key.clone())
            .or_default()
            .clone()
    }

    /// Atomic snapshot of a bucket for execution
    pub async fn snapshot(&self, key: &BucketKey) -> Vec<Unit> {
        self.get_or_create(key).await
    }

    /// Replace a whole bucket
    pub async fn replace(&self, key: BucketKey, units: Vec<Unit>) {
        self.buckets.write().await.insert(key, units);
    }

    /// Replace a bucket with a copy that omits the given ids.
    ///
    /// Returns how many Units were dropped.
    pub async fn exclude(&self, key: &BucketKey, ids: &HashSet<Uuid>) -> usize {
        let mut buckets = self.buckets.write().await;
        let bucket = buckets.entry(key.clone()).or_default();

        let kept: Vec<Unit> = bucket
            .iter()
            .filter(|unit| !ids.contains(&unit.id()))
            .cloned()
            .collect();
        let removed = bucket.len() - kept.len();
        *bucket = kept;
        removed
    }

    /// Append a Unit to the tail of a bucket
    pub async fn append(&self, key: BucketKey, unit: Unit) {
        self.buckets.write().await.entry(key).or_default().push(unit);
    }

    /// Append a staged batch under a single write lock
    pub async fn append_all(&self, batch: Vec<(BucketKey, Unit)>) {
        let mut buckets = self.buckets.write().await;
        for (key, unit) in batch {
            buckets.entry(key).or_default().push(unit);
        }
    }

    pub async fn keys(&self) -> Vec<BucketKey> {
        let mut keys: Vec<BucketKey> = self.buckets.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of Units in a bucket; 0 when absent
    pub async fn len(&self, key: &BucketKey) -> usize {
        self.buckets.read().await.get(key).map_or(0, Vec::len)
    }

    pub async fn total_units(&self) -> usize {
        self.buckets.read().await.values().map(Vec::len).sum()
    }
}
