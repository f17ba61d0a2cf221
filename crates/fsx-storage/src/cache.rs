use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fsx_core::MatchCacheEntry;
use tokio::sync::Mutex;

use crate::store::{Store, StoreError};

/// Cache row about to be appended.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMatchEntry {
    pub source_label: String,
    pub normalized_label: String,
    pub matched_field: Option<String>,
    pub confidence: f64,
    pub reason: String,
}

impl NewMatchEntry {
    pub(crate) fn into_entry(self, id: i64, created_at: DateTime<Utc>) -> MatchCacheEntry {
        MatchCacheEntry {
            id,
            source_label: self.source_label,
            normalized_label: self.normalized_label,
            matched_field: self.matched_field,
            confidence: fsx_core::clamp_confidence(self.confidence),
            reason: self.reason,
            created_at,
        }
    }
}

/// Append-only memo of label resolutions. Lookups are by the verbatim label and return
/// the most recent entry.
#[async_trait]
pub trait MatchCache: Send + Sync {
    async fn latest(&self, source_label: &str) -> Result<Option<MatchCacheEntry>, StoreError>;
    async fn append(&self, entry: NewMatchEntry) -> Result<MatchCacheEntry, StoreError>;
}

#[async_trait]
impl MatchCache for Store {
    async fn latest(&self, source_label: &str) -> Result<Option<MatchCacheEntry>, StoreError> {
        self.latest_match(source_label).await
    }

    async fn append(&self, entry: NewMatchEntry) -> Result<MatchCacheEntry, StoreError> {
        self.insert_match(&entry).await
    }
}

/// Process-local cache, for tests and dry runs that should not touch a database.
#[derive(Debug, Default)]
pub struct MemoryMatchCache {
    entries: Mutex<Vec<MatchCacheEntry>>,
}

impl MemoryMatchCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub async fn entries(&self) -> Vec<MatchCacheEntry> {
        self.entries.lock().await.clone()
    }
}

#[async_trait]
impl MatchCache for MemoryMatchCache {
    async fn latest(&self, source_label: &str) -> Result<Option<MatchCacheEntry>, StoreError> {
        let entries = self.entries.lock().await;
        Ok(entries
            .iter()
            .rev()
            .find(|e| e.source_label == source_label)
            .cloned())
    }

    async fn append(&self, entry: NewMatchEntry) -> Result<MatchCacheEntry, StoreError> {
        let mut entries = self.entries.lock().await;
        let id = entries.len() as i64 + 1;
        let entry = entry.into_entry(id, Utc::now());
        entries.push(entry.clone());
        Ok(entry)
    }
}
