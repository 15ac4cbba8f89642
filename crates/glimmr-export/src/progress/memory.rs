use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::{ExportProgress, ExportProgressPatch, ProgressStore, StoreError};

/// Single-process progress store.
///
/// Each key lives in one DashMap shard; `merge` holds that shard's write lock
/// while applying the patch, which makes merge/get on the same id
/// linearizable and leaves other ids untouched.
#[derive(Debug, Default)]
pub struct InMemoryProgressStore {
    entries: DashMap<String, ExportProgress>,
}

impl InMemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl ProgressStore for InMemoryProgressStore {
    async fn create(&self, progress: ExportProgress) -> Result<(), StoreError> {
        match self.entries.entry(progress.export_id.clone()) {
            Entry::Occupied(_) => Err(StoreError::Duplicate(progress.export_id)),
            Entry::Vacant(slot) => {
                slot.insert(progress);
                Ok(())
            }
        }
    }

    async fn merge(
        &self,
        export_id: &str,
        patch: ExportProgressPatch,
    ) -> Result<Option<ExportProgress>, StoreError> {
        let Some(mut entry) = self.entries.get_mut(export_id) else {
            return Ok(None);
        };
        if !entry.apply(patch) {
            tracing::debug!(
                export_id = %export_id,
                status = %entry.status,
                "Progress patch ignored"
            );
        }
        Ok(Some(entry.clone()))
    }

    async fn get(&self, export_id: &str) -> Result<Option<ExportProgress>, StoreError> {
        Ok(self.entries.get(export_id).map(|e| e.value().clone()))
    }

    async fn list_all(&self) -> Result<Vec<ExportProgress>, StoreError> {
        let mut all: Vec<ExportProgress> =
            self.entries.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all)
    }

    async fn remove(&self, export_id: &str) -> Result<bool, StoreError> {
        Ok(self.entries.remove(export_id).is_some())
    }

    async fn sweep(
        &self,
        now: DateTime<Utc>,
        retention: chrono::Duration,
    ) -> Result<usize, StoreError> {
        let before = self.entries.len();
        self.entries.retain(|_, p| !p.is_expired(now, retention));
        Ok(before.saturating_sub(self.entries.len()))
    }
}
