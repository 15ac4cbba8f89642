//! Export progress tracking.
//!
//! Every export gets one [`ExportProgress`] record keyed by its export id.
//! Records move forward through `pending -> processing -> completed|failed`
//! and are frozen once terminal. Stores apply [`ExportProgressPatch`]es via
//! [`ExportProgress::apply`] so the transition rules live in one place.

mod memory;
pub mod sweeper;

pub use memory::InMemoryProgressStore;
pub use sweeper::ProgressSweeper;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Export already exists: {0}")]
    Duplicate(String),

    #[error("Progress store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt progress record {id}: {message}")]
    Corrupt { id: String, message: String },
}

/// Lifecycle state of an export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ExportStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Processing => 1,
            Self::Completed | Self::Failed => 2,
        }
    }

    /// Forward-only transitions. Staying in a non-terminal state is allowed;
    /// skipping `processing` is allowed because polling may miss it.
    pub fn can_transition_to(&self, next: ExportStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == *self || next.rank() > self.rank()
    }
}

impl std::fmt::Display for ExportStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExportStatus::Pending => write!(f, "pending"),
            ExportStatus::Processing => write!(f, "processing"),
            ExportStatus::Completed => write!(f, "completed"),
            ExportStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Progress record for one export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportProgress {
    pub export_id: String,
    pub status: ExportStatus,
    /// Percentage, 0..=100.
    pub progress: u8,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub download_url: Option<String>,
    pub error_message: Option<String>,
    pub total_records: Option<u64>,
    pub processed_records: Option<u64>,
}

impl ExportProgress {
    /// Initial record for an export handed to the job queue.
    pub fn pending(
        export_id: impl Into<String>,
        total_records: u64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            export_id: export_id.into(),
            status: ExportStatus::Pending,
            progress: 0,
            message: "Export queued for processing".into(),
            created_at,
            completed_at: None,
            download_url: None,
            error_message: None,
            total_records: Some(total_records),
            processed_records: None,
        }
    }

    /// Record for an export served synchronously; born terminal.
    pub fn completed(
        export_id: impl Into<String>,
        total_records: u64,
        download_url: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            export_id: export_id.into(),
            status: ExportStatus::Completed,
            progress: 100,
            message: "Export ready for download".into(),
            created_at,
            completed_at: Some(created_at),
            download_url: Some(download_url.into()),
            error_message: None,
            total_records: Some(total_records),
            processed_records: Some(total_records),
        }
    }

    /// Shallow-merge a patch, enforcing the lifecycle rules.
    ///
    /// Returns `false` (and leaves the record untouched) when the record is
    /// terminal or the patch would move the status backwards. While the
    /// record stays non-terminal, progress never decreases.
    pub fn apply(&mut self, patch: ExportProgressPatch) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        let next_status = patch.status.unwrap_or(self.status);
        if !self.status.can_transition_to(next_status) {
            return false;
        }

        if let Some(progress) = patch.progress {
            let progress = progress.min(100);
            self.progress = if next_status.is_terminal() {
                progress
            } else {
                self.progress.max(progress)
            };
        }
        self.status = next_status;
        if let Some(message) = patch.message {
            self.message = message;
        }
        if patch.completed_at.is_some() {
            self.completed_at = patch.completed_at;
        }
        if patch.download_url.is_some() {
            self.download_url = patch.download_url;
        }
        if patch.error_message.is_some() {
            self.error_message = patch.error_message;
        }
        if patch.total_records.is_some() {
            self.total_records = patch.total_records;
        }
        if patch.processed_records.is_some() {
            self.processed_records = patch.processed_records;
        }
        true
    }

    /// True when `created_at` is older than `retention` at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>, retention: chrono::Duration) -> bool {
        now - self.created_at > retention
    }
}

/// Partial update to an [`ExportProgress`]; `None` fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportProgressPatch {
    pub status: Option<ExportStatus>,
    pub progress: Option<u8>,
    pub message: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub download_url: Option<String>,
    pub error_message: Option<String>,
    pub total_records: Option<u64>,
    pub processed_records: Option<u64>,
}

/// Keyed store of export progress records.
///
/// Implementations must apply `merge` atomically per key: a concurrent `get`
/// for the same id observes either the record before the patch or after it,
/// never a partial write.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Insert a new record. Fails with [`StoreError::Duplicate`] if the id exists.
    async fn create(&self, progress: ExportProgress) -> Result<(), StoreError>;

    /// Apply a patch to an existing record and return the resulting record.
    /// Unknown ids yield `Ok(None)`; no entry is created.
    async fn merge(
        &self,
        export_id: &str,
        patch: ExportProgressPatch,
    ) -> Result<Option<ExportProgress>, StoreError>;

    async fn get(&self, export_id: &str) -> Result<Option<ExportProgress>, StoreError>;

    /// All records, most recently created first.
    async fn list_all(&self) -> Result<Vec<ExportProgress>, StoreError>;

    /// Delete a record. Returns whether it existed.
    async fn remove(&self, export_id: &str) -> Result<bool, StoreError>;

    /// Delete every record created more than `retention` before `now`.
    async fn sweep(
        &self,
        now: DateTime<Utc>,
        retention: chrono::Duration,
    ) -> Result<usize, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processing(progress: u8) -> ExportProgressPatch {
        ExportProgressPatch {
            status: Some(ExportStatus::Processing),
            progress: Some(progress),
            ..Default::default()
        }
    }

    #[test]
    fn status_serialization() {
        let serialized = serde_json::to_string(&ExportStatus::Processing).unwrap();
        assert_eq!(serialized, "\"processing\"");
        let status: ExportStatus = serde_json::from_str("\"failed\"").unwrap();
        assert_eq!(status, ExportStatus::Failed);
    }

    #[test]
    fn transitions_only_move_forward() {
        use ExportStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Pending.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Failed));
        assert!(!Processing.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Failed));
    }

    #[test]
    fn progress_never_decreases_while_running() {
        let mut record = ExportProgress::pending("e1", 100, Utc::now());
        assert!(record.apply(processing(40)));
        assert!(record.apply(processing(25)));
        assert_eq!(record.progress, 40);
        assert!(record.apply(processing(70)));
        assert_eq!(record.progress, 70);
    }

    #[test]
    fn terminal_records_are_frozen() {
        let mut record = ExportProgress::pending("e1", 100, Utc::now());
        record.apply(processing(60));
        assert!(record.apply(ExportProgressPatch {
            status: Some(ExportStatus::Failed),
            progress: Some(0),
            error_message: Some("boom".into()),
            ..Default::default()
        }));
        assert_eq!(record.status, ExportStatus::Failed);
        assert_eq!(record.progress, 0);

        let snapshot = record.clone();
        assert!(!record.apply(ExportProgressPatch {
            status: Some(ExportStatus::Completed),
            progress: Some(100),
            ..Default::default()
        }));
        assert!(!record.apply(ExportProgressPatch {
            message: Some("changed".into()),
            ..Default::default()
        }));
        assert_eq!(record, snapshot);
    }

    #[test]
    fn backward_patches_are_ignored_whole() {
        let mut record = ExportProgress::pending("e1", 100, Utc::now());
        record.apply(processing(10));
        let applied = record.apply(ExportProgressPatch {
            status: Some(ExportStatus::Pending),
            message: Some("requeued".into()),
            ..Default::default()
        });
        assert!(!applied);
        assert_eq!(record.status, ExportStatus::Processing);
        assert_ne!(record.message, "requeued");
    }

    #[test]
    fn completed_record_shape() {
        let now = Utc::now();
        let record = ExportProgress::completed("e2", 42, "/download", now);
        assert_eq!(record.status, ExportStatus::Completed);
        assert_eq!(record.progress, 100);
        assert_eq!(record.completed_at, Some(now));

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["exportId"], "e2");
        assert_eq!(json["status"], "completed");
        assert_eq!(json["downloadUrl"], "/download");
        assert_eq!(json["totalRecords"], 42);
    }

    #[test]
    fn expiry_is_strictly_older_than_retention() {
        let now = Utc::now();
        let retention = chrono::Duration::hours(24);
        let old = ExportProgress::pending("old", 1, now - chrono::Duration::hours(25));
        let fresh = ExportProgress::pending("fresh", 1, now - chrono::Duration::hours(23));
        assert!(old.is_expired(now, retention));
        assert!(!fresh.is_expired(now, retention));
    }
}
