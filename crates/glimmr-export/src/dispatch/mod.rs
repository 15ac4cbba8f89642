//! Job dispatch and read-driven reconciliation.
//!
//! Asynchronous exports are handed to a [`JobQueue`] with the export id as
//! the job id. The queue is authoritative for job state; local progress
//! records are refreshed from it when a client polls, via the pure
//! [`reconcile`] mapping.

mod local;

pub use local::{ExportJobRunner, LocalJobQueue};

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::progress::{ExportProgress, ExportProgressPatch, ExportStatus};
use crate::types::{DatasetScope, Filters, Format};

#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue cannot accept or answer requests right now.
    #[error("Export queue unavailable: {0}")]
    Unavailable(String),

    #[error("Export queue error: {0}")]
    Backend(String),
}

/// Payload placed on the queue for one asynchronous export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportJobMessage {
    pub export_id: String,
    pub format: Format,
    pub dataset: DatasetScope,
    /// Record limit after the format cap was applied.
    pub limit: u64,
    #[serde(default)]
    pub filters: Filters,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// A job with the same id already exists; nothing was scheduled.
    AlreadyQueued,
}

/// Job state as reported by the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteJobState {
    Waiting,
    Active {
        progress: Option<u8>,
    },
    Completed {
        download_url: Option<String>,
        processed_records: Option<u64>,
    },
    Failed {
        reason: String,
    },
}

/// A finished export file held by the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportArtifact {
    pub export_id: String,
    pub path: PathBuf,
    pub format: Format,
    pub dataset: DatasetScope,
    pub completed_at: DateTime<Utc>,
}

impl ExportArtifact {
    /// Filename offered to clients downloading the artifact.
    pub fn file_name(&self) -> String {
        crate::output::attachment_filename(self.dataset, self.format, self.completed_at)
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Schedule a job whose id is `message.export_id`.
    async fn enqueue(&self, message: ExportJobMessage) -> Result<EnqueueOutcome, QueueError>;

    /// Current state of a job, or `None` if the queue does not know it.
    async fn job_state(&self, job_id: &str) -> Result<Option<RemoteJobState>, QueueError>;

    /// Output file of a completed job, if the queue keeps one.
    async fn artifact(&self, _job_id: &str) -> Result<Option<ExportArtifact>, QueueError> {
        Ok(None)
    }

    /// Forget finished jobs older than `before`. Returns how many were dropped.
    async fn purge(&self, _before: DateTime<Utc>) -> Result<usize, QueueError> {
        Ok(0)
    }
}

/// Outcome of comparing remote job state with the local record.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    Active(ExportProgressPatch),
    Completed(ExportProgressPatch),
    Failed(ExportProgressPatch),
    /// Nothing to apply: the job is waiting or the queue no longer knows it.
    Unknown,
}

impl Reconciliation {
    pub fn into_patch(self) -> Option<ExportProgressPatch> {
        match self {
            Self::Active(patch) | Self::Completed(patch) | Self::Failed(patch) => Some(patch),
            Self::Unknown => None,
        }
    }
}

/// Map remote job state onto a patch for the local progress record.
pub fn reconcile(
    remote: Option<&RemoteJobState>,
    current: &ExportProgress,
    now: DateTime<Utc>,
) -> Reconciliation {
    match remote {
        None | Some(RemoteJobState::Waiting) => Reconciliation::Unknown,
        Some(RemoteJobState::Active { progress }) => {
            Reconciliation::Active(ExportProgressPatch {
                status: Some(ExportStatus::Processing),
                progress: Some(progress.unwrap_or(0)),
                message: Some("Processing export...".into()),
                ..Default::default()
            })
        }
        Some(RemoteJobState::Completed {
            download_url,
            processed_records,
        }) => Reconciliation::Completed(ExportProgressPatch {
            status: Some(ExportStatus::Completed),
            progress: Some(100),
            message: Some("Export completed".into()),
            completed_at: Some(now),
            download_url: download_url.clone(),
            processed_records: processed_records.or(current.total_records),
            ..Default::default()
        }),
        Some(RemoteJobState::Failed { reason }) => Reconciliation::Failed(ExportProgressPatch {
            status: Some(ExportStatus::Failed),
            progress: Some(0),
            message: Some(format!("Export failed: {reason}")),
            error_message: Some(reason.clone()),
            ..Default::default()
        }),
    }
}

/// Front for the job queue used by the export service.
#[derive(Clone)]
pub struct JobDispatcher {
    queue: Arc<dyn JobQueue>,
}

impl JobDispatcher {
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self { queue }
    }

    pub async fn dispatch(&self, message: ExportJobMessage) -> Result<EnqueueOutcome, QueueError> {
        let export_id = message.export_id.clone();
        let outcome = self.queue.enqueue(message).await?;
        match outcome {
            EnqueueOutcome::Enqueued => {
                tracing::info!(export_id = %export_id, "Export job enqueued");
            }
            EnqueueOutcome::AlreadyQueued => {
                tracing::info!(export_id = %export_id, "Export job already queued, skipping");
            }
        }
        Ok(outcome)
    }

    /// Patch to apply to `current`, if any. Queue failures are logged and
    /// treated as "no news" so polling keeps returning the last local state.
    pub async fn reconcile(&self, current: &ExportProgress) -> Option<ExportProgressPatch> {
        let remote = match self.queue.job_state(&current.export_id).await {
            Ok(remote) => remote,
            Err(e) => {
                tracing::warn!(
                    export_id = %current.export_id,
                    error = %e,
                    "Job state lookup failed; returning last known progress"
                );
                return None;
            }
        };

        let outcome = reconcile(remote.as_ref(), current, Utc::now());
        tracing::debug!(
            export_id = %current.export_id,
            outcome = ?outcome,
            "Export reconciled"
        );
        outcome.into_patch()
    }

    pub async fn artifact(&self, export_id: &str) -> Result<Option<ExportArtifact>, QueueError> {
        self.queue.artifact(export_id).await
    }

    pub async fn purge(&self, before: DateTime<Utc>) -> Result<usize, QueueError> {
        self.queue.purge(before).await
    }
}
