//! In-process job queue backed by a tokio worker pool.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::io::BufWriter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{
    EnqueueOutcome, ExportArtifact, ExportJobMessage, JobQueue, QueueError, RemoteJobState,
};
use crate::error::Result;
use crate::output::{ExportWriter, ProgressReporter, StreamingSerializer};
use crate::types::{ExportPlan, Format};

type JobTable = DashMap<String, LocalJob>;

#[derive(Debug, Clone)]
struct LocalJob {
    message: ExportJobMessage,
    state: RemoteJobState,
    artifact: Option<ExportArtifact>,
    finished_at: Option<DateTime<Utc>>,
}

impl LocalJob {
    fn waiting(message: ExportJobMessage) -> Self {
        Self {
            message,
            state: RemoteJobState::Waiting,
            artifact: None,
            finished_at: None,
        }
    }
}

/// Runs one export job: writes the planned rows to a file in the export
/// directory and reports progress into the job table.
pub struct ExportJobRunner {
    serializer: StreamingSerializer,
    export_dir: PathBuf,
    public_base_path: String,
}

impl ExportJobRunner {
    pub fn new(
        serializer: StreamingSerializer,
        export_dir: impl Into<PathBuf>,
        public_base_path: impl Into<String>,
    ) -> Self {
        Self {
            serializer,
            export_dir: export_dir.into(),
            public_base_path: public_base_path.into(),
        }
    }

    pub fn output_path(&self, export_id: &str, format: Format) -> PathBuf {
        self.export_dir
            .join(format!("{export_id}.{}", format.extension()))
    }

    pub fn download_url(&self, export_id: &str) -> String {
        format!(
            "{}/{export_id}/download",
            self.public_base_path.trim_end_matches('/')
        )
    }

    async fn execute(&self, message: &ExportJobMessage, jobs: &Arc<JobTable>) {
        let export_id = message.export_id.as_str();
        let path = self.output_path(export_id, message.format);
        set_state(jobs, export_id, RemoteJobState::Active { progress: Some(0) });

        tracing::info!(
            export_id = %export_id,
            format = %message.format,
            dataset = %message.dataset,
            limit = message.limit,
            "Export job started"
        );
        let started = Instant::now();

        match self.produce(message, &path, jobs).await {
            Ok(records) => {
                if let Some(mut job) = jobs.get_mut(export_id) {
                    let now = Utc::now();
                    job.state = RemoteJobState::Completed {
                        download_url: Some(self.download_url(export_id)),
                        processed_records: Some(records),
                    };
                    job.artifact = Some(ExportArtifact {
                        export_id: export_id.to_string(),
                        path: path.clone(),
                        format: message.format,
                        dataset: message.dataset,
                        completed_at: now,
                    });
                    job.finished_at = Some(now);
                }
                tracing::info!(
                    export_id = %export_id,
                    records,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Export job completed"
                );
            }
            Err(e) => {
                tracing::error!(export_id = %export_id, error = %e, "Export job failed");
                remove_file(&path).await;
                fail(jobs, export_id, e.to_string());
            }
        }
    }

    async fn produce(
        &self,
        message: &ExportJobMessage,
        path: &Path,
        jobs: &Arc<JobTable>,
    ) -> Result<u64> {
        let plan = ExportPlan::new(message.dataset, message.filters.clone(), message.limit);
        let total = self.serializer.count_planned(&plan).await?;

        tokio::fs::create_dir_all(&self.export_dir).await?;
        let file = tokio::fs::File::create(path).await?;
        let mut sink = BufWriter::new(file);
        let mut writer = ExportWriter::for_format(message.format);
        let mut reporter = JobProgress {
            jobs: jobs.clone(),
            export_id: message.export_id.clone(),
            total,
        };

        let summary = self
            .serializer
            .write(&plan, &mut writer, &mut sink, &mut reporter)
            .await?;
        Ok(summary.records())
    }
}

struct JobProgress {
    jobs: Arc<JobTable>,
    export_id: String,
    total: u64,
}

impl ProgressReporter for JobProgress {
    fn report(&mut self, processed: u64) {
        // 100 is reserved for completion.
        let pct = if self.total == 0 {
            0
        } else {
            (processed.saturating_mul(100) / self.total).min(99) as u8
        };
        set_state(
            &self.jobs,
            &self.export_id,
            RemoteJobState::Active { progress: Some(pct) },
        );
    }
}

fn set_state(jobs: &JobTable, export_id: &str, state: RemoteJobState) {
    if let Some(mut job) = jobs.get_mut(export_id) {
        job.state = state;
    }
}

fn fail(jobs: &JobTable, export_id: &str, reason: String) {
    if let Some(mut job) = jobs.get_mut(export_id) {
        job.state = RemoteJobState::Failed { reason };
        job.finished_at = Some(Utc::now());
    }
}

async fn remove_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove export file");
        }
    }
}

/// Bounded queue drained by a fixed pool of worker tasks.
///
/// The job table is the authority for job state: `Waiting` on enqueue,
/// `Active` while a worker writes the file, then `Completed` or `Failed`.
/// Finished jobs stay until [`JobQueue::purge`] drops them with their files.
pub struct LocalJobQueue {
    jobs: Arc<JobTable>,
    sender: mpsc::Sender<ExportJobMessage>,
    token: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl LocalJobQueue {
    pub fn start(runner: ExportJobRunner, worker_count: usize, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let jobs: Arc<JobTable> = Arc::new(DashMap::new());
        let runner = Arc::new(runner);
        let token = CancellationToken::new();

        let workers = (0..worker_count.max(1))
            .map(|worker| {
                let receiver = receiver.clone();
                let jobs = jobs.clone();
                let runner = runner.clone();
                let token = token.child_token();
                tokio::spawn(async move {
                    tracing::debug!(worker, "Export worker started");
                    loop {
                        let message = tokio::select! {
                            _ = token.cancelled() => break,
                            message = async { receiver.lock().await.recv().await } => {
                                match message {
                                    Some(message) => message,
                                    None => break,
                                }
                            }
                        };

                        tokio::select! {
                            _ = token.cancelled() => {
                                fail(
                                    &jobs,
                                    &message.export_id,
                                    "Export cancelled: shutting down".into(),
                                );
                                let path = runner.output_path(&message.export_id, message.format);
                                remove_file(&path).await;
                                break;
                            }
                            _ = runner.execute(&message, &jobs) => {}
                        }
                    }
                    tracing::debug!(worker, "Export worker stopped");
                })
            })
            .collect();

        Self {
            jobs,
            sender,
            token,
            workers: Mutex::new(workers),
        }
    }

    /// Stop accepting work, cancel running jobs and wait for the workers.
    pub async fn shutdown(&self) {
        self.token.cancel();
        let handles = self
            .workers
            .lock()
            .map(|mut guard| std::mem::take(&mut *guard))
            .unwrap_or_default();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Export worker ended abnormally");
            }
        }
    }

    /// Number of jobs currently tracked, finished or not.
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

impl Drop for LocalJobQueue {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[async_trait]
impl JobQueue for LocalJobQueue {
    async fn enqueue(
        &self,
        message: ExportJobMessage,
    ) -> std::result::Result<EnqueueOutcome, QueueError> {
        let export_id = message.export_id.clone();
        match self.jobs.entry(export_id.clone()) {
            Entry::Occupied(_) => return Ok(EnqueueOutcome::AlreadyQueued),
            Entry::Vacant(slot) => {
                slot.insert(LocalJob::waiting(message.clone()));
            }
        }

        if let Err(e) = self.sender.try_send(message) {
            self.jobs.remove(&export_id);
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "export queue is full",
                mpsc::error::TrySendError::Closed(_) => "export workers are not running",
            };
            return Err(QueueError::Unavailable(reason.into()));
        }
        Ok(EnqueueOutcome::Enqueued)
    }

    async fn job_state(
        &self,
        job_id: &str,
    ) -> std::result::Result<Option<RemoteJobState>, QueueError> {
        Ok(self.jobs.get(job_id).map(|job| job.state.clone()))
    }

    async fn artifact(
        &self,
        job_id: &str,
    ) -> std::result::Result<Option<ExportArtifact>, QueueError> {
        Ok(self.jobs.get(job_id).and_then(|job| job.artifact.clone()))
    }

    async fn purge(&self, before: DateTime<Utc>) -> std::result::Result<usize, QueueError> {
        let expired: Vec<String> = self
            .jobs
            .iter()
            .filter(|job| job.finished_at.is_some_and(|at| at < before))
            .map(|job| job.key().clone())
            .collect();

        let mut purged = 0;
        for export_id in expired {
            if let Some((_, job)) = self.jobs.remove(&export_id) {
                if let Some(artifact) = &job.artifact {
                    remove_file(&artifact.path).await;
                }
                tracing::debug!(
                    export_id = %export_id,
                    format = %job.message.format,
                    "Export job purged"
                );
                purged += 1;
            }
        }
        Ok(purged)
    }
}
