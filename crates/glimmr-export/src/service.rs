//! Export orchestration: estimate, route, record progress, dispatch.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::io::AsyncWrite;
use uuid::Uuid;

use crate::config::ExportSettings;
use crate::dispatch::{ExportArtifact, ExportJobMessage, JobDispatcher, JobQueue};
use crate::error::{ExportError, Result};
use crate::estimator::{SizeEstimate, SizeEstimator};
use crate::output::{NoProgress, RecordWriter, StreamingSerializer, WriteSummary};
use crate::progress::{ExportProgress, ProgressStore};
use crate::reader::DatasetReader;
use crate::router::{ExportRoute, ExportRouter, RoutingDecision};
use crate::types::{ExportPlan, ExportRequest, Format};

/// Result of accepting an export request.
#[derive(Debug, Clone)]
pub struct ExportTicket {
    pub export_id: String,
    pub request: ExportRequest,
    pub decision: RoutingDecision,
    pub progress: ExportProgress,
}

impl ExportTicket {
    pub fn route(&self) -> ExportRoute {
        self.decision.route
    }
}

/// A synchronous download that passed estimation and routing.
#[derive(Debug, Clone)]
pub struct SyncExport {
    pub plan: ExportPlan,
    pub estimate: SizeEstimate,
}

pub struct ExportService {
    settings: Arc<ExportSettings>,
    estimator: SizeEstimator,
    router: ExportRouter,
    store: Arc<dyn ProgressStore>,
    dispatcher: JobDispatcher,
    serializer: StreamingSerializer,
}

impl ExportService {
    pub fn new(
        reader: Arc<dyn DatasetReader>,
        store: Arc<dyn ProgressStore>,
        queue: Arc<dyn JobQueue>,
        settings: Arc<ExportSettings>,
    ) -> Self {
        Self {
            estimator: SizeEstimator::new(reader.clone(), settings.clone()),
            router: ExportRouter::new(settings.clone()),
            serializer: StreamingSerializer::new(reader, settings.page_size),
            dispatcher: JobDispatcher::new(queue),
            store,
            settings,
        }
    }

    pub fn settings(&self) -> &ExportSettings {
        &self.settings
    }

    pub fn status_url(&self, export_id: &str) -> String {
        format!("{}/{export_id}/status", self.base_path())
    }

    /// Download link for a finished asynchronous export.
    pub fn download_url(&self, export_id: &str) -> String {
        format!("{}/{export_id}/download", self.base_path())
    }

    /// Download link that replays a synchronous request.
    pub fn sync_download_url(&self, request: &ExportRequest, applied_limit: u64) -> String {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        query
            .append_pair("format", request.format.as_str())
            .append_pair("dataset", request.dataset.as_str())
            .append_pair("limit", &applied_limit.to_string());
        for (key, value) in &request.filters {
            query.append_pair(key, value);
        }
        format!("{}/download?{}", self.base_path(), query.finish())
    }

    fn base_path(&self) -> &str {
        self.settings.public_base_path.trim_end_matches('/')
    }

    /// Estimate, route and register an export.
    ///
    /// Synchronous exports are recorded as completed with a replayable
    /// download link. Asynchronous exports are recorded as pending and
    /// enqueued; if the queue refuses the job the pending record is removed
    /// and the queue error returned.
    pub async fn request_export(&self, request: ExportRequest) -> Result<ExportTicket> {
        let size = self.estimator.estimate(&request).await?;
        let decision = self.router.decide(&size);
        let export_id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let progress = match decision.route {
            ExportRoute::Synchronous => {
                let url = self.sync_download_url(&request, size.applied_limit);
                let progress = ExportProgress::completed(&export_id, size.records, url, now);
                self.store.create(progress.clone()).await?;
                progress
            }
            ExportRoute::Asynchronous => {
                let progress = ExportProgress::pending(&export_id, size.records, now);
                self.store.create(progress.clone()).await?;

                let message = ExportJobMessage {
                    export_id: export_id.clone(),
                    format: request.format,
                    dataset: request.dataset,
                    limit: size.applied_limit,
                    filters: request.filters.clone(),
                };
                if let Err(e) = self.dispatcher.dispatch(message).await {
                    tracing::error!(export_id = %export_id, error = %e, "Failed to enqueue export");
                    if let Err(remove_err) = self.store.remove(&export_id).await {
                        tracing::warn!(
                            export_id = %export_id,
                            error = %remove_err,
                            "Failed to roll back pending export"
                        );
                    }
                    return Err(e.into());
                }
                progress
            }
        };

        tracing::info!(
            export_id = %export_id,
            dataset = %request.dataset,
            format = %request.format,
            records = size.records,
            size_mb = size.size_mb,
            route = %decision.route,
            "Export accepted"
        );

        Ok(ExportTicket {
            export_id,
            request,
            decision,
            progress,
        })
    }

    /// Estimate a download and refuse it if it belongs on the job queue.
    pub async fn prepare_sync(&self, request: &ExportRequest) -> Result<SyncExport> {
        let estimate = self.estimator.estimate(request).await?;
        let decision = self.router.decide(&estimate);
        if decision.route == ExportRoute::Asynchronous {
            return Err(ExportError::RequiresAsync {
                estimated_records: estimate.records,
                estimated_size_mb: estimate.size_mb,
            });
        }
        Ok(SyncExport {
            plan: self.estimator.plan(request),
            estimate,
        })
    }

    /// Plan for the streaming endpoint: JSON only, limit clamped to the JSON cap.
    pub fn prepare_stream(&self, request: &ExportRequest) -> ExportPlan {
        let limit = request.limit.min(self.settings.record_cap(Format::Json));
        ExportPlan::new(request.dataset, request.filters.clone(), limit)
    }

    /// Run a synchronous export into `sink`.
    pub async fn write_sync<W, S>(
        &self,
        plan: &ExportPlan,
        writer: &mut W,
        sink: &mut S,
    ) -> Result<WriteSummary>
    where
        W: RecordWriter + ?Sized,
        S: AsyncWrite + Unpin + Send + ?Sized,
    {
        let started = Instant::now();
        tracing::info!(
            dataset = %plan.scope,
            budget = plan.total_budget(),
            "Export stream started"
        );

        match self
            .serializer
            .write(plan, writer, sink, &mut NoProgress)
            .await
        {
            Ok(summary) => {
                tracing::info!(
                    dataset = %plan.scope,
                    records = summary.records(),
                    truncated = summary.truncated(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Export stream finished"
                );
                Ok(summary)
            }
            Err(e) if e.is_disconnect() => {
                tracing::info!(
                    dataset = %plan.scope,
                    "Client disconnected; export stream cancelled"
                );
                Err(e)
            }
            Err(e) => {
                tracing::error!(dataset = %plan.scope, error = %e, "Export stream aborted");
                Err(e)
            }
        }
    }

    /// Progress for an export, refreshed from the job queue while it is
    /// still running.
    pub async fn status(&self, export_id: &str) -> Result<Option<ExportProgress>> {
        let Some(current) = self.store.get(export_id).await? else {
            return Ok(None);
        };
        if current.status.is_terminal() {
            return Ok(Some(current));
        }

        let Some(patch) = self.dispatcher.reconcile(&current).await else {
            return Ok(Some(current));
        };
        match self.store.merge(export_id, patch).await {
            Ok(Some(merged)) => Ok(Some(merged)),
            // Swept between read and merge.
            Ok(None) => Ok(None),
            Err(e) => {
                tracing::warn!(
                    export_id = %export_id,
                    error = %e,
                    "Failed to store reconciled progress"
                );
                Ok(Some(current))
            }
        }
    }

    pub async fn history(&self) -> Result<Vec<ExportProgress>> {
        Ok(self.store.list_all().await?)
    }

    /// Finished file for an asynchronous export.
    pub async fn artifact(&self, export_id: &str) -> Result<Option<ExportArtifact>> {
        Ok(self.dispatcher.artifact(export_id).await?)
    }

    /// Remove progress records past retention and purge matching queue jobs.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let retention = self.settings.retention();
        let removed = self.store.sweep(now, retention).await?;
        match self.dispatcher.purge(now - retention).await {
            Ok(purged) if purged > 0 => {
                tracing::debug!(purged, "Finished export jobs purged");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Failed to purge finished export jobs");
            }
        }
        Ok(removed)
    }
}
