use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use glimmr_export::output::{attachment_filename, stream_filename};
use glimmr_export::{ExportProgress, ExportRequest, ExportRoute, ExportTicket, ExportWriter, Format};
use serde::Serialize;

use super::body::{export_body, file_body};
use crate::error::ApiError;
use crate::server::AppState;

type Params = Vec<(String, String)>;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportLimits {
    pub max_records: u64,
    #[serde(rename = "maxSizeMB")]
    pub max_size_mb: f64,
    pub applied_record_limit: u64,
}

/// Response of `GET /analytics/export`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportSummary {
    pub export_id: String,
    pub status: glimmr_export::ExportStatus,
    pub estimated_records: u64,
    pub estimated_size: String,
    pub estimated_time: String,
    pub requires_async_processing: bool,
    pub limits: ExportLimits,
    pub message: String,
    pub status_url: String,
    pub download_url: Option<String>,
}

fn minutes_label(minutes: u64) -> String {
    if minutes == 1 {
        "1 minute".to_string()
    } else {
        format!("{minutes} minutes")
    }
}

impl ExportSummary {
    fn from_ticket(ticket: ExportTicket, state: &AppState) -> Self {
        let settings = state.service.settings();
        let estimate = ticket.decision.estimate;
        Self {
            status_url: state.service.status_url(&ticket.export_id),
            export_id: ticket.export_id,
            status: ticket.progress.status,
            estimated_records: estimate.estimated_records,
            estimated_size: format!("{:.2} MB", estimate.estimated_size_mb),
            estimated_time: minutes_label(ticket.decision.estimated_minutes),
            requires_async_processing: estimate.requires_async_processing,
            limits: ExportLimits {
                max_records: settings.record_cap(ticket.request.format),
                max_size_mb: settings.max_size_mb,
                applied_record_limit: estimate.applied_record_limit,
            },
            message: ticket.progress.message,
            download_url: ticket.progress.download_url,
        }
    }
}

/// `GET /analytics/export/stream`: JSON envelope, always synchronous.
pub async fn stream_export(
    State(state): State<AppState>,
    Query(params): Query<Params>,
) -> Result<Response, ApiError> {
    let settings = state.service.settings();
    let request = ExportRequest::streaming_from_params(params, settings.default_limit)?;
    let plan = state.service.prepare_stream(&request);
    let writer = ExportWriter::envelope(request.dataset, settings.record_cap(Format::Json));

    tracing::info!(
        dataset = %request.dataset,
        limit = plan.total_budget(),
        "Streaming export requested"
    );

    let filename = stream_filename(request.dataset, Utc::now());
    let body = export_body(state.service.clone(), plan, writer);
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, Format::Json.content_type().to_string()),
            (header::TRANSFER_ENCODING, "chunked".to_string()),
            (header::CACHE_CONTROL, "no-cache".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        body,
    )
        .into_response())
}

/// `GET /analytics/export`: estimate, route and register an export.
pub async fn request_export(
    State(state): State<AppState>,
    Query(params): Query<Params>,
) -> Result<Response, ApiError> {
    let request = ExportRequest::from_params(params, state.service.settings().default_limit)?;
    let ticket = state.service.request_export(request).await?;
    let status = match ticket.route() {
        ExportRoute::Asynchronous => StatusCode::ACCEPTED,
        ExportRoute::Synchronous => StatusCode::OK,
    };
    Ok((status, Json(ExportSummary::from_ticket(ticket, &state))).into_response())
}

/// `GET /analytics/export/download`: synchronous payload in any format.
pub async fn download_export(
    State(state): State<AppState>,
    Query(params): Query<Params>,
) -> Result<Response, ApiError> {
    let request = ExportRequest::from_params(params, state.service.settings().default_limit)?;
    let sync = state.service.prepare_sync(&request).await?;
    let filename = attachment_filename(request.dataset, request.format, Utc::now());
    let writer = ExportWriter::for_format(request.format);
    let body = export_body(state.service.clone(), sync.plan, writer);
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, request.format.content_type().to_string()),
            (header::TRANSFER_ENCODING, "chunked".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        body,
    )
        .into_response())
}

/// `GET /analytics/export/{export_id}/status`
pub async fn export_status(
    State(state): State<AppState>,
    Path(export_id): Path<String>,
) -> Result<Json<ExportProgress>, ApiError> {
    match state.service.status(&export_id).await? {
        Some(progress) => Ok(Json(progress)),
        None => Err(ApiError::ExportNotFound(export_id)),
    }
}

/// `GET /analytics/export/{export_id}/download`: file written by a worker.
pub async fn download_artifact(
    State(state): State<AppState>,
    Path(export_id): Path<String>,
) -> Result<Response, ApiError> {
    let Some(artifact) = state.service.artifact(&export_id).await? else {
        return Err(ApiError::DownloadUnavailable { export_id });
    };
    let body = match file_body(&artifact.path).await {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!(
                export_id = %export_id,
                path = %artifact.path.display(),
                error = %e,
                "Export file missing"
            );
            return Err(ApiError::DownloadUnavailable { export_id });
        }
    };
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, artifact.format.content_type().to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", artifact.file_name()),
            ),
        ],
        body,
    )
        .into_response())
}

/// `GET /analytics/exports`: every tracked export, newest first.
pub async fn export_history(
    State(state): State<AppState>,
) -> Result<Json<Vec<ExportProgress>>, ApiError> {
    Ok(Json(state.service.history().await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minutes_are_pluralised() {
        assert_eq!(minutes_label(1), "1 minute");
        assert_eq!(minutes_label(3), "3 minutes");
    }
}
