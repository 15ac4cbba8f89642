//! HTTP error mapping for export endpoints.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use glimmr_export::{DatasetScope, ErrorKind, ExportError, Format, ValidationError};
use serde_json::{Value, json};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Export(#[from] ExportError),

    #[error("Export not found: {0}")]
    ExportNotFound(String),

    #[error("Export {export_id} has no downloadable file")]
    DownloadUnavailable { export_id: String },
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        Self::Export(e.into())
    }
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Export(e) => match e.kind() {
                ErrorKind::Validation | ErrorKind::SizeLimit => StatusCode::BAD_REQUEST,
                ErrorKind::Conflict => StatusCode::CONFLICT,
                ErrorKind::Queue | ErrorKind::Storage => StatusCode::SERVICE_UNAVAILABLE,
                ErrorKind::DataSource | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::ExportNotFound(_) | ApiError::DownloadUnavailable { .. } => {
                StatusCode::NOT_FOUND
            }
        }
    }

    pub fn body(&self) -> Value {
        match self {
            ApiError::Export(ExportError::Validation(v)) => validation_body(v),
            ApiError::Export(ExportError::SizeLimitExceeded {
                estimated_size_mb,
                max_size_mb,
            }) => json!({
                "error": "Export size exceeds maximum allowed",
                "estimatedSizeMB": round2(*estimated_size_mb),
                "maxSizeMB": max_size_mb,
                "message": "Please apply filters or reduce the limit to narrow the export",
            }),
            ApiError::Export(ExportError::RequiresAsync {
                estimated_records, ..
            }) => json!({
                "error": "Export requires asynchronous processing",
                "estimatedRecords": estimated_records,
                "message": "Request this export through /analytics/export and download it when the job completes",
            }),
            ApiError::Export(e @ ExportError::Queue(_)) => json!({
                "error": "Export queue unavailable",
                "message": e.to_string(),
            }),
            ApiError::Export(e @ ExportError::Storage(_)) => json!({
                "error": "Export progress store unavailable",
                "message": e.to_string(),
            }),
            ApiError::Export(e) => json!({
                "error": "Internal server error during export",
                "message": e.to_string(),
            }),
            ApiError::ExportNotFound(export_id) => json!({
                "error": "Export not found",
                "exportId": export_id,
            }),
            ApiError::DownloadUnavailable { export_id } => json!({
                "error": "Export file not available",
                "exportId": export_id,
                "message": "The export is unknown, still running, failed or has expired",
            }),
        }
    }
}

fn validation_body(e: &ValidationError) -> Value {
    let message = e.to_string();
    match e {
        ValidationError::StreamingFormat { .. } => json!({
            "error": "Only JSON format is supported for streaming exports",
            "supportedFormats": ["json"],
        }),
        ValidationError::UnknownFormat { .. } => json!({
            "error": "Invalid format specified",
            "supportedFormats": Format::ALL.iter().map(Format::as_str).collect::<Vec<_>>(),
            "message": message,
        }),
        ValidationError::UnknownDataset { .. } => json!({
            "error": "Invalid dataset specified",
            "supportedDatasets": DatasetScope::SUPPORTED,
        }),
        ValidationError::InvalidLimit { .. } => json!({
            "error": "Invalid limit specified",
            "message": message,
        }),
        ValidationError::UnsupportedFilter { .. } => json!({
            "error": "Invalid filter specified",
            "message": message,
        }),
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self, "Export request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %self, "Export request rejected");
        }
        (status, Json(self.body())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glimmr_export::{QueueError, ReaderError};

    #[test]
    fn kinds_map_to_status_codes() {
        let cases: Vec<(ApiError, StatusCode)> = vec![
            (
                ValidationError::InvalidLimit { value: "x".into() }.into(),
                StatusCode::BAD_REQUEST,
            ),
            (
                ExportError::SizeLimitExceeded {
                    estimated_size_mb: 600.0,
                    max_size_mb: 500.0,
                }
                .into(),
                StatusCode::BAD_REQUEST,
            ),
            (
                ExportError::RequiresAsync {
                    estimated_records: 20_000,
                    estimated_size_mb: 20.0,
                }
                .into(),
                StatusCode::CONFLICT,
            ),
            (
                ExportError::from(ReaderError::Query("boom".into())).into(),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                ExportError::from(QueueError::Unavailable("full".into())).into(),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                ApiError::ExportNotFound("x".into()),
                StatusCode::NOT_FOUND,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.status_code(), status, "{err}");
        }
    }

    #[test]
    fn size_limit_body_reports_both_sizes() {
        let body = ApiError::from(ExportError::SizeLimitExceeded {
            estimated_size_mb: 612.3456,
            max_size_mb: 500.0,
        })
        .body();
        assert_eq!(body["error"], "Export size exceeds maximum allowed");
        assert_eq!(body["estimatedSizeMB"], 612.35);
        assert_eq!(body["maxSizeMB"], 500.0);
        assert!(body["message"].is_string());
    }

    #[test]
    fn data_source_failure_body() {
        let body =
            ApiError::from(ExportError::from(ReaderError::Query("relation missing".into())))
                .body();
        assert_eq!(body["error"], "Internal server error during export");
        assert_eq!(body["message"], "Query failed: relation missing");
    }
}
