//! Synchronous vs asynchronous routing.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::config::ExportSettings;
use crate::estimator::SizeEstimate;
use crate::types::ExportEstimate;

/// Execution path chosen for an export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportRoute {
    /// Served inside the original request/response cycle.
    Synchronous,
    /// Handed to the job queue; the client polls for completion.
    Asynchronous,
}

impl fmt::Display for ExportRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Synchronous => f.write_str("synchronous"),
            Self::Asynchronous => f.write_str("asynchronous"),
        }
    }
}

/// Estimate plus the routing decision derived from it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoutingDecision {
    pub estimate: ExportEstimate,
    pub route: ExportRoute,
    pub estimated_minutes: u64,
}

/// Applies the size/record thresholds. Never rejects a request.
#[derive(Clone)]
pub struct ExportRouter {
    settings: Arc<ExportSettings>,
}

impl ExportRouter {
    pub fn new(settings: Arc<ExportSettings>) -> Self {
        Self { settings }
    }

    pub fn requires_async(&self, records: u64, size_mb: f64) -> bool {
        size_mb > self.settings.async_size_threshold_mb
            || records > self.settings.async_record_threshold
    }

    /// Processing time hint in whole minutes, never below one.
    pub fn estimated_minutes(&self, records: u64) -> u64 {
        records.div_ceil(self.settings.records_per_minute).max(1)
    }

    pub fn decide(&self, size: &SizeEstimate) -> RoutingDecision {
        let requires_async = self.requires_async(size.records, size.size_mb);
        let route = if requires_async {
            ExportRoute::Asynchronous
        } else {
            ExportRoute::Synchronous
        };

        tracing::debug!(
            records = size.records,
            size_mb = size.size_mb,
            route = %route,
            "Export routed"
        );

        RoutingDecision {
            estimate: ExportEstimate {
                estimated_records: size.records,
                estimated_size_mb: size.size_mb,
                applied_record_limit: size.applied_limit,
                requires_async_processing: requires_async,
            },
            route,
            estimated_minutes: self.estimated_minutes(size.records),
        }
    }
}
