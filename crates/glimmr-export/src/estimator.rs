//! Record and size estimation for export requests.

use std::sync::Arc;

use crate::config::ExportSettings;
use crate::error::{ExportError, Result};
use crate::reader::DatasetReader;
use crate::types::{Dataset, ExportPlan, ExportRequest};

/// Records a single dataset contributes to an estimate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DatasetContribution {
    pub dataset: Dataset,
    pub available: u64,
    pub records: u64,
    pub size_mb: f64,
}

/// Raw estimate before routing.
#[derive(Debug, Clone, PartialEq)]
pub struct SizeEstimate {
    pub records: u64,
    pub size_mb: f64,
    pub applied_limit: u64,
    pub contributions: Vec<DatasetContribution>,
}

#[derive(Clone)]
pub struct SizeEstimator {
    reader: Arc<dyn DatasetReader>,
    settings: Arc<ExportSettings>,
}

impl SizeEstimator {
    pub fn new(reader: Arc<dyn DatasetReader>, settings: Arc<ExportSettings>) -> Self {
        Self { reader, settings }
    }

    /// The record limit actually applied to a request after the format cap.
    pub fn applied_limit(&self, request: &ExportRequest) -> u64 {
        request.limit.min(self.settings.record_cap(request.format))
    }

    /// Plan for a request with its limit already capped.
    pub fn plan(&self, request: &ExportRequest) -> ExportPlan {
        ExportPlan::new(
            request.dataset,
            request.filters.clone(),
            self.applied_limit(request),
        )
    }

    /// Estimate records and output size for a request.
    ///
    /// Fails with [`ExportError::SizeLimitExceeded`] when the scaled size is
    /// above the configured maximum; nothing is attempted in that case.
    pub async fn estimate(&self, request: &ExportRequest) -> Result<SizeEstimate> {
        let plan = self.plan(request);
        let applied_limit = self.applied_limit(request);
        let multiplier = self.settings.format_multipliers.for_format(request.format);

        let share = plan.estimate_share();

        let mut contributions = Vec::with_capacity(plan.budgets.len());
        for budget in &plan.budgets {
            let filters = plan.filters_for(budget.dataset);
            let available = self.reader.count(budget.dataset, &filters).await?;
            let records = available.min(share);
            let size_mb =
                records as f64 * self.settings.record_size_kb.for_dataset(budget.dataset) / 1024.0;
            contributions.push(DatasetContribution {
                dataset: budget.dataset,
                available,
                records,
                size_mb,
            });
        }

        let records = contributions.iter().map(|c| c.records).sum();
        let size_mb = contributions.iter().map(|c| c.size_mb).sum::<f64>() * multiplier;

        tracing::debug!(
            dataset = %request.dataset,
            format = %request.format,
            records,
            size_mb,
            applied_limit,
            "Export estimated"
        );

        if size_mb > self.settings.max_size_mb {
            tracing::info!(
                dataset = %request.dataset,
                format = %request.format,
                size_mb,
                max_size_mb = self.settings.max_size_mb,
                "Export rejected: estimated size over limit"
            );
            return Err(ExportError::SizeLimitExceeded {
                estimated_size_mb: size_mb,
                max_size_mb: self.settings.max_size_mb,
            });
        }

        Ok(SizeEstimate {
            records,
            size_mb,
            applied_limit,
            contributions,
        })
    }
}
