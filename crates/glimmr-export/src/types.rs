//! Request-level types: formats, datasets, validated requests and plans.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Query-string filters applied to dataset reads (`key -> value`, equality).
pub type Filters = BTreeMap<String, String>;

/// Output format of an export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Json,
    Csv,
    Excel,
    Parquet,
}

impl Format {
    pub const ALL: [Format; 4] = [Format::Json, Format::Csv, Format::Excel, Format::Parquet];

    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "csv" => Ok(Self::Csv),
            "excel" | "xlsx" => Ok(Self::Excel),
            "parquet" => Ok(Self::Parquet),
            _ => Err(ValidationError::UnknownFormat {
                value: s.to_string(),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Csv => "csv",
            Self::Excel => "excel",
            Self::Parquet => "parquet",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Csv => "csv",
            Self::Excel => "xlsx",
            Self::Parquet => "parquet",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Json => "application/json; charset=utf-8",
            Self::Csv => "text/csv; charset=utf-8",
            Self::Excel => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
            Self::Parquet => "application/vnd.apache.parquet",
        }
    }

    /// Whether the format can be written row by row without buffering the
    /// whole result set.
    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Json | Self::Csv)
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Format {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// A concrete record collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dataset {
    Hospitals,
    Prices,
    Analytics,
}

impl Dataset {
    /// Fixed emission order for multi-dataset exports.
    pub const ALL: [Dataset; 3] = [Dataset::Hospitals, Dataset::Prices, Dataset::Analytics];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hospitals => "hospitals",
            Self::Prices => "prices",
            Self::Analytics => "analytics",
        }
    }

    /// Record type tag used in the JSON export envelope.
    pub fn singular(&self) -> &'static str {
        match self {
            Self::Hospitals => "hospital",
            Self::Prices => "price",
            Self::Analytics => "analytics",
        }
    }

    /// Filter keys this dataset understands, paired with their column names.
    pub fn filter_columns(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            Self::Hospitals => &[("state", "state"), ("city", "city")],
            Self::Prices => &[("hospitalId", "hospital_id"), ("category", "category")],
            Self::Analytics => &[("hospitalId", "hospital_id"), ("metric", "metric")],
        }
    }

    pub fn supports_filter(&self, key: &str) -> bool {
        self.filter_columns().iter().any(|(k, _)| *k == key)
    }

    pub fn filter_column(&self, key: &str) -> Option<&'static str> {
        self.filter_columns()
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, column)| *column)
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `dataset` request parameter: one dataset or all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetScope {
    Hospitals,
    Prices,
    Analytics,
    All,
}

impl DatasetScope {
    pub const SUPPORTED: [&'static str; 4] = ["hospitals", "prices", "analytics", "all"];

    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hospitals" => Ok(Self::Hospitals),
            "prices" => Ok(Self::Prices),
            "analytics" => Ok(Self::Analytics),
            "all" => Ok(Self::All),
            _ => Err(ValidationError::UnknownDataset {
                value: s.to_string(),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hospitals => "hospitals",
            Self::Prices => "prices",
            Self::Analytics => "analytics",
            Self::All => "all",
        }
    }

    /// Datasets covered by this scope, in emission order.
    pub fn datasets(&self) -> &'static [Dataset] {
        match self {
            Self::Hospitals => &[Dataset::Hospitals],
            Self::Prices => &[Dataset::Prices],
            Self::Analytics => &[Dataset::Analytics],
            Self::All => &Dataset::ALL,
        }
    }
}

impl fmt::Display for DatasetScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatasetScope {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// A validated export request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportRequest {
    pub format: Format,
    pub dataset: DatasetScope,
    pub limit: u64,
    #[serde(default)]
    pub filters: Filters,
}

impl ExportRequest {
    pub const DEFAULT_FORMAT: Format = Format::Json;
    pub const DEFAULT_SCOPE: DatasetScope = DatasetScope::Hospitals;

    /// Validate raw query parameters.
    ///
    /// `format`, `dataset` and `limit` are reserved; every other parameter is
    /// treated as a filter and must be understood by at least one dataset in
    /// scope. Checks run in that order so the first problem is reported.
    pub fn from_params<I, K, V>(params: I, default_limit: u64) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut format = None;
        let mut dataset = None;
        let mut limit = None;
        let mut filters = Filters::new();

        for (key, value) in params {
            let key = key.into();
            let value = value.into();
            match key.as_str() {
                "format" => format = Some(value),
                "dataset" => dataset = Some(value),
                "limit" => limit = Some(value),
                _ => {
                    filters.insert(key, value);
                }
            }
        }

        let format = match format.as_deref().filter(|s| !s.is_empty()) {
            Some(s) => Format::parse(s)?,
            None => Self::DEFAULT_FORMAT,
        };
        let dataset = match dataset.as_deref().filter(|s| !s.is_empty()) {
            Some(s) => DatasetScope::parse(s)?,
            None => Self::DEFAULT_SCOPE,
        };
        let limit = match limit.as_deref().filter(|s| !s.is_empty()) {
            Some(s) => parse_limit(s)?,
            None => default_limit,
        };

        for key in filters.keys() {
            if !dataset.datasets().iter().any(|d| d.supports_filter(key)) {
                return Err(ValidationError::UnsupportedFilter {
                    key: key.clone(),
                    dataset: dataset.to_string(),
                });
            }
        }

        Ok(Self {
            format,
            dataset,
            limit,
            filters,
        })
    }

    /// Like [`ExportRequest::from_params`], but only JSON is accepted.
    pub fn streaming_from_params<I, K, V>(
        params: I,
        default_limit: u64,
    ) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let params: Vec<(String, String)> = params
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        if let Some((_, value)) = params.iter().find(|(k, _)| k == "format")
            && !value.is_empty()
            && !value.eq_ignore_ascii_case("json")
        {
            return Err(ValidationError::StreamingFormat {
                value: value.clone(),
            });
        }

        Self::from_params(params, default_limit)
    }
}

fn parse_limit(raw: &str) -> Result<u64, ValidationError> {
    match raw.trim().parse::<u64>() {
        Ok(0) | Err(_) => Err(ValidationError::InvalidLimit {
            value: raw.to_string(),
        }),
        Ok(n) => Ok(n),
    }
}

/// Record budget for one dataset in an export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatasetBudget {
    pub dataset: Dataset,
    pub limit: u64,
}

/// Per-dataset record budgets for the serializer.
///
/// Every dataset in the scope may contribute up to `limit` rows, so an `all`
/// export can produce up to three times the limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportPlan {
    pub scope: DatasetScope,
    pub filters: Filters,
    pub budgets: Vec<DatasetBudget>,
}

impl ExportPlan {
    pub fn new(scope: DatasetScope, filters: Filters, limit: u64) -> Self {
        Self {
            scope,
            filters,
            budgets: scope
                .datasets()
                .iter()
                .map(|&dataset| DatasetBudget { dataset, limit })
                .collect(),
        }
    }

    /// Per-dataset share used when estimating: `floor(limit / n)` for a
    /// multi-dataset scope, the whole limit otherwise.
    pub fn estimate_share(&self) -> u64 {
        let limit = self.budgets.first().map_or(0, |b| b.limit);
        match self.budgets.len() {
            0 | 1 => limit,
            n => limit / n as u64,
        }
    }

    pub fn total_budget(&self) -> u64 {
        self.budgets.iter().map(|b| b.limit).sum()
    }

    /// The subset of the request filters a dataset understands.
    pub fn filters_for(&self, dataset: Dataset) -> Filters {
        self.filters
            .iter()
            .filter(|(k, _)| dataset.supports_filter(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Size/record estimate and routing decision for one request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportEstimate {
    pub estimated_records: u64,
    #[serde(rename = "estimatedSizeMB")]
    pub estimated_size_mb: f64,
    pub applied_record_limit: u64,
    pub requires_async_processing: bool,
}
