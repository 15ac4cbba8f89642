use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{Dataset, Format};

/// Tunables for estimation, routing, streaming and housekeeping.
///
/// The per-record sizes and the throughput figure are rough heuristics, not
/// measurements; deployments are expected to calibrate them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportSettings {
    #[serde(default = "default_limit")]
    pub default_limit: u64,
    /// Record cap for streaming formats (JSON, CSV).
    #[serde(default = "default_max_records")]
    pub max_records: u64,
    /// Record cap for formats that must be assembled in memory (xlsx, Parquet).
    #[serde(default = "default_buffered_max_records")]
    pub buffered_max_records: u64,
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: f64,
    #[serde(default = "default_async_size_threshold_mb")]
    pub async_size_threshold_mb: f64,
    #[serde(default = "default_async_record_threshold")]
    pub async_record_threshold: u64,
    #[serde(default = "default_records_per_minute")]
    pub records_per_minute: u64,
    #[serde(default)]
    pub record_size_kb: RecordSizes,
    #[serde(default)]
    pub format_multipliers: FormatMultipliers,
    /// Rows requested from the dataset reader per page.
    #[serde(default = "default_page_size")]
    pub page_size: u64,
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Directory receiving files written by background export workers.
    #[serde(default = "default_export_dir")]
    pub export_dir: PathBuf,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Path prefix used when building status and download links.
    #[serde(default = "default_public_base_path")]
    pub public_base_path: String,
}

fn default_limit() -> u64 {
    1000
}
fn default_max_records() -> u64 {
    100_000
}
fn default_buffered_max_records() -> u64 {
    25_000
}
fn default_max_size_mb() -> f64 {
    500.0
}
fn default_async_size_threshold_mb() -> f64 {
    10.0
}
fn default_async_record_threshold() -> u64 {
    10_000
}
fn default_records_per_minute() -> u64 {
    10_000
}
fn default_page_size() -> u64 {
    1000
}
/// Ten years.
pub const MAX_RETENTION_HOURS: u64 = 24 * 365 * 10;

fn default_retention_hours() -> u64 {
    24
}
fn default_sweep_interval_secs() -> u64 {
    3600
}
fn default_export_dir() -> PathBuf {
    PathBuf::from("exports")
}
fn default_worker_count() -> usize {
    2
}
fn default_queue_capacity() -> usize {
    100
}
fn default_public_base_path() -> String {
    "/analytics/export".into()
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            max_records: default_max_records(),
            buffered_max_records: default_buffered_max_records(),
            max_size_mb: default_max_size_mb(),
            async_size_threshold_mb: default_async_size_threshold_mb(),
            async_record_threshold: default_async_record_threshold(),
            records_per_minute: default_records_per_minute(),
            record_size_kb: RecordSizes::default(),
            format_multipliers: FormatMultipliers::default(),
            page_size: default_page_size(),
            retention_hours: default_retention_hours(),
            sweep_interval_secs: default_sweep_interval_secs(),
            export_dir: default_export_dir(),
            worker_count: default_worker_count(),
            queue_capacity: default_queue_capacity(),
            public_base_path: default_public_base_path(),
        }
    }
}

impl ExportSettings {
    /// Hard record cap for a format.
    pub fn record_cap(&self, format: Format) -> u64 {
        if format.is_streaming() {
            self.max_records
        } else {
            self.buffered_max_records
        }
    }

    pub fn retention(&self) -> chrono::TimeDelta {
        let hours = self.retention_hours.min(MAX_RETENTION_HOURS) as i64;
        chrono::TimeDelta::try_hours(hours).unwrap_or_default()
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.default_limit == 0 {
            return Err("export.default_limit must be > 0".into());
        }
        if self.max_records == 0 || self.buffered_max_records == 0 {
            return Err("export record caps must be > 0".into());
        }
        if self.buffered_max_records > self.max_records {
            return Err("export.buffered_max_records must be <= export.max_records".into());
        }
        if self.max_size_mb <= 0.0 {
            return Err("export.max_size_mb must be > 0".into());
        }
        if self.records_per_minute == 0 {
            return Err("export.records_per_minute must be > 0".into());
        }
        if self.page_size == 0 {
            return Err("export.page_size must be > 0".into());
        }
        if self.worker_count == 0 {
            return Err("export.worker_count must be > 0".into());
        }
        if self.queue_capacity == 0 {
            return Err("export.queue_capacity must be > 0".into());
        }
        if self.sweep_interval_secs == 0 {
            return Err("export.sweep_interval_secs must be > 0".into());
        }
        if self.retention_hours == 0 || self.retention_hours > MAX_RETENTION_HOURS {
            return Err(format!(
                "export.retention_hours must be between 1 and {MAX_RETENTION_HOURS}"
            ));
        }
        Ok(())
    }
}

/// Approximate serialized size of one record, in kilobytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordSizes {
    #[serde(default = "default_hospital_kb")]
    pub hospitals: f64,
    #[serde(default = "default_price_kb")]
    pub prices: f64,
    #[serde(default = "default_analytics_kb")]
    pub analytics: f64,
}

fn default_hospital_kb() -> f64 {
    2.0
}
fn default_price_kb() -> f64 {
    1.0
}
fn default_analytics_kb() -> f64 {
    0.5
}

impl Default for RecordSizes {
    fn default() -> Self {
        Self {
            hospitals: default_hospital_kb(),
            prices: default_price_kb(),
            analytics: default_analytics_kb(),
        }
    }
}

impl RecordSizes {
    pub fn for_dataset(&self, dataset: Dataset) -> f64 {
        match dataset {
            Dataset::Hospitals => self.hospitals,
            Dataset::Prices => self.prices,
            Dataset::Analytics => self.analytics,
        }
    }
}

/// Output size relative to JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatMultipliers {
    #[serde(default = "default_json_multiplier")]
    pub json: f64,
    #[serde(default = "default_csv_multiplier")]
    pub csv: f64,
    #[serde(default = "default_excel_multiplier")]
    pub excel: f64,
    #[serde(default = "default_parquet_multiplier")]
    pub parquet: f64,
}

fn default_json_multiplier() -> f64 {
    1.0
}
fn default_csv_multiplier() -> f64 {
    0.6
}
fn default_excel_multiplier() -> f64 {
    1.2
}
fn default_parquet_multiplier() -> f64 {
    0.3
}

impl Default for FormatMultipliers {
    fn default() -> Self {
        Self {
            json: default_json_multiplier(),
            csv: default_csv_multiplier(),
            excel: default_excel_multiplier(),
            parquet: default_parquet_multiplier(),
        }
    }
}

impl FormatMultipliers {
    pub fn for_format(&self, format: Format) -> f64 {
        match format {
            Format::Json => self.json,
            Format::Csv => self.csv,
            Format::Excel => self.excel,
            Format::Parquet => self.parquet,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = ExportSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.record_cap(Format::Json), 100_000);
        assert_eq!(settings.record_cap(Format::Excel), 25_000);
        assert_eq!(settings.retention(), chrono::Duration::hours(24));
    }

    #[test]
    fn buffered_cap_cannot_exceed_streaming_cap() {
        let settings = ExportSettings {
            buffered_max_records: 200_000,
            ..Default::default()
        };
        let err = settings.validate().unwrap_err();
        assert!(err.contains("buffered_max_records"));
    }

    #[test]
    fn retention_is_bounded() {
        let settings = ExportSettings {
            retention_hours: u64::MAX / 2,
            ..Default::default()
        };
        let err = settings.validate().unwrap_err();
        assert!(err.contains("retention_hours"), "{err}");
        assert_eq!(
            settings.retention(),
            chrono::TimeDelta::hours(MAX_RETENTION_HOURS as i64)
        );

        let settings = ExportSettings {
            retention_hours: 0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn partial_deserialization_keeps_defaults() {
        let settings: ExportSettings =
            serde_json::from_str(r#"{"max_size_mb": 50.0, "format_multipliers": {"csv": 0.5}}"#)
                .unwrap();
        assert_eq!(settings.max_size_mb, 50.0);
        assert_eq!(settings.format_multipliers.csv, 0.5);
        assert_eq!(settings.format_multipliers.excel, 1.2);
        assert_eq!(settings.page_size, 1000);
    }
}
