//! Export serialization.
//!
//! [`StreamingSerializer`] drives the page loop and owns all sink I/O; a
//! [`RecordWriter`] only turns rows into bytes:
//! - JSON array of `{"type", "data"}` entries
//! - JSON envelope (`{"data": [...], "metadata": {...}}`) for the streaming endpoint
//! - CSV with a single header
//! - xlsx workbook, buffered
//! - Parquet, buffered
//!
//! Streaming writers emit bytes for every page, so the serializer awaits the
//! sink between page fetches. Buffered writers emit everything from
//! [`RecordWriter::finish`].

mod csv;
mod json;
mod parquet_writer;
mod xlsx;

pub use csv::CsvWriter;
pub use json::{JsonArrayWriter, JsonEnvelopeWriter};
pub use parquet_writer::ParquetWriter;
pub use xlsx::XlsxWriter;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::Result;
use crate::reader::{DatasetReader, Row};
use crate::types::{Dataset, DatasetScope, ExportPlan, Format};

/// Turns rows into output bytes. Writers never touch the sink directly.
pub trait RecordWriter: Send {
    /// Bytes that open the document.
    fn begin(&mut self, out: &mut Vec<u8>) -> Result<()>;

    /// Encode one page of rows from `dataset`.
    fn write_rows(&mut self, dataset: Dataset, rows: &[Row], out: &mut Vec<u8>) -> Result<()>;

    /// Bytes that close the document.
    fn finish(&mut self, summary: &WriteSummary, out: &mut Vec<u8>) -> Result<()>;
}

/// Writer enum for dynamic dispatch over the output formats.
#[derive(Debug)]
pub enum ExportWriter {
    Json(JsonArrayWriter),
    Envelope(JsonEnvelopeWriter),
    Csv(CsvWriter),
    Excel(XlsxWriter),
    Parquet(ParquetWriter),
}

impl ExportWriter {
    /// Writer for a download in the given format.
    pub fn for_format(format: Format) -> Self {
        match format {
            Format::Json => Self::Json(JsonArrayWriter::new()),
            Format::Csv => Self::Csv(CsvWriter::new()),
            Format::Excel => Self::Excel(XlsxWriter::new()),
            Format::Parquet => Self::Parquet(ParquetWriter::new()),
        }
    }

    /// Writer for the streaming endpoint's JSON envelope.
    pub fn envelope(scope: DatasetScope, max_records: u64) -> Self {
        Self::Envelope(JsonEnvelopeWriter::new(scope, max_records))
    }

    fn inner(&mut self) -> &mut dyn RecordWriter {
        match self {
            Self::Json(w) => w,
            Self::Envelope(w) => w,
            Self::Csv(w) => w,
            Self::Excel(w) => w,
            Self::Parquet(w) => w,
        }
    }
}

impl RecordWriter for ExportWriter {
    fn begin(&mut self, out: &mut Vec<u8>) -> Result<()> {
        self.inner().begin(out)
    }

    fn write_rows(&mut self, dataset: Dataset, rows: &[Row], out: &mut Vec<u8>) -> Result<()> {
        self.inner().write_rows(dataset, rows, out)
    }

    fn finish(&mut self, summary: &WriteSummary, out: &mut Vec<u8>) -> Result<()> {
        self.inner().finish(summary, out)
    }
}

/// Rows written for one dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatasetTally {
    pub dataset: Dataset,
    pub budget: u64,
    pub records: u64,
    /// The dataset had at least `budget` matching rows, so more may exist.
    pub truncated: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub datasets: Vec<DatasetTally>,
}

impl WriteSummary {
    pub fn records(&self) -> u64 {
        self.datasets.iter().map(|t| t.records).sum()
    }

    pub fn truncated(&self) -> bool {
        self.datasets.iter().any(|t| t.truncated)
    }
}

/// Receives the running count of rows written.
pub trait ProgressReporter: Send {
    fn report(&mut self, processed: u64);
}

/// Reporter for callers that do not track progress.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&mut self, _processed: u64) {}
}

/// Paged reader-to-sink pipeline shared by synchronous responses and
/// background jobs.
#[derive(Clone)]
pub struct StreamingSerializer {
    reader: Arc<dyn DatasetReader>,
    page_size: u64,
}

impl StreamingSerializer {
    pub fn new(reader: Arc<dyn DatasetReader>, page_size: u64) -> Self {
        Self {
            reader,
            page_size: page_size.max(1),
        }
    }

    /// Rows the plan will produce given current counts.
    pub async fn count_planned(&self, plan: &ExportPlan) -> Result<u64> {
        let mut total = 0;
        for budget in &plan.budgets {
            let available = self
                .reader
                .count(budget.dataset, &plan.filters_for(budget.dataset))
                .await?;
            total += available.min(budget.limit);
        }
        Ok(total)
    }

    /// Write the planned rows to `sink`.
    ///
    /// Datasets are visited in plan order and paged until their budget is
    /// reached or the reader returns a short page. Every chunk is written and
    /// awaited before the next page is fetched; a failed write stops the
    /// export with the sink's error.
    pub async fn write<W, S>(
        &self,
        plan: &ExportPlan,
        writer: &mut W,
        sink: &mut S,
        reporter: &mut dyn ProgressReporter,
    ) -> Result<WriteSummary>
    where
        W: RecordWriter + ?Sized,
        S: AsyncWrite + Unpin + Send + ?Sized,
    {
        let mut out = Vec::with_capacity(64 * 1024);
        writer.begin(&mut out)?;
        drain(sink, &mut out).await?;

        let mut processed = 0u64;
        let mut summary = WriteSummary::default();

        for budget in &plan.budgets {
            let filters = plan.filters_for(budget.dataset);
            let mut fetched = 0u64;

            while fetched < budget.limit {
                let want = (budget.limit - fetched).min(self.page_size);
                let mut rows = self
                    .reader
                    .page(budget.dataset, &filters, want, fetched)
                    .await?;
                rows.truncate(want as usize);
                let got = rows.len() as u64;

                if got > 0 {
                    writer.write_rows(budget.dataset, &rows, &mut out)?;
                    drain(sink, &mut out).await?;
                    fetched += got;
                    processed += got;
                    reporter.report(processed);
                }
                if got < want {
                    break;
                }
            }

            summary.datasets.push(DatasetTally {
                dataset: budget.dataset,
                budget: budget.limit,
                records: fetched,
                truncated: budget.limit > 0 && fetched >= budget.limit,
            });
        }

        writer.finish(&summary, &mut out)?;
        drain(sink, &mut out).await?;
        sink.flush().await?;

        Ok(summary)
    }
}

async fn drain<S>(sink: &mut S, out: &mut Vec<u8>) -> Result<()>
where
    S: AsyncWrite + Unpin + Send + ?Sized,
{
    if !out.is_empty() {
        sink.write_all(out).await?;
        out.clear();
    }
    Ok(())
}

/// `<dataset>_export_<YYYY-MM-DDTHH-MM-SS>.<ext>`
pub fn attachment_filename(scope: DatasetScope, format: Format, at: DateTime<Utc>) -> String {
    format!(
        "{}_export_{}.{}",
        scope,
        at.format("%Y-%m-%dT%H-%M-%S"),
        format.extension()
    )
}

/// `glimmr-<dataset>-export-<YYYY-MM-DD>.json`, used by the streaming endpoint.
pub fn stream_filename(scope: DatasetScope, at: DateTime<Utc>) -> String {
    format!("glimmr-{}-export-{}.json", scope, at.format("%Y-%m-%d"))
}

/// Flatten a JSON value into cell text: null is empty, arrays join with `;`,
/// objects stay JSON.
pub(crate) fn value_to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(value_to_text)
            .collect::<Vec<_>>()
            .join(";"),
        Value::Object(_) => serde_json::to_string(value).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::MemoryDatasetReader;
    use crate::types::Filters;
    use chrono::TimeZone;
    use serde_json::json;

    fn rows(n: usize) -> Vec<Row> {
        (0..n)
            .map(|i| json!({"id": i}).as_object().cloned().unwrap())
            .collect()
    }

    #[derive(Default)]
    struct Recorder(Vec<u64>);

    impl ProgressReporter for Recorder {
        fn report(&mut self, processed: u64) {
            self.0.push(processed);
        }
    }

    #[test]
    fn filenames() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(
            attachment_filename(DatasetScope::Prices, Format::Excel, at),
            "prices_export_2024-03-09T14-05-07.xlsx"
        );
        assert_eq!(
            stream_filename(DatasetScope::All, at),
            "glimmr-all-export-2024-03-09.json"
        );
    }

    #[test]
    fn value_to_text_flattens() {
        assert_eq!(value_to_text(&json!(null)), "");
        assert_eq!(value_to_text(&json!(["a", 1, true])), "a;1;true");
        assert_eq!(value_to_text(&json!({"k": "v"})), r#"{"k":"v"}"#);
    }

    #[tokio::test]
    async fn pages_until_budget_and_reports_progress() {
        let reader = Arc::new(MemoryDatasetReader::new().with_rows(Dataset::Hospitals, rows(25)));
        let serializer = StreamingSerializer::new(reader.clone(), 10);
        let plan = ExportPlan::new(DatasetScope::Hospitals, Filters::new(), 25);

        let mut writer = ExportWriter::for_format(Format::Json);
        let mut sink = Vec::new();
        let mut recorder = Recorder::default();
        let summary = serializer
            .write(&plan, &mut writer, &mut sink, &mut recorder)
            .await
            .unwrap();

        assert_eq!(summary.records(), 25);
        assert!(summary.truncated());
        assert_eq!(recorder.0, vec![10, 20, 25]);
        assert_eq!(reader.pages_served(), 3);
    }

    #[tokio::test]
    async fn short_page_ends_dataset_without_truncation() {
        let reader = Arc::new(
            MemoryDatasetReader::new()
                .with_rows(Dataset::Hospitals, rows(4))
                .with_rows(Dataset::Prices, rows(50)),
        );
        let serializer = StreamingSerializer::new(reader, 1000);
        let plan = ExportPlan::new(DatasetScope::All, Filters::new(), 30);

        let mut writer = ExportWriter::for_format(Format::Csv);
        let mut sink = Vec::new();
        let summary = serializer
            .write(&plan, &mut writer, &mut sink, &mut NoProgress)
            .await
            .unwrap();

        let by_dataset: Vec<(Dataset, u64, bool)> = summary
            .datasets
            .iter()
            .map(|t| (t.dataset, t.records, t.truncated))
            .collect();
        assert_eq!(
            by_dataset,
            vec![
                (Dataset::Hospitals, 4, false),
                (Dataset::Prices, 30, true),
                (Dataset::Analytics, 0, false),
            ]
        );
        assert_eq!(serializer.count_planned(&plan).await.unwrap(), 34);
    }

    #[tokio::test]
    async fn closed_sink_stops_fetching() {
        let reader = Arc::new(MemoryDatasetReader::new().with_rows(Dataset::Prices, rows(100)));
        let serializer = StreamingSerializer::new(reader.clone(), 10);
        let plan = ExportPlan::new(DatasetScope::Prices, Filters::new(), 100);

        let (client, mut server) = tokio::io::duplex(16);
        drop(client);

        let mut writer = ExportWriter::for_format(Format::Json);
        let err = serializer
            .write(&plan, &mut writer, &mut server, &mut NoProgress)
            .await
            .unwrap_err();
        assert!(err.is_disconnect());
        assert_eq!(reader.pages_served(), 0);
    }
}
