//! JSON writers.

use serde::Serialize;

use super::{RecordWriter, WriteSummary};
use crate::error::{ExportError, Result};
use crate::reader::Row;
use crate::types::{Dataset, DatasetScope, Format};

#[derive(Serialize)]
struct TaggedRow<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    data: &'a Row,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StreamMetadata<'a> {
    record_count: u64,
    dataset: &'a str,
    format: &'static str,
    streaming_enabled: bool,
    truncated: bool,
    max_records: u64,
}

fn encode_error(e: serde_json::Error) -> ExportError {
    ExportError::encode("json", e.to_string())
}

/// `[{"type": "hospital", "data": {...}}, ...]`
#[derive(Debug, Default)]
pub struct JsonArrayWriter {
    wrote_any: bool,
}

impl JsonArrayWriter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordWriter for JsonArrayWriter {
    fn begin(&mut self, out: &mut Vec<u8>) -> Result<()> {
        out.push(b'[');
        Ok(())
    }

    fn write_rows(&mut self, dataset: Dataset, rows: &[Row], out: &mut Vec<u8>) -> Result<()> {
        for row in rows {
            if self.wrote_any {
                out.push(b',');
            }
            let tagged = TaggedRow {
                kind: dataset.singular(),
                data: row,
            };
            serde_json::to_writer(&mut *out, &tagged).map_err(encode_error)?;
            self.wrote_any = true;
        }
        Ok(())
    }

    fn finish(&mut self, _summary: &WriteSummary, out: &mut Vec<u8>) -> Result<()> {
        out.push(b']');
        Ok(())
    }
}

/// `{"data": [...rows], "metadata": {...}}`
///
/// Metadata depends on what was actually written, so it trails the rows.
#[derive(Debug)]
pub struct JsonEnvelopeWriter {
    scope: DatasetScope,
    max_records: u64,
    wrote_any: bool,
}

impl JsonEnvelopeWriter {
    pub fn new(scope: DatasetScope, max_records: u64) -> Self {
        Self {
            scope,
            max_records,
            wrote_any: false,
        }
    }
}

impl RecordWriter for JsonEnvelopeWriter {
    fn begin(&mut self, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(br#"{"data":["#);
        Ok(())
    }

    fn write_rows(&mut self, _dataset: Dataset, rows: &[Row], out: &mut Vec<u8>) -> Result<()> {
        for row in rows {
            if self.wrote_any {
                out.push(b',');
            }
            serde_json::to_writer(&mut *out, row).map_err(encode_error)?;
            self.wrote_any = true;
        }
        Ok(())
    }

    fn finish(&mut self, summary: &WriteSummary, out: &mut Vec<u8>) -> Result<()> {
        let metadata = StreamMetadata {
            record_count: summary.records(),
            dataset: self.scope.as_str(),
            format: Format::Json.as_str(),
            streaming_enabled: true,
            truncated: summary.truncated(),
            max_records: self.max_records,
        };
        out.extend_from_slice(br#"],"metadata":"#);
        serde_json::to_writer(&mut *out, &metadata).map_err(encode_error)?;
        out.push(b'}');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::DatasetTally;
    use serde_json::{Value, json};

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn array_is_well_formed_across_pages_and_datasets() {
        let mut writer = JsonArrayWriter::new();
        let mut out = Vec::new();
        writer.begin(&mut out).unwrap();
        writer
            .write_rows(
                Dataset::Hospitals,
                &[row(json!({"id": "h1"})), row(json!({"id": "h2"}))],
                &mut out,
            )
            .unwrap();
        writer
            .write_rows(Dataset::Prices, &[row(json!({"id": "p1"}))], &mut out)
            .unwrap();
        writer.finish(&WriteSummary::default(), &mut out).unwrap();

        let parsed: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(
            parsed,
            json!([
                {"type": "hospital", "data": {"id": "h1"}},
                {"type": "hospital", "data": {"id": "h2"}},
                {"type": "price", "data": {"id": "p1"}},
            ])
        );
    }

    #[test]
    fn empty_array() {
        let mut writer = JsonArrayWriter::new();
        let mut out = Vec::new();
        writer.begin(&mut out).unwrap();
        writer.finish(&WriteSummary::default(), &mut out).unwrap();
        assert_eq!(out, b"[]");
    }

    #[test]
    fn envelope_carries_metadata() {
        let mut writer = JsonEnvelopeWriter::new(DatasetScope::Analytics, 100_000);
        let mut out = Vec::new();
        writer.begin(&mut out).unwrap();
        writer
            .write_rows(Dataset::Analytics, &[row(json!({"metric": "avg"}))], &mut out)
            .unwrap();
        let summary = WriteSummary {
            datasets: vec![DatasetTally {
                dataset: Dataset::Analytics,
                budget: 1,
                records: 1,
                truncated: true,
            }],
        };
        writer.finish(&summary, &mut out).unwrap();

        let parsed: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(parsed["data"], json!([{"metric": "avg"}]));
        assert_eq!(
            parsed["metadata"],
            json!({
                "recordCount": 1,
                "dataset": "analytics",
                "format": "json",
                "streamingEnabled": true,
                "truncated": true,
                "maxRecords": 100000,
            })
        );
    }
}
