//! Parquet output writer.
//!
//! Like xlsx, Parquet is written from a complete batch, so rows are buffered
//! until `finish`. Every column is nullable Utf8: the schema is the `type`
//! tag followed by the union of row field names in first-seen order.

use std::sync::Arc;

use arrow::array::{ArrayRef, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use serde_json::Value;

use super::{RecordWriter, WriteSummary, value_to_text};
use crate::error::{ExportError, Result};
use crate::reader::Row;
use crate::types::Dataset;

const TYPE_COLUMN: &str = "type";

#[derive(Debug)]
pub struct ParquetWriter {
    compression: Compression,
    columns: Vec<String>,
    rows: Vec<(Dataset, Row)>,
}

impl Default for ParquetWriter {
    fn default() -> Self {
        Self {
            compression: Compression::SNAPPY,
            columns: Vec::new(),
            rows: Vec::new(),
        }
    }
}

impl ParquetWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn build_schema(&self) -> Schema {
        let mut fields = vec![Field::new(TYPE_COLUMN, DataType::Utf8, false)];
        fields.extend(
            self.columns
                .iter()
                .map(|name| Field::new(name, DataType::Utf8, true)),
        );
        Schema::new(fields)
    }

    fn build_arrays(&self) -> Vec<ArrayRef> {
        let mut arrays: Vec<ArrayRef> = Vec::with_capacity(self.columns.len() + 1);

        let tags: StringArray = self
            .rows
            .iter()
            .map(|(dataset, _)| Some(dataset.singular()))
            .collect();
        arrays.push(Arc::new(tags));

        for name in &self.columns {
            let values: StringArray = self
                .rows
                .iter()
                .map(|(_, row)| match row.get(name) {
                    None | Some(Value::Null) => None,
                    Some(value) => Some(value_to_text(value)),
                })
                .collect();
            arrays.push(Arc::new(values));
        }

        arrays
    }

    fn write_to_buffer(&self) -> Result<Vec<u8>> {
        let schema = Arc::new(self.build_schema());
        let batch = RecordBatch::try_new(schema.clone(), self.build_arrays())
            .map_err(|e| encode_error(format!("Failed to create record batch: {e}")))?;

        let mut buffer = Vec::new();
        {
            let props = WriterProperties::builder()
                .set_compression(self.compression)
                .build();

            let mut writer = ArrowWriter::try_new(&mut buffer, schema, Some(props))
                .map_err(|e| encode_error(format!("Failed to create Parquet writer: {e}")))?;
            writer
                .write(&batch)
                .map_err(|e| encode_error(format!("Failed to write record batch: {e}")))?;
            writer
                .close()
                .map_err(|e| encode_error(format!("Failed to close Parquet writer: {e}")))?;
        }

        Ok(buffer)
    }
}

fn encode_error(message: String) -> ExportError {
    ExportError::encode("parquet", message)
}

impl RecordWriter for ParquetWriter {
    fn begin(&mut self, _out: &mut Vec<u8>) -> Result<()> {
        Ok(())
    }

    fn write_rows(&mut self, dataset: Dataset, rows: &[Row], _out: &mut Vec<u8>) -> Result<()> {
        for row in rows {
            for key in row.keys() {
                if key != TYPE_COLUMN && !self.columns.iter().any(|c| c == key) {
                    self.columns.push(key.clone());
                }
            }
            self.rows.push((dataset, row.clone()));
        }
        Ok(())
    }

    fn finish(&mut self, _summary: &WriteSummary, out: &mut Vec<u8>) -> Result<()> {
        tracing::warn!(
            rows = self.rows.len(),
            columns = self.columns.len() + 1,
            "Building Parquet export in memory"
        );
        let bytes = self.write_to_buffer()?;
        self.rows.clear();
        out.extend_from_slice(&bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use parquet::file::reader::{FileReader, SerializedFileReader};
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn writes_tagged_union_schema() {
        let mut writer = ParquetWriter::new();
        let mut out = Vec::new();
        writer
            .write_rows(
                Dataset::Hospitals,
                &[row(json!({"id": "h1", "state": "CA"}))],
                &mut out,
            )
            .unwrap();
        writer
            .write_rows(
                Dataset::Prices,
                &[row(json!({"id": "p1", "amount": 9.5, "note": null}))],
                &mut out,
            )
            .unwrap();
        assert!(out.is_empty());

        writer.finish(&WriteSummary::default(), &mut out).unwrap();
        assert_eq!(&out[..4], b"PAR1");
        assert_eq!(&out[out.len() - 4..], b"PAR1");

        let reader = SerializedFileReader::new(Bytes::from(out)).unwrap();
        let metadata = reader.metadata();
        assert_eq!(metadata.file_metadata().num_rows(), 2);
        let names: Vec<&str> = metadata
            .file_metadata()
            .schema_descr()
            .columns()
            .iter()
            .map(|c| c.name())
            .collect();
        assert_eq!(names, vec!["type", "id", "state", "amount", "note"]);
    }

    #[test]
    fn empty_export_is_a_valid_file() {
        let mut writer = ParquetWriter::new();
        let mut out = Vec::new();
        writer.finish(&WriteSummary::default(), &mut out).unwrap();
        assert_eq!(&out[..4], b"PAR1");
    }
}
