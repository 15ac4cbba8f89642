//! Spreadsheet (xlsx) output writer.
//!
//! The xlsx container needs the complete table before it can be serialized,
//! so rows are held in memory and the workbook is produced in one piece from
//! `finish`. Callers cap the record count for this format accordingly.

use rust_xlsxwriter::{Format as CellFormat, Workbook, Worksheet, XlsxError};
use serde_json::Value;

use super::{RecordWriter, WriteSummary, value_to_text};
use crate::error::{ExportError, Result};
use crate::reader::Row;
use crate::types::Dataset;

#[derive(Debug)]
struct SheetBuffer {
    dataset: Dataset,
    columns: Vec<String>,
    rows: Vec<Row>,
}

impl SheetBuffer {
    fn new(dataset: Dataset) -> Self {
        Self {
            dataset,
            columns: Vec::new(),
            rows: Vec::new(),
        }
    }

    fn push(&mut self, row: &Row) {
        for key in row.keys() {
            if !self.columns.iter().any(|c| c == key) {
                self.columns.push(key.clone());
            }
        }
        self.rows.push(row.clone());
    }
}

/// Buffered xlsx writer: one worksheet per dataset, named after it.
#[derive(Debug, Default)]
pub struct XlsxWriter {
    sheets: Vec<SheetBuffer>,
}

impl XlsxWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows currently held in memory.
    pub fn buffered_rows(&self) -> usize {
        self.sheets.iter().map(|s| s.rows.len()).sum()
    }

    fn sheet_for(&mut self, dataset: Dataset) -> &mut SheetBuffer {
        let idx = match self.sheets.iter().position(|s| s.dataset == dataset) {
            Some(idx) => idx,
            None => {
                self.sheets.push(SheetBuffer::new(dataset));
                self.sheets.len() - 1
            }
        };
        &mut self.sheets[idx]
    }

    fn build(&self) -> std::result::Result<Vec<u8>, XlsxError> {
        let mut workbook = Workbook::new();
        let header_format = CellFormat::new().set_bold();

        for sheet in &self.sheets {
            let mut worksheet = Worksheet::new();
            worksheet.set_name(sheet.dataset.as_str())?;

            for (col, name) in sheet.columns.iter().enumerate() {
                worksheet.write_string_with_format(0, col_num(col)?, name, &header_format)?;
            }

            for (idx, row) in sheet.rows.iter().enumerate() {
                let row_num = row_num(idx + 1)?;
                for (col, name) in sheet.columns.iter().enumerate() {
                    let Some(value) = row.get(name) else {
                        continue;
                    };
                    let col = col_num(col)?;
                    match value {
                        Value::Null => {}
                        Value::Bool(b) => {
                            worksheet.write_boolean(row_num, col, *b)?;
                        }
                        Value::Number(n) => match n.as_f64() {
                            Some(f) => {
                                worksheet.write_number(row_num, col, f)?;
                            }
                            None => {
                                worksheet.write_string(row_num, col, n.to_string())?;
                            }
                        },
                        Value::String(s) => {
                            worksheet.write_string(row_num, col, s)?;
                        }
                        other => {
                            worksheet.write_string(row_num, col, value_to_text(other))?;
                        }
                    }
                }
            }

            workbook.push_worksheet(worksheet);
        }

        if self.sheets.is_empty() {
            workbook.add_worksheet();
        }

        workbook.save_to_buffer()
    }
}

fn row_num(idx: usize) -> std::result::Result<u32, XlsxError> {
    u32::try_from(idx).map_err(|_| XlsxError::RowColumnLimitError)
}

fn col_num(idx: usize) -> std::result::Result<u16, XlsxError> {
    u16::try_from(idx).map_err(|_| XlsxError::RowColumnLimitError)
}

impl RecordWriter for XlsxWriter {
    fn begin(&mut self, _out: &mut Vec<u8>) -> Result<()> {
        Ok(())
    }

    fn write_rows(&mut self, dataset: Dataset, rows: &[Row], _out: &mut Vec<u8>) -> Result<()> {
        let sheet = self.sheet_for(dataset);
        for row in rows {
            sheet.push(row);
        }
        Ok(())
    }

    fn finish(&mut self, _summary: &WriteSummary, out: &mut Vec<u8>) -> Result<()> {
        tracing::warn!(
            rows = self.buffered_rows(),
            sheets = self.sheets.len(),
            "Building xlsx export in memory"
        );
        let bytes = self
            .build()
            .map_err(|e| ExportError::encode("excel", e.to_string()))?;
        self.sheets.clear();
        out.extend_from_slice(&bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn emits_nothing_until_finish() {
        let mut writer = XlsxWriter::new();
        let mut out = Vec::new();
        writer.begin(&mut out).unwrap();
        writer
            .write_rows(
                Dataset::Hospitals,
                &[row(json!({"id": "h1", "beds": 120, "active": true}))],
                &mut out,
            )
            .unwrap();
        writer
            .write_rows(Dataset::Prices, &[row(json!({"id": "p1", "tags": ["x"]}))], &mut out)
            .unwrap();
        assert!(out.is_empty());
        assert_eq!(writer.buffered_rows(), 2);

        writer.finish(&WriteSummary::default(), &mut out).unwrap();
        // xlsx is a zip container.
        assert_eq!(&out[..2], b"PK");
        assert_eq!(writer.buffered_rows(), 0);
    }

    #[test]
    fn union_of_columns_per_sheet() {
        let mut writer = XlsxWriter::new();
        let mut out = Vec::new();
        writer
            .write_rows(
                Dataset::Analytics,
                &[row(json!({"metric": "avg"})), row(json!({"metric": "p50", "value": 3}))],
                &mut out,
            )
            .unwrap();
        assert_eq!(writer.sheets[0].columns, vec!["metric", "value"]);
    }

    #[test]
    fn empty_workbook_is_still_valid() {
        let mut writer = XlsxWriter::new();
        let mut out = Vec::new();
        writer.finish(&WriteSummary::default(), &mut out).unwrap();
        assert_eq!(&out[..2], b"PK");
    }
}
