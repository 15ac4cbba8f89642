//! CSV output writer.

use super::{RecordWriter, WriteSummary, value_to_text};
use crate::error::{ExportError, Result};
use crate::reader::Row;
use crate::types::Dataset;

/// CSV writer with a single header for the whole response.
///
/// The header comes from the field names of the first row written, whatever
/// its dataset. Each row then contributes its values in its own field order.
/// Rows may differ in width from the header and from each other. Fields are
/// quoted only when they contain the delimiter, the quote character or a
/// line break.
#[derive(Debug, Clone)]
pub struct CsvWriter {
    /// Field delimiter (default: comma).
    pub delimiter: u8,

    /// Quote character (default: double quote).
    pub quote: u8,

    header_written: bool,
}

impl Default for CsvWriter {
    fn default() -> Self {
        Self {
            delimiter: b',',
            quote: b'"',
            header_written: false,
        }
    }
}

impl CsvWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn builder(&self) -> csv::WriterBuilder {
        let mut builder = csv::WriterBuilder::new();
        builder
            .delimiter(self.delimiter)
            .quote(self.quote)
            .quote_style(csv::QuoteStyle::Necessary)
            .flexible(true)
            .has_headers(false);
        builder
    }
}

fn encode_error(e: impl std::fmt::Display) -> ExportError {
    ExportError::encode("csv", e.to_string())
}

impl RecordWriter for CsvWriter {
    fn begin(&mut self, _out: &mut Vec<u8>) -> Result<()> {
        Ok(())
    }

    fn write_rows(&mut self, _dataset: Dataset, rows: &[Row], out: &mut Vec<u8>) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut writer = self.builder().from_writer(&mut *out);

        if !self.header_written {
            let header: Vec<&str> = rows[0].keys().map(String::as_str).collect();
            writer.write_record(&header).map_err(encode_error)?;
            self.header_written = true;
        }

        for row in rows {
            let values: Vec<String> = row.values().map(value_to_text).collect();
            writer.write_record(&values).map_err(encode_error)?;
        }

        writer.flush().map_err(encode_error)?;
        Ok(())
    }

    fn finish(&mut self, _summary: &WriteSummary, _out: &mut Vec<u8>) -> Result<()> {
        Ok(())
    }
}
