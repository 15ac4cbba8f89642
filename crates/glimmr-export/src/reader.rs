//! Dataset reader contract.
//!
//! The export pipeline reads records through [`DatasetReader`] only. Readers
//! return active records, ordered by their own notion of recency, and the
//! pipeline never re-sorts them.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::types::{Dataset, Filters};

/// One record, as a JSON object with stable field order.
pub type Row = Map<String, Value>;

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("Data source unavailable: {0}")]
    Unavailable(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Unexpected row shape in {dataset}: {message}")]
    Decode { dataset: Dataset, message: String },
}

#[async_trait]
pub trait DatasetReader: Send + Sync {
    /// Number of active records matching `filters`.
    async fn count(&self, dataset: Dataset, filters: &Filters) -> Result<u64, ReaderError>;

    /// Up to `limit` active records starting at `offset`.
    async fn page(
        &self,
        dataset: Dataset,
        filters: &Filters,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<Row>, ReaderError>;
}

/// In-memory reader used by tests and local demos.
///
/// Rows are served in insertion order. A row whose `isActive` field is
/// `false` is treated as inactive and never returned.
#[derive(Debug, Default)]
pub struct MemoryDatasetReader {
    rows: RwLock<HashMap<Dataset, Vec<Row>>>,
    outage: RwLock<Option<String>>,
    pages_served: AtomicUsize,
}

impl MemoryDatasetReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(self, dataset: Dataset, rows: impl IntoIterator<Item = Row>) -> Self {
        self.extend(dataset, rows);
        self
    }

    pub fn extend(&self, dataset: Dataset, rows: impl IntoIterator<Item = Row>) {
        if let Ok(mut guard) = self.rows.write() {
            guard.entry(dataset).or_default().extend(rows);
        }
    }

    /// Make every subsequent call fail with [`ReaderError::Unavailable`].
    pub fn set_outage(&self, message: Option<&str>) {
        if let Ok(mut guard) = self.outage.write() {
            *guard = message.map(str::to_string);
        }
    }

    /// Number of successful `page` calls so far.
    pub fn pages_served(&self) -> usize {
        self.pages_served.load(Ordering::SeqCst)
    }

    fn check_outage(&self) -> Result<(), ReaderError> {
        match self.outage.read().ok().and_then(|g| g.clone()) {
            Some(message) => Err(ReaderError::Unavailable(message)),
            None => Ok(()),
        }
    }

    fn matching(&self, dataset: Dataset, filters: &Filters) -> Vec<Row> {
        let Ok(guard) = self.rows.read() else {
            return Vec::new();
        };
        guard
            .get(&dataset)
            .map(|rows| {
                rows.iter()
                    .filter(|row| is_active(row) && matches_filters(row, filters))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn is_active(row: &Row) -> bool {
    !matches!(row.get("isActive"), Some(Value::Bool(false)))
}

fn matches_filters(row: &Row, filters: &Filters) -> bool {
    filters.iter().all(|(key, expected)| match row.get(key) {
        Some(Value::String(s)) => s == expected,
        Some(other) => other.to_string() == *expected,
        None => false,
    })
}

#[async_trait]
impl DatasetReader for MemoryDatasetReader {
    async fn count(&self, dataset: Dataset, filters: &Filters) -> Result<u64, ReaderError> {
        self.check_outage()?;
        Ok(self.matching(dataset, filters).len() as u64)
    }

    async fn page(
        &self,
        dataset: Dataset,
        filters: &Filters,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<Row>, ReaderError> {
        self.check_outage()?;
        self.pages_served.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .matching(dataset, filters)
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn count_skips_inactive_and_applies_filters() {
        let reader = MemoryDatasetReader::new().with_rows(
            Dataset::Hospitals,
            vec![
                row(json!({"id": "1", "state": "CA"})),
                row(json!({"id": "2", "state": "NY"})),
                row(json!({"id": "3", "state": "CA", "isActive": false})),
            ],
        );

        assert_eq!(reader.count(Dataset::Hospitals, &Filters::new()).await.unwrap(), 2);

        let mut filters = Filters::new();
        filters.insert("state".into(), "CA".into());
        assert_eq!(reader.count(Dataset::Hospitals, &filters).await.unwrap(), 1);
        assert_eq!(reader.count(Dataset::Prices, &filters).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn pages_follow_insertion_order() {
        let reader = MemoryDatasetReader::new().with_rows(
            Dataset::Prices,
            (0..5).map(|i| row(json!({"id": i}))),
        );

        let page = reader
            .page(Dataset::Prices, &Filters::new(), 2, 2)
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0]["id"], json!(2));
        assert_eq!(reader.pages_served(), 1);
    }

    #[tokio::test]
    async fn outage_fails_every_call() {
        let reader = MemoryDatasetReader::new();
        reader.set_outage(Some("connection refused"));
        let err = reader.count(Dataset::Analytics, &Filters::new()).await.unwrap_err();
        assert!(matches!(err, ReaderError::Unavailable(_)));

        reader.set_outage(None);
        assert!(reader.count(Dataset::Analytics, &Filters::new()).await.is_ok());
    }
}
