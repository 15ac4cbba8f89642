//! PostgreSQL dataset reader.
//!
//! Each dataset lives in its own table with `is_active` and `updated_at`
//! columns. Rows come back through `row_to_json`, so column order is kept
//! and no per-dataset row struct is needed.

use async_trait::async_trait;
use glimmr_export::{Dataset, DatasetReader, Filters, ReaderError, Row};
use serde_json::Value;
use sqlx_core::error::Error as SqlxError;
use sqlx_core::pool::PoolOptions;
use sqlx_core::query_scalar::query_scalar;
use sqlx_postgres::{PgPool, Postgres};
use tracing::{debug, info, instrument};

use crate::config::PostgresStorageConfig;

pub type PgPoolOptions = PoolOptions<Postgres>;

#[derive(Clone)]
pub struct PgDatasetReader {
    pool: PgPool,
}

impl PgDatasetReader {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[instrument(skip(config), fields(host = %config.host, database = %config.database))]
    pub async fn connect(config: &PostgresStorageConfig) -> Result<Self, ReaderError> {
        info!(
            pool_size = config.pool_size,
            connect_timeout_ms = config.connect_timeout_ms,
            "Creating PostgreSQL connection pool"
        );

        let mut options = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(config.connect_timeout())
            .test_before_acquire(false);
        if let Some(idle_timeout) = config.idle_timeout_ms {
            options = options.idle_timeout(std::time::Duration::from_millis(idle_timeout));
        }

        let pool = options
            .connect(&config.connection_url())
            .await
            .map_err(map_sqlx_error)?;

        debug!("PostgreSQL connection pool created successfully");
        Ok(Self::new(pool))
    }
}

fn table_name(dataset: Dataset) -> &'static str {
    match dataset {
        Dataset::Hospitals => "hospitals",
        Dataset::Prices => "prices",
        Dataset::Analytics => "analytics",
    }
}

/// `WHERE` clause for active rows matching `filters`, plus the values to bind
/// in placeholder order. Keys the dataset does not understand are skipped.
fn where_clause(dataset: Dataset, filters: &Filters) -> (String, Vec<String>) {
    let mut sql = String::from("WHERE is_active = true");
    let mut params = Vec::new();
    for (key, value) in filters {
        if let Some(column) = dataset.filter_column(key) {
            params.push(value.clone());
            sql.push_str(&format!(" AND {column} = ${}", params.len()));
        }
    }
    (sql, params)
}

fn count_sql(dataset: Dataset, filters: &Filters) -> (String, Vec<String>) {
    let (clause, params) = where_clause(dataset, filters);
    let sql = format!("SELECT COUNT(*) FROM {} {clause}", table_name(dataset));
    (sql, params)
}

fn page_sql(dataset: Dataset, filters: &Filters) -> (String, Vec<String>) {
    let (clause, params) = where_clause(dataset, filters);
    let limit_idx = params.len() + 1;
    let offset_idx = params.len() + 2;
    let sql = format!(
        "SELECT row_to_json(t) FROM (SELECT * FROM {} {clause} \
         ORDER BY updated_at DESC LIMIT ${limit_idx} OFFSET ${offset_idx}) t",
        table_name(dataset)
    );
    (sql, params)
}

fn map_sqlx_error(e: SqlxError) -> ReaderError {
    match e {
        SqlxError::Io(_)
        | SqlxError::Tls(_)
        | SqlxError::PoolTimedOut
        | SqlxError::PoolClosed => ReaderError::Unavailable(e.to_string()),
        other => ReaderError::Query(other.to_string()),
    }
}

fn clamp_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

#[async_trait]
impl DatasetReader for PgDatasetReader {
    async fn count(&self, dataset: Dataset, filters: &Filters) -> Result<u64, ReaderError> {
        let (sql, params) = count_sql(dataset, filters);
        let mut query = query_scalar::<_, i64>(&sql);
        for value in params {
            query = query.bind(value);
        }
        let count = query.fetch_one(&self.pool).await.map_err(|e| {
            tracing::warn!(dataset = %dataset, error = %e, "Count query failed");
            map_sqlx_error(e)
        })?;
        Ok(count.max(0) as u64)
    }

    async fn page(
        &self,
        dataset: Dataset,
        filters: &Filters,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<Row>, ReaderError> {
        let (sql, params) = page_sql(dataset, filters);
        let mut query = query_scalar::<_, Value>(&sql);
        for value in params {
            query = query.bind(value);
        }
        let values = query
            .bind(clamp_i64(limit))
            .bind(clamp_i64(offset))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                tracing::warn!(dataset = %dataset, error = %e, "Page query failed");
                map_sqlx_error(e)
            })?;

        values
            .into_iter()
            .map(|value| match value {
                Value::Object(row) => Ok(row),
                other => Err(ReaderError::Decode {
                    dataset,
                    message: format!("expected a JSON object, got {other}"),
                }),
            })
            .collect()
    }
}
