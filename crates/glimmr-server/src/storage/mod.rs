//! Backends for the dataset reader and the progress store.

mod postgres;
mod redis_store;

use std::sync::Arc;
use std::time::Duration;

use glimmr_export::{
    DatasetReader, ExportSettings, InMemoryProgressStore, MemoryDatasetReader, ProgressStore,
    ReaderError,
};

pub use postgres::PgDatasetReader;
pub use redis_store::RedisProgressStore;

use crate::config::{RedisConfig, StorageConfig};

/// PostgreSQL when configured, otherwise an empty in-memory reader.
pub async fn create_dataset_reader(
    config: &StorageConfig,
) -> Result<Arc<dyn DatasetReader>, ReaderError> {
    match config.postgres {
        Some(ref pg) => Ok(Arc::new(PgDatasetReader::connect(pg).await?)),
        None => {
            tracing::warn!("storage.postgres not configured; serving empty in-memory datasets");
            Ok(Arc::new(MemoryDatasetReader::new()))
        }
    }
}

/// Redis when enabled and reachable, otherwise process memory.
pub async fn create_progress_store(
    config: &RedisConfig,
    settings: &ExportSettings,
) -> Arc<dyn ProgressStore> {
    if !config.enabled {
        tracing::info!("Redis disabled, keeping export progress in memory");
        return Arc::new(InMemoryProgressStore::new());
    }

    let ttl = Duration::from_secs(settings.retention_hours.saturating_mul(3600));
    match RedisProgressStore::connect(config, ttl).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Failed to connect to Redis. Falling back to in-memory progress store."
            );
            Arc::new(InMemoryProgressStore::new())
        }
    }
}
