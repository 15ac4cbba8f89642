//! Redis-backed progress store for multi-instance deployments.
//!
//! Each record is a JSON string under `<prefix>:progress:<id>` with a TTL of
//! the retention window. A sorted set `<prefix>:index`, scored by creation
//! time in milliseconds, drives listing and sweeping. Merges use
//! WATCH/MULTI so concurrent pollers never lose an update.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::{Connection, Pool};
use glimmr_export::{ExportProgress, ExportProgressPatch, ProgressStore, StoreError};

use crate::config::RedisConfig;

const MAX_MERGE_ATTEMPTS: usize = 5;

#[derive(Clone)]
pub struct RedisProgressStore {
    pool: Pool,
    prefix: String,
    ttl: Duration,
}

impl RedisProgressStore {
    pub fn new(pool: Pool, prefix: impl Into<String>, ttl: Duration) -> Self {
        Self {
            pool,
            prefix: prefix.into(),
            ttl,
        }
    }

    /// Build a pool from config and check that Redis answers.
    pub async fn connect(config: &RedisConfig, ttl: Duration) -> Result<Self, StoreError> {
        tracing::info!(url = %config.url, "Connecting to Redis");

        let mut redis_config = deadpool_redis::Config::from_url(&config.url);
        if let Some(ref mut pool_config) = redis_config.pool {
            pool_config.max_size = config.pool_size;
            pool_config.timeouts.wait = Some(Duration::from_millis(config.timeout_ms));
            pool_config.timeouts.create = Some(Duration::from_millis(config.timeout_ms));
            pool_config.timeouts.recycle = Some(Duration::from_millis(config.timeout_ms));
        }
        let pool = redis_config
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .map_err(|e| StoreError::Unavailable(format!("failed to create Redis pool: {e}")))?;

        let store = Self::new(pool, config.key_prefix.clone(), ttl);
        store.conn().await?;
        tracing::info!("Connected to Redis");
        Ok(store)
    }

    fn record_key(&self, export_id: &str) -> String {
        format!("{}:progress:{export_id}", self.prefix)
    }

    fn index_key(&self) -> String {
        format!("{}:index", self.prefix)
    }

    fn ttl_secs(&self) -> u64 {
        self.ttl.as_secs().max(1)
    }

    async fn conn(&self) -> Result<Connection, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Unavailable(format!("Redis pool: {e}")))
    }
}

fn redis_error(e: redis::RedisError) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn decode(export_id: &str, raw: &str) -> Result<ExportProgress, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Corrupt {
        id: export_id.to_string(),
        message: e.to_string(),
    })
}

fn encode(progress: &ExportProgress) -> Result<String, StoreError> {
    serde_json::to_string(progress).map_err(|e| StoreError::Corrupt {
        id: progress.export_id.clone(),
        message: e.to_string(),
    })
}

/// Outcome of applying a patch to the stored payload of one record.
#[derive(Debug)]
enum MergeStep {
    Missing,
    Unchanged(ExportProgress),
    Write {
        progress: ExportProgress,
        payload: String,
    },
}

fn plan_merge(
    export_id: &str,
    raw: Option<String>,
    patch: &ExportProgressPatch,
) -> Result<MergeStep, StoreError> {
    let Some(raw) = raw else {
        return Ok(MergeStep::Missing);
    };
    let mut progress = decode(export_id, &raw)?;
    if !progress.apply(patch.clone()) {
        return Ok(MergeStep::Unchanged(progress));
    }
    let payload = encode(&progress)?;
    Ok(MergeStep::Write { progress, payload })
}

async fn unwatch(conn: &mut Connection) -> Result<(), StoreError> {
    redis::cmd("UNWATCH")
        .query_async(conn)
        .await
        .map_err(redis_error)
}

/// Exclusive upper score bound for records created before `cutoff`.
fn sweep_bound(cutoff: DateTime<Utc>) -> String {
    format!("({}", cutoff.timestamp_millis())
}

#[async_trait]
impl ProgressStore for RedisProgressStore {
    async fn create(&self, progress: ExportProgress) -> Result<(), StoreError> {
        let key = self.record_key(&progress.export_id);
        let payload = encode(&progress)?;
        let mut conn = self.conn().await?;

        let created: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(payload)
            .arg("NX")
            .arg("EX")
            .arg(self.ttl_secs())
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;
        if created.is_none() {
            return Err(StoreError::Duplicate(progress.export_id));
        }

        let _: i64 = redis::cmd("ZADD")
            .arg(self.index_key())
            .arg(progress.created_at.timestamp_millis())
            .arg(&progress.export_id)
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;
        Ok(())
    }

    async fn merge(
        &self,
        export_id: &str,
        patch: ExportProgressPatch,
    ) -> Result<Option<ExportProgress>, StoreError> {
        let key = self.record_key(export_id);
        let mut conn = self.conn().await?;

        for _ in 0..MAX_MERGE_ATTEMPTS {
            let _: () = redis::cmd("WATCH")
                .arg(&key)
                .query_async(&mut conn)
                .await
                .map_err(redis_error)?;

            let raw: Result<Option<String>, StoreError> = redis::cmd("GET")
                .arg(&key)
                .query_async(&mut conn)
                .await
                .map_err(redis_error);

            // Only a write leaves the key watched; EXEC releases it.
            let (progress, payload) = match raw.and_then(|raw| plan_merge(export_id, raw, &patch)) {
                Ok(MergeStep::Write { progress, payload }) => (progress, payload),
                Ok(MergeStep::Missing) => {
                    unwatch(&mut conn).await?;
                    return Ok(None);
                }
                Ok(MergeStep::Unchanged(progress)) => {
                    unwatch(&mut conn).await?;
                    return Ok(Some(progress));
                }
                Err(e) => {
                    if let Err(unwatch_err) = unwatch(&mut conn).await {
                        tracing::debug!(error = %unwatch_err, "UNWATCH after failed merge read");
                    }
                    return Err(e);
                }
            };

            let committed: Option<()> = redis::pipe()
                .atomic()
                .cmd("SET")
                .arg(&key)
                .arg(payload)
                .arg("KEEPTTL")
                .ignore()
                .query_async(&mut conn)
                .await
                .map_err(redis_error)?;
            if committed.is_some() {
                return Ok(Some(progress));
            }
            tracing::debug!(export_id = %export_id, "Progress changed during merge; retrying");
        }

        Err(StoreError::Unavailable(format!(
            "gave up merging progress for {export_id} after {MAX_MERGE_ATTEMPTS} conflicting updates"
        )))
    }

    async fn get(&self, export_id: &str) -> Result<Option<ExportProgress>, StoreError> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.record_key(export_id))
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;
        raw.map(|raw| decode(export_id, &raw)).transpose()
    }

    async fn list_all(&self) -> Result<Vec<ExportProgress>, StoreError> {
        let mut conn = self.conn().await?;
        let ids: Vec<String> = redis::cmd("ZREVRANGE")
            .arg(self.index_key())
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = ids.iter().map(|id| self.record_key(id)).collect();
        let raws: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;

        let mut records = Vec::with_capacity(ids.len());
        for (id, raw) in ids.iter().zip(raws) {
            // Expired by TTL but not yet swept from the index.
            let Some(raw) = raw else { continue };
            records.push(decode(id, &raw)?);
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    async fn remove(&self, export_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let (deleted, _): (i64, i64) = redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(self.record_key(export_id))
            .cmd("ZREM")
            .arg(self.index_key())
            .arg(export_id)
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;
        Ok(deleted > 0)
    }

    async fn sweep(
        &self,
        now: DateTime<Utc>,
        retention: chrono::Duration,
    ) -> Result<usize, StoreError> {
        let mut conn = self.conn().await?;
        let expired: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.index_key())
            .arg("-inf")
            .arg(sweep_bound(now - retention))
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;
        if expired.is_empty() {
            return Ok(0);
        }

        let keys: Vec<String> = expired.iter().map(|id| self.record_key(id)).collect();
        let _: () = redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(&keys)
            .ignore()
            .cmd("ZREM")
            .arg(self.index_key())
            .arg(&expired)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;
        Ok(expired.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use glimmr_export::ExportStatus;

    fn store() -> RedisProgressStore {
        let pool = deadpool_redis::Config::from_url("redis://127.0.0.1:6379")
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .unwrap();
        RedisProgressStore::new(pool, "glimmr:test", Duration::from_secs(86_400))
    }

    #[tokio::test]
    async fn keys_use_the_configured_prefix() {
        let store = store();
        assert_eq!(store.record_key("abc"), "glimmr:test:progress:abc");
        assert_eq!(store.index_key(), "glimmr:test:index");
        assert_eq!(store.ttl_secs(), 86_400);
    }

    #[test]
    fn sweep_bound_is_exclusive() {
        let cutoff = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        assert_eq!(sweep_bound(cutoff), "(1700000000123");
    }

    #[test]
    fn corrupt_payload_names_the_record() {
        let err = decode("x-1", "{not json").unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { ref id, .. } if id == "x-1"));
    }

    #[test]
    fn merge_of_a_missing_or_corrupt_record_writes_nothing() {
        let patch = ExportProgressPatch {
            status: Some(ExportStatus::Processing),
            ..Default::default()
        };
        assert!(matches!(
            plan_merge("x-3", None, &patch),
            Ok(MergeStep::Missing)
        ));
        assert!(matches!(
            plan_merge("x-3", Some("{not json".into()), &patch),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn merge_only_writes_accepted_patches() {
        let created = Utc::now();
        let patch = ExportProgressPatch {
            status: Some(ExportStatus::Processing),
            progress: Some(30),
            ..Default::default()
        };

        let done = encode(&ExportProgress::completed("x-4", 5, "/d", created)).unwrap();
        match plan_merge("x-4", Some(done), &patch).unwrap() {
            MergeStep::Unchanged(progress) => assert_eq!(progress.status, ExportStatus::Completed),
            other => panic!("unexpected step: {other:?}"),
        }

        let pending = encode(&ExportProgress::pending("x-5", 40, created)).unwrap();
        match plan_merge("x-5", Some(pending), &patch).unwrap() {
            MergeStep::Write { progress, payload } => {
                assert_eq!(progress.status, ExportStatus::Processing);
                assert_eq!(progress.progress, 30);
                assert_eq!(decode("x-5", &payload).unwrap(), progress);
            }
            other => panic!("unexpected step: {other:?}"),
        }
    }

    #[test]
    fn payload_round_trips() {
        let progress = ExportProgress::pending("x-2", 40, Utc::now());
        let raw = encode(&progress).unwrap();
        assert!(raw.contains("\"exportId\":\"x-2\""));
        assert_eq!(decode("x-2", &raw).unwrap(), progress);
    }
}
