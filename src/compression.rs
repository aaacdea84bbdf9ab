//! Content compression with shared zstd dictionaries.
//!
//! Pages behind one continuation tend to share structure, so each
//! continuation gets its own dictionary, trained from the first bodies
//! stored for it. Responses record the `dict_id` they were compressed with;
//! decompression must resolve the same dictionary.

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::db;
use crate::error::Result;

const COMPRESSION_LEVEL: i32 = 3;
/// Stored bodies per continuation before a dictionary is trained.
const TRAIN_THRESHOLD: i64 = 8;
/// Training sample window and dictionary size cap.
const TRAIN_SAMPLE_LIMIT: i64 = 32;
const MAX_DICT_SIZE: usize = 16 * 1024;

#[derive(Debug)]
struct LoadedDict {
    id: i64,
    raw: Vec<u8>,
}

/// Read-mostly registry of per-continuation dictionaries with a
/// write-through to `compression_dicts`.
pub struct DictRegistry {
    pool: SqlitePool,
    by_continuation: RwLock<HashMap<String, Arc<LoadedDict>>>,
    by_id: RwLock<HashMap<i64, Arc<LoadedDict>>>,
}

impl DictRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            by_continuation: RwLock::new(HashMap::new()),
            by_id: RwLock::new(HashMap::new()),
        }
    }

    /// Compress `body` for storage under `continuation`.
    ///
    /// Returns the frame and the dictionary id used (None when no dictionary
    /// exists yet). Training kicks in once enough samples are stored; a
    /// failed training falls back to dictionary-less compression.
    pub async fn compress_for(&self, continuation: &str, body: &[u8]) -> Result<(Vec<u8>, Option<i64>)> {
        if let Some(dict) = self.dict_for_continuation(continuation).await? {
            let mut compressor =
                zstd::bulk::Compressor::with_dictionary(COMPRESSION_LEVEL, &dict.raw)?;
            let frame = compressor.compress(body)?;
            return Ok((frame, Some(dict.id)));
        }

        let frame = zstd::bulk::compress(body, COMPRESSION_LEVEL)?;
        Ok((frame, None))
    }

    /// Decompress a stored frame. `original_size` bounds the output buffer.
    pub async fn decompress(
        &self,
        frame: &[u8],
        original_size: usize,
        dict_id: Option<i64>,
    ) -> Result<Vec<u8>> {
        if original_size == 0 {
            return Ok(Vec::new());
        }
        let capacity = original_size.max(1);
        match dict_id {
            Some(id) => {
                let dict = self.dict_by_id(id).await?;
                let mut decompressor = zstd::bulk::Decompressor::with_dictionary(&dict.raw)?;
                Ok(decompressor.decompress(frame, capacity)?)
            }
            None => Ok(zstd::bulk::decompress(frame, capacity)?),
        }
    }

    async fn dict_for_continuation(&self, continuation: &str) -> Result<Option<Arc<LoadedDict>>> {
        if let Some(dict) = self.by_continuation.read().await.get(continuation) {
            return Ok(Some(dict.clone()));
        }

        // Check the DB for a dictionary trained by a previous run
        let row = sqlx::query_as::<_, (i64, Vec<u8>)>(
            "SELECT id, dict FROM compression_dicts
             WHERE continuation = ?1 ORDER BY id DESC LIMIT 1",
        )
        .bind(continuation)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((id, raw)) = row {
            let dict = Arc::new(LoadedDict { id, raw });
            self.cache(continuation, dict.clone()).await;
            return Ok(Some(dict));
        }

        // No dictionary yet; train once enough samples have accumulated
        let stored = db::responses::count_responses_for_continuation(&self.pool, continuation).await?;
        if stored < TRAIN_THRESHOLD {
            return Ok(None);
        }
        self.train(continuation).await
    }

    async fn train(&self, continuation: &str) -> Result<Option<Arc<LoadedDict>>> {
        let rows = db::responses::recent_bodies_for_continuation(
            &self.pool,
            continuation,
            TRAIN_SAMPLE_LIMIT,
        )
        .await?;

        let mut samples: Vec<Vec<u8>> = Vec::with_capacity(rows.len());
        for (frame, dict_id, original_size) in rows {
            match self.decompress(&frame, original_size as usize, dict_id).await {
                Ok(body) if !body.is_empty() => samples.push(body),
                Ok(_) => {}
                Err(err) => warn!(continuation, error = ?err, "skipping corrupt training sample"),
            }
        }
        if samples.len() < TRAIN_THRESHOLD as usize {
            return Ok(None);
        }

        let raw = match zstd::dict::from_samples(&samples, MAX_DICT_SIZE) {
            Ok(raw) => raw,
            Err(err) => {
                // zstd refuses to train on degenerate inputs; keep compressing plain
                debug!(continuation, error = ?err, "dictionary training failed");
                return Ok(None);
            }
        };

        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO compression_dicts (continuation, dict, created_at)
             VALUES (?1, ?2, ?3) RETURNING id",
        )
        .bind(continuation)
        .bind(&raw)
        .bind(db::now_ms())
        .fetch_one(&self.pool)
        .await?;

        debug!(continuation, dict_id = id, dict_size = raw.len(), "trained compression dictionary");
        let dict = Arc::new(LoadedDict { id, raw });
        self.cache(continuation, dict.clone()).await;
        Ok(Some(dict))
    }

    async fn dict_by_id(&self, id: i64) -> Result<Arc<LoadedDict>> {
        if let Some(dict) = self.by_id.read().await.get(&id) {
            return Ok(dict.clone());
        }
        let raw =
            sqlx::query_scalar::<_, Vec<u8>>("SELECT dict FROM compression_dicts WHERE id = ?1")
                .bind(id)
                .fetch_one(&self.pool)
                .await?;
        let dict = Arc::new(LoadedDict { id, raw });
        self.by_id.write().await.insert(id, dict.clone());
        Ok(dict)
    }

    async fn cache(&self, continuation: &str, dict: Arc<LoadedDict>) {
        self.by_id.write().await.insert(dict.id, dict.clone());
        self.by_continuation
            .write()
            .await
            .insert(continuation.to_string(), dict);
    }
}
