//! Content-addressed embedding cache.
//!
//! Vectors are keyed by a hash of (model id, normalised text) and kept in an
//! injected [`EmbeddingStore`]. A stored vector is never recomputed; the
//! first writer of a key wins and every later reader sees that value.
//! Concurrent misses for the same key are coalesced so that the backend is
//! invoked at most once per key at any time.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use rustc_hash::FxHashMap;
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tokio::sync::{RwLock, oneshot};
use tracing::{debug, warn};

use super::embedding::Embedder;
use crate::observability::metrics::Metrics;
use crate::schema::CleanedReviewUnit;
use crate::util::error::{FailureTarget, Stage, UnitFailure};
use crate::util::text::hash_text_128;

/// Stable content key of an embedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(u128);

impl CacheKey {
    #[must_use]
    pub fn for_text(model_id: &str, normalized_text: &str) -> Self {
        // Length-prefixed so no (model, text) pair can collide with another.
        let material = format!("{}:{model_id}{normalized_text}", model_id.len());
        Self(hash_text_128(&material))
    }

    #[must_use]
    pub fn to_hex(self) -> String {
        format!("{:032x}", self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub vector: Arc<[f32]>,
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    #[must_use]
    pub fn new(key: CacheKey, vector: Vec<f32>) -> Self {
        Self {
            key,
            vector: vector.into(),
            created_at: Utc::now(),
        }
    }
}

/// An embedding attached to one review unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub key: CacheKey,
    pub vector: Arc<[f32]>,
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("embedding store backend error: {0}")]
    Backend(#[from] sqlx::Error),
    #[error("corrupt cache entry {key}: {reason}")]
    Corrupt { key: CacheKey, reason: String },
}

/// Durable keyed store behind the cache.
#[async_trait]
pub trait EmbeddingStore: Send + Sync {
    async fn get(&self, key: CacheKey) -> Result<Option<CacheEntry>, CacheError>;

    /// Insert `entry` unless the key already exists, returning whichever
    /// entry is stored afterwards.
    async fn put(&self, entry: CacheEntry) -> Result<CacheEntry, CacheError>;

    async fn clear(&self) -> Result<(), CacheError>;

    async fn len(&self) -> Result<usize, CacheError>;

    async fn is_empty(&self) -> Result<bool, CacheError> {
        Ok(self.len().await? == 0)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryEmbeddingStore {
    entries: RwLock<FxHashMap<CacheKey, CacheEntry>>,
}

impl InMemoryEmbeddingStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EmbeddingStore for InMemoryEmbeddingStore {
    async fn get(&self, key: CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.entries.read().await.get(&key).cloned())
    }

    async fn put(&self, entry: CacheEntry) -> Result<CacheEntry, CacheError> {
        let mut entries = self.entries.write().await;
        Ok(entries.entry(entry.key).or_insert(entry).clone())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.entries.write().await.clear();
        Ok(())
    }

    async fn len(&self) -> Result<usize, CacheError> {
        Ok(self.entries.read().await.len())
    }
}

/// SQLite-backed store; survives process restarts.
#[derive(Debug, Clone)]
pub struct SqliteEmbeddingStore {
    pool: SqlitePool,
}

impl SqliteEmbeddingStore {
    /// Open (creating if needed) the cache database at `path`.
    ///
    /// # Errors
    /// Returns [`CacheError::Backend`] when the database cannot be opened or migrated.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    /// Wrap an existing pool and make sure the cache table exists.
    ///
    /// # Errors
    /// Returns [`CacheError::Backend`] when the table cannot be created.
    pub async fn with_pool(pool: SqlitePool) -> Result<Self, CacheError> {
        sqlx::query(
            r"CREATE TABLE IF NOT EXISTS embedding_cache (
                key TEXT PRIMARY KEY NOT NULL,
                dimension INTEGER NOT NULL,
                vector BLOB NOT NULL,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|value| value.to_le_bytes()).collect()
}

fn decode_vector(key: CacheKey, dimension: i64, bytes: &[u8]) -> Result<Arc<[f32]>, CacheError> {
    let corrupt = |reason: String| CacheError::Corrupt { key, reason };
    let expected = usize::try_from(dimension)
        .map_err(|_| corrupt(format!("negative dimension {dimension}")))?;
    if bytes.len() != expected * 4 {
        return Err(corrupt(format!(
            "expected {expected} floats, found {} bytes",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

#[async_trait]
impl EmbeddingStore for SqliteEmbeddingStore {
    async fn get(&self, key: CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let row = sqlx::query(
            "SELECT dimension, vector, created_at FROM embedding_cache WHERE key = ?1",
        )
        .bind(key.to_hex())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let dimension: i64 = row.try_get("dimension")?;
        let bytes: Vec<u8> = row.try_get("vector")?;
        let created_at: String = row.try_get("created_at")?;

        let vector = decode_vector(key, dimension, &bytes)?;
        let created_at = DateTime::parse_from_rfc3339(&created_at)
            .map_err(|error| CacheError::Corrupt {
                key,
                reason: format!("bad created_at: {error}"),
            })?
            .with_timezone(&Utc);

        Ok(Some(CacheEntry {
            key,
            vector,
            created_at,
        }))
    }

    async fn put(&self, entry: CacheEntry) -> Result<CacheEntry, CacheError> {
        let dimension = i64::try_from(entry.vector.len()).map_err(|_| CacheError::Corrupt {
            key: entry.key,
            reason: "vector too long".to_string(),
        })?;
        sqlx::query(
            "INSERT OR IGNORE INTO embedding_cache (key, dimension, vector, created_at)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(entry.key.to_hex())
        .bind(dimension)
        .bind(encode_vector(&entry.vector))
        .bind(entry.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        self.get(entry.key).await?.ok_or_else(|| CacheError::Corrupt {
            key: entry.key,
            reason: "entry missing after insert".to_string(),
        })
    }

    async fn clear(&self) -> Result<(), CacheError> {
        sqlx::query("DELETE FROM embedding_cache")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn len(&self) -> Result<usize, CacheError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embedding_cache")
            .fetch_one(&self.pool)
            .await?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}

type VectorResult = Result<Arc<[f32]>, String>;
type SharedVector = Shared<BoxFuture<'static, VectorResult>>;

/// Embeddings for a batch of units plus the units that could not be embedded.
#[derive(Debug, Clone, Default)]
pub struct EmbedOutcome {
    pub embeddings: BTreeMap<String, Embedding>,
    pub failures: Vec<UnitFailure>,
}

/// Removes claimed in-flight keys even if the owning future is dropped.
struct InflightClaims<'a> {
    table: &'a Mutex<FxHashMap<CacheKey, SharedVector>>,
    keys: Vec<CacheKey>,
}

impl Drop for InflightClaims<'_> {
    fn drop(&mut self) {
        if let Ok(mut table) = self.table.lock() {
            for key in &self.keys {
                table.remove(key);
            }
        }
    }
}

enum Claim {
    Owner(oneshot::Sender<VectorResult>),
    Waiter(SharedVector),
}

/// Read-through cache in front of an [`Embedder`].
pub struct EmbeddingCache {
    store: Arc<dyn EmbeddingStore>,
    embedder: Arc<dyn Embedder>,
    batch_size: usize,
    inflight: Mutex<FxHashMap<CacheKey, SharedVector>>,
    metrics: Option<Arc<Metrics>>,
}

impl fmt::Debug for EmbeddingCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddingCache")
            .field("model_id", &self.embedder.model_id())
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

impl EmbeddingCache {
    pub fn new(
        store: Arc<dyn EmbeddingStore>,
        embedder: Arc<dyn Embedder>,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            embedder,
            batch_size: batch_size.max(1),
            inflight: Mutex::new(FxHashMap::default()),
            metrics: None,
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[must_use]
    pub fn key_for(&self, normalized_text: &str) -> CacheKey {
        CacheKey::for_text(self.embedder.model_id(), normalized_text)
    }

    /// Drop every cached vector.
    ///
    /// # Errors
    /// Propagates store failures.
    pub async fn clear(&self) -> Result<(), CacheError> {
        self.store.clear().await
    }

    /// Embed every unit, reusing cached vectors.
    ///
    /// Units whose vector cannot be computed (even after a per-unit retry)
    /// are reported in [`EmbedOutcome::failures`] and left out of the map.
    #[allow(clippy::cast_precision_loss)]
    pub async fn embed(&self, units: &[CleanedReviewUnit]) -> EmbedOutcome {
        let started = Instant::now();

        let mut units_by_key: BTreeMap<CacheKey, Vec<&CleanedReviewUnit>> = BTreeMap::new();
        for unit in units {
            units_by_key
                .entry(self.key_for(&unit.normalized_text))
                .or_default()
                .push(unit);
        }

        let mut resolved: BTreeMap<CacheKey, VectorResult> = BTreeMap::new();
        let mut owned: Vec<(CacheKey, String, oneshot::Sender<VectorResult>)> = Vec::new();
        let mut waiting: Vec<(CacheKey, SharedVector)> = Vec::new();
        let mut claims = InflightClaims {
            table: &self.inflight,
            keys: Vec::new(),
        };

        for (key, members) in &units_by_key {
            if let Some(vector) = self.lookup(*key).await {
                resolved.insert(*key, Ok(vector));
                continue;
            }
            match self.claim(*key) {
                Claim::Waiter(shared) => waiting.push((*key, shared)),
                Claim::Owner(sender) => {
                    claims.keys.push(*key);
                    // Another owner may have finished between lookup and claim.
                    if let Some(vector) = self.lookup(*key).await {
                        let _ = sender.send(Ok(Arc::clone(&vector)));
                        resolved.insert(*key, Ok(vector));
                    } else {
                        owned.push((*key, members[0].normalized_text.clone(), sender));
                    }
                }
            }
        }

        let hits = resolved.len() + waiting.len();
        if let Some(metrics) = &self.metrics {
            metrics.cache_hits.inc_by(hits as f64);
            metrics.cache_misses.inc_by(owned.len() as f64);
        }

        for (key, result) in self.compute(owned).await {
            resolved.insert(key, result);
        }
        drop(claims);

        for (key, shared) in waiting {
            resolved.insert(key, shared.await);
        }

        let mut outcome = EmbedOutcome::default();
        for (key, members) in units_by_key {
            match resolved.remove(&key) {
                Some(Ok(vector)) => {
                    for unit in members {
                        outcome.embeddings.insert(
                            unit.source_review_id.clone(),
                            Embedding {
                                key,
                                vector: Arc::clone(&vector),
                            },
                        );
                    }
                }
                Some(Err(message)) => {
                    for unit in members {
                        outcome.failures.push(UnitFailure::new(
                            FailureTarget::Unit {
                                review_id: unit.source_review_id.clone(),
                            },
                            Stage::Embedding,
                            message.clone(),
                        ));
                    }
                }
                None => {}
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics
                .embedding_duration
                .observe(started.elapsed().as_secs_f64());
            metrics.model_failures.inc_by(outcome.failures.len() as f64);
        }
        debug!(
            units = units.len(),
            hits,
            failures = outcome.failures.len(),
            "embedding batch resolved"
        );
        outcome
    }

    async fn lookup(&self, key: CacheKey) -> Option<Arc<[f32]>> {
        match self.store.get(key).await {
            Ok(entry) => entry.map(|entry| entry.vector),
            Err(error) => {
                warn!(%key, error = %error, "embedding store read failed, treating as miss");
                None
            }
        }
    }

    fn claim(&self, key: CacheKey) -> Claim {
        let mut table = match self.inflight.lock() {
            Ok(table) => table,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(shared) = table.get(&key) {
            return Claim::Waiter(shared.clone());
        }
        let (sender, receiver) = oneshot::channel::<VectorResult>();
        let shared = receiver
            .map(|result| {
                result.unwrap_or_else(|_| Err("in-flight embedding was abandoned".to_string()))
            })
            .boxed()
            .shared();
        table.insert(key, shared);
        Claim::Owner(sender)
    }

    /// Compute owned keys in batches; a failed batch is retried one text at a time.
    async fn compute(
        &self,
        owned: Vec<(CacheKey, String, oneshot::Sender<VectorResult>)>,
    ) -> Vec<(CacheKey, VectorResult)> {
        let mut results = Vec::with_capacity(owned.len());
        let mut pending = owned.into_iter().peekable();

        while pending.peek().is_some() {
            let batch: Vec<_> = pending.by_ref().take(self.batch_size).collect();
            let texts: Vec<String> = batch.iter().map(|(_, text, _)| text.clone()).collect();

            let vectors = match self.invoke(&texts).await {
                Ok(vectors) => vectors.into_iter().map(Ok).collect::<Vec<_>>(),
                Err(error) => {
                    warn!(
                        batch = texts.len(),
                        error = %error,
                        "embedding batch failed, retrying per unit"
                    );
                    let mut singles = Vec::with_capacity(texts.len());
                    for text in &texts {
                        let single = self
                            .invoke(std::slice::from_ref(text))
                            .await
                            .and_then(|mut vectors| {
                                vectors
                                    .pop()
                                    .ok_or_else(|| anyhow::anyhow!("embedder returned no vector"))
                            });
                        singles.push(single);
                    }
                    singles
                }
            };

            for ((key, _, sender), vector) in batch.into_iter().zip(vectors) {
                let result = match vector {
                    Ok(vector) => Ok(self.persist(key, vector).await),
                    Err(error) => Err(error.to_string()),
                };
                let _ = sender.send(result.clone());
                results.push((key, result));
            }
        }
        results
    }

    async fn invoke(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        if let Some(metrics) = &self.metrics {
            metrics.embedder_invocations.inc();
        }
        let vectors = self.embedder.encode(texts).await?;
        if vectors.len() != texts.len() {
            anyhow::bail!(
                "embedder returned {} vectors for {} texts",
                vectors.len(),
                texts.len()
            );
        }
        Ok(vectors)
    }

    /// Store a freshly computed vector and return the value that won.
    async fn persist(&self, key: CacheKey, vector: Vec<f32>) -> Arc<[f32]> {
        let entry = CacheEntry::new(key, vector);
        match self.store.put(entry.clone()).await {
            Ok(stored) => stored.vector,
            Err(error) => {
                warn!(%key, error = %error, "embedding store write failed, using computed vector");
                entry.vector
            }
        }
    }
}
