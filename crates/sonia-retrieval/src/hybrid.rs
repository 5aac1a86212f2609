//! The hybrid search layer.
//!
//! Search path: BM25 ranking, vector similarity when the vector
//! subsystem is up, score fusion (0.4 BM25 + 0.6 vector, each normalized
//! by its branch maximum), then a substring fallback that merges any
//! ledger rows both branches missed at score zero.

use serde_json::Value as JsonValue;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use sonia_core::{MemoryId, Timestamp};
use sonia_ledger::{MemoryDatabase, MemoryDecay};

use crate::bm25::Bm25Index;
use crate::embeddings::EmbeddingsClient;
use crate::index::VectorIndex;

/// Options for constructing a [`HybridSearchLayer`].
#[derive(Debug, Clone)]
pub struct HybridOptions {
    /// Embeddings service base URL.
    pub embeddings_url: String,
    /// Embeddings model name.
    pub embeddings_model: String,
    /// Embedding dimension.
    pub dimension: usize,
    /// Vector index file path.
    pub index_path: std::path::PathBuf,
    /// Backfill batch size.
    pub backfill_batch: usize,
}

impl Default for HybridOptions {
    fn default() -> Self {
        Self {
            embeddings_url: "http://127.0.0.1:11434".to_string(),
            embeddings_model: "nomic-embed-text".to_string(),
            dimension: 768,
            index_path: std::path::PathBuf::from("data/vector/sonia.hnsw"),
            backfill_batch: 32,
        }
    }
}

/// One search result row.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SearchHit {
    /// The ledger record id.
    pub id: MemoryId,
    /// Legacy type column.
    pub record_type: String,
    /// Record content.
    pub content: String,
    /// Record metadata.
    pub metadata: Option<JsonValue>,
    /// Record creation time.
    pub created_at: Timestamp,
    /// Fused relevance score.
    pub score: f64,
    /// Decay score blended into the relevance by
    /// [`HybridSearchLayer::adjust_ranking`]; `1.0` until then.
    pub decay_factor: f64,
    /// Which branch produced the hit: `bm25`, `vector`, `hybrid`, or
    /// `like_fallback`.
    pub source: String,
}

struct VectorSubsystem {
    embeddings: EmbeddingsClient,
    index: VectorIndex,
}

/// Hybrid BM25 + vector search over the ledger.
pub struct HybridSearchLayer {
    db: MemoryDatabase,
    options: HybridOptions,
    decay: MemoryDecay,
    bm25: RwLock<Bm25Index>,
    vector: tokio::sync::RwLock<Option<VectorSubsystem>>,
    initialized: AtomicBool,
    vector_initialized: AtomicBool,
    indexed_count: AtomicUsize,
}

impl HybridSearchLayer {
    /// Create a layer over `db`.
    #[must_use]
    pub fn new(db: MemoryDatabase, options: HybridOptions) -> Self {
        Self {
            db,
            options,
            decay: MemoryDecay::default(),
            bm25: RwLock::new(Bm25Index::new()),
            vector: tokio::sync::RwLock::new(None),
            initialized: AtomicBool::new(false),
            vector_initialized: AtomicBool::new(false),
            indexed_count: AtomicUsize::new(0),
        }
    }

    /// Initialize BM25 and preload all active ledger content.
    pub fn initialize(&self) {
        match self.db.all_active_contents() {
            Ok(rows) => {
                let mut bm25 = self.write_bm25();
                let mut count = 0usize;
                for (id, content) in rows {
                    if !content.is_empty() {
                        bm25.index_document(id.as_str(), &content);
                        count += 1;
                    }
                }
                drop(bm25);
                self.indexed_count.store(count, Ordering::SeqCst);
                self.initialized.store(true, Ordering::SeqCst);
                info!(documents = count, "hybrid search initialized");
            }
            Err(e) => {
                error!(error = %e, "hybrid search init failed");
                self.initialized.store(false, Ordering::SeqCst);
            }
        }
    }

    /// Initialize the vector subsystem: embeddings client, HNSW index,
    /// and a batch backfill when the index is empty but BM25 has rows.
    ///
    /// Failure leaves BM25 + substring search active.
    pub async fn initialize_vector(&self) {
        let embeddings = EmbeddingsClient::new(
            self.options.embeddings_url.clone(),
            self.options.embeddings_model.clone(),
        );
        if let Err(e) = embeddings.initialize().await {
            error!(error = %e, "vector search init failed (BM25+substring still active)");
            return;
        }

        let index = VectorIndex::new(&self.options.index_path, self.options.dimension);
        let loaded = match index.load() {
            Ok(n) => n,
            Err(e) => {
                error!(error = %e, "vector index load failed (BM25+substring still active)");
                return;
            }
        };
        info!(
            vectors = loaded,
            provider = embeddings.provider(),
            "vector subsystem loaded"
        );

        let subsystem = VectorSubsystem { embeddings, index };
        let indexed = self.indexed_count.load(Ordering::SeqCst);
        if loaded == 0 && indexed > 0 {
            self.backfill(&subsystem).await;
        }

        *self.vector.write().await = Some(subsystem);
        self.vector_initialized.store(true, Ordering::SeqCst);
        info!("vector search initialized");
    }

    /// Embed all existing ledger content and add to the index.
    async fn backfill(&self, subsystem: &VectorSubsystem) {
        let started = Instant::now();
        let rows = match self.db.all_active_contents() {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "vector backfill failed");
                return;
            }
        };
        info!(documents = rows.len(), "backfilling vector index");

        let mut total_added = 0usize;
        for batch in rows.chunks(self.options.backfill_batch.max(1)) {
            let ids: Vec<String> = batch
                .iter()
                .filter(|(_, c)| !c.is_empty())
                .map(|(id, _)| id.as_str().to_string())
                .collect();
            let texts: Vec<String> = batch
                .iter()
                .filter(|(_, c)| !c.is_empty())
                .map(|(_, c)| c.clone())
                .collect();
            if texts.is_empty() {
                continue;
            }

            let embeddings = match subsystem.embeddings.embed_batch(&texts).await {
                Ok(vectors) => vectors,
                Err(e) => {
                    error!(error = %e, "vector backfill aborted");
                    return;
                }
            };
            let previews: Vec<String> =
                texts.iter().map(|t| truncate_chars(t, 200)).collect();
            if let Err(e) = subsystem.index.add_vectors(&embeddings, &ids, &previews) {
                error!(error = %e, "vector backfill insert failed");
                return;
            }
            total_added += ids.len();
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        if let Err(e) = subsystem.index.save(elapsed_ms) {
            warn!(error = %e, "index save after backfill failed");
        }
        info!(total_added, elapsed_ms, "backfill complete");
    }

    /// Index new content in BM25. Called after every ledger insert.
    pub fn on_store(&self, memory_id: &MemoryId, content: &str) {
        if !self.initialized.load(Ordering::SeqCst) {
            return;
        }
        self.write_bm25().index_document(memory_id.as_str(), content);
        self.indexed_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Embed and add to the vector index. Fire-and-forget safe: errors
    /// are logged, never raised, so the store path cannot be blocked by
    /// the advisory index.
    pub async fn on_store_async(&self, memory_id: &MemoryId, content: &str) {
        if !self.vector_initialized.load(Ordering::SeqCst) {
            return;
        }
        let guard = self.vector.read().await;
        let Some(subsystem) = guard.as_ref() else {
            return;
        };
        match subsystem.embeddings.embed(content).await {
            Ok(embedding) => {
                let result = subsystem.index.add_vectors(
                    &[embedding],
                    &[memory_id.as_str().to_string()],
                    &[truncate_chars(content, 200)],
                );
                match result {
                    Ok(()) => debug!(memory_id = memory_id.as_str(), "vector indexed"),
                    Err(e) => {
                        warn!(memory_id = memory_id.as_str(), error = %e, "vector index failed (non-fatal)");
                    }
                }
            }
            Err(e) => {
                warn!(memory_id = memory_id.as_str(), error = %e, "embedding failed (non-fatal)");
            }
        }
    }

    /// Synchronous search: BM25 ranking with substring fallback. Does not
    /// touch the vector index.
    #[must_use]
    pub fn search(&self, query: &str, limit: usize) -> Vec<SearchHit> {
        let mut results = Vec::new();
        let bm25_hits = self.bm25_search(query, limit * 2);

        for (doc_id, score) in bm25_hits {
            if let Some(hit) = self.fetch_hit(&doc_id, round4(score), "bm25") {
                results.push(hit);
            }
        }

        self.merge_substring_fallback(query, limit, &mut results);
        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(limit);
        results
    }

    /// Full hybrid search: BM25 + vector + substring fallback.
    pub async fn async_search(&self, query: &str, limit: usize) -> Vec<SearchHit> {
        let mut results: Vec<SearchHit> = Vec::new();
        let mut bm25_scores: Vec<(String, f64)> = Vec::new();

        for (doc_id, score) in self.bm25_search(query, limit * 2) {
            if let Some(hit) = self.fetch_hit(&doc_id, 0.0, "bm25") {
                bm25_scores.push((doc_id, score));
                results.push(hit);
            }
        }

        // Vector branch, advisory
        let mut vector_scores: Vec<(String, f64)> = Vec::new();
        if self.vector_initialized.load(Ordering::SeqCst) {
            let guard = self.vector.read().await;
            if let Some(subsystem) = guard.as_ref() {
                match subsystem.embeddings.embed(query).await {
                    Ok(embedding) => {
                        for hit in subsystem.index.search(&embedding, limit * 2) {
                            let similarity = f64::from(hit.similarity);
                            vector_scores.push((hit.id.clone(), similarity));
                            if let Some(existing) =
                                results.iter_mut().find(|r| r.id.as_str() == hit.id)
                            {
                                existing.source = "hybrid".to_string();
                            } else if let Some(found) = self.fetch_hit(&hit.id, 0.0, "vector") {
                                results.push(found);
                            }
                            // Vector hit without a ledger record is skipped
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "vector search failed (BM25 still active)");
                    }
                }
            }
        }

        // Fuse normalized scores
        let max_bm25 = bm25_scores.iter().map(|(_, s)| *s).fold(0.0, f64::max).max(1e-9);
        let max_vector = vector_scores
            .iter()
            .map(|(_, s)| *s)
            .fold(0.0, f64::max)
            .max(1e-9);
        for hit in &mut results {
            let bm25 = bm25_scores
                .iter()
                .find(|(id, _)| id == hit.id.as_str())
                .map_or(0.0, |(_, s)| *s);
            let vector = vector_scores
                .iter()
                .find(|(id, _)| id == hit.id.as_str())
                .map_or(0.0, |(_, s)| *s);
            hit.score = round4(0.4 * bm25 / max_bm25 + 0.6 * vector / max_vector);
        }

        self.merge_substring_fallback(query, limit, &mut results);
        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(limit);
        results
    }

    /// Blend memory decay into already-fused scores so recent,
    /// frequently-accessed memories rank higher, and re-sort. Callers
    /// that want raw fusion scores skip this step.
    #[must_use]
    pub fn adjust_ranking(&self, mut hits: Vec<SearchHit>, decay_weight: f64) -> Vec<SearchHit> {
        for hit in &mut hits {
            let access_count = hit
                .metadata
                .as_ref()
                .and_then(|m| m["access_count"].as_u64())
                .unwrap_or(0)
                .min(u64::from(u32::MAX)) as u32;
            let adjusted =
                self.decay
                    .adjust_relevance(hit.created_at, access_count, hit.score, decay_weight);
            hit.score = round4(adjusted.relevance);
            hit.decay_factor = round4(adjusted.decay_factor);
        }
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits
    }

    /// Persist the vector index and rewrite its manifest. Call on
    /// shutdown.
    pub async fn save_index(&self) {
        if !self.vector_initialized.load(Ordering::SeqCst) {
            return;
        }
        let guard = self.vector.read().await;
        let Some(subsystem) = guard.as_ref() else {
            return;
        };
        let started = Instant::now();
        match subsystem.index.save(0) {
            Ok(manifest) => {
                info!(
                    vectors = manifest.entry_count,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "vector index saved"
                );
            }
            Err(e) => error!(error = %e, "vector index save failed"),
        }
    }

    /// Diagnostics snapshot.
    pub async fn stats(&self) -> JsonValue {
        let bm25_stats = self.read_bm25().stats();
        let guard = self.vector.read().await;
        let (vector_count, degraded, provider) = match guard.as_ref() {
            Some(s) => (
                s.index.count(),
                s.embeddings.is_degraded(),
                Some(s.embeddings.provider().to_string()),
            ),
            None => (0, false, None),
        };
        serde_json::json!({
            "initialized": self.initialized.load(Ordering::SeqCst),
            "bm25_indexed": self.indexed_count.load(Ordering::SeqCst),
            "bm25_stats": bm25_stats,
            "vector": {
                "initialized": self.vector_initialized.load(Ordering::SeqCst),
                "vector_count": vector_count,
                "embeddings_degraded": degraded,
                "embeddings_provider": provider,
            },
        })
    }

    // ------------------------------------------------------------------

    fn bm25_search(&self, query: &str, limit: usize) -> Vec<(String, f64)> {
        if self.indexed_count.load(Ordering::SeqCst) == 0 {
            return Vec::new();
        }
        self.read_bm25().search(query, limit)
    }

    fn fetch_hit(&self, doc_id: &str, score: f64, source: &str) -> Option<SearchHit> {
        let record = self
            .db
            .get(&MemoryId::from_string(doc_id))
            .ok()
            .flatten()?;
        Some(SearchHit {
            id: record.id,
            record_type: record.record_type,
            content: record.content,
            metadata: record.metadata,
            created_at: record.created_at,
            score,
            decay_factor: 1.0,
            source: source.to_string(),
        })
    }

    fn merge_substring_fallback(&self, query: &str, limit: usize, results: &mut Vec<SearchHit>) {
        let fallback = match self.db.search(query, limit) {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "substring fallback failed");
                return;
            }
        };
        for record in fallback {
            if results.iter().any(|r| r.id == record.id) {
                continue;
            }
            results.push(SearchHit {
                id: record.id,
                record_type: record.record_type,
                content: record.content,
                metadata: record.metadata,
                created_at: record.created_at,
                score: 0.0,
                decay_factor: 1.0,
                source: "like_fallback".to_string(),
            });
        }
    }

    fn read_bm25(&self) -> std::sync::RwLockReadGuard<'_, Bm25Index> {
        self.bm25.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write_bm25(&self) -> std::sync::RwLockWriteGuard<'_, Bm25Index> {
        self.bm25.write().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl std::fmt::Debug for HybridSearchLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridSearchLayer")
            .field("initialized", &self.initialized)
            .field("vector_initialized", &self.vector_initialized)
            .field("indexed_count", &self.indexed_count)
            .finish_non_exhaustive()
    }
}

fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
