//! HNSW vector index with manifest-tracked persistence.
//!
//! The graph is rebuilt from a serde sidecar of `(id, vector, preview)`
//! entries on load, keeping the on-disk format independent of the graph
//! library's internals. A sibling `.manifest.json` records the sidecar
//! checksum, entry count, and build duration so a future run can detect
//! a corrupt index.

use hnsw_rs::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

use crate::error::{RetrievalError, RetrievalResult};

const MAX_ELEMENTS: usize = 100_000;
const M: usize = 16;
const EF_CONSTRUCTION: usize = 200;

/// Manifest written next to the index file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexManifest {
    /// SHA-256 of the persisted index file.
    pub sha256: String,
    /// Vectors in the index at save time.
    pub entry_count: usize,
    /// How long the last build (or backfill) took.
    pub build_duration_ms: u64,
}

impl IndexManifest {
    /// The manifest path for an index file.
    #[must_use]
    pub fn path_for(index_path: &Path) -> PathBuf {
        let mut name = index_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        name.push_str(".manifest.json");
        index_path.with_file_name(name)
    }

    /// Read the manifest for `index_path`, if present.
    #[must_use]
    pub fn read_for(index_path: &Path) -> Option<Self> {
        let raw = std::fs::read_to_string(Self::path_for(index_path)).ok()?;
        serde_json::from_str(&raw).ok()
    }

    /// Write this manifest next to `index_path`.
    ///
    /// # Errors
    ///
    /// Returns IO errors from the write.
    pub fn write_for(&self, index_path: &Path) -> RetrievalResult<()> {
        std::fs::write(
            Self::path_for(index_path),
            serde_json::to_string_pretty(self)?,
        )?;
        Ok(())
    }
}

/// One persisted vector entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedEntry {
    id: String,
    vector: Vec<f32>,
    preview: String,
}

/// A vector search hit.
#[derive(Debug, Clone)]
pub struct VectorHit {
    /// The ledger record id.
    pub id: String,
    /// Cosine similarity in `[0, 1]`-ish range (1 = identical).
    pub similarity: f32,
}

struct IndexInner {
    hnsw: Hnsw<'static, f32, DistCosine>,
    /// Internal node id -> persisted entry
    entries: HashMap<usize, PersistedEntry>,
    /// Ledger id -> internal node id
    by_ledger_id: HashMap<String, usize>,
    next_id: usize,
}

impl IndexInner {
    fn fresh() -> Self {
        let nb_layer = 16.min((MAX_ELEMENTS as f32).ln().trunc() as usize).max(1);
        Self {
            hnsw: Hnsw::new(M, MAX_ELEMENTS, nb_layer, EF_CONSTRUCTION, DistCosine),
            entries: HashMap::new(),
            by_ledger_id: HashMap::new(),
            next_id: 0,
        }
    }
}

/// Cosine-distance HNSW index keyed by ledger ids.
pub struct VectorIndex {
    inner: Mutex<IndexInner>,
    index_path: PathBuf,
    dimension: usize,
}

impl VectorIndex {
    /// Create an index that persists at `index_path` with vectors of
    /// `dimension`.
    #[must_use]
    pub fn new(index_path: impl Into<PathBuf>, dimension: usize) -> Self {
        Self {
            inner: Mutex::new(IndexInner::fresh()),
            index_path: index_path.into(),
            dimension,
        }
    }

    /// The index file path.
    #[must_use]
    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    /// Load persisted entries from disk, if the file exists. A missing
    /// file leaves the index empty; a corrupt file is reported.
    ///
    /// # Errors
    ///
    /// Returns [`RetrievalError::IndexCorrupt`] when the sidecar cannot
    /// be decoded.
    pub fn load(&self) -> RetrievalResult<usize> {
        if !self.index_path.exists() {
            return Ok(0);
        }
        let raw = std::fs::read_to_string(&self.index_path)?;
        let persisted: Vec<PersistedEntry> = serde_json::from_str(&raw)?;

        let mut inner = self.lock();
        *inner = IndexInner::fresh();
        for entry in persisted {
            if entry.vector.len() != self.dimension {
                warn!(
                    id = entry.id,
                    got = entry.vector.len(),
                    expected = self.dimension,
                    "skipping persisted vector with wrong dimension"
                );
                continue;
            }
            let node = inner.next_id;
            inner.next_id += 1;
            inner.hnsw.insert((entry.vector.as_slice(), node));
            inner.by_ledger_id.insert(entry.id.clone(), node);
            inner.entries.insert(node, entry);
        }
        let count = inner.entries.len();
        info!(count, path = %self.index_path.display(), "vector index loaded");
        Ok(count)
    }

    /// Persist all entries and write an updated manifest.
    ///
    /// # Errors
    ///
    /// Returns IO errors from the writes.
    pub fn save(&self, build_duration_ms: u64) -> RetrievalResult<IndexManifest> {
        if let Some(parent) = self.index_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let (payload, entry_count) = {
            let inner = self.lock();
            let mut entries: Vec<&PersistedEntry> = inner.entries.values().collect();
            entries.sort_by(|a, b| a.id.cmp(&b.id));
            (serde_json::to_vec(&entries)?, inner.entries.len())
        };
        std::fs::write(&self.index_path, &payload)?;

        let mut hasher = Sha256::new();
        hasher.update(&payload);
        let manifest = IndexManifest {
            sha256: hex::encode(hasher.finalize()),
            entry_count,
            build_duration_ms,
        };
        manifest.write_for(&self.index_path)?;
        info!(entry_count, path = %self.index_path.display(), "vector index saved");
        Ok(manifest)
    }

    /// Number of vectors in the index.
    #[must_use]
    pub fn count(&self) -> usize {
        self.lock().entries.len()
    }

    /// Add vectors with their ledger ids and content previews.
    ///
    /// # Errors
    ///
    /// Returns [`RetrievalError::DimensionMismatch`] when a vector does
    /// not match the index dimension.
    pub fn add_vectors(
        &self,
        vectors: &[Vec<f32>],
        ids: &[String],
        previews: &[String],
    ) -> RetrievalResult<()> {
        let mut inner = self.lock();
        for ((vector, id), preview) in vectors.iter().zip(ids).zip(previews) {
            if vector.len() != self.dimension {
                return Err(RetrievalError::DimensionMismatch {
                    expected: self.dimension,
                    got: vector.len(),
                });
            }
            // Re-adding an id leaves the old graph node unreachable via
            // the id map
            let node = inner.next_id;
            inner.next_id += 1;
            inner.hnsw.insert((vector.as_slice(), node));
            inner.by_ledger_id.insert(id.clone(), node);
            inner.entries.insert(
                node,
                PersistedEntry {
                    id: id.clone(),
                    vector: vector.clone(),
                    preview: preview.clone(),
                },
            );
        }
        Ok(())
    }

    /// Nearest neighbors by cosine similarity.
    #[must_use]
    pub fn search(&self, query: &[f32], k: usize) -> Vec<VectorHit> {
        let inner = self.lock();
        if inner.entries.is_empty() || query.len() != self.dimension {
            return Vec::new();
        }
        let ef_search = (k * 2).max(200);
        let neighbours = inner.hnsw.search(query, k, ef_search);
        neighbours
            .into_iter()
            .filter_map(|n| {
                let entry = inner.entries.get(&n.d_id)?;
                // DistCosine returns a distance; similarity is 1 - d
                Some(VectorHit {
                    id: entry.id.clone(),
                    similarity: 1.0 - n.distance,
                })
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, IndexInner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl std::fmt::Debug for VectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorIndex")
            .field("index_path", &self.index_path)
            .field("dimension", &self.dimension)
            .field("count", &self.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(dir: f32) -> Vec<f32> {
        // 4-dim unit-ish vectors pointing in different directions
        vec![dir, 1.0 - dir, 0.5, 0.25]
    }

    fn add_one(index: &VectorIndex, id: &str, v: Vec<f32>) {
        index
            .add_vectors(&[v], &[id.to_string()], &[String::new()])
            .unwrap();
    }

    #[test]
    fn test_add_and_search() {
        let dir = tempfile::tempdir().unwrap();
        let index = VectorIndex::new(dir.path().join("test.hnsw"), 4);
        add_one(&index, "mem_a", unit(1.0));
        add_one(&index, "mem_b", unit(0.0));

        let hits = index.search(&unit(1.0), 2);
        assert_eq!(hits[0].id, "mem_a");
        assert!(hits[0].similarity > hits[1].similarity);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let index = VectorIndex::new(dir.path().join("test.hnsw"), 4);
        let err = index
            .add_vectors(&[vec![1.0, 2.0]], &["mem_a".to_string()], &[String::new()])
            .unwrap_err();
        assert!(matches!(err, RetrievalError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_wrong_dimension_query_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let index = VectorIndex::new(dir.path().join("test.hnsw"), 4);
        add_one(&index, "mem_a", unit(1.0));
        assert!(index.search(&[1.0], 5).is_empty());
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vector").join("sonia.hnsw");
        let index = VectorIndex::new(&path, 4);
        add_one(&index, "mem_a", unit(1.0));
        add_one(&index, "mem_b", unit(0.2));

        let manifest = index.save(42).unwrap();
        assert_eq!(manifest.entry_count, 2);
        assert_eq!(manifest.build_duration_ms, 42);

        let reloaded = VectorIndex::new(&path, 4);
        assert_eq!(reloaded.load().unwrap(), 2);
        let hits = reloaded.search(&unit(1.0), 1);
        assert_eq!(hits[0].id, "mem_a");
    }

    #[test]
    fn test_manifest_written_and_readable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sonia.hnsw");
        let index = VectorIndex::new(&path, 4);
        add_one(&index, "mem_a", unit(1.0));
        index.save(7).unwrap();

        let manifest = IndexManifest::read_for(&path).unwrap();
        assert_eq!(manifest.entry_count, 1);
        assert_eq!(manifest.sha256.len(), 64);
        assert!(IndexManifest::path_for(&path)
            .to_string_lossy()
            .ends_with("sonia.hnsw.manifest.json"));
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let index = VectorIndex::new(dir.path().join("absent.hnsw"), 4);
        assert_eq!(index.load().unwrap(), 0);
        assert_eq!(index.count(), 0);
    }
}
