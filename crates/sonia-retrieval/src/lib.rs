//! Sonia Retrieval - Hybrid search over the memory ledger.
//!
//! Two-stage initialization: a synchronous BM25 preload of all active
//! ledger rows, then an asynchronous vector subsystem bring-up
//! (embeddings client, HNSW index, batch backfill). Vector search is
//! advisory: embedding or index failures never fail a caller, they log
//! and fall back to BM25 + substring matching.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod bm25;
pub mod embeddings;
pub mod error;
pub mod hybrid;
pub mod index;

pub use bm25::Bm25Index;
pub use embeddings::EmbeddingsClient;
pub use error::{RetrievalError, RetrievalResult};
pub use hybrid::{HybridOptions, HybridSearchLayer, SearchHit};
pub use index::{IndexManifest, VectorIndex};
