//! In-memory Okapi BM25 index.
//!
//! Standard parameters (k1=1.5, b=0.75), lowercased alphanumeric
//! tokenization. The index holds every active ledger row in memory and
//! is rebuilt from the ledger on startup.

use std::collections::HashMap;

const K1: f64 = 1.5;
const B: f64 = 0.75;

/// One indexed document's term statistics.
#[derive(Debug, Clone)]
struct DocEntry {
    term_counts: HashMap<String, u32>,
    length: usize,
}

/// Okapi BM25 over ledger content.
#[derive(Debug, Default)]
pub struct Bm25Index {
    docs: HashMap<String, DocEntry>,
    /// term -> number of documents containing it
    doc_freq: HashMap<String, u32>,
    total_length: usize,
}

impl Bm25Index {
    /// Create an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of indexed documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    /// Whether the index is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Index (or re-index) a document.
    pub fn index_document(&mut self, doc_id: &str, content: &str) {
        if let Some(old) = self.docs.remove(doc_id) {
            self.total_length -= old.length;
            for term in old.term_counts.keys() {
                if let Some(df) = self.doc_freq.get_mut(term) {
                    *df = df.saturating_sub(1);
                }
            }
        }

        let tokens = tokenize(content);
        let length = tokens.len();
        let mut term_counts: HashMap<String, u32> = HashMap::new();
        for token in tokens {
            *term_counts.entry(token).or_insert(0) += 1;
        }
        for term in term_counts.keys() {
            *self.doc_freq.entry(term.clone()).or_insert(0) += 1;
        }
        self.total_length += length;
        self.docs.insert(
            doc_id.to_string(),
            DocEntry {
                term_counts,
                length,
            },
        );
    }

    /// Remove a document from the index.
    pub fn remove_document(&mut self, doc_id: &str) {
        if let Some(old) = self.docs.remove(doc_id) {
            self.total_length -= old.length;
            for term in old.term_counts.keys() {
                if let Some(df) = self.doc_freq.get_mut(term) {
                    *df = df.saturating_sub(1);
                }
            }
        }
    }

    /// Rank documents for `query`. Returns `(doc_id, score)` sorted by
    /// score descending, at most `limit` entries, zero-score hits
    /// excluded.
    #[must_use]
    pub fn search(&self, query: &str, limit: usize) -> Vec<(String, f64)> {
        if self.docs.is_empty() {
            return Vec::new();
        }
        let query_terms = tokenize(query);
        if query_terms.is_empty() {
            return Vec::new();
        }

        let n = self.docs.len() as f64;
        let avg_len = self.total_length as f64 / n;

        let mut scored: Vec<(String, f64)> = self
            .docs
            .iter()
            .filter_map(|(doc_id, entry)| {
                let mut score = 0.0;
                for term in &query_terms {
                    let Some(&tf) = entry.term_counts.get(term) else {
                        continue;
                    };
                    let df = f64::from(*self.doc_freq.get(term).unwrap_or(&0));
                    let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
                    let tf = f64::from(tf);
                    let denom = tf + K1 * (1.0 - B + B * entry.length as f64 / avg_len);
                    score += idf * tf * (K1 + 1.0) / denom;
                }
                (score > 0.0).then(|| (doc_id.clone(), score))
            })
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        scored
    }

    /// Index statistics for diagnostics.
    #[must_use]
    pub fn stats(&self) -> serde_json::Value {
        serde_json::json!({
            "documents": self.docs.len(),
            "terms": self.doc_freq.len(),
            "total_tokens": self.total_length,
        })
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}
