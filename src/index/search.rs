//! Top-k semantic search over the vector index.

use serde::Serialize;

use super::embedder::EmbeddingModel;
use super::store::VectorIndex;
use super::IndexError;

/// One search result.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub record_id: String,
    pub source_text: String,
    pub score: f32,
}

/// Semantic retrieval over an index built by the ingestion pipeline.
pub struct RetrievalEngine<E: EmbeddingModel, V: VectorIndex> {
    embedder: E,
    index: V,
}

impl<E: EmbeddingModel, V: VectorIndex> RetrievalEngine<E, V> {
    pub fn new(embedder: E, index: V) -> Self {
        Self { embedder, index }
    }

    /// Return up to `k` records by descending cosine similarity.
    ///
    /// Ties in score break by ascending `record_id`, so identical index
    /// contents and query always produce identical ordering. Fails with
    /// `IndexError::Empty` when nothing has been ingested at all.
    pub fn search(&self, query_text: &str, k: usize) -> Result<Vec<SearchHit>, IndexError> {
        let records = self.index.all()?;
        if records.is_empty() {
            return Err(IndexError::Empty);
        }

        let query_embedding = self.embedder.embed(query_text)?;

        let mut hits: Vec<SearchHit> = records
            .into_iter()
            .map(|record| SearchHit {
                score: cosine_similarity(&query_embedding, &record.embedding),
                record_id: record.record_id,
                source_text: record.source_text,
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.record_id.cmp(&b.record_id))
        });
        hits.truncate(k);

        Ok(hits)
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}
