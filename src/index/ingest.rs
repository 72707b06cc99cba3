//! Batch ingestion into the vector index.
//!
//! The source is consumed lazily and buffered in batches of exactly
//! `batch_size`, bounding peak memory to O(batch_size) regardless of corpus
//! size. Upserts are idempotent by content hash, and an embedding failure
//! aborts only the batch it occurred in — prior batches stay committed.

use std::collections::HashSet;

use serde::Serialize;
use uuid::Uuid;

use super::embedder::EmbeddingModel;
use super::store::{record_id, IndexRecord, VectorIndex};
use super::IndexError;

/// One raw record from the ingestion source.
#[derive(Debug, Clone)]
pub struct SourceRecord {
    pub raw_text: String,
    /// Free-form provenance label (dataset name, file, row id).
    pub metadata: Option<String>,
}

impl SourceRecord {
    pub fn new(raw_text: &str) -> Self {
        Self {
            raw_text: raw_text.to_string(),
            metadata: None,
        }
    }
}

/// Outcome counts of one ingestion run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub inserted: usize,
    pub skipped: usize,
    pub failed: usize,
    pub batches: usize,
    /// Largest number of records buffered at once; never exceeds batch_size.
    pub peak_buffered: usize,
}

impl IngestReport {
    /// Total failure: nothing ingested and at least one error.
    pub fn is_total_failure(&self) -> bool {
        self.inserted == 0 && self.failed > 0
    }
}

/// Batch ingestion pipeline over an embedder and a vector index.
pub struct IngestionPipeline<E: EmbeddingModel, V: VectorIndex> {
    embedder: E,
    index: V,
    batch_size: usize,
}

impl<E: EmbeddingModel, V: VectorIndex> IngestionPipeline<E, V> {
    pub fn new(embedder: E, index: V, batch_size: usize) -> Self {
        Self {
            embedder,
            index,
            // A zero batch size would never flush
            batch_size: batch_size.max(1),
        }
    }

    pub fn index(&self) -> &V {
        &self.index
    }

    /// Consume the source and upsert it into the index.
    ///
    /// Safe to re-run on the same source: records whose content hash is
    /// already indexed are skipped without re-embedding.
    pub fn ingest(
        &self,
        source: impl IntoIterator<Item = SourceRecord>,
    ) -> Result<IngestReport, IndexError> {
        let mut report = IngestReport::default();
        let mut buffer: Vec<SourceRecord> = Vec::with_capacity(self.batch_size);

        for record in source {
            buffer.push(record);
            report.peak_buffered = report.peak_buffered.max(buffer.len());

            if buffer.len() == self.batch_size {
                self.flush_batch(&mut buffer, &mut report)?;
            }
        }
        if !buffer.is_empty() {
            self.flush_batch(&mut buffer, &mut report)?;
        }

        tracing::info!(
            inserted = report.inserted,
            skipped = report.skipped,
            failed = report.failed,
            batches = report.batches,
            "Ingestion run finished"
        );
        Ok(report)
    }

    /// Embed and upsert one batch. The buffer is drained either way.
    fn flush_batch(
        &self,
        buffer: &mut Vec<SourceRecord>,
        report: &mut IngestReport,
    ) -> Result<(), IndexError> {
        report.batches += 1;

        // Deduplicate within the batch and against the index before
        // paying for any embedding.
        let mut seen: HashSet<String> = HashSet::new();
        let mut pending: Vec<(String, SourceRecord)> = Vec::new();

        for record in buffer.drain(..) {
            if record.raw_text.trim().is_empty() {
                report.failed += 1;
                continue;
            }
            let id = record_id(&record.raw_text);
            if seen.contains(&id) || self.index.contains(&id)? {
                report.skipped += 1;
                continue;
            }
            seen.insert(id.clone());
            pending.push((id, record));
        }

        if pending.is_empty() {
            return Ok(());
        }

        let texts: Vec<&str> = pending
            .iter()
            .map(|(_, record)| record.raw_text.as_str())
            .collect();
        let embeddings = match self.embedder.embed_batch(&texts) {
            Ok(embeddings) => embeddings,
            Err(e) => {
                // Abort only this batch; prior batches remain committed.
                tracing::warn!(error = %e, records = pending.len(), "Batch embedding failed");
                report.failed += pending.len();
                return Ok(());
            }
        };

        let batch_id = Uuid::new_v4();
        for ((id, source), embedding) in pending.into_iter().zip(embeddings) {
            let record = IndexRecord {
                record_id: id,
                source_text: source.raw_text,
                embedding,
                metadata: source.metadata,
                ingestion_batch_id: batch_id,
            };
            match self.index.insert(&record) {
                Ok(()) => report.inserted += 1,
                Err(e) => {
                    tracing::warn!(record_id = %record.record_id, error = %e, "Insert failed");
                    report.failed += 1;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::embedder::HashEmbedder;
    use crate::index::store::InMemoryVectorIndex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn records(n: usize) -> Vec<SourceRecord> {
        (0..n)
            .map(|i| SourceRecord::new(&format!("Question {i}: symptom. Answer {i}: treatment.")))
            .collect()
    }

    fn pipeline(batch_size: usize) -> IngestionPipeline<HashEmbedder, InMemoryVectorIndex> {
        IngestionPipeline::new(HashEmbedder::new(), InMemoryVectorIndex::new(), batch_size)
    }

    #[test]
    fn ingests_all_records() {
        let pipeline = pipeline(10);
        let report = pipeline.ingest(records(25)).unwrap();

        assert_eq!(report.inserted, 25);
        assert_eq!(report.skipped, 0);
        assert_eq!(report.failed, 0);
        assert_eq!(pipeline.index().len().unwrap(), 25);
    }

    #[test]
    fn batches_are_bounded_250_records_batch_64() {
        let pipeline = pipeline(64);
        let report = pipeline.ingest(records(250)).unwrap();

        // 64 + 64 + 64 + 58
        assert_eq!(report.batches, 4);
        assert_eq!(report.peak_buffered, 64);
        assert_eq!(report.inserted, 250);
        assert_eq!(pipeline.index().len().unwrap(), 250);
    }

    #[test]
    fn reingestion_is_idempotent() {
        let pipeline = pipeline(16);

        let first = pipeline.ingest(records(40)).unwrap();
        assert_eq!(first.inserted, 40);
        let size_after_first = pipeline.index().len().unwrap();

        let second = pipeline.ingest(records(40)).unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.skipped, 40);
        assert_eq!(pipeline.index().len().unwrap(), size_after_first);
    }

    #[test]
    fn metadata_is_carried_into_the_index() {
        let pipeline = pipeline(10);
        let source = vec![SourceRecord {
            raw_text: "fever and headache".into(),
            metadata: Some("vihealthqa/1234".into()),
        }];

        pipeline.ingest(source).unwrap();

        let all = pipeline.index().all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].metadata.as_deref(), Some("vihealthqa/1234"));
    }

    #[test]
    fn duplicates_within_batch_are_skipped() {
        let pipeline = pipeline(10);
        let source = vec![
            SourceRecord::new("fever and headache"),
            SourceRecord::new("Fever   AND headache"), // same after normalization
            SourceRecord::new("stomach pain"),
        ];

        let report = pipeline.ingest(source).unwrap();
        assert_eq!(report.inserted, 2);
        assert_eq!(report.skipped, 1);
    }

    #[test]
    fn empty_records_count_as_failed() {
        let pipeline = pipeline(10);
        let source = vec![SourceRecord::new("   "), SourceRecord::new("real content")];

        let report = pipeline.ingest(source).unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(report.failed, 1);
        assert!(!report.is_total_failure());
    }

    /// Embedder that fails on its second batch call.
    struct FlakyEmbedder {
        inner: HashEmbedder,
        calls: AtomicUsize,
    }

    impl EmbeddingModel for FlakyEmbedder {
        fn embed(&self, text: &str) -> Result<Vec<f32>, IndexError> {
            self.inner.embed(text)
        }

        fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, IndexError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 1 {
                return Err(IndexError::Embedding("device allocation failed".into()));
            }
            self.inner.embed_batch(texts)
        }

        fn dimension(&self) -> usize {
            self.inner.dimension()
        }
    }

    #[test]
    fn embedding_failure_aborts_only_current_batch() {
        let embedder = FlakyEmbedder {
            inner: HashEmbedder::new(),
            calls: AtomicUsize::new(0),
        };
        let pipeline = IngestionPipeline::new(embedder, InMemoryVectorIndex::new(), 10);

        let report = pipeline.ingest(records(30)).unwrap();

        // Batch 1 and 3 committed, batch 2 lost
        assert_eq!(report.inserted, 20);
        assert_eq!(report.failed, 10);
        assert_eq!(report.batches, 3);
        assert_eq!(pipeline.index().len().unwrap(), 20);
    }

    #[test]
    fn total_failure_detected() {
        let report = IngestReport {
            inserted: 0,
            skipped: 0,
            failed: 5,
            batches: 1,
            peak_buffered: 5,
        };
        assert!(report.is_total_failure());
    }
}
