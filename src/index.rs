//! Stage processor: Enriched → Indexed.
//!
//! Generates one representation per Enriched chunk and writes the Indexed
//! set with metadata carried through verbatim (only `storage_path` is
//! re-addressed). A document is written only if the generator returned
//! exactly as many representations as there are chunks, so
//! `count(Indexed(doc_id)) == count(Enriched(doc_id))` always holds for
//! advanced documents.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::error::{GovernanceError, Result};
use crate::metadata::for_tier;
use crate::models::{Tier, TierEntry};
use crate::pipeline::{StageOptions, StageReport};
use crate::progress::{silent, ProgressEvent, SharedProgress};
use crate::representation::RepresentationGenerator;
use crate::store::{accept_all, Store};

const STAGE: &str = "index";

pub struct Indexer {
    store: Arc<dyn Store>,
    generator: Arc<dyn RepresentationGenerator>,
    batch_size: usize,
    options: StageOptions,
    progress: SharedProgress,
}

impl Indexer {
    pub fn new(
        store: Arc<dyn Store>,
        generator: Arc<dyn RepresentationGenerator>,
        batch_size: usize,
        options: StageOptions,
    ) -> Self {
        Self {
            store,
            generator,
            batch_size: batch_size.max(1),
            options,
            progress: silent(),
        }
    }

    pub fn with_progress(mut self, progress: SharedProgress) -> Self {
        self.progress = progress;
        self
    }

    /// Enriched documents with no Indexed set, or whose Indexed set is
    /// out of date with the Enriched revision or chunk count.
    pub async fn pending(&self) -> Result<Vec<String>> {
        let enriched = self.store.list(Tier::Enriched, accept_all()).await?;
        let indexed: BTreeMap<String, Vec<String>> = self
            .store
            .list(Tier::Indexed, accept_all())
            .await?
            .iter()
            .map(|d| (d.doc_id.clone(), d.upstream_hashes.clone()))
            .collect();
        let failed: BTreeSet<String> = if self.options.retry_failed {
            BTreeSet::new()
        } else {
            self.store
                .list_failures()
                .await?
                .into_iter()
                .filter(|f| f.tier == Tier::Indexed)
                .map(|f| f.doc_id)
                .collect()
        };

        Ok(enriched
            .iter()
            .filter(|doc| !failed.contains(&doc.doc_id))
            .filter(|doc| indexed.get(&doc.doc_id) != Some(&doc.upstream_hashes))
            .map(|doc| doc.doc_id.clone())
            .collect())
    }

    pub async fn run(&self) -> Result<StageReport> {
        self.progress.report(ProgressEvent::Discovering {
            stage: STAGE.to_string(),
        });
        let pending = self.pending().await?;
        let total = pending.len() as u64;
        let mut report = StageReport::new(STAGE);
        report.discovered = pending.len();
        info!(stage = STAGE, pending = pending.len(), generator = self.generator.name(), "starting stage");

        let work = async {
            let mut results = stream::iter(pending)
                .map(|doc_id| async move {
                    let outcome = self.index_one(&doc_id).await;
                    (doc_id, outcome)
                })
                .buffer_unordered(self.options.concurrency.max(1));

            let mut n = 0u64;
            while let Some((doc_id, outcome)) = results.next().await {
                match outcome {
                    Ok(chunks) => {
                        report.advanced += 1;
                        report.chunks_written += chunks;
                    }
                    Err(e @ GovernanceError::CardinalityMismatch { .. })
                    | Err(e @ GovernanceError::ValidationFailure { .. }) => {
                        report.invalid += 1;
                        let reason = e.to_string();
                        warn!(stage = STAGE, doc_id = %doc_id, %reason, "document rejected");
                        if let Err(e) = self.store.record_failure(&doc_id, Tier::Indexed, &reason).await {
                            warn!(stage = STAGE, doc_id = %doc_id, error = %e, "could not record failure");
                        }
                    }
                    Err(e) => {
                        report.errors += 1;
                        warn!(stage = STAGE, doc_id = %doc_id, error = %e, transient = e.is_transient(), "document not advanced");
                    }
                }
                n += 1;
                self.progress.report(ProgressEvent::Processing {
                    stage: STAGE.to_string(),
                    n,
                    total,
                });
            }
        };

        if tokio::time::timeout(self.options.batch_timeout, work).await.is_err() {
            report.timed_out = true;
            warn!(stage = STAGE, timeout_secs = self.options.batch_timeout.as_secs(), "batch timed out");
        }

        self.progress.report(report.finished_event());
        info!(
            stage = STAGE,
            advanced = report.advanced,
            invalid = report.invalid,
            errors = report.errors,
            "stage finished"
        );
        Ok(report)
    }

    /// Advance a single document into the Indexed tier. Returns the number
    /// of chunks written.
    pub async fn index_one(&self, doc_id: &str) -> Result<usize> {
        let enriched = self.store.get(Tier::Enriched, doc_id).await?;

        let mut texts = Vec::with_capacity(enriched.entries.len());
        for entry in &enriched.entries {
            let text = String::from_utf8(entry.content.clone()).map_err(|_| {
                GovernanceError::ValidationFailure {
                    doc_id: doc_id.to_string(),
                    reason: format!("chunk {} is not valid UTF-8", entry.index),
                }
            })?;
            texts.push(text);
        }

        let mut representations = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let generated = self.generator.represent(batch).await?;
            if generated.len() != batch.len() {
                return Err(GovernanceError::CardinalityMismatch {
                    expected: batch.len(),
                    actual: generated.len(),
                });
            }
            representations.extend(generated);
        }

        let mut entries = Vec::with_capacity(enriched.entries.len());
        for (entry, representation) in enriched.entries.into_iter().zip(representations) {
            let source_meta = entry.metadata.as_ref().ok_or_else(|| {
                GovernanceError::ValidationFailure {
                    doc_id: doc_id.to_string(),
                    reason: format!("enriched chunk {} has no metadata", entry.index),
                }
            })?;
            let metadata = for_tier(source_meta, Tier::Indexed);
            if metadata.confidentiality_level < source_meta.confidentiality_level {
                return Err(GovernanceError::ValidationFailure {
                    doc_id: doc_id.to_string(),
                    reason: "indexed classification would be lower than enriched".to_string(),
                });
            }
            entries.push(TierEntry {
                index: entry.index,
                content: entry.content,
                metadata: Some(metadata),
                representation: Some(representation),
                upstream_hash: entry.upstream_hash,
            });
        }

        let chunks = entries.len();
        self.store.put(Tier::Indexed, doc_id, entries).await?;
        self.store.clear_failure(doc_id, Tier::Indexed).await?;
        debug!(doc_id, chunks, generator = self.generator.name(), "indexed");
        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Synthesizer;
    use crate::models::{ConfidentialityLevel, Representation};
    use crate::representation::HashingEmbedder;
    use crate::store::memory::InMemoryStore;
    use async_trait::async_trait;
    use chrono::Utc;

    /// Drops the last output of every batch.
    struct ShortChanging;

    #[async_trait]
    impl RepresentationGenerator for ShortChanging {
        fn name(&self) -> &str {
            "short"
        }

        async fn represent(&self, texts: &[String]) -> Result<Vec<Representation>> {
            Ok(texts
                .iter()
                .skip(1)
                .map(|t| Representation::Summary(t.clone()))
                .collect())
        }
    }

    async fn seed_enriched(store: &Arc<dyn Store>, doc_id: &str, chunks: &[&str], level: ConfidentialityLevel) {
        let mut meta = for_tier(
            &Synthesizer::default().fill_missing(doc_id, Utc::now()),
            Tier::Enriched,
        );
        meta.confidentiality_level = level;
        let entries = chunks
            .iter()
            .enumerate()
            .map(|(i, text)| TierEntry {
                index: i as u32,
                content: text.as_bytes().to_vec(),
                metadata: Some(meta.clone()),
                representation: None,
                upstream_hash: "rev-1".to_string(),
            })
            .collect();
        store.put(Tier::Enriched, doc_id, entries).await.unwrap();
    }

    fn indexer(store: Arc<dyn Store>, generator: Arc<dyn RepresentationGenerator>) -> Indexer {
        Indexer::new(store, generator, 2, StageOptions::default())
    }

    #[tokio::test]
    async fn one_representation_per_chunk_with_level_carried() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        seed_enriched(&store, "d1", &["a", "b", "c", "d", "e"], ConfidentialityLevel::Confidential).await;

        let report = indexer(store.clone(), Arc::new(HashingEmbedder::new(16)))
            .run()
            .await
            .unwrap();
        assert_eq!(report.advanced, 1);
        assert_eq!(report.chunks_written, 5);

        let doc = store.get(Tier::Indexed, "d1").await.unwrap();
        assert_eq!(doc.entries.len(), 5);
        for entry in &doc.entries {
            let meta = entry.metadata.as_ref().unwrap();
            assert_eq!(meta.confidentiality_level, ConfidentialityLevel::Confidential);
            assert_eq!(meta.doc_id, "d1");
            assert!(meta.storage_path.starts_with("indexed/"));
            assert!(matches!(entry.representation, Some(Representation::Vector(_))));
            assert_eq!(entry.upstream_hash, "rev-1");
        }
    }

    #[tokio::test]
    async fn cardinality_mismatch_is_not_advanced() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        seed_enriched(&store, "d1", &["a", "b", "c"], ConfidentialityLevel::Public).await;

        let stage = indexer(store.clone(), Arc::new(ShortChanging));
        let err = stage.index_one("d1").await.unwrap_err();
        assert!(matches!(err, GovernanceError::CardinalityMismatch { expected: 2, actual: 1 }));

        let report = stage.run().await.unwrap();
        assert_eq!(report.invalid, 1);
        assert!(store.get(Tier::Indexed, "d1").await.is_err());
        assert_eq!(store.list_failures().await.unwrap()[0].tier, Tier::Indexed);
    }

    #[tokio::test]
    async fn rerun_yields_nothing_new() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        seed_enriched(&store, "d1", &["a", "b"], ConfidentialityLevel::Internal).await;
        let stage = indexer(store.clone(), Arc::new(HashingEmbedder::new(8)));
        stage.run().await.unwrap();
        let second = stage.run().await.unwrap();
        assert_eq!(second.discovered, 0);
        assert_eq!(second.advanced, 0);
    }

    #[tokio::test]
    async fn rechunked_document_is_reindexed() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        seed_enriched(&store, "d1", &["a", "b"], ConfidentialityLevel::Public).await;
        let stage = indexer(store.clone(), Arc::new(HashingEmbedder::new(8)));
        stage.run().await.unwrap();

        seed_enriched(&store, "d1", &["a", "b", "c"], ConfidentialityLevel::Public).await;
        assert_eq!(stage.pending().await.unwrap(), vec!["d1".to_string()]);
        stage.run().await.unwrap();
        assert_eq!(store.get(Tier::Indexed, "d1").await.unwrap().entries.len(), 3);
    }
}
