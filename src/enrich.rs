//! Stage processor: Raw → Enriched.
//!
//! For every Raw document that has no Enriched counterpart, or whose
//! Enriched chunks descend from an older Raw revision, the [`Enricher`]:
//!
//! 1. loads the Raw entry and synthesizes full-default metadata if the
//!    document arrived without a companion record;
//! 2. validates the content (non-blank, UTF-8) and the `doc_id` pairing;
//! 3. resolves the classification through the injected policy,
//!    tighten-only;
//! 4. chunks the text and writes every chunk under the shared `doc_id`
//!    with identical metadata in one atomic put.
//!
//! Validation failures go to the failure ledger and never abort the batch.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::chunk::chunk_text;
use crate::error::{GovernanceError, Result};
use crate::metadata::{for_tier, Synthesizer};
use crate::models::{ConfidentialityLevel, Tier, TierEntry};
use crate::pipeline::{StageOptions, StageReport};
use crate::policy::{resolve_classification, ClassificationPolicy, ContentSignal};
use crate::progress::{silent, ProgressEvent, SharedProgress};
use crate::store::{accept_all, Store};

const STAGE: &str = "enrich";

/// What happened to one document that advanced into Enriched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enriched {
    pub doc_id: String,
    pub chunks: usize,
    pub level: ConfidentialityLevel,
    /// Set when the policy tightened a defaulted level.
    pub tightened_from: Option<ConfidentialityLevel>,
    /// The Raw entry had no metadata and defaults were synthesized.
    pub defaulted: bool,
}

pub struct Enricher {
    store: Arc<dyn Store>,
    synthesizer: Synthesizer,
    policy: Arc<dyn ClassificationPolicy>,
    max_tokens: usize,
    options: StageOptions,
    progress: SharedProgress,
}

impl Enricher {
    pub fn new(
        store: Arc<dyn Store>,
        synthesizer: Synthesizer,
        policy: Arc<dyn ClassificationPolicy>,
        max_tokens: usize,
        options: StageOptions,
    ) -> Self {
        Self {
            store,
            synthesizer,
            policy,
            max_tokens,
            options,
            progress: silent(),
        }
    }

    pub fn with_progress(mut self, progress: SharedProgress) -> Self {
        self.progress = progress;
        self
    }

    /// Raw documents that need (re)processing, in `doc_id` order.
    ///
    /// Documents with a recorded Enriched failure are skipped unless
    /// `retry_failed` is set.
    pub async fn pending(&self) -> Result<Vec<String>> {
        let raw = self.store.list(Tier::Raw, accept_all()).await?;
        let enriched: BTreeMap<String, Vec<String>> = self
            .store
            .list(Tier::Enriched, accept_all())
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
                .filter(|f| f.tier == Tier::Enriched)
                .map(|f| f.doc_id)
                .collect()
        };

        Ok(raw
            .iter()
            .filter(|doc| !failed.contains(&doc.doc_id))
            .filter(|doc| {
                let revision = doc.upstream_hashes.first();
                match enriched.get(&doc.doc_id) {
                    None => true,
                    Some(hashes) => hashes.iter().any(|h| Some(h) != revision),
                }
            })
            .map(|doc| doc.doc_id.clone())
            .collect())
    }

    /// Process every pending document with bounded parallelism, within the
    /// batch timeout.
    pub async fn run(&self) -> Result<StageReport> {
        self.progress.report(ProgressEvent::Discovering {
            stage: STAGE.to_string(),
        });
        let pending = self.pending().await?;
        let total = pending.len() as u64;
        let mut report = StageReport::new(STAGE);
        report.discovered = pending.len();
        info!(stage = STAGE, pending = pending.len(), policy = self.policy.version(), "starting stage");

        let work = async {
            let mut results = stream::iter(pending)
                .map(|doc_id| async move {
                    let outcome = self.enrich_one(&doc_id).await;
                    (doc_id, outcome)
                })
                .buffer_unordered(self.options.concurrency.max(1));

            let mut n = 0u64;
            while let Some((doc_id, outcome)) = results.next().await {
                match outcome {
                    Ok(done) => {
                        report.advanced += 1;
                        report.chunks_written += done.chunks;
                        if done.tightened_from.is_some() {
                            report.tightened += 1;
                        }
                    }
                    Err(GovernanceError::ValidationFailure { reason, .. }) => {
                        report.invalid += 1;
                        warn!(stage = STAGE, doc_id = %doc_id, %reason, "validation failed");
                        if let Err(e) = self.store.record_failure(&doc_id, Tier::Enriched, &reason).await {
                            warn!(stage = STAGE, doc_id = %doc_id, error = %e, "could not record failure");
                        }
                    }
                    Err(e) => {
                        report.errors += 1;
                        warn!(stage = STAGE, doc_id = %doc_id, error = %e, "document not advanced");
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

    /// Advance a single document into the Enriched tier.
    ///
    /// # Errors
    ///
    /// - [`GovernanceError::ValidationFailure`] for blank or undecodable
    ///   content, or metadata naming another document.
    /// - [`GovernanceError::NotFound`] if the Raw document is gone.
    /// - [`GovernanceError::StoreUnavailable`] on storage failure.
    pub async fn enrich_one(&self, doc_id: &str) -> Result<Enriched> {
        let raw = self.store.get(Tier::Raw, doc_id).await?;
        let entry = &raw.entries[0];

        let (metadata, defaulted) = match &entry.metadata {
            Some(meta) => (meta.clone(), false),
            None => (self.synthesizer.fill_missing(doc_id, Utc::now()), true),
        };

        if metadata.doc_id != doc_id {
            return Err(invalid(
                doc_id,
                format!("metadata names doc_id '{}'", metadata.doc_id),
            ));
        }
        let text = std::str::from_utf8(&entry.content)
            .map_err(|e| invalid(doc_id, format!("content is not valid UTF-8: {}", e)))?;
        if text.trim().is_empty() {
            return Err(invalid(doc_id, "content is empty".to_string()));
        }

        let signal = ContentSignal {
            doc_id,
            title: metadata.title.as_deref(),
            document_type: &metadata.document_type,
            source: &metadata.source,
            tags: &metadata.tags,
            text,
        };
        let resolution = resolve_classification(
            metadata.confidentiality_level,
            self.synthesizer.defaults().confidentiality_level,
            self.policy.hint(&signal),
        );
        let tightened_from = resolution
            .tightened
            .then_some(metadata.confidentiality_level);
        if let Some(from) = tightened_from {
            info!(
                doc_id,
                from = %from,
                to = %resolution.level,
                policy = self.policy.version(),
                rules = ?self.policy.matching_rules(&signal),
                "classification tightened"
            );
        }

        let mut enriched_meta = for_tier(&metadata, Tier::Enriched);
        enriched_meta.confidentiality_level = resolution.level;

        let entries: Vec<TierEntry> = chunk_text(text, self.max_tokens)
            .into_iter()
            .map(|chunk| TierEntry {
                index: chunk.index,
                content: chunk.text.into_bytes(),
                metadata: Some(enriched_meta.clone()),
                representation: None,
                upstream_hash: entry.upstream_hash.clone(),
            })
            .collect();
        let chunks = entries.len();

        self.store.put(Tier::Enriched, doc_id, entries).await?;
        self.store.clear_failure(doc_id, Tier::Enriched).await?;
        debug!(doc_id, chunks, level = %resolution.level, defaulted, "enriched");

        Ok(Enriched {
            doc_id: doc_id.to_string(),
            chunks,
            level: resolution.level,
            tightened_from,
            defaulted,
        })
    }
}

fn invalid(doc_id: &str, reason: String) -> GovernanceError {
    GovernanceError::ValidationFailure {
        doc_id: doc_id.to_string(),
        reason,
    }
}
