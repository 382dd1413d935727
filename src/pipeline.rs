//! Stage orchestration, invariant audit and tier status.
//!
//! [`Pipeline`] wires the Raw→Enriched [`Enricher`] and the
//! Enriched→Indexed [`Indexer`] to one store and runs them in order. It
//! also answers operational questions about the tiers: how many documents
//! sit in each, whether a document's tiers satisfy the classification
//! invariants, and how to remove a document everywhere at once.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::info;

use crate::config::{Config, PipelineConfig};
use crate::enrich::Enricher;
use crate::error::{GovernanceError, Result};
use crate::index::Indexer;
use crate::metadata::{MetadataDefaults, Synthesizer};
use crate::models::{ConfidentialityLevel, Tier};
use crate::policy::RulePolicy;
use crate::progress::{ProgressEvent, SharedProgress};
use crate::representation::create_generator;
use crate::store::{accept_all, Store};

/// Knobs shared by both stage processors.
#[derive(Debug, Clone)]
pub struct StageOptions {
    pub concurrency: usize,
    pub batch_timeout: Duration,
    pub retry_failed: bool,
}

impl Default for StageOptions {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

impl StageOptions {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            batch_timeout: Duration::from_secs(config.batch_timeout_secs),
            retry_failed: config.retry_failed,
        }
    }
}

/// Counters for one stage batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StageReport {
    pub stage: String,
    /// Documents found pending when the batch started.
    pub discovered: usize,
    pub advanced: usize,
    pub chunks_written: usize,
    /// Documents whose defaulted level the policy tightened.
    pub tightened: usize,
    /// Documents rejected and written to the failure ledger.
    pub invalid: usize,
    /// Documents left untouched by a transient error.
    pub errors: usize,
    pub timed_out: bool,
}

impl StageReport {
    pub fn new(stage: &str) -> Self {
        Self {
            stage: stage.to_string(),
            ..Default::default()
        }
    }

    pub(crate) fn finished_event(&self) -> ProgressEvent {
        ProgressEvent::Finished {
            stage: self.stage.clone(),
            advanced: self.advanced as u64,
            failed: (self.invalid + self.errors) as u64,
            timed_out: self.timed_out,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineReport {
    pub enrich: StageReport,
    pub index: StageReport,
}

/// Per-tier document counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierStatus {
    pub raw: usize,
    pub enriched: usize,
    pub indexed: usize,
    pub failures: usize,
    pub pending_enrich: usize,
    pub pending_index: usize,
}

/// What one tier holds for an audited document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierAudit {
    pub tier: Tier,
    pub entries: usize,
    pub level: Option<ConfidentialityLevel>,
    /// Raw revision the tier descends from.
    pub revision: String,
}

/// Invariant check of one document across all tiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    pub doc_id: String,
    pub tiers: Vec<TierAudit>,
    /// A downstream tier descends from an older Raw revision.
    pub stale: bool,
    pub violations: Vec<String>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }

    fn tier(&self, tier: Tier) -> Option<&TierAudit> {
        self.tiers.iter().find(|t| t.tier == tier)
    }
}

/// Tiers a purge removed the document from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub doc_id: String,
    pub removed_from: Vec<Tier>,
}

pub struct Pipeline {
    store: Arc<dyn Store>,
    enricher: Enricher,
    indexer: Indexer,
}

impl Pipeline {
    pub fn new(store: Arc<dyn Store>, enricher: Enricher, indexer: Indexer) -> Self {
        Self {
            store,
            enricher,
            indexer,
        }
    }

    /// Build both stages from configuration.
    pub fn from_config(config: &Config, store: Arc<dyn Store>) -> anyhow::Result<Self> {
        let synthesizer = Synthesizer::new(MetadataDefaults::from_config(&config.metadata)?);
        let policy = Arc::new(RulePolicy::from_config(&config.policy)?);
        let generator = create_generator(&config.representation)?;
        let options = StageOptions::from_config(&config.pipeline);

        let enricher = Enricher::new(
            store.clone(),
            synthesizer,
            policy,
            config.chunking.max_tokens,
            options.clone(),
        );
        let indexer = Indexer::new(
            store.clone(),
            generator,
            config.representation.batch_size,
            options,
        );
        Ok(Self::new(store, enricher, indexer))
    }

    pub fn with_progress(self, progress: SharedProgress) -> Self {
        Self {
            store: self.store,
            enricher: self.enricher.with_progress(progress.clone()),
            indexer: self.indexer.with_progress(progress),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn enricher(&self) -> &Enricher {
        &self.enricher
    }

    pub fn indexer(&self) -> &Indexer {
        &self.indexer
    }

    /// Raw→Enriched, then Enriched→Indexed.
    pub async fn run_all(&self) -> Result<PipelineReport> {
        let enrich = self.enricher.run().await?;
        let index = self.indexer.run().await?;
        Ok(PipelineReport { enrich, index })
    }

    pub async fn status(&self) -> Result<TierStatus> {
        Ok(TierStatus {
            raw: self.store.count(Tier::Raw).await?,
            enriched: self.store.count(Tier::Enriched).await?,
            indexed: self.store.count(Tier::Indexed).await?,
            failures: self.store.list_failures().await?.len(),
            pending_enrich: self.enricher.pending().await?.len(),
            pending_index: self.indexer.pending().await?.len(),
        })
    }

    /// Check one document against the tier invariants.
    ///
    /// Reports as violations: Enriched or Indexed entries without metadata,
    /// entries naming another `doc_id`, mixed levels within a tier, a
    /// storage path outside its tier, a downstream level lower than any
    /// tier above it (whatever revision it descends from), and
    /// Indexed/Enriched chunk count disagreement for the same revision.
    pub async fn audit(&self, doc_id: &str) -> Result<AuditReport> {
        let mut tiers = Vec::new();
        let mut violations = Vec::new();

        for tier in Tier::ALL {
            let doc = match self.store.get(tier, doc_id).await {
                Ok(doc) => doc,
                Err(GovernanceError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            };

            let mut levels = Vec::new();
            for entry in &doc.entries {
                match &entry.metadata {
                    Some(meta) => {
                        if meta.doc_id != doc_id {
                            violations.push(format!(
                                "{} chunk {} names doc_id '{}'",
                                tier, entry.index, meta.doc_id
                            ));
                        }
                        if !meta.storage_path.starts_with(&format!("{}/", tier)) {
                            violations.push(format!(
                                "{} chunk {} has storage path '{}'",
                                tier, entry.index, meta.storage_path
                            ));
                        }
                        levels.push(meta.confidentiality_level);
                    }
                    None if tier == Tier::Raw => {}
                    None => violations.push(format!("{} chunk {} has no metadata", tier, entry.index)),
                }
            }
            levels.sort();
            levels.dedup();
            if levels.len() > 1 {
                violations.push(format!("{} chunks carry mixed classifications", tier));
            }

            tiers.push(TierAudit {
                tier,
                entries: doc.entries.len(),
                level: levels.first().copied(),
                revision: doc.entries[0].upstream_hash.clone(),
            });
        }

        let mut report = AuditReport {
            doc_id: doc_id.to_string(),
            tiers,
            stale: false,
            violations,
        };

        let raw_revision = report.tier(Tier::Raw).map(|t| t.revision.clone());
        let mut stale = false;
        for tier in [Tier::Enriched, Tier::Indexed] {
            if let (Some(t), Some(rev)) = (report.tier(tier), raw_revision.as_ref()) {
                stale |= &t.revision != rev;
            }
        }

        let mut extra = Vec::new();
        for pair in [
            (Tier::Raw, Tier::Enriched),
            (Tier::Raw, Tier::Indexed),
            (Tier::Enriched, Tier::Indexed),
        ] {
            if let (Some(upper), Some(lower)) = (report.tier(pair.0), report.tier(pair.1)) {
                if let (Some(up), Some(down)) = (upper.level, lower.level) {
                    if down < up {
                        extra.push(format!(
                            "{} level {} is lower than {} level {}",
                            pair.1, down, pair.0, up
                        ));
                    }
                }
            }
        }
        if let (Some(e), Some(i)) = (report.tier(Tier::Enriched), report.tier(Tier::Indexed)) {
            if e.revision == i.revision && e.entries != i.entries {
                extra.push(format!(
                    "indexed has {} chunks but enriched has {}",
                    i.entries, e.entries
                ));
            }
        }

        report.stale = stale;
        report.violations.extend(extra);
        Ok(report)
    }

    /// Audit every document present in any tier.
    pub async fn audit_all(&self) -> Result<Vec<AuditReport>> {
        let mut ids = std::collections::BTreeSet::new();
        for tier in Tier::ALL {
            ids.extend(self.store.list(tier, accept_all()).await?.doc_ids());
        }
        let mut reports = Vec::with_capacity(ids.len());
        for id in ids {
            reports.push(self.audit(&id).await?);
        }
        Ok(reports)
    }

    /// Remove a document from every tier, with its metadata and failure
    /// records.
    pub async fn purge(&self, doc_id: &str) -> Result<PurgeReport> {
        let mut removed_from = Vec::new();
        // Downstream first so no tier is left pointing at a missing parent.
        for tier in [Tier::Indexed, Tier::Enriched, Tier::Raw] {
            if self.store.delete(tier, doc_id).await? {
                removed_from.push(tier);
            }
        }
        for tier in [Tier::Enriched, Tier::Indexed] {
            self.store.clear_failure(doc_id, tier).await?;
        }
        info!(doc_id, tiers = removed_from.len(), "purged");
        Ok(PurgeReport {
            doc_id: doc_id.to_string(),
            removed_from,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::for_tier;
    use crate::models::{PartialMetadata, TierEntry};
    use crate::store::memory::InMemoryStore;

    async fn pipeline_with(body: &[u8], level: Option<&str>) -> (Pipeline, String) {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let attrs = PartialMetadata {
            confidentiality_level: level.map(str::to_string),
            ..Default::default()
        };
        let meta = Synthesizer::default().synthesize(Some(body), &attrs).unwrap();
        let id = meta.doc_id.clone();
        store
            .put(Tier::Raw, &id, vec![TierEntry::raw(body.to_vec(), Some(meta))])
            .await
            .unwrap();
        let pipeline = Pipeline::from_config(&Config::minimal(), store).unwrap();
        (pipeline, id)
    }

    #[tokio::test]
    async fn run_all_advances_and_audits_clean() {
        let (pipeline, id) = pipeline_with(b"quarterly numbers", Some("confidential")).await;
        let report = pipeline.run_all().await.unwrap();
        assert_eq!(report.enrich.advanced, 1);
        assert_eq!(report.index.advanced, 1);

        let audit = pipeline.audit(&id).await.unwrap();
        assert!(audit.is_clean(), "{:?}", audit.violations);
        assert!(!audit.stale);
        assert_eq!(audit.tiers.len(), 3);
        assert!(audit
            .tiers
            .iter()
            .all(|t| t.level == Some(ConfidentialityLevel::Confidential)));

        let status = pipeline.status().await.unwrap();
        assert_eq!((status.raw, status.enriched, status.indexed), (1, 1, 1));
        assert_eq!(status.pending_enrich + status.pending_index, 0);
    }

    #[tokio::test]
    async fn audit_flags_a_loosened_tier() {
        let (pipeline, id) = pipeline_with(b"text", Some("highly_confidential")).await;
        pipeline.run_all().await.unwrap();

        let mut doc = pipeline.store().get(Tier::Indexed, &id).await.unwrap();
        for entry in &mut doc.entries {
            let mut meta = for_tier(entry.metadata.as_ref().unwrap(), Tier::Indexed);
            meta.confidentiality_level = ConfidentialityLevel::Public;
            entry.metadata = Some(meta);
        }
        pipeline
            .store()
            .put(Tier::Indexed, &id, doc.entries)
            .await
            .unwrap();

        let audit = pipeline.audit(&id).await.unwrap();
        assert!(!audit.is_clean());
        assert!(audit.violations[0].contains("lower than"));
    }

    #[tokio::test]
    async fn audit_flags_a_looser_tier_from_an_older_revision() {
        let (pipeline, id) = pipeline_with(b"draft", Some("public")).await;
        pipeline.run_all().await.unwrap();
        let indexed = pipeline.store().get(Tier::Indexed, &id).await.unwrap();

        let mut meta = pipeline
            .store()
            .get(Tier::Raw, &id)
            .await
            .unwrap()
            .primary()
            .1
            .cloned()
            .unwrap();
        meta.confidentiality_level = ConfidentialityLevel::Confidential;
        let raw = TierEntry::raw(b"final".to_vec(), Some(meta));
        pipeline.store().put(Tier::Raw, &id, vec![raw]).await.unwrap();
        // Simulates an Indexed write racing the re-ingest.
        pipeline
            .store()
            .put(Tier::Indexed, &id, indexed.entries)
            .await
            .unwrap();

        let audit = pipeline.audit(&id).await.unwrap();
        assert!(audit.stale);
        assert!(audit
            .violations
            .iter()
            .any(|v| v == "indexed level public is lower than raw level confidential"));
    }

    #[tokio::test]
    async fn purge_removes_every_tier() {
        let (pipeline, id) = pipeline_with(b"text", None).await;
        pipeline.run_all().await.unwrap();

        let purge = pipeline.purge(&id).await.unwrap();
        assert_eq!(purge.removed_from, vec![Tier::Indexed, Tier::Enriched, Tier::Raw]);
        let status = pipeline.status().await.unwrap();
        assert_eq!((status.raw, status.enriched, status.indexed), (0, 0, 0));
        assert!(pipeline.audit_all().await.unwrap().is_empty());
    }
}
