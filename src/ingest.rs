//! Ingestion endpoint and bulk-synchronization contract.
//!
//! Both entry points synthesize a complete metadata record and write it
//! with the payload to the Raw tier in one put. Before writing, the
//! downgrade guard compares the requested level with the level the
//! document already holds: lowering it fails with
//! [`GovernanceError::UnauthorizedDowngrade`] unless the caller passes
//! [`IngestOptions::allow_downgrade`]. That flag is the only way a
//! classification ever loosens.
//!
//! A new Raw revision retires the document's Enriched and Indexed entries
//! before it is written, so nothing derived from an older revision stays
//! searchable at an older level. Re-uploading the current revision
//! unchanged is a no-op, and a record's `uploaded_at` survives re-uploads
//! that do not supply one.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{GovernanceError, Result};
use crate::metadata::{storage_path, validate_doc_id, Synthesizer};
use crate::models::{ConfidentialityLevel, MetadataRecord, PartialMetadata, Tier, TierEntry};
use crate::store::{Store, StoredDocument};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestOptions {
    /// Explicit authorization to lower an existing classification.
    pub allow_downgrade: bool,
}

/// Result of a successful Raw write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestReceipt {
    pub doc_id: String,
    /// `None` for content written without a companion record.
    pub metadata: Option<MetadataRecord>,
    /// A previous Raw revision was overwritten.
    pub replaced: bool,
    /// The write lowered an existing classification under authorization.
    pub downgraded: bool,
    /// The upload matched the current Raw revision; nothing was written.
    pub unchanged: bool,
}

/// Which parts of the record the caller supplied rather than defaulted.
#[derive(Debug, Clone, Copy)]
struct Supplied {
    level: bool,
    uploaded_at: bool,
}

impl Supplied {
    fn from_attrs(attrs: &PartialMetadata, hint: Option<&str>) -> Self {
        Self {
            level: attrs.confidentiality_level.is_some() || hint.is_some(),
            uploaded_at: attrs.uploaded_at.is_some(),
        }
    }
}

pub struct Ingestor {
    store: Arc<dyn Store>,
    synthesizer: Synthesizer,
}

impl Ingestor {
    pub fn new(store: Arc<dyn Store>, synthesizer: Synthesizer) -> Self {
        Self { store, synthesizer }
    }

    pub fn synthesizer(&self) -> &Synthesizer {
        &self.synthesizer
    }

    /// Ingestion-endpoint upload: synthesize, guard, put to Raw.
    ///
    /// Nothing is written when synthesis fails.
    pub async fn ingest(
        &self,
        payload: Option<&[u8]>,
        attrs: &PartialMetadata,
        options: IngestOptions,
    ) -> Result<IngestReceipt> {
        let meta = self.synthesizer.synthesize(payload, attrs)?;
        self.write(payload, meta, Supplied::from_attrs(attrs, None), options)
            .await
    }

    /// Bulk-sync contract: as [`ingest`](Self::ingest), plus a source-system
    /// classification hint validated by the same rules as an attribute.
    pub async fn ingest_synced(
        &self,
        payload: Option<&[u8]>,
        attrs: &PartialMetadata,
        hint: Option<&str>,
        options: IngestOptions,
    ) -> Result<IngestReceipt> {
        let meta = self.synthesizer.synthesize_with_hint(payload, attrs, hint)?;
        self.write(payload, meta, Supplied::from_attrs(attrs, hint), options)
            .await
    }

    /// Out-of-band upload without a companion record. The Raw→Enriched
    /// stage synthesizes full defaults for it.
    pub async fn ingest_unlabeled(
        &self,
        doc_id: &str,
        payload: &[u8],
        options: IngestOptions,
    ) -> Result<IngestReceipt> {
        let doc_id = validate_doc_id(doc_id)?;
        let previous = self.current_raw(&doc_id).await?;
        let entry = TierEntry::raw(payload.to_vec(), None);
        let requested = self.synthesizer.defaults().confidentiality_level;
        let supplied = Supplied {
            level: false,
            uploaded_at: false,
        };
        self.put_raw(&doc_id, entry, requested, supplied, previous, options)
            .await
    }

    async fn write(
        &self,
        payload: Option<&[u8]>,
        mut meta: MetadataRecord,
        supplied: Supplied,
        options: IngestOptions,
    ) -> Result<IngestReceipt> {
        let payload = payload.ok_or(GovernanceError::MissingPayload)?;
        let doc_id = meta.doc_id.clone();
        let previous = self.current_raw(&doc_id).await?;

        if !supplied.uploaded_at {
            if let Some(prev) = previous.as_ref().and_then(|d| d.primary().1) {
                meta.uploaded_at = prev.uploaded_at;
                meta.storage_path = storage_path(Tier::Raw, prev.uploaded_at, &doc_id);
            }
        }

        let requested = meta.confidentiality_level;
        let entry = TierEntry::raw(payload.to_vec(), Some(meta));
        self.put_raw(&doc_id, entry, requested, supplied, previous, options)
            .await
    }

    async fn put_raw(
        &self,
        doc_id: &str,
        entry: TierEntry,
        requested: ConfidentialityLevel,
        supplied: Supplied,
        previous: Option<StoredDocument>,
        options: IngestOptions,
    ) -> Result<IngestReceipt> {
        let metadata = entry.metadata.clone();
        let unchanged = previous
            .as_ref()
            .and_then(|d| d.entries.first())
            .map_or(false, |e| e.upstream_hash == entry.upstream_hash);
        if unchanged {
            debug!(doc_id, "raw revision unchanged");
            return Ok(IngestReceipt {
                doc_id: doc_id.to_string(),
                metadata,
                replaced: false,
                downgraded: false,
                unchanged: true,
            });
        }

        let mut downgraded = false;
        if let Some(current) = self
            .guarded_level(doc_id, previous.as_ref(), supplied.level)
            .await?
        {
            if requested < current {
                if !options.allow_downgrade {
                    warn!(doc_id, existing = %current, requested = %requested, "downgrade refused");
                    return Err(GovernanceError::UnauthorizedDowngrade {
                        doc_id: doc_id.to_string(),
                        existing: current,
                        requested,
                    });
                }
                downgraded = true;
                warn!(doc_id, existing = %current, requested = %requested, "authorized downgrade");
            }
        }

        // Downstream first: if the Raw put fails, the document is merely
        // reprocessed from the old revision.
        let mut retired = Vec::new();
        for tier in [Tier::Indexed, Tier::Enriched] {
            if self.store.delete(tier, doc_id).await? {
                retired.push(tier.as_str());
            }
        }
        self.store.put(Tier::Raw, doc_id, vec![entry]).await?;
        for tier in [Tier::Enriched, Tier::Indexed] {
            self.store.clear_failure(doc_id, tier).await?;
        }

        info!(
            doc_id,
            level = %requested,
            replaced = previous.is_some(),
            retired = ?retired,
            companion = metadata.is_some(),
            "ingested"
        );
        Ok(IngestReceipt {
            doc_id: doc_id.to_string(),
            metadata,
            replaced: previous.is_some(),
            downgraded,
            unchanged: false,
        })
    }

    async fn current_raw(&self, doc_id: &str) -> Result<Option<StoredDocument>> {
        match self.store.get(Tier::Raw, doc_id).await {
            Ok(doc) => Ok(Some(doc)),
            Err(GovernanceError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// The level a new revision may not fall below without authorization.
    ///
    /// An explicitly labeled upload is held to the strictest level in any
    /// tier. An upload that leaves its level to defaults is held to the Raw
    /// record only: a level the policy raised downstream is derived from
    /// content, and the policy re-evaluates the new content.
    async fn guarded_level(
        &self,
        doc_id: &str,
        previous: Option<&StoredDocument>,
        explicit: bool,
    ) -> Result<Option<ConfidentialityLevel>> {
        let mut strictest =
            previous.and_then(|d| d.entries.iter().filter_map(TierEntry::level).max());
        if explicit {
            for tier in [Tier::Enriched, Tier::Indexed] {
                match self.store.get(tier, doc_id).await {
                    Ok(doc) => {
                        let level = doc.entries.iter().filter_map(TierEntry::level).max();
                        strictest = strictest.max(level);
                    }
                    Err(GovernanceError::NotFound { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(strictest)
    }
}
