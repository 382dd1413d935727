//! Layered storage abstraction.
//!
//! The [`Store`] trait holds the three tiers (Raw, Enriched, Indexed) plus
//! the failure ledger. Each tier maps a `doc_id` to an ordered set of
//! [`TierEntry`]s: one entry for a Raw document, one per chunk in the
//! Enriched and Indexed tiers.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//!
//! # Guarantees
//!
//! - [`put`](Store::put) replaces the whole entry set for `(tier, doc_id)`
//!   atomically. Re-putting the same id overwrites, never appends, and no
//!   reader observes a half-written set.
//! - A completed `put` is visible to every subsequent
//!   [`get`](Store::get) and [`list`](Store::list).
//! - [`list`](Store::list) takes a consistent snapshot; it is safe to run
//!   concurrently with `put` on the same tier.

pub mod memory;
pub mod sqlite;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::StoreConfig;
use crate::error::{GovernanceError, Result};
use crate::models::{FailureRecord, MetadataRecord, Tier, TierEntry};

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

/// Summary of one document within a tier, as produced by [`Store::list`].
#[derive(Debug, Clone, PartialEq)]
pub struct ListedDoc {
    pub doc_id: String,
    /// Metadata of the first entry. Every chunk of a document carries the
    /// same record, so this stands for all of them.
    pub metadata: Option<MetadataRecord>,
    pub entry_count: usize,
    /// `upstream_hash` of each entry, in index order.
    pub upstream_hashes: Vec<String>,
}

/// Filter applied to each [`ListedDoc`] while iterating a [`Listing`].
pub type Predicate = Arc<dyn Fn(&ListedDoc) -> bool + Send + Sync>;

/// Predicate matching every document.
pub fn accept_all() -> Predicate {
    Arc::new(|_: &ListedDoc| true)
}

/// A finite, restartable view of a tier.
///
/// The snapshot is taken when [`Store::list`] returns; the predicate is
/// evaluated lazily each time [`iter`](Listing::iter) is walked. Cloning a
/// listing is cheap and shares the snapshot.
#[derive(Clone)]
pub struct Listing {
    docs: Arc<Vec<ListedDoc>>,
    predicate: Predicate,
}

impl Listing {
    /// Build a listing. Documents are ordered by `doc_id`.
    pub fn new(mut docs: Vec<ListedDoc>, predicate: Predicate) -> Self {
        docs.sort_by(|a, b| a.doc_id.cmp(&b.doc_id));
        Self {
            docs: Arc::new(docs),
            predicate,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ListedDoc> + '_ {
        self.docs.iter().filter(move |d| (self.predicate)(*d))
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    pub fn doc_ids(&self) -> Vec<String> {
        self.iter().map(|d| d.doc_id.clone()).collect()
    }
}

impl fmt::Debug for Listing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listing")
            .field("snapshot_len", &self.docs.len())
            .finish()
    }
}

/// All entries stored for one document in one tier.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub tier: Tier,
    pub doc_id: String,
    /// Never empty; ordered by index.
    pub entries: Vec<TierEntry>,
}

impl StoredDocument {
    /// The `(content, metadata)` pair of the first entry.
    pub fn primary(&self) -> (&[u8], Option<&MetadataRecord>) {
        let entry = &self.entries[0];
        (&entry.content, entry.metadata.as_ref())
    }
}

/// Abstract tiered storage backend.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`put`](Store::put) | Atomically replace a document's entry set in a tier |
/// | [`get`](Store::get) | Fetch a document's entries, or `NotFound` |
/// | [`list`](Store::list) | Snapshot a tier, filtered by a predicate |
/// | [`delete`](Store::delete) | Remove a document (content and metadata together) |
/// | [`record_failure`](Store::record_failure) | Add or bump a failure ledger entry |
/// | [`clear_failure`](Store::clear_failure) | Drop a failure ledger entry |
/// | [`list_failures`](Store::list_failures) | Read the failure ledger |
/// | [`close`](Store::close) | Release backend resources on shutdown |
#[async_trait]
pub trait Store: Send + Sync {
    async fn put(&self, tier: Tier, doc_id: &str, entries: Vec<TierEntry>) -> Result<()>;

    async fn get(&self, tier: Tier, doc_id: &str) -> Result<StoredDocument>;

    async fn list(&self, tier: Tier, predicate: Predicate) -> Result<Listing>;

    /// Returns whether anything was removed.
    async fn delete(&self, tier: Tier, doc_id: &str) -> Result<bool>;

    /// Record that `doc_id` failed to advance into `tier`. Repeated
    /// failures overwrite the reason and increment `attempts`.
    async fn record_failure(&self, doc_id: &str, tier: Tier, reason: &str)
        -> Result<FailureRecord>;

    async fn clear_failure(&self, doc_id: &str, tier: Tier) -> Result<()>;

    async fn list_failures(&self) -> Result<Vec<FailureRecord>>;

    /// Number of documents in a tier.
    async fn count(&self, tier: Tier) -> Result<usize> {
        Ok(self.list(tier, accept_all()).await?.len())
    }

    /// Release backend resources. Further calls may fail afterwards.
    async fn close(&self) {}
}

/// Checks shared by every backend before a put: the set is non-empty,
/// indices are `0..n`, and every entry's metadata names `doc_id`.
pub(crate) fn validate_entries(doc_id: &str, entries: &mut [TierEntry]) -> Result<()> {
    if entries.is_empty() {
        return Err(GovernanceError::ValidationFailure {
            doc_id: doc_id.to_string(),
            reason: "empty entry set".to_string(),
        });
    }
    entries.sort_by_key(|e| e.index);
    for (expected, entry) in entries.iter().enumerate() {
        if entry.index as usize != expected {
            return Err(GovernanceError::ValidationFailure {
                doc_id: doc_id.to_string(),
                reason: format!("entry indices are not contiguous at {}", expected),
            });
        }
        if let Some(meta) = &entry.metadata {
            if meta.doc_id != doc_id {
                return Err(GovernanceError::ValidationFailure {
                    doc_id: doc_id.to_string(),
                    reason: format!("entry metadata names doc_id '{}'", meta.doc_id),
                });
            }
        }
    }
    Ok(())
}

/// Build the [`ListedDoc`] for a sorted, non-empty entry set.
pub(crate) fn summarize(doc_id: &str, entries: &[TierEntry]) -> ListedDoc {
    ListedDoc {
        doc_id: doc_id.to_string(),
        metadata: entries.first().and_then(|e| e.metadata.clone()),
        entry_count: entries.len(),
        upstream_hashes: entries.iter().map(|e| e.upstream_hash.clone()).collect(),
    }
}

/// Open the backend named by `[store].backend`.
pub async fn open_store(config: &StoreConfig) -> anyhow::Result<Arc<dyn Store>> {
    match config.backend.as_str() {
        "sqlite" => Ok(Arc::new(SqliteStore::open(&config.path).await?)),
        "memory" => Ok(Arc::new(InMemoryStore::new())),
        other => anyhow::bail!("Unknown store backend: '{}'", other),
    }
}
