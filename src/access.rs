//! Access filter over the Indexed tier.
//!
//! Every read of Indexed records goes through [`AccessFilter`]. The
//! caller's [`Authorization`] is applied as a mandatory pre-filter inside
//! the store listing predicate, before any query predicate or ranking, and
//! again on each chunk that is returned.
//!
//! The filter fails closed: an [`Authorization::Indeterminate`] set, an
//! unknown level name or a chunk without metadata yields nothing, never an
//! error and never a partial leak.
//!
//! The current Raw revision is a floor. A chunk labeled below its
//! document's Raw level descends from an older, looser revision and is
//! never returned, nor is a chunk whose document has left the Raw tier.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::error::{GovernanceError, Result};
use crate::models::{ConfidentialityLevel, MetadataRecord, Representation, Tier, TierEntry};
use crate::representation::{cosine_similarity, tokenize};
use crate::store::{accept_all, ListedDoc, Predicate, Store};

const SNIPPET_CHARS: usize = 240;

/// The caller's resolved access-level set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    Resolved(BTreeSet<ConfidentialityLevel>),
    /// The set could not be determined. Nothing is visible.
    Indeterminate,
}

impl Authorization {
    /// Resolve level names. Any unparsable name, or no names at all,
    /// makes the whole set indeterminate.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut levels = BTreeSet::new();
        for name in names {
            match name.as_ref().parse::<ConfidentialityLevel>() {
                Ok(level) => {
                    levels.insert(level);
                }
                Err(_) => return Authorization::Indeterminate,
            }
        }
        if levels.is_empty() {
            Authorization::Indeterminate
        } else {
            Authorization::Resolved(levels)
        }
    }

    /// Every level up to and including `ceiling`.
    pub fn up_to(ceiling: ConfidentialityLevel) -> Self {
        Authorization::Resolved(
            ConfidentialityLevel::ALL
                .into_iter()
                .filter(|l| *l <= ceiling)
                .collect(),
        )
    }

    pub fn permits(&self, level: ConfidentialityLevel) -> bool {
        match self {
            Authorization::Resolved(levels) => levels.contains(&level),
            Authorization::Indeterminate => false,
        }
    }

    fn permits_entry(&self, entry: &TierEntry) -> bool {
        entry.level().map(|l| self.permits(l)).unwrap_or(false)
    }
}

/// Query predicate applied after the classification pre-filter.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    /// Keyword terms; chunks are ranked by how many terms they contain.
    pub text: Option<String>,
    pub document_type: Option<String>,
    pub source: Option<String>,
    /// Documents must carry every listed tag.
    pub tags: BTreeSet<String>,
    /// Rank by cosine similarity against vector representations instead.
    pub vector: Option<Vec<f32>>,
    pub limit: usize,
}

impl Default for Query {
    fn default() -> Self {
        Self {
            text: None,
            document_type: None,
            source: None,
            tags: BTreeSet::new(),
            vector: None,
            limit: 10,
        }
    }
}

impl Query {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    fn matches_metadata(&self, meta: &MetadataRecord) -> bool {
        self.document_type
            .as_ref()
            .map_or(true, |t| &meta.document_type == t)
            && self.source.as_ref().map_or(true, |s| &meta.source == s)
            && self.tags.is_subset(&meta.tags)
    }

    fn terms(&self) -> Vec<String> {
        self.text
            .as_deref()
            .map(|t| tokenize(t).collect())
            .unwrap_or_default()
    }
}

/// One Indexed chunk the caller is allowed to see.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexedHit {
    pub doc_id: String,
    pub chunk_index: u32,
    pub score: f64,
    pub snippet: String,
    pub metadata: MetadataRecord,
}

impl IndexedHit {
    fn from_entry(doc_id: &str, entry: &TierEntry, meta: &MetadataRecord, score: f64) -> Self {
        let snippet = String::from_utf8_lossy(&entry.content)
            .chars()
            .take(SNIPPET_CHARS)
            .collect();
        Self {
            doc_id: doc_id.to_string(),
            chunk_index: entry.index,
            score,
            snippet,
            metadata: meta.clone(),
        }
    }
}

pub struct AccessFilter {
    store: Arc<dyn Store>,
}

impl AccessFilter {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Ranked Indexed chunks visible to `auth` and matching `query`.
    ///
    /// With a query vector, chunks are ranked by cosine similarity; with
    /// keyword text, by the number of query terms they contain (chunks
    /// with none are dropped); with neither, every visible chunk matching
    /// the metadata filters is returned with score 0.
    pub async fn search(&self, auth: &Authorization, query: &Query) -> Result<Vec<IndexedHit>> {
        if matches!(auth, Authorization::Indeterminate) {
            debug!("indeterminate authorization; returning no records");
            return Ok(Vec::new());
        }

        let predicate = {
            let auth = auth.clone();
            let query = query.clone();
            let predicate: Predicate = Arc::new(move |doc: &ListedDoc| {
                doc.metadata.as_ref().map_or(false, |meta| {
                    auth.permits(meta.confidentiality_level) && query.matches_metadata(meta)
                })
            });
            predicate
        };
        let listing = self.store.list(Tier::Indexed, predicate).await?;
        let floors: BTreeMap<String, Option<ConfidentialityLevel>> = self
            .store
            .list(Tier::Raw, accept_all())
            .await?
            .iter()
            .map(|raw| {
                let level = raw.metadata.as_ref().map(|m| m.confidentiality_level);
                (raw.doc_id.clone(), level)
            })
            .collect();

        let terms = query.terms();
        let mut hits = Vec::new();
        for listed in listing.iter() {
            let Some(&floor) = floors.get(&listed.doc_id) else {
                debug!(doc_id = %listed.doc_id, "indexed document has no raw revision; skipped");
                continue;
            };
            let doc = match self.store.get(Tier::Indexed, &listed.doc_id).await {
                Ok(doc) => doc,
                Err(GovernanceError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            };

            for entry in &doc.entries {
                if !auth.permits_entry(entry) {
                    continue;
                }
                if !meets_floor(entry, floor) {
                    debug!(doc_id = %doc.doc_id, chunk = entry.index, "chunk below raw level; skipped");
                    continue;
                }
                let Some(meta) = entry.metadata.as_ref() else {
                    continue;
                };
                if let Some(score) = score_entry(entry, query.vector.as_deref(), &terms) {
                    hits.push(IndexedHit::from_entry(&doc.doc_id, entry, meta, score));
                }
            }
        }

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.doc_id.cmp(&b.doc_id))
                .then_with(|| a.chunk_index.cmp(&b.chunk_index))
        });
        hits.truncate(query.limit);
        debug!(hits = hits.len(), "search complete");
        Ok(hits)
    }

    /// All chunks of one Indexed document, or `None` when it is absent or
    /// the caller may not see it. The two cases are indistinguishable.
    pub async fn fetch(&self, auth: &Authorization, doc_id: &str) -> Result<Option<Vec<IndexedHit>>> {
        if matches!(auth, Authorization::Indeterminate) {
            return Ok(None);
        }
        let doc = match self.store.get(Tier::Indexed, doc_id).await {
            Ok(doc) => doc,
            Err(GovernanceError::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        let floor = match self.store.get(Tier::Raw, doc_id).await {
            Ok(raw) => raw.entries.iter().filter_map(TierEntry::level).max(),
            Err(GovernanceError::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        if !doc
            .entries
            .iter()
            .all(|e| auth.permits_entry(e) && meets_floor(e, floor))
        {
            return Ok(None);
        }

        Ok(Some(
            doc.entries
                .iter()
                .filter_map(|entry| {
                    entry
                        .metadata
                        .as_ref()
                        .map(|meta| IndexedHit::from_entry(doc_id, entry, meta, 0.0))
                })
                .collect(),
        ))
    }
}

/// An entry without a Raw level to compare against has no floor.
fn meets_floor(entry: &TierEntry, floor: Option<ConfidentialityLevel>) -> bool {
    match (entry.level(), floor) {
        (Some(level), Some(floor)) => level >= floor,
        (_, None) => true,
        (None, Some(_)) => false,
    }
}

fn score_entry(entry: &TierEntry, vector: Option<&[f32]>, terms: &[String]) -> Option<f64> {
    if let Some(q) = vector {
        return match &entry.representation {
            Some(Representation::Vector(v)) => Some(cosine_similarity(q, v) as f64),
            _ => None,
        };
    }
    if terms.is_empty() {
        return Some(0.0);
    }
    let words: BTreeSet<String> = tokenize(&String::from_utf8_lossy(&entry.content)).collect();
    let matches = terms.iter().filter(|t| words.contains(*t)).count();
    (matches > 0).then_some(matches as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{for_tier, Synthesizer};
    use crate::representation::HashingEmbedder;
    use crate::store::memory::InMemoryStore;
    use chrono::Utc;

    async fn seed(store: &Arc<dyn Store>, doc_id: &str, level: ConfidentialityLevel, text: &str) {
        let mut meta = for_tier(
            &Synthesizer::default().fill_missing(doc_id, Utc::now()),
            Tier::Indexed,
        );
        meta.confidentiality_level = level;
        meta.document_type = if level == ConfidentialityLevel::Public {
            "memo".to_string()
        } else {
            "report".to_string()
        };
        seed_raw(store, doc_id, level, text).await;
        let entry = TierEntry {
            index: 0,
            content: text.as_bytes().to_vec(),
            metadata: Some(meta),
            representation: Some(Representation::Vector(HashingEmbedder::new(64).embed(text))),
            upstream_hash: "rev".to_string(),
        };
        store.put(Tier::Indexed, doc_id, vec![entry]).await.unwrap();
    }

    async fn seed_raw(store: &Arc<dyn Store>, doc_id: &str, level: ConfidentialityLevel, text: &str) {
        let mut meta = Synthesizer::default().fill_missing(doc_id, Utc::now());
        meta.confidentiality_level = level;
        let raw = TierEntry::raw(text.as_bytes().to_vec(), Some(meta));
        store.put(Tier::Raw, doc_id, vec![raw]).await.unwrap();
    }

    async fn corpus() -> AccessFilter {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        seed(&store, "pub", ConfidentialityLevel::Public, "budget overview for everyone").await;
        seed(&store, "int", ConfidentialityLevel::Internal, "budget planning internal").await;
        seed(&store, "conf", ConfidentialityLevel::Confidential, "budget salaries").await;
        seed(&store, "hc", ConfidentialityLevel::HighlyConfidential, "budget merger plans").await;
        AccessFilter::new(store)
    }

    fn ids(hits: &[IndexedHit]) -> Vec<&str> {
        let mut ids: Vec<&str> = hits.iter().map(|h| h.doc_id.as_str()).collect();
        ids.sort();
        ids
    }

    #[test]
    fn authorization_resolution_fails_closed() {
        assert_eq!(Authorization::from_names(Vec::<String>::new()), Authorization::Indeterminate);
        assert_eq!(
            Authorization::from_names(["public", "top-secret"]),
            Authorization::Indeterminate
        );
        let auth = Authorization::from_names(["public", "Internal"]);
        assert!(auth.permits(ConfidentialityLevel::Internal));
        assert!(!auth.permits(ConfidentialityLevel::Confidential));
        assert!(Authorization::up_to(ConfidentialityLevel::Internal).permits(ConfidentialityLevel::Public));
    }

    #[tokio::test]
    async fn public_caller_sees_only_public() {
        let filter = corpus().await;
        let auth = Authorization::from_names(["public"]);
        let hits = filter.search(&auth, &Query::default()).await.unwrap();
        assert_eq!(ids(&hits), vec!["pub"]);

        let hits = filter.search(&auth, &Query::text("budget")).await.unwrap();
        assert_eq!(ids(&hits), vec!["pub"]);
    }

    #[tokio::test]
    async fn resolved_set_is_exact_not_a_ceiling() {
        let filter = corpus().await;
        let auth = Authorization::from_names(["public", "confidential"]);
        let hits = filter.search(&auth, &Query::text("budget")).await.unwrap();
        assert_eq!(ids(&hits), vec!["conf", "pub"]);
    }

    #[tokio::test]
    async fn indeterminate_returns_empty_not_error() {
        let filter = corpus().await;
        let hits = filter
            .search(&Authorization::Indeterminate, &Query::default())
            .await
            .unwrap();
        assert!(hits.is_empty());
        assert!(filter
            .fetch(&Authorization::Indeterminate, "pub")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn classification_applies_before_query_filters() {
        let filter = corpus().await;
        let query = Query {
            document_type: Some("report".to_string()),
            ..Default::default()
        };
        let hits = filter
            .search(&Authorization::from_names(["public"]), &query)
            .await
            .unwrap();
        assert!(hits.is_empty());

        let hits = filter
            .search(&Authorization::up_to(ConfidentialityLevel::HighlyConfidential), &query)
            .await
            .unwrap();
        assert_eq!(ids(&hits), vec!["conf", "hc", "int"]);
    }

    #[tokio::test]
    async fn keyword_ranking_and_limit() {
        let filter = corpus().await;
        let auth = Authorization::up_to(ConfidentialityLevel::HighlyConfidential);
        let query = Query {
            text: Some("budget merger".to_string()),
            limit: 2,
            ..Default::default()
        };
        let hits = filter.search(&auth, &query).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].doc_id, "hc");
        assert_eq!(hits[0].score, 2.0);
    }

    #[tokio::test]
    async fn vector_ranking() {
        let filter = corpus().await;
        let auth = Authorization::up_to(ConfidentialityLevel::HighlyConfidential);
        let query = Query {
            vector: Some(HashingEmbedder::new(64).embed("budget salaries")),
            ..Default::default()
        };
        let hits = filter.search(&auth, &query).await.unwrap();
        assert_eq!(hits[0].doc_id, "conf");
    }

    #[tokio::test]
    async fn fetch_hides_unauthorized_documents() {
        let filter = corpus().await;
        let public = Authorization::from_names(["public"]);
        assert!(filter.fetch(&public, "conf").await.unwrap().is_none());
        assert!(filter.fetch(&public, "missing").await.unwrap().is_none());
        let hits = filter.fetch(&public, "pub").await.unwrap().unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].metadata.confidentiality_level, ConfidentialityLevel::Public);
    }

    #[tokio::test]
    async fn chunks_below_the_raw_level_are_withheld() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        seed(&store, "d1", ConfidentialityLevel::Public, "merger rumours").await;
        seed(&store, "d2", ConfidentialityLevel::Public, "merger timeline").await;
        // d1 was re-classified upstream; its Indexed chunks predate that.
        seed_raw(&store, "d1", ConfidentialityLevel::HighlyConfidential, "merger rumours").await;
        store.delete(Tier::Raw, "d2").await.unwrap();

        let filter = AccessFilter::new(store);
        let everyone = Authorization::up_to(ConfidentialityLevel::HighlyConfidential);
        let hits = filter.search(&everyone, &Query::text("merger")).await.unwrap();
        assert!(hits.is_empty());
        assert!(filter.fetch(&everyone, "d1").await.unwrap().is_none());
        assert!(filter.fetch(&everyone, "d2").await.unwrap().is_none());
    }
}
