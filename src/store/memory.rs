//! In-memory [`Store`] implementation for tests and ephemeral runs.
//!
//! Uses `BTreeMap`s behind `std::sync::RwLock`. A put swaps the whole entry
//! set under the write lock, so readers see either the old set or the new
//! one.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{GovernanceError, Result};
use crate::models::{FailureRecord, Tier, TierEntry};

use super::{summarize, validate_entries, Listing, Predicate, Store, StoredDocument};

type TierMap = BTreeMap<String, Vec<TierEntry>>;

/// In-memory store.
pub struct InMemoryStore {
    tiers: RwLock<HashMap<Tier, TierMap>>,
    failures: RwLock<BTreeMap<(String, Tier), FailureRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            tiers: RwLock::new(HashMap::new()),
            failures: RwLock::new(BTreeMap::new()),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<T>(_: PoisonError<T>) -> GovernanceError {
    GovernanceError::StoreUnavailable("in-memory store lock poisoned".to_string())
}

#[async_trait]
impl Store for InMemoryStore {
    async fn put(&self, tier: Tier, doc_id: &str, mut entries: Vec<TierEntry>) -> Result<()> {
        validate_entries(doc_id, &mut entries)?;
        let mut tiers = self.tiers.write().map_err(poisoned)?;
        tiers
            .entry(tier)
            .or_default()
            .insert(doc_id.to_string(), entries);
        Ok(())
    }

    async fn get(&self, tier: Tier, doc_id: &str) -> Result<StoredDocument> {
        let tiers = self.tiers.read().map_err(poisoned)?;
        tiers
            .get(&tier)
            .and_then(|docs| docs.get(doc_id))
            .map(|entries| StoredDocument {
                tier,
                doc_id: doc_id.to_string(),
                entries: entries.clone(),
            })
            .ok_or_else(|| GovernanceError::NotFound {
                tier,
                doc_id: doc_id.to_string(),
            })
    }

    async fn list(&self, tier: Tier, predicate: Predicate) -> Result<Listing> {
        let tiers = self.tiers.read().map_err(poisoned)?;
        let docs = tiers
            .get(&tier)
            .map(|docs| {
                docs.iter()
                    .map(|(doc_id, entries)| summarize(doc_id, entries))
                    .collect()
            })
            .unwrap_or_default();
        Ok(Listing::new(docs, predicate))
    }

    async fn delete(&self, tier: Tier, doc_id: &str) -> Result<bool> {
        let mut tiers = self.tiers.write().map_err(poisoned)?;
        Ok(tiers
            .get_mut(&tier)
            .map(|docs| docs.remove(doc_id).is_some())
            .unwrap_or(false))
    }

    async fn record_failure(
        &self,
        doc_id: &str,
        tier: Tier,
        reason: &str,
    ) -> Result<FailureRecord> {
        let mut failures = self.failures.write().map_err(poisoned)?;
        let record = failures
            .entry((doc_id.to_string(), tier))
            .and_modify(|r| {
                r.reason = reason.to_string();
                r.failed_at = Utc::now();
                r.attempts += 1;
            })
            .or_insert_with(|| FailureRecord {
                doc_id: doc_id.to_string(),
                tier,
                reason: reason.to_string(),
                failed_at: Utc::now(),
                attempts: 1,
            });
        Ok(record.clone())
    }

    async fn clear_failure(&self, doc_id: &str, tier: Tier) -> Result<()> {
        let mut failures = self.failures.write().map_err(poisoned)?;
        failures.remove(&(doc_id.to_string(), tier));
        Ok(())
    }

    async fn list_failures(&self) -> Result<Vec<FailureRecord>> {
        let failures = self.failures.read().map_err(poisoned)?;
        Ok(failures.values().cloned().collect())
    }
}
