//! SQLite-backed [`Store`] implementation.
//!
//! Every tier lives in one `tier_entries` table keyed by
//! `(tier, doc_id, entry_index)`. A put deletes and re-inserts a
//! document's entry set inside one transaction; with WAL journaling,
//! concurrent readers see either the previous set or the new one.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::error::{GovernanceError, Result};
use crate::models::{FailureRecord, MetadataRecord, Representation, Tier, TierEntry};

use super::{summarize, validate_entries, ListedDoc, Listing, Predicate, Store, StoredDocument};

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `path` and apply the schema.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                GovernanceError::StoreUnavailable(format!(
                    "cannot create {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Create tables and indexes. Idempotent.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tier_entries (
                tier TEXT NOT NULL,
                doc_id TEXT NOT NULL,
                entry_index INTEGER NOT NULL,
                content BLOB NOT NULL,
                metadata_json TEXT,
                representation_json TEXT,
                upstream_hash TEXT NOT NULL,
                written_at INTEGER NOT NULL,
                PRIMARY KEY (tier, doc_id, entry_index)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS failures (
                doc_id TEXT NOT NULL,
                tier TEXT NOT NULL,
                reason TEXT NOT NULL,
                failed_at TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                PRIMARY KEY (doc_id, tier)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_tier_entries_tier_doc ON tier_entries(tier, doc_id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn encode_metadata(meta: Option<&MetadataRecord>) -> Result<Option<String>> {
    meta.map(serde_json::to_string).transpose().map_err(Into::into)
}

fn decode_metadata(json: Option<String>) -> Result<Option<MetadataRecord>> {
    json.as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(Into::into)
}

fn decode_representation(json: Option<String>) -> Result<Option<Representation>> {
    json.as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(Into::into)
}

fn decode_tier(value: &str) -> Result<Tier> {
    value
        .parse()
        .map_err(|_| GovernanceError::StoreUnavailable(format!("unknown tier '{}' in store", value)))
}

#[async_trait]
impl Store for SqliteStore {
    async fn put(&self, tier: Tier, doc_id: &str, mut entries: Vec<TierEntry>) -> Result<()> {
        validate_entries(doc_id, &mut entries)?;
        let now = Utc::now().timestamp();

        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM tier_entries WHERE tier = ? AND doc_id = ?")
            .bind(tier.as_str())
            .bind(doc_id)
            .execute(&mut *tx)
            .await?;

        for entry in &entries {
            let representation_json = entry
                .representation
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            sqlx::query(
                r#"
                INSERT INTO tier_entries (tier, doc_id, entry_index, content, metadata_json,
                                          representation_json, upstream_hash, written_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(tier.as_str())
            .bind(doc_id)
            .bind(entry.index as i64)
            .bind(entry.content.as_slice())
            .bind(encode_metadata(entry.metadata.as_ref())?)
            .bind(representation_json)
            .bind(&entry.upstream_hash)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, tier: Tier, doc_id: &str) -> Result<StoredDocument> {
        let rows = sqlx::query(
            r#"
            SELECT entry_index, content, metadata_json, representation_json, upstream_hash
            FROM tier_entries
            WHERE tier = ? AND doc_id = ?
            ORDER BY entry_index
            "#,
        )
        .bind(tier.as_str())
        .bind(doc_id)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Err(GovernanceError::NotFound {
                tier,
                doc_id: doc_id.to_string(),
            });
        }

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let index: i64 = row.try_get("entry_index")?;
            entries.push(TierEntry {
                index: index as u32,
                content: row.try_get("content")?,
                metadata: decode_metadata(row.try_get("metadata_json")?)?,
                representation: decode_representation(row.try_get("representation_json")?)?,
                upstream_hash: row.try_get("upstream_hash")?,
            });
        }

        Ok(StoredDocument {
            tier,
            doc_id: doc_id.to_string(),
            entries,
        })
    }

    async fn list(&self, tier: Tier, predicate: Predicate) -> Result<Listing> {
        // One statement, so the snapshot is consistent under WAL.
        let rows = sqlx::query(
            r#"
            SELECT doc_id, entry_index, metadata_json, upstream_hash
            FROM tier_entries
            WHERE tier = ?
            ORDER BY doc_id, entry_index
            "#,
        )
        .bind(tier.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut docs: Vec<ListedDoc> = Vec::new();
        let mut current: Option<(String, Vec<TierEntry>)> = None;

        for row in rows {
            let doc_id: String = row.try_get("doc_id")?;
            let index: i64 = row.try_get("entry_index")?;
            let entry = TierEntry {
                index: index as u32,
                content: Vec::new(),
                metadata: if index == 0 {
                    decode_metadata(row.try_get("metadata_json")?)?
                } else {
                    None
                },
                representation: None,
                upstream_hash: row.try_get("upstream_hash")?,
            };

            match current.as_mut() {
                Some((id, entries)) if *id == doc_id => entries.push(entry),
                _ => {
                    if let Some((id, entries)) = current.take() {
                        docs.push(summarize(&id, &entries));
                    }
                    current = Some((doc_id, vec![entry]));
                }
            }
        }
        if let Some((id, entries)) = current.take() {
            docs.push(summarize(&id, &entries));
        }

        Ok(Listing::new(docs, predicate))
    }

    async fn delete(&self, tier: Tier, doc_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM tier_entries WHERE tier = ? AND doc_id = ?")
            .bind(tier.as_str())
            .bind(doc_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_failure(
        &self,
        doc_id: &str,
        tier: Tier,
        reason: &str,
    ) -> Result<FailureRecord> {
        let failed_at = Utc::now();
        let attempts: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO failures (doc_id, tier, reason, failed_at, attempts)
            VALUES (?, ?, ?, ?, 1)
            ON CONFLICT(doc_id, tier) DO UPDATE SET
                reason = excluded.reason,
                failed_at = excluded.failed_at,
                attempts = failures.attempts + 1
            RETURNING attempts
            "#,
        )
        .bind(doc_id)
        .bind(tier.as_str())
        .bind(reason)
        .bind(failed_at.to_rfc3339())
        .fetch_one(&self.pool)
        .await?;

        Ok(FailureRecord {
            doc_id: doc_id.to_string(),
            tier,
            reason: reason.to_string(),
            failed_at,
            attempts: attempts as u32,
        })
    }

    async fn clear_failure(&self, doc_id: &str, tier: Tier) -> Result<()> {
        sqlx::query("DELETE FROM failures WHERE doc_id = ? AND tier = ?")
            .bind(doc_id)
            .bind(tier.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_failures(&self) -> Result<Vec<FailureRecord>> {
        let rows = sqlx::query(
            "SELECT doc_id, tier, reason, failed_at, attempts FROM failures ORDER BY doc_id, tier",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let tier: String = row.try_get("tier")?;
            let failed_at: String = row.try_get("failed_at")?;
            let attempts: i64 = row.try_get("attempts")?;
            records.push(FailureRecord {
                doc_id: row.try_get("doc_id")?,
                tier: decode_tier(&tier)?,
                reason: row.try_get("reason")?,
                failed_at: DateTime::parse_from_rfc3339(&failed_at)
                    .map(|ts| ts.with_timezone(&Utc))
                    .map_err(|e| GovernanceError::StoreUnavailable(e.to_string()))?,
                attempts: attempts as u32,
            });
        }
        Ok(records)
    }

    async fn count(&self, tier: Tier) -> Result<usize> {
        let n: i64 =
            sqlx::query_scalar("SELECT COUNT(DISTINCT doc_id) FROM tier_entries WHERE tier = ?")
                .bind(tier.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(n as usize)
    }

    /// Checkpoints the WAL and releases pooled connections.
    async fn close(&self) {
        self.pool.close().await;
    }
}
