//! Core data models used throughout the governance pipeline.
//!
//! These types represent the classification lattice, the storage tiers,
//! the per-document metadata record and the entries that flow from the
//! Raw tier through Enriched into Indexed.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::GovernanceError;

/// Access-restriction tag attached to every document and every chunk.
///
/// Variants are declared in increasing order of restriction, so the
/// derived `Ord` is the restriction order:
/// `Public < Internal < Confidential < HighlyConfidential`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidentialityLevel {
    Public,
    Internal,
    Confidential,
    HighlyConfidential,
}

impl ConfidentialityLevel {
    /// All levels, least restrictive first.
    pub const ALL: [ConfidentialityLevel; 4] = [
        ConfidentialityLevel::Public,
        ConfidentialityLevel::Internal,
        ConfidentialityLevel::Confidential,
        ConfidentialityLevel::HighlyConfidential,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfidentialityLevel::Public => "public",
            ConfidentialityLevel::Internal => "internal",
            ConfidentialityLevel::Confidential => "confidential",
            ConfidentialityLevel::HighlyConfidential => "highly_confidential",
        }
    }
}

impl fmt::Display for ConfidentialityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConfidentialityLevel {
    type Err = GovernanceError;

    /// Parses a level name. Case-insensitive; `-` and spaces are accepted
    /// in place of `_` (`"Highly-Confidential"` parses). Anything else is
    /// an [`GovernanceError::InvalidClassification`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "public" => Ok(ConfidentialityLevel::Public),
            "internal" => Ok(ConfidentialityLevel::Internal),
            "confidential" => Ok(ConfidentialityLevel::Confidential),
            "highly_confidential" => Ok(ConfidentialityLevel::HighlyConfidential),
            _ => Err(GovernanceError::InvalidClassification(s.to_string())),
        }
    }
}

/// One stage of the layered store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Raw,
    Enriched,
    Indexed,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Raw, Tier::Enriched, Tier::Indexed];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Raw => "raw",
            Tier::Enriched => "enriched",
            Tier::Indexed => "indexed",
        }
    }

    /// The tier a stage processor advances this tier into.
    pub fn next(&self) -> Option<Tier> {
        match self {
            Tier::Raw => Some(Tier::Enriched),
            Tier::Enriched => Some(Tier::Indexed),
            Tier::Indexed => None,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = GovernanceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "raw" => Ok(Tier::Raw),
            "enriched" => Ok(Tier::Enriched),
            "indexed" => Ok(Tier::Indexed),
            other => Err(GovernanceError::InvalidAttribute {
                key: "tier".to_string(),
                reason: format!("unknown tier '{}'", other),
            }),
        }
    }
}

/// Complete metadata record carried by a document at every tier.
///
/// Serialized as the JSON companion stored next to each document.
/// `title` is omitted when absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub doc_id: String,
    pub document_type: String,
    pub confidentiality_level: ConfidentialityLevel,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub language: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub uploaded_at: DateTime<Utc>,
    pub storage_path: String,
}

/// Caller-supplied attributes: any subset of the metadata fields.
///
/// `confidentiality_level` is kept as the raw string so that the
/// synthesizer, not the deserializer, decides whether it is valid.
/// `storage_path` is accepted so a persisted companion can be read back,
/// but it is always recomputed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialMetadata {
    #[serde(default)]
    pub doc_id: Option<String>,
    #[serde(default)]
    pub document_type: Option<String>,
    #[serde(default)]
    pub confidentiality_level: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub tags: Option<BTreeSet<String>>,
    #[serde(default)]
    pub uploaded_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub storage_path: Option<String>,
}

impl PartialMetadata {
    /// Parse a JSON companion document.
    pub fn from_json(json: &str) -> Result<Self, GovernanceError> {
        serde_json::from_str(json).map_err(|e| GovernanceError::InvalidAttribute {
            key: "metadata".to_string(),
            reason: e.to_string(),
        })
    }
}

/// Searchable representation of a chunk, produced by an external
/// generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Representation {
    Vector(Vec<f32>),
    Summary(String),
}

/// One stored unit within a tier.
///
/// The Raw tier holds a single entry per document; Enriched and Indexed
/// hold one entry per chunk, indexed from 0.
#[derive(Debug, Clone, PartialEq)]
pub struct TierEntry {
    pub index: u32,
    pub content: Vec<u8>,
    /// `None` only for Raw content that arrived without its companion.
    pub metadata: Option<MetadataRecord>,
    pub representation: Option<Representation>,
    /// Lineage hash of the Raw revision this entry descends from. Raw
    /// entries carry their own hash; Enriched and Indexed entries copy it
    /// forward, so a mismatch with the Raw tier marks them stale.
    pub upstream_hash: String,
}

impl TierEntry {
    /// Build a Raw-tier entry; its lineage hash covers content and metadata.
    pub fn raw(content: Vec<u8>, metadata: Option<MetadataRecord>) -> Self {
        let upstream_hash = lineage_hash(&content, metadata.as_ref());
        Self {
            index: 0,
            content,
            metadata,
            representation: None,
            upstream_hash,
        }
    }

    /// The lineage hash a downstream entry derived from this one carries.
    pub fn lineage_hash(&self) -> String {
        lineage_hash(&self.content, self.metadata.as_ref())
    }

    pub fn level(&self) -> Option<ConfidentialityLevel> {
        self.metadata.as_ref().map(|m| m.confidentiality_level)
    }
}

/// SHA-256 over content plus the serialized metadata, hex encoded.
///
/// A change to either the bytes or any metadata field changes the hash,
/// which is what marks downstream tiers stale.
pub fn lineage_hash(content: &[u8], metadata: Option<&MetadataRecord>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hasher.update([0u8]);
    if let Some(meta) = metadata {
        hasher.update(serde_json::to_vec(meta).unwrap_or_default());
    }
    format!("{:x}", hasher.finalize())
}

/// A document that failed to advance into `tier`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub doc_id: String,
    pub tier: Tier,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
    pub attempts: u32,
}
