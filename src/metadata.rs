//! Metadata synthesis.
//!
//! The [`Synthesizer`] turns a payload plus any subset of caller-supplied
//! attributes into a complete [`MetadataRecord`]. Missing optional fields
//! take the declared [`MetadataDefaults`]; supplied fields are validated
//! and kept. Synthesis is pure: persisting the record is the caller's job.
//!
//! # Classification default
//!
//! A document ingested without a `confidentiality_level` is classified
//! with [`MetadataDefaults::confidentiality_level`], which is `public`
//! unless the deployment configures something stricter. This is a policy
//! decision, not an inference: the Raw→Enriched stage may later tighten a
//! defaulted level from an independent signal, but never loosen one.
//!
//! ```rust
//! use doc_governance::metadata::Synthesizer;
//! use doc_governance::models::{ConfidentialityLevel, PartialMetadata};
//!
//! let synth = Synthesizer::default();
//! let meta = synth.synthesize(Some(&b"hello"[..]), &PartialMetadata::default()).unwrap();
//! assert_eq!(meta.confidentiality_level, ConfidentialityLevel::Public);
//! assert_eq!(meta.document_type, "unknown");
//! assert!(meta.storage_path.starts_with("raw/"));
//! ```

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::MetadataConfig;
use crate::error::{GovernanceError, Result};
use crate::models::{ConfidentialityLevel, MetadataRecord, PartialMetadata, Tier};

/// Per-field defaults applied when the caller supplies no value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataDefaults {
    pub document_type: String,
    pub source: String,
    pub language: String,
    pub confidentiality_level: ConfidentialityLevel,
}

impl Default for MetadataDefaults {
    fn default() -> Self {
        Self {
            document_type: "unknown".to_string(),
            source: "unknown".to_string(),
            language: "en".to_string(),
            confidentiality_level: ConfidentialityLevel::Public,
        }
    }
}

impl MetadataDefaults {
    pub fn from_config(config: &MetadataConfig) -> Result<Self> {
        Ok(Self {
            document_type: config.document_type.clone(),
            source: config.source.clone(),
            language: config.language.clone(),
            confidentiality_level: config.confidentiality_level.parse()?,
        })
    }
}

/// Produces complete metadata records from partial attribute sets.
#[derive(Debug, Clone, Default)]
pub struct Synthesizer {
    defaults: MetadataDefaults,
}

impl Synthesizer {
    pub fn new(defaults: MetadataDefaults) -> Self {
        Self { defaults }
    }

    pub fn defaults(&self) -> &MetadataDefaults {
        &self.defaults
    }

    /// Synthesize a record for an ingestion-endpoint upload.
    ///
    /// # Errors
    ///
    /// - [`GovernanceError::MissingPayload`] if `payload` is `None`.
    /// - [`GovernanceError::InvalidClassification`] if a supplied level is
    ///   not one of the four defined levels.
    /// - [`GovernanceError::InvalidAttribute`] if another supplied field is
    ///   outside its domain (blank strings, malformed identifiers).
    pub fn synthesize(
        &self,
        payload: Option<&[u8]>,
        attrs: &PartialMetadata,
    ) -> Result<MetadataRecord> {
        self.build(payload, attrs, None, Utc::now())
    }

    /// Synthesize a record for a bulk-synchronization job.
    ///
    /// `hint` is the source system's classification, validated by the same
    /// rules as an attribute. When both are present the stricter wins.
    pub fn synthesize_with_hint(
        &self,
        payload: Option<&[u8]>,
        attrs: &PartialMetadata,
        hint: Option<&str>,
    ) -> Result<MetadataRecord> {
        self.build(payload, attrs, hint, Utc::now())
    }

    /// Full-default record for content that arrived without a companion.
    pub fn fill_missing(&self, doc_id: &str, uploaded_at: DateTime<Utc>) -> MetadataRecord {
        MetadataRecord {
            doc_id: doc_id.to_string(),
            document_type: self.defaults.document_type.clone(),
            confidentiality_level: self.defaults.confidentiality_level,
            source: self.defaults.source.clone(),
            title: None,
            language: self.defaults.language.clone(),
            tags: BTreeSet::new(),
            uploaded_at,
            storage_path: storage_path(Tier::Raw, uploaded_at, doc_id),
        }
    }

    fn build(
        &self,
        payload: Option<&[u8]>,
        attrs: &PartialMetadata,
        hint: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<MetadataRecord> {
        if payload.is_none() {
            return Err(GovernanceError::MissingPayload);
        }

        let supplied_level = attrs
            .confidentiality_level
            .as_deref()
            .map(str::parse::<ConfidentialityLevel>)
            .transpose()?;
        let hinted_level = hint.map(str::parse::<ConfidentialityLevel>).transpose()?;
        let confidentiality_level = match (supplied_level, hinted_level) {
            (Some(a), Some(h)) => a.max(h),
            (Some(a), None) => a,
            (None, Some(h)) => h,
            (None, None) => self.defaults.confidentiality_level,
        };

        let doc_id = match &attrs.doc_id {
            Some(id) => validate_doc_id(id)?,
            None => Uuid::new_v4().to_string(),
        };

        let document_type = non_blank("document_type", attrs.document_type.as_deref())?
            .unwrap_or_else(|| self.defaults.document_type.clone());
        let source = non_blank("source", attrs.source.as_deref())?
            .unwrap_or_else(|| self.defaults.source.clone());
        let title = non_blank("title", attrs.title.as_deref())?;
        let language = match attrs.language.as_deref() {
            Some(lang) => validate_language(lang)?,
            None => self.defaults.language.clone(),
        };
        let tags = attrs
            .tags
            .as_ref()
            .map(|tags| normalize_tags(tags.iter().map(String::as_str)))
            .unwrap_or_default();
        let uploaded_at = attrs.uploaded_at.unwrap_or(now);

        Ok(MetadataRecord {
            storage_path: storage_path(Tier::Raw, uploaded_at, &doc_id),
            doc_id,
            document_type,
            confidentiality_level,
            source,
            title,
            language,
            tags,
            uploaded_at,
        })
    }
}

/// Tier-specific, date-partitioned storage path: `{tier}/{YYYY}/{MM}/{DD}/{doc_id}`.
pub fn storage_path(tier: Tier, uploaded_at: DateTime<Utc>, doc_id: &str) -> String {
    format!("{}/{}/{}", tier, uploaded_at.format("%Y/%m/%d"), doc_id)
}

/// Copy of `meta` re-addressed to `tier`. Every other field is unchanged.
pub fn for_tier(meta: &MetadataRecord, tier: Tier) -> MetadataRecord {
    MetadataRecord {
        storage_path: storage_path(tier, meta.uploaded_at, &meta.doc_id),
        ..meta.clone()
    }
}

/// Parse `key=value` attribute overrides into a [`PartialMetadata`].
///
/// `tags` takes a comma-separated list and accumulates across repeated
/// keys; `uploaded_at` takes RFC 3339. Other repeated keys: last wins.
/// `storage_path` is computed and cannot be supplied.
pub fn parse_attribute_pairs(pairs: &[(String, String)]) -> Result<PartialMetadata> {
    let mut partial = PartialMetadata::default();

    for (key, value) in pairs {
        let value = value.clone();
        match key.trim() {
            "doc_id" => partial.doc_id = Some(value),
            "document_type" => partial.document_type = Some(value),
            "confidentiality_level" => partial.confidentiality_level = Some(value),
            "source" => partial.source = Some(value),
            "title" => partial.title = Some(value),
            "language" => partial.language = Some(value),
            "tags" => {
                let tags = partial.tags.get_or_insert_with(BTreeSet::new);
                tags.extend(normalize_tags(value.split(',')));
            }
            "uploaded_at" => {
                let ts = DateTime::parse_from_rfc3339(value.trim()).map_err(|e| {
                    GovernanceError::InvalidAttribute {
                        key: "uploaded_at".to_string(),
                        reason: e.to_string(),
                    }
                })?;
                partial.uploaded_at = Some(ts.with_timezone(&Utc));
            }
            "storage_path" => {
                return Err(GovernanceError::InvalidAttribute {
                    key: "storage_path".to_string(),
                    reason: "computed by the store and cannot be supplied".to_string(),
                })
            }
            other => {
                return Err(GovernanceError::InvalidAttribute {
                    key: other.to_string(),
                    reason: "unknown metadata field".to_string(),
                })
            }
        }
    }

    Ok(partial)
}

pub(crate) fn validate_doc_id(id: &str) -> Result<String> {
    let trimmed = id.trim();
    let valid = !trimmed.is_empty()
        && trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && trimmed != "."
        && trimmed != "..";
    if !valid {
        return Err(GovernanceError::InvalidAttribute {
            key: "doc_id".to_string(),
            reason: format!("'{}' is not a valid identifier", id),
        });
    }
    Ok(trimmed.to_string())
}

fn validate_language(lang: &str) -> Result<String> {
    let trimmed = lang.trim();
    let valid = (2..=35).contains(&trimmed.len())
        && trimmed
            .split('-')
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric()));
    if !valid {
        return Err(GovernanceError::InvalidAttribute {
            key: "language".to_string(),
            reason: format!("'{}' is not a language tag", lang),
        });
    }
    Ok(trimmed.to_string())
}

fn non_blank(key: &str, value: Option<&str>) -> Result<Option<String>> {
    match value {
        None => Ok(None),
        Some(v) if v.trim().is_empty() => Err(GovernanceError::InvalidAttribute {
            key: key.to_string(),
            reason: "value is blank".to_string(),
        }),
        Some(v) => Ok(Some(v.trim().to_string())),
    }
}

fn normalize_tags<'a>(tags: impl Iterator<Item = &'a str>) -> BTreeSet<String> {
    tags.map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}
