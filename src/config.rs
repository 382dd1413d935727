//! TOML configuration parsing and validation.
//!
//! Every optional key has a declared default so that a missing key is a
//! documented policy, never an implicit control-flow signal.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::models::ConfidentialityLevel;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub representation: RepresentationConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub connectors: ConnectorsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_store_path(),
        }
    }
}

fn default_backend() -> String {
    "sqlite".to_string()
}
fn default_store_path() -> PathBuf {
    PathBuf::from("./data/governance.sqlite")
}

/// Declared per-field defaults applied by the metadata synthesizer.
#[derive(Debug, Deserialize, Clone)]
pub struct MetadataConfig {
    #[serde(default = "default_unknown")]
    pub document_type: String,
    #[serde(default = "default_unknown")]
    pub source: String,
    #[serde(default = "default_language")]
    pub language: String,
    /// Level applied when the caller supplies none. `public` is the
    /// documented policy; a deployment may only choose a stricter one.
    #[serde(default = "default_level_name")]
    pub confidentiality_level: String,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            document_type: default_unknown(),
            source: default_unknown(),
            language: default_language(),
            confidentiality_level: default_level_name(),
        }
    }
}

fn default_unknown() -> String {
    "unknown".to_string()
}
fn default_language() -> String {
    "en".to_string()
}
fn default_level_name() -> String {
    "public".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_max_tokens() -> usize {
    700
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Documents processed in parallel within one stage batch.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Upper bound on one stage batch; unfinished documents stay in their tier.
    #[serde(default = "default_batch_timeout_secs")]
    pub batch_timeout_secs: u64,
    /// Re-attempt documents already in the failure ledger.
    #[serde(default)]
    pub retry_failed: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            batch_timeout_secs: default_batch_timeout_secs(),
            retry_failed: false,
        }
    }
}

fn default_concurrency() -> usize {
    4
}
fn default_batch_timeout_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct RepresentationConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RepresentationConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: default_dims(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "hashing".to_string()
}
fn default_dims() -> usize {
    256
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

/// Classification policy: filename/content rules plus an explicit
/// per-document override table.
#[derive(Debug, Deserialize, Clone)]
pub struct PolicyConfig {
    #[serde(default = "default_policy_version")]
    pub version: String,
    #[serde(default)]
    pub rules: Vec<PolicyRuleConfig>,
    #[serde(default)]
    pub overrides: BTreeMap<String, String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            version: default_policy_version(),
            rules: Vec::new(),
            overrides: BTreeMap::new(),
        }
    }
}

fn default_policy_version() -> String {
    "v1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct PolicyRuleConfig {
    pub name: String,
    pub level: String,
    #[serde(default)]
    pub title_globs: Vec<String>,
    #[serde(default)]
    pub content_pattern: Option<String>,
    #[serde(default)]
    pub document_types: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ConnectorsConfig {
    pub filesystem: Option<FilesystemConnectorConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilesystemConnectorConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    /// Source label written into metadata of synced documents.
    #[serde(default = "default_fs_source")]
    pub source: String,
    /// Source-system classification hint applied to every synced document.
    #[serde(default)]
    pub classification_hint: Option<String>,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string(), "**/*.txt".to_string()]
}
fn default_fs_source() -> String {
    "filesystem".to_string()
}

impl Config {
    /// All-defaults configuration with an in-memory store.
    pub fn minimal() -> Self {
        Self {
            store: StoreConfig {
                backend: "memory".to_string(),
                path: default_store_path(),
            },
            metadata: MetadataConfig::default(),
            chunking: ChunkingConfig::default(),
            pipeline: PipelineConfig::default(),
            representation: RepresentationConfig::default(),
            policy: PolicyConfig::default(),
            connectors: ConnectorsConfig::default(),
        }
    }

    /// Check cross-field constraints. Called by [`load_config`].
    pub fn validate(&self) -> Result<()> {
        match self.store.backend.as_str() {
            "sqlite" | "memory" => {}
            other => anyhow::bail!(
                "Unknown store backend: '{}'. Must be sqlite or memory.",
                other
            ),
        }

        self.metadata
            .confidentiality_level
            .parse::<ConfidentialityLevel>()
            .context("metadata.confidentiality_level")?;

        if self.chunking.max_tokens == 0 {
            anyhow::bail!("chunking.max_tokens must be > 0");
        }

        if self.pipeline.concurrency == 0 {
            anyhow::bail!("pipeline.concurrency must be > 0");
        }
        if self.pipeline.batch_timeout_secs == 0 {
            anyhow::bail!("pipeline.batch_timeout_secs must be > 0");
        }

        if self.representation.batch_size == 0 {
            anyhow::bail!("representation.batch_size must be > 0");
        }
        match self.representation.provider.as_str() {
            "hashing" => {
                if self.representation.dims == 0 {
                    anyhow::bail!("representation.dims must be > 0 for the hashing provider");
                }
            }
            "summary" => {}
            "openai" => {
                if self.representation.model.is_none() {
                    anyhow::bail!("representation.model must be specified when provider is 'openai'");
                }
            }
            other => anyhow::bail!(
                "Unknown representation provider: '{}'. Must be hashing, summary, or openai.",
                other
            ),
        }

        for rule in &self.policy.rules {
            rule.level
                .parse::<ConfidentialityLevel>()
                .with_context(|| format!("policy rule '{}'", rule.name))?;
        }
        for (doc_id, level) in &self.policy.overrides {
            level
                .parse::<ConfidentialityLevel>()
                .with_context(|| format!("policy override for '{}'", doc_id))?;
        }

        if let Some(fs) = &self.connectors.filesystem {
            if let Some(hint) = &fs.classification_hint {
                hint.parse::<ConfidentialityLevel>()
                    .context("connectors.filesystem.classification_hint")?;
            }
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}
