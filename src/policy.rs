//! Classification policy.
//!
//! A [`ClassificationPolicy`] is an explicit, versioned object injected into
//! the Raw→Enriched stage. It inspects a document's [`ContentSignal`] and
//! may return a classification *hint*. The stage only ever uses a hint to
//! tighten a defaulted level (see [`resolve_classification`]), so a policy
//! can never loosen a classification no matter what it returns.

use std::collections::{BTreeMap, BTreeSet};

use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;

use crate::config::PolicyConfig;
use crate::error::{GovernanceError, Result};
use crate::models::ConfidentialityLevel;

/// What a policy gets to look at.
#[derive(Debug, Clone, Copy)]
pub struct ContentSignal<'a> {
    pub doc_id: &'a str,
    pub title: Option<&'a str>,
    pub document_type: &'a str,
    pub source: &'a str,
    pub tags: &'a BTreeSet<String>,
    pub text: &'a str,
}

/// Independent classification signal for the Raw→Enriched stage.
pub trait ClassificationPolicy: Send + Sync {
    /// Identifies the policy revision in logs and reports.
    fn version(&self) -> &str;

    /// The level this policy believes the document deserves, if any.
    fn hint(&self, signal: &ContentSignal<'_>) -> Option<ConfidentialityLevel>;

    /// Names of the rules behind [`hint`](Self::hint), for logs.
    fn matching_rules(&self, _signal: &ContentSignal<'_>) -> Vec<String> {
        Vec::new()
    }
}

/// Policy that never produces a hint.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSignal;

impl ClassificationPolicy for NoSignal {
    fn version(&self) -> &str {
        "none"
    }

    fn hint(&self, _signal: &ContentSignal<'_>) -> Option<ConfidentialityLevel> {
        None
    }
}

struct CompiledRule {
    name: String,
    level: ConfidentialityLevel,
    titles: Option<GlobSet>,
    content: Option<Regex>,
    document_types: BTreeSet<String>,
    tags: BTreeSet<String>,
}

impl CompiledRule {
    /// Every condition the rule declares must hold. A rule that declares
    /// no condition matches nothing.
    fn matches(&self, signal: &ContentSignal<'_>) -> bool {
        let mut declared = false;

        if let Some(titles) = &self.titles {
            declared = true;
            match signal.title {
                Some(title) if titles.is_match(title) => {}
                _ => return false,
            }
        }
        if let Some(content) = &self.content {
            declared = true;
            if !content.is_match(signal.text) {
                return false;
            }
        }
        if !self.document_types.is_empty() {
            declared = true;
            if !self.document_types.contains(signal.document_type) {
                return false;
            }
        }
        if !self.tags.is_empty() {
            declared = true;
            if self.tags.is_disjoint(signal.tags) {
                return false;
            }
        }

        declared
    }
}

/// Rule-based policy built from `[policy]` configuration.
///
/// The hint is the strictest level among the matching rules and the
/// `doc_id` override table.
pub struct RulePolicy {
    version: String,
    rules: Vec<CompiledRule>,
    overrides: BTreeMap<String, ConfidentialityLevel>,
}

impl RulePolicy {
    pub fn from_config(config: &PolicyConfig) -> Result<Self> {
        let rules = config
            .rules
            .iter()
            .map(|rule| {
                let titles = if rule.title_globs.is_empty() {
                    None
                } else {
                    let mut builder = GlobSetBuilder::new();
                    for pattern in &rule.title_globs {
                        let glob = Glob::new(pattern).map_err(|e| GovernanceError::InvalidAttribute {
                            key: format!("policy.rules.{}.title_globs", rule.name),
                            reason: e.to_string(),
                        })?;
                        builder.add(glob);
                    }
                    Some(builder.build().map_err(|e| GovernanceError::InvalidAttribute {
                        key: format!("policy.rules.{}.title_globs", rule.name),
                        reason: e.to_string(),
                    })?)
                };

                let content = rule
                    .content_pattern
                    .as_deref()
                    .map(Regex::new)
                    .transpose()
                    .map_err(|e| GovernanceError::InvalidAttribute {
                        key: format!("policy.rules.{}.content_pattern", rule.name),
                        reason: e.to_string(),
                    })?;

                Ok(CompiledRule {
                    name: rule.name.clone(),
                    level: rule.level.parse()?,
                    titles,
                    content,
                    document_types: rule.document_types.iter().cloned().collect(),
                    tags: rule.tags.iter().cloned().collect(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let overrides = config
            .overrides
            .iter()
            .map(|(doc_id, level)| Ok((doc_id.clone(), level.parse()?)))
            .collect::<Result<BTreeMap<_, _>>>()?;

        Ok(Self {
            version: config.version.clone(),
            rules,
            overrides,
        })
    }
}

impl ClassificationPolicy for RulePolicy {
    fn version(&self) -> &str {
        &self.version
    }

    fn hint(&self, signal: &ContentSignal<'_>) -> Option<ConfidentialityLevel> {
        let from_rules = self
            .rules
            .iter()
            .filter(|r| r.matches(signal))
            .map(|r| r.level)
            .max();
        let from_override = self.overrides.get(signal.doc_id).copied();
        from_rules.max(from_override)
    }

    /// Matching rule names in declaration order, then `override` when the
    /// document has an entry in the override table.
    fn matching_rules(&self, signal: &ContentSignal<'_>) -> Vec<String> {
        let mut names: Vec<String> = self
            .rules
            .iter()
            .filter(|r| r.matches(signal))
            .map(|r| r.name.clone())
            .collect();
        if self.overrides.contains_key(signal.doc_id) {
            names.push("override".to_string());
        }
        names
    }
}

/// Outcome of classification resolution for one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub level: ConfidentialityLevel,
    pub tightened: bool,
}

/// Tighten-only resolution.
///
/// The level changes only when `current` still equals the synthesizer
/// default and `hint` is strictly more restrictive. Any other combination
/// keeps `current`.
pub fn resolve_classification(
    current: ConfidentialityLevel,
    default: ConfidentialityLevel,
    hint: Option<ConfidentialityLevel>,
) -> Resolution {
    match hint {
        Some(h) if current == default && h > current => Resolution {
            level: h,
            tightened: true,
        },
        _ => Resolution {
            level: current,
            tightened: false,
        },
    }
}
