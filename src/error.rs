//! Error taxonomy for governance operations.
//!
//! Library operations that touch classification, tiers or the failure
//! ledger return [`Result<T>`](Result) with a [`GovernanceError`]. CLI
//! plumbing and configuration loading use `anyhow` on top of it.

use thiserror::Error;

use crate::models::{ConfidentialityLevel, Tier};

/// Errors raised by the synthesizer, the layered store and the stage
/// processors.
#[derive(Error, Debug)]
pub enum GovernanceError {
    /// A supplied classification is not one of the four defined levels.
    #[error("invalid classification '{0}': expected one of public, internal, confidential, highly_confidential")]
    InvalidClassification(String),

    /// No payload was supplied to the synthesizer.
    #[error("document payload is missing")]
    MissingPayload,

    /// A caller-supplied attribute could not be interpreted.
    #[error("invalid attribute '{key}': {reason}")]
    InvalidAttribute { key: String, reason: String },

    /// Content is empty, undecodable or inconsistent with its metadata.
    #[error("validation failed for {doc_id}: {reason}")]
    ValidationFailure { doc_id: String, reason: String },

    /// The requested document is absent from the tier.
    #[error("document {doc_id} not found in {tier} tier")]
    NotFound { tier: Tier, doc_id: String },

    /// Transient storage failure; safe to retry.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// A re-ingest would loosen an existing classification without
    /// explicit authorization.
    #[error("refusing to lower classification of {doc_id} from {existing} to {requested} without authorization")]
    UnauthorizedDowngrade {
        doc_id: String,
        existing: ConfidentialityLevel,
        requested: ConfidentialityLevel,
    },

    /// The representation generator returned the wrong number of outputs.
    #[error("representation generator returned {actual} outputs for {expected} chunks")]
    CardinalityMismatch { expected: usize, actual: usize },

    /// The representation generator failed.
    #[error("representation generation failed: {0}")]
    Representation(String),
}

impl GovernanceError {
    /// Whether a scheduler may retry the operation as-is.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GovernanceError::StoreUnavailable(_) | GovernanceError::Representation(_)
        )
    }
}

impl From<sqlx::Error> for GovernanceError {
    fn from(e: sqlx::Error) -> Self {
        GovernanceError::StoreUnavailable(e.to_string())
    }
}

impl From<serde_json::Error> for GovernanceError {
    fn from(e: serde_json::Error) -> Self {
        GovernanceError::StoreUnavailable(format!("corrupt stored record: {}", e))
    }
}

/// Result alias for governance operations.
pub type Result<T> = std::result::Result<T, GovernanceError>;
