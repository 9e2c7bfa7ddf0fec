//! Failure taxonomy for a remediation run.
//!
//! Collaborators report `anyhow` errors with context; they are folded into
//! [`RemediationError`] at the stage boundary that observed them.

use thiserror::Error;

/// A source unit could not be obtained.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("source unit '{unit}' not found at {path}")]
    UnitNotFound { unit: String, path: String },

    #[error("failed to fetch source unit '{unit}': {reason}")]
    FetchFailed { unit: String, reason: String },
}

impl SourceError {
    pub fn unit(&self) -> &str {
        match self {
            SourceError::UnitNotFound { unit, .. } | SourceError::FetchFailed { unit, .. } => unit,
        }
    }
}

#[derive(Debug, Error)]
pub enum RemediationError {
    #[error("could not parse stack trace after {attempts} attempts: {reason}")]
    UnparsableTrace { attempts: u32, reason: String },

    #[error("exception is not fixable automatically: {reason}")]
    NotFixable { reason: String },

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("no valid fix produced within {turns} negotiation turns: {last_problem}")]
    NegotiationExhausted { turns: u32, last_problem: String },

    #[error("text generator request failed: {0:#}")]
    GeneratorFailed(#[source] anyhow::Error),

    #[error("failed to publish fix: {0:#}")]
    FinalizationFailed(#[source] anyhow::Error),

    #[error("exception id {exception_id} cannot be recorded: {source:#}")]
    InvalidExceptionId {
        exception_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to record outcome for exception {exception_id}: {source:#}")]
    StatusUpdateFailed {
        exception_id: String,
        #[source]
        source: anyhow::Error,
    },
}

impl RemediationError {
    /// Short stable label used in structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            RemediationError::UnparsableTrace { .. } => "unparsable_trace",
            RemediationError::NotFixable { .. } => "not_fixable",
            RemediationError::Source(SourceError::UnitNotFound { .. }) => "unit_not_found",
            RemediationError::Source(SourceError::FetchFailed { .. }) => "fetch_failed",
            RemediationError::NegotiationExhausted { .. } => "negotiation_exhausted",
            RemediationError::GeneratorFailed(_) => "generator_failed",
            RemediationError::FinalizationFailed(_) => "finalization_failed",
            RemediationError::InvalidExceptionId { .. } => "invalid_exception_id",
            RemediationError::StatusUpdateFailed { .. } => "status_update_failed",
        }
    }
}
