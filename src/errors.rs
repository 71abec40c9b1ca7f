//! Typed error hierarchy for the review and gating engine.
//!
//! Four enums cover the subsystems:
//! - `ReviewError`: validation and state-conflict failures from the review service
//! - `GateError`: a stage was asked to start before its prerequisites were approved
//! - `StageError`: stage-owner failures (artifact lifecycle, generation)
//! - `DispatchError`: routing a recorded decision back to its stage owner failed

use thiserror::Error;

use crate::artifact::{ArtifactStatus, StageKind};
use crate::review::ReviewStatus;

/// Errors from the review service and store.
#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("Invalid {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Review {id} not found")]
    NotFound { id: String },

    #[error("Review {id} is already {status}")]
    InvalidState { id: String, status: ReviewStatus },

    #[error("Review capacity reached: {limit} submissions already pending")]
    CapacityExceeded { limit: usize },

    #[error("Expiry sweep failed: {0}")]
    Sweep(String),

    #[error("Review {id} is decided but its stage owner was not notified: {source}")]
    Undelivered {
        id: String,
        #[source]
        source: Box<DispatchError>,
    },
}

impl ReviewError {
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }

    /// Caller supplied bad input; retrying the same request will fail again.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }

    /// Caller must re-fetch the review before retrying.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::InvalidState { .. })
    }
}

/// A stage gate refused to open.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("{stage} cannot start for {slot}: missing approved {}", .missing.join(", "))]
    PrerequisitesNotMet {
        stage: StageKind,
        slot: String,
        missing: Vec<String>,
    },

    #[error("{stage} slot {slot} is busy: artifact {artifact_id} is {status}")]
    SlotBusy {
        stage: StageKind,
        slot: String,
        artifact_id: String,
        status: ArtifactStatus,
    },

    #[error("{stage}: {reason}")]
    InvalidScope { stage: StageKind, reason: String },
}

/// Errors raised by a stage owner.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("Artifact {id} not found")]
    ArtifactNotFound { id: String },

    #[error("Artifact {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: ArtifactStatus,
        to: ArtifactStatus,
    },

    #[error("{stage} needs input text")]
    MissingInput { stage: StageKind },

    #[error("Generation failed: {0}")]
    Generation(#[source] anyhow::Error),

    #[error(transparent)]
    Gate(#[from] GateError),

    #[error(transparent)]
    Review(#[from] ReviewError),
}

/// Errors from routing a decision to its stage owner. The decision itself is
/// already recorded when one of these is returned.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("No stage owner registered for {stage}")]
    NoHandler { stage: StageKind },

    #[error("{stage} owner failed to apply review {review_id}: {source}")]
    Stage {
        stage: StageKind,
        review_id: String,
        #[source]
        source: StageError,
    },
}
