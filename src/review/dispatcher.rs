//! Approval dispatcher: routes a recorded decision back to the stage owner of
//! the reviewed artifact.
//!
//! - Handlers are registered per [`StageKind`]; the submission's stage name
//!   (falling back to its pipeline tag) selects one.
//! - Unrecognised stage names are logged and ignored.
//! - A submission id is reserved before its owner is called and remembered
//!   once delivered, so concurrent or repeated dispatches call the owner at
//!   most once. A failed delivery releases the reservation and may be
//!   retried.
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use stagegate::artifact::StageKind;
//! use stagegate::review::ApprovalDispatcher;
//! use stagegate::stages::StageOwner;
//!
//! let requirements = Arc::new(StageOwner::new(StageKind::RequirementsAnalysis));
//! let dispatcher = ApprovalDispatcher::new().with_handler(requirements);
//! assert_eq!(dispatcher.unregistered().len(), 3);
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::models::{ReviewDecision, ReviewStatus, ReviewSubmission};
use crate::artifact::StageKind;
use crate::errors::{DispatchError, StageError};

/// Receives decisions for the artifacts of one stage.
#[async_trait]
pub trait StageHandler: Send + Sync {
    fn stage(&self) -> StageKind;

    /// Apply a terminal decision to the artifact identified by
    /// `correlation_id`. Must be idempotent.
    async fn apply_decision(
        &self,
        correlation_id: &str,
        review_id: &str,
        decision: &ReviewDecision,
    ) -> Result<(), StageError>;
}

/// What a dispatch call did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// The stage owner applied the decision.
    Delivered { stage: StageKind },
    /// This submission was delivered earlier; nothing was called.
    AlreadyDispatched { stage: StageKind },
    /// Another call is delivering this submission right now; nothing was
    /// called.
    InProgress { stage: StageKind },
    /// The submission carries no decision to route (pending or expired).
    Skipped { status: ReviewStatus },
    /// Neither the stage name nor the pipeline tag names a known stage.
    UnknownStage,
}

/// Delivery state of one submission id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    InFlight(StageKind),
    Delivered(StageKind),
}

/// Routes decisions to stage owners through a registration table.
#[derive(Default)]
pub struct ApprovalDispatcher {
    handlers: HashMap<StageKind, Arc<dyn StageHandler>>,
    deliveries: DashMap<String, Delivery>,
}

impl ApprovalDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for its stage, replacing any previous one.
    pub fn register(&mut self, handler: Arc<dyn StageHandler>) -> Option<Arc<dyn StageHandler>> {
        self.handlers.insert(handler.stage(), handler)
    }

    pub fn with_handler(mut self, handler: Arc<dyn StageHandler>) -> Self {
        self.register(handler);
        self
    }

    /// Stages that have no registered owner.
    pub fn unregistered(&self) -> Vec<StageKind> {
        StageKind::ALL
            .into_iter()
            .filter(|stage| !self.handlers.contains_key(stage))
            .collect()
    }

    /// Pick the owning stage for a submission.
    pub fn resolve(&self, submission: &ReviewSubmission) -> Option<StageKind> {
        StageKind::resolve(&submission.stage_name)
            .or_else(|| StageKind::resolve(&submission.pipeline_stage))
    }

    /// True once the owner has applied the decision for `review_id`.
    pub fn was_dispatched(&self, review_id: &str) -> bool {
        matches!(
            self.deliveries.get(review_id).as_deref(),
            Some(Delivery::Delivered(_))
        )
    }

    /// Notify the owning stage of a decided submission. Never mutates the
    /// submission.
    pub async fn dispatch(
        &self,
        submission: &ReviewSubmission,
    ) -> Result<DispatchOutcome, DispatchError> {
        if !matches!(
            submission.status,
            ReviewStatus::Approved | ReviewStatus::Rejected
        ) {
            debug!(
                review_id = %submission.id,
                status = %submission.status,
                "Nothing to dispatch"
            );
            return Ok(DispatchOutcome::Skipped {
                status: submission.status,
            });
        }

        let Some(stage) = self.resolve(submission) else {
            warn!(
                review_id = %submission.id,
                stage_name = %submission.stage_name,
                pipeline_stage = %submission.pipeline_stage,
                "Decision references an unknown stage; not dispatched"
            );
            return Ok(DispatchOutcome::UnknownStage);
        };

        let handler = self
            .handlers
            .get(&stage)
            .ok_or(DispatchError::NoHandler { stage })?;

        // Reserve the id under the shard lock; the guard is gone before the
        // handler is awaited.
        match self.deliveries.entry(submission.id.clone()) {
            Entry::Occupied(entry) => {
                return Ok(match *entry.get() {
                    Delivery::Delivered(stage) => DispatchOutcome::AlreadyDispatched { stage },
                    Delivery::InFlight(stage) => {
                        debug!(review_id = %submission.id, "Dispatch already in flight");
                        DispatchOutcome::InProgress { stage }
                    }
                });
            }
            Entry::Vacant(entry) => {
                entry.insert(Delivery::InFlight(stage));
            }
        }
        let reservation = Reservation {
            deliveries: &self.deliveries,
            review_id: &submission.id,
            stage,
            delivered: false,
        };

        let decision = submission
            .decision
            .clone()
            .unwrap_or_else(|| ReviewDecision::new(submission.status, Default::default()));

        handler
            .apply_decision(&submission.correlation_id, &submission.id, &decision)
            .await
            .map_err(|source| DispatchError::Stage {
                stage,
                review_id: submission.id.clone(),
                source,
            })?;

        reservation.deliver();
        info!(
            review_id = %submission.id,
            stage = %stage,
            correlation_id = %submission.correlation_id,
            status = %submission.status,
            "Decision dispatched"
        );
        Ok(DispatchOutcome::Delivered { stage })
    }
}

/// An `InFlight` entry held for one dispatch call. Dropped without
/// [`Reservation::deliver`] (handler error or cancelled call), it releases
/// the id for a retry.
struct Reservation<'a> {
    deliveries: &'a DashMap<String, Delivery>,
    review_id: &'a str,
    stage: StageKind,
    delivered: bool,
}

impl Reservation<'_> {
    fn deliver(mut self) {
        self.deliveries
            .insert(self.review_id.to_string(), Delivery::Delivered(self.stage));
        self.delivered = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.delivered {
            self.deliveries.remove(self.review_id);
        }
    }
}

impl std::fmt::Debug for ApprovalDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut stages: Vec<_> = self.handlers.keys().collect();
        stages.sort();
        f.debug_struct("ApprovalDispatcher")
            .field("stages", &stages)
            .field("deliveries", &self.deliveries.len())
            .finish()
    }
}
