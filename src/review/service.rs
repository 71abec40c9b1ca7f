//! Review service: validation, lifecycle transitions and decision dispatch on
//! top of the shared [`ReviewStore`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use super::dispatcher::{ApprovalDispatcher, DispatchOutcome};
use super::models::{
    DecisionInput, ReviewDecision, ReviewResponse, ReviewStats, ReviewStatus, ReviewSubmission,
    SubmitRequest,
};
use super::store::ReviewStore;
use crate::errors::ReviewError;

/// Runtime limits for the review service.
#[derive(Debug, Clone)]
pub struct ReviewConfig {
    pub max_concurrent_reviews: usize,
    /// Age after which a pending submission expires.
    pub timeout: Duration,
    /// Maximum submission content length, in characters.
    pub max_content_length: usize,
    pub valid_pipeline_stages: Vec<String>,
    pub sweep_interval: Duration,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            max_concurrent_reviews: 100,
            timeout: Duration::from_secs(24 * 60 * 60),
            max_content_length: 100_000,
            valid_pipeline_stages: ["Analysis", "Planning", "Stories", "Prompts"]
                .into_iter()
                .map(String::from)
                .collect(),
            sweep_interval: Duration::from_secs(300),
        }
    }
}

impl ReviewConfig {
    pub fn with_max_concurrent_reviews(mut self, max: usize) -> Self {
        self.max_concurrent_reviews = max;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_content_length(mut self, max: usize) -> Self {
        self.max_content_length = max;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// The review operations shared by the HTTP layer and the stage owners.
///
/// Every state change is committed synchronously inside the store before
/// anything is awaited, so dropping one of these futures either leaves the
/// record untouched or leaves the decision fully recorded.
#[derive(Debug)]
pub struct ReviewService {
    store: Arc<ReviewStore>,
    dispatcher: Arc<ApprovalDispatcher>,
    config: ReviewConfig,
}

impl ReviewService {
    pub fn new(
        store: Arc<ReviewStore>,
        dispatcher: Arc<ApprovalDispatcher>,
        config: ReviewConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            config,
        }
    }

    pub fn store(&self) -> &Arc<ReviewStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Arc<ApprovalDispatcher> {
        &self.dispatcher
    }

    pub fn config(&self) -> &ReviewConfig {
        &self.config
    }

    /// Create a pending submission.
    pub async fn submit(&self, request: SubmitRequest) -> Result<ReviewSubmission, ReviewError> {
        self.validate(&request)?;

        let submission = ReviewSubmission {
            id: Uuid::new_v4().to_string(),
            stage_name: request.stage_name,
            content: request.content,
            correlation_id: request.correlation_id,
            pipeline_stage: request.pipeline_stage,
            status: ReviewStatus::Pending,
            submitted_at: Utc::now(),
            reviewed_at: None,
            decision: None,
            original_request: request.original_request,
            ai_response: request.ai_response,
            metadata: request.metadata.unwrap_or_default(),
        };

        self.store
            .insert_pending(submission.clone(), self.config.max_concurrent_reviews)?;

        info!(
            review_id = %submission.id,
            stage = %submission.stage_name,
            correlation_id = %submission.correlation_id,
            "Review submitted"
        );
        Ok(submission)
    }

    pub async fn get(&self, id: &str) -> Option<ReviewSubmission> {
        self.store.get(id)
    }

    /// Approve a pending submission. Without an explicit decision the
    /// default approval (no reason, feedback or improvements) is recorded.
    pub async fn approve(
        &self,
        id: &str,
        decision: Option<DecisionInput>,
    ) -> Result<ReviewResponse, ReviewError> {
        let decision = ReviewDecision::new(ReviewStatus::Approved, decision.unwrap_or_default());
        self.decide(id, decision).await
    }

    /// Reject a pending submission. The reason is checked before the id is
    /// looked up.
    pub async fn reject(
        &self,
        id: &str,
        decision: DecisionInput,
    ) -> Result<ReviewResponse, ReviewError> {
        let Some(reason) = decision.trimmed_reason().map(str::to_string) else {
            return Err(ReviewError::validation(
                "reason",
                "a rejection must give a reason",
            ));
        };
        let decision = ReviewDecision::new(
            ReviewStatus::Rejected,
            DecisionInput {
                reason: Some(reason),
                ..decision
            },
        );
        self.decide(id, decision).await
    }

    async fn decide(
        &self,
        id: &str,
        decision: ReviewDecision,
    ) -> Result<ReviewResponse, ReviewError> {
        let decided = self.store.decide(id, decision, Utc::now())?;
        info!(
            review_id = %decided.id,
            stage = %decided.stage_name,
            correlation_id = %decided.correlation_id,
            status = %decided.status,
            "Review decided"
        );

        // The decision stays recorded whatever happens below.
        let dispatch_error = match self.dispatcher.dispatch(&decided).await {
            Ok(_) => None,
            Err(e) => {
                warn!(
                    review_id = %decided.id,
                    stage = %decided.stage_name,
                    error = %e,
                    "Decision recorded but dispatch failed"
                );
                Some(e.to_string())
            }
        };

        Ok(ReviewResponse::decided(&decided, dispatch_error))
    }

    /// Re-run dispatch for a decided submission.
    pub async fn redispatch(&self, id: &str) -> Result<DispatchOutcome, ReviewError> {
        let submission = self
            .store
            .get(id)
            .ok_or_else(|| ReviewError::NotFound { id: id.to_string() })?;

        self.dispatcher
            .dispatch(&submission)
            .await
            .map_err(|e| ReviewError::Undelivered {
                id: id.to_string(),
                source: Box::new(e),
            })
    }

    pub async fn list_pending(&self) -> Vec<ReviewSubmission> {
        self.store.pending()
    }

    /// Expire pending submissions older than `timeout` as of `now`.
    pub async fn sweep_expired(
        &self,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<usize, ReviewError> {
        let timeout = chrono::Duration::from_std(timeout)
            .map_err(|e| ReviewError::Sweep(format!("timeout out of range: {}", e)))?;
        let cutoff = now
            .checked_sub_signed(timeout)
            .ok_or_else(|| ReviewError::Sweep("cutoff before the minimum timestamp".into()))?;

        let count = self.store.expire_submitted_before(cutoff, now);
        if count > 0 {
            info!(count, cutoff = %cutoff, "Expired stale reviews");
        }
        Ok(count)
    }

    /// Every stage has an owner and the pending counter agrees with the
    /// configured ceiling.
    pub fn is_healthy(&self) -> bool {
        self.dispatcher.unregistered().is_empty()
            && self.store.pending_count() <= self.config.max_concurrent_reviews
            && self.store.pending_count() <= self.store.len()
    }

    pub fn stats(&self) -> ReviewStats {
        self.store.stats()
    }

    fn validate(&self, request: &SubmitRequest) -> Result<(), ReviewError> {
        for (field, value) in [
            ("stage_name", &request.stage_name),
            ("content", &request.content),
            ("correlation_id", &request.correlation_id),
            ("pipeline_stage", &request.pipeline_stage),
        ] {
            if value.trim().is_empty() {
                return Err(ReviewError::validation(field, "must not be empty"));
            }
        }

        if !self
            .config
            .valid_pipeline_stages
            .iter()
            .any(|s| s == &request.pipeline_stage)
        {
            return Err(ReviewError::validation(
                "pipeline_stage",
                format!(
                    "'{}' is not one of: {}",
                    request.pipeline_stage,
                    self.config.valid_pipeline_stages.join(", ")
                ),
            ));
        }

        let length = request.content.chars().count();
        if length > self.config.max_content_length {
            return Err(ReviewError::validation(
                "content",
                format!(
                    "{} characters exceeds the limit of {}",
                    length, self.config.max_content_length
                ),
            ));
        }
        Ok(())
    }
}
