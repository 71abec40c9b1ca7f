//! Stage owners: the single writer of each stage's artifacts.
//!
//! A [`StageOwner`] claims slots, records generation results and applies
//! review decisions that the dispatcher routes to it. Slot claims go through
//! the slot map's entry lock, so two concurrent runs for the same slot cannot
//! both start.

use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::artifact::{Artifact, ArtifactStatus, Slot, StageKind};
use crate::errors::StageError;
use crate::gates;
use crate::review::{ReviewDecision, ReviewStatus, StageHandler};

#[derive(Debug)]
pub struct StageOwner {
    stage: StageKind,
    artifacts: DashMap<String, Artifact>,
    /// Latest artifact id per slot.
    slots: DashMap<Slot, String>,
}

impl StageOwner {
    pub fn new(stage: StageKind) -> Self {
        Self {
            stage,
            artifacts: DashMap::new(),
            slots: DashMap::new(),
        }
    }

    pub fn stage(&self) -> StageKind {
        self.stage
    }

    /// Claim `slot` and create a Processing artifact for it.
    ///
    /// `review_pending` reports whether a review id is still awaiting a
    /// decision; a slot whose latest draft is under review stays busy.
    pub fn begin(
        &self,
        slot: &Slot,
        dependencies: Vec<String>,
        review_pending: impl Fn(&str) -> bool,
    ) -> Result<Artifact, StageError> {
        debug_assert_eq!(slot.stage, self.stage);

        let mut artifact = Artifact::new(slot, dependencies);
        artifact.transition(ArtifactStatus::Processing)?;

        match self.slots.entry(slot.clone()) {
            Entry::Occupied(mut entry) => {
                if let Some(latest) = self.artifacts.get(entry.get()) {
                    let pending = latest.review_id.as_deref().is_none_or(&review_pending);
                    gates::ensure_slot_free(&latest, pending)?;
                }
                self.artifacts.insert(artifact.id.clone(), artifact.clone());
                entry.insert(artifact.id.clone());
            }
            Entry::Vacant(entry) => {
                self.artifacts.insert(artifact.id.clone(), artifact.clone());
                entry.insert(artifact.id.clone());
            }
        }

        info!(
            artifact_id = %artifact.id,
            stage = %self.stage,
            slot = %slot,
            "Stage started"
        );
        Ok(artifact)
    }

    /// Record generated content and move the artifact to PendingReview.
    pub fn complete(
        &self,
        id: &str,
        content: String,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<Artifact, StageError> {
        let mut artifact = self.get_mut(id)?;
        artifact.transition(ArtifactStatus::PendingReview)?;
        artifact.content = content;
        artifact.metadata.extend(metadata);
        Ok(artifact.clone())
    }

    /// Mark the artifact Failed with `error`.
    pub fn fail(&self, id: &str, error: &str) -> Result<Artifact, StageError> {
        let mut artifact = self.get_mut(id)?;
        artifact.transition(ArtifactStatus::Failed)?;
        artifact.error = Some(error.to_string());
        warn!(artifact_id = %id, stage = %self.stage, error, "Stage failed");
        Ok(artifact.clone())
    }

    pub fn attach_review(&self, id: &str, review_id: &str) -> Result<(), StageError> {
        let mut artifact = self.get_mut(id)?;
        if artifact.review_id.is_none() {
            artifact.review_id = Some(review_id.to_string());
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Artifact> {
        self.artifacts.get(id).map(|a| a.value().clone())
    }

    /// Every artifact this owner holds for a project, oldest first.
    pub fn artifacts_for_project(&self, project_id: &str) -> Vec<Artifact> {
        let mut artifacts: Vec<Artifact> = self
            .artifacts
            .iter()
            .filter(|a| a.project_id == project_id)
            .map(|a| a.value().clone())
            .collect();
        artifacts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        artifacts
    }

    /// Latest artifact for every slot of a project.
    pub fn latest_for_project(&self, project_id: &str) -> Vec<Artifact> {
        self.slots
            .iter()
            .filter(|entry| entry.key().project_id == project_id)
            .filter_map(|entry| self.get(entry.value()))
            .collect()
    }

    /// Apply a review decision to the artifact it governs. Applying the same
    /// decision twice is a no-op.
    pub fn apply(
        &self,
        id: &str,
        review_id: &str,
        decision: &ReviewDecision,
    ) -> Result<(), StageError> {
        let target = match decision.status {
            ReviewStatus::Approved => ArtifactStatus::Approved,
            ReviewStatus::Rejected => ArtifactStatus::Rejected,
            other => {
                debug!(artifact_id = %id, status = %other, "Ignoring non-decision");
                return Ok(());
            }
        };

        let mut artifact = self.get_mut(id)?;

        if let Some(ref current) = artifact.review_id
            && current != review_id
        {
            warn!(
                artifact_id = %id,
                review_id,
                current_review = %current,
                "Decision from a superseded review ignored"
            );
            return Ok(());
        }

        if artifact.status == target {
            return Ok(());
        }
        artifact.transition(target)?;
        artifact.review_id = Some(review_id.to_string());

        if let Some(ref reason) = decision.reason {
            artifact.metadata.insert("review_reason".into(), json!(reason));
        }
        if let Some(ref feedback) = decision.feedback {
            artifact.metadata.insert("review_feedback".into(), json!(feedback));
        }
        if !decision.instruction_improvements.is_empty() {
            artifact.metadata.insert(
                "instruction_improvements".into(),
                json!(decision.instruction_improvements),
            );
        }

        info!(
            artifact_id = %id,
            stage = %self.stage,
            review_id,
            status = %target,
            "Artifact decided"
        );
        Ok(())
    }

    fn get_mut(
        &self,
        id: &str,
    ) -> Result<dashmap::mapref::one::RefMut<'_, String, Artifact>, StageError> {
        self.artifacts
            .get_mut(id)
            .ok_or_else(|| StageError::ArtifactNotFound { id: id.to_string() })
    }
}

#[async_trait]
impl StageHandler for StageOwner {
    fn stage(&self) -> StageKind {
        self.stage
    }

    async fn apply_decision(
        &self,
        correlation_id: &str,
        review_id: &str,
        decision: &ReviewDecision,
    ) -> Result<(), StageError> {
        self.apply(correlation_id, review_id, decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::GateError;
    use crate::review::DecisionInput;

    fn requirements_slot() -> Slot {
        Slot::new("p1", StageKind::RequirementsAnalysis, None)
    }

    fn in_review(owner: &StageOwner, review_id: &str) -> Artifact {
        let artifact = owner.begin(&requirements_slot(), vec![], |_| true).unwrap();
        owner
            .complete(&artifact.id, "## Goals".into(), HashMap::new())
            .unwrap();
        owner.attach_review(&artifact.id, review_id).unwrap();
        owner.get(&artifact.id).unwrap()
    }

    #[test]
    fn test_begin_claims_slot() {
        let owner = StageOwner::new(StageKind::RequirementsAnalysis);
        let artifact = owner.begin(&requirements_slot(), vec![], |_| true).unwrap();
        assert_eq!(artifact.status, ArtifactStatus::Processing);

        let err = owner.begin(&requirements_slot(), vec![], |_| true).unwrap_err();
        assert!(matches!(err, StageError::Gate(GateError::SlotBusy { .. })));
        assert_eq!(owner.artifacts_for_project("p1").len(), 1);
    }

    #[test]
    fn test_slot_busy_while_review_pending() {
        let owner = StageOwner::new(StageKind::RequirementsAnalysis);
        let artifact = in_review(&owner, "r1");
        assert_eq!(artifact.status, ArtifactStatus::PendingReview);

        assert!(owner.begin(&requirements_slot(), vec![], |_| true).is_err());
        // Once the review expires the slot may be regenerated.
        let fresh = owner.begin(&requirements_slot(), vec![], |_| false).unwrap();
        assert_ne!(fresh.id, artifact.id);
        assert_eq!(owner.latest_for_project("p1")[0].id, fresh.id);
    }

    #[test]
    fn test_apply_approval_is_idempotent() {
        let owner = StageOwner::new(StageKind::RequirementsAnalysis);
        let artifact = in_review(&owner, "r1");
        let approval = ReviewDecision::default_approval();

        owner.apply(&artifact.id, "r1", &approval).unwrap();
        owner.apply(&artifact.id, "r1", &approval).unwrap();
        assert_eq!(owner.get(&artifact.id).unwrap().status, ArtifactStatus::Approved);

        let err = owner
            .begin(&requirements_slot(), vec![], |_| false)
            .unwrap_err();
        assert!(matches!(err, StageError::Gate(GateError::SlotBusy { .. })));
    }

    #[test]
    fn test_rejection_records_feedback_and_frees_slot() {
        let owner = StageOwner::new(StageKind::RequirementsAnalysis);
        let artifact = in_review(&owner, "r1");
        let decision = ReviewDecision::new(
            ReviewStatus::Rejected,
            DecisionInput::with_reason("too vague").add_improvement("ask for metrics"),
        );

        owner.apply(&artifact.id, "r1", &decision).unwrap();
        let rejected = owner.get(&artifact.id).unwrap();
        assert_eq!(rejected.status, ArtifactStatus::Rejected);
        assert_eq!(rejected.metadata["review_reason"], json!("too vague"));

        let regenerated = owner.begin(&requirements_slot(), vec![], |_| false).unwrap();
        assert_ne!(regenerated.id, artifact.id);
        assert_eq!(
            owner.get(&artifact.id).unwrap().status,
            ArtifactStatus::Rejected
        );
    }

    #[test]
    fn test_apply_unknown_artifact() {
        let owner = StageOwner::new(StageKind::ProjectPlanning);
        let err = owner
            .apply("missing", "r1", &ReviewDecision::default_approval())
            .unwrap_err();
        assert!(matches!(err, StageError::ArtifactNotFound { .. }));
    }

    #[test]
    fn test_superseded_review_is_ignored() {
        let owner = StageOwner::new(StageKind::RequirementsAnalysis);
        let artifact = in_review(&owner, "r2");
        owner
            .apply(&artifact.id, "r1", &ReviewDecision::default_approval())
            .unwrap();
        assert_eq!(
            owner.get(&artifact.id).unwrap().status,
            ArtifactStatus::PendingReview
        );
    }

    #[test]
    fn test_fail_records_error() {
        let owner = StageOwner::new(StageKind::RequirementsAnalysis);
        let artifact = owner.begin(&requirements_slot(), vec![], |_| true).unwrap();
        let failed = owner.fail(&artifact.id, "model unavailable").unwrap();
        assert_eq!(failed.status, ArtifactStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("model unavailable"));
        assert!(owner.begin(&requirements_slot(), vec![], |_| true).is_ok());
    }

    #[test]
    fn test_scoped_slots_are_independent() {
        let owner = StageOwner::new(StageKind::StoryGeneration);
        let one = Slot::new("p1", StageKind::StoryGeneration, Some("US-1"));
        let two = Slot::new("p1", StageKind::StoryGeneration, Some("US-2"));
        owner.begin(&one, vec![], |_| true).unwrap();
        owner.begin(&two, vec![], |_| true).unwrap();
        assert_eq!(owner.latest_for_project("p1").len(), 2);
        assert!(owner.latest_for_project("p2").is_empty());
    }
}
