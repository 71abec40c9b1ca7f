//! Stage gates: whether a stage may begin, given the approval status of its
//! prerequisites.
//!
//! | Stage                | Scope     | Opens when                                   |
//! |----------------------|-----------|----------------------------------------------|
//! | RequirementsAnalysis | project   | always                                       |
//! | ProjectPlanning      | project   | requirements approved                        |
//! | StoryGeneration      | story key | planning approved                            |
//! | PromptGeneration     | story key | the same story's latest artifact approved    |
//!
//! Gates only read a [`PipelineState`] snapshot; stage owners build it.

use std::collections::{BTreeMap, BTreeSet};

use crate::artifact::{Artifact, ArtifactStatus, Slot, StageKind};
use crate::errors::GateError;

/// Latest artifact per slot for one project.
#[derive(Debug, Clone, Default)]
pub struct PipelineState {
    project_id: String,
    latest: BTreeMap<(StageKind, Option<String>), Artifact>,
}

impl PipelineState {
    pub fn new(project_id: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            latest: BTreeMap::new(),
        }
    }

    /// Build a snapshot from candidate artifacts, keeping the newest per slot.
    pub fn from_artifacts(project_id: &str, artifacts: impl IntoIterator<Item = Artifact>) -> Self {
        let mut state = Self::new(project_id);
        for artifact in artifacts {
            state.record(artifact);
        }
        state
    }

    /// Record an artifact, replacing the slot's current entry if this one is
    /// not older. Artifacts from other projects are ignored.
    pub fn record(&mut self, artifact: Artifact) {
        if artifact.project_id != self.project_id {
            return;
        }
        let key = (artifact.stage, artifact.scope.clone());
        match self.latest.get(&key) {
            Some(existing) if existing.created_at > artifact.created_at => {}
            _ => {
                self.latest.insert(key, artifact);
            }
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn latest(&self, stage: StageKind, scope: Option<&str>) -> Option<&Artifact> {
        self.latest.get(&(stage, scope.map(str::to_string)))
    }

    pub fn artifacts(&self) -> impl Iterator<Item = &Artifact> {
        self.latest.values()
    }

    pub fn artifacts_for(&self, stage: StageKind) -> impl Iterator<Item = &Artifact> {
        self.latest.values().filter(move |a| a.stage == stage)
    }

    /// Story keys known to the pipeline, i.e. every StoryGeneration slot.
    pub fn story_scopes(&self) -> Vec<String> {
        self.artifacts_for(StageKind::StoryGeneration)
            .filter_map(|a| a.scope.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    fn is_approved(&self, stage: StageKind, scope: Option<&str>) -> bool {
        self.latest(stage, scope)
            .is_some_and(|a| a.status == ArtifactStatus::Approved)
    }

    /// Requirements and planning approved, at least one story, and every
    /// story approved together with its prompt.
    pub fn is_complete(&self) -> bool {
        let stories = self.story_scopes();
        self.is_approved(StageKind::RequirementsAnalysis, None)
            && self.is_approved(StageKind::ProjectPlanning, None)
            && !stories.is_empty()
            && stories.iter().all(|story| {
                self.is_approved(StageKind::StoryGeneration, Some(story))
                    && self.is_approved(StageKind::PromptGeneration, Some(story))
            })
    }
}

/// Check a stage's gate. On success returns the ids of the approved
/// prerequisite artifacts, which become the new artifact's dependencies.
pub fn check(
    stage: StageKind,
    scope: Option<&str>,
    state: &PipelineState,
) -> Result<Vec<String>, GateError> {
    let scope = validate_scope(stage, scope)?;
    let slot = Slot::new(state.project_id(), stage, scope);

    let Some(prerequisite) = stage.prerequisite() else {
        return Ok(Vec::new());
    };

    // Stories hang off the project-wide plan; prompts off their own story.
    let prerequisite_scope = if prerequisite.is_story_scoped() { scope } else { None };

    match state.latest(prerequisite, prerequisite_scope) {
        Some(artifact) if artifact.status == ArtifactStatus::Approved => {
            Ok(vec![artifact.id.clone()])
        }
        _ => {
            let missing = match prerequisite_scope {
                Some(s) => format!("{} ({})", prerequisite, s),
                None => prerequisite.to_string(),
            };
            Err(GateError::PrerequisitesNotMet {
                stage,
                slot: slot.to_string(),
                missing: vec![missing],
            })
        }
    }
}

/// True only if every prerequisite artifact is approved.
pub fn can_start(stage: StageKind, scope: Option<&str>, state: &PipelineState) -> bool {
    check(stage, scope, state).is_ok()
}

/// A slot may take a fresh artifact only once its latest one is settled:
/// rejected, failed, or awaiting a review that is no longer pending.
pub fn ensure_slot_free(latest: &Artifact, review_pending: bool) -> Result<(), GateError> {
    let busy = match latest.status {
        ArtifactStatus::NotStarted | ArtifactStatus::Processing | ArtifactStatus::Approved => true,
        ArtifactStatus::PendingReview => review_pending,
        ArtifactStatus::Rejected | ArtifactStatus::Failed => false,
    };

    if busy {
        return Err(GateError::SlotBusy {
            stage: latest.stage,
            slot: latest.slot().to_string(),
            artifact_id: latest.id.clone(),
            status: latest.status,
        });
    }
    Ok(())
}

fn validate_scope(stage: StageKind, scope: Option<&str>) -> Result<Option<&str>, GateError> {
    let scope = scope.map(str::trim).filter(|s| !s.is_empty());
    match (stage.is_story_scoped(), scope) {
        (true, None) => Err(GateError::InvalidScope {
            stage,
            reason: "a story key is required".to_string(),
        }),
        (false, Some(s)) => Err(GateError::InvalidScope {
            stage,
            reason: format!("project-wide stage does not take a story key (got '{}')", s),
        }),
        (_, scope) => Ok(scope),
    }
}
