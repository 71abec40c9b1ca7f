//! Read-only workflow summary for a project.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifact::{ArtifactStatus, StageKind};
use crate::gates::PipelineState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactSummary {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    pub status: ArtifactStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSummary {
    pub stage: StageKind,
    pub artifacts: Vec<ArtifactSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStatus {
    pub project_id: String,
    pub stages: Vec<StageSummary>,
    pub completion_percentage: f64,
    pub complete: bool,
}

impl WorkflowStatus {
    /// Summarise the latest artifact of every slot.
    ///
    /// Completion counts approved units out of 2 + 2 per story (a story and
    /// its prompt). With no stories yet, stories and prompts count one unit
    /// each.
    pub fn from_state(state: &PipelineState) -> Self {
        let stages = StageKind::ALL
            .into_iter()
            .map(|stage| {
                let mut artifacts: Vec<ArtifactSummary> = state
                    .artifacts_for(stage)
                    .map(|a| ArtifactSummary {
                        id: a.id.clone(),
                        scope: a.scope.clone(),
                        status: a.status,
                        review_id: a.review_id.clone(),
                        updated_at: a.updated_at,
                    })
                    .collect();
                artifacts.sort_by(|a, b| a.scope.cmp(&b.scope));
                StageSummary { stage, artifacts }
            })
            .collect();

        let approved = |stage: StageKind, scope: Option<&str>| {
            usize::from(
                state
                    .latest(stage, scope)
                    .is_some_and(|a| a.status == ArtifactStatus::Approved),
            )
        };

        let stories = state.story_scopes();
        let expected = 2 + 2 * stories.len().max(1);
        let done = approved(StageKind::RequirementsAnalysis, None)
            + approved(StageKind::ProjectPlanning, None)
            + stories
                .iter()
                .map(|s| {
                    approved(StageKind::StoryGeneration, Some(s))
                        + approved(StageKind::PromptGeneration, Some(s))
                })
                .sum::<usize>();

        let percentage = (done as f64 / expected as f64) * 100.0;

        Self {
            project_id: state.project_id().to_string(),
            stages,
            completion_percentage: (percentage * 10.0).round() / 10.0,
            complete: state.is_complete(),
        }
    }

    pub fn stage(&self, stage: StageKind) -> Option<&StageSummary> {
        self.stages.iter().find(|s| s.stage == stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{Artifact, Slot};

    fn artifact(stage: StageKind, scope: Option<&str>, status: ArtifactStatus) -> Artifact {
        let mut a = Artifact::new(&Slot::new("p1", stage, scope), vec![]);
        a.status = status;
        a
    }

    #[test]
    fn test_empty_project() {
        let status = WorkflowStatus::from_state(&PipelineState::new("p1"));
        assert_eq!(status.completion_percentage, 0.0);
        assert!(!status.complete);
        assert_eq!(status.stages.len(), 4);
        assert!(status.stages.iter().all(|s| s.artifacts.is_empty()));
    }

    #[test]
    fn test_requirements_approved_is_a_quarter() {
        let state = PipelineState::from_artifacts(
            "p1",
            [artifact(StageKind::RequirementsAnalysis, None, ArtifactStatus::Approved)],
        );
        let status = WorkflowStatus::from_state(&state);
        assert_eq!(status.completion_percentage, 25.0);
    }

    #[test]
    fn test_story_units() {
        let state = PipelineState::from_artifacts(
            "p1",
            [
                artifact(StageKind::RequirementsAnalysis, None, ArtifactStatus::Approved),
                artifact(StageKind::ProjectPlanning, None, ArtifactStatus::Approved),
                artifact(StageKind::StoryGeneration, Some("US-1"), ArtifactStatus::Approved),
                artifact(StageKind::StoryGeneration, Some("US-2"), ArtifactStatus::PendingReview),
                artifact(StageKind::PromptGeneration, Some("US-1"), ArtifactStatus::Approved),
            ],
        );
        let status = WorkflowStatus::from_state(&state);
        // 4 of 6 units.
        assert_eq!(status.completion_percentage, 66.7);
        assert!(!status.complete);

        let stories = status.stage(StageKind::StoryGeneration).unwrap();
        let scopes: Vec<_> = stories.artifacts.iter().map(|a| a.scope.as_deref()).collect();
        assert_eq!(scopes, vec![Some("US-1"), Some("US-2")]);
    }

    #[test]
    fn test_complete_project_is_full() {
        let state = PipelineState::from_artifacts(
            "p1",
            [
                artifact(StageKind::RequirementsAnalysis, None, ArtifactStatus::Approved),
                artifact(StageKind::ProjectPlanning, None, ArtifactStatus::Approved),
                artifact(StageKind::StoryGeneration, Some("US-1"), ArtifactStatus::Approved),
                artifact(StageKind::PromptGeneration, Some("US-1"), ArtifactStatus::Approved),
            ],
        );
        let status = WorkflowStatus::from_state(&state);
        assert_eq!(status.completion_percentage, 100.0);
        assert!(status.complete);
    }
}
