//! Stage vocabulary and the artifact each stage instance produces.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::StageError;

/// The four pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StageKind {
    RequirementsAnalysis,
    ProjectPlanning,
    StoryGeneration,
    PromptGeneration,
}

impl StageKind {
    pub const ALL: [StageKind; 4] = [
        StageKind::RequirementsAnalysis,
        StageKind::ProjectPlanning,
        StageKind::StoryGeneration,
        StageKind::PromptGeneration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequirementsAnalysis => "RequirementsAnalysis",
            Self::ProjectPlanning => "ProjectPlanning",
            Self::StoryGeneration => "StoryGeneration",
            Self::PromptGeneration => "PromptGeneration",
        }
    }

    /// The short pipeline-stage tag submitted alongside a review.
    pub fn pipeline_tag(&self) -> &'static str {
        match self {
            Self::RequirementsAnalysis => "Analysis",
            Self::ProjectPlanning => "Planning",
            Self::StoryGeneration => "Stories",
            Self::PromptGeneration => "Prompts",
        }
    }

    /// The stage whose approved artifact gates this one.
    pub fn prerequisite(&self) -> Option<StageKind> {
        match self {
            Self::RequirementsAnalysis => None,
            Self::ProjectPlanning => Some(Self::RequirementsAnalysis),
            Self::StoryGeneration => Some(Self::ProjectPlanning),
            Self::PromptGeneration => Some(Self::StoryGeneration),
        }
    }

    /// Story-scoped stages run once per story key rather than once per project.
    pub fn is_story_scoped(&self) -> bool {
        matches!(self, Self::StoryGeneration | Self::PromptGeneration)
    }

    /// Resolve a stage from either its canonical name, a snake/kebab-case
    /// spelling, or its pipeline tag. Matching is case-insensitive.
    pub fn resolve(name: &str) -> Option<StageKind> {
        let normalized: String = name
            .trim()
            .chars()
            .filter(|c| !matches!(c, '_' | '-' | ' '))
            .collect::<String>()
            .to_lowercase();

        match normalized.as_str() {
            "requirementsanalysis" | "analysis" | "requirements" => {
                Some(Self::RequirementsAnalysis)
            }
            "projectplanning" | "planning" => Some(Self::ProjectPlanning),
            "storygeneration" | "stories" => Some(Self::StoryGeneration),
            "promptgeneration" | "prompts" => Some(Self::PromptGeneration),
            _ => None,
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::resolve(s).ok_or_else(|| format!("Invalid stage: {}", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArtifactStatus {
    NotStarted,
    Processing,
    PendingReview,
    Approved,
    Rejected,
    Failed,
}

impl ArtifactStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "NotStarted",
            Self::Processing => "Processing",
            Self::PendingReview => "PendingReview",
            Self::Approved => "Approved",
            Self::Rejected => "Rejected",
            Self::Failed => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved | Self::Rejected | Self::Failed)
    }

    /// PendingReview may fail only when its review could not be recorded.
    pub fn can_transition_to(&self, to: ArtifactStatus) -> bool {
        matches!(
            (self, to),
            (Self::NotStarted, Self::Processing)
                | (Self::Processing, Self::PendingReview)
                | (Self::Processing, Self::Failed)
                | (Self::PendingReview, Self::Approved)
                | (Self::PendingReview, Self::Rejected)
                | (Self::PendingReview, Self::Failed)
        )
    }
}

impl fmt::Display for ArtifactStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where successive artifacts of one stage instance live: a project-wide
/// stage has no scope, a story-scoped stage is keyed by story.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Slot {
    pub project_id: String,
    pub stage: StageKind,
    pub scope: Option<String>,
}

impl Slot {
    pub fn new(project_id: &str, stage: StageKind, scope: Option<&str>) -> Self {
        Self {
            project_id: project_id.to_string(),
            stage,
            scope: scope.map(str::to_string),
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "{}/{}/{}", self.project_id, self.stage, scope),
            None => write!(f, "{}/{}", self.project_id, self.stage),
        }
    }
}

/// Generated content from one stage instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub project_id: String,
    pub stage: StageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    pub status: ArtifactStatus,
    #[serde(default)]
    pub content: String,
    /// Approved artifacts this one was generated from.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Back-reference to the governing review; never owned here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(slot: &Slot, dependencies: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            project_id: slot.project_id.clone(),
            stage: slot.stage,
            scope: slot.scope.clone(),
            status: ArtifactStatus::NotStarted,
            content: String::new(),
            dependencies,
            review_id: None,
            error: None,
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn slot(&self) -> Slot {
        Slot::new(&self.project_id, self.stage, self.scope.as_deref())
    }

    pub fn transition(&mut self, to: ArtifactStatus) -> Result<(), StageError> {
        if !self.status.can_transition_to(to) {
            return Err(StageError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Story title recorded at generation time, falling back to the first
    /// non-empty content line.
    pub fn title(&self) -> String {
        if let Some(title) = self.metadata.get("title").and_then(|v| v.as_str()) {
            return title.to_string();
        }
        self.content
            .lines()
            .map(|l| l.trim().trim_start_matches('#').trim())
            .find(|l| !l.is_empty())
            .unwrap_or_default()
            .to_string()
    }

    pub fn tags(&self) -> Vec<String> {
        self.metadata
            .get("tags")
            .and_then(|v| v.as_array())
            .map(|tags| {
                tags.iter()
                    .filter_map(|t| t.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order_and_prerequisites() {
        assert_eq!(StageKind::RequirementsAnalysis.prerequisite(), None);
        assert_eq!(
            StageKind::PromptGeneration.prerequisite(),
            Some(StageKind::StoryGeneration)
        );
        assert!(StageKind::ALL.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_resolve_accepts_names_and_tags() {
        assert_eq!(
            StageKind::resolve("RequirementsAnalysis"),
            Some(StageKind::RequirementsAnalysis)
        );
        assert_eq!(
            StageKind::resolve("requirements_analysis"),
            Some(StageKind::RequirementsAnalysis)
        );
        assert_eq!(StageKind::resolve("Analysis"), Some(StageKind::RequirementsAnalysis));
        assert_eq!(StageKind::resolve("prompts"), Some(StageKind::PromptGeneration));
        assert_eq!(StageKind::resolve("Deployment"), None);
        assert!("nope".parse::<StageKind>().is_err());
    }

    #[test]
    fn test_pipeline_tags_round_trip_through_resolve() {
        for stage in StageKind::ALL {
            assert_eq!(StageKind::resolve(stage.pipeline_tag()), Some(stage));
        }
    }

    #[test]
    fn test_valid_transitions() {
        use ArtifactStatus::*;
        assert!(NotStarted.can_transition_to(Processing));
        assert!(Processing.can_transition_to(PendingReview));
        assert!(PendingReview.can_transition_to(Approved));
        assert!(PendingReview.can_transition_to(Rejected));
    }

    #[test]
    fn test_terminal_states_do_not_move() {
        use ArtifactStatus::*;
        for terminal in [Approved, Rejected, Failed] {
            assert!(terminal.is_terminal());
            for to in [NotStarted, Processing, PendingReview, Approved, Rejected, Failed] {
                assert!(!terminal.can_transition_to(to));
            }
        }
        assert!(!NotStarted.can_transition_to(PendingReview));
    }

    #[test]
    fn test_artifact_transition_error() {
        let slot = Slot::new("p1", StageKind::ProjectPlanning, None);
        let mut artifact = Artifact::new(&slot, vec![]);
        let err = artifact.transition(ArtifactStatus::Approved).unwrap_err();
        assert!(matches!(err, StageError::InvalidTransition { .. }));
        assert_eq!(artifact.status, ArtifactStatus::NotStarted);
    }

    #[test]
    fn test_title_and_tags_from_metadata() {
        let slot = Slot::new("p1", StageKind::StoryGeneration, Some("US-1"));
        let mut artifact = Artifact::new(&slot, vec![]);
        artifact.content = "\n# Login form\nAs a user...".to_string();
        assert_eq!(artifact.title(), "Login form");

        artifact
            .metadata
            .insert("title".into(), serde_json::json!("Sign in"));
        artifact
            .metadata
            .insert("tags".into(), serde_json::json!(["auth", "ui"]));
        assert_eq!(artifact.title(), "Sign in");
        assert_eq!(artifact.tags(), vec!["auth", "ui"]);
    }

    #[test]
    fn test_slot_display() {
        assert_eq!(
            Slot::new("p1", StageKind::StoryGeneration, Some("US-2")).to_string(),
            "p1/StoryGeneration/US-2"
        );
        assert_eq!(
            Slot::new("p1", StageKind::ProjectPlanning, None).to_string(),
            "p1/ProjectPlanning"
        );
    }
}
