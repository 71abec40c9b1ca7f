//! The process-wide pipeline: one review store, service, dispatcher and
//! sweeper wired to the four stage owners.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::artifact::{Artifact, ArtifactStatus, Slot, StageKind};
use crate::context::{ContextAssembler, ContextConfig, ContextRequest};
use crate::errors::StageError;
use crate::gates::{self, PipelineState};
use crate::generate::{GenerationRequest, Generator};
use crate::review::{
    ApprovalDispatcher, ExpirySweeper, ReviewConfig, ReviewService, ReviewStore, ReviewSubmission,
    SubmitRequest,
};
use crate::stages::StageOwner;
use crate::workflow::WorkflowStatus;

/// Input for one stage run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRequest {
    pub project_id: String,
    pub stage: StageKind,
    /// Story key for story-scoped stages.
    #[serde(default)]
    pub scope: Option<String>,
    /// Brief for requirements; extra instructions for later stages.
    #[serde(default)]
    pub input: String,
    /// Story title, recorded on story artifacts.
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Free-form preferences passed to prompt generation.
    #[serde(default)]
    pub preferences: Option<String>,
}

impl StageRequest {
    pub fn new(project_id: &str, stage: StageKind) -> Self {
        Self {
            project_id: project_id.to_string(),
            stage,
            scope: None,
            input: String::new(),
            title: None,
            tags: Vec::new(),
            preferences: None,
        }
    }

    pub fn with_scope(mut self, scope: &str) -> Self {
        self.scope = Some(scope.to_string());
        self
    }

    pub fn with_input(mut self, input: &str) -> Self {
        self.input = input.to_string();
        self
    }

    pub fn with_title(mut self, title: &str) -> Self {
        self.title = Some(title.to_string());
        self
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_preferences(mut self, preferences: &str) -> Self {
        self.preferences = Some(preferences.to_string());
        self
    }
}

/// A stage run that reached review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRun {
    pub artifact: Artifact,
    pub review: ReviewSubmission,
}

/// Marks a Processing artifact Failed if its run is dropped before it
/// settles.
struct RunGuard<'a> {
    owner: &'a StageOwner,
    artifact_id: String,
    armed: bool,
}

impl<'a> RunGuard<'a> {
    fn new(owner: &'a StageOwner, artifact_id: &str) -> Self {
        Self {
            owner,
            artifact_id: artifact_id.to_string(),
            armed: true,
        }
    }

    fn fail(mut self, error: &str) {
        self.armed = false;
        self.record_failure(error);
    }

    fn disarm(mut self) {
        self.armed = false;
    }

    fn record_failure(&self, error: &str) {
        if let Err(e) = self.owner.fail(&self.artifact_id, error) {
            warn!(
                artifact_id = %self.artifact_id,
                error = %e,
                "Could not mark stage run failed"
            );
        }
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.record_failure("stage run cancelled");
        }
    }
}

pub struct Pipeline {
    service: Arc<ReviewService>,
    requirements: Arc<StageOwner>,
    planning: Arc<StageOwner>,
    stories: Arc<StageOwner>,
    prompts: Arc<StageOwner>,
    generator: Arc<dyn Generator>,
    assembler: ContextAssembler,
    sweeper: ExpirySweeper,
}

impl Pipeline {
    pub fn new(review: ReviewConfig, context: ContextConfig, generator: Arc<dyn Generator>) -> Self {
        let requirements = Arc::new(StageOwner::new(StageKind::RequirementsAnalysis));
        let planning = Arc::new(StageOwner::new(StageKind::ProjectPlanning));
        let stories = Arc::new(StageOwner::new(StageKind::StoryGeneration));
        let prompts = Arc::new(StageOwner::new(StageKind::PromptGeneration));

        let dispatcher = ApprovalDispatcher::new()
            .with_handler(requirements.clone())
            .with_handler(planning.clone())
            .with_handler(stories.clone())
            .with_handler(prompts.clone());

        let service = Arc::new(ReviewService::new(
            Arc::new(ReviewStore::new()),
            Arc::new(dispatcher),
            review,
        ));
        let sweeper = ExpirySweeper::from_service(Arc::clone(&service));

        Self {
            service,
            requirements,
            planning,
            stories,
            prompts,
            generator,
            assembler: ContextAssembler::new(context),
            sweeper,
        }
    }

    pub fn service(&self) -> &Arc<ReviewService> {
        &self.service
    }

    pub fn sweeper(&self) -> &ExpirySweeper {
        &self.sweeper
    }

    pub fn assembler(&self) -> &ContextAssembler {
        &self.assembler
    }

    pub fn owner(&self, stage: StageKind) -> &Arc<StageOwner> {
        match stage {
            StageKind::RequirementsAnalysis => &self.requirements,
            StageKind::ProjectPlanning => &self.planning,
            StageKind::StoryGeneration => &self.stories,
            StageKind::PromptGeneration => &self.prompts,
        }
    }

    /// Start background expiry. Returns false if it was already running.
    pub fn start(&self) -> bool {
        self.sweeper.start()
    }

    pub async fn shutdown(&self) {
        self.sweeper.stop().await;
    }

    /// Snapshot of the latest artifact in every slot of a project.
    pub fn state(&self, project_id: &str) -> PipelineState {
        PipelineState::from_artifacts(
            project_id,
            StageKind::ALL
                .into_iter()
                .flat_map(|stage| self.owner(stage).latest_for_project(project_id)),
        )
    }

    pub fn workflow_status(&self, project_id: &str) -> WorkflowStatus {
        WorkflowStatus::from_state(&self.state(project_id))
    }

    /// Run one stage through to review.
    ///
    /// The gate is checked before anything is created, so a refused run
    /// leaves no artifact behind. Once the slot is claimed, every failure
    /// marks the new artifact Failed.
    pub async fn run_stage(&self, request: StageRequest) -> Result<StageRun, StageError> {
        let stage = request.stage;
        let project_id = request.project_id.trim();
        let scope = request
            .scope
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());

        if stage == StageKind::RequirementsAnalysis && request.input.trim().is_empty() {
            return Err(StageError::MissingInput { stage });
        }

        let state = self.state(project_id);
        let dependencies = gates::check(stage, scope, &state)?;

        let (input, mut metadata) = self.stage_input(stage, scope, &request, &state);

        let owner = self.owner(stage);
        let store = self.service.store();
        let slot = Slot::new(project_id, stage, scope);
        let artifact = owner.begin(&slot, dependencies, |review_id| {
            store.get(review_id).is_some_and(|r| r.is_pending())
        })?;
        let guard = RunGuard::new(owner, &artifact.id);

        let generation = GenerationRequest::for_stage(project_id, stage, scope, &input);
        let content = match self.generator.generate(&generation).await {
            Ok(content) => content,
            Err(e) => {
                guard.fail(&format!("{:#}", e));
                return Err(StageError::Generation(e));
            }
        };

        if let Some(ref title) = request.title {
            metadata.insert("title".into(), json!(title));
        }
        if !request.tags.is_empty() {
            metadata.insert("tags".into(), json!(request.tags));
        }
        owner.complete(&artifact.id, content.clone(), metadata.clone())?;

        let submission =
            SubmitRequest::new(stage.as_str(), &content, &artifact.id, stage.pipeline_tag())
                .with_original_request(&generation.prompt)
                .with_ai_response(&content)
                .with_metadata(metadata);

        let review = match self.service.submit(submission).await {
            Ok(review) => review,
            Err(e) => {
                guard.fail(&e.to_string());
                return Err(e.into());
            }
        };
        guard.disarm();
        owner.attach_review(&artifact.id, &review.id)?;

        info!(
            artifact_id = %artifact.id,
            review_id = %review.id,
            stage = %stage,
            project_id,
            "Stage submitted for review"
        );

        let artifact = owner
            .get(&artifact.id)
            .ok_or_else(|| StageError::ArtifactNotFound {
                id: artifact.id.clone(),
            })?;
        Ok(StageRun { artifact, review })
    }

    /// The generator input for a stage, plus metadata to carry onto the
    /// artifact and review.
    fn stage_input(
        &self,
        stage: StageKind,
        scope: Option<&str>,
        request: &StageRequest,
        state: &PipelineState,
    ) -> (String, HashMap<String, serde_json::Value>) {
        let extra = request.input.trim();

        if stage == StageKind::PromptGeneration
            && let Some(story) = scope
            && let Some(context) =
                ContextRequest::from_state(state, story, request.preferences.as_deref())
        {
            let assembled = self.assembler.assemble(&context);
            let mut text = assembled.text;
            if !extra.is_empty() {
                text = format!("{}\n\n## Instructions\n\n{}", text, extra);
            }
            return (text, assembled.metadata.to_map());
        }

        let upstream = stage
            .prerequisite()
            .and_then(|prereq| {
                let prereq_scope = if prereq.is_story_scoped() { scope } else { None };
                state.latest(prereq, prereq_scope)
            })
            .filter(|a| a.status == ArtifactStatus::Approved)
            .map(|a| a.content.as_str())
            .unwrap_or_default();

        let text = match (extra.is_empty(), upstream.is_empty()) {
            (false, false) => format!("{}\n\n{}", upstream, extra),
            (true, _) => upstream.to_string(),
            (false, true) => extra.to_string(),
        };
        (text, HashMap::new())
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("service", &self.service)
            .field("sweeper", &self.sweeper)
            .finish()
    }
}
