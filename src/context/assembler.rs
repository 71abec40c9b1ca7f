//! Builds the bounded input for prompt generation.
//!
//! Sections in priority order: the target story (never cut), the approved
//! architecture (truncated), excerpts of the top related stories, then
//! caller preferences (whole or not at all).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use super::budget::{ContextBudget, estimate_tokens};
use super::relatedness::{StoryRef, rank};
use crate::artifact::{ArtifactStatus, StageKind};
use crate::gates::PipelineState;

pub const TRUNCATION_MARKER: &str = "\n[truncated]";

/// Warning recorded when the target story alone exceeds the budget.
pub const SIZE_EXCEEDED: &str = "size_exceeded";
pub const PREFERENCES_DROPPED: &str = "preferences_dropped";

const SECTION_SEPARATOR: &str = "\n\n";
const RELATED_HEADING: &str = "## Related Stories\n\n";
/// Below this many characters an architecture excerpt is not worth keeping.
const MIN_ARCHITECTURE_CHARS: usize = 64;
const MIN_EXCERPT_CHARS: usize = 32;

/// Assembly limits.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextConfig {
    pub budget: ContextBudget,
    pub model_window_chars: usize,
    pub related_top_k: usize,
    pub max_excerpt_chars: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            budget: ContextBudget::default(),
            model_window_chars: 22_500,
            related_top_k: 3,
            max_excerpt_chars: 800,
        }
    }
}

impl ContextConfig {
    pub fn with_budget(mut self, budget: ContextBudget) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_related_top_k(mut self, k: usize) -> Self {
        self.related_top_k = k;
        self
    }

    pub fn with_max_excerpt_chars(mut self, chars: usize) -> Self {
        self.max_excerpt_chars = chars;
        self
    }

    pub fn budget_chars(&self) -> usize {
        self.budget.effective_chars(self.model_window_chars)
    }
}

/// Everything the assembler may draw on for one story.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextRequest {
    pub target: StoryRef,
    #[serde(default)]
    pub architecture: Option<String>,
    #[serde(default)]
    pub related: Vec<StoryRef>,
    #[serde(default)]
    pub preferences: Option<String>,
}

impl ContextRequest {
    pub fn new(target: StoryRef) -> Self {
        Self {
            target,
            architecture: None,
            related: Vec::new(),
            preferences: None,
        }
    }

    pub fn with_architecture(mut self, architecture: &str) -> Self {
        self.architecture = Some(architecture.to_string());
        self
    }

    pub fn with_related(mut self, related: Vec<StoryRef>) -> Self {
        self.related = related;
        self
    }

    pub fn with_preferences(mut self, preferences: &str) -> Self {
        self.preferences = Some(preferences.to_string());
        self
    }

    /// Gather inputs for `story` from approved pipeline artifacts: the story
    /// itself, the approved plan as architecture, and every other approved
    /// story as a candidate. `None` if the story itself is not approved.
    pub fn from_state(
        state: &PipelineState,
        story: &str,
        preferences: Option<&str>,
    ) -> Option<Self> {
        let approved_story = |scope: &str| {
            state
                .latest(StageKind::StoryGeneration, Some(scope))
                .filter(|a| a.status == ArtifactStatus::Approved)
        };

        let target = approved_story(story).map(|a| StoryRef {
            id: story.to_string(),
            title: a.title(),
            tags: a.tags(),
            body: a.content.clone(),
        })?;

        let architecture = state
            .latest(StageKind::ProjectPlanning, None)
            .filter(|a| a.status == ArtifactStatus::Approved)
            .map(|a| a.content.clone());

        let related = state
            .story_scopes()
            .into_iter()
            .filter(|scope| scope != story)
            .filter_map(|scope| {
                approved_story(&scope).map(|a| StoryRef {
                    id: scope.clone(),
                    title: a.title(),
                    tags: a.tags(),
                    body: a.content.clone(),
                })
            })
            .collect();

        Some(Self {
            target,
            architecture,
            related,
            preferences: preferences.map(str::to_string),
        })
    }
}

/// What went into an assembled context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextMetadata {
    pub budget_chars: usize,
    pub char_count: usize,
    pub estimated_tokens: usize,
    pub included_related: Vec<String>,
    pub dropped_related: Vec<String>,
    pub architecture_truncated: bool,
    pub preferences_included: bool,
    pub warnings: Vec<String>,
}

impl ContextMetadata {
    pub fn has_warning(&self, warning: &str) -> bool {
        self.warnings.iter().any(|w| w == warning)
    }

    /// Flatten into submission metadata entries.
    pub fn to_map(&self) -> HashMap<String, serde_json::Value> {
        HashMap::from([
            ("context_budget_chars".to_string(), json!(self.budget_chars)),
            ("char_count".to_string(), json!(self.char_count)),
            ("estimated_tokens".to_string(), json!(self.estimated_tokens)),
            ("included_related".to_string(), json!(self.included_related)),
            ("dropped_related".to_string(), json!(self.dropped_related)),
            (
                "architecture_truncated".to_string(),
                json!(self.architecture_truncated),
            ),
            (
                "preferences_included".to_string(),
                json!(self.preferences_included),
            ),
            ("warnings".to_string(), json!(self.warnings)),
        ])
    }
}

#[derive(Debug, Clone)]
pub struct AssembledContext {
    pub text: String,
    pub metadata: ContextMetadata,
}

/// Working set of rendered sections while the budget is enforced.
struct Sections {
    target: String,
    architecture: Option<String>,
    related: Vec<(String, String)>,
    preferences: Option<String>,
}

impl Sections {
    fn render(&self) -> String {
        let mut parts: Vec<String> = vec![self.target.clone()];
        if let Some(ref arch) = self.architecture {
            parts.push(arch.clone());
        }
        if !self.related.is_empty() {
            let items: Vec<&str> = self.related.iter().map(|(_, s)| s.as_str()).collect();
            parts.push(format!("{}{}", RELATED_HEADING, items.join(SECTION_SEPARATOR)));
        }
        if let Some(ref prefs) = self.preferences {
            parts.push(prefs.clone());
        }
        parts.join(SECTION_SEPARATOR)
    }

    fn len(&self) -> usize {
        self.render().chars().count()
    }
}

/// Compresses a [`ContextRequest`] to the configured budget.
#[derive(Debug, Clone, Default)]
pub struct ContextAssembler {
    config: ContextConfig,
}

impl ContextAssembler {
    pub fn new(config: ContextConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Assemble a context. Never fails: if the target story alone is over
    /// budget it is returned alone with a `size_exceeded` warning.
    pub fn assemble(&self, request: &ContextRequest) -> AssembledContext {
        let target = &request.target;
        let budget = self.config.budget_chars();
        let mut metadata = ContextMetadata {
            budget_chars: budget,
            ..ContextMetadata::default()
        };

        let target_section = format!(
            "## Target Story: {} - {}\n\n{}",
            target.id, target.title, target.body
        );
        let target_len = target_section.chars().count();

        let (ranked, mut dropped) = rank(target, &request.related, self.config.related_top_k);

        if target_len > budget {
            warn!(
                story = %target.id,
                chars = target_len,
                budget,
                "Target story alone exceeds the context budget"
            );
            metadata.warnings.push(SIZE_EXCEEDED.to_string());
            dropped.extend(ranked.iter().map(|r| r.story.id.clone()));
            metadata.dropped_related = dropped;
            return finish(target_section, metadata);
        }

        let mut remaining = budget - target_len;

        // Architecture: at most half of what is left.
        let mut architecture = None;
        if let Some(arch) = request.architecture.as_deref().filter(|a| !a.trim().is_empty()) {
            let allowance = (remaining / 2).saturating_sub(SECTION_SEPARATOR.len());
            if let Some((section, truncated)) = architecture_section(arch, allowance) {
                remaining = remaining
                    .saturating_sub(section.chars().count() + SECTION_SEPARATOR.len());
                metadata.architecture_truncated = truncated;
                architecture = Some(section);
            } else {
                metadata.architecture_truncated = true;
            }
        }

        // Related excerpts: at most 60% of the rest, split evenly.
        let mut related = Vec::new();
        if !ranked.is_empty() {
            let allowance = remaining * 60 / 100;
            let per_story = (allowance / ranked.len()).min(self.config.max_excerpt_chars);
            for r in &ranked {
                let heading = format!("### {} - {}\n", r.story.id, r.story.title);
                let room = per_story.saturating_sub(heading.chars().count());
                if room < MIN_EXCERPT_CHARS {
                    dropped.push(r.story.id.clone());
                    continue;
                }
                let (excerpt, _) = truncate_at_boundary(&r.story.body, room);
                related.push((r.story.id.clone(), format!("{}{}", heading, excerpt)));
            }
            // The heading is only rendered when an excerpt survived.
            if !related.is_empty() {
                let used: usize = related
                    .iter()
                    .map(|(_, s)| s.chars().count() + SECTION_SEPARATOR.len())
                    .sum();
                remaining = remaining.saturating_sub(used + RELATED_HEADING.len());
            }
        }

        // Preferences: whole or not at all.
        let mut preferences = None;
        if let Some(prefs) = request.preferences.as_deref().filter(|p| !p.trim().is_empty()) {
            let section = format!("## Preferences\n\n{}", prefs.trim());
            if section.chars().count() + SECTION_SEPARATOR.len() <= remaining {
                preferences = Some(section);
            } else {
                metadata.warnings.push(PREFERENCES_DROPPED.to_string());
            }
        }

        let mut sections = Sections {
            target: target_section,
            architecture,
            related,
            preferences,
        };
        self.enforce(&mut sections, request, budget, &mut metadata, &mut dropped);

        metadata.preferences_included = sections.preferences.is_some();
        metadata.included_related = sections.related.iter().map(|(id, _)| id.clone()).collect();
        metadata.dropped_related = dropped;

        debug!(
            story = %target.id,
            related = metadata.included_related.len(),
            architecture_truncated = metadata.architecture_truncated,
            "Assembled prompt context"
        );
        finish(sections.render(), metadata)
    }

    /// Final guard: drop preferences, then the weakest excerpts, then shrink
    /// the architecture until the text fits.
    fn enforce(
        &self,
        sections: &mut Sections,
        request: &ContextRequest,
        budget: usize,
        metadata: &mut ContextMetadata,
        dropped: &mut Vec<String>,
    ) {
        loop {
            let len = sections.len();
            if len <= budget {
                return;
            }

            if sections.preferences.take().is_some() {
                metadata.warnings.push(PREFERENCES_DROPPED.to_string());
                continue;
            }

            if let Some((id, _)) = sections.related.pop() {
                dropped.push(id);
                continue;
            }

            let Some(ref current) = sections.architecture else {
                // Only the target is left and it fits.
                return;
            };
            let overflow = len - budget;
            let shrunk_to = current.chars().count().saturating_sub(overflow);
            metadata.architecture_truncated = true;
            sections.architecture = request
                .architecture
                .as_deref()
                .and_then(|arch| architecture_section(arch, shrunk_to))
                .map(|(section, _)| section);
        }
    }
}

fn finish(text: String, mut metadata: ContextMetadata) -> AssembledContext {
    metadata.char_count = text.chars().count();
    metadata.estimated_tokens = estimate_tokens(&text);
    AssembledContext { text, metadata }
}

/// Render the architecture section within `max_chars`, or `None` if there
/// is no useful room.
fn architecture_section(arch: &str, max_chars: usize) -> Option<(String, bool)> {
    const HEADING: &str = "## Architecture\n\n";
    let room = max_chars.checked_sub(HEADING.len())?;
    if room < MIN_ARCHITECTURE_CHARS {
        return None;
    }
    let (body, truncated) = truncate_at_boundary(arch.trim(), room);
    Some((format!("{}{}", HEADING, body), truncated))
}

/// Cut `text` to at most `max_chars` characters, preferring a line break and
/// then a space in the latter half of the allowance, and append
/// [`TRUNCATION_MARKER`] when anything was removed.
pub fn truncate_at_boundary(text: &str, max_chars: usize) -> (String, bool) {
    if text.chars().count() <= max_chars {
        return (text.to_string(), false);
    }

    let marker_len = TRUNCATION_MARKER.chars().count();
    let Some(keep) = max_chars.checked_sub(marker_len) else {
        return (String::new(), true);
    };

    let end = text
        .char_indices()
        .nth(keep)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    let prefix = &text[..end];

    let floor = prefix.len() / 2;
    let cut = prefix
        .rfind('\n')
        .filter(|&i| i >= floor)
        .or_else(|| prefix.rfind(' ').filter(|&i| i >= floor))
        .unwrap_or(prefix.len());

    let mut out = prefix[..cut].trim_end().to_string();
    out.push_str(TRUNCATION_MARKER);
    (out, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{Artifact, Slot};

    fn story(id: &str, title: &str, body: &str, tags: &[&str]) -> StoryRef {
        StoryRef::new(id, title, body).with_tags(tags)
    }

    fn filler(word: &str, chars: usize) -> String {
        let mut text = String::new();
        let mut line = 0;
        while text.len() < chars {
            line += 1;
            text.push_str(&format!("{} line {} describes a component.\n", word, line));
        }
        text.truncate(chars);
        text
    }

    #[test]
    fn test_truncate_prefers_line_boundary() {
        let text = "first line\nsecond line\nthird line that is long";
        let (out, truncated) = truncate_at_boundary(text, 36);
        assert!(truncated);
        assert!(out.chars().count() <= 36);
        assert_eq!(out, format!("first line\nsecond line{}", TRUNCATION_MARKER));
    }

    #[test]
    fn test_truncate_keeps_short_text() {
        let (out, truncated) = truncate_at_boundary("short", 100);
        assert_eq!(out, "short");
        assert!(!truncated);
    }

    #[test]
    fn test_truncate_respects_multibyte_chars() {
        let text = "é".repeat(100);
        let (out, truncated) = truncate_at_boundary(&text, 50);
        assert!(truncated);
        assert!(out.chars().count() <= 50);
    }

    #[test]
    fn test_large_inputs_fit_budget_with_top_k_related() {
        let target_body = "a".repeat(440);
        let target = story("US-1", "Checkout flow", &target_body, &["payments", "cart"]);

        let mut related = Vec::new();
        for i in 2..=11 {
            let tags: &[&str] = if i <= 5 { &["payments"] } else { &["reporting"] };
            related.push(story(
                &format!("US-{:02}", i),
                &format!("Story {}", i),
                &filler("payments", 3_000),
                tags,
            ));
        }

        let request = ContextRequest::new(target)
            .with_architecture(&filler("architecture", 20_000))
            .with_related(related);

        let assembler = ContextAssembler::default();
        let out = assembler.assemble(&request);

        assert!(out.text.chars().count() <= 9_000);
        assert!(out.text.contains(&target_body));
        assert_eq!(out.metadata.char_count, out.text.chars().count());
        assert!(out.metadata.architecture_truncated);
        assert!(out.text.contains("[truncated]"));
        assert!(out.metadata.included_related.len() <= 3);
        assert_eq!(out.metadata.included_related, vec!["US-02", "US-03", "US-04"]);
        assert_eq!(
            out.metadata.included_related.len() + out.metadata.dropped_related.len(),
            10
        );
        assert!(out.metadata.warnings.is_empty());
    }

    #[test]
    fn test_target_over_budget_is_kept_with_warning() {
        let config = ContextConfig::default().with_budget(ContextBudget::Absolute(100));
        let target = story("US-1", "Huge", &"x".repeat(500), &[]);
        let request = ContextRequest::new(target).with_architecture("arch");

        let out = ContextAssembler::new(config).assemble(&request);
        assert!(out.text.contains(&"x".repeat(500)));
        assert!(!out.text.contains("## Architecture"));
        assert!(out.metadata.has_warning(SIZE_EXCEEDED));
    }

    #[test]
    fn test_preferences_dropped_when_no_room() {
        let config = ContextConfig::default().with_budget(ContextBudget::Absolute(400));
        let target = story("US-1", "Login", &"t".repeat(200), &[]);
        let request = ContextRequest::new(target).with_preferences(&"p".repeat(300));

        let out = ContextAssembler::new(config).assemble(&request);
        assert!(!out.metadata.preferences_included);
        assert!(out.metadata.has_warning(PREFERENCES_DROPPED));
        assert!(out.text.chars().count() <= 400);
    }

    #[test]
    fn test_dropped_excerpts_leave_their_heading_budget_to_preferences() {
        let target = story("US-1", "Login", "email password sign in", &["auth"]);
        let target_len = format!("## Target Story: US-1 - Login\n\n{}", target.body)
            .chars()
            .count();
        let prefs = "p".repeat(120);
        let prefs_len = format!("## Preferences\n\n{}", prefs).chars().count();

        // Exactly enough for target and preferences, nothing to spare.
        let budget = target_len + SECTION_SEPARATOR.len() + prefs_len;
        let config = ContextConfig::default()
            .with_budget(ContextBudget::Absolute(budget))
            .with_max_excerpt_chars(MIN_EXCERPT_CHARS - 1);
        let request = ContextRequest::new(target)
            .with_related(vec![story("US-2", "Logout", "session ends", &["auth"])])
            .with_preferences(&prefs);

        let out = ContextAssembler::new(config).assemble(&request);
        assert!(out.metadata.included_related.is_empty());
        assert_eq!(out.metadata.dropped_related, vec!["US-2"]);
        assert!(out.metadata.preferences_included);
        assert!(!out.metadata.has_warning(PREFERENCES_DROPPED));
        assert!(!out.text.contains("Related Stories"));
        assert_eq!(out.text.chars().count(), budget);
    }

    #[test]
    fn test_preferences_kept_whole_when_they_fit() {
        let target = story("US-1", "Login", "short story", &[]);
        let request = ContextRequest::new(target).with_preferences("Use Rust and axum.");

        let out = ContextAssembler::default().assemble(&request);
        assert!(out.metadata.preferences_included);
        assert!(out.text.contains("Use Rust and axum."));
        assert_eq!(out.metadata.estimated_tokens, out.text.chars().count().div_ceil(4));
    }

    #[test]
    fn test_unrelated_stories_never_included() {
        let target = story("US-1", "Login", "email password", &["auth"]);
        let request = ContextRequest::new(target)
            .with_related(vec![story("US-2", "Charts", "quarterly revenue", &["reports"])]);

        let out = ContextAssembler::default().assemble(&request);
        assert!(out.metadata.included_related.is_empty());
        assert_eq!(out.metadata.dropped_related, vec!["US-2"]);
        assert!(!out.text.contains("Related Stories"));
    }

    #[test]
    fn test_from_state_uses_approved_artifacts() {
        let approved = |stage, scope: Option<&str>, content: &str| {
            let mut a = Artifact::new(&Slot::new("p1", stage, scope), vec![]);
            a.status = ArtifactStatus::Approved;
            a.content = content.to_string();
            a
        };
        let mut pending = approved(StageKind::StoryGeneration, Some("US-3"), "# Draft");
        pending.status = ArtifactStatus::PendingReview;

        let state = PipelineState::from_artifacts(
            "p1",
            [
                approved(StageKind::ProjectPlanning, None, "## Components"),
                approved(StageKind::StoryGeneration, Some("US-1"), "# Login\nbody"),
                approved(StageKind::StoryGeneration, Some("US-2"), "# Logout\nbody"),
                pending,
            ],
        );

        let request = ContextRequest::from_state(&state, "US-1", Some("prefs")).unwrap();
        let target = &request.target;
        assert_eq!(target.title, "Login");
        assert_eq!(request.architecture.as_deref(), Some("## Components"));
        let related: Vec<&str> = request.related.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(related, vec!["US-2"]);

        assert!(ContextRequest::from_state(&state, "US-3", None).is_none());
    }

    #[test]
    fn test_metadata_map_keys() {
        let map = ContextMetadata::default().to_map();
        for key in [
            "estimated_tokens",
            "char_count",
            "included_related",
            "dropped_related",
            "architecture_truncated",
            "preferences_included",
            "warnings",
        ] {
            assert!(map.contains_key(key), "missing {key}");
        }
    }
}
