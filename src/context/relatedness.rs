//! Relatedness scoring between stories.
//!
//! Score = 3 per shared tag + 2 per shared title word + 1 per shared body
//! keyword. Words are lowercase alphanumeric runs of at least four characters
//! that are not stop words.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static WORD_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[a-z0-9]+").unwrap());

const STOP_WORDS: &[&str] = &[
    "about", "after", "also", "been", "being", "both", "from", "have", "into", "just", "more",
    "must", "only", "over", "should", "some", "such", "than", "that", "their", "them", "then",
    "there", "these", "they", "this", "those", "user", "very", "want", "were", "what", "when",
    "where", "which", "will", "with", "would", "your",
];

const TAG_WEIGHT: usize = 3;
const TITLE_WEIGHT: usize = 2;
const KEYWORD_WEIGHT: usize = 1;

/// A story as seen by the context assembler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryRef {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub body: String,
}

impl StoryRef {
    pub fn new(id: &str, title: &str, body: &str) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            tags: Vec::new(),
            body: body.to_string(),
        }
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }
}

/// A candidate with its score against the target.
#[derive(Debug, Clone)]
pub struct Ranked<'a> {
    pub story: &'a StoryRef,
    pub score: usize,
}

/// Distinct significant words in `text`.
pub fn keywords(text: &str) -> BTreeSet<String> {
    let lower = text.to_lowercase();
    WORD_REGEX
        .find_iter(&lower)
        .map(|m| m.as_str())
        .filter(|w| w.len() >= 4 && !STOP_WORDS.contains(w))
        .map(str::to_string)
        .collect()
}

fn tag_set(tags: &[String]) -> BTreeSet<String> {
    tags.iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

pub fn score(target: &StoryRef, candidate: &StoryRef) -> usize {
    let shared_tags = tag_set(&target.tags)
        .intersection(&tag_set(&candidate.tags))
        .count();
    let shared_title = keywords(&target.title)
        .intersection(&keywords(&candidate.title))
        .count();
    let shared_body = keywords(&target.body)
        .intersection(&keywords(&candidate.body))
        .count();

    TAG_WEIGHT * shared_tags + TITLE_WEIGHT * shared_title + KEYWORD_WEIGHT * shared_body
}

/// Rank candidates against `target` and keep the best `top_k`.
///
/// Returns the kept candidates, best first, and the ids of every other
/// candidate. The target itself and zero-score candidates are never kept;
/// ties go to the smaller id.
pub fn rank<'a>(
    target: &StoryRef,
    candidates: &'a [StoryRef],
    top_k: usize,
) -> (Vec<Ranked<'a>>, Vec<String>) {
    let mut scored: Vec<Ranked<'a>> = candidates
        .iter()
        .filter(|c| c.id != target.id)
        .map(|story| Ranked {
            story,
            score: score(target, story),
        })
        .collect();
    scored.sort_by(|a, b| b.score.cmp(&a.score).then(a.story.id.cmp(&b.story.id)));

    let mut kept = Vec::new();
    let mut dropped = Vec::new();
    for ranked in scored {
        if ranked.score > 0 && kept.len() < top_k {
            kept.push(ranked);
        } else {
            dropped.push(ranked.story.id.clone());
        }
    }
    (kept, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn login() -> StoryRef {
        StoryRef::new(
            "US-1",
            "Login form",
            "Users sign in with email and password. Lockout after failed attempts.",
        )
        .with_tags(&["auth", "ui"])
    }

    #[test]
    fn test_keywords_filter_short_and_stop_words() {
        let words = keywords("This is the Login FORM with password reset");
        assert!(words.contains("login"));
        assert!(words.contains("form"));
        assert!(words.contains("password"));
        assert!(!words.contains("this"));
        assert!(!words.contains("with"));
        assert!(!words.contains("the"));
    }

    #[test]
    fn test_score_weights() {
        let target = login();
        let tags_only = StoryRef::new("US-2", "Billing", "Invoices monthly").with_tags(&["AUTH"]);
        assert_eq!(score(&target, &tags_only), 3);

        let title_only = StoryRef::new("US-3", "Signup form", "Create an account");
        assert_eq!(score(&target, &title_only), 2);

        let body_only = StoryRef::new("US-4", "Reset", "Send a password reset link by email");
        assert_eq!(score(&target, &body_only), 2);
    }

    #[test]
    fn test_rank_keeps_top_k_and_drops_unrelated() {
        let target = login();
        let candidates = vec![
            StoryRef::new("US-5", "Reporting", "Quarterly charts"),
            StoryRef::new("US-3", "Signup form", "Create an account").with_tags(&["auth"]),
            StoryRef::new("US-4", "Reset", "Send a password reset link by email"),
            StoryRef::new("US-2", "Billing", "Invoices").with_tags(&["ui"]),
            login(),
        ];

        let (kept, dropped) = rank(&target, &candidates, 2);
        let kept_ids: Vec<&str> = kept.iter().map(|r| r.story.id.as_str()).collect();
        assert_eq!(kept_ids, vec!["US-3", "US-2"]);
        assert_eq!(dropped, vec!["US-4", "US-5"]);
    }

    #[test]
    fn test_rank_ties_break_by_id() {
        let target = login();
        let candidates = vec![
            StoryRef::new("US-9", "Other", "x").with_tags(&["auth"]),
            StoryRef::new("US-7", "Other", "x").with_tags(&["auth"]),
        ];
        let (kept, _) = rank(&target, &candidates, 1);
        assert_eq!(kept[0].story.id, "US-7");
    }
}
