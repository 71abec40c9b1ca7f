use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a review submission. Only `Pending` is mutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReviewStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Approved => "Approved",
            Self::Rejected => "Rejected",
            Self::Expired => "Expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReviewStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "expired" => Ok(Self::Expired),
            _ => Err(format!("Invalid review status: {}", s)),
        }
    }
}

/// Reviewer-supplied part of a decision.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecisionInput {
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub feedback: Option<String>,
    /// Ordered notes on how the stage instructions should improve.
    #[serde(default)]
    pub instruction_improvements: Vec<String>,
}

impl DecisionInput {
    pub fn with_reason(reason: &str) -> Self {
        Self {
            reason: Some(reason.to_string()),
            ..Self::default()
        }
    }

    pub fn with_feedback(mut self, feedback: &str) -> Self {
        self.feedback = Some(feedback.to_string());
        self
    }

    pub fn add_improvement(mut self, note: &str) -> Self {
        self.instruction_improvements.push(note.to_string());
        self
    }

    /// The reason with surrounding whitespace removed, if any is left.
    pub fn trimmed_reason(&self) -> Option<&str> {
        self.reason.as_deref().map(str::trim).filter(|r| !r.is_empty())
    }
}

/// A recorded decision on a submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewDecision {
    pub status: ReviewStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    #[serde(default)]
    pub instruction_improvements: Vec<String>,
}

impl ReviewDecision {
    pub fn new(status: ReviewStatus, input: DecisionInput) -> Self {
        Self {
            status,
            reason: input.reason,
            feedback: input.feedback,
            instruction_improvements: input.instruction_improvements,
        }
    }

    /// Recorded when approve is called without an explicit decision.
    pub fn default_approval() -> Self {
        Self::new(ReviewStatus::Approved, DecisionInput::default())
    }
}

/// A draft artifact wrapped for human approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewSubmission {
    pub id: String,
    /// Name of the stage that owns the correlated artifact.
    pub stage_name: String,
    pub content: String,
    /// Id of the artifact under review.
    pub correlation_id: String,
    /// Whitelisted pipeline-stage tag.
    pub pipeline_stage: String,
    pub status: ReviewStatus,
    pub submitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<ReviewDecision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_request: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_response: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ReviewSubmission {
    pub fn is_pending(&self) -> bool {
        self.status == ReviewStatus::Pending
    }
}

/// Input to `submit`. Missing JSON fields deserialize as empty so that they
/// fail validation instead of deserialization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SubmitRequest {
    pub stage_name: String,
    pub content: String,
    pub correlation_id: String,
    pub pipeline_stage: String,
    pub original_request: Option<String>,
    pub ai_response: Option<String>,
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

impl SubmitRequest {
    pub fn new(stage_name: &str, content: &str, correlation_id: &str, pipeline_stage: &str) -> Self {
        Self {
            stage_name: stage_name.to_string(),
            content: content.to_string(),
            correlation_id: correlation_id.to_string(),
            pipeline_stage: pipeline_stage.to_string(),
            ..Self::default()
        }
    }

    pub fn with_original_request(mut self, request: &str) -> Self {
        self.original_request = Some(request.to_string());
        self
    }

    pub fn with_ai_response(mut self, response: &str) -> Self {
        self.ai_response = Some(response.to_string());
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Acknowledgement returned by submit, approve and reject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewResponse {
    pub review_id: String,
    pub status: ReviewStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewed_at: Option<DateTime<Utc>>,
    /// Set when the decision was recorded but its stage owner could not be
    /// notified. Retry with a redispatch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatch_error: Option<String>,
}

impl ReviewResponse {
    pub fn submitted(submission: &ReviewSubmission) -> Self {
        Self {
            review_id: submission.id.clone(),
            status: submission.status,
            message: format!("Submitted {} for review", submission.stage_name),
            submitted_at: Some(submission.submitted_at),
            reviewed_at: None,
            dispatch_error: None,
        }
    }

    pub fn decided(submission: &ReviewSubmission, dispatch_error: Option<String>) -> Self {
        let message = match &dispatch_error {
            None => format!("Review {}", submission.status.as_str().to_lowercase()),
            Some(_) => format!(
                "Review {}; stage owner not yet notified",
                submission.status.as_str().to_lowercase()
            ),
        };
        Self {
            review_id: submission.id.clone(),
            status: submission.status,
            message,
            submitted_at: Some(submission.submitted_at),
            reviewed_at: submission.reviewed_at,
            dispatch_error,
        }
    }
}

/// Submission counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewStats {
    pub pending: usize,
    pub approved: usize,
    pub rejected: usize,
    pub expired: usize,
}

impl ReviewStats {
    pub fn total(&self) -> usize {
        self.pending + self.approved + self.rejected + self.expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_terminality() {
        assert!(!ReviewStatus::Pending.is_terminal());
        assert!(ReviewStatus::Approved.is_terminal());
        assert!(ReviewStatus::Rejected.is_terminal());
        assert!(ReviewStatus::Expired.is_terminal());
    }

    #[test]
    fn test_status_from_str() {
        assert_eq!("approved".parse::<ReviewStatus>().unwrap(), ReviewStatus::Approved);
        assert_eq!("Expired".parse::<ReviewStatus>().unwrap(), ReviewStatus::Expired);
        assert!("done".parse::<ReviewStatus>().is_err());
    }

    #[test]
    fn test_trimmed_reason() {
        assert_eq!(DecisionInput::with_reason("  ").trimmed_reason(), None);
        assert_eq!(DecisionInput::default().trimmed_reason(), None);
        assert_eq!(
            DecisionInput::with_reason(" too vague ").trimmed_reason(),
            Some("too vague")
        );
    }

    #[test]
    fn test_decision_keeps_improvement_order() {
        let input = DecisionInput::with_reason("missing NFRs")
            .with_feedback("add latency targets")
            .add_improvement("ask for performance budgets")
            .add_improvement("ask for data retention");
        let decision = ReviewDecision::new(ReviewStatus::Rejected, input);
        assert_eq!(
            decision.instruction_improvements,
            vec!["ask for performance budgets", "ask for data retention"]
        );
    }

    #[test]
    fn test_submit_request_missing_fields_deserialize_empty() {
        let req: SubmitRequest =
            serde_json::from_str(r#"{"content": "draft", "correlation_id": "c1"}"#).unwrap();
        assert!(req.stage_name.is_empty());
        assert!(req.pipeline_stage.is_empty());
        assert_eq!(req.content, "draft");
    }

    #[test]
    fn test_stats_total() {
        let stats = ReviewStats {
            pending: 2,
            approved: 1,
            rejected: 1,
            expired: 3,
        };
        assert_eq!(stats.total(), 7);
    }
}
