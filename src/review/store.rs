//! The process-wide review registry.
//!
//! Records live in a [`DashMap`], so each mutation holds only the lock of the
//! shard that owns its key. Distinct ids never contend on a global lock, and
//! every state change happens inside one `get_mut` critical section.

use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::models::{ReviewDecision, ReviewStats, ReviewStatus, ReviewSubmission};
use crate::errors::ReviewError;

/// Keyed registry of review submissions. Construct once and share via `Arc`.
#[derive(Debug, Default)]
pub struct ReviewStore {
    records: DashMap<String, ReviewSubmission>,
    /// Count of `Pending` records, kept in step with every transition.
    pending: AtomicUsize,
}

impl ReviewStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new pending submission, reserving one of `limit` pending
    /// slots first.
    pub fn insert_pending(
        &self,
        submission: ReviewSubmission,
        limit: usize,
    ) -> Result<(), ReviewError> {
        debug_assert!(submission.is_pending());

        self.pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .map_err(|_| ReviewError::CapacityExceeded { limit })?;

        self.records.insert(submission.id.clone(), submission);
        Ok(())
    }

    /// Snapshot of one record.
    pub fn get(&self, id: &str) -> Option<ReviewSubmission> {
        self.records.get(id).map(|r| r.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    /// Record a decision on a pending submission. Exactly one caller wins a
    /// race on the same id; the others see `InvalidState`.
    pub fn decide(
        &self,
        id: &str,
        decision: ReviewDecision,
        now: DateTime<Utc>,
    ) -> Result<ReviewSubmission, ReviewError> {
        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| ReviewError::NotFound { id: id.to_string() })?;

        if record.status != ReviewStatus::Pending {
            return Err(ReviewError::InvalidState {
                id: id.to_string(),
                status: record.status,
            });
        }

        record.status = decision.status;
        record.reviewed_at = Some(now);
        record.decision = Some(decision);
        self.pending.fetch_sub(1, Ordering::AcqRel);

        Ok(record.value().clone())
    }

    /// Expire every pending submission submitted strictly before `cutoff`.
    ///
    /// Candidates are collected under shard read locks, then each one is
    /// re-checked inside its own write critical section, so a concurrent
    /// decision on the same id always wins or loses cleanly.
    pub fn expire_submitted_before(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> usize {
        let candidates: Vec<String> = self
            .records
            .iter()
            .filter(|r| r.status == ReviewStatus::Pending && r.submitted_at < cutoff)
            .map(|r| r.key().clone())
            .collect();

        let mut expired = 0;
        for id in candidates {
            if let Some(mut record) = self.records.get_mut(&id)
                && record.status == ReviewStatus::Pending
                && record.submitted_at < cutoff
            {
                record.status = ReviewStatus::Expired;
                record.reviewed_at = Some(now);
                self.pending.fetch_sub(1, Ordering::AcqRel);
                expired += 1;
            }
        }
        expired
    }

    /// Every pending submission, oldest first.
    pub fn pending(&self) -> Vec<ReviewSubmission> {
        let mut pending: Vec<ReviewSubmission> = self
            .records
            .iter()
            .filter(|r| r.status == ReviewStatus::Pending)
            .map(|r| r.value().clone())
            .collect();
        pending.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at).then(a.id.cmp(&b.id)));
        pending
    }

    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn stats(&self) -> ReviewStats {
        let mut stats = ReviewStats::default();
        for record in self.records.iter() {
            match record.status {
                ReviewStatus::Pending => stats.pending += 1,
                ReviewStatus::Approved => stats.approved += 1,
                ReviewStatus::Rejected => stats.rejected += 1,
                ReviewStatus::Expired => stats.expired += 1,
            }
        }
        stats
    }
}
