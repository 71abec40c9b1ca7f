//! Human review of generated artifacts.
//!
//! A finished stage submits its draft here; a reviewer approves or rejects
//! it; the decision is routed back to the stage that owns the artifact.
//!
//! ## Components
//!
//! - [`models`]: submission, decision and response types
//! - [`store`]: the process-wide keyed registry
//! - [`service`]: validation and lifecycle operations
//! - [`dispatcher`]: routes decisions to stage owners
//! - [`sweeper`]: background expiry of stale submissions
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use stagegate::review::{
//!     ApprovalDispatcher, ReviewConfig, ReviewService, ReviewStatus, ReviewStore, SubmitRequest,
//! };
//!
//! # tokio_test_block(async {
//! let service = ReviewService::new(
//!     Arc::new(ReviewStore::new()),
//!     Arc::new(ApprovalDispatcher::new()),
//!     ReviewConfig::default(),
//! );
//! let submission = service
//!     .submit(SubmitRequest::new("RequirementsAnalysis", "## Goals", "artifact-1", "Analysis"))
//!     .await
//!     .unwrap();
//! assert_eq!(submission.status, ReviewStatus::Pending);
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
//! # }
//! ```

pub mod dispatcher;
pub mod models;
pub mod service;
pub mod store;
pub mod sweeper;

pub use dispatcher::{ApprovalDispatcher, DispatchOutcome, StageHandler};
pub use models::{
    DecisionInput, ReviewDecision, ReviewResponse, ReviewStats, ReviewStatus, ReviewSubmission,
    SubmitRequest,
};
pub use service::{ReviewConfig, ReviewService};
pub use store::ReviewStore;
pub use sweeper::ExpirySweeper;
