//! Staged AI generation behind human review gates.
//!
//! Each project moves through requirements analysis, project planning,
//! story generation and prompt generation. Every stage's output is
//! submitted for review, and the next stage opens only once its
//! prerequisite is approved.

pub mod api;
pub mod artifact;
pub mod config;
pub mod context;
pub mod errors;
pub mod gates;
pub mod generate;
pub mod pipeline;
pub mod review;
pub mod server;
pub mod stages;
pub mod telemetry;
pub mod workflow;
