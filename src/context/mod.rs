//! Context assembly for the prompt-generation stage.
//!
//! The assembled text must fit a character budget derived from the
//! downstream model window. Size is estimated at four characters per token,
//! which over-counts for most prose.

pub mod assembler;
pub mod budget;
pub mod relatedness;

pub use assembler::{
    AssembledContext, ContextAssembler, ContextConfig, ContextMetadata, ContextRequest,
    PREFERENCES_DROPPED, SIZE_EXCEEDED, truncate_at_boundary,
};
pub use budget::{ContextBudget, estimate_tokens};
pub use relatedness::{StoryRef, keywords, rank, score};
