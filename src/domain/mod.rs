//! Domain types for the migration pipeline.
//!
//! This module contains the core data structures:
//! - Records: structured archive items and compiled wire-ready messages
//! - Outcomes: per-message results folded into a run summary

pub mod outcome;
pub mod record;

// Re-export commonly used types
pub use outcome::{MessageOutcome, RunSummary};
pub use record::{ArchiveMessageRecord, CompiledMessage, FolderPath, MessageFlag};
