//! Core import logic.
//!
//! This module contains:
//! - folder_map: archive folder path to destination name
//! - compiler / header: archive record to RFC 5322 message
//! - bloom / progress: resumable, crash-safe delivery tracking
//! - policy: folder skip rules
//! - orchestrator: the pipeline driving all of the above

pub mod bloom;
pub mod compiler;
pub mod folder_map;
pub mod header;
pub mod orchestrator;
pub mod policy;
pub mod progress;

// Re-export commonly used types
pub use bloom::{FilterError, MembershipFilter};
pub use compiler::compile;
pub use folder_map::{map_folder, Namespace};
pub use orchestrator::{CancelSignal, Orchestrator, RunOptions};
pub use policy::{FolderSettings, SkipPolicy, SkipReason};
pub use progress::{
    fingerprint, state_path_for, ProgressSnapshot, ProgressTracker, StateError, TrackerSettings,
};
