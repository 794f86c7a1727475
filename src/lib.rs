//! mailferry - Resumable archive-to-mailbox migration
//!
//! Streams the folders and messages of an offline mailbox archive into a
//! live mailbox, one message at a time, and can be stopped and restarted at
//! any point without re-delivering what already arrived.
//!
//! # Architecture
//!
//! - Each archive record is compiled into an RFC 5322 message, reusing the
//!   original transport headers when the archive kept them
//! - Delivered message identities go into a Bloom filter persisted in a
//!   sidecar file next to the archive
//! - A clean run removes the sidecar; anything else leaves it for resume
//!
//! # Modules
//!
//! - `adapters`: Archive readers and delivery clients (JSON-lines, Maildir++)
//! - `core`: Folder mapping, message compiler, progress tracker, orchestrator
//! - `domain`: Data structures (records, outcomes)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Import an archive export into a Maildir
//! mailferry import --archive mail.jsonl --maildir ~/Maildir --account ann@example.com
//!
//! # Inspect saved progress
//! mailferry status --archive mail.jsonl --account ann@example.com
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use core::{CancelSignal, Orchestrator, ProgressTracker};
pub use domain::{ArchiveMessageRecord, CompiledMessage, MessageOutcome, RunSummary};
