//! Collaborator interfaces for archive readers and delivery clients.
//!
//! The orchestrator only talks to these traits. Handles are passed in
//! explicitly; there is no global reader or connection.

pub mod jsonl_archive;
pub mod maildir;

use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::{ArchiveMessageRecord, FolderPath, MessageFlag};

// Re-export the bundled implementations
pub use jsonl_archive::JsonlArchive;
pub use maildir::MaildirClient;

/// Errors opening or walking an archive
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Archive not found: {0}")]
    NotFound(PathBuf),

    #[error("Archive parse error at line {line}: {reason}")]
    Parse { line: u64, reason: String },

    #[error("Archive is closed")]
    Closed,

    #[error("Archive IO error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Visit(#[from] VisitError),
}

/// Returned by a visitor to stop the walk
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VisitError {
    #[error("Cancelled")]
    Cancelled,

    #[error("{0}")]
    Fatal(String),
}

/// Visitor decision when entering a folder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FolderAction {
    Enter,
    Skip,
}

/// Receives folders and items during a single forward walk
#[async_trait]
pub trait ArchiveVisitor: Send {
    /// Called before any item of the folder is read
    async fn enter_folder(&mut self, path: &FolderPath) -> Result<FolderAction, VisitError>;

    /// Called for each item of an entered folder. `is_mail` is false for
    /// contacts, appointments and other non-mail records.
    async fn visit_item(
        &mut self,
        record: ArchiveMessageRecord,
        is_mail: bool,
    ) -> Result<(), VisitError>;
}

/// Source of archive folders and records
#[async_trait]
pub trait ArchiveReader: Send {
    /// Walk every folder once, in archive order. A visitor error aborts the
    /// walk and is returned as `ArchiveError::Visit`.
    async fn walk(&mut self, visitor: &mut dyn ArchiveVisitor) -> Result<(), ArchiveError>;

    async fn close(&mut self) -> Result<(), ArchiveError>;
}

/// Destination account credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Account identity, also used to key saved progress
    pub account: String,
}

impl Credentials {
    pub fn new(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
        }
    }
}

/// Errors from a delivery client
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Destination unreachable: {0}")]
    Network(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Message rejected: {0}")]
    Rejected(String),

    #[error("Maildir store failed: {0}")]
    Store(#[from] ::maildir::MaildirError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl DeliveryError {
    /// Errors after which no further delivery can succeed
    pub fn is_connection_level(&self) -> bool {
        matches!(self, Self::ConnectionLost(_))
    }
}

/// Appends compiled messages to the destination mailbox
#[async_trait]
pub trait DeliveryClient: Send {
    /// Human-readable client name
    fn name(&self) -> &str;

    /// Create `folder` if missing; succeeds if it already exists
    async fn ensure_folder(&mut self, folder: &str) -> Result<(), DeliveryError>;

    /// Append one message
    async fn deliver(
        &mut self,
        folder: &str,
        flags: &[MessageFlag],
        timestamp: DateTime<Utc>,
        payload: &[u8],
    ) -> Result<(), DeliveryError>;

    async fn disconnect(&mut self) -> Result<(), DeliveryError>;
}
