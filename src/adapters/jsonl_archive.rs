//! Archive reader for JSON-lines archive exports.
//!
//! One entry per line, tagged by `type`:
//!
//! ```text
//! {"type":"folder","path":"Top of Personal Folders/Inbox"}
//! {"type":"item","class":"IPM.Note","subject":"Hi","message_id":"<a@b>"}
//! ```
//!
//! Items belong to the most recent folder line; items before the first
//! folder line belong to the archive root. The file is read one line at a
//! time so memory stays bounded regardless of archive size.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

use crate::domain::{ArchiveMessageRecord, FolderPath};

use super::{ArchiveError, ArchiveReader, ArchiveVisitor, FolderAction};

/// One line of an export
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Entry {
    Folder {
        path: String,
    },
    Item {
        #[serde(default)]
        class: Option<String>,
        #[serde(flatten)]
        record: ArchiveMessageRecord,
    },
}

/// Just the tag, for lines inside a skipped folder
#[derive(Debug, Deserialize)]
struct EntryTag {
    #[serde(rename = "type")]
    kind: String,
}

/// Counts gathered while validating an export
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportStats {
    pub folders: u64,
    pub items: u64,
    pub mail_items: u64,
}

/// A JSON-lines archive export opened for reading
pub struct JsonlArchive {
    path: PathBuf,
    stats: ExportStats,
    closed: bool,
}

impl JsonlArchive {
    /// Open and validate an export.
    ///
    /// Every line is parsed once up front so a structurally invalid archive
    /// fails here, before anything is delivered.
    pub async fn open(path: &Path) -> Result<Self, ArchiveError> {
        if !tokio::fs::try_exists(path).await? {
            return Err(ArchiveError::NotFound(path.to_path_buf()));
        }

        let mut stats = ExportStats::default();
        let mut lines = BufReader::new(File::open(path).await?).lines();
        let mut line_no = 0u64;

        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            match parse_entry(&line, line_no)? {
                Entry::Folder { .. } => stats.folders += 1,
                Entry::Item { class, .. } => {
                    stats.items += 1;
                    if is_mail_class(class.as_deref()) {
                        stats.mail_items += 1;
                    }
                }
            }
        }

        debug!(path = %path.display(), ?stats, "Archive export validated");

        Ok(Self {
            path: path.to_path_buf(),
            stats,
            closed: false,
        })
    }

    pub fn stats(&self) -> ExportStats {
        self.stats
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ArchiveReader for JsonlArchive {
    async fn walk(&mut self, visitor: &mut dyn ArchiveVisitor) -> Result<(), ArchiveError> {
        if self.closed {
            return Err(ArchiveError::Closed);
        }

        let mut lines = BufReader::new(File::open(&self.path).await?).lines();
        let mut line_no = 0u64;
        let mut in_folder = false;
        let mut skipping = false;

        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }

            if skipping {
                let tag: EntryTag = serde_json::from_str(&line).map_err(|e| ArchiveError::Parse {
                    line: line_no,
                    reason: e.to_string(),
                })?;
                if tag.kind != "folder" {
                    continue;
                }
            }

            match parse_entry(&line, line_no)? {
                Entry::Folder { path } => {
                    in_folder = true;
                    let path = FolderPath::parse(&path);
                    skipping = visitor.enter_folder(&path).await? == FolderAction::Skip;
                }
                Entry::Item { class, record } => {
                    if !in_folder {
                        in_folder = true;
                        if visitor.enter_folder(&FolderPath::root()).await? == FolderAction::Skip {
                            skipping = true;
                            continue;
                        }
                    }
                    visitor
                        .visit_item(record, is_mail_class(class.as_deref()))
                        .await?;
                }
            }
        }

        Ok(())
    }

    async fn close(&mut self) -> Result<(), ArchiveError> {
        self.closed = true;
        Ok(())
    }
}

fn parse_entry(line: &str, line_no: u64) -> Result<Entry, ArchiveError> {
    serde_json::from_str(line).map_err(|e| ArchiveError::Parse {
        line: line_no,
        reason: e.to_string(),
    })
}

/// Mail items are untyped or of the `IPM.Note` class family
pub fn is_mail_class(class: Option<&str>) -> bool {
    match class {
        None => true,
        Some(class) => {
            let class = class.trim().to_ascii_lowercase();
            class.is_empty() || class == "ipm.note" || class.starts_with("ipm.note.")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::VisitError;
    use chrono::{DateTime, Datelike, Utc};
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
        skip: Vec<&'static str>,
        submit_times: Vec<Option<DateTime<Utc>>>,
    }

    #[async_trait]
    impl ArchiveVisitor for Recorder {
        async fn enter_folder(&mut self, path: &FolderPath) -> Result<FolderAction, VisitError> {
            self.events.push(format!("folder:{}", path));
            if self.skip.contains(&path.to_string().as_str()) {
                Ok(FolderAction::Skip)
            } else {
                Ok(FolderAction::Enter)
            }
        }

        async fn visit_item(
            &mut self,
            record: ArchiveMessageRecord,
            is_mail: bool,
        ) -> Result<(), VisitError> {
            self.events.push(format!("item:{}:{}", record.subject, is_mail));
            self.submit_times.push(record.submit_time);
            Ok(())
        }
    }

    async fn write_export(dir: &TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("export.jsonl");
        tokio::fs::write(&path, content).await.unwrap();
        path
    }

    #[test]
    fn test_mail_class_detection() {
        assert!(is_mail_class(None));
        assert!(is_mail_class(Some("IPM.Note")));
        assert!(is_mail_class(Some("ipm.note.SMIME")));
        assert!(!is_mail_class(Some("IPM.Contact")));
        assert!(!is_mail_class(Some("IPM.Notebook")));
    }

    #[tokio::test]
    async fn test_open_missing_archive() {
        let dir = TempDir::new().unwrap();
        let result = JsonlArchive::open(&dir.path().join("nope.jsonl")).await;
        assert!(matches!(result, Err(ArchiveError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_open_rejects_invalid_lines() {
        let dir = TempDir::new().unwrap();
        let path = write_export(
            &dir,
            "{\"type\":\"folder\",\"path\":\"Inbox\"}\n{\"type\":\"item\",\"subject\":42}\n",
        )
        .await;

        let result = JsonlArchive::open(&path).await;
        assert!(matches!(result, Err(ArchiveError::Parse { line: 2, .. })));
    }

    #[tokio::test]
    async fn test_odd_timestamps_do_not_fail_the_export() {
        let dir = TempDir::new().unwrap();
        let path = write_export(
            &dir,
            concat!(
                "{\"type\":\"folder\",\"path\":\"Inbox\"}\n",
                "{\"type\":\"item\",\"subject\":\"a\",\"submit_time\":\"soon\"}\n",
                "{\"type\":\"item\",\"subject\":\"b\",\"submit_time\":\"Mon, 1 Jan 2001 00:00:00 +0000\"}\n",
            ),
        )
        .await;

        let mut archive = JsonlArchive::open(&path).await.unwrap();
        let mut visitor = Recorder::default();
        archive.walk(&mut visitor).await.unwrap();

        assert_eq!(visitor.events, vec!["folder:Inbox", "item:a:true", "item:b:true"]);
        assert!(visitor.submit_times[0].is_none());
        assert_eq!(visitor.submit_times[1].unwrap().year(), 2001);
    }

    #[tokio::test]
    async fn test_walk_order_and_root_items() {
        let dir = TempDir::new().unwrap();
        let path = write_export(
            &dir,
            concat!(
                "{\"type\":\"item\",\"subject\":\"loose\"}\n",
                "\n",
                "{\"type\":\"folder\",\"path\":\"Inbox\"}\n",
                "{\"type\":\"item\",\"class\":\"IPM.Note\",\"subject\":\"a\"}\n",
                "{\"type\":\"item\",\"class\":\"IPM.Contact\",\"subject\":\"c\"}\n",
            ),
        )
        .await;

        let mut archive = JsonlArchive::open(&path).await.unwrap();
        assert_eq!(
            archive.stats(),
            ExportStats {
                folders: 1,
                items: 3,
                mail_items: 2
            }
        );

        let mut recorder = Recorder::default();
        archive.walk(&mut recorder).await.unwrap();
        assert_eq!(
            recorder.events,
            vec![
                "folder:",
                "item:loose:true",
                "folder:Inbox",
                "item:a:true",
                "item:c:false"
            ]
        );
    }

    #[tokio::test]
    async fn test_skipped_folder_items_are_not_visited() {
        let dir = TempDir::new().unwrap();
        let path = write_export(
            &dir,
            concat!(
                "{\"type\":\"folder\",\"path\":\"Deleted Items\"}\n",
                "{\"type\":\"item\",\"subject\":\"gone\"}\n",
                "{\"type\":\"folder\",\"path\":\"Inbox\"}\n",
                "{\"type\":\"item\",\"subject\":\"kept\"}\n",
            ),
        )
        .await;

        let mut archive = JsonlArchive::open(&path).await.unwrap();
        let mut recorder = Recorder {
            skip: vec!["Deleted Items"],
            ..Default::default()
        };
        archive.walk(&mut recorder).await.unwrap();

        assert_eq!(
            recorder.events,
            vec!["folder:Deleted Items", "folder:Inbox", "item:kept:true"]
        );
    }

    #[tokio::test]
    async fn test_walk_after_close_fails() {
        let dir = TempDir::new().unwrap();
        let path = write_export(&dir, "{\"type\":\"folder\",\"path\":\"Inbox\"}\n").await;

        let mut archive = JsonlArchive::open(&path).await.unwrap();
        archive.close().await.unwrap();

        let mut recorder = Recorder::default();
        assert!(matches!(
            archive.walk(&mut recorder).await,
            Err(ArchiveError::Closed)
        ));
    }
}
