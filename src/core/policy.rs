//! Folder skip policy.
//!
//! Decides, from the archive folder path alone, whether a folder is
//! enumerated at all:
//! - Glob exclusion patterns (matched case-insensitively)
//! - Deleted-items folders (`skip_deleted`)
//! - Sent folders (`skip_sent`)

use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use tracing::warn;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// Folder selection settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderSettings {
    /// Glob patterns over the archive folder path (`Inbox/Old*`)
    #[serde(default)]
    pub exclude: Vec<String>,

    #[serde(default)]
    pub skip_deleted: bool,

    #[serde(default)]
    pub skip_sent: bool,
}

/// Why a folder was skipped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Excluded(String),
    Deleted,
    Sent,
    AlreadyComplete,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::Excluded(pattern) => write!(f, "excluded by '{}'", pattern),
            SkipReason::Deleted => write!(f, "deleted items"),
            SkipReason::Sent => write!(f, "sent items"),
            SkipReason::AlreadyComplete => write!(f, "already complete"),
        }
    }
}

/// Compiled skip policy
#[derive(Debug, Clone, Default)]
pub struct SkipPolicy {
    patterns: Vec<(String, Pattern)>,
    skip_deleted: bool,
    skip_sent: bool,
}

impl SkipPolicy {
    /// Build from settings. Invalid patterns are logged and ignored.
    pub fn new(settings: &FolderSettings) -> Self {
        let patterns = settings
            .exclude
            .iter()
            .filter_map(|raw| match Pattern::new(raw) {
                Ok(pattern) => Some((raw.clone(), pattern)),
                Err(e) => {
                    warn!(pattern = %raw, error = %e, "Ignoring invalid folder pattern");
                    None
                }
            })
            .collect();

        Self {
            patterns,
            skip_deleted: settings.skip_deleted,
            skip_sent: settings.skip_sent,
        }
    }

    /// Skip reason for `folder` (archive path, `/`-joined), if any
    pub fn check(&self, folder: &str) -> Option<SkipReason> {
        for (raw, pattern) in &self.patterns {
            if pattern.matches_with(folder, MATCH_OPTIONS) {
                return Some(SkipReason::Excluded(raw.clone()));
            }
        }

        let lower = folder.to_lowercase();
        if self.skip_deleted && (lower.contains("deleted items") || lower.contains("trash")) {
            return Some(SkipReason::Deleted);
        }
        if self.skip_sent && (lower.contains("sent items") || lower == "sent") {
            return Some(SkipReason::Sent);
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_skips_nothing() {
        let policy = SkipPolicy::default();
        assert_eq!(policy.check("Deleted Items"), None);
        assert_eq!(policy.check("Sent Items"), None);
        assert_eq!(policy.check(""), None);
    }

    #[test]
    fn test_glob_exclusions_ignore_case() {
        let policy = SkipPolicy::new(&FolderSettings {
            exclude: vec!["inbox/old*".to_string(), "[".to_string()],
            ..Default::default()
        });

        assert_eq!(
            policy.check("Inbox/Old Stuff"),
            Some(SkipReason::Excluded("inbox/old*".to_string()))
        );
        assert_eq!(
            policy.check("INBOX/OLD/2009"),
            Some(SkipReason::Excluded("inbox/old*".to_string()))
        );
        assert_eq!(policy.check("Inbox/New"), None);
    }

    #[test]
    fn test_deleted_and_sent() {
        let policy = SkipPolicy::new(&FolderSettings {
            skip_deleted: true,
            skip_sent: true,
            ..Default::default()
        });

        assert_eq!(policy.check("Deleted Items"), Some(SkipReason::Deleted));
        assert_eq!(policy.check("Deleted Items/Old"), Some(SkipReason::Deleted));
        assert_eq!(policy.check("Trash"), Some(SkipReason::Deleted));
        assert_eq!(policy.check("Sent Items"), Some(SkipReason::Sent));
        assert_eq!(policy.check("sent"), Some(SkipReason::Sent));
        assert_eq!(policy.check("Projects/Sent"), None);
        assert_eq!(policy.check("Inbox"), None);
    }
}
