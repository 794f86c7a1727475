//! Per-message outcomes and the aggregate run summary.

use serde::{Deserialize, Serialize};

/// What happened to a single archive record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageOutcome {
    /// Appended to the destination during this run
    Delivered,

    /// Identity already marked delivered by a previous run
    AlreadyDelivered,

    /// Not a mail item
    Skipped,

    /// Delivery attempted and failed
    Failed,
}

/// Aggregate counts for one pipeline run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub delivered: u64,
    pub already_delivered: u64,
    pub skipped: u64,
    pub failed: u64,

    /// Folders skipped by policy or because they were already complete
    pub folders_skipped: u64,

    /// Folders newly marked complete at the end of this run
    pub folders_completed: u64,

    /// Set when the run stopped early on request
    pub cancelled: bool,

    /// Fatal error that ended the archive iteration, if any
    pub aborted: Option<String>,
}

impl RunSummary {
    /// Fold one message outcome into the counts
    pub fn record(&mut self, outcome: MessageOutcome) {
        match outcome {
            MessageOutcome::Delivered => self.delivered += 1,
            MessageOutcome::AlreadyDelivered => self.already_delivered += 1,
            MessageOutcome::Skipped => self.skipped += 1,
            MessageOutcome::Failed => self.failed += 1,
        }
    }

    /// Mail records that reached the delivery decision
    pub fn mail_records(&self) -> u64 {
        self.delivered + self.already_delivered + self.failed
    }

    /// A clean run needs no resume artifact
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && !self.cancelled && self.aborted.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_folds_outcomes() {
        let mut summary = RunSummary::default();
        for outcome in [
            MessageOutcome::Delivered,
            MessageOutcome::Delivered,
            MessageOutcome::AlreadyDelivered,
            MessageOutcome::Skipped,
        ] {
            summary.record(outcome);
        }

        assert_eq!(summary.delivered, 2);
        assert_eq!(summary.already_delivered, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.mail_records(), 3);
        assert!(summary.is_clean());

        summary.record(MessageOutcome::Failed);
        assert!(!summary.is_clean());
    }

    #[test]
    fn test_cancelled_run_is_not_clean() {
        let summary = RunSummary {
            cancelled: true,
            ..Default::default()
        };
        assert!(!summary.is_clean());
    }
}
