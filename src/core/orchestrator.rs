//! Pipeline orchestrator.
//!
//! Walks an archive once, compiles each record, consults the progress
//! tracker and hands new messages to the delivery client, one at a time.
//! Every record ends in one `MessageOutcome`, folded into a `RunSummary`.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::{
    ArchiveError, ArchiveReader, ArchiveVisitor, DeliveryClient, FolderAction, VisitError,
};
use crate::domain::{ArchiveMessageRecord, FolderPath, MessageFlag, MessageOutcome, RunSummary};

use super::compiler::compile;
use super::folder_map::Namespace;
use super::policy::{SkipPolicy, SkipReason};
use super::progress::ProgressTracker;

/// Default number of deliveries between persists
pub const DEFAULT_PERSIST_EVERY: u64 = 50;

/// Cooperative cancellation flag, checked at each folder start and before
/// each message
#[derive(Debug, Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-run knobs
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Deliveries between progress persists
    pub persist_every: u64,

    /// Flags set on every delivered message
    pub flags: Vec<MessageFlag>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            persist_every: DEFAULT_PERSIST_EVERY,
            flags: vec![MessageFlag::Seen],
        }
    }
}

/// Drives one archive into one destination
pub struct Orchestrator {
    policy: SkipPolicy,
    namespace: Namespace,
    options: RunOptions,
    cancel: CancelSignal,
}

impl Orchestrator {
    pub fn new(policy: SkipPolicy, namespace: Namespace) -> Self {
        Self {
            policy,
            namespace,
            options: RunOptions::default(),
            cancel: CancelSignal::new(),
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    /// Handle for requesting cancellation from another task
    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    /// Run the pipeline to completion, cancellation or a fatal error.
    ///
    /// Per-message failures never end the run. Progress is persisted at the
    /// end in every case, then discarded if the run was clean.
    #[instrument(skip_all, fields(client = %client.name()))]
    pub async fn run(
        &self,
        reader: &mut dyn ArchiveReader,
        client: &mut dyn DeliveryClient,
        tracker: &mut ProgressTracker,
    ) -> Result<RunSummary> {
        let (delivered, total) = tracker.progress();
        info!(
            resuming = tracker.is_resuming(),
            delivered,
            total,
            state = %tracker.state_path().display(),
            "Starting import"
        );
        tracker.clear_failures();

        let mut visitor = RunVisitor::new(self, client, tracker);
        let walk = reader.walk(&mut visitor).await;

        match walk {
            Ok(()) => visitor.finish_folder(),
            Err(ArchiveError::Visit(VisitError::Cancelled)) => {
                info!("Import cancelled");
                visitor.summary.cancelled = true;
            }
            Err(ArchiveError::Visit(VisitError::Fatal(reason))) => {
                error!(%reason, "Import aborted");
                visitor.summary.aborted = Some(reason);
            }
            Err(e) => {
                error!(error = %e, "Archive iteration failed");
                visitor.summary.aborted = Some(e.to_string());
            }
        }

        let RunVisitor {
            mut summary,
            current,
            completed,
            mut incomplete,
            ..
        } = visitor;

        // A folder cut short by cancellation or an abort
        if let Some(folder) = current {
            incomplete.insert(folder.key);
        }

        // A path listed twice is complete only if every listing was
        let completed: Vec<String> = completed.difference(&incomplete).cloned().collect();
        for folder in &completed {
            tracker.mark_folder_complete(folder);
        }
        summary.folders_completed = completed.len() as u64;
        tracker.observe_total(summary.mail_records());

        tracker.persist().context("Failed to save import progress")?;

        if summary.is_clean() {
            tracker
                .discard()
                .context("Failed to remove import progress")?;
            info!(
                delivered = summary.delivered,
                already_delivered = summary.already_delivered,
                skipped = summary.skipped,
                "Import complete"
            );
        } else {
            warn!(
                delivered = summary.delivered,
                failed = summary.failed,
                state = %tracker.state_path().display(),
                "Import incomplete, progress saved"
            );
        }

        Ok(summary)
    }
}

/// The folder being enumerated
struct FolderTally {
    key: String,
    mapped: String,
    ensured: bool,
    counts: RunSummary,
}

impl FolderTally {
    fn new(key: String, mapped: String) -> Self {
        Self {
            key,
            mapped,
            ensured: false,
            counts: RunSummary::default(),
        }
    }
}

struct RunVisitor<'r> {
    orchestrator: &'r Orchestrator,
    client: &'r mut dyn DeliveryClient,
    tracker: &'r mut ProgressTracker,
    summary: RunSummary,
    current: Option<FolderTally>,
    completed: BTreeSet<String>,
    /// Folders with failures, or not enumerated to the end
    incomplete: BTreeSet<String>,
    since_persist: u64,
}

impl<'r> RunVisitor<'r> {
    fn new(
        orchestrator: &'r Orchestrator,
        client: &'r mut dyn DeliveryClient,
        tracker: &'r mut ProgressTracker,
    ) -> Self {
        Self {
            orchestrator,
            client,
            tracker,
            summary: RunSummary::default(),
            current: None,
            completed: BTreeSet::new(),
            incomplete: BTreeSet::new(),
            since_persist: 0,
        }
    }

    fn skip_reason(&self, key: &str) -> Option<SkipReason> {
        if let Some(reason) = self.orchestrator.policy.check(key) {
            return Some(reason);
        }
        if self.tracker.is_folder_complete(key) {
            return Some(SkipReason::AlreadyComplete);
        }
        None
    }

    /// Close out the current folder; it was enumerated to the end
    fn finish_folder(&mut self) {
        let Some(folder) = self.current.take() else {
            return;
        };

        let counts = &folder.counts;
        info!(
            folder = %folder.key,
            mapped = %folder.mapped,
            delivered = counts.delivered,
            already_delivered = counts.already_delivered,
            skipped = counts.skipped,
            failed = counts.failed,
            "Folder done"
        );

        // Failed messages must be retried on the next run
        if counts.failed == 0 {
            self.completed.insert(folder.key);
        } else {
            self.incomplete.insert(folder.key);
        }
    }

    fn fold(&mut self, folder: &mut FolderTally, outcome: MessageOutcome) {
        folder.counts.record(outcome);
        self.summary.record(outcome);
    }

    async fn process(
        &mut self,
        folder: &mut FolderTally,
        record: ArchiveMessageRecord,
        is_mail: bool,
    ) -> Result<MessageOutcome, VisitError> {
        if self.orchestrator.cancel.is_cancelled() {
            return Err(VisitError::Cancelled);
        }

        let Some(message) = compile(&record, is_mail) else {
            return Ok(MessageOutcome::Skipped);
        };
        drop(record);

        if self.tracker.is_delivered(&message.identity) {
            return Ok(MessageOutcome::AlreadyDelivered);
        }

        if !folder.ensured {
            if let Err(e) = self.client.ensure_folder(&folder.mapped).await {
                warn!(folder = %folder.mapped, error = %e, "Could not create folder");
            }
            folder.ensured = true;
        }

        let orchestrator = self.orchestrator;
        let options = &orchestrator.options;
        match self
            .client
            .deliver(&folder.mapped, &options.flags, message.timestamp, &message.payload)
            .await
        {
            Ok(()) => {
                self.tracker.mark_delivered(&message.identity);
                self.since_persist += 1;
                if self.since_persist >= options.persist_every.max(1) {
                    self.since_persist = 0;
                    if let Err(e) = self.tracker.persist() {
                        warn!(error = %e, "Failed to save progress");
                    }
                }
                Ok(MessageOutcome::Delivered)
            }
            Err(e) => {
                warn!(
                    identity = %message.identity,
                    folder = %folder.mapped,
                    error = %e,
                    "Delivery failed"
                );
                self.tracker
                    .record_failure(&message.identity, &folder.mapped, &e.to_string());

                if e.is_connection_level() {
                    self.fold(folder, MessageOutcome::Failed);
                    return Err(VisitError::Fatal(e.to_string()));
                }
                Ok(MessageOutcome::Failed)
            }
        }
    }
}

#[async_trait]
impl<'r> ArchiveVisitor for RunVisitor<'r> {
    async fn enter_folder(&mut self, path: &FolderPath) -> Result<FolderAction, VisitError> {
        self.finish_folder();

        if self.orchestrator.cancel.is_cancelled() {
            return Err(VisitError::Cancelled);
        }

        let key = path.to_string();
        if let Some(reason) = self.skip_reason(&key) {
            info!(folder = %key, %reason, "Skipping folder");
            self.summary.folders_skipped += 1;
            return Ok(FolderAction::Skip);
        }

        let mapped = self.orchestrator.namespace.map_folder(&key);
        debug!(folder = %key, %mapped, "Entering folder");
        self.current = Some(FolderTally::new(key, mapped));
        Ok(FolderAction::Enter)
    }

    async fn visit_item(
        &mut self,
        record: ArchiveMessageRecord,
        is_mail: bool,
    ) -> Result<(), VisitError> {
        let Some(mut folder) = self.current.take() else {
            return Err(VisitError::Fatal("record outside of any folder".to_string()));
        };

        let result = self.process(&mut folder, record, is_mail).await;
        if let Ok(outcome) = result {
            self.fold(&mut folder, outcome);
        }
        self.current = Some(folder);

        result.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::DeliveryError;
    use crate::core::progress::TrackerSettings;
    use chrono::{DateTime, Utc};
    use tempfile::TempDir;

    /// Folder listings in walk order; a path may be listed more than once
    struct Listings(Vec<(&'static str, Vec<ArchiveMessageRecord>)>);

    fn inbox(records: Vec<ArchiveMessageRecord>) -> Listings {
        Listings(vec![("Inbox", records)])
    }

    #[async_trait]
    impl ArchiveReader for Listings {
        async fn walk(&mut self, visitor: &mut dyn ArchiveVisitor) -> Result<(), ArchiveError> {
            for (path, records) in &self.0 {
                if visitor.enter_folder(&FolderPath::parse(path)).await? == FolderAction::Enter {
                    for record in records.clone() {
                        visitor.visit_item(record, true).await?;
                    }
                }
            }
            Ok(())
        }

        async fn close(&mut self) -> Result<(), ArchiveError> {
            Ok(())
        }
    }

    /// Rejects ids listed in `reject`, cancels after `cancel_after` deliveries
    #[derive(Default)]
    struct Sink {
        delivered: Vec<String>,
        reject: Vec<&'static str>,
        cancel_after: Option<(usize, CancelSignal)>,
    }

    #[async_trait]
    impl DeliveryClient for Sink {
        fn name(&self) -> &str {
            "sink"
        }

        async fn ensure_folder(&mut self, _folder: &str) -> Result<(), DeliveryError> {
            Ok(())
        }

        async fn deliver(
            &mut self,
            folder: &str,
            _flags: &[MessageFlag],
            _timestamp: DateTime<Utc>,
            payload: &[u8],
        ) -> Result<(), DeliveryError> {
            let text = String::from_utf8_lossy(payload);
            if self.reject.iter().any(|id| text.contains(id)) {
                return Err(DeliveryError::Rejected("no".to_string()));
            }
            self.delivered.push(folder.to_string());
            if let Some((n, cancel)) = &self.cancel_after {
                if self.delivered.len() >= *n {
                    cancel.cancel();
                }
            }
            Ok(())
        }

        async fn disconnect(&mut self) -> Result<(), DeliveryError> {
            Ok(())
        }
    }

    fn record(id: &str) -> ArchiveMessageRecord {
        ArchiveMessageRecord {
            subject: format!("message {}", id),
            message_id: format!("<{}>", id),
            body_text: "hello".to_string(),
            ..Default::default()
        }
    }

    fn open_tracker(dir: &TempDir) -> ProgressTracker {
        ProgressTracker::begin_with(
            dir.path().join("a.pst.import-state.json"),
            "fp",
            "ann",
            TrackerSettings::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_cancel_signal_is_shared() {
        let signal = CancelSignal::new();
        let other = signal.clone();
        assert!(!other.is_cancelled());
        signal.cancel();
        assert!(other.is_cancelled());
    }

    #[tokio::test]
    async fn test_failed_delivery_keeps_folder_incomplete() {
        let dir = TempDir::new().unwrap();
        let mut tracker = open_tracker(&dir);
        let mut reader = inbox(vec![record("a@x"), record("b@x")]);
        let mut sink = Sink {
            reject: vec!["b@x"],
            ..Default::default()
        };

        let orchestrator = Orchestrator::new(SkipPolicy::default(), Namespace::default());
        let summary = orchestrator
            .run(&mut reader, &mut sink, &mut tracker)
            .await
            .unwrap();

        assert_eq!(summary.delivered, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.folders_completed, 0);
        assert_eq!(tracker.progress().0, 1);
        assert_eq!(tracker.failures().count(), 1);
        assert!(tracker.state_path().exists());
        assert_eq!(sink.delivered, vec!["INBOX"]);

        drop(tracker);
        let resumed = open_tracker(&dir);
        assert!(resumed.is_delivered("a@x"));
        assert!(!resumed.is_delivered("b@x"));
        assert!(!resumed.is_folder_complete("Inbox"));
    }

    #[tokio::test]
    async fn test_cancel_stops_before_next_message() {
        let dir = TempDir::new().unwrap();
        let mut tracker = open_tracker(&dir);
        let mut reader = inbox(vec![record("a@x"), record("b@x"), record("c@x")]);

        let orchestrator = Orchestrator::new(SkipPolicy::default(), Namespace::default());
        let mut sink = Sink {
            cancel_after: Some((1, orchestrator.cancel_signal())),
            ..Default::default()
        };

        let summary = orchestrator
            .run(&mut reader, &mut sink, &mut tracker)
            .await
            .unwrap();

        assert!(summary.cancelled);
        assert_eq!(summary.delivered, 1);
        assert_eq!(sink.delivered.len(), 1);
        assert_eq!(tracker.progress().0, 1);
        assert!(tracker.state_path().exists());
    }

    #[tokio::test]
    async fn test_folder_listed_twice_with_one_failure_stays_incomplete() {
        let dir = TempDir::new().unwrap();
        let mut tracker = open_tracker(&dir);
        let mut reader = Listings(vec![
            ("Inbox", vec![record("a@x"), record("b@x")]),
            ("Sent Items", vec![record("s@x")]),
            ("Inbox", vec![record("c@x")]),
        ]);
        let mut sink = Sink {
            reject: vec!["b@x"],
            ..Default::default()
        };

        let orchestrator = Orchestrator::new(SkipPolicy::default(), Namespace::default());
        let summary = orchestrator
            .run(&mut reader, &mut sink, &mut tracker)
            .await
            .unwrap();

        assert_eq!(summary.delivered, 3);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.folders_completed, 1);

        drop(tracker);
        let resumed = open_tracker(&dir);
        assert!(!resumed.is_folder_complete("Inbox"));
        assert!(resumed.is_folder_complete("Sent Items"));
    }

    #[tokio::test]
    async fn test_folder_cut_short_by_cancel_stays_incomplete() {
        let dir = TempDir::new().unwrap();
        let mut tracker = open_tracker(&dir);
        let mut reader = Listings(vec![
            ("Inbox", vec![record("a@x")]),
            ("Inbox", vec![record("b@x"), record("c@x")]),
        ]);

        let orchestrator = Orchestrator::new(SkipPolicy::default(), Namespace::default());
        let mut sink = Sink {
            cancel_after: Some((2, orchestrator.cancel_signal())),
            ..Default::default()
        };

        let summary = orchestrator
            .run(&mut reader, &mut sink, &mut tracker)
            .await
            .unwrap();

        assert!(summary.cancelled);
        assert_eq!(summary.delivered, 2);
        assert_eq!(summary.folders_completed, 0);

        drop(tracker);
        assert!(!open_tracker(&dir).is_folder_complete("Inbox"));
    }
}
