//! Crash-safe resumable progress for one archive and destination account.
//!
//! The snapshot is a JSON sidecar next to the archive
//! (`<archive>.import-state.json`). It holds the archive fingerprint, the
//! destination account, counts, completed folders and the membership filter
//! of delivered identities, base64-armored. Writes go to a temp file in the
//! same directory and are renamed over the canonical path.
//!
//! A snapshot is reused only when fingerprint and account both match;
//! anything else (missing, stale, unreadable) degrades to a fresh run.

use std::collections::{BTreeSet, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::bloom::MembershipFilter;

/// Default filter capacity (messages)
pub const DEFAULT_CAPACITY: u64 = 100_000;

/// Default false-positive target (0.1%)
pub const DEFAULT_FALSE_POSITIVE_RATE: f64 = 0.001;

/// Bytes of the archive hashed into the fingerprint
pub const DEFAULT_FINGERPRINT_BYTES: u64 = 1024 * 1024;

/// Failed deliveries kept for diagnostics
pub const MAX_FAILED_ENTRIES: usize = 1000;

const STATE_SUFFIX: &str = ".import-state.json";
const LOCK_SUFFIX: &str = ".lock";
const SNAPSHOT_VERSION: u32 = 1;

/// Errors from the progress tracker
#[derive(Debug, Error)]
pub enum StateError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Corrupt state file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("State file {0} is in use by another run")]
    Locked(PathBuf),
}

impl StateError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Sizing and fingerprint settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerSettings {
    #[serde(default = "default_capacity")]
    pub capacity: u64,

    #[serde(default = "default_false_positive_rate")]
    pub false_positive_rate: f64,

    #[serde(default = "default_fingerprint_bytes")]
    pub fingerprint_bytes: u64,
}

fn default_capacity() -> u64 {
    DEFAULT_CAPACITY
}
fn default_false_positive_rate() -> f64 {
    DEFAULT_FALSE_POSITIVE_RATE
}
fn default_fingerprint_bytes() -> u64 {
    DEFAULT_FINGERPRINT_BYTES
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            false_positive_rate: default_false_positive_rate(),
            fingerprint_bytes: default_fingerprint_bytes(),
        }
    }
}

/// One failed delivery, kept for diagnostics only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedDelivery {
    pub identity: String,
    pub folder: String,
    pub error: String,
    pub at: DateTime<Utc>,
}

/// Persisted snapshot layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub version: u32,
    pub archive_path: PathBuf,

    /// SHA-256 hex of the archive's leading bytes
    pub fingerprint: String,

    /// Destination account identity
    pub account: String,

    pub delivered_count: u64,
    pub total_count: u64,

    #[serde(default)]
    pub completed_folders: BTreeSet<String>,

    /// Base64 of `MembershipFilter::to_bytes`
    pub membership: String,

    #[serde(default)]
    pub failed: Vec<FailedDelivery>,

    pub saved_at: DateTime<Utc>,
}

impl ProgressSnapshot {
    /// Read a snapshot; `Ok(None)` if no file exists
    pub fn load(path: &Path) -> Result<Option<Self>, StateError> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StateError::io(path, e)),
        };

        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|e| StateError::Corrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
    }

    /// Decode the armored membership filter
    pub fn filter(&self, path: &Path) -> Result<MembershipFilter, StateError> {
        let corrupt = |reason: String| StateError::Corrupt {
            path: path.to_path_buf(),
            reason,
        };

        let bytes = STANDARD
            .decode(self.membership.as_bytes())
            .map_err(|e| corrupt(format!("membership armor: {}", e)))?;
        MembershipFilter::from_bytes(&bytes).map_err(|e| corrupt(e.to_string()))
    }
}

/// Sidecar state path for an archive
pub fn state_path_for(archive: &Path) -> PathBuf {
    let mut name = archive.as_os_str().to_os_string();
    name.push(STATE_SUFFIX);
    PathBuf::from(name)
}

fn archive_path_for(state_path: &Path) -> PathBuf {
    let name = state_path.to_string_lossy();
    match name.strip_suffix(STATE_SUFFIX) {
        Some(archive) => PathBuf::from(archive),
        None => state_path.to_path_buf(),
    }
}

/// SHA-256 over at most `prefix_bytes` leading bytes of `archive`, hex encoded
pub fn fingerprint(archive: &Path, prefix_bytes: u64) -> io::Result<String> {
    let file = File::open(archive)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file.take(prefix_bytes), &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Resumable progress for one archive/account pair
pub struct ProgressTracker {
    state_path: PathBuf,
    archive_path: PathBuf,
    fingerprint: String,
    account: String,
    settings: TrackerSettings,

    filter: MembershipFilter,
    delivered_count: u64,
    total_count: u64,
    completed_folders: BTreeSet<String>,
    failed: VecDeque<FailedDelivery>,

    /// A matching snapshot was loaded; lookups answer false otherwise
    resuming: bool,

    _lock: StateLock,
}

impl ProgressTracker {
    /// Start tracking for `archive`: fingerprint it, lock its sidecar and
    /// load a matching snapshot if one exists.
    pub fn begin(
        archive: &Path,
        account: &str,
        settings: TrackerSettings,
    ) -> Result<Self, StateError> {
        let archive = archive
            .canonicalize()
            .map_err(|e| StateError::io(archive, e))?;
        let fingerprint = fingerprint(&archive, settings.fingerprint_bytes)
            .map_err(|e| StateError::io(&archive, e))?;
        let state_path = state_path_for(&archive);

        Self::begin_with(state_path, &fingerprint, account, settings)
    }

    /// Start tracking against an explicit state path and fingerprint
    pub fn begin_with(
        state_path: PathBuf,
        fingerprint: &str,
        account: &str,
        settings: TrackerSettings,
    ) -> Result<Self, StateError> {
        let lock = StateLock::acquire(&state_path)?;

        let mut tracker = Self {
            archive_path: archive_path_for(&state_path),
            state_path,
            fingerprint: fingerprint.to_string(),
            account: account.to_string(),
            filter: MembershipFilter::with_estimates(
                settings.capacity,
                settings.false_positive_rate,
            ),
            settings,
            delivered_count: 0,
            total_count: 0,
            completed_folders: BTreeSet::new(),
            failed: VecDeque::new(),
            resuming: false,
            _lock: lock,
        };

        match tracker.load_matching() {
            Ok(true) => info!(
                delivered = tracker.delivered_count,
                total = tracker.total_count,
                folders = tracker.completed_folders.len(),
                "Resuming from saved progress"
            ),
            Ok(false) => debug!("No matching saved progress, starting fresh"),
            Err(e) => warn!(error = %e, "Ignoring unreadable saved progress"),
        }

        Ok(tracker)
    }

    /// Load the snapshot if fingerprint and account match
    fn load_matching(&mut self) -> Result<bool, StateError> {
        let Some(snapshot) = ProgressSnapshot::load(&self.state_path)? else {
            return Ok(false);
        };

        if snapshot.fingerprint != self.fingerprint {
            info!("Archive changed since last run, ignoring saved progress");
            return Ok(false);
        }
        if snapshot.account != self.account {
            info!(saved = %snapshot.account, "Saved progress belongs to another account, ignoring");
            return Ok(false);
        }

        self.filter = snapshot.filter(&self.state_path)?;
        self.delivered_count = snapshot.delivered_count;
        self.total_count = snapshot.total_count;
        self.completed_folders = snapshot.completed_folders;
        self.failed = snapshot.failed.into();
        self.resuming = true;

        Ok(true)
    }

    /// Mark an identity delivered. Returns true on first insertion.
    pub fn mark_delivered(&mut self, identity: &str) -> bool {
        let added = self.filter.insert(identity);
        if added {
            self.delivered_count += 1;
        }
        added
    }

    /// Whether `identity` was (probably) delivered by an earlier run.
    ///
    /// Always false on a fresh run, even after marks in this run: the same
    /// message filed in two folders is delivered to both.
    pub fn is_delivered(&self, identity: &str) -> bool {
        self.resuming && self.filter.contains(identity)
    }

    pub fn mark_folder_complete(&mut self, folder: &str) {
        self.completed_folders.insert(folder.to_string());
    }

    /// Whether an earlier run finished `folder`; always false on a fresh run
    pub fn is_folder_complete(&self, folder: &str) -> bool {
        self.resuming && self.completed_folders.contains(folder)
    }

    /// Remember a failed delivery for diagnostics
    pub fn record_failure(&mut self, identity: &str, folder: &str, error: &str) {
        if self.failed.len() == MAX_FAILED_ENTRIES {
            self.failed.pop_front();
        }
        self.failed.push_back(FailedDelivery {
            identity: identity.to_string(),
            folder: folder.to_string(),
            error: error.to_string(),
            at: Utc::now(),
        });
    }

    /// Forget failures from earlier runs; they are retried now
    pub fn clear_failures(&mut self) {
        self.failed.clear();
    }

    /// Raise the total to `seen` if larger
    pub fn observe_total(&mut self, seen: u64) {
        self.total_count = self.total_count.max(seen);
    }

    /// Atomically write the snapshot
    pub fn persist(&self) -> Result<(), StateError> {
        let snapshot = ProgressSnapshot {
            version: SNAPSHOT_VERSION,
            archive_path: self.archive_path.clone(),
            fingerprint: self.fingerprint.clone(),
            account: self.account.clone(),
            delivered_count: self.delivered_count,
            total_count: self.total_count,
            completed_folders: self.completed_folders.clone(),
            membership: STANDARD.encode(self.filter.to_bytes()),
            failed: self.failed.iter().cloned().collect(),
            saved_at: Utc::now(),
        };

        let data = serde_json::to_vec(&snapshot).map_err(|e| StateError::Corrupt {
            path: self.state_path.clone(),
            reason: e.to_string(),
        })?;

        let dir = state_dir(&self.state_path);
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| StateError::io(dir, e))?;
        tmp.write_all(&data)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| StateError::io(tmp.path(), e))?;
        tmp.persist(&self.state_path)
            .map_err(|e| StateError::io(&self.state_path, e.error))?;

        debug!(path = %self.state_path.display(), delivered = self.delivered_count, "Progress saved");
        Ok(())
    }

    /// Delete the snapshot and reset to an empty state
    pub fn discard(&mut self) -> Result<(), StateError> {
        match fs::remove_file(&self.state_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(StateError::io(&self.state_path, e)),
        }

        self.filter =
            MembershipFilter::with_estimates(self.settings.capacity, self.settings.false_positive_rate);
        self.delivered_count = 0;
        self.total_count = 0;
        self.completed_folders.clear();
        self.failed.clear();
        self.resuming = false;

        debug!(path = %self.state_path.display(), "Progress discarded");
        Ok(())
    }

    pub fn is_resuming(&self) -> bool {
        self.resuming
    }

    pub fn has_existing_progress(&self) -> bool {
        self.resuming && self.delivered_count > 0
    }

    /// (delivered, total)
    pub fn progress(&self) -> (u64, u64) {
        (self.delivered_count, self.total_count)
    }

    pub fn completed_folders(&self) -> &BTreeSet<String> {
        &self.completed_folders
    }

    pub fn failures(&self) -> impl Iterator<Item = &FailedDelivery> {
        self.failed.iter()
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// (capacity, serialized size in bytes) of the membership filter
    pub fn filter_stats(&self) -> (u64, usize) {
        (self.filter.capacity(), self.filter.size_bytes())
    }
}

fn state_dir(state_path: &Path) -> &Path {
    match state_path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    }
}

/// Exclusive advisory lock on `<state>.lock`, held for the tracker's life.
/// The lock file is removed again on drop.
struct StateLock {
    path: PathBuf,
    _file: File,
}

impl StateLock {
    fn acquire(state_path: &Path) -> Result<Self, StateError> {
        let path = lock_path_for(state_path);

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .map_err(|e| StateError::io(&path, e))?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                return Err(StateError::Locked(state_path.to_path_buf()));
            }
            Err(e) => return Err(StateError::io(&path, e)),
        }

        Ok(Self { path, _file: file })
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        // Unlinked while still held; the handle closes after this
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                debug!(path = %self.path.display(), error = %e, "Could not remove lock file");
            }
        }
    }
}

fn lock_path_for(state_path: &Path) -> PathBuf {
    let mut name = state_path.as_os_str().to_os_string();
    name.push(LOCK_SUFFIX);
    PathBuf::from(name)
}
