//! Maildir++ delivery client.
//!
//! Writes messages into a local Maildir++ tree as used by Dovecot and
//! Courier: `INBOX` is the root maildir and `INBOX.A.B` lives in
//! `<root>/.A.B`. Storage itself goes through the `maildir` crate, which
//! writes under `tmp/` and moves the file into `cur/` with its flags in the
//! info suffix. The file's mtime carries the message timestamp, which
//! servers report as the internal date.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use filetime::FileTime;
use ::maildir::Maildir;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::core::Namespace;
use crate::domain::MessageFlag;

use super::{Credentials, DeliveryClient, DeliveryError};

const SUBSCRIPTIONS: &str = "subscriptions";
const FOLDER_MARKER: &str = "maildirfolder";

/// Delivery client for a local Maildir++ tree
pub struct MaildirClient {
    root: PathBuf,
    account: String,
    namespace: Namespace,
    ensured: HashSet<String>,
}

impl MaildirClient {
    /// Open the Maildir++ root for `credentials.account`
    pub async fn connect(
        root: &Path,
        credentials: &Credentials,
        namespace: Namespace,
    ) -> Result<Self, DeliveryError> {
        let meta = fs::metadata(root)
            .await
            .map_err(|e| DeliveryError::Network(format!("{}: {}", root.display(), e)))?;
        if !meta.is_dir() {
            return Err(DeliveryError::Network(format!(
                "{} is not a directory",
                root.display()
            )));
        }
        if meta.permissions().readonly() {
            return Err(DeliveryError::Auth(format!(
                "{} is read-only for {}",
                root.display(),
                credentials.account
            )));
        }

        let client = Self {
            root: root.to_path_buf(),
            account: credentials.account.clone(),
            namespace,
            ensured: HashSet::new(),
        };

        create_dirs(client.root.clone()).await.map_err(|e| match e {
            DeliveryError::Io(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                DeliveryError::Auth(e.to_string())
            }
            e => e,
        })?;

        debug!(root = %client.root.display(), account = %client.account, "Maildir connected");
        Ok(client)
    }

    /// Directory holding `folder`
    pub fn folder_dir(&self, folder: &str) -> Result<PathBuf, DeliveryError> {
        let root = self.namespace.root.as_str();
        let sep = self.namespace.separator;

        if folder.eq_ignore_ascii_case(root) {
            return Ok(self.root.clone());
        }

        let relative = folder
            .strip_prefix(root)
            .and_then(|rest| rest.strip_prefix(sep))
            .unwrap_or(folder);

        let components: Vec<String> = relative
            .split(sep)
            .map(|c| if sep == '.' { c.to_string() } else { c.replace('.', "_") })
            .collect();

        if components
            .iter()
            .any(|c| c.is_empty() || c.contains('/') || c == "..")
        {
            return Err(DeliveryError::Rejected(format!(
                "invalid folder name '{}'",
                folder
            )));
        }

        Ok(self.root.join(format!(".{}", components.join("."))))
    }

    async fn subscribe(&self, folder: &str) -> io::Result<()> {
        let path = self.root.join(SUBSCRIPTIONS);
        let name = folder_subscription_name(folder, &self.namespace);

        let existing = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e),
        };
        if existing.lines().any(|line| line == name) {
            return Ok(());
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(format!("{}\n", name).as_bytes()).await?;
        file.flush().await
    }
}

#[async_trait]
impl DeliveryClient for MaildirClient {
    fn name(&self) -> &str {
        "maildir"
    }

    async fn ensure_folder(&mut self, folder: &str) -> Result<(), DeliveryError> {
        if self.ensured.contains(folder) {
            return Ok(());
        }

        let dir = self.folder_dir(folder)?;
        create_dirs(dir.clone()).await?;

        if dir != self.root {
            let marker = dir.join(FOLDER_MARKER);
            if !fs::try_exists(&marker).await? {
                fs::write(&marker, b"").await?;
            }
            self.subscribe(folder).await?;
        }

        self.ensured.insert(folder.to_string());
        Ok(())
    }

    async fn deliver(
        &mut self,
        folder: &str,
        flags: &[MessageFlag],
        timestamp: DateTime<Utc>,
        payload: &[u8],
    ) -> Result<(), DeliveryError> {
        if !fs::try_exists(&self.root).await? {
            return Err(DeliveryError::ConnectionLost(format!(
                "{} disappeared",
                self.root.display()
            )));
        }

        let dir = self.folder_dir(folder)?;
        if !fs::try_exists(dir.join("cur")).await? {
            return Err(DeliveryError::Rejected(format!(
                "folder '{}' does not exist",
                folder
            )));
        }

        let letters = flag_letters(flags);
        let payload = payload.to_vec();
        let mtime = FileTime::from_unix_time(timestamp.timestamp(), 0);

        let path = tokio::task::spawn_blocking(move || -> Result<PathBuf, DeliveryError> {
            let maildir = Maildir::from(dir);
            let id = maildir.store_cur_with_flags(&payload, &letters)?;
            // Unix info separator, as the crate writes it
            let path = maildir.path().join("cur").join(format!("{}:2,{}", id, letters));
            filetime::set_file_mtime(&path, mtime)?;
            Ok(path)
        })
        .await
        .map_err(|e| DeliveryError::Io(io::Error::other(e)))??;

        debug!(folder = %folder, path = %path.display(), "Stored message");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), DeliveryError> {
        self.ensured.clear();
        Ok(())
    }
}

/// `cur/`, `new/` and `tmp/` under `dir`, created if missing
async fn create_dirs(dir: PathBuf) -> Result<(), DeliveryError> {
    tokio::task::spawn_blocking(move || Maildir::from(dir).create_dirs())
        .await
        .map_err(|e| DeliveryError::Io(io::Error::other(e)))?
        .map_err(DeliveryError::Io)
}

/// Maildir info letters, in ASCII order
fn flag_letters(flags: &[MessageFlag]) -> String {
    let mut letters: Vec<char> = flags
        .iter()
        .map(|flag| match flag {
            MessageFlag::Draft => 'D',
            MessageFlag::Flagged => 'F',
            MessageFlag::Answered => 'R',
            MessageFlag::Seen => 'S',
        })
        .collect();
    letters.sort_unstable();
    letters.dedup();
    letters.into_iter().collect()
}

/// Dovecot lists subscriptions relative to the root, with `.` separators
fn folder_subscription_name(folder: &str, namespace: &Namespace) -> String {
    folder
        .strip_prefix(namespace.root.as_str())
        .and_then(|rest| rest.strip_prefix(namespace.separator))
        .unwrap_or(folder)
        .replace(namespace.separator, ".")
}
