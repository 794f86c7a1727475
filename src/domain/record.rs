//! Archive records, folder paths and compiled messages.
//!
//! An `ArchiveMessageRecord` is owned by the orchestrator only for the
//! duration of one compile step. The `CompiledMessage` produced from it is
//! immutable and dropped as soon as delivery returns.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Structured fields of one archive item.
///
/// Empty strings stand for "property not present in the archive".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArchiveMessageRecord {
    #[serde(default)]
    pub subject: String,

    #[serde(default)]
    pub sender_name: String,

    #[serde(default)]
    pub sender_email: String,

    /// Display list of primary recipients
    #[serde(default)]
    pub to: String,

    /// Display list of carbon-copy recipients
    #[serde(default)]
    pub cc: String,

    #[serde(default)]
    pub body_text: String,

    #[serde(default)]
    pub body_html: String,

    /// Original transport header block, if the archive kept one
    #[serde(default)]
    pub transport_headers: String,

    /// Client submit time
    #[serde(default, with = "flexible_time")]
    pub submit_time: Option<DateTime<Utc>>,

    /// Delivery time at the original mailbox
    #[serde(default, with = "flexible_time")]
    pub delivery_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub message_id: String,

    #[serde(default)]
    pub in_reply_to: String,

    #[serde(default)]
    pub references: String,
}

/// A message ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledMessage {
    /// Stable identity used for progress tracking
    pub identity: String,

    /// Best-available original send time
    pub timestamp: DateTime<Utc>,

    /// RFC 5322 message bytes
    pub payload: Vec<u8>,
}

/// Folder location inside the archive, as an ordered list of components.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FolderPath {
    components: Vec<String>,
}

impl FolderPath {
    /// The archive root
    pub fn root() -> Self {
        Self::default()
    }

    pub fn new(components: Vec<String>) -> Self {
        Self { components }
    }

    /// Parse a slash-separated path as archive exports write them
    pub fn parse(path: &str) -> Self {
        let components = path
            .split(|c| c == '/' || c == '\\')
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect();
        Self { components }
    }

    pub fn components(&self) -> &[String] {
        &self.components
    }

    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }
}

impl fmt::Display for FolderPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.components.join("/"))
    }
}

/// Flags set on a message when it is appended to the destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageFlag {
    Seen,
    Answered,
    Flagged,
    Draft,
}

/// Accepts integer Unix seconds or an RFC 3339 / RFC 2822 string.
///
/// Anything else reads as absent so the compiler's date fallback applies;
/// one odd field never makes the whole export unreadable.
mod flexible_time {
    use chrono::{DateTime, TimeZone, Utc};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use tracing::warn;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(i64),
        Text(String),
    }

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        value.map(|t| t.to_rfc3339()).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let parsed = match Option::<Raw>::deserialize(deserializer)? {
            None => None,
            Some(Raw::Seconds(secs)) => {
                let parsed = Utc.timestamp_opt(secs, 0).single();
                if parsed.is_none() {
                    warn!(secs, "Timestamp out of range, ignoring");
                }
                parsed
            }
            Some(Raw::Text(text)) => parse_text(&text),
        };
        Ok(parsed)
    }

    fn parse_text(text: &str) -> Option<DateTime<Utc>> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }

        match DateTime::parse_from_rfc3339(text).or_else(|_| DateTime::parse_from_rfc2822(text)) {
            Ok(t) => Some(t.with_timezone(&Utc)),
            Err(e) => {
                warn!(value = %text, error = %e, "Unparseable timestamp, ignoring");
                None
            }
        }
    }
}
