//! Compiles structured archive records into RFC 5322 messages.
//!
//! A genuine mail item always compiles: a missing message-id is
//! synthesized, an out-of-range date falls back to the current time, and a
//! record without transport headers gets a fresh header block built with
//! `mail-builder`. Should the builder ever fail, the record is skipped.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Datelike, Utc};
use mail_builder::headers::address::Address;
use mail_builder::headers::text::Text;
use mail_builder::MessageBuilder;
use tracing::warn;

use crate::domain::{ArchiveMessageRecord, CompiledMessage};

use super::header::declares_multipart;

/// Earliest plausible send year
pub const MIN_YEAR: i32 = 1990;

/// Latest plausible send year
pub const MAX_YEAR: i32 = 2100;

/// Domain part of synthesized message-ids
const SYNTHETIC_ID_SUFFIX: &str = "archive-import@localhost";

static SYNTHESIZED: AtomicU64 = AtomicU64::new(0);

/// Compile one record. Returns `None` for records that are not mail items.
pub fn compile(record: &ArchiveMessageRecord, is_mail: bool) -> Option<CompiledMessage> {
    if !is_mail {
        return None;
    }

    compile_at(record, Utc::now())
}

/// Compile with an explicit notion of "now"
pub fn compile_at(record: &ArchiveMessageRecord, now: DateTime<Utc>) -> Option<CompiledMessage> {
    let identity = resolve_identity(record, now);
    let timestamp = resolve_timestamp(record, now);

    let payload = if record.transport_headers.is_empty() {
        match synthesize(record, &identity, timestamp) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(identity = %identity, error = %err, "Could not build message, skipping");
                return None;
            }
        }
    } else {
        from_transport_headers(record)
    };

    Some(CompiledMessage {
        identity,
        timestamp,
        payload,
    })
}

/// Original message-id without angle brackets, or a fresh unique one
fn resolve_identity(record: &ArchiveMessageRecord, now: DateTime<Utc>) -> String {
    let original = record
        .message_id
        .trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .trim();

    if !original.is_empty() {
        return original.to_string();
    }

    let nanos = now.timestamp_nanos_opt().unwrap_or_else(|| now.timestamp());
    let seq = SYNTHESIZED.fetch_add(1, Ordering::Relaxed);
    format!("{}.{}.{}", nanos, seq, SYNTHETIC_ID_SUFFIX)
}

/// Submit time, else delivery time, else `now`; both only within range
pub fn resolve_timestamp(record: &ArchiveMessageRecord, now: DateTime<Utc>) -> DateTime<Utc> {
    [record.submit_time, record.delivery_time]
        .into_iter()
        .flatten()
        .find(|t| (MIN_YEAR..=MAX_YEAR).contains(&t.year()))
        .unwrap_or(now)
}

fn from_transport_headers(record: &ArchiveMessageRecord) -> Vec<u8> {
    let headers = record.transport_headers.as_str();
    let mut buf = Vec::with_capacity(headers.len() + record.body_text.len() + 4);
    buf.extend_from_slice(headers.as_bytes());

    // Keep the block's own line-ending convention
    let eol = if headers.contains('\n') && !headers.contains("\r\n") {
        "\n"
    } else {
        "\r\n"
    };

    if !headers.ends_with("\r\n\r\n") && !headers.ends_with("\n\n") {
        if !headers.ends_with('\n') {
            buf.extend_from_slice(eol.as_bytes());
        }
        buf.extend_from_slice(eol.as_bytes());
    }

    // A multipart body was stored already encoded
    let body = if declares_multipart(headers) || !record.body_text.is_empty() {
        &record.body_text
    } else {
        &record.body_html
    };
    buf.extend_from_slice(body.as_bytes());

    buf
}

fn synthesize(
    record: &ArchiveMessageRecord,
    identity: &str,
    timestamp: DateTime<Utc>,
) -> io::Result<Vec<u8>> {
    let mut builder = MessageBuilder::new()
        .message_id(identity)
        .date(timestamp.timestamp());

    let subject = single_line(&record.subject);
    if !subject.is_empty() {
        builder = builder.subject(subject);
    }

    let name = single_line(&record.sender_name);
    let email = bare_address(&record.sender_email);
    builder = match (name.is_empty(), email.is_empty()) {
        (true, false) => builder.from(Address::new_address(None::<String>, email)),
        (false, false) => builder.from(Address::new_address(Some(name), email)),
        (false, true) => builder.header("From", Text::new(name)),
        (true, true) => builder,
    };

    for (header, value) in [("To", &record.to), ("Cc", &record.cc)] {
        let value = single_line(value);
        if !value.is_empty() {
            builder = builder.header(header, Text::new(value));
        }
    }

    let in_reply_to = message_ids(&record.in_reply_to);
    if !in_reply_to.is_empty() {
        builder = builder.in_reply_to(in_reply_to);
    }
    let references = message_ids(&record.references);
    if !references.is_empty() {
        builder = builder.references(references);
    }

    // Both bodies make a multipart/alternative with plain text first
    let text = record.body_text.as_str();
    let html = record.body_html.as_str();
    if html.is_empty() || !text.is_empty() {
        builder = builder.text_body(text);
    }
    if !html.is_empty() {
        builder = builder.html_body(html);
    }

    builder.write_to_vec()
}

/// Header value with stray line breaks flattened
fn single_line(value: &str) -> String {
    value.trim().replace(['\r', '\n'], " ")
}

fn bare_address(value: &str) -> String {
    value
        .trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .trim()
        .to_string()
}

/// Message-ids from a whitespace separated `<id>` list
fn message_ids(value: &str) -> Vec<String> {
    value
        .split_whitespace()
        .map(bare_address)
        .filter(|id| !id.is_empty())
        .collect()
}
