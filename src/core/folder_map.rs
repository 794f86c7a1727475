//! Archive folder path to destination mailbox name.
//!
//! Mapping is total and pure: every input, including the empty string or a
//! string made only of illegal characters, yields a non-empty name under the
//! destination's root namespace.

use serde::{Deserialize, Serialize};

/// Top-level containers archive tools put above the real folders
const ROOT_PREFIXES: &[&str] = &[
    "top of personal folders",
    "top of outlook data file",
    "root - mailbox",
    "root - public",
    "root",
];

/// Longest component kept, in characters
pub const MAX_COMPONENT_CHARS: usize = 200;

/// Name used for components that sanitize to nothing
pub const UNNAMED: &str = "Unnamed";

/// Destination folder hierarchy convention
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Namespace {
    /// Root mailbox every mapped folder lives under
    pub root: String,

    /// Hierarchy separator
    pub separator: char,
}

impl Default for Namespace {
    fn default() -> Self {
        Self {
            root: "INBOX".to_string(),
            separator: '.',
        }
    }
}

impl Namespace {
    /// Map a raw archive folder path to a destination folder name
    pub fn map_folder(&self, raw: &str) -> String {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return self.root.clone();
        }

        let mut parts: Vec<&str> = trimmed.split(|c| c == '/' || c == '\\').collect();

        // Leading/trailing slashes carry no component
        while parts.first().map_or(false, |p| p.trim().is_empty()) {
            parts.remove(0);
        }
        while parts.last().map_or(false, |p| p.trim().is_empty()) {
            parts.pop();
        }

        if let Some(first) = parts.first() {
            if ROOT_PREFIXES.contains(&first.trim().to_lowercase().as_str()) {
                parts.remove(0);
            }
        }

        if parts.is_empty() {
            return self.root.clone();
        }

        let parts: Vec<String> = parts.iter().map(|p| self.sanitize_component(p)).collect();
        let first = parts[0].to_lowercase();
        let rest = &parts[1..];

        if rest.is_empty() {
            let well_known = match first.as_str() {
                "inbox" => Some(None),
                "sent items" | "sent" => Some(Some("Sent")),
                "deleted items" | "trash" => Some(Some("Trash")),
                "drafts" => Some(Some("Drafts")),
                "junk e-mail" | "junk" | "spam" => Some(Some("Junk")),
                _ => None,
            };
            match well_known {
                Some(None) => return self.root.clone(),
                Some(Some(name)) => return self.join(&[name]),
                None => {}
            }
        } else {
            let subtree: Option<&[&str]> = match first.as_str() {
                "inbox" => Some(&[]),
                "sent items" => Some(&["Sent"]),
                "deleted items" => Some(&["Trash"]),
                _ => None,
            };
            if let Some(subtree) = subtree {
                let mut nested: Vec<&str> = subtree.to_vec();
                nested.extend(rest.iter().map(String::as_str));
                return self.join(&nested);
            }
        }

        let all: Vec<&str> = parts.iter().map(String::as_str).collect();
        self.join(&all)
    }

    /// Clean one path component into a legal destination name
    pub fn sanitize_component(&self, part: &str) -> String {
        let mut name = String::with_capacity(part.len());

        for c in part.chars() {
            let c = match c {
                '\t' => ' ',
                c if c.is_control() => continue,
                c => c,
            };

            if let Some(replacement) = substitute(c) {
                name.push_str(replacement);
            } else if c == self.separator {
                name.push('_');
            } else {
                name.push(c);
            }
        }

        name.retain(|c| !is_disallowed(c) && c != self.separator);

        let truncated: String = name.trim().chars().take(MAX_COMPONENT_CHARS).collect();
        let truncated = truncated.trim_end();

        if truncated.is_empty() {
            UNNAMED.to_string()
        } else {
            truncated.to_string()
        }
    }

    fn join(&self, children: &[&str]) -> String {
        let mut name = self.root.clone();
        for child in children {
            name.push(self.separator);
            name.push_str(child);
        }
        name
    }
}

/// Map with the default `INBOX` / `.` namespace
pub fn map_folder(raw: &str) -> String {
    Namespace::default().map_folder(raw)
}

/// Punctuation destination servers reject or treat as wildcards
fn substitute(c: char) -> Option<&'static str> {
    Some(match c {
        '/' | '\\' | '|' | ':' => "-",
        '*' | '%' | '?' => "_",
        '"' => "'",
        '<' => "(",
        '>' => ")",
        _ => return None,
    })
}

fn is_disallowed(c: char) -> bool {
    let cp = c as u32;
    c.is_control() || (0xFDD0..=0xFDEF).contains(&cp) || cp & 0xFFFE == 0xFFFE
}
