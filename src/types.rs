//! Core policy types shared by the queue and the broker backends.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where the broker keeps a stream's messages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// Kept in broker memory; lost on broker restart.
    #[default]
    Memory,
    /// Persisted to the broker's disk.
    File,
}

impl StorageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageType::Memory => "memory",
            StorageType::File => "file",
        }
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a consumer confirms processing before the broker advances.
///
/// - `Explicit`: every message is acknowledged individually
/// - `All`: acknowledging a message acknowledges everything before it
/// - `None`: no acknowledgment; delivered means done
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckPolicy {
    #[default]
    Explicit,
    All,
    None,
}

impl AckPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckPolicy::Explicit => "explicit",
            AckPolicy::All => "all",
            AckPolicy::None => "none",
        }
    }

    /// Whether messages delivered under this policy expect a settlement.
    pub fn requires_ack(&self) -> bool {
        !matches!(self, AckPolicy::None)
    }
}

impl fmt::Display for AckPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a new durable consumer starts reading the stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliverPolicy {
    /// From the first message still retained.
    #[default]
    All,
    /// From the last message in the stream.
    Last,
    /// Only messages published after the consumer is created.
    New,
    /// The last message of every subject, then everything after.
    LastPerSubject,
}

impl DeliverPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliverPolicy::All => "all",
            DeliverPolicy::Last => "last",
            DeliverPolicy::New => "new",
            DeliverPolicy::LastPerSubject => "last_per_subject",
        }
    }
}

impl fmt::Display for DeliverPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broker acknowledgment of a published message.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct PublishAck {
    /// Stream that stored the message.
    pub stream: String,
    /// Sequence number assigned by the stream.
    pub sequence: u64,
    /// Whether the broker recognised the message as a duplicate.
    pub duplicate: bool,
}

impl PublishAck {
    pub fn new(stream: impl Into<String>, sequence: u64, duplicate: bool) -> Self {
        Self {
            stream: stream.into(),
            sequence,
            duplicate,
        }
    }
}

/// Match a subject against a pattern with `*` (one token) and `>` (one or
/// more trailing tokens) wildcards.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Whether some subject matches both patterns. Wildcards may appear on
/// either side.
pub fn subjects_overlap(a: &str, b: &str) -> bool {
    let mut a_tokens = a.split('.');
    let mut b_tokens = b.split('.');

    loop {
        match (a_tokens.next(), b_tokens.next()) {
            (Some(">"), Some(_)) | (Some(_), Some(">")) => return true,
            (Some("*"), Some(_)) | (Some(_), Some("*")) => continue,
            (Some(x), Some(y)) if x == y => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
