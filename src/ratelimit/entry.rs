//! Request log entries and their wire encoding.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One admitted request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// When the request was admitted
    pub timestamp: DateTime<Utc>,
    /// What was requested (reserved for per-route limiting)
    pub action: Option<String>,
    /// Who made the request (reserved for per-client limiting)
    pub source: Option<String>,
}

impl LogEntry {
    /// An entry for a request admitted at `timestamp`, with no classifiers.
    pub fn at(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            action: None,
            source: None,
        }
    }
}

/// The shared log of admitted requests, in insertion order.
///
/// Serialized as a plain JSON array of entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestLog {
    entries: Vec<LogEntry>,
}

impl RequestLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a stored log. `None` (nothing stored yet) is an empty log;
    /// a value that is present but not a valid log is an error.
    pub fn decode(raw: Option<&[u8]>) -> Result<Self> {
        match raw {
            Some(bytes) => Ok(serde_json::from_slice(bytes)?),
            None => Ok(Self::new()),
        }
    }

    /// Encode the log for storage.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append an entry at the end of the log.
    pub fn push(&mut self, entry: LogEntry) {
        self.entries.push(entry);
    }

    /// Drop every entry older than `cutoff`. Returns how many were removed.
    pub fn discard_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.timestamp >= cutoff);
        before - self.entries.len()
    }

    /// The earliest timestamp still in the log.
    pub fn oldest(&self) -> Option<DateTime<Utc>> {
        self.entries.iter().map(|entry| entry.timestamp).min()
    }
}

impl From<Vec<LogEntry>> for RequestLog {
    fn from(entries: Vec<LogEntry>) -> Self {
        Self { entries }
    }
}
