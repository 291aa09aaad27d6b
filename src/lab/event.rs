//! SSE `data:` line parsing and the streamed result log

use serde::Deserialize;
use tracing::{debug, warn};

/// Prefix marking an SSE data line
pub const DATA_PREFIX: &str = "data: ";

/// Timestamp exactly as the server sent it
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum SentAt {
    Text(String),
    Number(serde_json::Number),
}

impl std::fmt::Display for SentAt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SentAt::Text(text) => f.write_str(text),
            SentAt::Number(number) => write!(f, "{}", number),
        }
    }
}

/// Top-level JSON object carried by a data line
#[derive(Debug, Clone, Deserialize)]
pub struct SseEnvelope {
    #[serde(rename = "requestId", default)]
    pub request_id: Option<serde_json::Value>,
    #[serde(default)]
    pub data: Option<SsePayload>,
}

/// Nested `data` object; every field may be absent
#[derive(Debug, Clone, Deserialize)]
pub struct SsePayload {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(rename = "sentAt", default)]
    pub sent_at: Option<SentAt>,
    #[serde(default)]
    pub error: Option<String>,
}

impl SseEnvelope {
    fn request_id(&self) -> Option<String> {
        match self.request_id.as_ref()? {
            serde_json::Value::Null => None,
            serde_json::Value::String(id) => Some(id.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Decide what a parsed event contributes to the log
    pub fn into_outcome(self) -> LineOutcome {
        let request_id = self.request_id();
        let Some(SsePayload {
            message,
            sent_at,
            error,
        }) = self.data
        else {
            return LineOutcome::Dropped;
        };

        match (message, sent_at) {
            (Some(message), Some(sent_at)) => LineOutcome::Entry(LogEntry {
                sent_at,
                message,
                request_id,
            }),
            (None, _) if error.is_some() => LineOutcome::ServerError {
                message: error.unwrap_or_default(),
            },
            _ => LineOutcome::Dropped,
        }
    }
}

/// One streamed message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub sent_at: SentAt,
    pub message: String,
    /// Server-side request tag, diagnostics only
    pub request_id: Option<String>,
}

impl LogEntry {
    pub fn new(sent_at: SentAt, message: String) -> Self {
        Self {
            sent_at,
            message,
            request_id: None,
        }
    }

    /// Display form: bracketed timestamp, message, blank separator line
    pub fn formatted(&self) -> String {
        self.to_string()
    }
}

impl std::fmt::Display for LogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}\n\n", self.sent_at, self.message)
    }
}

/// Append-only sequence of entries for one streaming request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Log {
    entries: Vec<LogEntry>,
}

impl Log {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: LogEntry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, LogEntry> {
        self.entries.iter()
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn last(&self) -> Option<&LogEntry> {
        self.entries.last()
    }
}

impl<'a> IntoIterator for &'a Log {
    type Item = &'a LogEntry;
    type IntoIter = std::slice::Iter<'a, LogEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

impl std::fmt::Display for Log {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for entry in &self.entries {
            write!(f, "{}", entry)?;
        }
        Ok(())
    }
}

/// What a single decoded line amounts to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOutcome {
    /// Not a data line (blank, comment, `event:`, `id:`, ...)
    Ignored,
    /// Data line whose payload is not JSON
    Malformed { reason: String },
    /// Valid JSON without a usable message
    Dropped,
    /// Server reported an error event inside the stream
    ServerError { message: String },
    Entry(LogEntry),
}

/// Inspect one line of the stream.
///
/// Malformed payloads are warned about and skipped; they never fail the request.
pub fn parse_line(line: &str) -> LineOutcome {
    let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
        return LineOutcome::Ignored;
    };

    let value: serde_json::Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(e) => {
            warn!("Skipping malformed SSE data line: {} ({:?})", e, payload);
            return LineOutcome::Malformed {
                reason: e.to_string(),
            };
        }
    };

    let envelope: SseEnvelope = match serde_json::from_value(value) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!("Dropping SSE event with unexpected shape: {}", e);
            return LineOutcome::Dropped;
        }
    };

    let outcome = envelope.into_outcome();
    match &outcome {
        LineOutcome::ServerError { message } => {
            warn!("Server reported an error in the stream: {}", message);
        }
        LineOutcome::Dropped => debug!("Dropping SSE event without message/sentAt"),
        _ => {}
    }
    outcome
}
