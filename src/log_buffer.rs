use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::fs;
use std::ops::Deref;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{Date, OffsetDateTime, PrimitiveDateTime, UtcOffset};

use crate::config::DEFAULT_LOG_CAPACITY;

const EXPORT_TIMESTAMP_FORMAT: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    Log,
    Error,
    System,
}

impl LogKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Error => "error",
            Self::System => "system",
        }
    }

    pub fn export_label(self) -> &'static str {
        match self {
            Self::Log => "LOG",
            Self::Error => "ERROR",
            Self::System => "SYSTEM",
        }
    }

    fn from_export_label(label: &str) -> Option<Self> {
        match label {
            "LOG" => Some(Self::Log),
            "ERROR" => Some(Self::Error),
            "SYSTEM" => Some(Self::System),
            _ => None,
        }
    }
}

impl fmt::Display for LogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub id: u64,
    pub timestamp: OffsetDateTime,
    pub kind: LogKind,
    pub message: String,
}

impl LogEntry {
    /// Line breaks inside the message are escaped so every entry stays on one line.
    pub fn export_line(&self) -> String {
        format!(
            "[{}] [{}] {}",
            format_export_timestamp(self.timestamp),
            self.kind.export_label(),
            escape_message(&self.message)
        )
    }
}

/// Immutable view of the buffer at one point in time.
#[derive(Debug, Clone)]
pub struct LogSnapshot {
    entries: Arc<[LogEntry]>,
}

impl LogSnapshot {
    pub fn ids(&self) -> Vec<u64> {
        self.entries.iter().map(|entry| entry.id).collect()
    }
}

impl Deref for LogSnapshot {
    type Target = [LogEntry];

    fn deref(&self) -> &Self::Target {
        &self.entries
    }
}

/// One line of an export, parsed back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedLine {
    pub timestamp: OffsetDateTime,
    pub kind: LogKind,
    pub message: String,
}

#[derive(Debug, Default)]
struct LogBufferState {
    entries: VecDeque<LogEntry>,
    next_id: u64,
    snapshot: Option<LogSnapshot>,
}

/// Bounded, ordered log history. Every mutation goes through one lock, so ids stay
/// strictly sequential whichever task appends.
#[derive(Debug)]
pub struct LogAggregator {
    capacity: usize,
    state: Mutex<LogBufferState>,
}

impl LogAggregator {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(LogBufferState::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn append(&self, kind: LogKind, raw_message: &str) -> LogEntry {
        self.append_at(kind, raw_message, OffsetDateTime::now_utc())
    }

    pub(crate) fn append_at(
        &self,
        kind: LogKind,
        raw_message: &str,
        timestamp: OffsetDateTime,
    ) -> LogEntry {
        let mut state = self.lock_state();
        let entry = LogEntry {
            id: state.next_id,
            timestamp,
            kind,
            message: raw_message.trim().to_string(),
        };
        state.next_id += 1;

        if state.entries.len() >= self.capacity {
            let overflow = state.entries.len() + 1 - self.capacity;
            state.entries.drain(..overflow);
        }
        state.entries.push_back(entry.clone());
        state.snapshot = None;

        entry
    }

    pub fn clear(&self) {
        let mut state = self.lock_state();
        state.entries.clear();
        state.next_id = 0;
        state.snapshot = None;
    }

    pub fn entries(&self) -> LogSnapshot {
        let mut state = self.lock_state();
        if let Some(snapshot) = state.snapshot.as_ref() {
            return snapshot.clone();
        }

        let snapshot = LogSnapshot {
            entries: state.entries.iter().cloned().collect::<Vec<_>>().into(),
        };
        state.snapshot = Some(snapshot.clone());
        snapshot
    }

    pub fn len(&self) -> usize {
        self.lock_state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Renders the retained entries only, oldest first, one line each.
    pub fn export_text(&self) -> String {
        self.entries()
            .iter()
            .map(LogEntry::export_line)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn write_export(&self, path: &Path) -> Result<usize, String> {
        let content = self.export_text();
        fs::write(path, content.as_bytes())
            .map_err(|error| format!("Failed to write log export to {}: {error}", path.display()))?;
        Ok(content.len())
    }

    fn lock_state(&self) -> MutexGuard<'_, LogBufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for LogAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

pub fn format_export_timestamp(timestamp: OffsetDateTime) -> String {
    timestamp
        .to_offset(UtcOffset::UTC)
        .format(EXPORT_TIMESTAMP_FORMAT)
        .unwrap_or_else(|_| timestamp.unix_timestamp().to_string())
}

pub fn parse_export_line(line: &str) -> Option<ExportedLine> {
    let rest = line.strip_prefix('[')?;
    let (raw_timestamp, rest) = rest.split_once("] [")?;
    let (raw_kind, message) = rest.split_once(']')?;
    let message = message.strip_prefix(' ').unwrap_or(message);

    let timestamp = PrimitiveDateTime::parse(raw_timestamp, EXPORT_TIMESTAMP_FORMAT)
        .ok()?
        .assume_utc();
    let kind = LogKind::from_export_label(raw_kind)?;

    Some(ExportedLine {
        timestamp,
        kind,
        message: unescape_message(message),
    })
}

fn escape_message(message: &str) -> String {
    let mut escaped = String::with_capacity(message.len());
    for ch in message.chars() {
        match ch {
            '\\' => escaped.push_str("\\\\"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            other => escaped.push(other),
        }
    }
    escaped
}

fn unescape_message(raw: &str) -> String {
    let mut message = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            message.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => message.push('\n'),
            Some('r') => message.push('\r'),
            Some(other) => message.push(other),
            None => message.push('\\'),
        }
    }
    message
}

pub fn export_file_name(product_name: &str, date: Date) -> String {
    format!(
        "{product_name}-logs-{:04}-{:02}-{:02}.txt",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}
