//! Run log window: live entries merged with older pages.
//!
//! The window is kept in chronological order (oldest first). Live entries
//! append, historical pages prepend. Every merge deduplicates by id: the last
//! occurrence in list order supplies the value, the first keeps the
//! position. Merging the same page twice is a no-op.

pub mod feed;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub use feed::{logs_topic, LogFeed};

/// One run log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Server id; unique within a run.
    pub id: u64,
    /// Server timestamp as sent.
    #[serde(default, alias = "timestamp")]
    pub created_at: Option<String>,
    /// Topic the line was logged under.
    #[serde(default)]
    pub context: String,
    /// Block that logged it.
    #[serde(default)]
    pub block_name: Option<String>,
    /// Text.
    #[serde(default)]
    pub message: String,
    /// Message type chain, e.g. `["text", "json"]`.
    #[serde(default)]
    pub message_types: Vec<String>,
}

/// Input to [`LogWindow::apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogAction {
    /// A live entry arrived.
    Log(LogEntry),
    /// An older page was fetched, newest first.
    FetchOlder {
        /// Page entries in server order.
        entries: Vec<LogEntry>,
        /// Cursor for the page after this one; `None` once exhausted.
        after: Option<String>,
    },
}

/// Deduplicated, time-ordered log list plus the pagination cursor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogWindow {
    entries: Vec<LogEntry>,
    after: Option<String>,
    fetched: bool,
}

impl LogWindow {
    /// Empty window; nothing fetched yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from an initial page (newest first) and its cursor.
    pub fn with_page(entries: Vec<LogEntry>, after: Option<String>) -> Self {
        let mut window = Self::new();
        window.apply(LogAction::FetchOlder { entries, after });
        window
    }

    /// Apply one action.
    pub fn apply(&mut self, action: LogAction) {
        match action {
            LogAction::Log(entry) => {
                let mut merged = std::mem::take(&mut self.entries);
                merged.push(entry);
                self.entries = dedup(merged);
            }
            LogAction::FetchOlder { entries, after } => {
                let mut merged: Vec<LogEntry> = entries.into_iter().rev().collect();
                merged.append(&mut self.entries);
                self.entries = dedup(merged);
                self.after = after;
                self.fetched = true;
            }
        }
    }

    /// Entries oldest first.
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Entries newest first, as displayed.
    pub fn rendered(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter().rev()
    }

    /// Cursor for the next older page.
    pub fn next_cursor(&self) -> Option<&str> {
        self.after.as_deref()
    }

    /// Whether older pages may remain.
    pub fn has_more(&self) -> bool {
        !self.fetched || self.after.is_some()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the window is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn dedup(entries: Vec<LogEntry>) -> Vec<LogEntry> {
    let mut position: HashMap<u64, usize> = HashMap::with_capacity(entries.len());
    let mut out: Vec<LogEntry> = Vec::with_capacity(entries.len());
    for entry in entries {
        match position.get(&entry.id) {
            Some(&at) => out[at] = entry,
            None => {
                position.insert(entry.id, out.len());
                out.push(entry);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u64, message: &str) -> LogEntry {
        LogEntry {
            id,
            created_at: None,
            context: "run".into(),
            block_name: Some("chat".into()),
            message: message.into(),
            message_types: vec!["text".into()],
        }
    }

    fn ids(window: &LogWindow) -> Vec<u64> {
        window.entries().iter().map(|e| e.id).collect()
    }

    #[test]
    fn test_live_entries_append() {
        let mut window = LogWindow::new();
        window.apply(LogAction::Log(entry(1, "a")));
        window.apply(LogAction::Log(entry(2, "b")));
        assert_eq!(ids(&window), [1, 2]);
        assert_eq!(window.rendered().map(|e| e.id).collect::<Vec<_>>(), [2, 1]);
        assert_eq!(window.next_cursor(), None);
        assert!(window.has_more());
    }

    #[test]
    fn test_fetch_older_prepends_reversed_page() {
        let mut window = LogWindow::new();
        window.apply(LogAction::Log(entry(5, "live")));
        window.apply(LogAction::FetchOlder {
            entries: vec![entry(4, "d"), entry(3, "c")],
            after: Some("cursor-a".into()),
        });
        assert_eq!(ids(&window), [3, 4, 5]);
        assert_eq!(window.next_cursor(), Some("cursor-a"));

        window.apply(LogAction::FetchOlder {
            entries: vec![entry(2, "b"), entry(1, "a")],
            after: None,
        });
        assert_eq!(ids(&window), [1, 2, 3, 4, 5]);
        assert!(!window.has_more());
    }

    #[test]
    fn test_live_entry_replaces_fetched_value_in_place() {
        let mut window = LogWindow::new();
        window.apply(LogAction::FetchOlder {
            entries: vec![entry(1, "one"), entry(2, "two")],
            after: Some("cursor-a".into()),
        });
        window.apply(LogAction::Log(entry(2, "two, revised")));

        assert_eq!(ids(&window), [2, 1]);
        assert_eq!(window.entries()[0].message, "two, revised");
        assert_eq!(window.len(), 2);
    }

    #[test]
    fn test_same_page_twice_is_idempotent() {
        let page = vec![entry(3, "c"), entry(2, "b"), entry(1, "a")];
        let mut once = LogWindow::new();
        once.apply(LogAction::FetchOlder {
            entries: page.clone(),
            after: Some("x".into()),
        });
        let mut twice = once.clone();
        twice.apply(LogAction::FetchOlder {
            entries: page,
            after: Some("x".into()),
        });
        assert_eq!(once, twice);
    }

    #[test]
    fn test_log_entry_accepts_timestamp_alias() {
        let entry: LogEntry =
            serde_json::from_str(r#"{"id": 7, "timestamp": "2024-01-01T00:00:00", "message": "hi"}"#).unwrap();
        assert_eq!(entry.created_at.as_deref(), Some("2024-01-01T00:00:00"));
        assert!(entry.message_types.is_empty());
        assert_eq!(entry.block_name, None);
    }
}
