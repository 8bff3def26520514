//! The log store: STATUS, ALERT, and METRIC records appended as JSON
//! lines, with an in-memory tail for the operator console. The relational
//! backend proper lives outside this process; this file is its feed.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How many records the console tail retains.
const TAIL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogKind {
    Status,
    Alert,
    Metric,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub kind: LogKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer: Option<String>,
    pub message: String,
}

pub struct LogStore {
    file: Mutex<File>,
    tail: Mutex<VecDeque<LogRecord>>,
}

impl LogStore {
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<LogStore> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(LogStore {
            file: Mutex::new(file),
            tail: Mutex::new(VecDeque::with_capacity(TAIL_CAPACITY)),
        })
    }

    fn append(&self, kind: LogKind, peer: Option<&str>, message: String) {
        let record = LogRecord {
            timestamp: Utc::now(),
            kind,
            peer: peer.map(str::to_owned),
            message,
        };

        match serde_json::to_string(&record) {
            Ok(line) => {
                let mut file = self.file.lock().unwrap();
                if let Err(e) = writeln!(file, "{line}") {
                    tracing::error!(error = %e, "failed to append log record");
                }
            }
            Err(e) => tracing::error!(error = %e, "failed to serialize log record"),
        }

        let mut tail = self.tail.lock().unwrap();
        if tail.len() == TAIL_CAPACITY {
            tail.pop_front();
        }
        tail.push_back(record);
    }

    pub fn save_status(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!("{message}");
        self.append(LogKind::Status, None, message);
    }

    pub fn save_alert(&self, peer: &str, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(peer = %peer, "{message}");
        self.append(LogKind::Alert, Some(peer), message);
    }

    pub fn save_metric(&self, peer: &str, message: impl Into<String>) {
        self.append(LogKind::Metric, Some(peer), message.into());
    }

    /// Most recent records, oldest first.
    pub fn recent(&self, count: usize) -> Vec<LogRecord> {
        let tail = self.tail.lock().unwrap();
        tail.iter()
            .skip(tail.len().saturating_sub(count))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_land_in_file_and_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        let store = LogStore::open(&path).unwrap();

        store.save_status("server started");
        store.save_metric("a1", r#"{"cpu_usage":0.4}"#);
        store.save_alert("a1", "CPU usage: 0.97");

        let recent = store.recent(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].kind, LogKind::Status);
        assert_eq!(recent[1].kind, LogKind::Metric);
        assert_eq!(recent[1].peer.as_deref(), Some("a1"));
        assert_eq!(recent[2].kind, LogKind::Alert);

        let raw = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 3);
        let parsed: LogRecord = serde_json::from_str(lines[2]).unwrap();
        assert_eq!(parsed.kind, LogKind::Alert);
        assert_eq!(parsed.message, "CPU usage: 0.97");
    }

    #[test]
    fn tail_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::open(dir.path().join("log.jsonl")).unwrap();
        for i in 0..(TAIL_CAPACITY + 10) {
            store.save_status(format!("status {i}"));
        }
        let recent = store.recent(TAIL_CAPACITY * 2);
        assert_eq!(recent.len(), TAIL_CAPACITY);
        assert_eq!(recent[0].message, "status 10");
    }

    #[test]
    fn recent_respects_count() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::open(dir.path().join("log.jsonl")).unwrap();
        store.save_status("one");
        store.save_status("two");
        store.save_status("three");
        let recent = store.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message, "two");
        assert_eq!(recent[1].message, "three");
    }
}
