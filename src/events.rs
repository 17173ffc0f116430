//! Timestamped activity log and state-change fan-out.
//!
//! The desktop shell renders a scrolling log panel and reacts to state
//! changes. Both come from here: every entry is kept in a bounded history,
//! broadcast to subscribers and mirrored into `tracing`.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::vm::VmState;

/// Entries kept before the oldest are dropped.
pub const DEFAULT_HISTORY: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}",
            self.timestamp.with_timezone(&chrono::Local).format("%H:%M:%S"),
            self.message
        )
    }
}

/// What subscribers receive.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SupervisorEvent {
    StateChanged { from: VmState, to: VmState },
    Log(LogEntry),
}

pub struct EventLog {
    history: Mutex<VecDeque<LogEntry>>,
    capacity: usize,
    tx: broadcast::Sender<SupervisorEvent>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY)
    }
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            history: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.tx.subscribe()
    }

    /// Append an entry, broadcast it and mirror it into `tracing`.
    pub fn record(&self, level: LogLevel, message: impl Into<String>) -> LogEntry {
        let entry = LogEntry {
            level,
            message: message.into(),
            timestamp: Utc::now(),
        };
        match level {
            LogLevel::Info | LogLevel::Success => info!(target: "desqemu::events", "{}", entry.message),
            LogLevel::Warning => warn!(target: "desqemu::events", "{}", entry.message),
            LogLevel::Error => error!(target: "desqemu::events", "{}", entry.message),
        }
        {
            let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
            if history.len() == self.capacity {
                history.pop_front();
            }
            history.push_back(entry.clone());
        }
        // No subscribers is fine.
        let _ = self.tx.send(SupervisorEvent::Log(entry.clone()));
        entry
    }

    pub fn info(&self, message: impl Into<String>) {
        self.record(LogLevel::Info, message);
    }

    pub fn success(&self, message: impl Into<String>) {
        self.record(LogLevel::Success, message);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.record(LogLevel::Warning, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.record(LogLevel::Error, message);
    }

    pub fn state_changed(&self, from: VmState, to: VmState) {
        info!(%from, %to, "VM state changed");
        let _ = self.tx.send(SupervisorEvent::StateChanged { from, to });
    }

    /// Snapshot of the history, oldest first.
    pub fn entries(&self) -> Vec<LogEntry> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}
