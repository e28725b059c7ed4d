//! Per-session process event log.
//!
//! Append-only, multi-writer safe, never rewritten. Two pipeline buckets:
//! `ELIGIBILITY_PROCESS` (phase markers) and `THINKING` (fine-grained
//! intra-phase messages); `OUTPUT` carries the conversation transcript.
//!
//! The retrieval path returns process events in insertion order and attaches
//! every THINKING event of a phase to that phase's most recent process
//! event, so progress from prior turns stays visible after new turns.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

/// Phases that may appear without a process event and still deserve a
/// placeholder row in the grouped view.
const VALID_PHASES: [&str; 6] = [
    "patient_loading",
    "interpretation",
    "scoring",
    "planning",
    "eligibility_check",
    "conversation",
];

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER NOT NULL,
    bucket TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE INDEX IF NOT EXISTS idx_events_session ON events(session_id, id);
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    InProgress,
    Complete,
    Error,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::InProgress => "in_progress",
            EventStatus::Complete => "complete",
            EventStatus::Error => "error",
        }
    }
}

/// A THINKING message attached to its phase's latest process event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkingMessage {
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub timestamp: Option<String>,
}

/// One grouped process event as served to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessEventView {
    pub phase: String,
    pub status: Option<String>,
    pub message: Option<String>,
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub thinking_messages: Vec<ThinkingMessage>,
}

/// Append-only event log backed by SQLite.
pub struct EventLog {
    conn: Arc<Mutex<Connection>>,
}

impl EventLog {
    pub fn new(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open events database at {}", db_path))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize events schema")?;
        info!("📒 Event log ready at {}", db_path);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn append(&self, session_id: i64, bucket: &str, payload: &Value) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO events (session_id, bucket, payload) VALUES (?1, ?2, ?3)",
            params![session_id, bucket, payload.to_string()],
        )?;
        Ok(())
    }

    /// Transcript entries (user messages, assistant responses).
    pub fn append_output(&self, session_id: i64, payload: &Value) -> Result<()> {
        self.append(session_id, "OUTPUT", payload)
    }

    /// All raw `(bucket, payload)` rows for a session in insertion order.
    pub fn raw_events(&self, session_id: i64) -> Result<Vec<(String, Value)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT bucket, payload FROM events WHERE session_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map([session_id], |row| {
                let bucket: String = row.get(0)?;
                let payload: String = row.get(1)?;
                Ok((bucket, payload))
            })?
            .filter_map(|r| r.ok())
            .filter_map(|(bucket, payload)| {
                serde_json::from_str::<Value>(&payload)
                    .ok()
                    .map(|v| (bucket, v))
            })
            .collect();
        Ok(rows)
    }

    /// Grouped process-event stream for display.
    pub fn grouped_process_events(&self, session_id: i64) -> Result<Vec<ProcessEventView>> {
        let rows = self.raw_events(session_id)?;

        let mut events: Vec<ProcessEventView> = Vec::new();
        // (phase, index into `events`) of the latest process event per phase
        let mut latest_by_phase: Vec<(String, usize)> = Vec::new();
        let mut thinking_by_phase: Vec<(String, Vec<ThinkingMessage>)> = Vec::new();

        for (bucket, payload) in rows {
            let Some(phase) = payload.get("phase").and_then(Value::as_str).map(String::from)
            else {
                continue;
            };

            match bucket.as_str() {
                "THINKING" => {
                    let message = ThinkingMessage {
                        message: payload
                            .get("message")
                            .and_then(Value::as_str)
                            .map(String::from),
                        metadata: payload.get("metadata").cloned(),
                        timestamp: payload
                            .get("timestamp")
                            .and_then(Value::as_str)
                            .map(String::from),
                    };
                    match thinking_by_phase.iter_mut().find(|(p, _)| *p == phase) {
                        Some((_, list)) => list.push(message),
                        None => thinking_by_phase.push((phase, vec![message])),
                    }
                }
                "ELIGIBILITY_PROCESS" => {
                    let view = ProcessEventView {
                        phase: phase.clone(),
                        status: payload
                            .get("status")
                            .and_then(Value::as_str)
                            .map(String::from),
                        message: payload
                            .get("message")
                            .and_then(Value::as_str)
                            .map(String::from),
                        timestamp: payload
                            .get("timestamp")
                            .and_then(Value::as_str)
                            .map(String::from),
                        data: payload.get("data").cloned(),
                        thinking_messages: Vec::new(),
                    };
                    events.push(view);
                    let index = events.len() - 1;
                    match latest_by_phase.iter_mut().find(|(p, _)| *p == phase) {
                        Some((_, i)) => *i = index,
                        None => latest_by_phase.push((phase, index)),
                    }
                }
                _ => {}
            }
        }

        // Attach thinking messages to the most recent process event of the
        // same phase; phases with no process event get a placeholder.
        for (phase, messages) in thinking_by_phase {
            if let Some((_, index)) = latest_by_phase.iter().find(|(p, _)| *p == phase) {
                events[*index].thinking_messages = messages;
            } else if VALID_PHASES.contains(&phase.as_str()) {
                let timestamp = messages.first().and_then(|m| m.timestamp.clone());
                events.push(ProcessEventView {
                    phase: phase.clone(),
                    status: Some("in_progress".to_string()),
                    message: Some(format!("Loading {}...", phase.replace('_', " "))),
                    timestamp,
                    data: None,
                    thinking_messages: messages,
                });
            }
        }

        Ok(events)
    }
}

/// Sink interface the pipeline components emit through. A single sink is
/// passed down per turn.
pub trait ProgressSink: Send + Sync {
    fn process(&self, phase: &str, status: EventStatus, message: &str, data: Option<Value>);
    fn thinking(&self, phase: &str, message: &str, metadata: Option<Value>);
}

/// Sink bound to one session's event log. Emission failures are logged and
/// swallowed; progress reporting must never fail a turn.
pub struct SessionSink {
    log: Arc<EventLog>,
    session_id: Option<i64>,
}

impl SessionSink {
    pub fn new(log: Arc<EventLog>, session_id: Option<i64>) -> Self {
        Self { log, session_id }
    }
}

impl ProgressSink for SessionSink {
    fn process(&self, phase: &str, status: EventStatus, message: &str, data: Option<Value>) {
        let Some(session_id) = self.session_id else {
            debug!("no session bound; dropping process event for phase {}", phase);
            return;
        };
        let mut payload = serde_json::json!({
            "phase": phase,
            "status": status.as_str(),
            "message": message,
            "timestamp": Utc::now().to_rfc3339(),
        });
        if let Some(data) = data {
            payload["data"] = data;
        }
        if let Err(e) = self.log.append(session_id, "ELIGIBILITY_PROCESS", &payload) {
            warn!("failed to emit process event: {}", e);
        }
    }

    fn thinking(&self, phase: &str, message: &str, metadata: Option<Value>) {
        let Some(session_id) = self.session_id else {
            return;
        };
        let mut payload = serde_json::json!({
            "phase": phase,
            "message": message,
            "timestamp": Utc::now().to_rfc3339(),
        });
        if let Some(metadata) = metadata {
            payload["metadata"] = metadata;
        }
        if let Err(e) = self.log.append(session_id, "THINKING", &payload) {
            warn!("failed to emit thinking message: {}", e);
        }
    }
}

/// Sink that drops everything. Used for per-visit scoring passes where
/// calculation chatter would flood the log.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn process(&self, _phase: &str, _status: EventStatus, _message: &str, _data: Option<Value>) {}
    fn thinking(&self, _phase: &str, _message: &str, _metadata: Option<Value>) {}
}
