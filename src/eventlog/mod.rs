//! Durable session/event log: a `sessions`/`events` schema behind an r2d2
//! connection pool, with a dedicated background writer so logging never
//! blocks the copy/verify hot path (spec §4.8).

use chrono::Utc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use serde::Serialize;
use std::path::Path;
use tokio::sync::{mpsc, oneshot};
use tracing::error;
use uuid::Uuid;

type DbPool = Pool<SqliteConnectionManager>;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
  id TEXT PRIMARY KEY,
  started_at TEXT NOT NULL,
  completed_at TEXT,
  source_path TEXT NOT NULL,
  file_count INTEGER NOT NULL DEFAULT 0,
  total_bytes INTEGER NOT NULL DEFAULT 0,
  tool_version TEXT NOT NULL,
  status TEXT NOT NULL DEFAULT 'running' CHECK(status IN ('running','completed','cancelled','failed'))
);

CREATE TABLE IF NOT EXISTS events (
  id TEXT PRIMARY KEY,
  session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
  timestamp TEXT NOT NULL,
  type TEXT NOT NULL,
  severity TEXT NOT NULL,
  file_path TEXT,
  destination_path TEXT,
  size INTEGER,
  digest TEXT,
  error_message TEXT,
  metadata TEXT,
  duration_ms INTEGER
);

CREATE INDEX IF NOT EXISTS idx_events_session_id ON events(session_id);
CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp);
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Start,
    Scan,
    Copy,
    Verify,
    Skip,
    Error,
    Cancel,
    Complete,
    Quarantine,
}

impl EventType {
    fn as_str(&self) -> &'static str {
        match self {
            EventType::Start => "start",
            EventType::Scan => "scan",
            EventType::Copy => "copy",
            EventType::Verify => "verify",
            EventType::Skip => "skip",
            EventType::Error => "error",
            EventType::Cancel => "cancel",
            EventType::Complete => "complete",
            EventType::Quarantine => "quarantine",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
}

impl Severity {
    fn as_str(&self) -> &'static str {
        match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl SessionStatus {
    fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewEvent {
    pub event_type: Option<EventType>,
    pub severity: Option<Severity>,
    pub file_path: Option<String>,
    pub destination_path: Option<String>,
    pub size: Option<u64>,
    pub digest: Option<String>,
    pub error_message: Option<String>,
    pub metadata: Option<String>,
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct ExportedEvent {
    pub id: String,
    pub timestamp: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub severity: String,
    pub file: Option<String>,
    pub destination: Option<String>,
    #[serde(rename = "fileSize")]
    pub file_size: Option<u64>,
    pub checksum: Option<String>,
    pub error: Option<String>,
    #[serde(rename = "durationMs")]
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct SessionExport {
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(rename = "startedAt")]
    pub started_at: String,
    #[serde(rename = "completedAt")]
    pub completed_at: Option<String>,
    pub status: String,
    #[serde(rename = "sourceURL")]
    pub source_url: String,
    #[serde(rename = "fileCount")]
    pub file_count: u64,
    #[serde(rename = "totalBytes")]
    pub total_bytes: u64,
    #[serde(rename = "toolVersion")]
    pub tool_version: String,
    pub events: Vec<ExportedEvent>,
}

enum Command {
    LogEvent {
        session_id: String,
        event: NewEvent,
    },
    CompleteSession {
        session_id: String,
        status: SessionStatus,
    },
    Barrier(oneshot::Sender<()>),
}

/// Handle to the background writer. Cloning shares the same channel and
/// pool (multi-producer, single-writer, per spec §5).
#[derive(Clone)]
pub struct EventLogger {
    pool: DbPool,
    tx: mpsc::UnboundedSender<Command>,
}

impl EventLogger {
    /// Open (creating if absent) the SQLite store at `db_path`, run
    /// migrations, and spawn the background writer task.
    pub fn open(db_path: &Path) -> rusqlite::Result<Self> {
        if let Some(parent) = db_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let manager = SqliteConnectionManager::file(db_path);
        let pool = Pool::builder()
            .max_size(4)
            .build(manager)
            .expect("failed to build sqlite connection pool");

        {
            let conn = pool.get().expect("failed to obtain sqlite connection");
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA foreign_keys = ON;",
            )?;
            conn.execute_batch(SCHEMA)?;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let writer_pool = pool.clone();
        tokio::spawn(run_writer(writer_pool, rx));

        Ok(Self { pool, tx })
    }

    /// In-memory variant for tests: no file, no cross-process durability.
    pub fn open_in_memory() -> rusqlite::Result<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .expect("failed to build in-memory sqlite pool");
        {
            let conn = pool.get().expect("failed to obtain sqlite connection");
            conn.execute_batch(SCHEMA)?;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let writer_pool = pool.clone();
        tokio::spawn(run_writer(writer_pool, rx));
        Ok(Self { pool, tx })
    }

    pub fn start_session(
        &self,
        source_path: &str,
        file_count: u64,
        total_bytes: u64,
        tool_version: &str,
        session_id: Option<String>,
    ) -> rusqlite::Result<String> {
        let session_id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let conn = self.pool.get().expect("failed to obtain sqlite connection");
        conn.execute(
            "INSERT INTO sessions (id, started_at, source_path, file_count, total_bytes, tool_version, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'running')",
            params![
                session_id,
                Utc::now().to_rfc3339(),
                source_path,
                file_count as i64,
                total_bytes as i64,
                tool_version,
            ],
        )?;
        Ok(session_id)
    }

    /// Enqueue an event for the background writer. Never blocks; a
    /// failure to enqueue (writer task gone) is logged, not propagated,
    /// per spec §4.8 ("does not fail the backup").
    pub fn log_event(&self, session_id: &str, event: NewEvent) {
        if self
            .tx
            .send(Command::LogEvent {
                session_id: session_id.to_string(),
                event,
            })
            .is_err()
        {
            error!("event log writer task is gone; event dropped");
        }
    }

    pub fn complete_session(&self, session_id: &str, status: SessionStatus) {
        if self
            .tx
            .send(Command::CompleteSession {
                session_id: session_id.to_string(),
                status,
            })
            .is_err()
        {
            error!("event log writer task is gone; session completion dropped");
        }
    }

    /// Records a `cancel` event plus a per-file `cancel` event for each
    /// path still in flight, then completes the session as `cancelled`.
    pub fn log_cancellation(&self, session_id: &str, files_in_flight: &[String]) {
        self.log_event(
            session_id,
            NewEvent {
                event_type: Some(EventType::Cancel),
                severity: Some(Severity::Info),
                ..Default::default()
            },
        );
        for file_path in files_in_flight {
            self.log_event(
                session_id,
                NewEvent {
                    event_type: Some(EventType::Cancel),
                    severity: Some(Severity::Info),
                    file_path: Some(file_path.clone()),
                    ..Default::default()
                },
            );
        }
        self.complete_session(session_id, SessionStatus::Cancelled);
    }

    /// Block until every command enqueued so far has been applied.
    /// Useful at shutdown and in tests that assert on persisted state.
    /// The writer task drains commands in FIFO order, so a barrier
    /// enqueued after prior sends only resolves once they've landed.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Barrier(done_tx)).is_err() {
            return;
        }
        let _ = done_rx.await;
    }

    pub fn generate_report(&self, session_id: &str) -> rusqlite::Result<String> {
        let conn = self.pool.get().expect("failed to obtain sqlite connection");
        let mut session_stmt = conn.prepare(
            "SELECT id, started_at, completed_at, source_path, file_count, total_bytes, tool_version, status
             FROM sessions WHERE id = ?1",
        )?;
        let (started_at, completed_at, source_path, file_count, total_bytes, tool_version, status): (
            String,
            Option<String>,
            String,
            i64,
            i64,
            String,
            String,
        ) = session_stmt.query_row(params![session_id], |row| {
            Ok((
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
                row.get(7)?,
            ))
        })?;

        let mut report = String::new();
        report.push_str("# Session Report\n");
        report.push_str(&format!("session_id: {session_id}\n"));
        report.push_str(&format!("status: {status}\n"));
        report.push_str(&format!("source_path: {source_path}\n"));
        report.push_str(&format!("file_count: {file_count}\n"));
        report.push_str(&format!("total_bytes: {total_bytes}\n"));
        report.push_str(&format!("tool_version: {tool_version}\n"));
        report.push_str(&format!("started_at: {started_at}\n"));
        report.push_str(&format!(
            "completed_at: {}\n",
            completed_at.as_deref().unwrap_or("-")
        ));
        report.push_str("\n# Events\n");

        let mut event_stmt = conn.prepare(
            "SELECT timestamp, type, severity, file_path, destination_path, error_message
             FROM events WHERE session_id = ?1 ORDER BY timestamp ASC",
        )?;
        let rows = event_stmt.query_map(params![session_id], |row| {
            let timestamp: String = row.get(0)?;
            let event_type: String = row.get(1)?;
            let severity: String = row.get(2)?;
            let file_path: Option<String> = row.get(3)?;
            let destination_path: Option<String> = row.get(4)?;
            let error_message: Option<String> = row.get(5)?;
            Ok((timestamp, event_type, severity, file_path, destination_path, error_message))
        })?;
        for row in rows {
            let (timestamp, event_type, severity, file_path, destination_path, error_message) = row?;
            report.push_str(&format!(
                "{timestamp} [{severity}] {event_type}{}{}{}\n",
                file_path.map(|f| format!(" file={f}")).unwrap_or_default(),
                destination_path.map(|d| format!(" dest={d}")).unwrap_or_default(),
                error_message.map(|e| format!(" error={e}")).unwrap_or_default(),
            ));
        }

        Ok(report)
    }

    pub fn export_json(&self, session_id: &str) -> rusqlite::Result<SessionExport> {
        let conn = self.pool.get().expect("failed to obtain sqlite connection");
        let (started_at, completed_at, source_path, file_count, total_bytes, tool_version, status): (
            String,
            Option<String>,
            String,
            i64,
            i64,
            String,
            String,
        ) = conn.query_row(
            "SELECT started_at, completed_at, source_path, file_count, total_bytes, tool_version, status
             FROM sessions WHERE id = ?1",
            params![session_id],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                ))
            },
        )?;

        let mut stmt = conn.prepare(
            "SELECT id, timestamp, type, severity, file_path, destination_path, size, digest, error_message, duration_ms
             FROM events WHERE session_id = ?1 ORDER BY timestamp ASC",
        )?;
        let events = stmt
            .query_map(params![session_id], |row| {
                Ok(ExportedEvent {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    event_type: row.get(2)?,
                    severity: row.get(3)?,
                    file: row.get(4)?,
                    destination: row.get(5)?,
                    file_size: row.get::<_, Option<i64>>(6)?.map(|v| v as u64),
                    checksum: row.get(7)?,
                    error: row.get(8)?,
                    duration_ms: row.get::<_, Option<i64>>(9)?.map(|v| v as u64),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(SessionExport {
            session_id: session_id.to_string(),
            started_at,
            completed_at,
            status,
            source_url: source_path,
            file_count: file_count as u64,
            total_bytes: total_bytes as u64,
            tool_version,
            events,
        })
    }
}

async fn run_writer(pool: DbPool, mut rx: mpsc::UnboundedReceiver<Command>) {
    while let Some(command) = rx.recv().await {
        if let Command::Barrier(done) = command {
            let _ = done.send(());
            continue;
        }
        let pool = pool.clone();
        let result = tokio::task::spawn_blocking(move || -> rusqlite::Result<()> {
            let conn = pool.get().expect("failed to obtain sqlite connection");
            match command {
                Command::LogEvent { session_id, event } => {
                    conn.execute(
                        "INSERT INTO events (id, session_id, timestamp, type, severity, file_path, destination_path, size, digest, error_message, metadata, duration_ms)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                        params![
                            Uuid::new_v4().to_string(),
                            session_id,
                            Utc::now().to_rfc3339(),
                            event.event_type.map(|t| t.as_str()).unwrap_or("info"),
                            event.severity.map(|s| s.as_str()).unwrap_or("info"),
                            event.file_path,
                            event.destination_path,
                            event.size.map(|v| v as i64),
                            event.digest,
                            event.error_message,
                            event.metadata,
                            event.duration_ms.map(|v| v as i64),
                        ],
                    )?;
                }
                Command::CompleteSession { session_id, status } => {
                    conn.execute(
                        "UPDATE sessions SET completed_at = ?1, status = ?2 WHERE id = ?3",
                        params![Utc::now().to_rfc3339(), status.as_str(), session_id],
                    )?;
                }
                Command::Barrier(_) => unreachable!("handled before entering the blocking task"),
            }
            Ok(())
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("event log write failed: {}", e),
            Err(e) => error!("event log writer task panicked: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_session_and_log_event_roundtrip() {
        let logger = EventLogger::open_in_memory().unwrap();
        let session_id = logger
            .start_session("/src", 3, 30, "1.0.0", None)
            .unwrap();

        logger.log_event(
            &session_id,
            NewEvent {
                event_type: Some(EventType::Copy),
                severity: Some(Severity::Info),
                file_path: Some("a.jpg".to_string()),
                destination_path: Some("/d1/a.jpg".to_string()),
                size: Some(10),
                digest: Some("deadbeef".to_string()),
                ..Default::default()
            },
        );
        logger.complete_session(&session_id, SessionStatus::Completed);
        logger.flush().await;

        let export = logger.export_json(&session_id).unwrap();
        assert_eq!(export.events.len(), 1);
        assert_eq!(export.events[0].event_type, "copy");
        assert_eq!(export.status, "completed");
    }

    #[tokio::test]
    async fn log_cancellation_records_per_file_events_and_completes() {
        let logger = EventLogger::open_in_memory().unwrap();
        let session_id = logger
            .start_session("/src", 2, 20, "1.0.0", None)
            .unwrap();

        logger.log_cancellation(&session_id, &["a.jpg".to_string(), "b.jpg".to_string()]);
        logger.flush().await;

        let export = logger.export_json(&session_id).unwrap();
        assert_eq!(export.status, "cancelled");
        // one general cancel event + one per in-flight file
        assert_eq!(export.events.len(), 3);
    }

    #[tokio::test]
    async fn report_is_stable_and_sorted() {
        let logger = EventLogger::open_in_memory().unwrap();
        let session_id = logger
            .start_session("/src", 1, 10, "1.0.0", None)
            .unwrap();
        logger.log_event(
            &session_id,
            NewEvent {
                event_type: Some(EventType::Scan),
                severity: Some(Severity::Info),
                ..Default::default()
            },
        );
        logger.flush().await;

        let report = logger.generate_report(&session_id).unwrap();
        assert!(report.starts_with("# Session Report"));
        assert!(report.contains("# Events"));
    }
}
