//! `SQLite` store.
//!
//! One connection behind a mutex. Events are tagged with topics through the
//! `event_topics` join table so topic queries stay indexed.

mod connection;
mod rows;

pub use connection::{acquire_lock, configure_connection, record_operation_metrics};

use super::TutorStore;
use crate::models::{AuditLogEntry, Event, SkillState, TopicSummary};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rows::{
    AUDIT_COLUMNS, AuditRow, EVENT_COLUMNS, EventRow, SKILL_COLUMNS, SkillRow, TOPIC_COLUMNS,
    TopicRow, optional_timestamp, timestamp, to_json, to_sql_int,
};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

const BACKEND: &str = "sqlite";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS events (
    event_id TEXT PRIMARY KEY,
    content TEXT NOT NULL,
    event_type TEXT NOT NULL,
    actor TEXT NOT NULL,
    topics TEXT NOT NULL DEFAULT '[]',
    skills TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL,
    recorded_at TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    source TEXT
);
CREATE INDEX IF NOT EXISTS idx_events_created_at ON events(created_at);

CREATE TABLE IF NOT EXISTS event_topics (
    event_id TEXT NOT NULL REFERENCES events(event_id) ON DELETE CASCADE,
    topic_id TEXT NOT NULL,
    PRIMARY KEY (event_id, topic_id)
);
CREATE INDEX IF NOT EXISTS idx_event_topics_topic ON event_topics(topic_id);

CREATE TABLE IF NOT EXISTS topics (
    topic_id TEXT PRIMARY KEY,
    parent_topic_id TEXT,
    summary TEXT NOT NULL DEFAULT '',
    open_questions TEXT NOT NULL DEFAULT '[]',
    event_count INTEGER NOT NULL DEFAULT 0,
    last_event_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS skills (
    skill_id TEXT PRIMARY KEY,
    p_mastery REAL NOT NULL,
    last_evidence_at TEXT,
    evidence_count INTEGER NOT NULL DEFAULT 0,
    topic_id TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS audit_log (
    id TEXT PRIMARY KEY,
    log_type TEXT NOT NULL,
    status TEXT NOT NULL,
    event_ids TEXT NOT NULL DEFAULT '[]',
    topic_id TEXT,
    skill_id TEXT,
    summary_version INTEGER,
    model TEXT,
    tokens_used INTEGER,
    error_message TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_log_topic ON audit_log(topic_id);
";

/// [`TutorStore`] backed by a `SQLite` database file.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `db_path`.
    ///
    /// Parent directories are created.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the schema cannot
    /// be created.
    pub fn new(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| Error::operation("create_data_dir", e))?;
        }
        let conn = Connection::open(&db_path).map_err(|e| Error::operation("open_sqlite", e))?;
        let store = Self {
            conn: Mutex::new(conn),
            db_path: Some(db_path),
        };
        store.initialize()?;
        Ok(store)
    }

    /// Opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::operation("open_sqlite", e))?;
        let store = Self {
            conn: Mutex::new(conn),
            db_path: None,
        };
        store.initialize()?;
        Ok(store)
    }

    /// Database file path, `None` for in-memory stores.
    #[must_use]
    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn initialize(&self) -> Result<()> {
        let conn = acquire_lock(&self.conn);
        configure_connection(&conn);
        conn.execute_batch(SCHEMA)
            .map_err(|e| Error::operation("initialize_schema", e))
    }

    /// Runs `f` against the connection and records the call's metrics.
    fn with_conn<T>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&mut Connection) -> Result<T>,
    ) -> Result<T> {
        let start = Instant::now();
        let mut conn = acquire_lock(&self.conn);
        let result = f(&mut *conn);
        let status = if result.is_ok() { "success" } else { "error" };
        record_operation_metrics(BACKEND, operation, start, status);
        result
    }
}

fn db_err(operation: &'static str) -> impl Fn(rusqlite::Error) -> Error {
    move |e| Error::operation(operation, e)
}

fn sql_limit(limit: Option<usize>) -> i64 {
    limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX))
}

fn collect_events(
    conn: &Connection,
    operation: &'static str,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(sql).map_err(db_err(operation))?;
    let rows = stmt
        .query_map(params, EventRow::read)
        .map_err(db_err(operation))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(db_err(operation))?;
    rows.into_iter().map(EventRow::into_event).collect()
}

impl TutorStore for SqliteStore {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn insert_event(&self, event: &Event) -> Result<()> {
        self.with_conn("insert_event", |conn| {
            let tx = conn.transaction().map_err(db_err("insert_event"))?;
            tx.execute(
                &format!("INSERT INTO events ({EVENT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"),
                params![
                    event.event_id,
                    event.content,
                    event.event_type.as_str(),
                    event.actor.as_str(),
                    to_json(&event.topics)?,
                    to_json(&event.skills)?,
                    timestamp(&event.created_at),
                    optional_timestamp(event.recorded_at.as_ref()),
                    to_json(&event.metadata)?,
                    event.source,
                ],
            )
            .map_err(db_err("insert_event"))?;
            for topic in &event.topics {
                tx.execute(
                    "INSERT OR IGNORE INTO event_topics (event_id, topic_id) VALUES (?1, ?2)",
                    params![event.event_id, topic],
                )
                .map_err(db_err("insert_event"))?;
            }
            tx.commit().map_err(db_err("insert_event"))
        })
    }

    fn events_for_topic(
        &self,
        topic_id: &str,
        after: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<Event>> {
        let after = after.as_ref().map(timestamp);
        self.with_conn("events_for_topic", |conn| {
            let sql = format!(
                "SELECT {EVENT_COLUMNS} FROM events
                 WHERE event_id IN (SELECT event_id FROM event_topics WHERE topic_id = ?1)
                   AND (?2 IS NULL OR created_at > ?2)
                 ORDER BY created_at ASC, rowid ASC
                 LIMIT ?3"
            );
            collect_events(conn, "events_for_topic", &sql, params![topic_id, after, sql_limit(limit)])
        })
    }

    fn recent_events_for_topic(&self, topic_id: &str, limit: usize) -> Result<Vec<Event>> {
        self.with_conn("recent_events_for_topic", |conn| {
            let sql = format!(
                "SELECT {EVENT_COLUMNS} FROM events
                 WHERE event_id IN (SELECT event_id FROM event_topics WHERE topic_id = ?1)
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT ?2"
            );
            collect_events(
                conn,
                "recent_events_for_topic",
                &sql,
                params![topic_id, sql_limit(Some(limit))],
            )
        })
    }

    fn events_before(&self, topic_id: &str, event_id: &str, limit: usize) -> Result<Vec<Event>> {
        self.with_conn("events_before", |conn| {
            let sql = format!(
                "SELECT {EVENT_COLUMNS} FROM events
                 WHERE event_id IN (SELECT event_id FROM event_topics WHERE topic_id = ?1)
                   AND (created_at, rowid) < (SELECT created_at, rowid FROM events WHERE event_id = ?2)
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT ?3"
            );
            collect_events(
                conn,
                "events_before",
                &sql,
                params![topic_id, event_id, sql_limit(Some(limit))],
            )
        })
    }

    fn events_since(&self, since: DateTime<Utc>, limit: Option<usize>) -> Result<Vec<Event>> {
        let since = timestamp(&since);
        self.with_conn("events_since", |conn| {
            let sql = format!(
                "SELECT {EVENT_COLUMNS} FROM events
                 WHERE created_at > ?1
                 ORDER BY created_at ASC, rowid ASC
                 LIMIT ?2"
            );
            collect_events(conn, "events_since", &sql, params![since, sql_limit(limit)])
        })
    }

    fn get_topic(&self, topic_id: &str) -> Result<Option<TopicSummary>> {
        self.with_conn("get_topic", |conn| {
            conn.query_row(
                &format!("SELECT {TOPIC_COLUMNS} FROM topics WHERE topic_id = ?1"),
                params![topic_id],
                TopicRow::read,
            )
            .optional()
            .map_err(db_err("get_topic"))?
            .map(TopicRow::into_topic)
            .transpose()
        })
    }

    fn upsert_topic(&self, topic: &TopicSummary) -> Result<()> {
        self.with_conn("upsert_topic", |conn| {
            conn.execute(
                &format!(
                    "INSERT OR REPLACE INTO topics ({TOPIC_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                ),
                params![
                    topic.topic_id,
                    topic.parent_topic_id,
                    topic.summary,
                    to_json(&topic.open_questions)?,
                    to_sql_int(topic.event_count),
                    optional_timestamp(topic.last_event_at.as_ref()),
                    timestamp(&topic.created_at),
                    timestamp(&topic.updated_at),
                    to_json(&topic.metadata)?,
                ],
            )
            .map_err(db_err("upsert_topic"))?;
            Ok(())
        })
    }

    fn list_topic_ids(&self) -> Result<Vec<String>> {
        self.with_conn("list_topic_ids", |conn| {
            let mut stmt = conn
                .prepare("SELECT topic_id FROM topics ORDER BY topic_id")
                .map_err(db_err("list_topic_ids"))?;
            stmt.query_map([], |row| row.get(0))
                .map_err(db_err("list_topic_ids"))?
                .collect::<rusqlite::Result<Vec<String>>>()
                .map_err(db_err("list_topic_ids"))
        })
    }

    fn get_skill(&self, skill_id: &str) -> Result<Option<SkillState>> {
        self.with_conn("get_skill", |conn| {
            conn.query_row(
                &format!("SELECT {SKILL_COLUMNS} FROM skills WHERE skill_id = ?1"),
                params![skill_id],
                SkillRow::read,
            )
            .optional()
            .map_err(db_err("get_skill"))?
            .map(SkillRow::into_skill)
            .transpose()
        })
    }

    fn upsert_skill(&self, skill: &SkillState) -> Result<()> {
        self.with_conn("upsert_skill", |conn| {
            conn.execute(
                &format!(
                    "INSERT OR REPLACE INTO skills ({SKILL_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                ),
                params![
                    skill.skill_id,
                    skill.p_mastery,
                    optional_timestamp(skill.last_evidence_at.as_ref()),
                    to_sql_int(skill.evidence_count),
                    skill.topic_id,
                    timestamp(&skill.created_at),
                    timestamp(&skill.updated_at),
                    to_json(&skill.metadata)?,
                ],
            )
            .map_err(db_err("upsert_skill"))?;
            Ok(())
        })
    }

    fn append_audit(&self, entry: &AuditLogEntry) -> Result<()> {
        self.with_conn("append_audit", |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO audit_log ({AUDIT_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                params![
                    entry.id,
                    entry.log_type.as_str(),
                    entry.status.as_str(),
                    to_json(&entry.event_ids)?,
                    entry.topic_id,
                    entry.skill_id,
                    entry.summary_version.map(to_sql_int),
                    entry.model,
                    entry.tokens_used.map(to_sql_int),
                    entry.error_message,
                    to_json(&entry.metadata)?,
                    timestamp(&entry.created_at),
                ],
            )
            .map_err(db_err("append_audit"))?;
            Ok(())
        })
    }

    fn audit_entries(&self, topic_id: Option<&str>, limit: Option<usize>) -> Result<Vec<AuditLogEntry>> {
        self.with_conn("audit_entries", |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {AUDIT_COLUMNS} FROM audit_log
                     WHERE (?1 IS NULL OR topic_id = ?1)
                     ORDER BY rowid ASC
                     LIMIT ?2"
                ))
                .map_err(db_err("audit_entries"))?;
            let rows = stmt
                .query_map(params![topic_id, sql_limit(limit)], AuditRow::read)
                .map_err(db_err("audit_entries"))?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err("audit_entries"))?;
            rows.into_iter().map(AuditRow::into_entry).collect()
        })
    }
}
