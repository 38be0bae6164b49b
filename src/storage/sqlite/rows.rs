//! Conversions between table rows and model types.
//!
//! Timestamps are stored as fixed-width RFC 3339 UTC text so that string
//! order matches time order. Lists and metadata are stored as JSON text.

use crate::models::{
    Actor, AuditLogEntry, AuditStatus, Event, EventType, LogType, Metadata, SkillState, TopicSummary,
};
use crate::{Error, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Row;

pub const EVENT_COLUMNS: &str = "event_id, content, event_type, actor, topics, skills, \
                                 created_at, recorded_at, metadata, source";

pub const TOPIC_COLUMNS: &str = "topic_id, parent_topic_id, summary, open_questions, \
                                 event_count, last_event_at, created_at, updated_at, metadata";

pub const SKILL_COLUMNS: &str = "skill_id, p_mastery, last_evidence_at, evidence_count, \
                                 topic_id, created_at, updated_at, metadata";

pub const AUDIT_COLUMNS: &str = "id, log_type, status, event_ids, topic_id, skill_id, \
                                 summary_version, model, tokens_used, error_message, \
                                 metadata, created_at";

/// Formats a timestamp for storage.
pub fn timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn optional_timestamp(value: Option<&DateTime<Utc>>) -> Option<String> {
    value.map(timestamp)
}

pub fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| Error::operation("serialize_column", e))
}

/// Converts a count for an INTEGER column.
pub fn to_sql_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_sql_int(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn parse_timestamp(column: &str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::operation("parse_timestamp", format!("{column}: {e}")))
}

fn parse_optional_timestamp(column: &str, raw: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    raw.map(|raw| parse_timestamp(column, raw)).transpose()
}

fn parse_json<T: serde::de::DeserializeOwned>(column: &str, raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| Error::operation("parse_column", format!("{column}: {e}")))
}

/// Raw `events` row.
pub struct EventRow {
    event_id: String,
    content: String,
    event_type: String,
    actor: String,
    topics: String,
    skills: String,
    created_at: String,
    recorded_at: Option<String>,
    metadata: String,
    source: Option<String>,
}

impl EventRow {
    /// Reads a row selected with [`EVENT_COLUMNS`].
    pub fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            event_id: row.get(0)?,
            content: row.get(1)?,
            event_type: row.get(2)?,
            actor: row.get(3)?,
            topics: row.get(4)?,
            skills: row.get(5)?,
            created_at: row.get(6)?,
            recorded_at: row.get(7)?,
            metadata: row.get(8)?,
            source: row.get(9)?,
        })
    }

    pub fn into_event(self) -> Result<Event> {
        let event_type = EventType::parse(&self.event_type).ok_or_else(|| {
            Error::operation("parse_event", format!("unknown event type '{}'", self.event_type))
        })?;
        let actor = Actor::parse(&self.actor)
            .ok_or_else(|| Error::operation("parse_event", format!("unknown actor '{}'", self.actor)))?;
        Ok(Event {
            event_id: self.event_id,
            content: self.content,
            event_type,
            actor,
            topics: parse_json("topics", &self.topics)?,
            skills: parse_json("skills", &self.skills)?,
            created_at: parse_timestamp("created_at", &self.created_at)?,
            recorded_at: parse_optional_timestamp("recorded_at", self.recorded_at.as_deref())?,
            metadata: parse_json::<Metadata>("metadata", &self.metadata)?,
            source: self.source,
        })
    }
}

/// Raw `topics` row.
pub struct TopicRow {
    topic_id: String,
    parent_topic_id: Option<String>,
    summary: String,
    open_questions: String,
    event_count: i64,
    last_event_at: Option<String>,
    created_at: String,
    updated_at: String,
    metadata: String,
}

impl TopicRow {
    pub fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            topic_id: row.get(0)?,
            parent_topic_id: row.get(1)?,
            summary: row.get(2)?,
            open_questions: row.get(3)?,
            event_count: row.get(4)?,
            last_event_at: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
            metadata: row.get(8)?,
        })
    }

    pub fn into_topic(self) -> Result<TopicSummary> {
        Ok(TopicSummary {
            topic_id: self.topic_id,
            parent_topic_id: self.parent_topic_id,
            summary: self.summary,
            open_questions: parse_json("open_questions", &self.open_questions)?,
            event_count: from_sql_int(self.event_count),
            last_event_at: parse_optional_timestamp("last_event_at", self.last_event_at.as_deref())?,
            created_at: parse_timestamp("created_at", &self.created_at)?,
            updated_at: parse_timestamp("updated_at", &self.updated_at)?,
            metadata: parse_json("metadata", &self.metadata)?,
        })
    }
}

/// Raw `skills` row.
pub struct SkillRow {
    skill_id: String,
    p_mastery: f64,
    last_evidence_at: Option<String>,
    evidence_count: i64,
    topic_id: Option<String>,
    created_at: String,
    updated_at: String,
    metadata: String,
}

impl SkillRow {
    pub fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            skill_id: row.get(0)?,
            p_mastery: row.get(1)?,
            last_evidence_at: row.get(2)?,
            evidence_count: row.get(3)?,
            topic_id: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
            metadata: row.get(7)?,
        })
    }

    pub fn into_skill(self) -> Result<SkillState> {
        Ok(SkillState {
            skill_id: self.skill_id,
            p_mastery: self.p_mastery,
            last_evidence_at: parse_optional_timestamp("last_evidence_at", self.last_evidence_at.as_deref())?,
            evidence_count: from_sql_int(self.evidence_count),
            topic_id: self.topic_id,
            created_at: parse_timestamp("created_at", &self.created_at)?,
            updated_at: parse_timestamp("updated_at", &self.updated_at)?,
            metadata: parse_json("metadata", &self.metadata)?,
        })
    }
}

/// Raw `audit_log` row.
pub struct AuditRow {
    id: String,
    log_type: String,
    status: String,
    event_ids: String,
    topic_id: Option<String>,
    skill_id: Option<String>,
    summary_version: Option<i64>,
    model: Option<String>,
    tokens_used: Option<i64>,
    error_message: Option<String>,
    metadata: String,
    created_at: String,
}

impl AuditRow {
    pub fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            log_type: row.get(1)?,
            status: row.get(2)?,
            event_ids: row.get(3)?,
            topic_id: row.get(4)?,
            skill_id: row.get(5)?,
            summary_version: row.get(6)?,
            model: row.get(7)?,
            tokens_used: row.get(8)?,
            error_message: row.get(9)?,
            metadata: row.get(10)?,
            created_at: row.get(11)?,
        })
    }

    pub fn into_entry(self) -> Result<AuditLogEntry> {
        let log_type = LogType::parse(&self.log_type)
            .ok_or_else(|| Error::operation("parse_audit", format!("unknown log type '{}'", self.log_type)))?;
        let status = AuditStatus::parse(&self.status)
            .ok_or_else(|| Error::operation("parse_audit", format!("unknown status '{}'", self.status)))?;
        Ok(AuditLogEntry {
            id: self.id,
            log_type,
            status,
            event_ids: parse_json("event_ids", &self.event_ids)?,
            topic_id: self.topic_id,
            skill_id: self.skill_id,
            summary_version: self.summary_version.map(from_sql_int),
            model: self.model,
            tokens_used: self.tokens_used.map(from_sql_int),
            error_message: self.error_message,
            metadata: parse_json("metadata", &self.metadata)?,
            created_at: parse_timestamp("created_at", &self.created_at)?,
        })
    }
}
