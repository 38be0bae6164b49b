//! Append-only audit trail for summarization and skill updates.
//!
//! Entries are built once and never mutated after they reach the store.

use super::Metadata;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What kind of derivation an audit entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogType {
    /// Summarizing a batch of events.
    Summarization,
    /// Updating a skill state.
    SkillUpdate,
    /// Updating a topic summary.
    TopicUpdate,
}

impl LogType {
    /// Returns the stored name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Summarization => "summarization",
            Self::SkillUpdate => "skill_update",
            Self::TopicUpdate => "topic_update",
        }
    }

    /// Parses a stored name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "summarization" => Some(Self::Summarization),
            "skill_update" => Some(Self::SkillUpdate),
            "topic_update" => Some(Self::TopicUpdate),
            _ => None,
        }
    }
}

impl fmt::Display for LogType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of an audited attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    /// The attempt succeeded.
    Success,
    /// The attempt failed.
    Failed,
    /// Part of the attempt succeeded.
    Partial,
}

impl AuditStatus {
    /// Returns the stored name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Partial => "partial",
        }
    }

    /// Parses a stored name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "partial" => Some(Self::Partial),
            _ => None,
        }
    }
}

impl fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audited attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    /// Unique entry id.
    pub id: String,
    /// Kind of derivation.
    pub log_type: LogType,
    /// Outcome.
    pub status: AuditStatus,
    /// Events the attempt processed.
    #[serde(default)]
    pub event_ids: Vec<String>,
    /// Topic, for topic updates.
    #[serde(default)]
    pub topic_id: Option<String>,
    /// Skill, for skill updates.
    #[serde(default)]
    pub skill_id: Option<String>,
    /// Summary version written, on success.
    #[serde(default)]
    pub summary_version: Option<u64>,
    /// Model that served the attempt.
    #[serde(default)]
    pub model: Option<String>,
    /// Approximate tokens consumed.
    #[serde(default)]
    pub tokens_used: Option<u64>,
    /// Error text, on failure.
    #[serde(default)]
    pub error_message: Option<String>,
    /// Additional metadata.
    #[serde(default)]
    pub metadata: Metadata,
    /// When the attempt finished.
    pub created_at: DateTime<Utc>,
}

impl AuditLogEntry {
    /// Creates an entry for the current time.
    #[must_use]
    pub fn new(log_type: LogType, status: AuditStatus) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            log_type,
            status,
            event_ids: Vec::new(),
            topic_id: None,
            skill_id: None,
            summary_version: None,
            model: None,
            tokens_used: None,
            error_message: None,
            metadata: Metadata::new(),
            created_at: Utc::now(),
        }
    }

    /// Sets the processed event ids.
    #[must_use]
    pub fn with_event_ids(mut self, event_ids: Vec<String>) -> Self {
        self.event_ids = event_ids;
        self
    }

    /// Sets the topic.
    #[must_use]
    pub fn with_topic(mut self, topic_id: impl Into<String>) -> Self {
        self.topic_id = Some(topic_id.into());
        self
    }

    /// Sets the skill.
    #[must_use]
    pub fn with_skill(mut self, skill_id: impl Into<String>) -> Self {
        self.skill_id = Some(skill_id.into());
        self
    }

    /// Sets the summary version.
    #[must_use]
    pub const fn with_summary_version(mut self, version: u64) -> Self {
        self.summary_version = Some(version);
        self
    }

    /// Sets the model.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Sets the token count.
    #[must_use]
    pub const fn with_tokens_used(mut self, tokens: u64) -> Self {
        self.tokens_used = Some(tokens);
        self
    }

    /// Sets the error text.
    #[must_use]
    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    /// Adds one metadata value.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let entry = AuditLogEntry::new(LogType::TopicUpdate, AuditStatus::Success)
            .with_topic("derivatives")
            .with_event_ids(vec!["e1".to_string()])
            .with_summary_version(2)
            .with_model("gpt-4o")
            .with_tokens_used(120)
            .with_metadata("trigger", serde_json::json!("scheduler"));

        assert_eq!(entry.topic_id.as_deref(), Some("derivatives"));
        assert_eq!(entry.summary_version, Some(2));
        assert_eq!(entry.tokens_used, Some(120));
        assert!(entry.error_message.is_none());
        assert_eq!(entry.metadata["trigger"], "scheduler");
    }

    #[test]
    fn test_stored_names() {
        for log_type in [LogType::Summarization, LogType::SkillUpdate, LogType::TopicUpdate] {
            assert_eq!(LogType::parse(log_type.as_str()), Some(log_type));
        }
        for status in [AuditStatus::Success, AuditStatus::Failed, AuditStatus::Partial] {
            assert_eq!(AuditStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(
            serde_json::to_value(LogType::SkillUpdate).unwrap(),
            serde_json::json!("skill_update")
        );
    }
}
