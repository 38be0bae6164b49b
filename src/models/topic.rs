//! Per-topic summaries.

use super::Metadata;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Metadata key holding the monotonically increasing summary version.
pub const SUMMARY_VERSION_KEY: &str = "summary_version";
/// Metadata key holding the RFC 3339 time of the last successful update.
pub const LAST_SUMMARIZED_AT_KEY: &str = "last_summarized_at";
/// Metadata key holding the ids of the events folded in by the last update.
pub const LAST_SUMMARIZATION_EVENT_IDS_KEY: &str = "last_summarization_event_ids";
/// Metadata key holding the creation time of the newest event folded in.
pub const PROCESSED_THROUGH_KEY: &str = "processed_through";

/// AI-maintained summary of one topic.
///
/// Only the summarization engine writes these records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicSummary {
    /// Unique topic identifier.
    pub topic_id: String,
    /// Parent topic, if the topic is nested.
    #[serde(default)]
    pub parent_topic_id: Option<String>,
    /// Summary text. Grows by appending addenda.
    pub summary: String,
    /// Open questions, without duplicates.
    #[serde(default)]
    pub open_questions: Vec<String>,
    /// Number of events folded into the summary.
    pub event_count: u64,
    /// Newest event timestamp seen.
    #[serde(default)]
    pub last_event_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
    /// Version and bookkeeping metadata.
    #[serde(default)]
    pub metadata: Metadata,
}

impl TopicSummary {
    /// Creates an empty, unversioned summary.
    #[must_use]
    pub fn new(topic_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            topic_id: topic_id.into(),
            parent_topic_id: None,
            summary: String::new(),
            open_questions: Vec::new(),
            event_count: 0,
            last_event_at: None,
            created_at: now,
            updated_at: now,
            metadata: Metadata::new(),
        }
    }

    /// Returns the summary version, or 0 when absent.
    ///
    /// Integers stored as strings are accepted.
    #[must_use]
    pub fn summary_version(&self) -> u64 {
        match self.metadata.get(SUMMARY_VERSION_KEY) {
            Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
            _ => 0,
        }
    }

    /// Returns when the topic was last summarized.
    #[must_use]
    pub fn last_summarized_at(&self) -> Option<DateTime<Utc>> {
        timestamp_field(&self.metadata, LAST_SUMMARIZED_AT_KEY)
    }

    /// Returns the creation time of the newest processed event.
    ///
    /// Falls back to [`Self::last_summarized_at`] for records written before
    /// this key existed.
    #[must_use]
    pub fn processed_through(&self) -> Option<DateTime<Utc>> {
        timestamp_field(&self.metadata, PROCESSED_THROUGH_KEY).or_else(|| self.last_summarized_at())
    }

    /// Returns the ids of the events folded in by the last update.
    #[must_use]
    pub fn last_summarization_event_ids(&self) -> Vec<String> {
        self.metadata
            .get(LAST_SUMMARIZATION_EVENT_IDS_KEY)
            .and_then(Value::as_array)
            .map(|ids| ids.iter().filter_map(Value::as_str).map(ToString::to_string).collect())
            .unwrap_or_default()
    }
}

fn timestamp_field(metadata: &Metadata, key: &str) -> Option<DateTime<Utc>> {
    metadata
        .get(key)
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_topic_is_unversioned() {
        let topic = TopicSummary::new("derivatives");
        assert_eq!(topic.summary_version(), 0);
        assert!(topic.last_summarized_at().is_none());
        assert!(topic.processed_through().is_none());
        assert!(topic.last_summarization_event_ids().is_empty());
    }

    #[test]
    fn test_summary_version_tolerates_strings() {
        let mut topic = TopicSummary::new("t");
        topic.metadata.insert(SUMMARY_VERSION_KEY.to_string(), json!("7"));
        assert_eq!(topic.summary_version(), 7);

        topic.metadata.insert(SUMMARY_VERSION_KEY.to_string(), json!(3));
        assert_eq!(topic.summary_version(), 3);

        topic.metadata.insert(SUMMARY_VERSION_KEY.to_string(), json!("three"));
        assert_eq!(topic.summary_version(), 0);

        topic.metadata.insert(SUMMARY_VERSION_KEY.to_string(), json!(-2));
        assert_eq!(topic.summary_version(), 0);
    }

    #[test]
    fn test_processed_through_falls_back_to_last_summarized() {
        let mut topic = TopicSummary::new("t");
        topic.metadata.insert(
            LAST_SUMMARIZED_AT_KEY.to_string(),
            json!("2024-03-01T10:00:00+00:00"),
        );
        assert_eq!(topic.processed_through(), topic.last_summarized_at());

        topic.metadata.insert(
            PROCESSED_THROUGH_KEY.to_string(),
            json!("2024-02-28T09:00:00Z"),
        );
        assert!(topic.processed_through() < topic.last_summarized_at());
    }

    #[test]
    fn test_event_ids_read_back() {
        let mut topic = TopicSummary::new("t");
        topic.metadata.insert(
            LAST_SUMMARIZATION_EVENT_IDS_KEY.to_string(),
            json!(["a", "b", 3]),
        );
        assert_eq!(topic.last_summarization_event_ids(), vec!["a", "b"]);
    }
}
