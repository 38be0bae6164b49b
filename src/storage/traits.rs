//! Store trait.

use crate::Result;
use crate::models::{AuditLogEntry, Event, SkillState, TopicSummary};
use chrono::{DateTime, Utc};

/// Store collaborator for the summarization engine.
///
/// Every method is one scoped unit of work. Audit entries can only be
/// appended; no method updates or deletes them.
pub trait TutorStore: Send + Sync {
    /// Backend name for logs and metrics.
    fn name(&self) -> &'static str;

    /// Records an event.
    fn insert_event(&self, event: &Event) -> Result<()>;

    /// Returns events tagged with `topic_id`, oldest first.
    ///
    /// With `after`, only events created strictly later are returned. `limit`
    /// keeps the oldest matches.
    fn events_for_topic(
        &self,
        topic_id: &str,
        after: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<Event>>;

    /// Returns the newest `limit` events tagged with `topic_id`, newest first.
    fn recent_events_for_topic(&self, topic_id: &str, limit: usize) -> Result<Vec<Event>>;

    /// Returns up to `limit` events tagged with `topic_id` that come before
    /// the event `event_id`, newest first.
    ///
    /// Order is creation time, then insertion order. An unknown `event_id`
    /// yields no events.
    fn events_before(&self, topic_id: &str, event_id: &str, limit: usize) -> Result<Vec<Event>>;

    /// Returns events created strictly after `since`, oldest first.
    fn events_since(&self, since: DateTime<Utc>, limit: Option<usize>) -> Result<Vec<Event>>;

    /// Reads a topic summary.
    fn get_topic(&self, topic_id: &str) -> Result<Option<TopicSummary>>;

    /// Inserts or replaces a topic summary.
    fn upsert_topic(&self, topic: &TopicSummary) -> Result<()>;

    /// Lists every stored topic id, sorted.
    fn list_topic_ids(&self) -> Result<Vec<String>>;

    /// Reads a skill state.
    fn get_skill(&self, skill_id: &str) -> Result<Option<SkillState>>;

    /// Inserts or replaces a skill state.
    fn upsert_skill(&self, skill: &SkillState) -> Result<()>;

    /// Appends an audit entry.
    fn append_audit(&self, entry: &AuditLogEntry) -> Result<()>;

    /// Returns audit entries, oldest first, optionally for one topic.
    fn audit_entries(&self, topic_id: Option<&str>, limit: Option<usize>) -> Result<Vec<AuditLogEntry>>;
}
