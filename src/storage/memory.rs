//! In-memory store.

use super::TutorStore;
use super::sqlite::acquire_lock;
use crate::Result;
use crate::models::{AuditLogEntry, Event, SkillState, TopicSummary};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Debug, Default)]
struct Tables {
    events: Vec<Event>,
    topics: BTreeMap<String, TopicSummary>,
    skills: BTreeMap<String, SkillState>,
    audit: Vec<AuditLogEntry>,
}

/// Mutex-guarded maps implementing [`TutorStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl TutorStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn insert_event(&self, event: &Event) -> Result<()> {
        let mut tables = acquire_lock(&self.tables);
        // Stable ordering by creation time; ties keep insertion order.
        let position = tables
            .events
            .partition_point(|e| e.created_at <= event.created_at);
        tables.events.insert(position, event.clone());
        Ok(())
    }

    fn events_for_topic(
        &self,
        topic_id: &str,
        after: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<Event>> {
        let tables = acquire_lock(&self.tables);
        Ok(tables
            .events
            .iter()
            .filter(|e| e.has_topic(topic_id))
            .filter(|e| after.is_none_or(|after| e.created_at > after))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    fn recent_events_for_topic(&self, topic_id: &str, limit: usize) -> Result<Vec<Event>> {
        let tables = acquire_lock(&self.tables);
        Ok(tables
            .events
            .iter()
            .rev()
            .filter(|e| e.has_topic(topic_id))
            .take(limit)
            .cloned()
            .collect())
    }

    fn events_before(&self, topic_id: &str, event_id: &str, limit: usize) -> Result<Vec<Event>> {
        let tables = acquire_lock(&self.tables);
        let Some(position) = tables.events.iter().position(|e| e.event_id == event_id) else {
            return Ok(Vec::new());
        };
        Ok(tables.events[..position]
            .iter()
            .rev()
            .filter(|e| e.has_topic(topic_id))
            .take(limit)
            .cloned()
            .collect())
    }

    fn events_since(&self, since: DateTime<Utc>, limit: Option<usize>) -> Result<Vec<Event>> {
        let tables = acquire_lock(&self.tables);
        Ok(tables
            .events
            .iter()
            .filter(|e| e.created_at > since)
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    fn get_topic(&self, topic_id: &str) -> Result<Option<TopicSummary>> {
        Ok(acquire_lock(&self.tables).topics.get(topic_id).cloned())
    }

    fn upsert_topic(&self, topic: &TopicSummary) -> Result<()> {
        acquire_lock(&self.tables)
            .topics
            .insert(topic.topic_id.clone(), topic.clone());
        Ok(())
    }

    fn list_topic_ids(&self) -> Result<Vec<String>> {
        Ok(acquire_lock(&self.tables).topics.keys().cloned().collect())
    }

    fn get_skill(&self, skill_id: &str) -> Result<Option<SkillState>> {
        Ok(acquire_lock(&self.tables).skills.get(skill_id).cloned())
    }

    fn upsert_skill(&self, skill: &SkillState) -> Result<()> {
        acquire_lock(&self.tables)
            .skills
            .insert(skill.skill_id.clone(), skill.clone());
        Ok(())
    }

    fn append_audit(&self, entry: &AuditLogEntry) -> Result<()> {
        acquire_lock(&self.tables).audit.push(entry.clone());
        Ok(())
    }

    fn audit_entries(&self, topic_id: Option<&str>, limit: Option<usize>) -> Result<Vec<AuditLogEntry>> {
        let tables = acquire_lock(&self.tables);
        Ok(tables
            .audit
            .iter()
            .filter(|entry| topic_id.is_none_or(|t| entry.topic_id.as_deref() == Some(t)))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }
}
