//! Interaction events.

use super::Metadata;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of interaction an event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    /// A chat turn.
    Chat,
    /// An imported session transcript.
    Transcript,
    /// A quiz attempt.
    Quiz,
    /// A graded assessment.
    Assessment,
}

impl EventType {
    /// Returns the stored name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Transcript => "transcript",
            Self::Quiz => "quiz",
            Self::Assessment => "assessment",
        }
    }

    /// Parses a stored name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "chat" => Some(Self::Chat),
            "transcript" => Some(Self::Transcript),
            "quiz" => Some(Self::Quiz),
            "assessment" => Some(Self::Assessment),
            _ => None,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Actor {
    /// The learner.
    Student,
    /// The AI tutor.
    Tutor,
    /// Automated processes.
    System,
}

impl Actor {
    /// Returns the stored name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Student => "student",
            Self::Tutor => "tutor",
            Self::System => "system",
        }
    }

    /// Parses a stored name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "student" => Some(Self::Student),
            "tutor" => Some(Self::Tutor),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single timestamped interaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier (UUID v4).
    pub event_id: String,
    /// Raw content text.
    pub content: String,
    /// Interaction kind.
    pub event_type: EventType,
    /// Producer.
    pub actor: Actor,
    /// Topic identifiers.
    #[serde(default)]
    pub topics: Vec<String>,
    /// Skill identifiers.
    #[serde(default)]
    pub skills: Vec<String>,
    /// When the event was logged.
    pub created_at: DateTime<Utc>,
    /// When the interaction originally happened, for imports.
    #[serde(default)]
    pub recorded_at: Option<DateTime<Utc>>,
    /// Additional metadata.
    #[serde(default)]
    pub metadata: Metadata,
    /// Source identifier, such as an importer name.
    #[serde(default)]
    pub source: Option<String>,
}

impl Event {
    /// Creates an event logged now with a fresh id.
    #[must_use]
    pub fn new(content: impl Into<String>, event_type: EventType, actor: Actor) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            content: content.into(),
            event_type,
            actor,
            topics: Vec::new(),
            skills: Vec::new(),
            created_at: Utc::now(),
            recorded_at: None,
            metadata: Metadata::new(),
            source: None,
        }
    }

    /// Adds a topic.
    #[must_use]
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topics.push(topic.into());
        self
    }

    /// Adds a skill.
    #[must_use]
    pub fn with_skill(mut self, skill: impl Into<String>) -> Self {
        self.skills.push(skill.into());
        self
    }

    /// Overrides the creation timestamp.
    #[must_use]
    pub const fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Sets the source identifier.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Returns true if the event is tagged with `topic_id`.
    #[must_use]
    pub fn has_topic(&self, topic_id: &str) -> bool {
        self.topics.iter().any(|t| t == topic_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_event_defaults() {
        let event = Event::new("What is a derivative?", EventType::Chat, Actor::Student)
            .with_topic("derivatives")
            .with_skill("limits");

        assert_eq!(event.event_id.len(), 36);
        assert!(event.has_topic("derivatives"));
        assert!(!event.has_topic("integrals"));
        assert_eq!(event.skills, vec!["limits".to_string()]);
        assert!(event.recorded_at.is_none());
    }

    #[test]
    fn test_enum_names() {
        for kind in [EventType::Chat, EventType::Transcript, EventType::Quiz, EventType::Assessment] {
            assert_eq!(EventType::parse(kind.as_str()), Some(kind));
        }
        for actor in [Actor::Student, Actor::Tutor, Actor::System] {
            assert_eq!(Actor::parse(actor.as_str()), Some(actor));
        }
        assert_eq!(EventType::parse("lecture"), None);
    }

    #[test]
    fn test_serde_uses_lowercase_names() {
        let event = Event::new("x", EventType::Quiz, Actor::Tutor);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "quiz");
        assert_eq!(json["actor"], "tutor");
    }
}
