//! Skill mastery state.

use super::Metadata;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Mastery estimate for one skill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillState {
    /// Unique skill identifier.
    pub skill_id: String,
    /// Probability of mastery in `[0, 1]`.
    pub p_mastery: f64,
    /// Most recent evidence time.
    #[serde(default)]
    pub last_evidence_at: Option<DateTime<Utc>>,
    /// Evidence events seen.
    pub evidence_count: u64,
    /// Parent topic.
    #[serde(default)]
    pub topic_id: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
    /// Additional metadata.
    #[serde(default)]
    pub metadata: Metadata,
}

impl SkillState {
    /// Mastery assigned to a skill on first evidence.
    pub const INITIAL_MASTERY: f64 = 0.5;

    /// Creates a skill seen for the first time now.
    #[must_use]
    pub fn new(skill_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            skill_id: skill_id.into(),
            p_mastery: Self::INITIAL_MASTERY,
            last_evidence_at: Some(now),
            evidence_count: 1,
            topic_id: None,
            created_at: now,
            updated_at: now,
            metadata: Metadata::new(),
        }
    }

    /// Records one more piece of evidence and shifts mastery by `delta`,
    /// clamped into `[0, 1]`.
    pub fn apply_evidence(&mut self, delta: f64) {
        let now = Utc::now();
        let delta = if delta.is_finite() { delta } else { 0.0 };
        self.p_mastery = (self.p_mastery + delta).clamp(0.0, 1.0);
        self.evidence_count += 1;
        self.last_evidence_at = Some(now);
        self.updated_at = now;
    }
}
