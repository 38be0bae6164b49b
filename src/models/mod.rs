//! Data models for tutorlog.
//!
//! Events are the atomic records of learning history. Topic summaries and
//! skill states are derived from them and every derivation attempt leaves an
//! audit entry.

mod audit;
mod event;
mod skill;
mod topic;

pub use audit::{AuditLogEntry, AuditStatus, LogType};
pub use event::{Actor, Event, EventType};
pub use skill::SkillState;
pub use topic::{
    LAST_SUMMARIZATION_EVENT_IDS_KEY, LAST_SUMMARIZED_AT_KEY, PROCESSED_THROUGH_KEY,
    SUMMARY_VERSION_KEY, TopicSummary,
};

/// Free-form JSON metadata attached to records.
pub type Metadata = serde_json::Map<String, serde_json::Value>;
