//! Services built on the store and the request orchestrator.

mod scheduler;
mod skills;
mod summarization;

pub use scheduler::{CycleReport, RefreshQueue, RefreshScheduler};
pub use skills::{EVIDENCE_STEP, SkillService};
pub use summarization::{RefreshResults, SummarizationService, SummaryInput, TopicUpdate};
