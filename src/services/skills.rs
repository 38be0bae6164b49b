//! Skill-state updates.

use crate::llm::{AiClient, Task};
use crate::models::{AuditLogEntry, AuditStatus, LogType, SkillState};
use crate::storage::TutorStore;
use crate::{Error, Result};
use serde_json::json;
use std::sync::Arc;
use tracing::instrument;

/// Mastery added for each new piece of evidence on a known skill.
pub const EVIDENCE_STEP: f64 = 0.1;

/// Maintains skill mastery estimates and their audit trail.
pub struct SkillService {
    store: Arc<dyn TutorStore>,
    client: Arc<AiClient>,
}

impl SkillService {
    /// Creates a service over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn TutorStore>, client: Arc<AiClient>) -> Self {
        Self { store, client }
    }

    /// Records evidence for each skill.
    ///
    /// Unknown skills start at [`SkillState::INITIAL_MASTERY`] with one piece
    /// of evidence; known skills gain [`EVIDENCE_STEP`] mastery, capped at 1.
    /// Each skill gets one `skill_update` audit entry. A failing skill is
    /// audited and skipped, so the returned list holds only the skills that
    /// were written.
    #[must_use]
    #[instrument(name = "tutorlog.skills.update", skip(self, skill_ids, event_ids), fields(skills = skill_ids.len()))]
    pub fn update_skill_states(&self, skill_ids: &[String], event_ids: &[String]) -> Vec<SkillState> {
        let mut updated = Vec::with_capacity(skill_ids.len());
        for skill_id in skill_ids {
            match self.record_evidence(skill_id) {
                Ok(skill) => {
                    self.audit(
                        AuditLogEntry::new(LogType::SkillUpdate, AuditStatus::Success)
                            .with_skill(skill_id.as_str())
                            .with_event_ids(event_ids.to_vec())
                            .with_metadata("p_mastery", json!(skill.p_mastery))
                            .with_metadata("evidence_count", json!(skill.evidence_count)),
                    );
                    metrics::counter!("skill_updates_total", "status" => "success").increment(1);
                    updated.push(skill);
                },
                Err(err) => {
                    tracing::warn!(skill_id = %skill_id, error = %err, "Skill update failed, continuing");
                    self.audit(
                        AuditLogEntry::new(LogType::SkillUpdate, AuditStatus::Failed)
                            .with_skill(skill_id.as_str())
                            .with_event_ids(event_ids.to_vec())
                            .with_error(err.to_string()),
                    );
                    metrics::counter!("skill_updates_total", "status" => "failed").increment(1);
                },
            }
        }
        updated
    }

    fn record_evidence(&self, skill_id: &str) -> Result<SkillState> {
        if skill_id.trim().is_empty() {
            return Err(Error::InvalidInput("skill id must not be empty".to_string()));
        }
        let skill = match self.store.get_skill(skill_id)? {
            Some(mut skill) => {
                skill.apply_evidence(EVIDENCE_STEP);
                skill
            },
            None => SkillState::new(skill_id),
        };
        self.store.upsert_skill(&skill)?;
        Ok(skill)
    }

    /// Asks the model how `evidence` changes mastery of `skill_id` and applies
    /// the delta, clamped into `[0, 1]`.
    ///
    /// # Errors
    ///
    /// Returns model or store failures after auditing them.
    #[instrument(name = "tutorlog.skills.assess", skip(self, evidence, override_model))]
    pub fn assess_skill(
        &self,
        skill_id: &str,
        evidence: &str,
        override_model: Option<&str>,
    ) -> Result<SkillState> {
        let model = self.client.router().get_route(Task::UpdateSkill, override_model).model;
        let result = self.try_assess(skill_id, evidence, override_model);
        match result {
            Ok((skill, confidence)) => {
                self.audit(
                    AuditLogEntry::new(LogType::SkillUpdate, AuditStatus::Success)
                        .with_skill(skill_id)
                        .with_model(model)
                        .with_metadata("p_mastery", json!(skill.p_mastery))
                        .with_metadata("confidence", json!(confidence)),
                );
                Ok(skill)
            },
            Err(err) => {
                tracing::error!(skill_id, error = %err, "Skill assessment failed");
                self.audit(
                    AuditLogEntry::new(LogType::SkillUpdate, AuditStatus::Failed)
                        .with_skill(skill_id)
                        .with_model(model)
                        .with_error(err.to_string()),
                );
                Err(err)
            },
        }
    }

    fn try_assess(&self, skill_id: &str, evidence: &str, override_model: Option<&str>) -> Result<(SkillState, f64)> {
        if skill_id.trim().is_empty() {
            return Err(Error::InvalidInput("skill id must not be empty".to_string()));
        }
        let existing = self.store.get_skill(skill_id)?;
        let current = existing.as_ref().map_or(SkillState::INITIAL_MASTERY, |s| s.p_mastery);
        let output = self.client.update_skill(skill_id, current, evidence, override_model)?;

        let skill = match existing {
            Some(mut skill) => {
                skill.apply_evidence(output.mastery_delta);
                skill
            },
            None => {
                let mut skill = SkillState::new(skill_id);
                let delta = if output.mastery_delta.is_finite() { output.mastery_delta } else { 0.0 };
                skill.p_mastery = (skill.p_mastery + delta).clamp(0.0, 1.0);
                skill
            },
        };
        self.store.upsert_skill(&skill)?;
        Ok((skill, output.confidence))
    }

    fn audit(&self, entry: AuditLogEntry) {
        if let Err(err) = self.store.append_audit(&entry) {
            tracing::warn!(error = %err, "Failed to append skill audit entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{
        ClientSettings, Completion, CompletionRequest, CompletionTransport, FragmentStream, ModelRouter,
        RateLimiter, RetryConfig,
    };
    use crate::storage::MemoryStore;

    struct Fixed(&'static str);

    impl CompletionTransport for Fixed {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn complete(&self, _request: &CompletionRequest) -> Result<Completion> {
            Ok(Completion::text(self.0))
        }

        fn stream(&self, _request: &CompletionRequest) -> Result<FragmentStream> {
            Ok(Box::new(std::iter::empty()))
        }
    }

    fn service(reply: &'static str) -> (SkillService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let client = AiClient::new(
            Arc::new(Fixed(reply)),
            Arc::new(ModelRouter::default()),
            Arc::new(RateLimiter::new(1_000.0)),
            ClientSettings {
                retry: RetryConfig::immediate(0),
                ..ClientSettings::default()
            },
        );
        (
            SkillService::new(Arc::clone(&store) as Arc<dyn TutorStore>, Arc::new(client)),
            store,
        )
    }

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_new_and_existing_skills() {
        let (service, store) = service("{}");
        let first = service.update_skill_states(&ids(&["chain_rule"]), &ids(&["e1"]));
        assert!((first[0].p_mastery - 0.5).abs() < 1e-9);
        assert_eq!(first[0].evidence_count, 1);

        let second = service.update_skill_states(&ids(&["chain_rule"]), &ids(&["e2"]));
        assert!((second[0].p_mastery - 0.6).abs() < 1e-9);
        assert_eq!(second[0].evidence_count, 2);

        let audit = store.audit_entries(None, None).unwrap();
        assert_eq!(audit.len(), 2);
        assert!(audit.iter().all(|e| e.log_type == LogType::SkillUpdate));
        assert_eq!(audit[1].event_ids, vec!["e2"]);
    }

    #[test]
    fn test_mastery_caps_at_one() {
        let (service, store) = service("{}");
        let mut skill = SkillState::new("limits");
        skill.p_mastery = 0.95;
        store.upsert_skill(&skill).unwrap();

        let updated = service.update_skill_states(&ids(&["limits"]), &[]);
        assert!((updated[0].p_mastery - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_failed_skill_audited_and_loop_continues() {
        let (service, store) = service("{}");
        let updated = service.update_skill_states(&ids(&["", "vectors", "  "]), &[]);
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].skill_id, "vectors");

        let audit = store.audit_entries(None, None).unwrap();
        let statuses: Vec<_> = audit.iter().map(|e| e.status).collect();
        assert_eq!(
            statuses,
            vec![AuditStatus::Failed, AuditStatus::Success, AuditStatus::Failed]
        );
    }

    #[test]
    fn test_assess_applies_clamped_delta() {
        let (service, store) = service(r#"{"mastery_delta": 0.8, "confidence": 0.9}"#);
        let skill = service.assess_skill("integration", "solved three problems", None).unwrap();
        assert!((skill.p_mastery - 1.0).abs() < f64::EPSILON);

        let audit = store.audit_entries(None, None).unwrap();
        assert_eq!(audit[0].model.as_deref(), Some(crate::config::DEFAULT_NANO_MODEL));
    }

    #[test]
    fn test_assess_parse_failure_is_audited() {
        let (service, store) = service("not json at all");
        assert!(service.assess_skill("integration", "guessing", None).is_err());
        let audit = store.audit_entries(None, None).unwrap();
        assert_eq!(audit[0].status, AuditStatus::Failed);
        assert!(store.get_skill("integration").unwrap().is_none());
    }
}
