//! Topic summarization update engine.
//!
//! Folds unprocessed events into versioned, append-only topic summaries and
//! records every attempt in the audit log.

use crate::config::SummarizationConfig;
use crate::llm::{AiClient, SummaryOutput, Task};
use crate::models::{
    AuditLogEntry, AuditStatus, Event, LAST_SUMMARIZATION_EVENT_IDS_KEY, LAST_SUMMARIZED_AT_KEY,
    LogType, PROCESSED_THROUGH_KEY, SUMMARY_VERSION_KEY, TopicSummary,
};
use crate::storage::TutorStore;
use crate::{Error, Result};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::instrument;

/// Updated topic and approximate tokens used, `None` when no model call ran.
pub type TopicUpdate = (TopicSummary, Option<u64>);

/// Per-topic result of a batch refresh; `(None, None)` marks a failed topic.
pub type RefreshResults = BTreeMap<String, (Option<TopicSummary>, Option<u64>)>;

/// Precomputed input for [`SummarizationService::update_topic_summary_with`].
#[derive(Debug, Clone, Default)]
pub struct SummaryInput {
    /// Content to summarize instead of the topic's unprocessed events.
    pub content: Option<String>,
    /// Ids of the events `content` came from.
    pub event_ids: Vec<String>,
    /// Already computed model output; no model call is made when set.
    pub output: Option<SummaryOutput>,
    /// Ignore the cooldown window.
    pub force: bool,
    /// Model to use instead of the summarize route's default.
    pub override_model: Option<String>,
}

impl SummaryInput {
    /// Input that only sets `force`.
    #[must_use]
    pub fn forced(force: bool) -> Self {
        Self {
            force,
            ..Self::default()
        }
    }
}

/// What one update will fold in.
struct Batch {
    content: String,
    event_ids: Vec<String>,
    /// Earliest stored event in the batch; prior context stops before it.
    oldest_event_id: Option<String>,
    newest_event_at: Option<DateTime<Utc>>,
}

/// The summarization update engine.
///
/// There is no per-topic lock. Two concurrent updates of one topic both
/// succeed and the later upsert wins.
pub struct SummarizationService {
    store: Arc<dyn TutorStore>,
    client: Arc<AiClient>,
    config: SummarizationConfig,
}

impl SummarizationService {
    /// Creates an engine over `store` that calls the model through `client`.
    #[must_use]
    pub fn new(store: Arc<dyn TutorStore>, client: Arc<AiClient>, config: SummarizationConfig) -> Self {
        Self {
            store,
            client,
            config,
        }
    }

    /// The store this engine writes to.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn TutorStore> {
        &self.store
    }

    /// Engine settings.
    #[must_use]
    pub const fn config(&self) -> &SummarizationConfig {
        &self.config
    }

    /// Returns the topic's current summary version, 0 when unknown.
    ///
    /// # Errors
    ///
    /// Returns an error if the store read fails.
    pub fn get_topic_summary_version(&self, topic_id: &str) -> Result<u64> {
        Ok(self
            .store
            .get_topic(topic_id)?
            .map_or(0, |topic| topic.summary_version()))
    }

    /// Returns events for `topic_id` not yet folded into its summary, oldest
    /// first.
    ///
    /// With `since`, events after that instant are returned instead of those
    /// after the topic's watermark. A topic never summarized has every event
    /// unprocessed.
    ///
    /// # Errors
    ///
    /// Returns an error if a store read fails.
    pub fn get_unprocessed_events(
        &self,
        topic_id: &str,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<Event>> {
        let after = match since {
            Some(since) => Some(since),
            None => self
                .store
                .get_topic(topic_id)?
                .and_then(|topic| topic.processed_through()),
        };
        self.store.events_for_topic(topic_id, after, limit)
    }

    /// Folds the topic's unprocessed events into its summary.
    ///
    /// # Errors
    ///
    /// See [`Self::update_topic_summary_with`].
    pub fn update_topic_summary(&self, topic_id: &str, force: bool) -> Result<TopicUpdate> {
        self.update_topic_summary_with(topic_id, SummaryInput::forced(force))
    }

    /// Updates or creates the summary for `topic_id`.
    ///
    /// Without precomputed content the update is skipped when the topic was
    /// summarized within the cooldown window (unless forced) or has no
    /// unprocessed events; skips return the topic as is with `None` tokens and
    /// write no audit entry. Every attempted update writes exactly one
    /// `topic_update` audit entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for a blank topic id. Model and store
    /// failures are audited as `failed` and then returned.
    #[instrument(
        name = "tutorlog.summarization.update_topic",
        skip(self, input),
        fields(topic_id = %topic_id, force = input.force)
    )]
    pub fn update_topic_summary_with(&self, topic_id: &str, input: SummaryInput) -> Result<TopicUpdate> {
        if topic_id.trim().is_empty() {
            return Err(Error::InvalidInput("topic id must not be empty".to_string()));
        }

        let start = Instant::now();
        let mut event_ids = input.event_ids.clone();
        let mut model = None;
        let result = self.try_update(topic_id, input, &mut event_ids, &mut model);

        let status = match &result {
            Ok(Attempt::Skipped(_)) => "skipped",
            Ok(Attempt::Updated(..)) => "success",
            Err(_) => "failed",
        };
        metrics::counter!("topic_refresh_total", "status" => status).increment(1);
        metrics::histogram!("topic_refresh_duration_ms", "status" => status)
            .record(start.elapsed().as_secs_f64() * 1000.0);

        match result {
            Ok(Attempt::Skipped(topic)) => Ok((topic, None)),
            Ok(Attempt::Updated(topic, tokens)) => {
                let mut entry = AuditLogEntry::new(LogType::TopicUpdate, AuditStatus::Success)
                    .with_topic(topic_id)
                    .with_event_ids(event_ids)
                    .with_summary_version(topic.summary_version());
                if let Some(model) = model {
                    entry = entry.with_model(model);
                }
                if let Some(tokens) = tokens {
                    entry = entry.with_tokens_used(tokens);
                }
                self.store.append_audit(&entry)?;
                tracing::info!(
                    topic_id,
                    version = topic.summary_version(),
                    event_count = topic.event_count,
                    tokens,
                    "Updated topic summary"
                );
                Ok((topic, tokens))
            },
            Err(err) => {
                tracing::error!(topic_id, error = %err, "Topic summary update failed");
                let mut entry = AuditLogEntry::new(LogType::TopicUpdate, AuditStatus::Failed)
                    .with_topic(topic_id)
                    .with_event_ids(event_ids)
                    .with_error(err.to_string());
                if let Some(model) = model {
                    entry = entry.with_model(model);
                }
                if let Err(audit_err) = self.store.append_audit(&entry) {
                    tracing::warn!(topic_id, error = %audit_err, "Failed to record failed update in audit log");
                }
                Err(err)
            },
        }
    }

    fn try_update(
        &self,
        topic_id: &str,
        input: SummaryInput,
        event_ids: &mut Vec<String>,
        model: &mut Option<String>,
    ) -> Result<Attempt> {
        let existing = self.store.get_topic(topic_id)?;

        let batch = match input.content.filter(|c| !c.trim().is_empty()) {
            Some(content) => Batch {
                content,
                event_ids: input.event_ids,
                oldest_event_id: None,
                newest_event_at: None,
            },
            None => {
                if let Some(topic) = existing
                    .as_ref()
                    .filter(|t| !input.force && self.within_cooldown(t))
                {
                    tracing::debug!(topic_id, "Topic recently summarized, skipping");
                    return Ok(Attempt::Skipped(topic.clone()));
                }
                let events = self.get_unprocessed_events(topic_id, None, Some(self.config.batch_size))?;
                if events.is_empty() {
                    tracing::debug!(topic_id, "No unprocessed events for topic");
                    return Ok(Attempt::Skipped(
                        existing.unwrap_or_else(|| TopicSummary::new(topic_id)),
                    ));
                }
                aggregate(&events)
            },
        };
        event_ids.clone_from(&batch.event_ids);

        let (output, tokens) = match input.output {
            Some(output) => (output, None),
            None => {
                let context = self.prior_context(topic_id, &batch)?;
                let route_model = self
                    .client
                    .router()
                    .get_route(Task::Summarize, input.override_model.as_deref())
                    .model;
                *model = Some(route_model);
                let context = (!context.is_empty()).then_some(context.as_str());
                let output = self.client.summarize(
                    &batch.content,
                    context,
                    input.override_model.as_deref(),
                )?;
                let tokens = word_count(&batch.content) + context.map_or(0, word_count);
                (output, Some(tokens))
            },
        };

        let topic = merge(existing, topic_id, &batch, &output, Utc::now());
        self.store.upsert_topic(&topic)?;
        Ok(Attempt::Updated(topic, tokens))
    }

    fn within_cooldown(&self, topic: &TopicSummary) -> bool {
        let Some(last) = topic.last_summarized_at() else {
            return false;
        };
        let cooldown = i64::try_from(self.config.cooldown_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or(Duration::MAX);
        Utc::now().signed_duration_since(last) < cooldown
    }

    /// Most recent events before the batch, oldest first, each cut to the
    /// configured character window.
    ///
    /// Precomputed content has no stored anchor, so the newest events outside
    /// its id list are used instead.
    fn prior_context(&self, topic_id: &str, batch: &Batch) -> Result<String> {
        let limit = self.config.context_events;
        if limit == 0 {
            return Ok(String::new());
        }
        let candidates = match &batch.oldest_event_id {
            Some(oldest) => self.store.events_before(topic_id, oldest, limit)?,
            None => self
                .store
                .recent_events_for_topic(topic_id, limit + batch.event_ids.len())?,
        };
        let ids: HashSet<&str> = batch.event_ids.iter().map(String::as_str).collect();
        let mut prior: Vec<String> = candidates
            .into_iter()
            .filter(|e| !ids.contains(e.event_id.as_str()))
            .take(limit)
            .map(|e| e.content.chars().take(self.config.context_chars).collect())
            .collect();
        prior.reverse();
        Ok(prior.join("\n"))
    }

    /// Refreshes each topic independently.
    ///
    /// Without `topic_ids`, every topic tagged on an event after `since`
    /// (default: the configured lookback) is refreshed. A failing topic is
    /// recorded as `(None, None)` and the batch continues.
    ///
    /// # Errors
    ///
    /// Returns an error only if topic discovery fails.
    #[instrument(name = "tutorlog.summarization.refresh", skip(self, topic_ids))]
    pub fn refresh_topic_summaries(
        &self,
        topic_ids: Option<&[String]>,
        since: Option<DateTime<Utc>>,
        force: bool,
    ) -> Result<RefreshResults> {
        let topics: Vec<String> = match topic_ids {
            Some(ids) => ids.to_vec(),
            None => {
                let cutoff = since.unwrap_or_else(|| self.default_cutoff());
                let mut seen = BTreeSet::new();
                for event in self.store.events_since(cutoff, None)? {
                    seen.extend(event.topics);
                }
                seen.into_iter().collect()
            },
        };

        let mut results = RefreshResults::new();
        for topic_id in topics {
            match self.update_topic_summary(&topic_id, force) {
                Ok((topic, tokens)) => {
                    results.insert(topic_id, (Some(topic), tokens));
                },
                Err(err) => {
                    tracing::warn!(topic_id = %topic_id, error = %err, "Topic refresh failed, continuing");
                    results.insert(topic_id, (None, None));
                },
            }
        }
        Ok(results)
    }

    /// Returns topics that have unprocessed events, plus topics tagged on
    /// events after `since` (default: the configured lookback) that have no
    /// summary yet. Sorted, without duplicates.
    ///
    /// # Errors
    ///
    /// Returns an error if a store read fails.
    pub fn topics_needing_refresh(&self, since: Option<DateTime<Utc>>) -> Result<Vec<String>> {
        let mut stale = BTreeSet::new();
        for topic_id in self.store.list_topic_ids()? {
            if !self.get_unprocessed_events(&topic_id, None, Some(1))?.is_empty() {
                stale.insert(topic_id);
            }
        }

        let cutoff = since.unwrap_or_else(|| self.default_cutoff());
        for event in self.store.events_since(cutoff, None)? {
            for topic_id in event.topics {
                if !stale.contains(&topic_id) && self.store.get_topic(&topic_id)?.is_none() {
                    stale.insert(topic_id);
                }
            }
        }
        Ok(stale.into_iter().collect())
    }

    fn default_cutoff(&self) -> DateTime<Utc> {
        let lookback = Duration::try_hours(self.config.lookback_hours).unwrap_or(Duration::zero());
        Utc::now() - lookback
    }
}

enum Attempt {
    Skipped(TopicSummary),
    Updated(TopicSummary, Option<u64>),
}

fn aggregate(events: &[Event]) -> Batch {
    Batch {
        content: events
            .iter()
            .map(|e| e.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n"),
        event_ids: events.iter().map(|e| e.event_id.clone()).collect(),
        oldest_event_id: events.first().map(|e| e.event_id.clone()),
        newest_event_at: events.iter().map(|e| e.created_at).max(),
    }
}

fn word_count(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

/// Applies one update to the prior record, or to an empty one.
fn merge(
    existing: Option<TopicSummary>,
    topic_id: &str,
    batch: &Batch,
    output: &SummaryOutput,
    now: DateTime<Utc>,
) -> TopicSummary {
    let mut topic = existing.unwrap_or_else(|| TopicSummary::new(topic_id));
    let version = topic.summary_version() + 1;

    let prior = topic.summary.trim();
    let addition = output.summary.trim();
    topic.summary = match (prior.is_empty(), addition.is_empty()) {
        (false, false) => format!("{prior}\n\nNew content: {addition}"),
        (true, _) => addition.to_string(),
        (false, true) => prior.to_string(),
    };

    for question in &output.open_questions {
        if !topic.open_questions.contains(question) {
            topic.open_questions.push(question.clone());
        }
    }

    topic.event_count += (batch.event_ids.len() as u64).max(1);
    let newest = batch.newest_event_at.unwrap_or(now);
    topic.last_event_at = Some(topic.last_event_at.map_or(newest, |last| last.max(newest)));
    topic.updated_at = now;

    topic.metadata.insert(SUMMARY_VERSION_KEY.to_string(), json!(version));
    topic.metadata.insert(
        LAST_SUMMARIZED_AT_KEY.to_string(),
        Value::String(now.to_rfc3339_opts(SecondsFormat::Micros, true)),
    );
    topic
        .metadata
        .insert(LAST_SUMMARIZATION_EVENT_IDS_KEY.to_string(), json!(batch.event_ids));
    // Full precision so the newest event never compares as unprocessed.
    if let Some(newest) = batch.newest_event_at {
        topic.metadata.insert(
            PROCESSED_THROUGH_KEY.to_string(),
            Value::String(newest.to_rfc3339_opts(SecondsFormat::Nanos, true)),
        );
    }
    topic
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{
        ClientSettings, Completion, CompletionRequest, CompletionTransport, FragmentStream, ModelRouter,
        RateLimiter, RetryConfig,
    };
    use crate::models::{Actor, EventType};
    use crate::storage::MemoryStore;
    use std::sync::Mutex;

    /// Replies with a fixed summary and records each user prompt.
    struct Echo {
        prompts: Mutex<Vec<String>>,
    }

    impl CompletionTransport for Echo {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
            let prompt = request.messages.last().map(|m| m.content.clone()).unwrap_or_default();
            self.prompts.lock().unwrap().push(prompt);
            Ok(Completion::text(
                r#"{"summary": "Learned about slopes.", "open_questions": ["Why limits?"]}"#,
            ))
        }

        fn stream(&self, _request: &CompletionRequest) -> Result<FragmentStream> {
            Ok(Box::new(std::iter::empty()))
        }
    }

    fn engine() -> (SummarizationService, Arc<MemoryStore>, Arc<Echo>) {
        engine_with(SummarizationConfig::default())
    }

    fn engine_with(config: SummarizationConfig) -> (SummarizationService, Arc<MemoryStore>, Arc<Echo>) {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(Echo {
            prompts: Mutex::new(Vec::new()),
        });
        let client = AiClient::new(
            Arc::clone(&transport) as Arc<dyn CompletionTransport>,
            Arc::new(ModelRouter::default()),
            Arc::new(RateLimiter::new(1_000.0)),
            ClientSettings {
                retry: RetryConfig::immediate(0),
                ..ClientSettings::default()
            },
        );
        let service = SummarizationService::new(
            Arc::clone(&store) as Arc<dyn TutorStore>,
            Arc::new(client),
            config,
        );
        (service, store, transport)
    }

    fn log(store: &MemoryStore, topic: &str, content: &str, minutes_ago: i64) -> Event {
        let event = Event::new(content, EventType::Chat, Actor::Student)
            .with_topic(topic)
            .with_created_at(Utc::now() - Duration::minutes(minutes_ago));
        store.insert_event(&event).unwrap();
        event
    }

    #[test]
    fn test_blank_topic_rejected() {
        let (service, _, _) = engine();
        assert!(matches!(
            service.update_topic_summary("  ", true),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_no_events_returns_empty_topic_without_audit() {
        let (service, store, _) = engine();
        let (topic, tokens) = service.update_topic_summary("empty", false).unwrap();
        assert_eq!(topic.topic_id, "empty");
        assert_eq!(topic.summary_version(), 0);
        assert!(tokens.is_none());
        assert!(store.get_topic("empty").unwrap().is_none());
        assert!(store.audit_entries(None, None).unwrap().is_empty());
    }

    #[test]
    fn test_first_update_creates_version_one() {
        let (service, store, _) = engine();
        let a = log(&store, "derivatives", "slope of a line", 30);
        let b = log(&store, "derivatives", "rise over run", 20);

        let (topic, tokens) = service.update_topic_summary("derivatives", false).unwrap();
        assert_eq!(topic.summary_version(), 1);
        assert_eq!(topic.event_count, 2);
        assert_eq!(topic.summary, "Learned about slopes.");
        assert_eq!(topic.open_questions, vec!["Why limits?"]);
        assert_eq!(topic.last_event_at, Some(b.created_at));
        assert_eq!(topic.last_summarization_event_ids(), vec![a.event_id, b.event_id]);
        // Seven words of content, no prior context.
        assert_eq!(tokens, Some(7));

        let audit = store.audit_entries(Some("derivatives"), None).unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].status, AuditStatus::Success);
        assert_eq!(audit[0].summary_version, Some(1));
        assert_eq!(audit[0].model.as_deref(), Some(crate::config::DEFAULT_MODEL));
    }

    #[test]
    fn test_cooldown_skip_and_force() {
        let (service, store, _) = engine();
        log(&store, "limits", "first", 10);
        service.update_topic_summary("limits", false).unwrap();
        log(&store, "limits", "second", 0);

        let (skipped, tokens) = service.update_topic_summary("limits", false).unwrap();
        assert_eq!(skipped.summary_version(), 1);
        assert!(tokens.is_none());

        let (forced, tokens) = service.update_topic_summary("limits", true).unwrap();
        assert_eq!(forced.summary_version(), 2);
        assert!(tokens.is_some());
        assert!(forced.summary.contains("New content:"));
        assert_eq!(store.audit_entries(Some("limits"), None).unwrap().len(), 2);
    }

    #[test]
    fn test_prior_events_sent_as_context() {
        let (service, store, transport) = engine();
        log(&store, "vectors", "old one", 50);
        log(&store, "vectors", "old two", 40);
        service.update_topic_summary("vectors", true).unwrap();
        log(&store, "vectors", "fresh question", 1);
        service.update_topic_summary("vectors", true).unwrap();

        let prompts = transport.prompts.lock().unwrap();
        let last = prompts.last().unwrap();
        assert!(last.contains("fresh question"));
        assert!(last.contains("old one\nold two"));
    }

    #[test]
    fn test_context_never_includes_events_after_batch() {
        let (service, store, transport) = engine_with(SummarizationConfig {
            batch_size: 2,
            ..SummarizationConfig::default()
        });
        for (i, minutes_ago) in [40, 30, 20, 10].into_iter().enumerate() {
            log(&store, "t", &format!("EVT{}", i + 1), minutes_ago);
        }

        let (first, _) = service.update_topic_summary("t", true).unwrap();
        assert_eq!(first.event_count, 2);
        let (second, _) = service.update_topic_summary("t", true).unwrap();
        assert_eq!(second.event_count, 4);

        let prompts = transport.prompts.lock().unwrap();
        assert!(prompts[0].contains("EVT1\n\nEVT2"));
        assert!(!prompts[0].contains("Context from previous sessions"));
        assert!(!prompts[0].contains("EVT3"));
        assert!(!prompts[0].contains("EVT4"));

        let (batch, context) = prompts[1].split_once("Context from previous sessions:").unwrap();
        assert!(batch.contains("EVT3\n\nEVT4"));
        assert!(context.contains("EVT1\nEVT2"));
        assert!(!context.contains("EVT3"));
        assert!(!context.contains("EVT4"));
    }

    #[test]
    fn test_precomputed_output_skips_model() {
        let (service, store, transport) = engine();
        let input = SummaryInput {
            content: Some("imported transcript".to_string()),
            event_ids: vec!["e1".to_string(), "e2".to_string()],
            output: Some(SummaryOutput {
                summary: "Imported.".to_string(),
                ..SummaryOutput::default()
            }),
            ..SummaryInput::default()
        };
        let (topic, tokens) = service.update_topic_summary_with("imports", input).unwrap();
        assert_eq!(topic.event_count, 2);
        assert!(tokens.is_none());
        assert!(transport.prompts.lock().unwrap().is_empty());

        let audit = store.audit_entries(Some("imports"), None).unwrap();
        assert!(audit[0].model.is_none());
        assert_eq!(audit[0].event_ids, vec!["e1", "e2"]);
    }

    #[test]
    fn test_merge_keeps_prior_and_unions_questions() {
        let mut prior = TopicSummary::new("t");
        prior.summary = "Old.".to_string();
        prior.open_questions = vec!["a".to_string()];
        prior.event_count = 4;
        prior.metadata.insert(SUMMARY_VERSION_KEY.to_string(), json!(3));

        let batch = Batch {
            content: String::new(),
            event_ids: Vec::new(),
            oldest_event_id: None,
            newest_event_at: None,
        };
        let output = SummaryOutput {
            summary: "New.".to_string(),
            open_questions: vec!["a".to_string(), "b".to_string()],
            ..SummaryOutput::default()
        };
        let merged = merge(Some(prior), "t", &batch, &output, Utc::now());
        assert_eq!(merged.summary, "Old.\n\nNew content: New.");
        assert_eq!(merged.open_questions, vec!["a", "b"]);
        assert_eq!(merged.event_count, 5);
        assert_eq!(merged.summary_version(), 4);
    }

    #[test]
    fn test_topics_needing_refresh() {
        let (service, store, _) = engine();
        log(&store, "done", "x", 30);
        service.update_topic_summary("done", true).unwrap();
        log(&store, "brand_new", "y", 5);

        let mut summarized_then_new = TopicSummary::new("old");
        summarized_then_new.metadata.insert(
            PROCESSED_THROUGH_KEY.to_string(),
            json!((Utc::now() - Duration::hours(2)).to_rfc3339()),
        );
        store.upsert_topic(&summarized_then_new).unwrap();
        log(&store, "old", "z", 10);

        assert_eq!(service.topics_needing_refresh(None).unwrap(), vec!["brand_new", "old"]);
        assert_eq!(service.get_topic_summary_version("done").unwrap(), 1);
        assert_eq!(service.get_topic_summary_version("missing").unwrap(), 0);
    }
}
