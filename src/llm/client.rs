//! The request orchestrator.
//!
//! [`AiClient`] resolves a route, takes one rate limiter token per logical
//! call, fits the user prompt into the route's budget, and issues the call
//! through the retry engine. Structured tasks are parsed into their output
//! types; chat may stream.

use super::prompts::{
    self, ClassificationOutput, SkillUpdateOutput, SummaryOutput, build_chat_prompt,
    build_classify_prompt, build_skill_update_prompt, build_summarize_prompt,
};
use super::tokens::{count_tokens, truncate_context};
use super::{
    ChatMessage, CompletionRequest, CompletionTransport, FragmentStream, ModelRoute, ModelRouter,
    RateLimiter, RetryConfig, Task, retry_with_backoff,
};
use crate::{Error, ErrorKind, Result};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Longest body attached to payload logs.
const MAX_LOGGED_PAYLOAD_CHARS: usize = 1000;

/// Orchestrator settings resolved from configuration.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Sampling temperature.
    pub temperature: f32,
    /// How long one call may wait for a rate limiter token.
    pub acquire_timeout: Duration,
    /// Retry policy around each remote call.
    pub retry: RetryConfig,
    /// Attach prompt and reply bodies to request telemetry.
    pub log_payloads: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            acquire_timeout: Duration::from_secs(10),
            retry: RetryConfig::default(),
            log_payloads: false,
        }
    }
}

/// Text reply to a non-streaming call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResponse {
    /// Reply text, never empty.
    pub text: String,
    /// Model that served the call.
    pub model: String,
    /// Prompt tokens, as reported by the service or estimated locally.
    pub tokens_in: u64,
    /// Completion tokens, when reported.
    pub tokens_out: Option<u64>,
}

/// Reply to a chat turn.
pub enum ChatReply {
    /// The whole reply.
    Text(String),
    /// Fragments as they arrive.
    Stream(ReplyStream),
}

impl ChatReply {
    /// Collects the reply into one string, draining a stream if needed.
    ///
    /// # Errors
    ///
    /// Returns the first error raised mid-stream.
    pub fn into_text(self) -> Result<String> {
        match self {
            Self::Text(text) => Ok(text),
            Self::Stream(stream) => stream.collect_text(),
        }
    }
}

impl fmt::Debug for ChatReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Self::Stream(stream) => f.debug_tuple("Stream").field(stream).finish(),
        }
    }
}

/// A finite, non-restartable sequence of reply fragments.
///
/// `None` marks a clean end. An error is yielded once as `Some(Err(_))` and
/// the stream is finished afterwards. [`ReplyStream::close`] drops the
/// connection early.
pub struct ReplyStream {
    inner: Option<FragmentStream>,
    task: Task,
    model: String,
    started: Instant,
    fragments: u64,
}

impl ReplyStream {
    fn new(inner: FragmentStream, task: Task, model: String, started: Instant) -> Self {
        Self {
            inner: Some(inner),
            task,
            model,
            started,
            fragments: 0,
        }
    }

    /// Returns the model serving this stream.
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Returns true once the stream has ended, failed or been closed.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.inner.is_none()
    }

    /// Stops reading and releases the connection.
    pub fn close(&mut self) {
        if self.inner.take().is_some() {
            tracing::debug!(
                task = self.task.as_str(),
                model = %self.model,
                fragments = self.fragments,
                "Reply stream closed early"
            );
        }
    }

    /// Drains the remaining fragments into one string.
    ///
    /// # Errors
    ///
    /// Returns the first error raised mid-stream.
    pub fn collect_text(self) -> Result<String> {
        let mut text = String::new();
        for fragment in self {
            text.push_str(&fragment?);
        }
        Ok(text)
    }

    fn finish(&mut self, status: &'static str) {
        self.inner = None;
        let elapsed = self.started.elapsed();
        tracing::info!(
            task = self.task.as_str(),
            model = %self.model,
            status,
            fragments = self.fragments,
            latency_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            "AI stream finished"
        );
        metrics::counter!(
            "ai_requests_total",
            "task" => self.task.as_str(),
            "status" => status
        )
        .increment(1);
        metrics::histogram!("ai_request_duration_ms", "task" => self.task.as_str())
            .record(elapsed.as_secs_f64() * 1000.0);
    }
}

impl Iterator for ReplyStream {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.inner.as_mut()?.next();
        match next {
            Some(Ok(fragment)) => {
                self.fragments += 1;
                Some(Ok(fragment))
            },
            Some(Err(err)) => {
                self.finish("error");
                Some(Err(err))
            },
            None => {
                self.finish("success");
                None
            },
        }
    }
}

impl fmt::Debug for ReplyStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyStream")
            .field("task", &self.task)
            .field("model", &self.model)
            .field("fragments", &self.fragments)
            .field("finished", &self.is_finished())
            .finish_non_exhaustive()
    }
}

/// Request orchestrator shared by every caller of the remote service.
pub struct AiClient {
    transport: Arc<dyn CompletionTransport>,
    router: Arc<ModelRouter>,
    rate_limiter: Arc<RateLimiter>,
    settings: ClientSettings,
}

impl AiClient {
    /// Creates an orchestrator over shared collaborators.
    #[must_use]
    pub fn new(
        transport: Arc<dyn CompletionTransport>,
        router: Arc<ModelRouter>,
        rate_limiter: Arc<RateLimiter>,
        settings: ClientSettings,
    ) -> Self {
        Self {
            transport,
            router,
            rate_limiter,
            settings,
        }
    }

    /// Returns the model router.
    #[must_use]
    pub fn router(&self) -> &ModelRouter {
        &self.router
    }

    /// Returns the shared rate limiter.
    #[must_use]
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// Returns the active settings.
    #[must_use]
    pub const fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    /// Runs `task` and returns the non-empty reply text.
    ///
    /// # Errors
    ///
    /// Returns a timeout error when no rate limiter token is available, and
    /// otherwise whatever the retry engine surfaces from the transport. An
    /// empty reply is an [`ErrorKind::EmptyResponse`] error once retries are
    /// spent.
    pub fn execute(
        &self,
        task: Task,
        system_prompt: &str,
        user_prompt: &str,
        override_model: Option<&str>,
    ) -> Result<TaskResponse> {
        let (route, request) = self.prepare(task, system_prompt, user_prompt, override_model, false)?;
        let span = tracing::info_span!("ai.request", task = task.as_str(), model = %route.model);
        let _enter = span.enter();
        let started = Instant::now();

        let result = retry_with_backoff(&self.settings.retry, task.as_str(), || {
            let completion = self.transport.complete(&request)?;
            let text = completion
                .content
                .filter(|text| !text.trim().is_empty())
                .ok_or_else(|| Error::ai(ErrorKind::EmptyResponse, "completion had no content"))?;
            Ok(TaskResponse {
                text,
                model: route.model.clone(),
                tokens_in: completion
                    .prompt_tokens
                    .unwrap_or_else(|| estimate_prompt_tokens(&request)),
                tokens_out: completion.completion_tokens,
            })
        });

        self.record_telemetry(task, &route, &request, &result, started.elapsed());
        result
    }

    /// Runs `task` and streams the reply when the route allows it.
    ///
    /// Routes without streaming support fall back to a whole reply.
    ///
    /// # Errors
    ///
    /// Returns an error if the call cannot be admitted or opened.
    pub fn execute_stream(
        &self,
        task: Task,
        system_prompt: &str,
        user_prompt: &str,
        override_model: Option<&str>,
    ) -> Result<ChatReply> {
        if !self.router.get_route(task, override_model).supports_streaming {
            return self
                .execute(task, system_prompt, user_prompt, override_model)
                .map(|response| ChatReply::Text(response.text));
        }

        let (route, request) = self.prepare(task, system_prompt, user_prompt, override_model, true)?;
        let started = Instant::now();
        let opened = retry_with_backoff(&self.settings.retry, task.as_str(), || {
            self.transport.stream(&request)
        });
        match opened {
            Ok(fragments) => {
                tracing::debug!(task = task.as_str(), model = %route.model, "AI stream opened");
                Ok(ChatReply::Stream(ReplyStream::new(
                    fragments,
                    task,
                    route.model,
                    started,
                )))
            },
            Err(err) => {
                self.record_telemetry::<()>(task, &route, &request, &Err(err.clone()), started.elapsed());
                Err(err)
            },
        }
    }

    /// Summarizes event content into structured output.
    ///
    /// # Errors
    ///
    /// Returns transport errors, or a parse error for a malformed reply.
    pub fn summarize(
        &self,
        content: &str,
        context: Option<&str>,
        override_model: Option<&str>,
    ) -> Result<SummaryOutput> {
        let prompt = build_summarize_prompt(content, context);
        let response = self.execute(
            Task::Summarize,
            prompts::system_prompt(Task::Summarize),
            &prompt,
            override_model,
        )?;
        SummaryOutput::parse(&response.text)
    }

    /// Classifies text into topics and skills.
    ///
    /// # Errors
    ///
    /// Returns transport errors, or a parse error for a malformed reply.
    pub fn classify(&self, text: &str, override_model: Option<&str>) -> Result<ClassificationOutput> {
        let prompt = build_classify_prompt(text);
        let response = self.execute(
            Task::Classify,
            prompts::system_prompt(Task::Classify),
            &prompt,
            override_model,
        )?;
        ClassificationOutput::parse(&response.text)
    }

    /// Assesses the mastery change for one skill.
    ///
    /// # Errors
    ///
    /// Returns transport errors, or a parse error for a malformed reply.
    pub fn update_skill(
        &self,
        skill_id: &str,
        current_mastery: f64,
        evidence: &str,
        override_model: Option<&str>,
    ) -> Result<SkillUpdateOutput> {
        let prompt = build_skill_update_prompt(skill_id, current_mastery, evidence);
        let response = self.execute(
            Task::UpdateSkill,
            prompts::system_prompt(Task::UpdateSkill),
            &prompt,
            override_model,
        )?;
        SkillUpdateOutput::parse(&response.text)
    }

    /// Answers a student message with opaque assembled context.
    ///
    /// # Errors
    ///
    /// Returns an error if the call cannot be admitted, opened or completed.
    pub fn chat(
        &self,
        message: &str,
        context: Option<&str>,
        stream: bool,
        override_model: Option<&str>,
    ) -> Result<ChatReply> {
        let prompt = build_chat_prompt(message, context);
        let system = prompts::system_prompt(Task::Chat);
        if stream {
            self.execute_stream(Task::Chat, system, &prompt, override_model)
        } else {
            self.execute(Task::Chat, system, &prompt, override_model)
                .map(|response| ChatReply::Text(response.text))
        }
    }

    fn prepare(
        &self,
        task: Task,
        system_prompt: &str,
        user_prompt: &str,
        override_model: Option<&str>,
        stream: bool,
    ) -> Result<(ModelRoute, CompletionRequest)> {
        let route = self.router.get_route(task, override_model);

        if !self.rate_limiter.acquire(self.settings.acquire_timeout) {
            metrics::counter!(
                "ai_requests_total",
                "task" => task.as_str(),
                "status" => "rate_limited"
            )
            .increment(1);
            return Err(Error::ai(
                ErrorKind::Timeout,
                format!(
                    "rate limiter admission timed out after {}ms",
                    self.settings.acquire_timeout.as_millis()
                ),
            ));
        }

        let system_tokens = count_tokens(system_prompt, &route.model);
        let user_tokens = count_tokens(user_prompt, &route.model);
        let user_prompt = if system_tokens + user_tokens > route.token_budget {
            let allowance = route.token_budget.saturating_sub(system_tokens);
            tracing::warn!(
                task = task.as_str(),
                model = %route.model,
                system_tokens,
                user_tokens,
                token_budget = route.token_budget,
                "Prompt exceeds token budget, truncating user prompt"
            );
            truncate_context(user_prompt, allowance, &route.model)
        } else {
            user_prompt.to_string()
        };

        let request = CompletionRequest {
            model: route.model.clone(),
            messages: vec![
                ChatMessage::system(system_prompt),
                ChatMessage::user(user_prompt),
            ],
            temperature: self.settings.temperature,
            structured_output: route.supports_structured_output,
            stream: stream && route.supports_streaming,
        };
        Ok((route, request))
    }

    fn record_telemetry<T>(
        &self,
        task: Task,
        route: &ModelRoute,
        request: &CompletionRequest,
        result: &Result<T>,
        elapsed: Duration,
    ) where
        T: ResponseSummary,
    {
        let latency_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        let status = match result {
            Ok(_) => "success",
            Err(err) => err.ai_kind().map_or("error", ErrorKind::as_str),
        };
        let (tokens_in, tokens_out) = match result {
            Ok(response) => response.token_counts(),
            Err(_) => (estimate_prompt_tokens(request), None),
        };

        metrics::counter!("ai_requests_total", "task" => task.as_str(), "status" => status)
            .increment(1);
        metrics::histogram!("ai_request_duration_ms", "task" => task.as_str())
            .record(elapsed.as_secs_f64() * 1000.0);
        metrics::counter!("ai_tokens_total", "task" => task.as_str(), "direction" => "in")
            .increment(tokens_in);
        if let Some(tokens_out) = tokens_out {
            metrics::counter!("ai_tokens_total", "task" => task.as_str(), "direction" => "out")
                .increment(tokens_out);
        }

        if self.settings.log_payloads {
            let prompt = request
                .messages
                .iter()
                .map(|m| m.content.as_str())
                .collect::<Vec<_>>()
                .join("\n\n");
            let reply = match result {
                Ok(response) => response.body().to_string(),
                Err(err) => err.to_string(),
            };
            tracing::info!(
                task = task.as_str(),
                model = %route.model,
                status,
                tokens_in,
                tokens_out,
                latency_ms,
                prompt = %clip(&prompt),
                response = %clip(&reply),
                "AI request"
            );
        } else {
            tracing::info!(
                task = task.as_str(),
                model = %route.model,
                status,
                tokens_in,
                tokens_out,
                latency_ms,
                "AI request"
            );
        }
    }
}

impl fmt::Debug for AiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AiClient")
            .field("transport", &self.transport.name())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

trait ResponseSummary {
    fn token_counts(&self) -> (u64, Option<u64>);
    fn body(&self) -> &str;
}

impl ResponseSummary for TaskResponse {
    fn token_counts(&self) -> (u64, Option<u64>) {
        (self.tokens_in, self.tokens_out)
    }

    fn body(&self) -> &str {
        &self.text
    }
}

impl ResponseSummary for () {
    fn token_counts(&self) -> (u64, Option<u64>) {
        (0, None)
    }

    fn body(&self) -> &str {
        ""
    }
}

fn estimate_prompt_tokens(request: &CompletionRequest) -> u64 {
    let tokens: usize = request
        .messages
        .iter()
        .map(|m| count_tokens(&m.content, &request.model))
        .sum();
    u64::try_from(tokens).unwrap_or(u64::MAX)
}

fn clip(text: &str) -> String {
    if text.chars().count() <= MAX_LOGGED_PAYLOAD_CHARS {
        return text.to_string();
    }
    let mut clipped: String = text.chars().take(MAX_LOGGED_PAYLOAD_CHARS).collect();
    clipped.push_str("...");
    clipped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{Completion, ModelRoute};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Scripted {
        replies: Mutex<VecDeque<Result<Completion>>>,
        fragments: Mutex<Option<Vec<Result<String>>>>,
        requests: Mutex<Vec<CompletionRequest>>,
    }

    impl Scripted {
        fn with_replies(replies: Vec<Result<Completion>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                ..Self::default()
            })
        }

        fn requests(&self) -> Vec<CompletionRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl CompletionTransport for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
            self.requests.lock().unwrap().push(request.clone());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(Error::ai(ErrorKind::Server, "script exhausted")))
        }

        fn stream(&self, request: &CompletionRequest) -> Result<FragmentStream> {
            self.requests.lock().unwrap().push(request.clone());
            let fragments = self.fragments.lock().unwrap().take().unwrap_or_default();
            Ok(Box::new(fragments.into_iter()))
        }
    }

    fn client(transport: Arc<Scripted>) -> AiClient {
        AiClient::new(
            transport,
            Arc::new(ModelRouter::default()),
            Arc::new(RateLimiter::new(1_000.0)),
            ClientSettings {
                retry: RetryConfig::immediate(2),
                ..ClientSettings::default()
            },
        )
    }

    #[test]
    fn test_execute_returns_text_and_usage() {
        let transport = Scripted::with_replies(vec![Ok(Completion {
            content: Some("hello".to_string()),
            prompt_tokens: Some(12),
            completion_tokens: Some(3),
        })]);
        let response = client(Arc::clone(&transport))
            .execute(Task::Chat, "sys", "user", None)
            .unwrap();

        assert_eq!(response.text, "hello");
        assert_eq!(response.model, "gpt-4o");
        assert_eq!(response.tokens_in, 12);
        assert_eq!(response.tokens_out, Some(3));

        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].messages[0], ChatMessage::system("sys"));
        assert!(!requests[0].structured_output);
        assert!(!requests[0].stream);
    }

    #[test]
    fn test_empty_reply_is_retried() {
        let transport = Scripted::with_replies(vec![
            Ok(Completion::default()),
            Ok(Completion::text("   ")),
            Ok(Completion::text("{\"summary\": \"ok\"}")),
        ]);
        let output = client(Arc::clone(&transport))
            .summarize("content", None, None)
            .unwrap();
        assert_eq!(output.summary, "ok");
        assert_eq!(transport.requests().len(), 3);
    }

    #[test]
    fn test_empty_reply_exhausts_as_empty_response() {
        let transport = Scripted::with_replies(vec![
            Ok(Completion::default()),
            Ok(Completion::default()),
            Ok(Completion::default()),
        ]);
        let err = client(Arc::clone(&transport))
            .execute(Task::Classify, "s", "u", None)
            .unwrap_err();
        assert_eq!(err.ai_kind(), Some(ErrorKind::EmptyResponse));
        assert_eq!(transport.requests().len(), 3);
    }

    #[test]
    fn test_structured_flag_follows_route() {
        let transport = Scripted::with_replies(vec![Ok(Completion::text(
            "{\"topics\": [\"limits\"], \"skills\": [], \"confidence\": 0.9}",
        ))]);
        let output = client(Arc::clone(&transport))
            .classify("what is a limit", Some("gpt-4.1-nano"))
            .unwrap();

        assert_eq!(output.topics, vec!["limits".to_string()]);
        let request = &transport.requests()[0];
        assert!(request.structured_output);
        assert_eq!(request.model, "gpt-4.1-nano");
    }

    #[test]
    fn test_user_prompt_truncated_to_budget() {
        let transport = Scripted::with_replies(vec![Ok(Completion::text("fine"))]);
        let ai = client(Arc::clone(&transport));
        ai.router()
            .set_route(Task::Chat, ModelRoute::new("tiny", 50))
            .unwrap();

        let system = "s".repeat(80);
        let user = "u".repeat(2_000);
        ai.execute(Task::Chat, &system, &user, None).unwrap();

        let request = &transport.requests()[0];
        assert_eq!(request.messages[0].content, system);
        let sent = &request.messages[1].content;
        assert!(sent.ends_with(crate::llm::tokens::TRUNCATION_MARKER));
        assert!(count_tokens(sent, "tiny") <= 30);
    }

    #[test]
    fn test_stream_falls_back_when_route_cannot_stream() {
        let transport = Scripted::with_replies(vec![Ok(Completion::text("{\"summary\":\"s\"}"))]);
        let reply = client(Arc::clone(&transport))
            .execute_stream(Task::Summarize, "s", "u", None)
            .unwrap();
        assert!(matches!(reply, ChatReply::Text(_)));
    }

    #[test]
    fn test_stream_is_fused_after_error() {
        let transport = Arc::new(Scripted::default());
        *transport.fragments.lock().unwrap() = Some(vec![
            Ok("a".to_string()),
            Err(Error::ai(ErrorKind::Server, "dropped")),
            Ok("never".to_string()),
        ]);
        let reply = client(Arc::clone(&transport))
            .chat("hi", None, true, None)
            .unwrap();
        let ChatReply::Stream(mut stream) = reply else {
            panic!("expected a stream");
        };

        assert_eq!(stream.next().unwrap().unwrap(), "a");
        assert!(stream.next().unwrap().is_err());
        assert!(stream.is_finished());
        assert!(stream.next().is_none());
        assert!(transport.requests()[0].stream);
    }

    #[test]
    fn test_stream_close_stops_iteration() {
        let transport = Arc::new(Scripted::default());
        *transport.fragments.lock().unwrap() =
            Some(vec![Ok("a".to_string()), Ok("b".to_string())]);
        let ChatReply::Stream(mut stream) = client(transport).chat("hi", None, true, None).unwrap()
        else {
            panic!("expected a stream");
        };

        stream.close();
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_rate_limit_timeout_is_timeout_error() {
        let transport = Scripted::with_replies(vec![Ok(Completion::text("x"))]);
        let ai = AiClient::new(
            Arc::clone(&transport) as Arc<dyn CompletionTransport>,
            Arc::new(ModelRouter::default()),
            Arc::new(RateLimiter::new(0.01)),
            ClientSettings {
                acquire_timeout: Duration::from_millis(10),
                retry: RetryConfig::immediate(0),
                ..ClientSettings::default()
            },
        );
        ai.execute(Task::Chat, "s", "u", None).unwrap();

        let err = ai.execute(Task::Chat, "s", "u", None).unwrap_err();
        assert_eq!(err.ai_kind(), Some(ErrorKind::Timeout));
        assert_eq!(transport.requests().len(), 1);
    }

    #[test]
    fn test_clip_limits_payload() {
        assert_eq!(clip("short"), "short");
        let long = "x".repeat(MAX_LOGGED_PAYLOAD_CHARS + 10);
        assert_eq!(clip(&long).chars().count(), MAX_LOGGED_PAYLOAD_CHARS + 3);
    }
}
