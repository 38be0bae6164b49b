//! AI request orchestration.
//!
//! The pieces here sit between callers and the remote completion service:
//! [`ModelRouter`] picks a model, [`RateLimiter`] admits the call,
//! [`tokens`] keeps the prompt within budget, [`retry_with_backoff`]
//! absorbs transient failures, and [`AiClient`] ties them together.

mod client;
mod openai;
pub mod prompts;
mod rate_limit;
mod resilience;
mod router;
pub mod tokens;

pub use client::{AiClient, ChatReply, ClientSettings, ReplyStream, TaskResponse};
pub use openai::{OpenAiTransport, SseFragments, classify_status};
pub use prompts::{ClassificationOutput, SkillUpdateOutput, SummaryOutput};
pub use rate_limit::{DEFAULT_QPS, RateLimiter};
pub use resilience::{RetryConfig, retry_with_backoff};
pub use router::{ModelRoute, ModelRouter, Task};

use crate::Result;
use serde::Serialize;

/// Role of one chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Instructions for the model.
    System,
    /// Caller content.
    User,
    /// Prior model output.
    Assistant,
}

/// One role/content message sent to the completion service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    /// Message role.
    pub role: Role,
    /// Message text.
    pub content: String,
}

impl ChatMessage {
    /// Creates a system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    /// Creates a user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// A request to the completion service.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    /// Model identifier.
    pub model: String,
    /// Ordered messages.
    pub messages: Vec<ChatMessage>,
    /// Sampling temperature.
    pub temperature: f32,
    /// Ask for a JSON object reply.
    pub structured_output: bool,
    /// Ask for incremental fragments.
    pub stream: bool,
}

/// A single, whole completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Completion {
    /// Reply text; `None` when the service returned no content.
    pub content: Option<String>,
    /// Prompt tokens reported by the service.
    pub prompt_tokens: Option<u64>,
    /// Completion tokens reported by the service.
    pub completion_tokens: Option<u64>,
}

impl Completion {
    /// Creates a completion carrying only text.
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }
}

/// Incremental reply fragments from a streaming call.
pub type FragmentStream = Box<dyn Iterator<Item = Result<String>> + Send>;

/// The remote completion service.
///
/// Implementations classify every failure into an [`crate::ErrorKind`];
/// the orchestrator never inspects error text.
pub trait CompletionTransport: Send + Sync {
    /// Transport name for logs and metrics.
    fn name(&self) -> &'static str;

    /// Issues a non-streaming request.
    ///
    /// # Errors
    ///
    /// Returns an [`crate::Error::Ai`] describing the failure class.
    fn complete(&self, request: &CompletionRequest) -> Result<Completion>;

    /// Issues a streaming request and returns its fragments lazily.
    ///
    /// # Errors
    ///
    /// Returns an [`crate::Error::Ai`] if the stream cannot be opened.
    fn stream(&self, request: &CompletionRequest) -> Result<FragmentStream>;
}
