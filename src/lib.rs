//! # Tutorlog
//!
//! Tutoring interaction log with AI-maintained topic summaries.
//!
//! Tutorlog records tutoring interactions as timestamped events, distills them
//! into per-topic summaries in the background, and answers student questions by
//! sending assembled context to a remote chat-completion service.
//!
//! ## Layers
//!
//! - [`llm`]: model routing, rate limiting, retry with backoff, token budgeting
//!   and the request orchestrator ([`AiClient`])
//! - [`services`]: the summarization update engine, skill updates and the
//!   background refresh scheduler
//! - [`storage`]: the persistent store seam ([`TutorStore`]) with in-memory and
//!   `SQLite` implementations
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tutorlog::{AiClient, ModelRouter, RateLimiter, SummarizationService, TutorConfig};
//! use tutorlog::llm::OpenAiTransport;
//! use tutorlog::storage::SqliteStore;
//!
//! let config = TutorConfig::load_default();
//! let router = Arc::new(ModelRouter::from_config(&config.llm));
//! let limiter = Arc::new(RateLimiter::new(config.llm.rate_limit_qps));
//! let transport = Arc::new(OpenAiTransport::from_config(&config.llm));
//! let client = Arc::new(AiClient::new(transport, router, limiter, config.client_settings()));
//! let store = Arc::new(SqliteStore::new(config.database_path())?);
//! let engine = SummarizationService::new(store, client, config.summarization.clone());
//! let (topic, tokens) = engine.update_topic_summary("derivatives", false)?;
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
#![allow(clippy::multiple_crate_versions)]

use std::fmt;
use thiserror::Error as ThisError;

pub mod config;
pub mod llm;
pub mod models;
pub mod observability;
pub mod services;
pub mod storage;

pub use config::{FeatureFlags, TutorConfig};
pub use llm::{AiClient, ModelRoute, ModelRouter, RateLimiter, Task};
pub use models::{AuditLogEntry, AuditStatus, Event, LogType, SkillState, TopicSummary};
pub use services::{RefreshQueue, RefreshScheduler, SkillService, SummarizationService};
pub use storage::{MemoryStore, SqliteStore, TutorStore};

/// Classification of a failed call to the remote completion service.
///
/// The retry engine dispatches on this tag; it never inspects message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Authentication failure or malformed request (4xx). Not retryable.
    Client,
    /// Server error (5xx) or remote rate limiting (429). Retryable.
    Server,
    /// Transport timeout or rate limiter admission timeout. Retryable.
    Timeout,
    /// The call succeeded but carried no payload. Retryable.
    EmptyResponse,
    /// The payload could not be parsed into structured output. Not retryable.
    Parse,
}

impl ErrorKind {
    /// Returns true when another attempt may succeed.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Server | Self::Timeout | Self::EmptyResponse)
    }

    /// Returns the lowercase label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Server => "server",
            Self::Timeout => "timeout",
            Self::EmptyResponse => "empty_response",
            Self::Parse => "parse",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type for tutorlog operations.
///
/// | Variant | Raised When |
/// |---------|-------------|
/// | `InvalidInput` | Empty topic ids, unknown task names, bad timestamps |
/// | `OperationFailed` | Store queries fail, config files cannot be read, I/O errors |
/// | `Ai` | The remote completion service failed or returned unusable output |
#[derive(Debug, Clone, ThisError)]
pub enum Error {
    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A local operation failed.
    ///
    /// Raised when:
    /// - `SQLite` statements fail
    /// - The config file cannot be read or parsed
    /// - The scheduler thread cannot be spawned
    #[error("operation '{operation}' failed: {cause}")]
    OperationFailed {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },

    /// A call to the remote completion service failed.
    ///
    /// Only this variant is ever retried, and only when
    /// [`ErrorKind::is_retryable`] holds for its kind.
    #[error("ai {kind} error: {message}")]
    Ai {
        /// Failure classification.
        kind: ErrorKind,
        /// Human readable detail.
        message: String,
    },
}

impl Error {
    /// Creates an AI error of the given kind.
    #[must_use]
    pub fn ai(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Ai {
            kind,
            message: message.into(),
        }
    }

    /// Creates an operation failure.
    #[must_use]
    pub fn operation(operation: impl Into<String>, cause: impl fmt::Display) -> Self {
        Self::OperationFailed {
            operation: operation.into(),
            cause: cause.to_string(),
        }
    }

    /// Returns the AI error kind, if this is an AI error.
    #[must_use]
    pub const fn ai_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Ai { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Returns true for AI errors whose kind is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self.ai_kind() {
            Some(kind) => kind.is_retryable(),
            None => false,
        }
    }
}

/// Result type alias for tutorlog operations.
pub type Result<T> = std::result::Result<T, Error>;
