//! Task to model routing.
//!
//! Every logical [`Task`] has one default [`ModelRoute`] and a declared
//! fallback chain. The orchestrator resolves routes here on every call; the
//! fallback chain is published policy only and is never walked automatically.

use crate::config::LlmConfig;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{PoisonError, RwLock};

/// Logical kind of AI request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Task {
    /// Distill a batch of events into a summary.
    #[serde(rename = "summarize_event")]
    Summarize,
    /// Extract topics and skills from content.
    #[serde(rename = "classify_topics")]
    Classify,
    /// Assess mastery change for one skill.
    UpdateSkill,
    /// Answer a student message.
    #[serde(rename = "chat_reply")]
    Chat,
}

impl Task {
    /// All tasks, in declaration order.
    pub const ALL: [Self; 4] = [Self::Summarize, Self::Classify, Self::UpdateSkill, Self::Chat];

    /// Returns the wire name of the task.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Summarize => "summarize_event",
            Self::Classify => "classify_topics",
            Self::UpdateSkill => "update_skill",
            Self::Chat => "chat_reply",
        }
    }

    /// Parses a task from its wire name or short alias.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "summarize_event" | "summarize" => Some(Self::Summarize),
            "classify_topics" | "classify" => Some(Self::Classify),
            "update_skill" | "skill" => Some(Self::UpdateSkill),
            "chat_reply" | "chat" => Some(Self::Chat),
            _ => None,
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Task {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s).ok_or_else(|| Error::InvalidInput(format!("unknown task: {s}")))
    }
}

/// Concrete model configuration bound to a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRoute {
    /// Model identifier sent to the completion service.
    pub model: String,
    /// Maximum approximate prompt tokens.
    pub token_budget: usize,
    /// Whether the model may stream its reply.
    pub supports_streaming: bool,
    /// Whether the model is asked for a JSON object reply.
    pub supports_structured_output: bool,
}

impl ModelRoute {
    /// Creates a route with both capability flags off.
    #[must_use]
    pub fn new(model: impl Into<String>, token_budget: usize) -> Self {
        Self {
            model: model.into(),
            token_budget,
            supports_streaming: false,
            supports_structured_output: false,
        }
    }

    /// Enables streaming.
    #[must_use]
    pub const fn with_streaming(mut self) -> Self {
        self.supports_streaming = true;
        self
    }

    /// Enables structured (JSON) output.
    #[must_use]
    pub const fn with_structured_output(mut self) -> Self {
        self.supports_structured_output = true;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(Error::InvalidInput("route model must not be empty".to_string()));
        }
        if self.token_budget == 0 {
            return Err(Error::InvalidInput("route token budget must be positive".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct RouteTable {
    routes: HashMap<Task, ModelRoute>,
    fallbacks: HashMap<Task, Vec<String>>,
}

/// Maps tasks to routes and fallback chains.
///
/// Shared by reference across the process; `set_route` replaces a default for
/// the lifetime of the router.
#[derive(Debug)]
pub struct ModelRouter {
    table: RwLock<RouteTable>,
}

impl ModelRouter {
    /// Builds the default routing table from model configuration.
    #[must_use]
    pub fn from_config(config: &LlmConfig) -> Self {
        let large = config.default_model.as_str();
        let small = config.nano_model.as_str();
        let large_budget = config.default_budget.max(1);
        let small_budget = config.small_budget.max(1);

        let routes = HashMap::from([
            (
                Task::Summarize,
                ModelRoute::new(large, large_budget).with_structured_output(),
            ),
            (
                Task::Classify,
                ModelRoute::new(small, small_budget).with_structured_output(),
            ),
            (
                Task::UpdateSkill,
                ModelRoute::new(small, small_budget).with_structured_output(),
            ),
            (Task::Chat, ModelRoute::new(large, large_budget).with_streaming()),
        ]);
        let fallbacks = HashMap::from([
            (Task::Summarize, vec![large.to_string(), small.to_string()]),
            (Task::Classify, vec![small.to_string(), large.to_string()]),
            (Task::UpdateSkill, vec![small.to_string(), large.to_string()]),
            (Task::Chat, vec![large.to_string(), small.to_string()]),
        ]);

        Self {
            table: RwLock::new(RouteTable { routes, fallbacks }),
        }
    }

    /// Returns the route for `task`, with only the model replaced when an
    /// override is given. Blank overrides are ignored.
    #[must_use]
    pub fn get_route(&self, task: Task, override_model: Option<&str>) -> ModelRoute {
        let mut route = {
            let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
            table
                .routes
                .get(&task)
                .cloned()
                .unwrap_or_else(|| fallback_route(task))
        };
        if let Some(model) = override_model.map(str::trim).filter(|m| !m.is_empty()) {
            route.model = model.to_string();
        }
        route
    }

    /// Returns the model that would serve `task` by default.
    #[must_use]
    pub fn model_for_task(&self, task: Task) -> String {
        self.get_route(task, None).model
    }

    /// Replaces the default route for `task`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an empty model or a zero budget.
    pub fn set_route(&self, task: Task, route: ModelRoute) -> Result<()> {
        route.validate()?;
        tracing::info!(
            task = task.as_str(),
            model = %route.model,
            token_budget = route.token_budget,
            "Route updated"
        );
        self.table
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .routes
            .insert(task, route);
        Ok(())
    }

    /// Returns a copy of the declared fallback chain for `task`.
    #[must_use]
    pub fn get_fallback_chain(&self, task: Task) -> Vec<String> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        table.fallbacks.get(&task).cloned().unwrap_or_default()
    }
}

impl Default for ModelRouter {
    fn default() -> Self {
        Self::from_config(&LlmConfig::default())
    }
}

fn fallback_route(task: Task) -> ModelRoute {
    let defaults = LlmConfig::default();
    match task {
        Task::Summarize | Task::Chat => {
            ModelRoute::new(defaults.default_model, defaults.default_budget)
        },
        Task::Classify | Task::UpdateSkill => {
            ModelRoute::new(defaults.nano_model, defaults.small_budget)
        },
    }
}
