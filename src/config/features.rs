//! Feature flags for optional functionality.

/// Feature flags for controlling optional tutorlog behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureFlags {
    /// Run background summarization and honour the event hook.
    pub summarization: bool,
    /// Attach prompt and response bodies to request telemetry.
    ///
    /// Bodies can contain student data; keep this off outside debugging.
    pub log_payloads: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self::core()
    }
}

impl FeatureFlags {
    /// Creates feature flags with all features disabled.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            summarization: false,
            log_payloads: false,
        }
    }

    /// Creates feature flags with the production defaults.
    #[must_use]
    pub const fn core() -> Self {
        Self {
            summarization: true,
            log_payloads: false,
        }
    }

    /// Creates feature flags with all features enabled.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            summarization: true,
            log_payloads: true,
        }
    }
}
