//! Aggregator configuration
//!
//! Resolved once at startup and shared read-only by every run.

use crate::error::{Result, StreamError};

/// Step that emits the final narrative summary.
pub const SUMMARY_STEP: &str = "summarize";

/// Step that emits the final structured render.
pub const RENDER_STEP: &str = "data_render";

/// Default client notice when a run is stopped.
pub const DEFAULT_STOPPED_MESSAGE: &str = "\n> This message has been stopped";

/// Default prefix of the failure envelope.
pub const DEFAULT_ERROR_PREFIX: &str = "An error occurred during processing: ";

/// Default reserved key under which recommendations are merged.
pub const DEFAULT_RECOMMENDATION_KEY: &str = "recommendations";

/// Default intent label stored with each transcript.
pub const DEFAULT_INTENT_KIND: &str = "database_qa";

/// Default capacity of the bounded client channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Configuration shared by all runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatorConfig {
    /// Wrap narrative steps in collapsible sections and forward them.
    ///
    /// When `false` only the output of terminal steps (see
    /// `StepResolver::is_terminal`) reaches the client.
    pub show_sections: bool,

    /// Informational notice sent when a run is stopped.
    pub stopped_message: String,

    /// Prefix of the failure envelope text.
    pub error_prefix: String,

    /// Replace failure detail with `masked_error_message`.
    pub mask_errors: bool,

    /// Text used when `mask_errors` is `true`.
    ///
    /// If `None`, "internal error" is used.
    pub masked_error_message: Option<String>,

    /// Key under which recommendations are merged into the business buffer.
    pub recommendation_key: String,

    /// Intent label stored with each transcript.
    pub intent_kind: String,

    /// Capacity of the bounded client channel used by `RunDriver::spawn`.
    pub channel_capacity: usize,

    /// Tools offered to engines that declare tool support.
    pub allowed_tools: Vec<String>,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            show_sections: true,
            stopped_message: DEFAULT_STOPPED_MESSAGE.to_string(),
            error_prefix: DEFAULT_ERROR_PREFIX.to_string(),
            mask_errors: false,
            masked_error_message: None,
            recommendation_key: DEFAULT_RECOMMENDATION_KEY.to_string(),
            intent_kind: DEFAULT_INTENT_KIND.to_string(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            allowed_tools: Vec::new(),
        }
    }
}

impl AggregatorConfig {
    /// Create a new builder.
    pub fn builder() -> AggregatorConfigBuilder {
        AggregatorConfigBuilder::default()
    }

    /// Load config from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `SHOW_THINKING_PROCESS` - `true` (any case) shows sections, anything else hides them
    /// - `STEPSTREAM_MASK_ERRORS` - `true` masks failure detail
    /// - `STEPSTREAM_ALLOWED_TOOLS` - comma-separated tool names
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(show) = lookup("SHOW_THINKING_PROCESS") {
            config.show_sections = show.trim().eq_ignore_ascii_case("true");
        }

        if let Some(mask) = lookup("STEPSTREAM_MASK_ERRORS") {
            config.mask_errors = mask.trim().eq_ignore_ascii_case("true");
        }

        if let Some(tools) = lookup("STEPSTREAM_ALLOWED_TOOLS") {
            config.allowed_tools = tools
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect();
        }

        config
    }

    /// Text of the failure envelope for `err`.
    pub fn failure_message(&self, err: &StreamError) -> String {
        if self.mask_errors {
            let masked = self
                .masked_error_message
                .clone()
                .unwrap_or_else(|| "internal error".to_string());
            format!("{}{}", self.error_prefix, masked)
        } else {
            format!("{}{}", self.error_prefix, err.user_message())
        }
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.channel_capacity == 0 {
            return Err(StreamError::Config(
                "channel capacity must be greater than zero".to_string(),
            ));
        }
        if self.recommendation_key.is_empty() {
            return Err(StreamError::Config(
                "recommendation key cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for `AggregatorConfig`.
#[derive(Debug, Default)]
pub struct AggregatorConfigBuilder {
    config: AggregatorConfig,
}

impl AggregatorConfigBuilder {
    /// Show or hide narrative sections.
    pub fn show_sections(mut self, show: bool) -> Self {
        self.config.show_sections = show;
        self
    }

    /// Set the stopped notice.
    pub fn stopped_message(mut self, message: impl Into<String>) -> Self {
        self.config.stopped_message = message.into();
        self
    }

    /// Set the failure prefix.
    pub fn error_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.error_prefix = prefix.into();
        self
    }

    /// Mask failure detail, optionally with a custom message.
    pub fn mask_errors(mut self, mask: bool, message: Option<String>) -> Self {
        self.config.mask_errors = mask;
        self.config.masked_error_message = message;
        self
    }

    /// Set the reserved recommendation key.
    pub fn recommendation_key(mut self, key: impl Into<String>) -> Self {
        self.config.recommendation_key = key.into();
        self
    }

    /// Set the persisted intent label.
    pub fn intent_kind(mut self, intent: impl Into<String>) -> Self {
        self.config.intent_kind = intent.into();
        self
    }

    /// Set the client channel capacity.
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.channel_capacity = capacity;
        self
    }

    /// Set the tools offered to tool-capable engines.
    pub fn allowed_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.allowed_tools = tools.into_iter().map(Into::into).collect();
        self
    }

    /// Build and validate the configuration.
    pub fn build(self) -> Result<AggregatorConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn default_config() {
        let config = AggregatorConfig::default();
        assert!(config.show_sections);
        assert_eq!(config.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn show_sections_env_is_case_insensitive() {
        let config = AggregatorConfig::from_lookup(lookup(&[("SHOW_THINKING_PROCESS", "TRUE")]));
        assert!(config.show_sections);

        let config = AggregatorConfig::from_lookup(lookup(&[("SHOW_THINKING_PROCESS", "no")]));
        assert!(!config.show_sections);
    }

    #[test]
    fn allowed_tools_env_is_split_and_trimmed() {
        let config = AggregatorConfig::from_lookup(lookup(&[(
            "STEPSTREAM_ALLOWED_TOOLS",
            " Read, Bash ,,Skill",
        )]));
        assert_eq!(config.allowed_tools, vec!["Read", "Bash", "Skill"]);
    }

    #[test]
    fn masked_failure_hides_detail() {
        let config = AggregatorConfig::builder()
            .mask_errors(true, Some("try again later".into()))
            .build()
            .unwrap();
        let msg = config.failure_message(&StreamError::Engine("db password wrong".into()));
        assert!(msg.ends_with("try again later"));
        assert!(!msg.contains("password"));
    }

    #[test]
    fn unmasked_failure_carries_detail() {
        let config = AggregatorConfig::default();
        let msg = config.failure_message(&StreamError::Engine("boom".into()));
        assert_eq!(msg, format!("{DEFAULT_ERROR_PREFIX}Engine error: boom"));
    }

    #[test]
    fn builder_rejects_zero_capacity() {
        let err = AggregatorConfig::builder().channel_capacity(0).build();
        assert!(matches!(err, Err(StreamError::Config(_))));
    }
}
