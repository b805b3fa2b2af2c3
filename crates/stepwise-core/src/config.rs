use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StepwiseError};
use crate::types::TerminalKind;

/// Top-level Stepwise configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub store: StoreConfig,
    /// Custom flow. When absent the built-in support flow is used.
    #[serde(default)]
    pub flow: Option<FlowConfig>,
}

/// What to do when a message arrives for a thread that is mid-turn.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicy {
    /// Wait for the in-flight turn to finish (FIFO).
    #[default]
    Queue,
    /// Fail immediately with `ThreadBusy`.
    Reject,
}

/// What to do when one generation requests more than one action.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExtraActionPolicy {
    /// Apply the first action, drop the rest with a warning.
    #[default]
    Ignore,
    /// Fail the whole turn with `InvalidTransition`.
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_generation_timeout")]
    pub generation_timeout_secs: u64,
    #[serde(default)]
    pub busy_policy: BusyPolicy,
    #[serde(default)]
    pub extra_actions: ExtraActionPolicy,
    /// Pass only the most recent N history entries to the generator.
    #[serde(default)]
    pub history_limit: Option<usize>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            generation_timeout_secs: default_generation_timeout(),
            busy_policy: BusyPolicy::default(),
            extra_actions: ExtraActionPolicy::default(),
            history_limit: None,
        }
    }
}

fn default_generation_timeout() -> u64 { 60 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model_id")]
    pub model_id: String,
    /// Falls back to `OPENAI_API_KEY` when unset.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model_id: default_model_id(),
            api_key: None,
            base_url: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            retry: None,
        }
    }
}

fn default_provider() -> String { "openai".to_string() }
fn default_model_id() -> String { "gpt-4.1-mini".to_string() }
fn default_max_tokens() -> u32 { 1024 }
fn default_temperature() -> f32 { 0.0 }

/// Retry configuration for generation requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String { "~/.stepwise/threads.db".to_string() }

impl StoreConfig {
    /// Resolve the database path (expand ~).
    pub fn resolved_path(&self) -> PathBuf {
        expand_home(&self.path)
    }
}

/// A step-gated flow declared in TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Step every new thread starts in.
    pub initial: String,
    #[serde(default)]
    pub steps: Vec<StepConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    pub name: String,
    /// Prompt template; `{fact}` placeholders, `{{`/`}}` escapes.
    pub prompt: String,
    #[serde(default)]
    pub requires: Vec<String>,
    /// Successor reached by this step's record actions.
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub actions: Vec<ActionConfig>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionKindConfig {
    Record,
    Revert,
    Terminal,
}

/// One action entry. Which of the optional fields are required depends on
/// `kind`; the registry checks them when the flow is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionConfig {
    pub name: String,
    pub kind: ActionKindConfig,
    #[serde(default)]
    pub description: String,
    /// Name of the single string argument the generator fills in.
    #[serde(default)]
    pub param: Option<String>,
    /// Record: fact written by this action.
    #[serde(default)]
    pub fact: Option<String>,
    /// Record: allowed values (empty = any non-empty string).
    #[serde(default)]
    pub values: Vec<String>,
    /// Revert: step to go back to.
    #[serde(default)]
    pub target: Option<String>,
    /// Terminal: escalate or resolved.
    #[serde(default)]
    pub outcome: Option<TerminalKind>,
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| StepwiseError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded)
            .map_err(|e| StepwiseError::Config(e.to_string()))
    }

    /// Load config if the file exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_STEPWISE_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_STEPWISE_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_STEPWISE_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_STEPWISE_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_STEPWISE_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.runner.generation_timeout_secs, 60);
        assert_eq!(config.runner.busy_policy, BusyPolicy::Queue);
        assert_eq!(config.runner.extra_actions, ExtraActionPolicy::Ignore);
        assert!(config.runner.history_limit.is_none());
        assert_eq!(config.model.provider, "openai");
        assert_eq!(config.model.model_id, "gpt-4.1-mini");
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert!(config.flow.is_none());
    }

    #[test]
    fn test_runner_policies() {
        let toml_str = r#"
[runner]
generation_timeout_secs = 5
busy_policy = "reject"
extra_actions = "reject"
history_limit = 20
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.runner.generation_timeout_secs, 5);
        assert_eq!(config.runner.busy_policy, BusyPolicy::Reject);
        assert_eq!(config.runner.extra_actions, ExtraActionPolicy::Reject);
        assert_eq!(config.runner.history_limit, Some(20));
    }

    #[test]
    fn test_flow_actions_parse_by_kind() {
        let toml_str = r#"
[flow]
initial = "ask"

[[flow.steps]]
name = "ask"
prompt = "Ask for the order number."
next = "help"

[[flow.steps.actions]]
name = "record_order"
kind = "record"
fact = "order_id"

[[flow.steps]]
name = "help"
prompt = "Order {order_id}."
requires = ["order_id"]

[[flow.steps.actions]]
name = "go_back"
kind = "revert"
target = "ask"

[[flow.steps.actions]]
name = "handoff"
kind = "terminal"
outcome = "escalate"
param = "reason"
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        let flow = config.flow.unwrap();
        assert_eq!(flow.initial, "ask");
        assert_eq!(flow.steps.len(), 2);
        assert_eq!(flow.steps[0].actions[0].kind, ActionKindConfig::Record);
        assert_eq!(flow.steps[0].actions[0].fact.as_deref(), Some("order_id"));
        assert_eq!(flow.steps[1].requires, vec!["order_id"]);
        assert_eq!(flow.steps[1].actions[0].target.as_deref(), Some("ask"));
        assert_eq!(flow.steps[1].actions[1].outcome, Some(TerminalKind::Escalate));
    }

    #[test]
    fn test_store_path_resolution() {
        let store = StoreConfig::default();
        assert!(store.resolved_path().ends_with(".stepwise/threads.db"));

        let absolute = StoreConfig {
            backend: StoreBackend::Sqlite,
            path: "/var/lib/stepwise/threads.db".into(),
        };
        assert_eq!(
            absolute.resolved_path(),
            PathBuf::from("/var/lib/stepwise/threads.db")
        );
    }
}
