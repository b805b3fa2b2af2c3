pub mod providers;
pub mod retry;

use std::sync::Arc;

use stepwise_core::config::ModelConfig;
use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::traits::Generator;

pub use providers::openai::OpenAiGenerator;
pub use retry::RetryingGenerator;

/// Providers reached through the OpenAI-compatible chat-completions API.
pub const OPENAI_COMPATIBLE_PROVIDERS: &[&str] = &[
    "openai",
    "azure",
    "ollama",
    "vllm",
    "lmstudio",
    "groq",
    "openrouter",
    "together",
    "deepseek",
    "openai-compatible",
];

pub fn is_supported_provider(provider: &str) -> bool {
    OPENAI_COMPATIBLE_PROVIDERS
        .iter()
        .any(|p| p.eq_ignore_ascii_case(provider))
}

/// Create the generator described by the model config, wrapped in retries
/// when `[model.retry]` is set.
pub fn create_generator(config: &ModelConfig) -> Result<Arc<dyn Generator>> {
    if !is_supported_provider(&config.provider) {
        return Err(StepwiseError::Config(format!(
            "unsupported model provider '{}' (expected one of: {})",
            config.provider,
            OPENAI_COMPATIBLE_PROVIDERS.join(", ")
        )));
    }

    let primary: Box<dyn Generator> = Box::new(OpenAiGenerator::new(config.clone()));
    Ok(match &config.retry {
        Some(retry) => Arc::new(RetryingGenerator::new(primary, retry.clone())),
        None => Arc::from(primary),
    })
}
