use std::time::Duration;

use futures::future::BoxFuture;
use tracing::warn;

use stepwise_core::config::RetryConfig;
use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::traits::Generator;
use stepwise_core::types::*;

/// A generator that retries transient failures with exponential backoff.
pub struct RetryingGenerator {
    inner: Box<dyn Generator>,
    retry_config: RetryConfig,
}

impl RetryingGenerator {
    pub fn new(inner: Box<dyn Generator>, retry_config: RetryConfig) -> Self {
        Self {
            inner,
            retry_config,
        }
    }
}

fn is_retryable(e: &StepwiseError) -> bool {
    match e {
        StepwiseError::Generation(msg) => {
            msg.contains("429")
                || msg.contains("500")
                || msg.contains("502")
                || msg.contains("503")
                || msg.contains("timeout")
                || msg.contains("connection")
        }
        _ => false,
    }
}

fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    // Add jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

impl Generator for RetryingGenerator {
    fn generate(&self, request: GenerationRequest) -> BoxFuture<'_, Result<Generation>> {
        Box::pin(async move {
            let max_retries = self.retry_config.max_retries;
            let mut attempt = 0;
            loop {
                match self.inner.generate(request.clone()).await {
                    Ok(generation) => return Ok(generation),
                    Err(e) if is_retryable(&e) && attempt < max_retries => {
                        let backoff = calculate_backoff(attempt, &self.retry_config);
                        warn!(
                            attempt = attempt + 1,
                            max_retries,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %e,
                            "Retrying generation request"
                        );
                        tokio::time::sleep(backoff).await;
                        attempt += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepwise_test_utils::ScriptedGenerator;

    #[test]
    fn retryable_errors() {
        assert!(is_retryable(&StepwiseError::Generation("HTTP 429 Too Many Requests: slow down".into())));
        assert!(is_retryable(&StepwiseError::Generation("HTTP 503 Service Unavailable".into())));
        assert!(is_retryable(&StepwiseError::Generation("connection refused".into())));
        assert!(!is_retryable(&StepwiseError::Generation("HTTP 401 Unauthorized".into())));
        assert!(!is_retryable(&StepwiseError::Registry("bad flow".into())));
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let config = RetryConfig {
            max_retries: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 1000,
        };
        let first = calculate_backoff(0, &config).as_millis();
        assert!((80..=120).contains(&first));
        let third = calculate_backoff(2, &config).as_millis();
        assert!((320..=480).contains(&third));
        let capped = calculate_backoff(10, &config).as_millis();
        assert!(capped <= 1200);
        // Large attempt counts must not overflow.
        assert!(calculate_backoff(u32::MAX, &config).as_millis() <= 1200);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let script = ScriptedGenerator::new(vec![
            Err(StepwiseError::Generation("HTTP 503 Service Unavailable".into())),
            Err(StepwiseError::Generation("HTTP 429 Too Many Requests".into())),
            Ok(Generation::reply("hello")),
        ]);
        let generator = RetryingGenerator::new(Box::new(script), RetryConfig::default());
        let request = GenerationRequest {
            system_prompt: "sys".into(),
            actions: vec![],
            history: vec![ChatMessage::user("hi")],
        };
        let generation = generator.generate(request).await.unwrap();
        assert_eq!(generation.reply, "hello");
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let script = ScriptedGenerator::new(vec![
            Err(StepwiseError::Generation("HTTP 500 a".into())),
            Err(StepwiseError::Generation("HTTP 500 b".into())),
            Ok(Generation::reply("too late")),
        ]);
        let config = RetryConfig {
            max_retries: 1,
            ..RetryConfig::default()
        };
        let generator = RetryingGenerator::new(Box::new(script), config);
        let request = GenerationRequest {
            system_prompt: "sys".into(),
            actions: vec![],
            history: vec![],
        };
        let err = generator.generate(request).await.unwrap_err();
        assert!(matches!(err, StepwiseError::Generation(ref m) if m == "HTTP 500 b"));
    }

    #[tokio::test]
    async fn non_retryable_fails_immediately() {
        let script = ScriptedGenerator::new(vec![
            Err(StepwiseError::Generation("HTTP 401 Unauthorized".into())),
            Ok(Generation::reply("unreachable")),
        ]);
        let generator = RetryingGenerator::new(Box::new(script), RetryConfig::default());
        let request = GenerationRequest {
            system_prompt: "sys".into(),
            actions: vec![],
            history: vec![],
        };
        assert!(generator.generate(request).await.is_err());
    }
}
