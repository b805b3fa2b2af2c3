use thiserror::Error;

#[derive(Debug, Error)]
pub enum StepwiseError {
    // Flow errors
    #[error("Precondition violated: step '{step}' requires missing fact(s): {}", missing.join(", "))]
    PreconditionViolation { step: String, missing: Vec<String> },

    #[error("Template binding failed: step '{step}' references unbound fact '{fact}'")]
    TemplateBinding { step: String, fact: String },

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Unknown step: {0}")]
    UnknownStep(String),

    #[error("Step registry error: {0}")]
    Registry(String),

    // Generation errors
    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("Generation timed out after {0}s")]
    GenerationTimeout(u64),

    // Runner errors
    #[error("Thread busy: {0} already has a turn in flight")]
    ThreadBusy(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StepwiseError {
    /// Whether the caller may retry the turn unchanged.
    ///
    /// Only failures that happen before any state is written qualify.
    /// Registry and precondition errors are configuration bugs and retrying
    /// them would fail the same way.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Generation(_) | Self::GenerationTimeout(_) | Self::ThreadBusy(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, StepwiseError>;
