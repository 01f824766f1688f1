/// Shared error type for the orchestrator crates.
///
/// Variant names track the error-kind table of the component spec: each
/// corresponds to a row describing where it originates and how callers
/// recover.
#[derive(thiserror::Error, Debug)]
pub enum OrchestratorError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("agent config error: {0}")]
    AgentConfigError(String),

    #[error("in-process provider is not configured")]
    OpenAiNotConfigured,

    #[error("tool iteration limit reached: {iterations}/{max}")]
    ToolIterationLimit { max: u32, iterations: u32 },

    #[error("tool call was interrupted by the user")]
    ToolInterrupted,

    #[error("tool not allowed: {0}")]
    ToolNotAllowed(String),

    #[error("tool call rate limited")]
    RateLimitTools,

    #[error("CLI exited with non-zero status: {code}")]
    CliExitNonzero { code: i32 },

    #[error("CLI emitted a line that was not valid JSON: {line}")]
    UnexpectedNonJson { line: String },

    #[error("failed to spawn subprocess: {0}")]
    SpawnFailed(String),

    #[error("tool interaction timed out")]
    InteractionTimeout,

    #[error("tool interaction registry unavailable")]
    InteractionUnavailable,

    #[error("event session mismatch: expected {expected}, got {actual}")]
    SessionMismatch { expected: String, actual: String },

    #[error("Text input must not be empty")]
    EmptyInput,

    #[error("Session has been deleted")]
    SessionDeleted,

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

impl OrchestratorError {
    /// Stable string code, used in `ChatEvent`/`ServerMessage` error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
            Self::AgentConfigError(_) => "agent_config_error",
            Self::OpenAiNotConfigured => "openai_not_configured",
            Self::ToolIterationLimit { .. } => "tool_iteration_limit",
            Self::ToolInterrupted => "tool_interrupted",
            Self::ToolNotAllowed(_) => "tool_not_allowed",
            Self::RateLimitTools => "rate_limit_tools",
            Self::CliExitNonzero { .. } => "cli_exit_nonzero",
            Self::UnexpectedNonJson { .. } => "unexpected_non_json",
            Self::SpawnFailed(_) => "spawn_failed",
            Self::InteractionTimeout => "interaction_timeout",
            Self::InteractionUnavailable => "interaction_unavailable",
            Self::SessionMismatch { .. } => "session_mismatch",
            Self::EmptyInput => "empty_input",
            Self::SessionDeleted => "session_deleted",
            Self::Provider { .. } => "provider_error",
            Self::Config(_) => "config_error",
            Self::Other(_) => "error",
        }
    }
}
