//! Error types for the Tabula core library.
//!
//! Uses `thiserror` for public API error types with structured variants
//! covering LLM, tool execution, configuration, dataset, and synthesis domains.

use std::path::PathBuf;

/// Top-level error type for Tabula.
#[derive(Debug, thiserror::Error)]
pub enum TabulaError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Data error: {0}")]
    Data(#[from] DataError),

    #[error("Synthesis error: {0}")]
    Synthesis(#[from] SynthesisError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Provider and transport failures.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("API request failed: {message}")]
    ApiRequest { message: String },

    #[error("API response parse error: {message}")]
    ResponseParse { message: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Provider connection failed: {message}")]
    Connection { message: String },

    #[error("Unsupported provider: {provider}")]
    UnsupportedProvider { provider: String },
}

/// Tool lookup, argument and execution failures.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Tool not found: {name}")]
    NotFound { name: String },

    #[error("Tool already registered: {name}")]
    AlreadyRegistered { name: String },

    #[error("Invalid arguments for tool '{name}': {reason}")]
    InvalidArguments { name: String, reason: String },

    #[error("Tool '{name}' execution failed: {message}")]
    ExecutionFailed { name: String, message: String },

    #[error("Tool '{name}' timed out after {timeout_secs}s")]
    Timeout { name: String, timeout_secs: u64 },
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// Errors raised while loading or validating a dataset.
///
/// `MissingColumns` is the only error that aborts engine construction.
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("Dataset is missing required columns: {}", missing.join(", "))]
    MissingColumns { missing: Vec<String> },

    #[error("Failed to read dataset from {path}: {message}")]
    ReadFailed { path: PathBuf, message: String },

    #[error("Malformed dataset: {message}")]
    Malformed { message: String },

    #[error("Column not found: {column}")]
    ColumnNotFound { column: String },
}

/// Errors from a single synthesis attempt.
#[derive(Debug, thiserror::Error)]
pub enum SynthesisError {
    #[error("Strategy '{strategy}' is not available")]
    Unavailable { strategy: String },

    #[error("Model call failed in '{strategy}': {source}")]
    Model {
        strategy: String,
        #[source]
        source: LlmError,
    },

    #[error("Unusable model output from '{strategy}': {message}")]
    UnusableOutput { strategy: String, message: String },

    #[error("No query specification could be derived from the question")]
    NoSpecification,

    #[error("Procedure execution failed: {message}")]
    Execution { message: String },

    #[error("Agent did not finish within {max_steps} steps")]
    StepBudgetExhausted { max_steps: usize },

    #[error("All synthesis methods failed. Last error: {last_error}")]
    AllFailed { last_error: String },
}

impl SynthesisError {
    /// Short machine-readable tag for the failure kind.
    pub fn kind(&self) -> &'static str {
        match self {
            SynthesisError::Unavailable { .. } => "unavailable",
            SynthesisError::Model { .. } => "model_error",
            SynthesisError::UnusableOutput { .. } => "unusable_output",
            SynthesisError::NoSpecification => "no_specification",
            SynthesisError::Execution { .. } => "execution_error",
            SynthesisError::StepBudgetExhausted { .. } => "step_budget_exhausted",
            SynthesisError::AllFailed { .. } => "synthesis_error",
        }
    }
}

/// A type alias for results using the top-level `TabulaError`.
pub type Result<T> = std::result::Result<T, TabulaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_llm() {
        let err = TabulaError::Llm(LlmError::ApiRequest {
            message: "connection refused".into(),
        });
        assert_eq!(
            err.to_string(),
            "LLM error: API request failed: connection refused"
        );
    }

    #[test]
    fn test_error_display_missing_columns() {
        let err = TabulaError::Data(DataError::MissingColumns {
            missing: vec!["region".into(), "amount".into()],
        });
        assert_eq!(
            err.to_string(),
            "Data error: Dataset is missing required columns: region, amount"
        );
    }

    #[test]
    fn test_synthesis_error_kinds() {
        assert_eq!(SynthesisError::NoSpecification.kind(), "no_specification");
        assert_eq!(
            SynthesisError::Execution {
                message: "boom".into()
            }
            .kind(),
            "execution_error"
        );
        let all = SynthesisError::AllFailed {
            last_error: "bad json".into(),
        };
        assert_eq!(all.kind(), "synthesis_error");
        assert_eq!(
            all.to_string(),
            "All synthesis methods failed. Last error: bad json"
        );
    }

    #[test]
    fn test_error_from_conversions() {
        let err: TabulaError = ToolError::NotFound {
            name: "missing".into(),
        }
        .into();
        assert!(matches!(err, TabulaError::Tool(_)));

        let err: TabulaError = SynthesisError::NoSpecification.into();
        assert!(matches!(err, TabulaError::Synthesis(_)));
    }
}
