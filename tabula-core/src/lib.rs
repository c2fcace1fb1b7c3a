//! # Tabula Core
//!
//! Shared foundation for the Tabula question-answering engine: the error
//! taxonomy, layered configuration, tracing setup, LLM message types, and the
//! `LlmProvider` abstraction with an OpenAI-compatible implementation.

pub mod brain;
pub mod config;
pub mod error;
pub mod logging;
pub mod providers;
pub mod types;

pub use brain::{LlmProvider, MockLlmProvider};
pub use config::{
    DataConfig, LlmConfig, LoggingConfig, ProfileConfig, ResponseConfig, RetryConfig,
    SynthesisConfig, TabulaConfig, load_config, load_dotenv,
};
pub use error::{
    ConfigError, DataError, LlmError, Result, SynthesisError, TabulaError, ToolError,
};
pub use providers::{OpenAiCompatibleProvider, create_provider, with_retry};
pub use types::{
    CompletionRequest, CompletionResponse, Content, Message, Role, TokenUsage, ToolDefinition,
    ToolOutput,
};
