//! Configuration system for Tabula.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> overrides.
//! Configuration is loaded from the user config directory and/or `.tabula/config.toml`
//! in the workspace directory.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration for a Tabula engine instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TabulaConfig {
    pub llm: LlmConfig,
    pub profile: ProfileConfig,
    pub data: DataConfig,
    pub synthesis: SynthesisConfig,
    pub response: ResponseConfig,
    pub logging: LoggingConfig,
}

/// Configuration for the LLM provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider name: "openai", "ollama", "local", or any OpenAI-compatible endpoint.
    pub provider: String,
    /// Model identifier (e.g., "gpt-4o-mini").
    pub model: String,
    /// Env var read when `api_key` is unset.
    pub api_key_env: String,
    /// Endpoint root, e.g. `http://localhost:11434/v1` for Ollama.
    pub base_url: Option<String>,
    pub max_tokens: usize,
    /// Sampling temperature. Query synthesis wants deterministic output.
    pub temperature: f32,
    /// HTTP request timeout in seconds.
    pub timeout_secs: u64,
    /// Retry policy for transient provider errors.
    pub retry: RetryConfig,
    /// Explicit API key. Never serialized back to disk.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            base_url: None,
            max_tokens: 2048,
            temperature: 0.0,
            timeout_secs: 60,
            retry: RetryConfig::default(),
            api_key: None,
        }
    }
}

/// Exponential backoff settings used by `providers::with_retry`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Declarative description of a dataset's schema and domain.
///
/// Drives column validation at load time, prompt construction, and the
/// projection used for answer sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    pub name: String,
    /// Columns that must exist in the dataset; loading fails otherwise.
    pub required_columns: Vec<String>,
    /// Columns whose values are masked in sources.
    pub sensitive_columns: Vec<String>,
    /// Columns holding dates; the first one receives injected range filters.
    pub date_columns: Vec<String>,
    /// Free-text columns; nulls are normalised to empty strings on load.
    pub text_columns: Vec<String>,
    /// Columns projected into answer sources. Empty means all columns.
    pub source_columns: Vec<String>,
    pub system_prompt: String,
    pub schema_hints: String,
    pub domain_terminology: Vec<String>,
    pub example_queries: Vec<String>,
    pub language: String,
    /// Placeholder written in place of sensitive values.
    pub mask: String,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            name: "default_profile".to_string(),
            required_columns: Vec::new(),
            sensitive_columns: Vec::new(),
            date_columns: Vec::new(),
            text_columns: Vec::new(),
            source_columns: Vec::new(),
            system_prompt: "You are a data analyst answering questions about a single table. \
                            Only use columns that exist in the schema."
                .to_string(),
            schema_hints: String::new(),
            domain_terminology: Vec::new(),
            example_queries: Vec::new(),
            language: "en-US".to_string(),
            mask: "[REDACTED]".to_string(),
        }
    }
}

/// Where and how the dataset is read.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub csv_path: Option<PathBuf>,
    pub delimiter: char,
    /// Convert declared date columns to timestamps on load.
    pub convert_dates: bool,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            csv_path: None,
            delimiter: ',',
            convert_dates: true,
        }
    }
}

/// Strategy selection and bounded-retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    /// "auto" or an explicit strategy name.
    pub default_method: String,
    /// Maximum number of fallback hops after the first attempt.
    pub max_fallback_hops: usize,
    /// Tool-calling rounds the agent strategy may take.
    pub agent_max_steps: usize,
    /// Sample rows included in schema descriptions.
    pub sample_rows: usize,
    /// Statement cap for sandboxed procedures.
    pub max_statements: usize,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            default_method: "auto".to_string(),
            max_fallback_hops: 2,
            agent_max_steps: 8,
            sample_rows: 3,
            max_statements: 32,
        }
    }
}

/// Rendering limits for answers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseConfig {
    pub max_rows: usize,
    pub max_chars: usize,
    pub sources_limit: usize,
    /// Row count at or above which a result is reported with high confidence.
    pub high_confidence_min_rows: usize,
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            max_rows: 50,
            max_chars: 6000,
            sources_limit: 20,
            high_confidence_min_rows: 1,
        }
    }
}

/// Logging output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, overridden by `RUST_LOG` when set.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Load configuration with layered merging.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `TABULA_`)
/// 3. Workspace-local config (`.tabula/config.toml`)
/// 4. User config (`~/.config/tabula/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&TabulaConfig>,
) -> Result<TabulaConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(TabulaConfig::default()));

    if let Some(config_dir) = directories::ProjectDirs::from("dev", "tabula", "tabula") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".tabula").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // TABULA_LLM__MODEL, TABULA_RESPONSE__MAX_ROWS, etc.
    figment = figment.merge(Env::prefixed("TABULA_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

/// Load a `.env` file from the workspace (or the current directory) if present.
pub fn load_dotenv(workspace: Option<&Path>) {
    let loaded = match workspace {
        Some(ws) => dotenvy::from_path(ws.join(".env")).is_ok(),
        None => dotenvy::dotenv().is_ok(),
    };
    if loaded {
        tracing::debug!("Loaded environment from .env");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TabulaConfig::default();
        assert_eq!(config.llm.provider, "openai");
        assert_eq!(config.profile.name, "default_profile");
        assert_eq!(config.response.max_rows, 50);
        assert_eq!(config.response.max_chars, 6000);
        assert_eq!(config.synthesis.max_fallback_hops, 2);
        assert_eq!(config.synthesis.default_method, "auto");
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let config = TabulaConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: TabulaConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(deserialized.llm.model, config.llm.model);
        assert_eq!(deserialized.profile.language, "en-US");
        assert_eq!(deserialized.data.delimiter, ',');
    }

    #[test]
    fn test_api_key_not_serialized() {
        let mut config = TabulaConfig::default();
        config.llm.api_key = Some("sk-secret".into());
        let toml_str = toml::to_string(&config).unwrap();
        assert!(!toml_str.contains("sk-secret"));
    }

    #[test]
    fn test_load_config_with_overrides() {
        let mut overrides = TabulaConfig::default();
        overrides.llm.model = "llama3.1:8b".to_string();
        overrides.response.max_rows = 10;

        let config = load_config(None, Some(&overrides)).unwrap();
        assert_eq!(config.llm.model, "llama3.1:8b");
        assert_eq!(config.response.max_rows, 10);
    }

    #[test]
    fn test_load_config_from_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let tabula_dir = dir.path().join(".tabula");
        std::fs::create_dir_all(&tabula_dir).unwrap();
        std::fs::write(
            tabula_dir.join("config.toml"),
            r#"
[profile]
name = "sales"
required_columns = ["region", "amount"]
date_columns = ["order_date"]

[response]
max_rows = 25
"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(config.profile.name, "sales");
        assert_eq!(config.profile.required_columns, vec!["region", "amount"]);
        assert_eq!(config.profile.date_columns, vec!["order_date"]);
        assert_eq!(config.response.max_rows, 25);
        // untouched sections keep their defaults
        assert_eq!(config.response.max_chars, 6000);
        assert_eq!(config.llm.provider, "openai");
    }
}
