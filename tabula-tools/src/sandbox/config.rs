//! Sandbox limits for procedure execution.

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ---------------------------------------------------------------------------
// ResourceLimits
// ---------------------------------------------------------------------------

/// Resource constraints applied to one procedure run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Maximum number of top-level statements (default: 32).
    pub max_statements: usize,
    /// Evaluation budget; each node costs one unit, vector ops cost one per row
    /// (default: 5,000,000).
    pub max_fuel: u64,
    /// Maximum procedure source length in bytes (default: 16 KiB).
    pub max_source_bytes: usize,
    /// Deepest expression nesting the parser accepts; brackets, unary
    /// operators and each link of an operator or method chain count one level
    /// (default: 64).
    pub max_depth: usize,
    /// Wall-clock limit applied by callers that run the sandbox as a tool
    /// (default: 10 s).
    #[serde(with = "millis")]
    pub max_execution_time: Duration,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_statements: 32,
            max_fuel: 5_000_000,
            max_source_bytes: 16 * 1024,
            max_depth: 64,
            max_execution_time: Duration::from_secs(10),
        }
    }
}

// ---------------------------------------------------------------------------
// SandboxConfig
// ---------------------------------------------------------------------------

/// Configuration for a procedure sandbox.
///
/// ```rust
/// use tabula_tools::sandbox::config::SandboxConfig;
/// use std::time::Duration;
///
/// let config = SandboxConfig::new()
///     .with_statement_limit(16)
///     .with_fuel_limit(200_000)
///     .with_timeout(Duration::from_secs(5))
///     .with_result_variable("answer");
/// assert_eq!(config.result_variable, "answer");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub resource_limits: ResourceLimits,
    /// Name the dataset is bound to.
    pub dataset_variable: String,
    /// Variable whose final value is the procedure's output.
    pub result_variable: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            resource_limits: ResourceLimits::default(),
            dataset_variable: "df".to_string(),
            result_variable: "result".to_string(),
        }
    }
}

impl SandboxConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_statement_limit(mut self, statements: usize) -> Self {
        self.resource_limits.max_statements = statements;
        self
    }

    pub fn with_fuel_limit(mut self, fuel: u64) -> Self {
        self.resource_limits.max_fuel = fuel;
        self
    }

    pub fn with_source_limit(mut self, bytes: usize) -> Self {
        self.resource_limits.max_source_bytes = bytes;
        self
    }

    pub fn with_depth_limit(mut self, depth: usize) -> Self {
        self.resource_limits.max_depth = depth;
        self
    }

    pub fn with_timeout(mut self, duration: Duration) -> Self {
        self.resource_limits.max_execution_time = duration;
        self
    }

    pub fn with_result_variable(mut self, name: impl Into<String>) -> Self {
        self.result_variable = name.into();
        self
    }
}

/// `Duration` as whole milliseconds.
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SandboxConfig::default();
        assert_eq!(config.resource_limits.max_statements, 32);
        assert_eq!(config.resource_limits.max_fuel, 5_000_000);
        assert_eq!(config.resource_limits.max_depth, 64);
        assert_eq!(config.dataset_variable, "df");
        assert_eq!(config.result_variable, "result");
        assert_eq!(SandboxConfig::new(), config);
    }

    #[test]
    fn test_builder_chain() {
        let config = SandboxConfig::new()
            .with_statement_limit(4)
            .with_fuel_limit(99)
            .with_source_limit(128)
            .with_timeout(Duration::from_millis(1500));
        assert_eq!(config.resource_limits.max_statements, 4);
        assert_eq!(config.resource_limits.max_fuel, 99);
        assert_eq!(config.resource_limits.max_source_bytes, 128);
        assert_eq!(
            config.resource_limits.max_execution_time,
            Duration::from_millis(1500)
        );
    }

    #[test]
    fn test_serde_timeout_as_millis() {
        let config = SandboxConfig::new().with_timeout(Duration::from_millis(2500));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["resource_limits"]["max_execution_time"], 2500);

        let back: SandboxConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: SandboxConfig =
            serde_json::from_str(r#"{"resource_limits": {"max_statements": 3}}"#).unwrap();
        assert_eq!(config.resource_limits.max_statements, 3);
        assert_eq!(config.resource_limits.max_fuel, 5_000_000);
        assert_eq!(config.result_variable, "result");
    }
}
