//! Dataset profiles and value censoring.
//!
//! A profile describes a dataset's domain: which columns are required,
//! sensitive, dated, or free text, how to clean the raw table, and what to
//! tell the language model about it. `ConfigProfile` builds one from
//! `ProfileConfig`.

use crate::dataset::{Column, ColumnKind, Dataset, Record, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tabula_core::ProfileConfig;
use tracing::warn;

/// Replaces sensitive values before they leave the engine.
pub trait Censor: Send + Sync {
    fn censor(&self, column: &str, value: &str) -> String;
}

/// Leaves every value untouched.
pub struct PassthroughCensor;

impl Censor for PassthroughCensor {
    fn censor(&self, _column: &str, value: &str) -> String {
        value.to_string()
    }
}

/// Swaps values of sensitive columns for a fixed placeholder.
pub struct MaskingCensor {
    sensitive: HashSet<String>,
    mask: String,
}

impl MaskingCensor {
    pub fn new(sensitive: &[String], mask: impl Into<String>) -> Self {
        Self {
            sensitive: sensitive.iter().map(|s| s.to_lowercase()).collect(),
            mask: mask.into(),
        }
    }
}

impl Censor for MaskingCensor {
    fn censor(&self, column: &str, value: &str) -> String {
        if !value.is_empty() && self.sensitive.contains(&column.to_lowercase()) {
            self.mask.clone()
        } else {
            value.to_string()
        }
    }
}

/// Schema and domain knowledge about one dataset.
pub trait DataProfile: Send + Sync {
    fn name(&self) -> &str;
    fn required_columns(&self) -> &[String];
    fn sensitive_columns(&self) -> &[String];
    fn date_columns(&self) -> &[String];
    fn text_columns(&self) -> &[String];

    /// Clean a freshly loaded dataset.
    fn clean(&self, dataset: Dataset) -> Dataset;

    fn system_prompt(&self) -> &str;
    fn schema_hints(&self) -> &str;

    /// Domain hints for agent-style prompts.
    fn domain_context(&self) -> String;

    /// Flat source records for an answer, at most `limit` rows.
    fn create_sources(&self, table: &Dataset, limit: usize) -> Vec<Record>;

    /// Columns that queries may project or group on. Empty means any column.
    fn allowed_columns(&self) -> &[String] {
        self.required_columns()
    }
}

/// A profile driven entirely by configuration.
pub struct ConfigProfile {
    config: ProfileConfig,
    censor: Arc<dyn Censor>,
}

impl ConfigProfile {
    /// Sensitive columns are masked with `config.mask`.
    pub fn new(config: ProfileConfig) -> Self {
        let censor = Arc::new(MaskingCensor::new(&config.sensitive_columns, &config.mask));
        Self { config, censor }
    }

    pub fn with_censor(config: ProfileConfig, censor: Arc<dyn Censor>) -> Self {
        Self { config, censor }
    }

    pub fn config(&self) -> &ProfileConfig {
        &self.config
    }
}

impl Default for ConfigProfile {
    fn default() -> Self {
        Self::new(ProfileConfig::default())
    }
}

impl DataProfile for ConfigProfile {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn required_columns(&self) -> &[String] {
        &self.config.required_columns
    }

    fn sensitive_columns(&self) -> &[String] {
        &self.config.sensitive_columns
    }

    fn date_columns(&self) -> &[String] {
        &self.config.date_columns
    }

    fn text_columns(&self) -> &[String] {
        &self.config.text_columns
    }

    /// Trims text cells everywhere and fills nulls in text columns with "".
    fn clean(&self, dataset: Dataset) -> Dataset {
        let text_columns: HashSet<&str> =
            self.config.text_columns.iter().map(String::as_str).collect();
        let columns: Vec<Column> = dataset
            .columns()
            .iter()
            .map(|c| {
                let fill = text_columns.contains(c.name.as_str());
                let values: Vec<Value> = c
                    .values
                    .iter()
                    .map(|v| match v {
                        Value::Text(s) => Value::Text(s.trim().to_string()),
                        Value::Null if fill => Value::Text(String::new()),
                        other => other.clone(),
                    })
                    .collect();
                let mut cleaned = Column::new(c.name.clone(), values);
                if fill {
                    cleaned.kind = ColumnKind::Text;
                }
                cleaned
            })
            .collect();
        match Dataset::new(columns) {
            Ok(ds) => ds,
            Err(e) => {
                warn!(error = %e, "Profile cleaning produced a ragged table; keeping input");
                dataset
            }
        }
    }

    fn system_prompt(&self) -> &str {
        &self.config.system_prompt
    }

    fn schema_hints(&self) -> &str {
        &self.config.schema_hints
    }

    fn domain_context(&self) -> String {
        let cfg = &self.config;
        if cfg.domain_terminology.is_empty() && cfg.example_queries.is_empty() {
            return "Standard data analysis profile".to_string();
        }
        let mut out = String::new();
        if !cfg.domain_terminology.is_empty() {
            out.push_str(&format!(
                "Domain terminology: {}\n",
                cfg.domain_terminology.join(", ")
            ));
        }
        out.push_str(&format!("Language: {}\n", cfg.language));
        if !cfg.example_queries.is_empty() {
            out.push_str("Example queries:\n");
            for q in cfg.example_queries.iter().take(3) {
                out.push_str(&format!("- {}\n", q));
            }
        }
        out
    }

    /// Lower-cased keys, string values ("" for null), censored.
    fn create_sources(&self, table: &Dataset, limit: usize) -> Vec<Record> {
        let projected = if self.config.source_columns.is_empty() {
            table.clone()
        } else {
            let selected = table.select(&self.config.source_columns);
            if selected.column_count() == 0 {
                table.clone()
            } else {
                selected
            }
        };
        (0..projected.row_count().min(limit))
            .map(|row| {
                projected
                    .columns()
                    .iter()
                    .map(|c| {
                        let raw = c.values[row].to_string();
                        let value = self.censor.censor(&c.name, &raw);
                        (c.name.to_lowercase(), serde_json::Value::String(value))
                    })
                    .collect()
            })
            .collect()
    }
}
