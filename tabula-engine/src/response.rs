//! Response builder: renders a query result as answer text, source records,
//! a confidence tier, and summary stats.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tabula_core::ResponseConfig;
use tabula_data::{Column, DataProfile, Dataset, QuerySpec, Record, Value};
use tracing::{debug, warn};

pub const EMPTY_ANSWER: &str = "No matching rows for your request.";

/// Smallest row count the character budget may cut a table down to.
const MIN_ROWS_UNDER_BUDGET: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Confidence::High => write!(f, "high"),
            Confidence::Medium => write!(f, "medium"),
            Confidence::Low => write!(f, "low"),
        }
    }
}

/// A finished result, after any spec has been executed.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    Table(Dataset),
    Scalar(Value),
}

impl QueryResult {
    pub fn is_empty(&self) -> bool {
        match self {
            QueryResult::Table(t) => t.is_empty(),
            QueryResult::Scalar(v) => v.is_null(),
        }
    }
}

impl From<Column> for QueryResult {
    fn from(column: Column) -> Self {
        match Dataset::new(vec![column]) {
            Ok(table) => QueryResult::Table(table),
            Err(_) => QueryResult::Table(Dataset::empty()),
        }
    }
}

/// Shape of a result: rows and columns for tables, the value for scalars.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultStats {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub columns: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl ResultStats {
    pub fn of(result: &QueryResult) -> Self {
        match result {
            QueryResult::Table(t) => Self {
                rows: Some(t.row_count()),
                columns: Some(t.column_count()),
                value: None,
            },
            QueryResult::Scalar(v) => Self {
                value: Some(v.to_string()),
                ..Default::default()
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuiltResponse {
    pub answer: String,
    pub sources: Vec<Record>,
    pub confidence: Confidence,
    pub stats: ResultStats,
    pub query_spec: Option<QuerySpec>,
}

pub struct ResponseBuilder {
    profile: Arc<dyn DataProfile>,
    config: ResponseConfig,
}

impl ResponseBuilder {
    pub fn new(profile: Arc<dyn DataProfile>, config: ResponseConfig) -> Self {
        Self { profile, config }
    }

    pub fn config(&self) -> &ResponseConfig {
        &self.config
    }

    pub fn build_response(
        &self,
        result: Option<&QueryResult>,
        spec: Option<&QuerySpec>,
    ) -> BuiltResponse {
        let query_spec = spec.cloned();
        let Some(result) = result.filter(|r| !r.is_empty()) else {
            return BuiltResponse {
                answer: EMPTY_ANSWER.to_string(),
                sources: Vec::new(),
                confidence: Confidence::Low,
                stats: result.map(ResultStats::of).unwrap_or_default(),
                query_spec,
            };
        };

        let stats = ResultStats::of(result);
        match result {
            QueryResult::Table(table) => {
                let confidence = self.confidence_for(table.row_count());
                BuiltResponse {
                    answer: format_table(table, self.config.max_rows, self.config.max_chars),
                    sources: self.profile.create_sources(table, self.config.sources_limit),
                    confidence,
                    stats,
                    query_spec,
                }
            }
            QueryResult::Scalar(value) => {
                let text = value.to_string();
                let mut source = Record::new();
                source.insert("result".to_string(), serde_json::Value::String(text.clone()));
                BuiltResponse {
                    answer: text,
                    sources: vec![source],
                    confidence: self.confidence_for(1),
                    stats,
                    query_spec,
                }
            }
        }
    }

    fn confidence_for(&self, rows: usize) -> Confidence {
        if rows >= self.config.high_confidence_min_rows {
            Confidence::High
        } else {
            Confidence::Medium
        }
    }

    /// The same CSV rendering, for feeding a table back into a prompt.
    pub fn format_for_prompt(&self, table: &Dataset) -> String {
        format_table(table, self.config.max_rows, self.config.max_chars)
    }
}

/// Render `table` as CSV with a header row.
///
/// At most `max_rows` rows are written; while the text exceeds `max_chars`
/// and more than five rows remain, the row count is halved (never below five).
pub fn format_table(table: &Dataset, max_rows: usize, max_chars: usize) -> String {
    let mut rows = table.row_count().min(max_rows);
    let mut text = match to_csv(table, rows) {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "Failed to format table for display");
            return String::new();
        }
    };
    while text.len() > max_chars && rows > MIN_ROWS_UNDER_BUDGET {
        rows = (rows / 2).max(MIN_ROWS_UNDER_BUDGET);
        text = match to_csv(table, rows) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Failed to format table for display");
                return String::new();
            }
        };
    }
    debug!(rows, chars = text.len(), "Formatted table for display");
    text
}

fn to_csv(table: &Dataset, rows: usize) -> Result<String, csv::Error> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(table.column_names())?;
    for row in 0..rows {
        writer.write_record(table.columns().iter().map(|c| c.values[row].to_string()))?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| csv::Error::from(e.into_error()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tabula_core::ProfileConfig;
    use tabula_data::ConfigProfile;

    fn builder(config: ResponseConfig) -> ResponseBuilder {
        let profile = ConfigProfile::new(ProfileConfig {
            sensitive_columns: vec!["owner".into()],
            ..Default::default()
        });
        ResponseBuilder::new(Arc::new(profile), config)
    }

    fn table(rows: usize) -> Dataset {
        Dataset::new(vec![
            Column::new("id", (0..rows as i64).map(Value::Int).collect()),
            Column::new(
                "owner",
                (0..rows).map(|i| Value::Text(format!("user{}", i))).collect(),
            ),
        ])
        .unwrap()
    }

    #[test]
    fn test_empty_result() {
        let b = builder(ResponseConfig::default());
        let none = b.build_response(None, None);
        assert_eq!(none.answer, EMPTY_ANSWER);
        assert_eq!(none.confidence, Confidence::Low);
        assert!(none.sources.is_empty());

        let empty = b.build_response(Some(&QueryResult::Table(table(0))), None);
        assert_eq!(empty.answer, EMPTY_ANSWER);
        assert_eq!(empty.stats.rows, Some(0));

        let null = b.build_response(Some(&QueryResult::Scalar(Value::Null)), None);
        assert_eq!(null.confidence, Confidence::Low);
    }

    #[test]
    fn test_table_result() {
        let b = builder(ResponseConfig::default());
        let spec = QuerySpec::default().with_limit(3);
        let built = b.build_response(Some(&QueryResult::Table(table(3))), Some(&spec));
        assert_eq!(built.answer, "id,owner\n0,user0\n1,user1\n2,user2\n");
        assert_eq!(built.confidence, Confidence::High);
        assert_eq!(built.sources.len(), 3);
        assert_eq!(built.sources[0]["owner"], "[REDACTED]");
        assert_eq!(built.sources[0]["id"], "0");
        assert_eq!(
            built.stats,
            ResultStats {
                rows: Some(3),
                columns: Some(2),
                value: None
            }
        );
        assert_eq!(built.query_spec.map(|s| s.limit), Some(3));
    }

    #[test]
    fn test_scalar_result() {
        let b = builder(ResponseConfig::default());
        let built = b.build_response(Some(&QueryResult::Scalar(Value::Float(2.5))), None);
        assert_eq!(built.answer, "2.5");
        assert_eq!(built.sources[0]["result"], "2.5");
        assert_eq!(built.stats.value.as_deref(), Some("2.5"));
        assert_eq!(built.confidence, Confidence::High);
    }

    #[test]
    fn test_confidence_threshold_is_configurable() {
        let b = builder(ResponseConfig {
            high_confidence_min_rows: 10,
            ..Default::default()
        });
        let built = b.build_response(Some(&QueryResult::Table(table(4))), None);
        assert_eq!(built.confidence, Confidence::Medium);
    }

    #[test]
    fn test_row_cap_and_sources_limit() {
        let b = builder(ResponseConfig::default());
        let built = b.build_response(Some(&QueryResult::Table(table(80))), None);
        assert_eq!(built.answer.lines().count(), 51);
        assert_eq!(built.sources.len(), 20);
        assert_eq!(built.stats.rows, Some(80));
    }

    #[test]
    fn test_character_budget_halves_rows() {
        // header + 40 rows of ~13 chars; budget forces 40 -> 20 -> 10
        let text = format_table(&table(40), 50, 150);
        assert_eq!(text.lines().count(), 11);

        // never below five rows, even when still over budget
        let text = format_table(&table(40), 50, 10);
        assert_eq!(text.lines().count(), 6);
    }

    #[test]
    fn test_column_becomes_single_column_table() {
        let result = QueryResult::from(Column::new("total", vec![Value::Int(1), Value::Int(2)]));
        let QueryResult::Table(t) = result else {
            panic!("Expected a table");
        };
        assert_eq!(t.column_names(), vec!["total"]);
        assert_eq!(ResultStats::of(&QueryResult::Table(t)).columns, Some(1));
    }
}
