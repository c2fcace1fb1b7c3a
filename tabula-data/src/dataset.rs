//! In-memory tabular dataset: typed cell values, named columns, and kind inference.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use tabula_core::DataError;

/// A single cell value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    DateTime(NaiveDateTime),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric view of the value, if it is a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<NaiveDateTime> {
        match self {
            Value::DateTime(dt) => Some(*dt),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_))
    }

    /// Sniff a raw text cell into the narrowest matching value.
    ///
    /// Empty and whitespace-only cells become `Null`. Dates are only recognised
    /// in plain ISO form here; mixed formats are handled by date conversion.
    pub fn parse_cell(raw: &str) -> Value {
        let s = raw.trim();
        if s.is_empty() {
            return Value::Null;
        }
        if let Ok(i) = s.parse::<i64>() {
            return Value::Int(i);
        }
        if let Ok(f) = s.parse::<f64>()
            && f.is_finite()
        {
            return Value::Float(f);
        }
        match s.to_ascii_lowercase().as_str() {
            "true" => return Value::Bool(true),
            "false" => return Value::Bool(false),
            _ => {}
        }
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
            return Value::DateTime(dt);
        }
        if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
            return Value::DateTime(d.and_time(NaiveTime::MIN));
        }
        Value::Text(s.to_string())
    }

    /// Convert from a JSON value. Arrays and objects are stored as their JSON text.
    pub fn from_json(value: &serde_json::Value) -> Value {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => n.as_f64().map(Value::Float).unwrap_or(Value::Null),
            },
            serde_json::Value::String(s) => Value::Text(s.clone()),
            other => Value::Text(other.to_string()),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::DateTime(_) => serde_json::Value::String(self.to_string()),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Bool(_) => 0,
            Value::Int(_) | Value::Float(_) => 1,
            Value::DateTime(_) => 2,
            Value::Text(_) => 3,
            Value::Null => 4,
        }
    }

    /// Total order used for sorting and grouping. Nulls sort last,
    /// numbers compare across `Int`/`Float`.
    pub fn compare(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (a, b) if a.is_numeric() && b.is_numeric() => {
                let (x, y) = (a.as_f64().unwrap_or(0.0), b.as_f64().unwrap_or(0.0));
                x.total_cmp(&y)
            }
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::DateTime(a), Value::DateTime(b)) => a.cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(s) => f.write_str(s),
            Value::DateTime(dt) => {
                if dt.time() == NaiveTime::MIN {
                    write!(f, "{}", dt.format("%Y-%m-%d"))
                } else {
                    write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S"))
                }
            }
        }
    }
}

/// Semantic type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Text,
    Numeric,
    DateTime,
    Categorical,
    Boolean,
}

impl fmt::Display for ColumnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ColumnKind::Text => "text",
            ColumnKind::Numeric => "numeric",
            ColumnKind::DateTime => "datetime",
            ColumnKind::Categorical => "categorical",
            ColumnKind::Boolean => "boolean",
        };
        f.write_str(s)
    }
}

/// Text columns with at most this many distinct values may be categorical.
const CATEGORICAL_MAX_DISTINCT: usize = 50;

/// Infer the kind of a column from its values.
pub fn infer_kind(values: &[Value]) -> ColumnKind {
    let non_null: Vec<&Value> = values.iter().filter(|v| !v.is_null()).collect();
    if non_null.is_empty() {
        return ColumnKind::Text;
    }
    if non_null.iter().all(|v| v.is_numeric()) {
        return ColumnKind::Numeric;
    }
    if non_null.iter().all(|v| matches!(v, Value::DateTime(_))) {
        return ColumnKind::DateTime;
    }
    if non_null.iter().all(|v| matches!(v, Value::Bool(_))) {
        return ColumnKind::Boolean;
    }
    let distinct: HashSet<String> = non_null.iter().map(|v| v.to_string()).collect();
    if distinct.len() <= CATEGORICAL_MAX_DISTINCT && distinct.len() * 2 <= non_null.len() {
        ColumnKind::Categorical
    } else {
        ColumnKind::Text
    }
}

/// A named, typed column.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
    pub values: Vec<Value>,
}

impl Column {
    /// Create a column, inferring its kind.
    pub fn new(name: impl Into<String>, values: Vec<Value>) -> Self {
        let kind = infer_kind(&values);
        Self {
            name: name.into(),
            kind,
            values,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn null_count(&self) -> usize {
        self.values.iter().filter(|v| v.is_null()).count()
    }

    /// New column holding the given rows, in order.
    pub fn take(&self, indices: &[usize]) -> Column {
        Column {
            name: self.name.clone(),
            kind: self.kind,
            values: indices
                .iter()
                .filter_map(|&i| self.values.get(i).cloned())
                .collect(),
        }
    }
}

/// Per-column statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnStats {
    pub name: String,
    pub kind: ColumnKind,
    pub null_count: usize,
    pub unique_count: usize,
    pub min: Option<serde_json::Value>,
    pub max: Option<serde_json::Value>,
    pub mean: Option<f64>,
}

/// Dataset-level summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSummary {
    pub total_rows: usize,
    pub total_columns: usize,
    pub column_names: Vec<String>,
    pub data_types: BTreeMap<String, ColumnKind>,
    pub null_counts: BTreeMap<String, usize>,
}

/// A JSON record keyed by column name.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// An ordered collection of named columns with a uniform row count.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    columns: Vec<Column>,
}

impl Dataset {
    /// Build a dataset, rejecting columns of unequal length.
    pub fn new(columns: Vec<Column>) -> Result<Self, DataError> {
        if let Some(first) = columns.first() {
            let expected = first.len();
            if let Some(bad) = columns.iter().find(|c| c.len() != expected) {
                return Err(DataError::Malformed {
                    message: format!(
                        "column '{}' has {} rows, expected {}",
                        bad.name,
                        bad.len(),
                        expected
                    ),
                });
            }
        }
        Ok(Self { columns })
    }

    /// Build a dataset from row-major values. Short rows are padded with nulls.
    pub fn from_rows(names: &[String], rows: Vec<Vec<Value>>) -> Result<Self, DataError> {
        let mut buffers: Vec<Vec<Value>> = vec![Vec::with_capacity(rows.len()); names.len()];
        for (line, row) in rows.into_iter().enumerate() {
            if row.len() > names.len() {
                return Err(DataError::Malformed {
                    message: format!(
                        "row {} has {} fields, header has {}",
                        line + 1,
                        row.len(),
                        names.len()
                    ),
                });
            }
            let mut cells = row.into_iter();
            for buffer in buffers.iter_mut() {
                buffer.push(cells.next().unwrap_or(Value::Null));
            }
        }
        Self::new(
            names
                .iter()
                .zip(buffers)
                .map(|(name, values)| Column::new(name.clone(), values))
                .collect(),
        )
    }

    /// Build a dataset from JSON records; column order follows first appearance.
    pub fn from_records(records: &[Record]) -> Result<Self, DataError> {
        let mut names: Vec<String> = Vec::new();
        for record in records {
            for key in record.keys() {
                if !names.contains(key) {
                    names.push(key.clone());
                }
            }
        }
        let rows = records
            .iter()
            .map(|r| {
                names
                    .iter()
                    .map(|n| r.get(n).map(Value::from_json).unwrap_or(Value::Null))
                    .collect()
            })
            .collect();
        Self::from_rows(&names, rows)
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn row_count(&self) -> usize {
        self.columns.first().map(|c| c.len()).unwrap_or(0)
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.row_count() == 0
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Cell at (row, column name).
    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        self.column(column).and_then(|c| c.values.get(row))
    }

    /// Replace (or append) a column with the same name.
    pub fn with_column(mut self, column: Column) -> Result<Self, DataError> {
        if !self.columns.is_empty() && column.len() != self.row_count() {
            return Err(DataError::Malformed {
                message: format!(
                    "column '{}' has {} rows, expected {}",
                    column.name,
                    column.len(),
                    self.row_count()
                ),
            });
        }
        match self.columns.iter_mut().find(|c| c.name == column.name) {
            Some(existing) => *existing = column,
            None => self.columns.push(column),
        }
        Ok(self)
    }

    /// New dataset containing only the given rows, in the given order.
    pub fn take_rows(&self, indices: &[usize]) -> Dataset {
        Dataset {
            columns: self.columns.iter().map(|c| c.take(indices)).collect(),
        }
    }

    /// First `n` rows.
    pub fn head(&self, n: usize) -> Dataset {
        let indices: Vec<usize> = (0..self.row_count().min(n)).collect();
        self.take_rows(&indices)
    }

    /// Keep only the named columns that exist, in the requested order.
    pub fn select(&self, names: &[String]) -> Dataset {
        let mut seen = HashSet::new();
        Dataset {
            columns: names
                .iter()
                .filter(|n| seen.insert(n.as_str()))
                .filter_map(|n| self.column(n).cloned())
                .collect(),
        }
    }

    /// Rows as JSON records, up to `limit`.
    pub fn records(&self, limit: usize) -> Vec<Record> {
        (0..self.row_count().min(limit))
            .map(|row| {
                self.columns
                    .iter()
                    .map(|c| (c.name.clone(), c.values[row].to_json()))
                    .collect()
            })
            .collect()
    }

    pub fn summary(&self) -> DatasetSummary {
        DatasetSummary {
            total_rows: self.row_count(),
            total_columns: self.column_count(),
            column_names: self.column_names(),
            data_types: self
                .columns
                .iter()
                .map(|c| (c.name.clone(), c.kind))
                .collect(),
            null_counts: self
                .columns
                .iter()
                .map(|c| (c.name.clone(), c.null_count()))
                .collect(),
        }
    }

    pub fn column_stats(&self, name: &str) -> Option<ColumnStats> {
        let column = self.column(name)?;
        let non_null: Vec<&Value> = column.values.iter().filter(|v| !v.is_null()).collect();
        let unique_count = non_null
            .iter()
            .map(|v| v.to_string())
            .collect::<HashSet<_>>()
            .len();
        let min = non_null
            .iter()
            .min_by(|a, b| a.compare(b))
            .map(|v| v.to_json());
        let max = non_null
            .iter()
            .max_by(|a, b| a.compare(b))
            .map(|v| v.to_json());
        let numbers: Vec<f64> = non_null.iter().filter_map(|v| v.as_f64()).collect();
        let mean = if column.kind == ColumnKind::Numeric && !numbers.is_empty() {
            Some(numbers.iter().sum::<f64>() / numbers.len() as f64)
        } else {
            None
        };
        Some(ColumnStats {
            name: column.name.clone(),
            kind: column.kind,
            null_count: column.null_count(),
            unique_count,
            min,
            max,
            mean,
        })
    }

    /// Describe the schema and a few sample rows for a language model prompt.
    pub fn describe(&self, sample_rows: usize) -> String {
        let mut out = format!(
            "Table with {} rows and {} columns.\nColumns:\n",
            self.row_count(),
            self.column_count()
        );
        for column in &self.columns {
            out.push_str(&format!("- {} ({})\n", column.name, column.kind));
        }
        if sample_rows > 0 && !self.is_empty() {
            let sample = serde_json::Value::Array(
                self.records(sample_rows)
                    .into_iter()
                    .map(serde_json::Value::Object)
                    .collect(),
            );
            out.push_str("Sample rows:\n");
            out.push_str(&sample.to_string());
            out.push('\n');
        }
        out
    }

    /// Issues worth flagging before handing the table to generated code.
    pub fn quality_issues(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if self.is_empty() {
            issues.push("dataset has no rows".to_string());
            return issues;
        }
        for column in &self.columns {
            if column.null_count() == column.len() {
                issues.push(format!("column '{}' contains only nulls", column.name));
            }
        }
        if self.column_count() > 100 {
            issues.push(format!(
                "dataset is wide ({} columns); prefer selecting columns explicitly",
                self.column_count()
            ));
        }
        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> Dataset {
        let names = vec!["region".to_string(), "amount".to_string()];
        Dataset::from_rows(
            &names,
            vec![
                vec![Value::Text("north".into()), Value::Int(10)],
                vec![Value::Text("south".into()), Value::Float(2.5)],
                vec![Value::Text("north".into()), Value::Null],
                vec![Value::Text("north".into()), Value::Int(7)],
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_parse_cell_sniffing() {
        assert_eq!(Value::parse_cell(" 42 "), Value::Int(42));
        assert_eq!(Value::parse_cell("2.5"), Value::Float(2.5));
        assert_eq!(Value::parse_cell("TRUE"), Value::Bool(true));
        assert_eq!(Value::parse_cell(""), Value::Null);
        assert!(matches!(
            Value::parse_cell("2024-03-01"),
            Value::DateTime(_)
        ));
        assert_eq!(
            Value::parse_cell("03/01/2024"),
            Value::Text("03/01/2024".into())
        );
    }

    #[test]
    fn test_infer_kind() {
        assert_eq!(
            infer_kind(&[Value::Int(1), Value::Float(2.0), Value::Null]),
            ColumnKind::Numeric
        );
        assert_eq!(
            infer_kind(&[Value::Text("a".into()), Value::Text("b".into())]),
            ColumnKind::Text
        );
        let repeated: Vec<Value> = (0..10)
            .map(|i| Value::Text(if i % 2 == 0 { "x" } else { "y" }.into()))
            .collect();
        assert_eq!(infer_kind(&repeated), ColumnKind::Categorical);
        assert_eq!(infer_kind(&[Value::Null]), ColumnKind::Text);
    }

    #[test]
    fn test_compare_orders_nulls_last_and_mixes_numbers() {
        assert_eq!(Value::Int(2).compare(&Value::Float(2.5)), Ordering::Less);
        assert_eq!(Value::Null.compare(&Value::Int(1)), Ordering::Greater);
        assert_eq!(
            Value::Text("a".into()).compare(&Value::Text("b".into())),
            Ordering::Less
        );
    }

    #[test]
    fn test_dataset_rejects_ragged_columns() {
        let err = Dataset::new(vec![
            Column::new("a", vec![Value::Int(1)]),
            Column::new("b", vec![]),
        ])
        .unwrap_err();
        assert!(matches!(err, DataError::Malformed { .. }));
    }

    #[test]
    fn test_select_ignores_unknown_and_duplicates() {
        let ds = sample();
        let selected = ds.select(&["amount".into(), "missing".into(), "amount".into()]);
        assert_eq!(selected.column_names(), vec!["amount"]);
        assert_eq!(selected.row_count(), 4);
    }

    #[test]
    fn test_summary() {
        let summary = sample().summary();
        assert_eq!(summary.total_rows, 4);
        assert_eq!(summary.total_columns, 2);
        assert_eq!(summary.null_counts["amount"], 1);
        assert_eq!(summary.data_types["amount"], ColumnKind::Numeric);
    }

    #[test]
    fn test_column_stats() {
        let stats = sample().column_stats("amount").unwrap();
        assert_eq!(stats.null_count, 1);
        assert_eq!(stats.unique_count, 3);
        assert_eq!(stats.min, Some(serde_json::json!(2.5)));
        assert_eq!(stats.max, Some(serde_json::json!(10)));
        let mean = stats.mean.unwrap();
        assert!((mean - 19.5 / 3.0).abs() < 1e-9);
        assert!(sample().column_stats("nope").is_none());
    }

    #[test]
    fn test_records_and_from_records() {
        let ds = sample();
        let records = ds.records(2);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["region"], serde_json::json!("north"));
        let back = Dataset::from_records(&records).unwrap();
        assert_eq!(back.column_names(), vec!["amount", "region"]);
        assert_eq!(back.row_count(), 2);
    }

    #[test]
    fn test_datetime_display() {
        let dt = NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert_eq!(Value::DateTime(dt).to_string(), "2024-01-02");
        let dt = dt + chrono::Duration::hours(5);
        assert_eq!(Value::DateTime(dt).to_string(), "2024-01-02 05:00:00");
    }

    #[test]
    fn test_quality_issues() {
        let ds = Dataset::new(vec![
            Column::new("a", vec![Value::Int(1), Value::Int(2)]),
            Column::new("b", vec![Value::Null, Value::Null]),
        ])
        .unwrap();
        assert_eq!(ds.quality_issues(), vec!["column 'b' contains only nulls"]);
        assert_eq!(Dataset::empty().quality_issues(), vec!["dataset has no rows"]);
    }
}
