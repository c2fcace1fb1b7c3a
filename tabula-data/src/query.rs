//! Structured query specification.
//!
//! A `QuerySpec` is the language-independent form of a question: filters,
//! grouping with aggregations, projection, ordering, and a row limit. Specs
//! are usually authored by a language model, so parsing is lenient:
//! malformed entries are dropped instead of failing the whole document.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as Json;
use std::collections::BTreeMap;

pub const DEFAULT_LIMIT: usize = 100;
pub const MAX_LIMIT: usize = 500;

/// Clamp a requested limit into `[1, MAX_LIMIT]`.
///
/// Missing, non-numeric, zero, and negative values fall back to `DEFAULT_LIMIT`.
pub fn clamp_limit(raw: Option<&Json>) -> usize {
    let parsed = match raw {
        Some(Json::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Some(Json::String(s)) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    match parsed {
        Some(n) if n >= 1 => (n as u64).min(MAX_LIMIT as u64) as usize,
        _ => DEFAULT_LIMIT,
    }
}

/// Filter operators understood by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Contains,
    DateRange,
}

impl FilterOp {
    /// Parse an operator name or symbol.
    pub fn parse(raw: &str) -> Option<Self> {
        let op = match raw.trim().to_lowercase().as_str() {
            "eq" | "==" | "=" => FilterOp::Eq,
            "neq" | "ne" | "!=" | "<>" => FilterOp::Neq,
            "gt" | ">" => FilterOp::Gt,
            "gte" | "ge" | ">=" => FilterOp::Gte,
            "lt" | "<" => FilterOp::Lt,
            "lte" | "le" | "<=" => FilterOp::Lte,
            "in" => FilterOp::In,
            "contains" => FilterOp::Contains,
            "date_range" | "between" => FilterOp::DateRange,
            _ => return None,
        };
        Some(op)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOp::Eq => "eq",
            FilterOp::Neq => "neq",
            FilterOp::Gt => "gt",
            FilterOp::Gte => "gte",
            FilterOp::Lt => "lt",
            FilterOp::Lte => "lte",
            FilterOp::In => "in",
            FilterOp::Contains => "contains",
            FilterOp::DateRange => "date_range",
        }
    }
}

/// One row filter. The operator is kept verbatim; unknown operators are
/// ignored at execution time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Filter {
    pub column: String,
    pub operator: String,
    pub value: Json,
}

impl Filter {
    pub fn new(column: impl Into<String>, op: FilterOp, value: Json) -> Self {
        Self {
            column: column.into(),
            operator: op.as_str().to_string(),
            value,
        }
    }

    pub fn op(&self) -> Option<FilterOp> {
        FilterOp::parse(&self.operator)
    }

    fn from_json(value: &Json) -> Option<Self> {
        let obj = value.as_object()?;
        let column = obj.get("column")?.as_str()?.to_string();
        let operator = obj
            .get("operator")
            .or_else(|| obj.get("op"))
            .and_then(|o| o.as_str())
            .unwrap_or("eq")
            .to_string();
        let value = obj.get("value").cloned().unwrap_or(Json::Null);
        Some(Self {
            column,
            operator,
            value,
        })
    }
}

/// Aggregation functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggFunc {
    Sum,
    Mean,
    Count,
    Min,
    Max,
    Nunique,
    Median,
    First,
    Last,
}

impl AggFunc {
    pub fn parse(raw: &str) -> Option<Self> {
        let f = match raw.trim().to_lowercase().as_str() {
            "sum" | "total" => AggFunc::Sum,
            "mean" | "avg" | "average" => AggFunc::Mean,
            "count" | "size" => AggFunc::Count,
            "min" => AggFunc::Min,
            "max" => AggFunc::Max,
            "nunique" | "count_distinct" => AggFunc::Nunique,
            "median" => AggFunc::Median,
            "first" => AggFunc::First,
            "last" => AggFunc::Last,
            _ => return None,
        };
        Some(f)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AggFunc::Sum => "sum",
            AggFunc::Mean => "mean",
            AggFunc::Count => "count",
            AggFunc::Min => "min",
            AggFunc::Max => "max",
            AggFunc::Nunique => "nunique",
            AggFunc::Median => "median",
            AggFunc::First => "first",
            AggFunc::Last => "last",
        }
    }
}

/// The function(s) requested for one aggregated column.
///
/// A single function names the output column after the source column;
/// a list produces one `column_function` output per entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AggSpec {
    One(String),
    Many(Vec<String>),
}

impl AggSpec {
    fn from_json(value: &Json) -> Option<Self> {
        match value {
            Json::String(s) => Some(AggSpec::One(s.clone())),
            Json::Array(items) => {
                let names: Vec<String> = items
                    .iter()
                    .filter_map(|i| i.as_str().map(str::to_string))
                    .collect();
                if names.is_empty() {
                    None
                } else {
                    Some(AggSpec::Many(names))
                }
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SortKey {
    pub by: String,
    pub order: SortOrder,
}

impl SortKey {
    fn from_json(value: &Json) -> Option<Self> {
        match value {
            Json::String(by) => Some(Self {
                by: by.clone(),
                order: SortOrder::Asc,
            }),
            Json::Object(obj) => {
                let by = obj
                    .get("by")
                    .or_else(|| obj.get("column"))?
                    .as_str()?
                    .to_string();
                let order = match obj.get("order").and_then(|o| o.as_str()) {
                    Some(o) if o.trim().eq_ignore_ascii_case("desc") => SortOrder::Desc,
                    _ => SortOrder::Asc,
                };
                Some(Self { by, order })
            }
            _ => None,
        }
    }
}

/// A structured query over one dataset. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuerySpec {
    pub filters: Vec<Filter>,
    pub group_by: Vec<String>,
    pub aggregations: BTreeMap<String, AggSpec>,
    pub select: Vec<String>,
    pub sort: Vec<SortKey>,
    pub limit: usize,
}

impl Default for QuerySpec {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
            group_by: Vec::new(),
            aggregations: BTreeMap::new(),
            select: Vec::new(),
            sort: Vec::new(),
            limit: DEFAULT_LIMIT,
        }
    }
}

fn string_list(value: Option<&Json>) -> Vec<String> {
    match value {
        Some(Json::Array(items)) => items
            .iter()
            .filter_map(|i| i.as_str().map(str::to_string))
            .collect(),
        Some(Json::String(s)) => vec![s.clone()],
        _ => Vec::new(),
    }
}

fn object_list<T>(value: Option<&Json>, parse: impl Fn(&Json) -> Option<T>) -> Vec<T> {
    match value {
        Some(Json::Array(items)) => items.iter().filter_map(parse).collect(),
        Some(single @ Json::Object(_)) => parse(single).into_iter().collect(),
        _ => Vec::new(),
    }
}

impl QuerySpec {
    /// Build a spec from arbitrary JSON, dropping anything malformed.
    pub fn from_json(value: &Json) -> Self {
        let Some(obj) = value.as_object() else {
            return Self::default();
        };
        let aggregations = obj
            .get("aggregations")
            .and_then(|a| a.as_object())
            .map(|map| {
                map.iter()
                    .filter_map(|(col, spec)| AggSpec::from_json(spec).map(|s| (col.clone(), s)))
                    .collect()
            })
            .unwrap_or_default();
        Self {
            filters: object_list(obj.get("filters"), Filter::from_json),
            group_by: string_list(obj.get("group_by")),
            aggregations,
            select: string_list(obj.get("select")),
            sort: object_list(obj.get("sort"), SortKey::from_json),
            limit: clamp_limit(obj.get("limit")),
        }
    }

    /// A spec holding only a date-range filter.
    pub fn date_range_only(column: &str, start: &str, end: &str) -> Self {
        Self {
            filters: vec![Filter::new(
                column,
                FilterOp::DateRange,
                serde_json::json!([start, end]),
            )],
            ..Default::default()
        }
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = clamp_limit(Some(&Json::from(limit)));
        self
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Whether any filter targets one of `columns`.
    pub fn filters_any(&self, columns: &[String]) -> bool {
        self.filters.iter().any(|f| columns.contains(&f.column))
    }

    /// Columns referenced anywhere in the spec.
    pub fn referenced_columns(&self) -> Vec<String> {
        let mut cols: Vec<String> = Vec::new();
        let mut push = |c: &String| {
            if !cols.contains(c) {
                cols.push(c.clone());
            }
        };
        self.filters.iter().for_each(|f| push(&f.column));
        self.group_by.iter().for_each(&mut push);
        self.aggregations.keys().for_each(&mut push);
        self.select.iter().for_each(&mut push);
        self.sort.iter().for_each(|s| push(&s.by));
        cols
    }
}

impl<'de> Deserialize<'de> for QuerySpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Json::deserialize(deserializer)?;
        Ok(QuerySpec::from_json(&raw))
    }
}
