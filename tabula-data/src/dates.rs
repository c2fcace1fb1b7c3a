//! Date and range resolution.
//!
//! Turns relative-time phrases in a question into absolute windows, converts
//! columns of mixed-format date-like values into timestamps, and filters a
//! dataset to an inclusive date range.
//!
//! Months are treated as exactly 30 days and years as 365; this is not
//! calendar-aware.

use crate::dataset::{Column, ColumnKind, Dataset, Value};
use chrono::{DateTime, Datelike, Duration, Local, NaiveDate, NaiveDateTime, NaiveTime};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use tracing::{debug, info, warn};

static LAST_WEEK: LazyLock<Regex> = LazyLock::new(|| compile(r"last\s+week"));
static LAST_MONTH: LazyLock<Regex> = LazyLock::new(|| compile(r"last\s+month"));
static LAST_N: LazyLock<Regex> =
    LazyLock::new(|| compile(r"last\s+(\d+)\s+(days?|weeks?|months?)\b"));
static PAST_N: LazyLock<Regex> =
    LazyLock::new(|| compile(r"past\s+(\d+)\s+(days?|weeks?|months?)\b"));
static ISO_LIKE: LazyLock<Regex> = LazyLock::new(|| compile(r"\d{4}-\d{1,2}-\d{1,2}"));
static EPOCH: LazyLock<Regex> = LazyLock::new(|| compile(r"^\d{10}(\d{3})?$"));
static AGO: LazyLock<Regex> =
    LazyLock::new(|| compile(r"^(\d+)\s+(days?|weeks?|months?|years?)\s+ago$"));
static IN_N: LazyLock<Regex> = LazyLock::new(|| compile(r"^in\s+(\d+)\s+(days?|weeks?)$"));

fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|e| panic!("invalid date pattern {pattern}: {e}"))
}

/// Explicit formats tried, in order, on values the tolerant parse rejected.
pub const RECOVERY_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%m/%d/%Y",
    "%d/%m/%Y",
    "%Y-%m-%d %H:%M:%S",
    "%m-%d-%Y",
    "%d-%m-%Y",
];

/// Additional formats accepted when resolving a single date string.
const EXTRA_FORMATS: &[&str] = &["%Y/%m/%d", "%d.%m.%Y", "%m.%d.%Y"];

fn unit_days(unit: &str) -> i64 {
    match unit.trim_end_matches('s') {
        "week" => 7,
        "month" => 30,
        "year" => 365,
        _ => 1,
    }
}

/// Current local wall-clock time.
pub fn now() -> NaiveDateTime {
    Local::now().naive_local()
}

/// Parse a relative-time phrase in `text` against the current time.
pub fn parse_relative_range(text: &str) -> Option<(NaiveDateTime, NaiveDateTime)> {
    parse_relative_range_at(text, now())
}

/// Parse a relative-time phrase in `text` against `now`.
///
/// Fixed phrases win over numeric forms. The window ends at `now` and starts
/// the phrase's length earlier; `None` when nothing matches.
pub fn parse_relative_range_at(
    text: &str,
    now: NaiveDateTime,
) -> Option<(NaiveDateTime, NaiveDateTime)> {
    let lower = text.to_lowercase();

    let days = if LAST_WEEK.is_match(&lower) {
        7
    } else if LAST_MONTH.is_match(&lower) {
        30
    } else {
        let caps = LAST_N.captures(&lower).or_else(|| PAST_N.captures(&lower))?;
        let n: i64 = caps.get(1)?.as_str().parse().ok()?;
        n.checked_mul(unit_days(caps.get(2)?.as_str()))?
    };

    let start = now.checked_sub_signed(Duration::try_days(days)?)?;
    debug!(days, %start, %now, "Resolved relative date window");
    Some((start, now))
}

/// Result of converting one column to timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct DateConversion {
    pub column: Column,
    pub success_rate: f64,
    pub failed_indices: Vec<usize>,
    pub warnings: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Serializable diagnostics of a conversion, without the converted values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionReport {
    pub column: String,
    pub success_rate: f64,
    pub failed_indices: Vec<usize>,
    pub warnings: Vec<String>,
    pub recommendations: Vec<String>,
}

impl DateConversion {
    pub fn report(&self) -> ConversionReport {
        ConversionReport {
            column: self.column.name.clone(),
            success_rate: self.success_rate,
            failed_indices: self.failed_indices.clone(),
            warnings: self.warnings.clone(),
            recommendations: self.recommendations.clone(),
        }
    }
}

fn midnight(date: NaiveDate) -> NaiveDateTime {
    date.and_time(NaiveTime::MIN)
}

/// Tolerant ISO-8601 family parse.
fn parse_iso(s: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_local());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok().map(midnight)
}

fn parse_with_formats(s: &str, formats: &[&str]) -> Option<NaiveDateTime> {
    formats.iter().find_map(|fmt| {
        NaiveDateTime::parse_from_str(s, fmt)
            .ok()
            .or_else(|| NaiveDate::parse_from_str(s, fmt).ok().map(midnight))
    })
}

fn parse_epoch(digits: &str) -> Option<NaiveDateTime> {
    let n: i64 = digits.parse().ok()?;
    let dt = if digits.len() == 13 {
        DateTime::from_timestamp_millis(n)?
    } else {
        DateTime::from_timestamp(n, 0)?
    };
    Some(dt.naive_utc())
}

/// Last-resort recognition: ISO-like substrings, "today"/"now", epoch integers.
fn parse_manual(s: &str, now: NaiveDateTime) -> Option<NaiveDateTime> {
    let lower = s.trim().to_lowercase();
    if lower == "today" || lower == "now" {
        return Some(now);
    }
    if EPOCH.is_match(&lower) {
        return parse_epoch(&lower);
    }
    let m = ISO_LIKE.find(&lower)?;
    NaiveDate::parse_from_str(m.as_str(), "%Y-%m-%d")
        .ok()
        .map(midnight)
}

/// Convert a column of date-like values to timestamps.
///
/// Three strategies run in sequence, each only on values still unconverted:
/// tolerant ISO parsing, the explicit `RECOVERY_FORMATS`, then manual
/// recognition. Nulls stay null and do not count as failures.
pub fn convert_column(values: &[Value], column_name: &str) -> DateConversion {
    convert_column_at(values, column_name, now())
}

pub fn convert_column_at(
    values: &[Value],
    column_name: &str,
    now: NaiveDateTime,
) -> DateConversion {
    let mut converted: Vec<Option<NaiveDateTime>> = values
        .iter()
        .map(|v| match v {
            Value::DateTime(dt) => Some(*dt),
            Value::Text(s) => parse_iso(s.trim()),
            _ => None,
        })
        .collect();

    for (slot, value) in converted.iter_mut().zip(values) {
        if slot.is_none()
            && let Value::Text(s) = value
        {
            *slot = parse_with_formats(s.trim(), RECOVERY_FORMATS);
        }
    }

    for (slot, value) in converted.iter_mut().zip(values) {
        if slot.is_none() {
            *slot = match value {
                Value::Text(s) => parse_manual(s, now),
                Value::Int(i) => parse_manual(&i.to_string(), now),
                _ => None,
            };
        }
    }

    let failed_indices: Vec<usize> = converted
        .iter()
        .zip(values)
        .enumerate()
        .filter(|(_, (slot, original))| slot.is_none() && !original.is_null())
        .map(|(i, _)| i)
        .collect();

    let total = values.len();
    let success_rate = if total == 0 {
        0.0
    } else {
        (total - failed_indices.len()) as f64 / total as f64
    };

    let mut warnings = Vec::new();
    let mut recommendations = Vec::new();
    if !failed_indices.is_empty() {
        warnings.push(format!(
            "{} values could not be converted to datetime",
            failed_indices.len()
        ));
        recommendations.push("Review data quality and consider manual cleanup".to_string());
    }
    if success_rate < 0.8 {
        warnings.push("Low conversion success rate detected".to_string());
        recommendations.push("Consider standardizing date format before processing".to_string());
    }
    if failed_indices.is_empty() {
        recommendations.push("All dates converted successfully".to_string());
    }

    if failed_indices.is_empty() {
        debug!(column = column_name, total, "Date column converted");
    } else {
        warn!(
            column = column_name,
            failed = failed_indices.len(),
            success_rate,
            "Date column partially converted"
        );
    }

    let values: Vec<Value> = converted
        .into_iter()
        .map(|slot| slot.map(Value::DateTime).unwrap_or(Value::Null))
        .collect();

    DateConversion {
        column: Column {
            name: column_name.to_string(),
            kind: ColumnKind::DateTime,
            values,
        },
        success_rate,
        failed_indices,
        warnings,
        recommendations,
    }
}

/// Keep rows whose `column` falls within `[start, end]`, inclusive.
///
/// The column is converted to timestamps in the returned copy when needed;
/// misordered bounds are swapped. A missing column returns the input unchanged.
pub fn filter_range(
    dataset: &Dataset,
    column: &str,
    start: NaiveDateTime,
    end: NaiveDateTime,
) -> Dataset {
    let Some(target) = dataset.column(column) else {
        warn!(column, "Date range filter on missing column ignored");
        return dataset.clone();
    };

    let (start, end) = if start > end { (end, start) } else { (start, end) };

    let converted = if target.kind == ColumnKind::DateTime {
        target.clone()
    } else {
        convert_column(&target.values, column).column
    };

    let keep: Vec<usize> = converted
        .values
        .iter()
        .enumerate()
        .filter_map(|(i, v)| match v {
            Value::DateTime(dt) if start <= *dt && *dt <= end => Some(i),
            _ => None,
        })
        .collect();

    info!(
        column,
        matched = keep.len(),
        total = dataset.row_count(),
        "Date range filter: {}/{} rows match",
        keep.len(),
        dataset.row_count()
    );

    let base = if target.kind == ColumnKind::DateTime {
        dataset.clone()
    } else {
        match dataset.clone().with_column(converted) {
            Ok(ds) => ds,
            Err(e) => {
                warn!(column, error = %e, "Could not replace converted date column");
                dataset.clone()
            }
        }
    };
    base.take_rows(&keep)
}

/// Resolve a single date string, accepting natural phrases.
///
/// Handles direct ISO and known formats, then "today", "yesterday",
/// "tomorrow", "this/last week|month|year", "N units ago", and "in N days|weeks".
pub fn parse_date_value(text: &str, now: NaiveDateTime) -> Option<NaiveDateTime> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Some(dt) = parse_iso(trimmed)
        .or_else(|| parse_with_formats(trimmed, RECOVERY_FORMATS))
        .or_else(|| parse_with_formats(trimmed, EXTRA_FORMATS))
    {
        return Some(dt);
    }

    let lower = trimmed.to_lowercase();
    let today = midnight(now.date());
    let shifted = |days: i64| today.checked_sub_signed(Duration::try_days(days)?);
    let phrase = match lower.as_str() {
        "now" => Some(now),
        "today" => Some(today),
        "yesterday" => shifted(1),
        "tomorrow" => shifted(-1),
        "this week" => shifted(i64::from(now.weekday().num_days_from_monday())),
        "last week" => shifted(7),
        "this month" => NaiveDate::from_ymd_opt(now.year(), now.month(), 1).map(midnight),
        "last month" => shifted(30),
        "this year" => NaiveDate::from_ymd_opt(now.year(), 1, 1).map(midnight),
        "last year" => shifted(365),
        _ => None,
    };
    if phrase.is_some() {
        return phrase;
    }

    if let Some(caps) = AGO.captures(&lower) {
        let n: i64 = caps.get(1)?.as_str().parse().ok()?;
        return shifted(n.checked_mul(unit_days(caps.get(2)?.as_str()))?);
    }
    if let Some(caps) = IN_N.captures(&lower) {
        let n: i64 = caps.get(1)?.as_str().parse().ok()?;
        return shifted(-(n.checked_mul(unit_days(caps.get(2)?.as_str()))?));
    }

    parse_manual(trimmed, now)
}

/// Resolve a cell-like value (as found in filter arguments) to a timestamp.
pub fn value_to_datetime(value: &Value, now: NaiveDateTime) -> Option<NaiveDateTime> {
    match value {
        Value::DateTime(dt) => Some(*dt),
        Value::Text(s) => parse_date_value(s, now),
        Value::Int(i) => parse_manual(&i.to_string(), now),
        _ => None,
    }
}
