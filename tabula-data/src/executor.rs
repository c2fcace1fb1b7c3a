//! Query executor: applies a `QuerySpec` to a `Dataset`.
//!
//! Stages run in a fixed order (filters, group + aggregate, select, sort,
//! limit). Every stage is best-effort: anything it cannot apply is skipped
//! with a warning and the table from the previous stage flows on unchanged.

use crate::dataset::{Column, ColumnKind, Dataset, Value};
use crate::dates::{self, value_to_datetime};
use crate::query::{AggFunc, AggSpec, Filter, FilterOp, QuerySpec, SortKey, SortOrder};
use chrono::NaiveDateTime;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// The result table plus any warnings raised along the way.
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub table: Dataset,
    pub warnings: Vec<String>,
}

/// Apply `spec` to `dataset`. `date_columns` lists the columns on which
/// `date_range` filters are honoured.
pub fn apply(dataset: &Dataset, spec: &QuerySpec, date_columns: &[String]) -> Dataset {
    execute(dataset, spec, date_columns).table
}

/// Like [`apply`], also returning the warnings of skipped stages.
pub fn execute(dataset: &Dataset, spec: &QuerySpec, date_columns: &[String]) -> Execution {
    execute_at(dataset, spec, date_columns, dates::now())
}

/// Deterministic form of [`execute`] with a fixed reference time for date phrases.
pub fn execute_at(
    dataset: &Dataset,
    spec: &QuerySpec,
    date_columns: &[String],
    now: NaiveDateTime,
) -> Execution {
    let mut warnings = Vec::new();
    let mut table = dataset.clone();

    for filter in &spec.filters {
        table = apply_filter(table, filter, date_columns, now, &mut warnings);
    }

    if !spec.group_by.is_empty() && !spec.aggregations.is_empty() {
        match group_aggregate(&table, &spec.group_by, &spec.aggregations) {
            Ok(grouped) => table = grouped,
            Err(reason) => {
                warn!(reason = %reason, "Aggregation skipped");
                warnings.push(format!("aggregation skipped: {}", reason));
            }
        }
    }

    if !spec.select.is_empty() {
        let selected = table.select(&spec.select);
        if selected.column_count() > 0 {
            table = selected;
        } else {
            debug!(requested = ?spec.select, "No selected columns exist; keeping all");
        }
    }

    if !spec.sort.is_empty() {
        table = sort_by(&table, &spec.sort);
    }

    table = table.head(spec.limit);
    debug!(
        rows = table.row_count(),
        columns = table.column_count(),
        "Query executed"
    );
    Execution { table, warnings }
}

/// A filter operand coerced to the column's domain.
#[derive(Debug, Clone)]
enum Operand {
    Number(f64),
    Text(String),
    Date(NaiveDateTime),
    Bool(bool),
}

fn json_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn coerce(value: &serde_json::Value, kind: ColumnKind, now: NaiveDateTime) -> Option<Operand> {
    match kind {
        ColumnKind::Numeric => match value {
            serde_json::Value::Number(n) => n.as_f64().map(Operand::Number),
            serde_json::Value::String(s) => s.trim().parse::<f64>().ok().map(Operand::Number),
            _ => None,
        },
        ColumnKind::DateTime => value_to_datetime(&Value::from_json(value), now).map(Operand::Date),
        ColumnKind::Boolean => match value {
            serde_json::Value::Bool(b) => Some(Operand::Bool(*b)),
            serde_json::Value::String(s) => match s.trim().to_lowercase().as_str() {
                "true" | "yes" | "1" => Some(Operand::Bool(true)),
                "false" | "no" | "0" => Some(Operand::Bool(false)),
                _ => None,
            },
            _ => None,
        },
        ColumnKind::Text | ColumnKind::Categorical => match value {
            serde_json::Value::Null | serde_json::Value::Array(_) | serde_json::Value::Object(_) => {
                None
            }
            other => Some(Operand::Text(json_text(other))),
        },
    }
}

fn compare_cell(cell: &Value, operand: &Operand) -> Option<Ordering> {
    match operand {
        Operand::Number(n) => cell.as_f64().map(|c| c.total_cmp(n)),
        Operand::Date(d) => cell.as_datetime().map(|c| c.cmp(d)),
        Operand::Bool(b) => match cell {
            Value::Bool(c) => Some(c.cmp(b)),
            _ => None,
        },
        Operand::Text(t) => {
            if cell.is_null() {
                None
            } else {
                Some(cell.to_string().as_str().cmp(t.as_str()))
            }
        }
    }
}

fn apply_filter(
    table: Dataset,
    filter: &Filter,
    date_columns: &[String],
    now: NaiveDateTime,
    warnings: &mut Vec<String>,
) -> Dataset {
    let Some(column) = table.column(&filter.column) else {
        debug!(column = %filter.column, "Filter on missing column dropped");
        return table;
    };
    let Some(op) = filter.op() else {
        warn!(operator = %filter.operator, "Unknown filter operator ignored");
        warnings.push(format!("unknown operator '{}' ignored", filter.operator));
        return table;
    };

    let keep: Vec<usize> = match op {
        FilterOp::DateRange => {
            if !date_columns.contains(&filter.column) {
                warnings.push(format!(
                    "date_range ignored on non-date column '{}'",
                    filter.column
                ));
                return table;
            }
            let bounds = filter.value.as_array().and_then(|b| {
                let start = value_to_datetime(&Value::from_json(b.first()?), now)?;
                let end = value_to_datetime(&Value::from_json(b.get(1)?), now)?;
                Some((start, end))
            });
            let Some((start, end)) = bounds else {
                warnings.push(format!(
                    "date_range on '{}' needs two parseable dates",
                    filter.column
                ));
                return table;
            };
            return dates::filter_range(&table, &filter.column, start, end);
        }
        FilterOp::Contains => {
            let needle = json_text(&filter.value).to_lowercase();
            column
                .values
                .iter()
                .enumerate()
                .filter(|(_, v)| !v.is_null() && v.to_string().to_lowercase().contains(&needle))
                .map(|(i, _)| i)
                .collect()
        }
        FilterOp::In => {
            let items = match &filter.value {
                serde_json::Value::Array(items) => items.clone(),
                other => vec![other.clone()],
            };
            let operands: Vec<Operand> = items
                .iter()
                .filter_map(|i| coerce(i, column.kind, now))
                .collect();
            if operands.is_empty() {
                warnings.push(format!(
                    "'in' filter on '{}' has no usable values",
                    filter.column
                ));
                return table.take_rows(&[]);
            }
            column
                .values
                .iter()
                .enumerate()
                .filter(|(_, v)| {
                    operands
                        .iter()
                        .any(|o| compare_cell(v, o) == Some(Ordering::Equal))
                })
                .map(|(i, _)| i)
                .collect()
        }
        cmp_op => {
            let Some(operand) = coerce(&filter.value, column.kind, now) else {
                warn!(
                    column = %filter.column,
                    kind = %column.kind,
                    operator = %filter.operator,
                    "Filter value does not match column type"
                );
                warnings.push(format!(
                    "value {} does not fit {} column '{}'",
                    filter.value, column.kind, filter.column
                ));
                // No cell can equal a value the column cannot hold.
                return match cmp_op {
                    FilterOp::Eq => table.take_rows(&[]),
                    _ => table,
                };
            };
            column
                .values
                .iter()
                .enumerate()
                .filter(|(_, v)| {
                    let ord = compare_cell(v, &operand);
                    match cmp_op {
                        FilterOp::Eq => ord == Some(Ordering::Equal),
                        FilterOp::Neq => ord != Some(Ordering::Equal),
                        FilterOp::Gt => ord == Some(Ordering::Greater),
                        FilterOp::Gte => matches!(ord, Some(Ordering::Greater | Ordering::Equal)),
                        FilterOp::Lt => ord == Some(Ordering::Less),
                        FilterOp::Lte => matches!(ord, Some(Ordering::Less | Ordering::Equal)),
                        _ => false,
                    }
                })
                .map(|(i, _)| i)
                .collect()
        }
    };

    table.take_rows(&keep)
}

/// Group `table` by `group_by` and aggregate; errors name the first problem.
pub fn group_aggregate(
    table: &Dataset,
    group_by: &[String],
    aggregations: &std::collections::BTreeMap<String, AggSpec>,
) -> Result<Dataset, String> {
    let key_columns: Vec<&Column> = group_by
        .iter()
        .map(|g| {
            table
                .column(g)
                .ok_or_else(|| format!("unknown group column '{}'", g))
        })
        .collect::<Result<_, _>>()?;

    let mut plan: Vec<(&Column, AggFunc, String)> = Vec::new();
    for (col, spec) in aggregations {
        let column = table
            .column(col)
            .ok_or_else(|| format!("unknown aggregation column '{}'", col))?;
        let (names, single) = match spec {
            AggSpec::One(f) => (vec![f.clone()], true),
            AggSpec::Many(fs) => (fs.clone(), false),
        };
        for name in names {
            let func =
                AggFunc::parse(&name).ok_or_else(|| format!("unknown aggregation '{}'", name))?;
            let out = if single {
                col.clone()
            } else {
                format!("{}_{}", col, func.as_str())
            };
            plan.push((column, func, out));
        }
    }

    // Rows with a null key are dropped, matching usual group-by semantics.
    let mut order: Vec<Vec<Value>> = Vec::new();
    let mut members: HashMap<String, Vec<usize>> = HashMap::new();
    for row in 0..table.row_count() {
        let key: Vec<Value> = key_columns.iter().map(|c| c.values[row].clone()).collect();
        if key.iter().any(Value::is_null) {
            continue;
        }
        let id = format!("{:?}", key);
        members
            .entry(id)
            .or_insert_with(|| {
                order.push(key.clone());
                Vec::new()
            })
            .push(row);
    }
    order.sort_by(|a, b| compare_rows(a, b));

    let mut key_values: Vec<Vec<Value>> = vec![Vec::with_capacity(order.len()); key_columns.len()];
    let mut agg_values: Vec<Vec<Value>> = vec![Vec::with_capacity(order.len()); plan.len()];
    for key in &order {
        let rows = members
            .get(&format!("{:?}", key))
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        for (slot, v) in key_values.iter_mut().zip(key) {
            slot.push(v.clone());
        }
        for (slot, (column, func, _)) in agg_values.iter_mut().zip(&plan) {
            let cells: Vec<&Value> = rows
                .iter()
                .map(|&r| &column.values[r])
                .filter(|v| !v.is_null())
                .collect();
            slot.push(aggregate(&cells, *func, &column.name)?);
        }
    }

    let mut columns: Vec<Column> = key_columns
        .iter()
        .zip(key_values)
        .map(|(c, values)| Column::new(c.name.clone(), values))
        .collect();
    columns.extend(
        plan.iter()
            .zip(agg_values)
            .map(|((_, _, name), values)| Column::new(name.clone(), values)),
    );
    Dataset::new(columns).map_err(|e| e.to_string())
}

fn compare_rows(a: &[Value], b: &[Value]) -> Ordering {
    a.iter()
        .zip(b)
        .map(|(x, y)| x.compare(y))
        .find(|o| *o != Ordering::Equal)
        .unwrap_or(Ordering::Equal)
}

fn numbers(cells: &[&Value], func: AggFunc, column: &str) -> Result<Vec<f64>, String> {
    cells
        .iter()
        .map(|v| {
            v.as_f64().ok_or_else(|| {
                format!(
                    "cannot {} non-numeric column '{}'",
                    func.as_str(),
                    column
                )
            })
        })
        .collect()
}

/// Aggregate non-null `cells` of `column` with `func`.
pub fn aggregate(cells: &[&Value], func: AggFunc, column: &str) -> Result<Value, String> {
    let value = match func {
        AggFunc::Count => Value::Int(cells.len() as i64),
        AggFunc::Nunique => {
            let distinct: HashSet<String> = cells.iter().map(|v| format!("{:?}", v)).collect();
            Value::Int(distinct.len() as i64)
        }
        AggFunc::Sum => {
            if cells.iter().all(|v| matches!(v, Value::Int(_))) {
                let mut total: i64 = 0;
                for v in cells {
                    if let Value::Int(i) = v {
                        total = total
                            .checked_add(*i)
                            .ok_or_else(|| format!("sum of '{}' overflows", column))?;
                    }
                }
                Value::Int(total)
            } else {
                Value::Float(numbers(cells, func, column)?.iter().sum())
            }
        }
        AggFunc::Mean => {
            let nums = numbers(cells, func, column)?;
            if nums.is_empty() {
                Value::Null
            } else {
                Value::Float(nums.iter().sum::<f64>() / nums.len() as f64)
            }
        }
        AggFunc::Median => {
            let mut nums = numbers(cells, func, column)?;
            if nums.is_empty() {
                Value::Null
            } else {
                nums.sort_by(|a, b| a.total_cmp(b));
                let mid = nums.len() / 2;
                if nums.len() % 2 == 0 {
                    Value::Float((nums[mid - 1] + nums[mid]) / 2.0)
                } else {
                    Value::Float(nums[mid])
                }
            }
        }
        AggFunc::Min => cells
            .iter()
            .min_by(|a, b| a.compare(b))
            .map(|v| (*v).clone())
            .unwrap_or(Value::Null),
        AggFunc::Max => cells
            .iter()
            .max_by(|a, b| a.compare(b))
            .map(|v| (*v).clone())
            .unwrap_or(Value::Null),
        AggFunc::First => cells.first().map(|v| (*v).clone()).unwrap_or(Value::Null),
        AggFunc::Last => cells.last().map(|v| (*v).clone()).unwrap_or(Value::Null),
    };
    Ok(value)
}

/// Stable multi-key sort, nulls last. Keys naming absent columns are ignored.
pub fn sort_by(table: &Dataset, keys: &[SortKey]) -> Dataset {
    let keys: Vec<(usize, SortOrder)> = keys
        .iter()
        .filter_map(|k| {
            table
                .columns()
                .iter()
                .position(|c| c.name == k.by)
                .map(|i| (i, k.order))
        })
        .collect();
    if keys.is_empty() {
        return table.clone();
    }
    sort_table(table, &keys)
}

fn sort_table(table: &Dataset, keys: &[(usize, SortOrder)]) -> Dataset {
    let columns = table.columns();
    let mut indices: Vec<usize> = (0..table.row_count()).collect();
    indices.sort_by(|&a, &b| {
        for &(col, order) in keys {
            let (x, y) = (&columns[col].values[a], &columns[col].values[b]);
            let ord = match (x.is_null(), y.is_null()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) => match order {
                    SortOrder::Asc => x.compare(y),
                    SortOrder::Desc => y.compare(x),
                },
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
    table.take_rows(&indices)
}
