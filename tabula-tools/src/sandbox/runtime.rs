//! Tree-walking interpreter for parsed procedures.
//!
//! The only state a procedure can touch is its own variable table, seeded
//! with the dataset. Every name, method, and attribute is resolved against a
//! fixed allow-list; anything else is a [`SandboxError::CapabilityDenied`].
//! Evaluation is metered: each node costs the size of the value it produces.

use super::config::SandboxConfig;
use super::parser::{BinaryOp, DENIED_NAMES, Expr, Literal, Statement, Target, UnaryOp};
use chrono::{Datelike, NaiveDateTime, NaiveTime};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use tabula_data::dates::value_to_datetime;
use tabula_data::query::{AggFunc, AggSpec, SortKey, SortOrder};
use tabula_data::{Column, ColumnKind, Dataset, Value, aggregate, group_aggregate, sort_by};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that can occur while parsing or running a procedure.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SandboxError {
    #[error("syntax error on line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("procedure is {size} bytes, limit is {limit}")]
    SourceTooLarge { size: usize, limit: usize },

    #[error("procedure has {count} statements, limit is {limit}")]
    TooManyStatements { count: usize, limit: usize },

    #[error("syntax error on line {line}: expression nesting exceeds {limit} levels")]
    TooDeep { line: usize, limit: usize },

    /// The procedure reached for something outside the allow-list.
    #[error("capability denied: {0}")]
    CapabilityDenied(String),

    #[error("name '{0}' is not defined")]
    UndefinedName(String),

    /// A runtime failure; `line` is 0 until the owning statement is known.
    #[error("execution failed on line {line}: {message}")]
    ExecutionFailed { line: usize, message: String },

    #[error("evaluation budget exhausted")]
    OutOfFuel,

    #[error("procedure did not assign '{0}'")]
    MissingResult(String),
}

impl SandboxError {
    fn at_line(self, line: usize) -> Self {
        match self {
            SandboxError::ExecutionFailed { line: 0, message } => {
                SandboxError::ExecutionFailed { line, message }
            }
            other => other,
        }
    }
}

fn fail(message: impl Into<String>) -> SandboxError {
    SandboxError::ExecutionFailed {
        line: 0,
        message: message.into(),
    }
}

fn denied(message: impl Into<String>) -> SandboxError {
    SandboxError::CapabilityDenied(message.into())
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// The value a procedure assigned to its result variable, classified by shape.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcedureOutput {
    Table(Dataset),
    Column(Column),
    Scalar(Value),
}

impl ProcedureOutput {
    pub fn kind(&self) -> &'static str {
        match self {
            ProcedureOutput::Table(_) => "table",
            ProcedureOutput::Column(_) => "column",
            ProcedureOutput::Scalar(_) => "scalar",
        }
    }
}

impl fmt::Display for ProcedureOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcedureOutput::Table(t) => write!(f, "{}", Obj::Table(t.clone())),
            ProcedureOutput::Column(c) => write!(f, "{}", Obj::Column(c.clone())),
            ProcedureOutput::Scalar(v) => write!(f, "{}", Obj::Scalar(v.clone())),
        }
    }
}

/// Result of a completed run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub output: ProcedureOutput,
    /// Text written with `print`.
    pub stdout: String,
    pub fuel_consumed: u64,
}

// ---------------------------------------------------------------------------
// Runtime values
// ---------------------------------------------------------------------------

const BUILTINS: &[&str] = &[
    "len", "int", "float", "str", "bool", "round", "abs", "min", "max", "sum", "list", "sorted",
    "print",
];

#[derive(Debug, Clone)]
enum Obj {
    Scalar(Value),
    List(Vec<Value>),
    Dict(Vec<(String, Obj)>),
    Table(Dataset),
    Column(Column),
    GroupBy {
        table: Dataset,
        keys: Vec<String>,
        selection: Option<Vec<String>>,
    },
    Str(Column),
    Dt(Column),
    ILoc(Box<Obj>),
    Builtin(&'static str),
}

impl Obj {
    fn type_name(&self) -> &'static str {
        match self {
            Obj::Scalar(Value::Null) => "None",
            Obj::Scalar(Value::Bool(_)) => "bool",
            Obj::Scalar(Value::Int(_)) => "int",
            Obj::Scalar(Value::Float(_)) => "float",
            Obj::Scalar(Value::Text(_)) => "str",
            Obj::Scalar(Value::DateTime(_)) => "datetime",
            Obj::List(_) => "list",
            Obj::Dict(_) => "dict",
            Obj::Table(_) => "table",
            Obj::Column(_) => "column",
            Obj::GroupBy { .. } => "groupby",
            Obj::Str(_) => "str accessor",
            Obj::Dt(_) => "dt accessor",
            Obj::ILoc(_) => "iloc indexer",
            Obj::Builtin(_) => "builtin",
        }
    }

    /// Evaluation cost of producing this value.
    fn weight(&self) -> u64 {
        let n = match self {
            Obj::Table(t) | Obj::GroupBy { table: t, .. } => t.row_count(),
            Obj::Column(c) | Obj::Str(c) | Obj::Dt(c) => c.len(),
            Obj::List(v) => v.len(),
            Obj::Dict(d) => d.len(),
            _ => 1,
        };
        n.max(1) as u64
    }

    fn truthy(&self) -> Result<bool, SandboxError> {
        match self {
            Obj::Scalar(v) => Ok(match v {
                Value::Null => false,
                Value::Bool(b) => *b,
                Value::Int(i) => *i != 0,
                Value::Float(f) => *f != 0.0,
                Value::Text(s) => !s.is_empty(),
                Value::DateTime(_) => true,
            }),
            Obj::List(v) => Ok(!v.is_empty()),
            other => Err(fail(format!(
                "the truth value of a {} is ambiguous; use & and | for masks",
                other.type_name()
            ))),
        }
    }

    fn into_output(self, name: &str) -> ProcedureOutput {
        match self {
            Obj::Table(t) => ProcedureOutput::Table(t),
            Obj::Column(c) => ProcedureOutput::Column(c),
            Obj::Scalar(v) => ProcedureOutput::Scalar(v),
            Obj::List(values) => ProcedureOutput::Column(Column::new(name, values)),
            other => ProcedureOutput::Scalar(Value::Text(other.to_string())),
        }
    }
}

const PREVIEW_ROWS: usize = 10;

fn scalar_text(value: &Value) -> String {
    match value {
        Value::Null => "None".to_string(),
        other => other.to_string(),
    }
}

impl fmt::Display for Obj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Obj::Scalar(v) => f.write_str(&scalar_text(v)),
            Obj::List(values) => {
                let items: Vec<String> = values.iter().map(scalar_text).collect();
                write!(f, "[{}]", items.join(", "))
            }
            Obj::Dict(entries) => {
                let items: Vec<String> = entries
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k, v))
                    .collect();
                write!(f, "{{{}}}", items.join(", "))
            }
            Obj::Table(t) => {
                writeln!(f, "{}", t.column_names().join("\t"))?;
                for row in 0..t.row_count().min(PREVIEW_ROWS) {
                    let cells: Vec<String> = t
                        .columns()
                        .iter()
                        .map(|c| scalar_text(&c.values[row]))
                        .collect();
                    writeln!(f, "{}", cells.join("\t"))?;
                }
                if t.row_count() > PREVIEW_ROWS {
                    writeln!(f, "... ({} rows)", t.row_count())?;
                }
                Ok(())
            }
            Obj::Column(c) | Obj::Str(c) | Obj::Dt(c) => {
                let items: Vec<String> = c
                    .values
                    .iter()
                    .take(PREVIEW_ROWS)
                    .map(scalar_text)
                    .collect();
                let more = if c.len() > PREVIEW_ROWS { ", ..." } else { "" };
                write!(f, "{}: [{}{}]", c.name, items.join(", "), more)
            }
            Obj::GroupBy { keys, .. } => write!(f, "<groupby {}>", keys.join(", ")),
            Obj::ILoc(_) => f.write_str("<iloc>"),
            Obj::Builtin(name) => write!(f, "<builtin {}>", name),
        }
    }
}

// ---------------------------------------------------------------------------
// Call arguments
// ---------------------------------------------------------------------------

struct Args {
    positional: Vec<Obj>,
    keyword: Vec<(String, Obj)>,
}

impl Args {
    fn get(&self, index: usize, name: &str) -> Option<&Obj> {
        self.positional.get(index).or_else(|| {
            self.keyword
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v)
        })
    }

    fn require(&self, index: usize, name: &str, method: &str) -> Result<&Obj, SandboxError> {
        self.get(index, name)
            .ok_or_else(|| fail(format!("{}() is missing argument '{}'", method, name)))
    }

    fn usize_or(&self, index: usize, name: &str, default: usize) -> Result<usize, SandboxError> {
        match self.get(index, name) {
            None | Some(Obj::Scalar(Value::Null)) => Ok(default),
            Some(Obj::Scalar(Value::Int(i))) if *i >= 0 => Ok(*i as usize),
            Some(other) => Err(fail(format!(
                "'{}' must be a non-negative integer, got {}",
                name,
                other.type_name()
            ))),
        }
    }

    fn bool_or(&self, index: usize, name: &str, default: bool) -> Result<bool, SandboxError> {
        match self.get(index, name) {
            None => Ok(default),
            Some(obj) => obj.truthy(),
        }
    }

    fn text(&self, index: usize, name: &str, method: &str) -> Result<String, SandboxError> {
        match self.require(index, name, method)? {
            Obj::Scalar(Value::Text(s)) => Ok(s.clone()),
            other => Err(fail(format!(
                "{}() expects '{}' to be a string, got {}",
                method,
                name,
                other.type_name()
            ))),
        }
    }

    /// A string or list of strings; `None` when absent.
    fn names(&self, index: usize, name: &str) -> Result<Option<Vec<String>>, SandboxError> {
        match self.get(index, name) {
            None | Some(Obj::Scalar(Value::Null)) => Ok(None),
            Some(obj) => names_of(obj).map(Some),
        }
    }
}

fn names_of(obj: &Obj) -> Result<Vec<String>, SandboxError> {
    match obj {
        Obj::Scalar(Value::Text(s)) => Ok(vec![s.clone()]),
        Obj::List(items) => items
            .iter()
            .map(|v| match v {
                Value::Text(s) => Ok(s.clone()),
                other => Err(fail(format!("expected column names, got {}", scalar_text(other)))),
            })
            .collect(),
        other => Err(fail(format!(
            "expected a column name or list of names, got {}",
            other.type_name()
        ))),
    }
}

// ---------------------------------------------------------------------------
// Interpreter
// ---------------------------------------------------------------------------

/// Runs one procedure against one dataset.
pub struct Interpreter<'a> {
    config: &'a SandboxConfig,
    vars: HashMap<String, Obj>,
    fuel_used: u64,
    stdout: String,
    now: NaiveDateTime,
}

impl<'a> Interpreter<'a> {
    /// `now` anchors date phrases such as "last week" in comparisons.
    pub fn new(config: &'a SandboxConfig, dataset: &Dataset, now: NaiveDateTime) -> Self {
        let mut vars = HashMap::new();
        vars.insert(
            config.dataset_variable.clone(),
            Obj::Table(dataset.clone()),
        );
        Self {
            config,
            vars,
            fuel_used: 0,
            stdout: String::new(),
            now,
        }
    }

    /// Execute `program` and return the classified result variable.
    pub fn run(mut self, program: &[Statement]) -> Result<RunOutcome, SandboxError> {
        let limit = self.config.resource_limits.max_statements;
        if program.len() > limit {
            return Err(SandboxError::TooManyStatements {
                count: program.len(),
                limit,
            });
        }
        for statement in program {
            self.statement(statement)
                .map_err(|e| e.at_line(statement.line))?;
        }
        let name = self.config.result_variable.clone();
        let result = self
            .vars
            .remove(&name)
            .ok_or_else(|| SandboxError::MissingResult(name.clone()))?;
        Ok(RunOutcome {
            output: result.into_output(&name),
            stdout: self.stdout,
            fuel_consumed: self.fuel_used,
        })
    }

    fn charge(&mut self, units: u64) -> Result<(), SandboxError> {
        self.fuel_used = self.fuel_used.saturating_add(units);
        if self.fuel_used > self.config.resource_limits.max_fuel {
            Err(SandboxError::OutOfFuel)
        } else {
            Ok(())
        }
    }

    fn statement(&mut self, statement: &Statement) -> Result<(), SandboxError> {
        let value = self.eval(&statement.expr)?;
        match &statement.target {
            None => Ok(()),
            Some(Target::Name(name)) => {
                if BUILTINS.contains(&name.as_str()) {
                    return Err(denied(format!("cannot rebind builtin '{}'", name)));
                }
                self.vars.insert(name.clone(), value);
                Ok(())
            }
            Some(Target::Column { table, column }) => {
                let Some(Obj::Table(current)) = self.vars.get(table) else {
                    return Err(fail(format!("'{}' is not a table", table)));
                };
                let rows = current.row_count();
                let values = match value {
                    Obj::Column(c) if c.len() == rows => c.values,
                    Obj::List(v) if v.len() == rows => v,
                    Obj::Scalar(v) => vec![v; rows],
                    other => {
                        return Err(fail(format!(
                            "cannot assign a {} of this length to column '{}'",
                            other.type_name(),
                            column
                        )));
                    }
                };
                let updated = current
                    .clone()
                    .with_column(Column::new(column.clone(), values))
                    .map_err(|e| fail(e.to_string()))?;
                self.charge(rows as u64)?;
                self.vars.insert(table.clone(), Obj::Table(updated));
                Ok(())
            }
        }
    }

    fn eval(&mut self, expr: &Expr) -> Result<Obj, SandboxError> {
        let value = match expr {
            Expr::Literal(lit) => Obj::Scalar(match lit {
                Literal::Int(i) => Value::Int(*i),
                Literal::Float(f) => Value::Float(*f),
                Literal::Str(s) => Value::Text(s.clone()),
                Literal::Bool(b) => Value::Bool(*b),
                Literal::None => Value::Null,
            }),
            Expr::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    match self.eval(item)? {
                        Obj::Scalar(v) => values.push(v),
                        other => {
                            return Err(fail(format!(
                                "lists may only hold scalars, got {}",
                                other.type_name()
                            )));
                        }
                    }
                }
                Obj::List(values)
            }
            Expr::Dict(entries) => {
                let mut out = Vec::with_capacity(entries.len());
                for (key, value) in entries {
                    let key = match self.eval(key)? {
                        Obj::Scalar(v) => scalar_text(&v),
                        other => {
                            return Err(fail(format!(
                                "dict keys must be scalars, got {}",
                                other.type_name()
                            )));
                        }
                    };
                    let value = self.eval(value)?;
                    out.push((key, value));
                }
                Obj::Dict(out)
            }
            Expr::Name(name) => self.lookup(name)?,
            Expr::Attr { target, name } => {
                let target = self.eval(target)?;
                self.attribute(target, name)?
            }
            Expr::Call { func, args, kwargs } => {
                let mut positional = Vec::with_capacity(args.len());
                for arg in args {
                    positional.push(self.eval(arg)?);
                }
                let mut keyword = Vec::with_capacity(kwargs.len());
                for (name, arg) in kwargs {
                    keyword.push((name.clone(), self.eval(arg)?));
                }
                let args = Args {
                    positional,
                    keyword,
                };
                match func.as_ref() {
                    Expr::Attr { target, name } => {
                        let receiver = self.eval(target)?;
                        self.call_method(receiver, name, &args)?
                    }
                    other => match self.eval(other)? {
                        Obj::Builtin(name) => self.call_builtin(name, &args)?,
                        value => {
                            return Err(fail(format!(
                                "'{}' object is not callable",
                                value.type_name()
                            )));
                        }
                    },
                }
            }
            Expr::Index { target, index } => {
                let target = self.eval(target)?;
                let index = self.eval(index)?;
                self.index(target, index)?
            }
            Expr::Unary { op, operand } => {
                let operand = self.eval(operand)?;
                unary(*op, operand)?
            }
            Expr::Binary { op, left, right } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                self.binary(*op, left, right)?
            }
        };
        self.charge(value.weight())?;
        Ok(value)
    }

    fn lookup(&self, name: &str) -> Result<Obj, SandboxError> {
        if let Some(value) = self.vars.get(name) {
            return Ok(value.clone());
        }
        if let Some(builtin) = BUILTINS.iter().find(|b| **b == name) {
            return Ok(Obj::Builtin(builtin));
        }
        if DENIED_NAMES.contains(&name) {
            return Err(denied(format!("'{}' is not allowed in procedures", name)));
        }
        Err(SandboxError::UndefinedName(name.to_string()))
    }

    // -- attributes ---------------------------------------------------------

    fn attribute(&self, target: Obj, name: &str) -> Result<Obj, SandboxError> {
        match target {
            Obj::Table(table) => match name {
                "columns" => Ok(Obj::List(
                    table.column_names().into_iter().map(Value::Text).collect(),
                )),
                "shape" => Ok(Obj::List(vec![
                    Value::Int(table.row_count() as i64),
                    Value::Int(table.column_count() as i64),
                ])),
                "empty" => Ok(Obj::Scalar(Value::Bool(table.is_empty()))),
                "iloc" => Ok(Obj::ILoc(Box::new(Obj::Table(table)))),
                _ => match table.column(name) {
                    Some(column) => Ok(Obj::Column(column.clone())),
                    None => Err(denied(format!(
                        "attribute '{}' is not available on a table",
                        name
                    ))),
                },
            },
            Obj::Column(column) => match name {
                "str" => Ok(Obj::Str(column)),
                "dt" => Ok(Obj::Dt(column)),
                "iloc" => Ok(Obj::ILoc(Box::new(Obj::Column(column)))),
                "name" => Ok(Obj::Scalar(Value::Text(column.name))),
                "size" => Ok(Obj::Scalar(Value::Int(column.len() as i64))),
                "empty" => Ok(Obj::Scalar(Value::Bool(column.is_empty()))),
                "values" => Ok(Obj::Column(column)),
                _ => Err(denied(format!(
                    "attribute '{}' is not available on a column",
                    name
                ))),
            },
            Obj::Dt(column) => self.datetime_part(&column, name),
            Obj::GroupBy {
                table,
                keys,
                selection: _,
            } if table.has_column(name) => Ok(Obj::GroupBy {
                table,
                keys,
                selection: Some(vec![name.to_string()]),
            }),
            other => Err(denied(format!(
                "attribute '{}' is not available on {}",
                name,
                other.type_name()
            ))),
        }
    }

    fn datetime_part(&self, column: &Column, part: &str) -> Result<Obj, SandboxError> {
        let extract: fn(&NaiveDateTime) -> Value = match part {
            "year" => |d| Value::Int(d.year() as i64),
            "month" => |d| Value::Int(d.month() as i64),
            "day" => |d| Value::Int(d.day() as i64),
            "weekday" | "dayofweek" => |d| Value::Int(d.weekday().num_days_from_monday() as i64),
            "date" => |d| Value::DateTime(d.date().and_time(NaiveTime::MIN)),
            _ => {
                return Err(denied(format!(
                    "'{}' is not available on the dt accessor",
                    part
                )));
            }
        };
        let values = column
            .values
            .iter()
            .map(|v| {
                value_to_datetime(v, self.now)
                    .map(|d| extract(&d))
                    .unwrap_or(Value::Null)
            })
            .collect();
        Ok(Obj::Column(Column::new(column.name.clone(), values)))
    }

    // -- indexing -----------------------------------------------------------

    fn index(&self, target: Obj, index: Obj) -> Result<Obj, SandboxError> {
        match (target, index) {
            (Obj::Table(table), Obj::Scalar(Value::Text(name))) => table
                .column(&name)
                .cloned()
                .map(Obj::Column)
                .ok_or_else(|| fail(format!("column '{}' not found", name))),
            (Obj::Table(table), Obj::List(names)) => {
                let names = names_of(&Obj::List(names))?;
                if let Some(missing) = names.iter().find(|n| !table.has_column(n)) {
                    return Err(fail(format!("column '{}' not found", missing)));
                }
                Ok(Obj::Table(table.select(&names)))
            }
            (Obj::Table(table), Obj::Column(mask)) => {
                let rows = mask_rows(&mask, table.row_count())?;
                Ok(Obj::Table(table.take_rows(&rows)))
            }
            (Obj::Column(column), Obj::Column(mask)) => {
                let rows = mask_rows(&mask, column.len())?;
                Ok(Obj::Column(column.take(&rows)))
            }
            (Obj::Column(column), Obj::Scalar(Value::Int(i))) => {
                let row = position(i, column.len())?;
                Ok(Obj::Scalar(column.values[row].clone()))
            }
            (Obj::List(values), Obj::Scalar(Value::Int(i))) => {
                let row = position(i, values.len())?;
                Ok(Obj::Scalar(values[row].clone()))
            }
            (Obj::Dict(entries), Obj::Scalar(key)) => {
                let key = scalar_text(&key);
                entries
                    .into_iter()
                    .find(|(k, _)| *k == key)
                    .map(|(_, v)| v)
                    .ok_or_else(|| fail(format!("key '{}' not found", key)))
            }
            (Obj::GroupBy { table, keys, .. }, selection) => {
                let names = names_of(&selection)?;
                if let Some(missing) = names.iter().find(|n| !table.has_column(n)) {
                    return Err(fail(format!("column '{}' not found", missing)));
                }
                Ok(Obj::GroupBy {
                    table,
                    keys,
                    selection: Some(names),
                })
            }
            (Obj::ILoc(inner), Obj::Scalar(Value::Int(i))) => match *inner {
                Obj::Table(table) => {
                    let row = position(i, table.row_count())?;
                    Ok(Obj::Table(table.take_rows(&[row])))
                }
                Obj::Column(column) => {
                    let row = position(i, column.len())?;
                    Ok(Obj::Scalar(column.values[row].clone()))
                }
                other => Err(fail(format!("cannot index {}", other.type_name()))),
            },
            (target, index) => Err(fail(format!(
                "cannot index {} with {}",
                target.type_name(),
                index.type_name()
            ))),
        }
    }

    // -- operators ----------------------------------------------------------

    fn binary(&self, op: BinaryOp, left: Obj, right: Obj) -> Result<Obj, SandboxError> {
        let now = self.now;
        let cell = |a: &Value, b: &Value| -> Result<Value, SandboxError> {
            match op {
                BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
                    arithmetic(op, a, b)
                }
                BinaryOp::And | BinaryOp::Or => {
                    let (x, y) = (truthy_cell(a), truthy_cell(b));
                    Ok(Value::Bool(if op == BinaryOp::And {
                        x && y
                    } else {
                        x || y
                    }))
                }
                _ => Ok(Value::Bool(compare(op, a, b, now))),
            }
        };

        match (left, right) {
            (Obj::Scalar(a), Obj::List(items)) if op == BinaryOp::In => Ok(Obj::Scalar(
                Value::Bool(items.iter().any(|v| compare(BinaryOp::Eq, &a, v, now))),
            )),
            (Obj::Column(c), Obj::List(items)) if op == BinaryOp::In => Ok(Obj::Column(isin(&c, &items, now))),
            (Obj::Scalar(Value::Text(needle)), Obj::Scalar(Value::Text(hay)))
                if op == BinaryOp::In =>
            {
                Ok(Obj::Scalar(Value::Bool(hay.contains(&needle))))
            }
            (Obj::Scalar(a), Obj::Scalar(b)) if matches!(op, BinaryOp::And | BinaryOp::Or) => {
                let (x, y) = (Obj::Scalar(a).truthy()?, Obj::Scalar(b).truthy()?);
                Ok(Obj::Scalar(Value::Bool(if op == BinaryOp::And {
                    x && y
                } else {
                    x || y
                })))
            }
            (Obj::Scalar(a), Obj::Scalar(b)) => Ok(Obj::Scalar(cell(&a, &b)?)),
            (Obj::Column(c), Obj::Scalar(b)) => {
                let values = c
                    .values
                    .iter()
                    .map(|a| cell(a, &b))
                    .collect::<Result<_, _>>()?;
                Ok(Obj::Column(Column::new(c.name, values)))
            }
            (Obj::Scalar(a), Obj::Column(c)) => {
                let values = c
                    .values
                    .iter()
                    .map(|b| cell(&a, b))
                    .collect::<Result<_, _>>()?;
                Ok(Obj::Column(Column::new(c.name, values)))
            }
            (Obj::Column(x), Obj::Column(y)) => {
                if x.len() != y.len() {
                    return Err(fail(format!(
                        "columns '{}' and '{}' have different lengths ({} vs {})",
                        x.name,
                        y.name,
                        x.len(),
                        y.len()
                    )));
                }
                let values = x
                    .values
                    .iter()
                    .zip(&y.values)
                    .map(|(a, b)| cell(a, b))
                    .collect::<Result<_, _>>()?;
                Ok(Obj::Column(Column::new(x.name, values)))
            }
            (left, right) => Err(fail(format!(
                "unsupported operand types for {}: {} and {}",
                op.symbol(),
                left.type_name(),
                right.type_name()
            ))),
        }
    }

    // -- builtins -----------------------------------------------------------

    fn call_builtin(&mut self, name: &str, args: &Args) -> Result<Obj, SandboxError> {
        if name == "print" {
            let parts: Vec<String> = args.positional.iter().map(|o| o.to_string()).collect();
            self.stdout.push_str(&parts.join(" "));
            self.stdout.push('\n');
            return Ok(Obj::Scalar(Value::Null));
        }
        if name != "min" && name != "max" && args.positional.len() > 2 {
            return Err(fail(format!("{}() takes at most 2 arguments", name)));
        }
        let first = args.require(0, "x", name)?;
        match name {
            "len" => {
                let n = match first {
                    Obj::Table(t) => t.row_count(),
                    Obj::Column(c) => c.len(),
                    Obj::List(v) => v.len(),
                    Obj::Dict(d) => d.len(),
                    Obj::Scalar(Value::Text(s)) => s.chars().count(),
                    other => {
                        return Err(fail(format!(
                            "object of type {} has no len()",
                            other.type_name()
                        )));
                    }
                };
                Ok(Obj::Scalar(Value::Int(n as i64)))
            }
            "int" | "float" | "str" | "bool" => {
                if let (Obj::Column(c), "str") = (first, name) {
                    return Ok(Obj::Scalar(Value::Text(Obj::Column(c.clone()).to_string())));
                }
                let value = match first {
                    Obj::Scalar(v) => cast(name, v)?,
                    Obj::List(_) | Obj::Table(_) | Obj::Dict(_) if name == "bool" => {
                        Value::Bool(first.truthy().unwrap_or(true))
                    }
                    other if name == "str" => Value::Text(other.to_string()),
                    other => {
                        return Err(fail(format!(
                            "{}() argument must be a scalar, got {}",
                            name,
                            other.type_name()
                        )));
                    }
                };
                Ok(Obj::Scalar(value))
            }
            "round" => {
                let digits = args.usize_or(1, "ndigits", 0)?;
                let whole = args.get(1, "ndigits").is_none();
                map_numeric(first, |v| round_value(v, digits as i32, whole))
            }
            "abs" => map_numeric(first, abs_value),
            "min" | "max" | "sum" => {
                let func = match name {
                    "min" => AggFunc::Min,
                    "max" => AggFunc::Max,
                    _ => AggFunc::Sum,
                };
                let values: Vec<Value> = if args.positional.len() > 1 && name != "sum" {
                    args.positional
                        .iter()
                        .map(|o| match o {
                            Obj::Scalar(v) => Ok(v.clone()),
                            other => Err(fail(format!(
                                "{}() arguments must be scalars, got {}",
                                name,
                                other.type_name()
                            ))),
                        })
                        .collect::<Result<_, _>>()?
                } else {
                    sequence(first, name)?
                };
                reduce(&values, func, name).map(Obj::Scalar)
            }
            "list" => match first {
                Obj::Table(t) => Ok(Obj::List(
                    t.column_names().into_iter().map(Value::Text).collect(),
                )),
                other => Ok(Obj::List(sequence(other, name)?)),
            },
            "sorted" => {
                let mut values = sequence(first, name)?;
                values.sort_by(|a, b| a.compare(b));
                if args.bool_or(1, "reverse", false)? {
                    values.reverse();
                }
                Ok(Obj::List(values))
            }
            _ => Err(denied(format!("'{}' is not available", name))),
        }
    }

    // -- methods ------------------------------------------------------------

    fn call_method(&self, receiver: Obj, name: &str, args: &Args) -> Result<Obj, SandboxError> {
        match receiver {
            Obj::Table(table) => self.table_method(table, name, args),
            Obj::Column(column) => self.column_method(column, name, args),
            Obj::GroupBy {
                table,
                keys,
                selection,
            } => groupby_method(&table, &keys, selection.as_deref(), name, args),
            Obj::Str(column) => str_method(&column, name, args),
            Obj::Scalar(Value::Text(text)) => match name {
                "lower" => Ok(Obj::Scalar(Value::Text(text.to_lowercase()))),
                "upper" => Ok(Obj::Scalar(Value::Text(text.to_uppercase()))),
                "strip" => Ok(Obj::Scalar(Value::Text(text.trim().to_string()))),
                _ => Err(denied(format!("method '{}' is not available on a str", name))),
            },
            other => Err(denied(format!(
                "method '{}' is not available on {}",
                name,
                other.type_name()
            ))),
        }
    }

    fn table_method(&self, table: Dataset, name: &str, args: &Args) -> Result<Obj, SandboxError> {
        match name {
            "head" => Ok(Obj::Table(table.head(args.usize_or(0, "n", 5)?))),
            "sort_values" => {
                let by = args
                    .names(0, "by")?
                    .ok_or_else(|| fail("sort_values() is missing argument 'by'"))?;
                let ascending: Vec<bool> = match args.get(1, "ascending") {
                    None => vec![true; by.len()],
                    Some(Obj::List(flags)) => flags
                        .iter()
                        .map(truthy_cell)
                        .chain(std::iter::repeat(true))
                        .take(by.len())
                        .collect(),
                    Some(flag) => vec![flag.truthy()?; by.len()],
                };
                let keys = sort_keys(&table, &by, &ascending)?;
                Ok(Obj::Table(sort_by(&table, &keys)))
            }
            "groupby" => {
                let keys = args
                    .names(0, "by")?
                    .ok_or_else(|| fail("groupby() is missing argument 'by'"))?;
                if let Some(missing) = keys.iter().find(|k| !table.has_column(k)) {
                    return Err(fail(format!("column '{}' not found", missing)));
                }
                Ok(Obj::GroupBy {
                    table,
                    keys,
                    selection: None,
                })
            }
            "drop_duplicates" => {
                let subset = args
                    .names(0, "subset")?
                    .unwrap_or_else(|| table.column_names());
                let columns: Vec<&Column> =
                    subset.iter().filter_map(|n| table.column(n)).collect();
                let mut seen = HashSet::new();
                let rows: Vec<usize> = (0..table.row_count())
                    .filter(|&r| {
                        let key: Vec<&Value> = columns.iter().map(|c| &c.values[r]).collect();
                        seen.insert(format!("{:?}", key))
                    })
                    .collect();
                Ok(Obj::Table(table.take_rows(&rows)))
            }
            "dropna" => {
                let subset = args
                    .names(0, "subset")?
                    .unwrap_or_else(|| table.column_names());
                let columns: Vec<&Column> =
                    subset.iter().filter_map(|n| table.column(n)).collect();
                let rows: Vec<usize> = (0..table.row_count())
                    .filter(|&r| columns.iter().all(|c| !c.values[r].is_null()))
                    .collect();
                Ok(Obj::Table(table.take_rows(&rows)))
            }
            "fillna" => {
                let fill = scalar_arg(args.require(0, "value", name)?, name)?;
                let columns = table
                    .columns()
                    .iter()
                    .map(|c| fill_column(c, &fill))
                    .collect();
                Dataset::new(columns)
                    .map(Obj::Table)
                    .map_err(|e| fail(e.to_string()))
            }
            "reset_index" | "copy" => Ok(Obj::Table(table)),
            _ => Err(denied(format!(
                "method '{}' is not available on a table",
                name
            ))),
        }
    }

    fn column_method(&self, column: Column, name: &str, args: &Args) -> Result<Obj, SandboxError> {
        if let Some(func) = AggFunc::parse(name) {
            let numeric = numeric_view(&column);
            let cells: Vec<&Value> = numeric.values.iter().filter(|v| !v.is_null()).collect();
            return aggregate(&cells, func, &column.name)
                .map(Obj::Scalar)
                .map_err(fail);
        }
        match name {
            "unique" => {
                let mut seen = HashSet::new();
                let values = column
                    .values
                    .into_iter()
                    .filter(|v| !v.is_null() && seen.insert(format!("{:?}", v)))
                    .collect();
                Ok(Obj::List(values))
            }
            "tolist" | "to_list" => Ok(Obj::List(column.values)),
            "value_counts" => {
                let mut counts: Vec<(Value, i64)> = Vec::new();
                let mut slots: HashMap<String, usize> = HashMap::new();
                for v in column.values.iter().filter(|v| !v.is_null()) {
                    let id = format!("{:?}", v);
                    match slots.get(&id) {
                        Some(&i) => counts[i].1 += 1,
                        None => {
                            slots.insert(id, counts.len());
                            counts.push((v.clone(), 1));
                        }
                    }
                }
                counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.compare(&b.0)));
                let (values, tallies): (Vec<Value>, Vec<Value>) = counts
                    .into_iter()
                    .map(|(v, n)| (v, Value::Int(n)))
                    .unzip();
                Dataset::new(vec![
                    Column::new(column.name, values),
                    Column::new("count", tallies),
                ])
                .map(Obj::Table)
                .map_err(|e| fail(e.to_string()))
            }
            "head" => {
                let n = args.usize_or(0, "n", 5)?;
                let rows: Vec<usize> = (0..column.len().min(n)).collect();
                Ok(Obj::Column(column.take(&rows)))
            }
            "sort_values" => {
                let ascending = args.bool_or(0, "ascending", true)?;
                let name = column.name.clone();
                let table = Dataset::new(vec![column]).map_err(|e| fail(e.to_string()))?;
                let keys = sort_keys(&table, &[name], &[ascending])?;
                sort_by(&table, &keys)
                    .columns()
                    .first()
                    .cloned()
                    .map(Obj::Column)
                    .ok_or_else(|| fail("sort_values() produced no column"))
            }
            "isin" => {
                let Some(Obj::List(items)) = args.get(0, "values") else {
                    return Err(fail("isin() expects a list"));
                };
                Ok(Obj::Column(isin(&column, items, self.now)))
            }
            "isna" | "isnull" | "notna" | "notnull" => {
                let want_null = matches!(name, "isna" | "isnull");
                let values = column
                    .values
                    .iter()
                    .map(|v| Value::Bool(v.is_null() == want_null))
                    .collect();
                Ok(Obj::Column(Column::new(column.name, values)))
            }
            "fillna" => {
                let fill = scalar_arg(args.require(0, "value", name)?, name)?;
                Ok(Obj::Column(fill_column(&column, &fill)))
            }
            "abs" => map_numeric(&Obj::Column(column), abs_value),
            "round" => {
                let digits = args.usize_or(0, "decimals", 0)?;
                map_numeric(&Obj::Column(column), |v| round_value(v, digits as i32, false))
            }
            _ => Err(denied(format!(
                "method '{}' is not available on a column",
                name
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Group-by
// ---------------------------------------------------------------------------

fn groupby_method(
    table: &Dataset,
    keys: &[String],
    selection: Option<&[String]>,
    name: &str,
    args: &Args,
) -> Result<Obj, SandboxError> {
    let targets = |numeric_only: bool| -> Vec<String> {
        match selection {
            Some(cols) => cols.to_vec(),
            None => table
                .columns()
                .iter()
                .filter(|c| !keys.contains(&c.name))
                .filter(|c| !numeric_only || c.kind == ColumnKind::Numeric)
                .map(|c| c.name.clone())
                .collect(),
        }
    };

    let aggregations: BTreeMap<String, AggSpec> = match name {
        "size" => {
            let Some(first) = keys.first() else {
                return Err(fail("groupby() needs at least one key"));
            };
            let mut spec = BTreeMap::new();
            spec.insert(first.clone(), AggSpec::Many(vec!["count".to_string()]));
            let grouped = group_aggregate(table, keys, &spec).map_err(fail)?;
            let columns = grouped
                .columns()
                .iter()
                .map(|c| {
                    if keys.contains(&c.name) {
                        c.clone()
                    } else {
                        Column::new("size", c.values.clone())
                    }
                })
                .collect();
            return Dataset::new(columns)
                .map(Obj::Table)
                .map_err(|e| fail(e.to_string()));
        }
        "agg" | "aggregate" => match args.require(0, "func", name)? {
            Obj::Scalar(Value::Text(func)) => targets(needs_numbers(func))
                .into_iter()
                .map(|c| (c, AggSpec::One(func.clone())))
                .collect(),
            Obj::List(funcs) => {
                let funcs = names_of(&Obj::List(funcs.clone()))?;
                targets(funcs.iter().any(|f| needs_numbers(f)))
                    .into_iter()
                    .map(|c| (c, AggSpec::Many(funcs.clone())))
                    .collect()
            }
            Obj::Dict(entries) => {
                let mut spec = BTreeMap::new();
                for (column, funcs) in entries {
                    let agg = match funcs {
                        Obj::Scalar(Value::Text(f)) => AggSpec::One(f.clone()),
                        other => AggSpec::Many(names_of(other)?),
                    };
                    spec.insert(column.clone(), agg);
                }
                spec
            }
            other => {
                return Err(fail(format!(
                    "agg() expects a function name, list or dict, got {}",
                    other.type_name()
                )));
            }
        },
        func if AggFunc::parse(func).is_some() => targets(needs_numbers(func))
            .into_iter()
            .map(|c| (c, AggSpec::One(func.to_string())))
            .collect(),
        _ => {
            return Err(denied(format!(
                "method '{}' is not available on a groupby",
                name
            )));
        }
    };

    if aggregations.is_empty() {
        return Err(fail("no columns to aggregate"));
    }
    group_aggregate(table, keys, &aggregations)
        .map(Obj::Table)
        .map_err(fail)
}

fn needs_numbers(func: &str) -> bool {
    matches!(
        AggFunc::parse(func),
        Some(AggFunc::Sum | AggFunc::Mean | AggFunc::Median)
    )
}

// ---------------------------------------------------------------------------
// String accessor
// ---------------------------------------------------------------------------

fn str_method(column: &Column, name: &str, args: &Args) -> Result<Obj, SandboxError> {
    let map = |f: &dyn Fn(&str) -> Value| -> Obj {
        let values = column
            .values
            .iter()
            .map(|v| match v {
                Value::Null => Value::Null,
                other => f(&other.to_string()),
            })
            .collect();
        Obj::Column(Column::new(column.name.clone(), values))
    };
    // Null cells never match a predicate.
    let predicate = |f: &dyn Fn(&str) -> bool| -> Obj {
        let values = column
            .values
            .iter()
            .map(|v| match v {
                Value::Null => Value::Bool(false),
                other => Value::Bool(f(&other.to_string())),
            })
            .collect();
        Obj::Column(Column::new(column.name.clone(), values))
    };

    match name {
        "contains" => {
            let pattern = args.text(0, "pat", name)?;
            if args.bool_or(1, "case", true)? {
                Ok(predicate(&|s| s.contains(&pattern)))
            } else {
                let pattern = pattern.to_lowercase();
                Ok(predicate(&|s| s.to_lowercase().contains(&pattern)))
            }
        }
        "lower" => Ok(map(&|s| Value::Text(s.to_lowercase()))),
        "upper" => Ok(map(&|s| Value::Text(s.to_uppercase()))),
        "strip" => Ok(map(&|s| Value::Text(s.trim().to_string()))),
        "len" => Ok(map(&|s| Value::Int(s.chars().count() as i64))),
        _ => Err(denied(format!(
            "method '{}' is not available on the str accessor",
            name
        ))),
    }
}

// ---------------------------------------------------------------------------
// Cell helpers
// ---------------------------------------------------------------------------

fn unary(op: UnaryOp, operand: Obj) -> Result<Obj, SandboxError> {
    let cell = |v: &Value| -> Result<Value, SandboxError> {
        match (op, v) {
            (_, Value::Null) => Ok(Value::Null),
            (UnaryOp::Neg, Value::Int(i)) => Ok(i
                .checked_neg()
                .map(Value::Int)
                .unwrap_or(Value::Float(-(*i as f64)))),
            (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
            (UnaryOp::Neg, Value::Bool(b)) => Ok(Value::Int(-(*b as i64))),
            (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
            (UnaryOp::Not, other) => Ok(Value::Bool(!truthy_cell(other))),
            (UnaryOp::Neg, other) => Err(fail(format!(
                "bad operand for unary -: '{}'",
                scalar_text(other)
            ))),
        }
    };
    match operand {
        Obj::Scalar(Value::Null) if op == UnaryOp::Not => Ok(Obj::Scalar(Value::Bool(true))),
        Obj::Scalar(v) => Ok(Obj::Scalar(cell(&v)?)),
        Obj::Column(c) => {
            let values = c.values.iter().map(cell).collect::<Result<_, _>>()?;
            Ok(Obj::Column(Column::new(c.name, values)))
        }
        other if op == UnaryOp::Not => Ok(Obj::Scalar(Value::Bool(!other.truthy()?))),
        other => Err(fail(format!(
            "bad operand for unary -: {}",
            other.type_name()
        ))),
    }
}

fn truthy_cell(value: &Value) -> bool {
    Obj::Scalar(value.clone()).truthy().unwrap_or(false)
}

fn number_view(value: &Value) -> Value {
    match value {
        Value::Bool(b) => Value::Int(*b as i64),
        other => other.clone(),
    }
}

fn finite(f: f64) -> Value {
    if f.is_finite() {
        Value::Float(f)
    } else {
        Value::Null
    }
}

fn arithmetic(op: BinaryOp, a: &Value, b: &Value) -> Result<Value, SandboxError> {
    let (a, b) = (number_view(a), number_view(b));
    match (&a, &b) {
        (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
        (Value::Int(x), Value::Int(y)) => {
            let exact = match op {
                BinaryOp::Add => x.checked_add(*y),
                BinaryOp::Sub => x.checked_sub(*y),
                BinaryOp::Mul => x.checked_mul(*y),
                BinaryOp::Mod if *y != 0 => x.checked_rem_euclid(*y),
                BinaryOp::Mod => return Ok(Value::Null),
                _ => None,
            };
            match exact {
                Some(v) => Ok(Value::Int(v)),
                None => float_arithmetic(op, *x as f64, *y as f64),
            }
        }
        (x, y) if x.is_numeric() && y.is_numeric() => {
            float_arithmetic(op, x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0))
        }
        (Value::Text(x), Value::Text(y)) if op == BinaryOp::Add => {
            Ok(Value::Text(format!("{}{}", x, y)))
        }
        (Value::DateTime(x), Value::DateTime(y)) if op == BinaryOp::Sub => {
            Ok(finite((*x - *y).num_seconds() as f64 / 86_400.0))
        }
        _ => Err(fail(format!(
            "unsupported operand values for {}: '{}' and '{}'",
            op.symbol(),
            scalar_text(&a),
            scalar_text(&b)
        ))),
    }
}

fn float_arithmetic(op: BinaryOp, x: f64, y: f64) -> Result<Value, SandboxError> {
    Ok(match op {
        BinaryOp::Add => finite(x + y),
        BinaryOp::Sub => finite(x - y),
        BinaryOp::Mul => finite(x * y),
        BinaryOp::Div if y == 0.0 => Value::Null,
        BinaryOp::Div => finite(x / y),
        BinaryOp::Mod if y == 0.0 => Value::Null,
        BinaryOp::Mod => finite(x.rem_euclid(y)),
        other => return Err(fail(format!("'{}' is not arithmetic", other.symbol()))),
    })
}

fn ordering(a: &Value, b: &Value, now: NaiveDateTime) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => None,
        (x, y) if x.is_numeric() && y.is_numeric() => Some(x.compare(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::DateTime(_), _) | (_, Value::DateTime(_)) => {
            let x = value_to_datetime(a, now)?;
            let y = value_to_datetime(b, now)?;
            Some(x.cmp(&y))
        }
        (Value::Text(x), Value::Text(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Nulls and mismatched types fail every comparison except `!=`.
fn compare(op: BinaryOp, a: &Value, b: &Value, now: NaiveDateTime) -> bool {
    let ord = ordering(a, b, now);
    match op {
        BinaryOp::Eq => ord == Some(Ordering::Equal),
        BinaryOp::Ne => ord != Some(Ordering::Equal),
        BinaryOp::Lt => ord == Some(Ordering::Less),
        BinaryOp::Le => matches!(ord, Some(Ordering::Less | Ordering::Equal)),
        BinaryOp::Gt => ord == Some(Ordering::Greater),
        BinaryOp::Ge => matches!(ord, Some(Ordering::Greater | Ordering::Equal)),
        _ => false,
    }
}

fn isin(column: &Column, items: &[Value], now: NaiveDateTime) -> Column {
    let values = column
        .values
        .iter()
        .map(|v| Value::Bool(items.iter().any(|i| compare(BinaryOp::Eq, v, i, now))))
        .collect();
    Column::new(column.name.clone(), values)
}

fn mask_rows(mask: &Column, expected: usize) -> Result<Vec<usize>, SandboxError> {
    if mask.len() != expected {
        return Err(fail(format!(
            "boolean mask has {} rows, table has {}",
            mask.len(),
            expected
        )));
    }
    if mask
        .values
        .iter()
        .any(|v| !matches!(v, Value::Bool(_) | Value::Null))
    {
        return Err(fail("index must be a boolean mask"));
    }
    Ok(mask
        .values
        .iter()
        .enumerate()
        .filter(|(_, v)| matches!(v, Value::Bool(true)))
        .map(|(i, _)| i)
        .collect())
}

fn position(index: i64, len: usize) -> Result<usize, SandboxError> {
    let resolved = if index < 0 {
        len as i64 + index
    } else {
        index
    };
    if resolved < 0 || resolved as usize >= len {
        return Err(fail(format!(
            "index {} is out of range for length {}",
            index, len
        )));
    }
    Ok(resolved as usize)
}

fn sort_keys(
    table: &Dataset,
    by: &[String],
    ascending: &[bool],
) -> Result<Vec<SortKey>, SandboxError> {
    by.iter()
        .zip(ascending.iter().chain(std::iter::repeat(&true)))
        .map(|(col, asc)| {
            if !table.has_column(col) {
                return Err(fail(format!("column '{}' not found", col)));
            }
            Ok(SortKey {
                by: col.clone(),
                order: if *asc {
                    SortOrder::Asc
                } else {
                    SortOrder::Desc
                },
            })
        })
        .collect()
}

/// Booleans count as 0/1 when aggregated.
fn numeric_view(column: &Column) -> Column {
    if column.kind == ColumnKind::Boolean {
        Column::new(
            column.name.clone(),
            column.values.iter().map(number_view).collect(),
        )
    } else {
        column.clone()
    }
}

fn fill_column(column: &Column, fill: &Value) -> Column {
    let values = column
        .values
        .iter()
        .map(|v| if v.is_null() { fill.clone() } else { v.clone() })
        .collect();
    Column::new(column.name.clone(), values)
}

fn scalar_arg(obj: &Obj, method: &str) -> Result<Value, SandboxError> {
    match obj {
        Obj::Scalar(v) => Ok(v.clone()),
        other => Err(fail(format!(
            "{}() expects a scalar, got {}",
            method,
            other.type_name()
        ))),
    }
}

fn sequence(obj: &Obj, name: &str) -> Result<Vec<Value>, SandboxError> {
    match obj {
        Obj::Column(c) => Ok(c.values.clone()),
        Obj::List(v) => Ok(v.clone()),
        other => Err(fail(format!(
            "{}() expects a column or list, got {}",
            name,
            other.type_name()
        ))),
    }
}

fn reduce(values: &[Value], func: AggFunc, name: &str) -> Result<Value, SandboxError> {
    let numeric: Vec<Value> = values.iter().map(number_view).collect();
    let cells: Vec<&Value> = numeric.iter().filter(|v| !v.is_null()).collect();
    if cells.is_empty() && func != AggFunc::Sum {
        return Err(fail(format!("{}() arg is an empty sequence", name)));
    }
    aggregate(&cells, func, name).map_err(fail)
}

fn map_numeric(obj: &Obj, f: impl Fn(&Value) -> Result<Value, SandboxError>) -> Result<Obj, SandboxError> {
    match obj {
        Obj::Scalar(v) => f(v).map(Obj::Scalar),
        Obj::Column(c) => {
            let values = c.values.iter().map(&f).collect::<Result<_, _>>()?;
            Ok(Obj::Column(Column::new(c.name.clone(), values)))
        }
        other => Err(fail(format!("expected a number, got {}", other.type_name()))),
    }
}

fn abs_value(v: &Value) -> Result<Value, SandboxError> {
    match number_view(v) {
        Value::Null => Ok(Value::Null),
        Value::Int(i) => Ok(Value::Int(i.saturating_abs())),
        Value::Float(f) => Ok(Value::Float(f.abs())),
        other => Err(fail(format!("bad operand for abs(): '{}'", scalar_text(&other)))),
    }
}

/// `whole` mirrors `round(x)` without digits, which yields an integer.
fn round_value(v: &Value, digits: i32, whole: bool) -> Result<Value, SandboxError> {
    match number_view(v) {
        Value::Null => Ok(Value::Null),
        Value::Int(i) => Ok(Value::Int(i)),
        Value::Float(f) if whole => Ok(Value::Int(f.round() as i64)),
        Value::Float(f) => {
            let scale = 10f64.powi(digits);
            Ok(finite((f * scale).round() / scale))
        }
        other => Err(fail(format!(
            "bad operand for round(): '{}'",
            scalar_text(&other)
        ))),
    }
}

fn cast(name: &str, value: &Value) -> Result<Value, SandboxError> {
    let bad = || fail(format!("cannot convert '{}' with {}()", scalar_text(value), name));
    match name {
        "int" => match value {
            Value::Int(i) => Ok(Value::Int(*i)),
            Value::Float(f) if f.is_finite() => Ok(Value::Int(f.trunc() as i64)),
            Value::Bool(b) => Ok(Value::Int(*b as i64)),
            Value::Text(s) => s.trim().parse::<i64>().map(Value::Int).map_err(|_| bad()),
            _ => Err(bad()),
        },
        "float" => match value {
            Value::Int(i) => Ok(Value::Float(*i as f64)),
            Value::Float(f) => Ok(Value::Float(*f)),
            Value::Bool(b) => Ok(Value::Float(*b as i64 as f64)),
            Value::Text(s) => s.trim().parse::<f64>().map(Value::Float).map_err(|_| bad()),
            _ => Err(bad()),
        },
        "str" => Ok(Value::Text(scalar_text(value))),
        "bool" => Ok(Value::Bool(truthy_cell(value))),
        _ => Err(bad()),
    }
}

#[cfg(test)]
mod tests {
    use super::super::parser::parse;
    use super::*;
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 31)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn day(d: u32) -> Value {
        Value::DateTime(
            NaiveDate::from_ymd_opt(2024, 3, d)
                .unwrap()
                .and_time(NaiveTime::MIN),
        )
    }

    fn sales() -> Dataset {
        Dataset::new(vec![
            Column::new(
                "region",
                ["north", "south", "north", "east", "south"]
                    .iter()
                    .map(|s| Value::Text(s.to_string()))
                    .collect(),
            ),
            Column::new(
                "amount",
                vec![
                    Value::Int(10),
                    Value::Int(20),
                    Value::Int(30),
                    Value::Null,
                    Value::Float(5.5),
                ],
            ),
            Column::new("day", vec![day(1), day(2), day(3), day(28), day(29)]),
        ])
        .unwrap()
    }

    fn run(source: &str) -> Result<RunOutcome, SandboxError> {
        let config = SandboxConfig::default();
        let program = parse(source)?;
        Interpreter::new(&config, &sales(), now()).run(&program)
    }

    fn scalar(source: &str) -> Value {
        match run(source).unwrap().output {
            ProcedureOutput::Scalar(v) => v,
            other => panic!("expected scalar, got {:?}", other),
        }
    }

    fn table(source: &str) -> Dataset {
        match run(source).unwrap().output {
            ProcedureOutput::Table(t) => t,
            other => panic!("expected table, got {:?}", other),
        }
    }

    #[test]
    fn test_filter_and_sum() {
        assert_eq!(
            scalar("result = df[df['amount'] > 10]['amount'].sum()"),
            Value::Int(50)
        );
        assert_eq!(scalar("result = df.amount.count()"), Value::Int(4));
        assert_eq!(scalar("result = len(df)"), Value::Int(5));
    }

    #[test]
    fn test_groupby_mean() {
        let t = table("result = df.groupby('region')['amount'].mean()");
        assert_eq!(t.column_names(), vec!["region", "amount"]);
        assert_eq!(t.value(0, "region"), Some(&Value::Text("east".into())));
        assert_eq!(t.value(0, "amount"), Some(&Value::Null));
        assert_eq!(t.value(1, "amount"), Some(&Value::Float(20.0)));
    }

    #[test]
    fn test_groupby_size_and_agg_dict() {
        let t = table("result = df.groupby('region').size()");
        assert_eq!(t.column_names(), vec!["region", "size"]);
        assert_eq!(t.value(1, "size"), Some(&Value::Int(2)));

        let t = table("result = df.groupby(['region']).agg({'amount': ['sum', 'max']})");
        assert_eq!(
            t.column_names(),
            vec!["region", "amount_sum", "amount_max"]
        );
        assert_eq!(t.value(2, "amount_sum"), Some(&Value::Float(25.5)));
    }

    #[test]
    fn test_sort_head_and_select() {
        let t = table(
            "top = df.sort_values('amount', ascending=False)\nresult = top[['region', 'amount']].head(2)",
        );
        assert_eq!(t.row_count(), 2);
        assert_eq!(t.value(0, "amount"), Some(&Value::Int(30)));
        assert_eq!(t.column_count(), 2);
    }

    #[test]
    fn test_masks_and_str_accessor() {
        let t = table(
            "mask = (df['region'].str.contains('OR', case=False)) & ~(df['amount'] < 15)\nresult = df[mask]",
        );
        assert_eq!(t.row_count(), 1);
        assert_eq!(t.value(0, "amount"), Some(&Value::Int(30)));

        let t = table("result = df[df.region.isin(['east', 'south'])]");
        assert_eq!(t.row_count(), 3);
    }

    #[test]
    fn test_date_comparison_and_dt_accessor() {
        let t = table("result = df[df['day'] >= '2024-03-28']");
        assert_eq!(t.row_count(), 2);
        assert_eq!(scalar("result = df['day'].dt.day.max()"), Value::Int(29));
    }

    #[test]
    fn test_column_assignment() {
        let t = table("df['double'] = df['amount'] * 2\nresult = df");
        assert_eq!(t.value(1, "double"), Some(&Value::Int(40)));
        assert_eq!(t.value(3, "double"), Some(&Value::Null));
    }

    #[test]
    fn test_builtins() {
        assert_eq!(scalar("result = round(df['amount'].mean(), 2)"), Value::Float(16.38));
        assert_eq!(scalar("result = round(2.6)"), Value::Int(3));
        assert_eq!(scalar("result = max(3, 9, 4)"), Value::Int(9));
        assert_eq!(scalar("result = int('42') + float(1)"), Value::Float(43.0));
        assert_eq!(scalar("result = str(7) + '!'"), Value::Text("7!".into()));
        assert_eq!(scalar("result = 'b' in ['a', 'b']"), Value::Bool(true));
        assert_eq!(scalar("result = 7 / 0"), Value::Null);
    }

    #[test]
    fn test_cleaning_methods() {
        assert_eq!(table("result = df.dropna()").row_count(), 4);

        let t = table("result = df.drop_duplicates(subset=['region'])");
        assert_eq!(t.row_count(), 3);
        assert_eq!(t.value(2, "region"), Some(&Value::Text("east".into())));

        assert_eq!(
            scalar("result = df.fillna(0)['amount'].sum()"),
            Value::Float(65.5)
        );
        assert_eq!(
            scalar("result = df['amount'].fillna(1).min()"),
            Value::Int(1)
        );
    }

    #[test]
    fn test_value_counts_and_unique() {
        let t = table("result = df['region'].value_counts()");
        assert_eq!(t.value(0, "region"), Some(&Value::Text("north".into())));
        assert_eq!(t.value(0, "count"), Some(&Value::Int(2)));
        assert_eq!(t.row_count(), 3);

        match run("result = df['region'].unique()").unwrap().output {
            ProcedureOutput::Column(c) => {
                assert_eq!(c.name, "result");
                assert_eq!(c.len(), 3);
            }
            other => panic!("expected column, got {:?}", other),
        }
    }

    #[test]
    fn test_print_is_captured() {
        let outcome = run("print('rows', len(df))\nresult = 1").unwrap();
        assert_eq!(outcome.stdout, "rows 5\n");
        assert!(outcome.fuel_consumed > 0);
    }

    #[test]
    fn test_unsupported_output_becomes_text() {
        match run("result = df.groupby('region')").unwrap().output {
            ProcedureOutput::Scalar(Value::Text(t)) => assert_eq!(t, "<groupby region>"),
            other => panic!("expected text, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_result() {
        assert_eq!(
            run("x = 1").unwrap_err(),
            SandboxError::MissingResult("result".into())
        );
    }

    #[test]
    fn test_runtime_errors_carry_line() {
        match run("x = 1\nresult = df['nope']").unwrap_err() {
            SandboxError::ExecutionFailed { line, message } => {
                assert_eq!(line, 2);
                assert!(message.contains("nope"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(matches!(
            run("result = missing + 1").unwrap_err(),
            SandboxError::UndefinedName(_)
        ));
    }

    #[test]
    fn test_disallowed_methods() {
        for source in [
            "result = df.to_csv('out.csv')",
            "result = df['amount'].apply(print)",
            "result = df.query('amount > 1')",
            "len = 3",
        ] {
            assert!(
                matches!(run(source), Err(SandboxError::CapabilityDenied(_))),
                "{source} should be denied"
            );
        }
    }

    #[test]
    fn test_limits() {
        let config = SandboxConfig::default().with_statement_limit(2);
        let program = parse("a = 1\nb = 2\nresult = 3").unwrap();
        assert_eq!(
            Interpreter::new(&config, &sales(), now())
                .run(&program)
                .unwrap_err(),
            SandboxError::TooManyStatements { count: 3, limit: 2 }
        );

        let config = SandboxConfig::default().with_fuel_limit(20);
        let program = parse("result = df[df['amount'] > 1]['amount'].sum()").unwrap();
        assert_eq!(
            Interpreter::new(&config, &sales(), now())
                .run(&program)
                .unwrap_err(),
            SandboxError::OutOfFuel
        );
    }

    #[test]
    fn test_dataset_is_not_mutated() {
        let data = sales();
        let config = SandboxConfig::default();
        let program = parse("df['amount'] = 0\ndf = df.head(1)\nresult = len(df)").unwrap();
        let outcome = Interpreter::new(&config, &data, now()).run(&program).unwrap();
        assert_eq!(outcome.output, ProcedureOutput::Scalar(Value::Int(1)));
        assert_eq!(data, sales());
    }
}
