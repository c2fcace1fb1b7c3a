//! # Tabula Data
//!
//! The tabular side of Tabula: an in-memory `Dataset`, CSV loading, the
//! date/range resolver, the structured `QuerySpec`, the query executor, and
//! dataset profiles.

pub mod dataset;
pub mod dates;
pub mod executor;
pub mod profile;
pub mod query;
pub mod source;

pub use dataset::{Column, ColumnKind, ColumnStats, Dataset, DatasetSummary, Record, Value};
pub use dates::{
    ConversionReport, DateConversion, convert_column, filter_range, parse_date_value,
    parse_relative_range, parse_relative_range_at,
};
pub use executor::{Execution, aggregate, apply, execute, group_aggregate, sort_by};
pub use profile::{Censor, ConfigProfile, DataProfile, MaskingCensor, PassthroughCensor};
pub use query::{
    AggFunc, AggSpec, DEFAULT_LIMIT, Filter, FilterOp, MAX_LIMIT, QuerySpec, SortKey, SortOrder,
    clamp_limit,
};
pub use source::{
    CsvSource, DataSource, InMemorySource, load_dataset, prepare_dataset, validate_required,
};
