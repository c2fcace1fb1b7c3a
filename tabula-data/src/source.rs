//! Data sources and the dataset load pipeline.

use crate::dataset::{Dataset, Value};
use crate::dates::convert_column;
use crate::profile::DataProfile;
use async_trait::async_trait;
use std::path::PathBuf;
use tabula_core::DataError;
use tracing::{info, warn};

/// Something a dataset can be (re)loaded from.
#[async_trait]
pub trait DataSource: Send + Sync {
    async fn load(&self) -> Result<Dataset, DataError>;

    /// Human-readable location, for logs.
    fn describe(&self) -> String;
}

/// CSV file data source.
pub struct CsvSource {
    pub path: PathBuf,
    pub delimiter: char,
}

impl CsvSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            delimiter: ',',
        }
    }

    pub fn with_delimiter(mut self, delimiter: char) -> Self {
        self.delimiter = delimiter;
        self
    }

    /// Parse CSV text with a header row into a dataset.
    pub fn parse(content: &[u8], delimiter: char) -> Result<Dataset, DataError> {
        let delimiter = u8::try_from(delimiter).map_err(|_| DataError::Malformed {
            message: format!("delimiter '{}' is not a single byte", delimiter),
        })?;
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(content);

        let names: Vec<String> = reader
            .headers()
            .map_err(|e| DataError::Malformed {
                message: format!("invalid CSV header: {}", e),
            })?
            .iter()
            .map(|h| h.trim_start_matches('\u{feff}').to_string())
            .collect();
        if names.is_empty() || names.iter().all(|n| n.is_empty()) {
            return Err(DataError::Malformed {
                message: "CSV has no header".to_string(),
            });
        }

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| DataError::Malformed {
                message: format!("invalid CSV record: {}", e),
            })?;
            if record.iter().all(|f| f.is_empty()) {
                continue;
            }
            rows.push(record.iter().map(Value::parse_cell).collect());
        }
        Dataset::from_rows(&names, rows)
    }
}

#[async_trait]
impl DataSource for CsvSource {
    async fn load(&self) -> Result<Dataset, DataError> {
        let content = tokio::fs::read(&self.path)
            .await
            .map_err(|e| DataError::ReadFailed {
                path: self.path.clone(),
                message: e.to_string(),
            })?;
        Self::parse(&content, self.delimiter)
    }

    fn describe(&self) -> String {
        format!("csv:{}", self.path.display())
    }
}

/// A dataset already held in memory.
pub struct InMemorySource {
    dataset: Dataset,
}

impl InMemorySource {
    pub fn new(dataset: Dataset) -> Self {
        Self { dataset }
    }
}

#[async_trait]
impl DataSource for InMemorySource {
    async fn load(&self) -> Result<Dataset, DataError> {
        Ok(self.dataset.clone())
    }

    fn describe(&self) -> String {
        format!("memory:{}x{}", self.dataset.row_count(), self.dataset.column_count())
    }
}

/// Fail with `MissingColumns` when any required column is absent.
pub fn validate_required(dataset: &Dataset, required: &[String]) -> Result<(), DataError> {
    let missing: Vec<String> = required
        .iter()
        .filter(|c| !dataset.has_column(c))
        .cloned()
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(DataError::MissingColumns { missing })
    }
}

/// Validate, clean, and date-convert a raw dataset according to `profile`.
pub fn prepare_dataset(
    raw: Dataset,
    profile: &dyn DataProfile,
    convert_dates: bool,
) -> Result<Dataset, DataError> {
    validate_required(&raw, profile.required_columns())?;
    let mut dataset = profile.clean(raw);

    if convert_dates {
        for name in profile.date_columns() {
            let Some(column) = dataset.column(name) else {
                warn!(column = %name, "Declared date column not present");
                continue;
            };
            let outcome = convert_column(&column.values, name);
            for (warning, recommendation) in outcome
                .warnings
                .iter()
                .zip(outcome.recommendations.iter())
            {
                warn!(column = %name, recommendation = %recommendation, "{}", warning);
            }
            dataset = dataset.with_column(outcome.column)?;
        }
    }
    Ok(dataset)
}

/// Load from `source` and prepare the result for querying.
pub async fn load_dataset(
    source: &dyn DataSource,
    profile: &dyn DataProfile,
    convert_dates: bool,
) -> Result<Dataset, DataError> {
    let raw = source.load().await?;
    let dataset = prepare_dataset(raw, profile, convert_dates)?;
    info!(
        source = %source.describe(),
        profile = profile.name(),
        rows = dataset.row_count(),
        columns = dataset.column_count(),
        "Dataset loaded"
    );
    Ok(dataset)
}
