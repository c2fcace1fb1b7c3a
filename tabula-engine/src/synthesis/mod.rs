//! Synthesis strategies: turning a question into something executable.
//!
//! Each strategy implements [`SynthesisStrategy`] and produces a
//! [`SynthesisPayload`]: either a [`QuerySpec`] for the query executor, or a
//! result already computed in the sandbox.

pub mod agent;
pub mod procedure;
pub mod structured;

pub use agent::AgentStrategy;
pub use procedure::ProcedureStrategy;
pub use structured::StructuredStrategy;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tabula_core::error::SynthesisError;
use tabula_data::{Column, DataProfile, Dataset, QuerySpec, Value};

pub const STRUCTURED: &str = "structured";
pub const PROCEDURE: &str = "procedure";
pub const AGENT: &str = "agent";

/// Everything a strategy may look at while synthesizing.
#[derive(Clone)]
pub struct SynthesisContext {
    pub dataset: Arc<Dataset>,
    pub profile: Arc<dyn DataProfile>,
    /// Schema description with a few sample rows.
    pub sample_hint: String,
    /// Reference time for relative date phrases.
    pub now: NaiveDateTime,
}

impl SynthesisContext {
    pub fn new(dataset: Arc<Dataset>, profile: Arc<dyn DataProfile>, sample_rows: usize) -> Self {
        let sample_hint = dataset.describe(sample_rows);
        Self {
            dataset,
            profile,
            sample_hint,
            now: tabula_data::dates::now(),
        }
    }

    pub fn with_now(mut self, now: NaiveDateTime) -> Self {
        self.now = now;
        self
    }

    /// Columns a spec may select or group on: the profile's list, or every
    /// dataset column when the profile declares none.
    pub fn allowed_columns(&self) -> Vec<String> {
        let declared = self.profile.allowed_columns();
        if declared.is_empty() {
            self.dataset.column_names()
        } else {
            declared.to_vec()
        }
    }
}

/// What a successful synthesis produced.
#[derive(Debug, Clone, PartialEq)]
pub enum SynthesisPayload {
    /// A structured query still to be run by the executor.
    Spec(QuerySpec),
    Table(Dataset),
    Column(Column),
    Scalar(Value),
}

impl SynthesisPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            SynthesisPayload::Spec(_) => "spec",
            SynthesisPayload::Table(_) => "table",
            SynthesisPayload::Column(_) => "column",
            SynthesisPayload::Scalar(_) => "scalar",
        }
    }
}

/// A payload annotated by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisOutcome {
    pub payload: SynthesisPayload,
    pub synthesis_method: String,
    pub elapsed: Duration,
    pub query_type: String,
}

/// Terminal failure after the fallback chain is exhausted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SynthesisFailure {
    pub kind: String,
    pub message: String,
    /// Last strategy attempted.
    pub synthesis_method: String,
}

/// One algorithm for turning a question into a payload.
#[async_trait]
pub trait SynthesisStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Tag reported as `query_type` for this strategy's results.
    fn query_type(&self) -> &str {
        self.name()
    }

    /// Whether the strategy can run with its current collaborators.
    fn is_available(&self) -> bool {
        true
    }

    async fn synthesize(
        &self,
        question: &str,
        ctx: &SynthesisContext,
    ) -> Result<SynthesisPayload, SynthesisError>;
}

/// Remove a surrounding markdown code fence, including its language tag.
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let mut lines: Vec<&str> = trimmed.lines().collect();
    if lines.first().is_some_and(|l| l.starts_with("```")) {
        lines.remove(0);
    }
    if lines.last().is_some_and(|l| l.trim() == "```") {
        lines.pop();
    }
    lines.join("\n").trim().to_string()
}

/// Locate the outermost `{...}` in a model reply.
pub fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Relative date window detected in the question, as a prompt line.
pub(crate) fn window_hint(question: &str, now: NaiveDateTime) -> Option<(String, String)> {
    tabula_data::parse_relative_range_at(question, now).map(|(start, end)| {
        (
            start.date().format("%Y-%m-%d").to_string(),
            end.date().format("%Y-%m-%d").to_string(),
        )
    })
}
