//! Structured strategy: the model writes a JSON `QuerySpec`.

use super::{
    STRUCTURED, SynthesisContext, SynthesisPayload, SynthesisStrategy, extract_json, window_hint,
};
use async_trait::async_trait;
use serde_json::Value as Json;
use std::sync::Arc;
use tabula_core::brain::LlmProvider;
use tabula_core::error::SynthesisError;
use tabula_data::{Filter, FilterOp, QuerySpec};
use tracing::{debug, warn};

const SPEC_SCHEMA: &str = r#"JSON schema:
{
  "filters": [{"column": str, "operator": "eq|neq|gt|gte|lt|lte|in|contains|date_range", "value": any}],
  "group_by": [str],
  "aggregations": {"column": "sum|mean|count|min|max|nunique" or [..]},
  "select": [str],
  "sort": [{"by": str, "order": "asc|desc"}],
  "limit": int
}
date_range takes a two-element list [start, end]."#;

pub struct StructuredStrategy {
    provider: Arc<dyn LlmProvider>,
}

impl StructuredStrategy {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self { provider }
    }

    fn build_prompt(question: &str, ctx: &SynthesisContext) -> String {
        let window = match window_hint(question, ctx.now) {
            Some((start, end)) => format!("{} to {}", start, end),
            None => "none".to_string(),
        };
        let mut prompt = String::new();
        prompt.push_str(&ctx.sample_hint);
        if !ctx.profile.schema_hints().is_empty() {
            prompt.push_str(&format!("Schema hints: {}\n", ctx.profile.schema_hints()));
        }
        prompt.push_str(SPEC_SCHEMA);
        prompt.push_str(&format!(
            "\n\nQuestion: {}\nDetected date window hint: {}\n\nReturn only JSON matching the schema.",
            question, window
        ));
        prompt
    }

    /// Model text to a sanitized spec.
    fn parse_spec(
        &self,
        text: &str,
        question: &str,
        ctx: &SynthesisContext,
    ) -> Result<QuerySpec, SynthesisError> {
        let raw = extract_json(text).ok_or_else(|| SynthesisError::UnusableOutput {
            strategy: STRUCTURED.into(),
            message: "no JSON object in model output".to_string(),
        })?;
        let json: Json = serde_json::from_str(raw).map_err(|e| SynthesisError::UnusableOutput {
            strategy: STRUCTURED.into(),
            message: format!("invalid JSON: {}", e),
        })?;
        if !json.is_object() {
            return Err(SynthesisError::UnusableOutput {
                strategy: STRUCTURED.into(),
                message: "model output is not a JSON object".to_string(),
            });
        }
        let spec = sanitize(QuerySpec::from_json(&json), &ctx.allowed_columns());
        Ok(inject_window(spec, question, ctx))
    }

    /// Spec holding only the question's date window, when there is one.
    fn window_only(question: &str, ctx: &SynthesisContext) -> Option<QuerySpec> {
        let column = ctx.profile.date_columns().first()?;
        let (start, end) = tabula_data::parse_relative_range_at(question, ctx.now)?;
        Some(QuerySpec::date_range_only(
            column,
            &start.format("%Y-%m-%dT%H:%M:%S").to_string(),
            &end.format("%Y-%m-%dT%H:%M:%S").to_string(),
        ))
    }
}

/// Drop projections and groupings on columns outside `allowed`.
fn sanitize(mut spec: QuerySpec, allowed: &[String]) -> QuerySpec {
    let before = spec.select.len() + spec.group_by.len();
    spec.select.retain(|c| allowed.contains(c));
    spec.group_by.retain(|c| allowed.contains(c));
    let dropped = before - spec.select.len() - spec.group_by.len();
    if dropped > 0 {
        debug!(dropped, "Removed columns outside the allowed set");
    }
    spec
}

/// Add a `date_range` on the first date column unless a date filter already exists.
fn inject_window(spec: QuerySpec, question: &str, ctx: &SynthesisContext) -> QuerySpec {
    let date_columns = ctx.profile.date_columns();
    let Some(column) = date_columns.first() else {
        return spec;
    };
    if spec.filters_any(date_columns) {
        return spec;
    }
    let Some((start, end)) = tabula_data::parse_relative_range_at(question, ctx.now) else {
        return spec;
    };
    spec.with_filter(Filter::new(
        column.clone(),
        FilterOp::DateRange,
        serde_json::json!([
            start.format("%Y-%m-%dT%H:%M:%S").to_string(),
            end.format("%Y-%m-%dT%H:%M:%S").to_string()
        ]),
    ))
}

#[async_trait]
impl SynthesisStrategy for StructuredStrategy {
    fn name(&self) -> &str {
        STRUCTURED
    }

    async fn synthesize(
        &self,
        question: &str,
        ctx: &SynthesisContext,
    ) -> Result<SynthesisPayload, SynthesisError> {
        let prompt = Self::build_prompt(question, ctx);
        let attempt = match self
            .provider
            .generate(ctx.profile.system_prompt(), &prompt)
            .await
        {
            Ok(text) => self.parse_spec(&text, question, ctx),
            Err(source) => Err(SynthesisError::Model {
                strategy: STRUCTURED.into(),
                source,
            }),
        };

        match attempt {
            Ok(spec) => {
                debug!(
                    filters = spec.filters.len(),
                    group_by = spec.group_by.len(),
                    limit = spec.limit,
                    "Structured spec synthesized"
                );
                Ok(SynthesisPayload::Spec(spec))
            }
            Err(e) => {
                warn!(error = %e, "Structured synthesis failed; trying date window only");
                Self::window_only(question, ctx)
                    .map(SynthesisPayload::Spec)
                    .ok_or(SynthesisError::NoSpecification)
            }
        }
    }
}
