//! Procedure strategy: the model writes a short dataframe procedure which the
//! sandbox runs against the dataset.

use super::{
    PROCEDURE, SynthesisContext, SynthesisPayload, SynthesisStrategy, strip_code_fences,
    window_hint,
};
use async_trait::async_trait;
use std::sync::Arc;
use tabula_core::brain::LlmProvider;
use tabula_core::error::SynthesisError;
use tabula_tools::sandbox::{ProcedureOutput, SandboxConfig, SandboxedExecutor};
use tracing::{debug, info, warn};

const DIALECT: &str = "Write a short procedure over the table `df` using dataframe operations: \
boolean masks (df[df.col > 3], & | ~), df.groupby(cols)[col].agg(...), sum/mean/count/min/max, \
sort_values, head, value_counts, unique, and the .str and .dt accessors. \
Assign the final answer to a variable named `result`. \
No imports, loops, function definitions, or file access. Return only the code.";

pub struct ProcedureStrategy {
    provider: Arc<dyn LlmProvider>,
    executor: SandboxedExecutor,
}

impl ProcedureStrategy {
    pub fn new(provider: Arc<dyn LlmProvider>, sandbox: SandboxConfig) -> Self {
        Self {
            provider,
            executor: SandboxedExecutor::new(sandbox),
        }
    }

    fn build_prompt(question: &str, ctx: &SynthesisContext) -> String {
        let date_context = match window_hint(question, ctx.now) {
            Some((start, end)) => format!(
                "The question refers to the window {} to {}.",
                start, end
            ),
            None => format!(
                "Today is {}. Relative dates count back from today.",
                ctx.now.format("%Y-%m-%d")
            ),
        };
        let date_columns = ctx.profile.date_columns();
        let date_note = if date_columns.is_empty() {
            String::new()
        } else {
            format!(" Date columns: {}.", date_columns.join(", "))
        };
        format!(
            "{}\n\n{}{}\n\nDATE CONTEXT:\n{}{}\n\nUSER QUESTION: {}",
            DIALECT,
            ctx.sample_hint,
            hints_line(ctx),
            date_context,
            date_note,
            question
        )
    }
}

fn hints_line(ctx: &SynthesisContext) -> String {
    let hints = ctx.profile.schema_hints();
    if hints.is_empty() {
        String::new()
    } else {
        format!("Schema hints: {}\n", hints)
    }
}

pub(crate) fn output_to_payload(output: ProcedureOutput) -> SynthesisPayload {
    match output {
        ProcedureOutput::Table(table) => SynthesisPayload::Table(table),
        ProcedureOutput::Column(column) => SynthesisPayload::Column(column),
        ProcedureOutput::Scalar(value) => SynthesisPayload::Scalar(value),
    }
}

#[async_trait]
impl SynthesisStrategy for ProcedureStrategy {
    fn name(&self) -> &str {
        PROCEDURE
    }

    async fn synthesize(
        &self,
        question: &str,
        ctx: &SynthesisContext,
    ) -> Result<SynthesisPayload, SynthesisError> {
        for issue in ctx.dataset.quality_issues() {
            warn!(issue = %issue, "Dataset quality issue");
        }

        let prompt = Self::build_prompt(question, ctx);
        let text = self
            .provider
            .generate(ctx.profile.system_prompt(), &prompt)
            .await
            .map_err(|source| SynthesisError::Model {
                strategy: PROCEDURE.into(),
                source,
            })?;
        let code = strip_code_fences(&text);
        if code.is_empty() {
            return Err(SynthesisError::UnusableOutput {
                strategy: PROCEDURE.into(),
                message: "model returned no code".to_string(),
            });
        }
        debug!(lines = code.lines().count(), "Running generated procedure");

        let dataset = Arc::clone(&ctx.dataset);
        let executor = self.executor.clone();
        let now = ctx.now;
        let run = tokio::task::spawn_blocking(move || {
            executor.execute_at(&code, &dataset, executor.default_config(), now)
        })
        .await
        .map_err(|e| SynthesisError::Execution {
            message: format!("procedure task failed: {}", e),
        })?
        .map_err(|e| SynthesisError::Execution {
            message: e.to_string(),
        })?;

        info!(
            output = run.output.kind(),
            rows = run.row_count(),
            fuel = run.fuel_consumed,
            "Procedure produced a result"
        );
        Ok(output_to_payload(run.output))
    }
}
