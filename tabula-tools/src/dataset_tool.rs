//! Run procedure tool: executes sandboxed dataframe code against the dataset.
//!
//! This is the one tool handed to the agent strategy. Failures are returned
//! as tool errors so the model can read them and try again.

use crate::registry::Tool;
use crate::sandbox::{SandboxConfig, SandboxError, SandboxedExecutor};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tabula_core::error::ToolError;
use tabula_core::types::ToolOutput;
use tabula_data::Dataset;
use tracing::debug;

pub const TOOL_NAME: &str = "run_procedure";

pub struct RunProcedureTool {
    dataset: Arc<Dataset>,
    executor: SandboxedExecutor,
}

impl RunProcedureTool {
    pub fn new(dataset: Arc<Dataset>, config: SandboxConfig) -> Self {
        Self {
            dataset,
            executor: SandboxedExecutor::new(config),
        }
    }
}

#[async_trait]
impl Tool for RunProcedureTool {
    fn name(&self) -> &str {
        TOOL_NAME
    }

    fn description(&self) -> &str {
        "Run a short dataframe procedure against the dataset. The table is bound to `df`; \
         assign the answer to `result`. Supports filtering with boolean masks, groupby, \
         aggregations, sort_values, head, value_counts, and the .str/.dt accessors. \
         No imports, loops, or function definitions."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "code": {
                    "type": "string",
                    "description": "Procedure source; must assign `result`"
                }
            },
            "required": ["code"]
        })
    }

    async fn execute(&self, args: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let code = args
            .get("code")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArguments {
                name: TOOL_NAME.into(),
                reason: "Missing 'code' parameter".to_string(),
            })?
            .to_string();

        let dataset = Arc::clone(&self.dataset);
        let executor = self.executor.clone();
        let run = tokio::task::spawn_blocking(move || executor.execute(&code, &dataset))
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                name: TOOL_NAME.into(),
                message: format!("procedure task failed: {}", e),
            })?
            .map_err(|e: SandboxError| ToolError::ExecutionFailed {
                name: TOOL_NAME.into(),
                message: e.to_string(),
            })?;

        debug!(
            output = run.output.kind(),
            rows = run.row_count(),
            fuel = run.fuel_consumed,
            "Procedure tool finished"
        );

        let mut content = run.output.to_string();
        if !run.stdout.is_empty() {
            content = format!("{}\n--- printed ---\n{}", content, run.stdout);
        }
        Ok(ToolOutput::text(content)
            .with_metadata("output_kind", json!(run.output.kind()))
            .with_metadata("rows", json!(run.row_count()))
            .with_metadata("fuel_consumed", json!(run.fuel_consumed)))
    }

    fn timeout(&self) -> Duration {
        self.executor
            .default_config()
            .resource_limits
            .max_execution_time
    }
}
