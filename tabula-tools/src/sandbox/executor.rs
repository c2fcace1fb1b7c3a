//! Sandboxed procedure executor.
//!
//! Provides [`SandboxedExecutor`], which checks a procedure against the
//! configured limits (size, nesting depth, statement count), parses it, and
//! runs it against a dataset.

use std::time::Instant;

use chrono::NaiveDateTime;
use tabula_data::Dataset;
use tracing::debug;

use super::config::SandboxConfig;
use super::parser::{Statement, parse_with_depth};
use super::runtime::{Interpreter, ProcedureOutput, SandboxError};

/// Executes procedures within the sandbox.
#[derive(Debug, Clone, Default)]
pub struct SandboxedExecutor {
    default_config: SandboxConfig,
}

impl SandboxedExecutor {
    pub fn new(default_config: SandboxConfig) -> Self {
        Self { default_config }
    }

    /// Create an executor with default settings.
    pub fn with_defaults() -> Self {
        Self::default()
    }

    pub fn default_config(&self) -> &SandboxConfig {
        &self.default_config
    }

    /// Check a procedure's size, syntax and statement count without running it.
    pub fn validate(&self, code: &str) -> Result<(), SandboxError> {
        compile(code, &self.default_config).map(|_| ())
    }

    /// Run a procedure with the default configuration.
    pub fn execute(&self, code: &str, dataset: &Dataset) -> Result<SandboxExecution, SandboxError> {
        self.execute_with_config(code, dataset, &self.default_config)
    }

    pub fn execute_with_config(
        &self,
        code: &str,
        dataset: &Dataset,
        config: &SandboxConfig,
    ) -> Result<SandboxExecution, SandboxError> {
        self.execute_at(code, dataset, config, tabula_data::dates::now())
    }

    /// Run with an explicit clock; relative dates resolve against `now`.
    pub fn execute_at(
        &self,
        code: &str,
        dataset: &Dataset,
        config: &SandboxConfig,
        now: NaiveDateTime,
    ) -> Result<SandboxExecution, SandboxError> {
        let start = Instant::now();
        let program = compile(code, config)?;
        let statements = program.len();

        let outcome = Interpreter::new(config, dataset, now).run(&program)?;
        let elapsed = start.elapsed();
        debug!(
            statements,
            fuel = outcome.fuel_consumed,
            output = outcome.output.kind(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Procedure finished"
        );

        Ok(SandboxExecution {
            output: outcome.output,
            stdout: outcome.stdout,
            fuel_consumed: outcome.fuel_consumed,
            statements,
            wall_time_ms: elapsed.as_millis() as u64,
        })
    }
}

fn compile(code: &str, config: &SandboxConfig) -> Result<Vec<Statement>, SandboxError> {
    let limits = &config.resource_limits;
    if code.len() > limits.max_source_bytes {
        return Err(SandboxError::SourceTooLarge {
            size: code.len(),
            limit: limits.max_source_bytes,
        });
    }
    let program = parse_with_depth(code, limits.max_depth)?;
    if program.len() > limits.max_statements {
        return Err(SandboxError::TooManyStatements {
            count: program.len(),
            limit: limits.max_statements,
        });
    }
    Ok(program)
}

/// The complete result of a sandboxed run.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxExecution {
    pub output: ProcedureOutput,
    /// Text the procedure printed.
    pub stdout: String,
    pub fuel_consumed: u64,
    pub statements: usize,
    /// Wall-clock time of execution in milliseconds.
    pub wall_time_ms: u64,
}

impl SandboxExecution {
    /// Row count of a table or column output; 1 for a scalar.
    pub fn row_count(&self) -> usize {
        match &self.output {
            ProcedureOutput::Table(t) => t.row_count(),
            ProcedureOutput::Column(c) => c.len(),
            ProcedureOutput::Scalar(_) => 1,
        }
    }

    pub fn within_limits(&self, config: &SandboxConfig) -> bool {
        self.fuel_consumed <= config.resource_limits.max_fuel
            && self.statements <= config.resource_limits.max_statements
    }
}
