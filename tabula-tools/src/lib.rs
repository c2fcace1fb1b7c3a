//! # Tabula Tools
//!
//! The tool registry used by tool-calling synthesis, the restricted
//! procedure sandbox, and the tool that runs procedures against a dataset.

pub mod dataset_tool;
pub mod registry;
pub mod sandbox;

pub use dataset_tool::RunProcedureTool;
pub use registry::{Tool, ToolRegistry};
pub use sandbox::{
    ProcedureOutput, ResourceLimits, SandboxConfig, SandboxError, SandboxExecution,
    SandboxedExecutor, create_sandbox, create_sandbox_with_config, validate_procedure,
};
