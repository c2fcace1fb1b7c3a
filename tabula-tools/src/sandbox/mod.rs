//! Restricted procedure sandbox.
//!
//! Procedures are short scripts in a dataframe dialect: assignments,
//! expressions, method calls on the dataset, boolean masks and group-bys.
//! They run in an interpreter that has no access to files, the network, the
//! process, or any name outside a fixed allow-list. The dataset is bound to
//! `df` and the procedure's answer is whatever it assigns to `result`.
//!
//! ## Architecture
//!
//! ```text
//! SandboxedExecutor
//!     │
//!     ├── lexer   (source → tokens, line tracking)
//!     ├── parser  (tokens → statements, denied constructs rejected)
//!     │
//!     ├── Interpreter
//!     │       ├── Variable table seeded with the dataset
//!     │       ├── Method and attribute allow-lists
//!     │       └── Fuel metering (cost per row produced)
//!     │
//!     └── SandboxConfig
//!             └── ResourceLimits (statements, fuel, source size, time)
//! ```

pub mod config;
pub mod executor;
pub mod lexer;
pub mod parser;
pub mod runtime;

pub use config::{ResourceLimits, SandboxConfig};
pub use executor::{SandboxExecution, SandboxedExecutor};
pub use runtime::{ProcedureOutput, SandboxError};

/// Create a [`SandboxedExecutor`] with default settings.
pub fn create_sandbox() -> SandboxedExecutor {
    SandboxedExecutor::with_defaults()
}

/// Create a [`SandboxedExecutor`] with a custom configuration.
pub fn create_sandbox_with_config(config: SandboxConfig) -> SandboxedExecutor {
    SandboxedExecutor::new(config)
}

/// Validate a procedure without executing it, using default limits.
pub fn validate_procedure(code: &str) -> Result<(), SandboxError> {
    SandboxedExecutor::with_defaults().validate(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_sandbox() {
        let executor = create_sandbox();
        assert_eq!(
            executor.default_config().resource_limits.max_fuel,
            ResourceLimits::default().max_fuel
        );
    }

    #[test]
    fn test_create_sandbox_with_config() {
        let config = SandboxConfig::new().with_fuel_limit(42);
        let executor = create_sandbox_with_config(config);
        assert_eq!(executor.default_config().resource_limits.max_fuel, 42);
    }

    #[test]
    fn test_validate_procedure() {
        assert!(validate_procedure("result = df.head(3)").is_ok());
        assert!(matches!(
            validate_procedure("result = open('/etc/passwd').read()"),
            Err(SandboxError::CapabilityDenied(_))
        ));
        assert!(matches!(
            validate_procedure("for row in df: pass"),
            Err(SandboxError::Syntax { .. })
        ));
        assert!(matches!(
            validate_procedure("result = df.__class__"),
            Err(SandboxError::CapabilityDenied(_))
        ));
    }
}
