//! Tool registry: holds the tools a model may call during a synthesis loop.
//!
//! Tools are registered when a loop is set up. The registry hands their
//! definitions to the LLM and executes calls by name with a per-tool timeout.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tabula_core::error::ToolError;
use tabula_core::types::{ToolDefinition, ToolOutput};
use tracing::{debug, info};

/// Something the agent strategy can call by name.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    /// Shown to the model next to the name.
    fn description(&self) -> &str;

    /// JSON Schema of the arguments object.
    fn parameters_schema(&self) -> serde_json::Value;

    async fn execute(&self, args: serde_json::Value) -> Result<ToolOutput, ToolError>;

    /// Calls running longer are cancelled by the registry.
    fn timeout(&self) -> Duration {
        Duration::from_secs(30)
    }
}

/// Registered tools, keyed by name.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. Fails if the name is already taken.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), ToolError> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(ToolError::AlreadyRegistered { name });
        }
        debug!(tool = %name, "Registering tool");
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn unregister(&mut self, name: &str) -> Result<(), ToolError> {
        if self.tools.remove(name).is_none() {
            return Err(ToolError::NotFound {
                name: name.to_string(),
            });
        }
        debug!(tool = %name, "Unregistered tool");
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Tool definitions for a completion request, sorted by name.
    pub fn list_definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Execute a tool by name, applying its timeout.
    pub async fn execute(
        &self,
        name: &str,
        args: serde_json::Value,
    ) -> Result<ToolOutput, ToolError> {
        let tool = self.tools.get(name).ok_or_else(|| ToolError::NotFound {
            name: name.to_string(),
        })?;

        let timeout = tool.timeout();
        info!(tool = %name, timeout_secs = timeout.as_secs(), "Executing tool");

        match tokio::time::timeout(timeout, tool.execute(args)).await {
            Ok(result) => result,
            Err(_) => Err(ToolError::Timeout {
                name: name.to_string(),
                timeout_secs: timeout.as_secs(),
            }),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct UpperTool;

    #[async_trait]
    impl Tool for UpperTool {
        fn name(&self) -> &str {
            "upper"
        }

        fn description(&self) -> &str {
            "Upper-cases a column name"
        }

        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({
                "type": "object",
                "properties": {
                    "column": { "type": "string" }
                },
                "required": ["column"]
            })
        }

        async fn execute(&self, args: serde_json::Value) -> Result<ToolOutput, ToolError> {
            let column = args["column"]
                .as_str()
                .ok_or_else(|| ToolError::InvalidArguments {
                    name: "upper".to_string(),
                    reason: "missing 'column' parameter".to_string(),
                })?;
            Ok(ToolOutput::text(column.to_uppercase()))
        }
    }

    struct StuckTool;

    #[async_trait]
    impl Tool for StuckTool {
        fn name(&self) -> &str {
            "stuck"
        }

        fn description(&self) -> &str {
            "Never finishes"
        }

        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }

        async fn execute(&self, _args: serde_json::Value) -> Result<ToolOutput, ToolError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(ToolOutput::text("done"))
        }

        fn timeout(&self) -> Duration {
            Duration::from_millis(50)
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = ToolRegistry::new();
        assert!(registry.is_empty());
        registry.register(Arc::new(UpperTool)).unwrap();
        registry.register(Arc::new(StuckTool)).unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.get("upper").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.list_names(), vec!["stuck", "upper"]);
        let defs = registry.list_definitions();
        assert_eq!(defs[1].name, "upper");
        assert_eq!(defs[1].parameters["required"][0], "column");
    }

    #[test]
    fn test_register_duplicate() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(UpperTool)).unwrap();
        match registry.register(Arc::new(UpperTool)).unwrap_err() {
            ToolError::AlreadyRegistered { name } => assert_eq!(name, "upper"),
            e => panic!("Expected AlreadyRegistered, got: {:?}", e),
        }
    }

    #[test]
    fn test_unregister() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(UpperTool)).unwrap();
        registry.unregister("upper").unwrap();
        assert!(registry.is_empty());
        assert!(registry.unregister("upper").is_err());
    }

    #[tokio::test]
    async fn test_execute() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(UpperTool)).unwrap();

        let out = registry
            .execute("upper", serde_json::json!({"column": "region"}))
            .await
            .unwrap();
        assert_eq!(out.content, "REGION");

        let err = registry
            .execute("upper", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments { .. }));
    }

    #[tokio::test]
    async fn test_execute_unknown_tool() {
        let registry = ToolRegistry::new();
        match registry.execute("nope", serde_json::json!({})).await {
            Err(ToolError::NotFound { name }) => assert_eq!(name, "nope"),
            other => panic!("Expected NotFound, got: {:?}", other.map(|o| o.content)),
        }
    }

    #[tokio::test]
    async fn test_execute_timeout() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(StuckTool)).unwrap();
        match registry.execute("stuck", serde_json::json!({})).await {
            Err(ToolError::Timeout { name, .. }) => assert_eq!(name, "stuck"),
            other => panic!("Expected Timeout, got: {:?}", other.map(|o| o.content)),
        }
    }
}
