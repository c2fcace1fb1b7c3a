//! Agent strategy: a bounded tool-calling loop.
//!
//! The model sees the schema and the question and may call `run_procedure`
//! as often as it likes within the step budget. Each tool result (or error)
//! is fed back into the conversation. The loop ends on the first plain-text
//! reply, which becomes the answer.

use super::{AGENT, SynthesisContext, SynthesisPayload, SynthesisStrategy};
use async_trait::async_trait;
use std::sync::Arc;
use tabula_core::brain::LlmProvider;
use tabula_core::error::SynthesisError;
use tabula_core::types::{CompletionRequest, Content, Message};
use tabula_data::{Column, Dataset, Value};
use tabula_tools::sandbox::SandboxConfig;
use tabula_tools::{RunProcedureTool, ToolRegistry};
use tracing::{debug, info, warn};

const INSTRUCTIONS: &str = "Answer the user's question about the table. Use the run_procedure \
tool to compute anything you need; never guess numbers. When you have the answer, reply with \
plain text only.";

pub struct AgentStrategy {
    provider: Arc<dyn LlmProvider>,
    max_steps: usize,
    sandbox: SandboxConfig,
}

impl AgentStrategy {
    pub fn new(provider: Arc<dyn LlmProvider>, max_steps: usize, sandbox: SandboxConfig) -> Self {
        Self {
            provider,
            max_steps,
            sandbox,
        }
    }

    fn build_context(question: &str, ctx: &SynthesisContext) -> String {
        format!(
            "You have access to a table called 'df' with the following schema:\n{}\n\
             Profile context: {}\n\nUser question: {}",
            ctx.sample_hint,
            ctx.profile.domain_context(),
            question
        )
    }

    fn registry(&self, ctx: &SynthesisContext) -> Result<ToolRegistry, SynthesisError> {
        let mut registry = ToolRegistry::new();
        registry
            .register(Arc::new(RunProcedureTool::new(
                Arc::clone(&ctx.dataset),
                self.sandbox.clone(),
            )))
            .map_err(|e| SynthesisError::Unavailable {
                strategy: format!("{} ({})", AGENT, e),
            })?;
        Ok(registry)
    }

    /// Run a tool call and append its result to the conversation.
    async fn handle_tool_call(
        registry: &ToolRegistry,
        messages: &mut Vec<Message>,
        id: &str,
        name: &str,
        arguments: &serde_json::Value,
    ) {
        info!(tool = name, "Agent requesting tool execution");
        let message = match registry.execute(name, arguments.clone()).await {
            Ok(output) => Message::tool_result(id, output.content, false),
            Err(e) => {
                debug!(tool = name, error = %e, "Tool call failed; returning error to model");
                Message::tool_result(id, e.to_string(), true)
            }
        };
        messages.push(message);
    }

    fn answer_table(question: &str, answer: &str) -> Result<Dataset, SynthesisError> {
        Dataset::new(vec![
            Column::new("question", vec![Value::Text(question.to_string())]),
            Column::new("answer", vec![Value::Text(answer.to_string())]),
            Column::new("method", vec![Value::Text(AGENT.to_string())]),
        ])
        .map_err(|e| SynthesisError::UnusableOutput {
            strategy: AGENT.into(),
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl SynthesisStrategy for AgentStrategy {
    fn name(&self) -> &str {
        AGENT
    }

    fn is_available(&self) -> bool {
        self.provider.supports_tools()
    }

    async fn synthesize(
        &self,
        question: &str,
        ctx: &SynthesisContext,
    ) -> Result<SynthesisPayload, SynthesisError> {
        if !self.is_available() {
            return Err(SynthesisError::Unavailable {
                strategy: AGENT.into(),
            });
        }
        for issue in ctx.dataset.quality_issues() {
            warn!(issue = %issue, "Dataset quality issue");
        }

        let registry = self.registry(ctx)?;
        let tools = registry.list_definitions();
        let system = format!("{}\n\n{}", ctx.profile.system_prompt(), INSTRUCTIONS);
        let mut messages = vec![
            Message::system(system),
            Message::user(Self::build_context(question, ctx)),
        ];

        for step in 1..=self.max_steps {
            debug!(step, max_steps = self.max_steps, "Agent loop iteration");
            let response = self
                .provider
                .complete(CompletionRequest {
                    messages: messages.clone(),
                    tools: Some(tools.clone()),
                    ..Default::default()
                })
                .await
                .map_err(|source| SynthesisError::Model {
                    strategy: AGENT.into(),
                    source,
                })?;

            let final_text = match &response.message.content {
                Content::Text { text } => Some(text.clone()),
                Content::ToolCall {
                    id,
                    name,
                    arguments,
                } => {
                    messages.push(response.message.clone());
                    Self::handle_tool_call(&registry, &mut messages, id, name, arguments).await;
                    None
                }
                Content::MultiPart { parts } => {
                    messages.push(response.message.clone());
                    let mut has_tool_call = false;
                    for part in parts {
                        if let Content::ToolCall {
                            id,
                            name,
                            arguments,
                        } = part
                        {
                            has_tool_call = true;
                            Self::handle_tool_call(&registry, &mut messages, id, name, arguments)
                                .await;
                        }
                    }
                    if has_tool_call {
                        None
                    } else {
                        Some(response.message.content.joined_text().unwrap_or_default())
                    }
                }
                Content::ToolResult { .. } => {
                    return Err(SynthesisError::UnusableOutput {
                        strategy: AGENT.into(),
                        message: "model replied with a tool result".to_string(),
                    });
                }
            };

            if let Some(text) = final_text {
                let answer = text.trim();
                if answer.is_empty() {
                    return Err(SynthesisError::UnusableOutput {
                        strategy: AGENT.into(),
                        message: "empty final answer".to_string(),
                    });
                }
                info!(steps = step, "Agent produced text response");
                return Ok(SynthesisPayload::Table(Self::answer_table(question, answer)?));
            }
        }

        warn!(max_steps = self.max_steps, "Agent step budget exhausted");
        Err(SynthesisError::StepBudgetExhausted {
            max_steps: self.max_steps,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tabula_core::types::Role;
    use tabula_core::{MockLlmProvider, ProfileConfig};
    use tabula_data::ConfigProfile;

    fn ctx() -> SynthesisContext {
        let dataset = Dataset::new(vec![
            Column::new(
                "product",
                vec![Value::Text("tea".into()), Value::Text("coffee".into())],
            ),
            Column::new("units", vec![Value::Int(12), Value::Int(30)]),
        ])
        .unwrap();
        SynthesisContext::new(
            Arc::new(dataset),
            Arc::new(ConfigProfile::new(ProfileConfig::default())),
            2,
        )
    }

    #[tokio::test]
    async fn test_tool_then_answer() {
        let provider = Arc::new(MockLlmProvider::new());
        provider.queue_response(MockLlmProvider::tool_call_response(
            "run_procedure",
            json!({"code": "result = df.sort_values('units', ascending=False).head(1)['product']"}),
        ));
        provider.queue_response(MockLlmProvider::text_response("Coffee sells the most."));

        let strategy = AgentStrategy::new(provider.clone(), 4, SandboxConfig::default());
        let payload = strategy.synthesize("best seller?", &ctx()).await.unwrap();
        let SynthesisPayload::Table(table) = payload else {
            panic!("Expected a table");
        };
        assert_eq!(table.row_count(), 1);
        assert_eq!(
            table.value(0, "answer"),
            Some(&Value::Text("Coffee sells the most.".into()))
        );
        assert_eq!(table.value(0, "method"), Some(&Value::Text("agent".into())));

        // second request carries the tool result back to the model
        assert_eq!(provider.request_count(), 2);
        let last = provider.last_request().unwrap();
        let tool_msg = last.messages.last().unwrap();
        assert_eq!(tool_msg.role, Role::Tool);
        match &tool_msg.content {
            Content::ToolResult {
                output, is_error, ..
            } => {
                assert!(!is_error);
                assert!(output.contains("coffee"));
            }
            other => panic!("Expected a tool result, got {:?}", other),
        }
        assert_eq!(last.tools.as_ref().map(|t| t.len()), Some(1));
    }

    #[tokio::test]
    async fn test_tool_errors_are_fed_back() {
        let provider = Arc::new(MockLlmProvider::new());
        provider.queue_response(MockLlmProvider::tool_call_response(
            "run_procedure",
            json!({"code": "import os"}),
        ));
        provider.queue_response(MockLlmProvider::text_response("I could not compute that."));

        let strategy = AgentStrategy::new(provider.clone(), 4, SandboxConfig::default());
        strategy.synthesize("q", &ctx()).await.unwrap();
        let last = provider.last_request().unwrap();
        assert!(matches!(
            last.messages.last().unwrap().content,
            Content::ToolResult { is_error: true, .. }
        ));
    }

    #[tokio::test]
    async fn test_step_budget_exhausted() {
        let provider = Arc::new(MockLlmProvider::new());
        for _ in 0..3 {
            provider.queue_response(MockLlmProvider::tool_call_response(
                "run_procedure",
                json!({"code": "result = len(df)"}),
            ));
        }
        let strategy = AgentStrategy::new(provider.clone(), 2, SandboxConfig::default());
        let err = strategy.synthesize("q", &ctx()).await.unwrap_err();
        assert!(matches!(err, SynthesisError::StepBudgetExhausted { max_steps: 2 }));
        assert_eq!(provider.request_count(), 2);
    }

    #[tokio::test]
    async fn test_context_mentions_schema_and_question() {
        let provider = Arc::new(MockLlmProvider::with_response("42"));
        let strategy = AgentStrategy::new(provider.clone(), 2, SandboxConfig::default());
        strategy.synthesize("how many units?", &ctx()).await.unwrap();
        let request = provider.last_request().unwrap();
        let context = request.messages[1].content.as_text().unwrap();
        assert!(context.starts_with("You have access to a table called 'df'"));
        assert!(context.contains("- units (numeric)"));
        assert!(context.contains("Profile context: Standard data analysis profile"));
        assert!(context.ends_with("User question: how many units?"));
    }
}
