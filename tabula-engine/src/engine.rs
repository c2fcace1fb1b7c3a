//! Synthesis engine: strategy selection, bounded fallback, performance
//! records, and execution of whatever the winning strategy produced.

use crate::response::{Confidence, QueryResult, ResponseBuilder, ResultStats};
use crate::synthesis::{
    AGENT, AgentStrategy, PROCEDURE, ProcedureStrategy, STRUCTURED, StructuredStrategy,
    SynthesisContext, SynthesisFailure, SynthesisOutcome, SynthesisPayload, SynthesisStrategy,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tabula_core::brain::LlmProvider;
use tabula_core::error::{DataError, SynthesisError};
use tabula_core::{ResponseConfig, SynthesisConfig, TabulaConfig};
use tabula_data::{DataProfile, Dataset, DatasetSummary, QuerySpec, Record, validate_required};
use tabula_tools::sandbox::SandboxConfig;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

pub const AUTO: &str = "auto";

/// Phrases that suggest aggregation work.
const AGGREGATION_VOCABULARY: &[&str] = &[
    "group by",
    "aggregate",
    "sum",
    "average",
    "mean",
    "count",
    "max",
    "min",
];

/// Rolling statistics for one strategy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub success_count: u64,
    pub failure_count: u64,
    /// Mean latency of successful attempts, in seconds.
    pub avg_time: f64,
}

impl PerformanceRecord {
    fn record_success(&mut self, elapsed: Duration) {
        self.success_count += 1;
        let n = self.success_count as f64;
        self.avg_time = (self.avg_time * (n - 1.0) + elapsed.as_secs_f64()) / n;
    }

    fn record_failure(&mut self) {
        self.failure_count += 1;
    }

    pub fn attempts(&self) -> u64 {
        self.success_count + self.failure_count
    }
}

/// Outcome of `execute_query`: synthesis plus execution plus rendering.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryExecution {
    pub answer: String,
    pub sources: Vec<Record>,
    pub stats: ResultStats,
    /// Strategy that produced the answer, or the last one tried.
    pub method: String,
    /// Seconds.
    pub execution_time: f64,
    pub confidence: Confidence,
    pub query_type: Option<String>,
    pub query_spec: Option<QuerySpec>,
    pub error: Option<String>,
}

pub struct SynthesisEngine {
    strategies: Vec<Arc<dyn SynthesisStrategy>>,
    profile: Arc<dyn DataProfile>,
    dataset: RwLock<Arc<Dataset>>,
    config: SynthesisConfig,
    responses: ResponseBuilder,
    performance: Mutex<BTreeMap<String, PerformanceRecord>>,
}

impl SynthesisEngine {
    /// Create an engine with no strategies. Fails when the dataset lacks a
    /// column the profile requires.
    pub fn new(
        dataset: Arc<Dataset>,
        profile: Arc<dyn DataProfile>,
        config: SynthesisConfig,
        response: ResponseConfig,
    ) -> Result<Self, DataError> {
        validate_required(&dataset, profile.required_columns())?;
        Ok(Self {
            strategies: Vec::new(),
            responses: ResponseBuilder::new(Arc::clone(&profile), response),
            profile,
            dataset: RwLock::new(dataset),
            config,
            performance: Mutex::new(BTreeMap::new()),
        })
    }

    /// Create an engine with the structured, procedure and agent strategies,
    /// all backed by `provider`.
    pub fn with_provider(
        provider: Arc<dyn LlmProvider>,
        dataset: Arc<Dataset>,
        profile: Arc<dyn DataProfile>,
        config: &TabulaConfig,
    ) -> Result<Self, DataError> {
        let sandbox = SandboxConfig::new().with_statement_limit(config.synthesis.max_statements);
        let engine = Self::new(
            dataset,
            profile,
            config.synthesis.clone(),
            config.response.clone(),
        )?
        .with_strategy(Arc::new(StructuredStrategy::new(Arc::clone(&provider))))
        .with_strategy(Arc::new(ProcedureStrategy::new(
            Arc::clone(&provider),
            sandbox.clone(),
        )))
        .with_strategy(Arc::new(AgentStrategy::new(
            provider,
            config.synthesis.agent_max_steps,
            sandbox,
        )));
        info!(
            methods = ?engine.get_available_methods(),
            "Synthesis engine initialized"
        );
        Ok(engine)
    }

    /// Append a strategy. Earlier strategies win ties in selection.
    pub fn with_strategy(mut self, strategy: Arc<dyn SynthesisStrategy>) -> Self {
        self.performance
            .get_mut()
            .insert(strategy.name().to_string(), PerformanceRecord::default());
        self.strategies.push(strategy);
        self
    }

    pub fn profile(&self) -> &Arc<dyn DataProfile> {
        &self.profile
    }

    pub fn config(&self) -> &SynthesisConfig {
        &self.config
    }

    /// Names of strategies that can currently run, in priority order.
    pub fn get_available_methods(&self) -> Vec<String> {
        self.strategies
            .iter()
            .filter(|s| s.is_available())
            .map(|s| s.name().to_string())
            .collect()
    }

    fn available(&self, name: &str) -> Option<&Arc<dyn SynthesisStrategy>> {
        self.strategies
            .iter()
            .find(|s| s.name() == name && s.is_available())
    }

    /// Pick a strategy for `question` when the caller asked for `auto`.
    pub fn select_strategy(&self, question: &str) -> Option<String> {
        let available = self.get_available_methods();
        let has = |name: &str| available.iter().any(|m| m == name);
        let lower = question.to_lowercase();

        if AGGREGATION_VOCABULARY.iter().any(|w| lower.contains(w)) {
            if has(PROCEDURE) {
                return Some(PROCEDURE.to_string());
            }
            if has(AGENT) {
                return Some(AGENT.to_string());
            }
        }
        if has(STRUCTURED) {
            return Some(STRUCTURED.to_string());
        }
        available.into_iter().next()
    }

    /// Next strategy to try after `failed`, skipping any already tried.
    fn fallback_for(&self, failed: &str, tried: &[String]) -> Option<String> {
        [STRUCTURED, PROCEDURE]
            .into_iter()
            .find(|name| {
                *name != failed
                    && !tried.iter().any(|t| t.as_str() == *name)
                    && self.available(name).is_some()
            })
            .map(str::to_string)
    }

    pub async fn dataset(&self) -> Arc<Dataset> {
        Arc::clone(&*self.dataset.read().await)
    }

    /// Swap in a freshly loaded dataset.
    pub async fn set_dataset(&self, dataset: Arc<Dataset>) {
        *self.dataset.write().await = dataset;
    }

    async fn context(&self) -> SynthesisContext {
        SynthesisContext::new(
            self.dataset().await,
            Arc::clone(&self.profile),
            self.config.sample_rows,
        )
    }

    /// Turn `question` into a payload with `method` (or `auto`), falling
    /// back to other strategies on failure.
    pub async fn synthesize_query(
        &self,
        question: &str,
        method: &str,
    ) -> Result<SynthesisOutcome, SynthesisFailure> {
        let requested = if method.is_empty() { AUTO } else { method };
        let mut current = if requested == AUTO {
            self.select_strategy(question).ok_or_else(|| SynthesisFailure {
                kind: "unavailable".to_string(),
                message: "No synthesis methods available".to_string(),
                synthesis_method: requested.to_string(),
            })?
        } else {
            requested.to_string()
        };

        let ctx = self.context().await;
        let mut tried: Vec<String> = Vec::new();
        loop {
            info!(method = %current, "Using synthesis method");
            tried.push(current.clone());

            let start = Instant::now();
            let attempt = match self.available(&current) {
                Some(strategy) => strategy
                    .synthesize(question, &ctx)
                    .await
                    .map(|payload| (payload, strategy.query_type().to_string())),
                None => Err(SynthesisError::Unavailable {
                    strategy: current.clone(),
                }),
            };
            let elapsed = start.elapsed();

            match attempt {
                Ok((payload, query_type)) => {
                    self.record(&current, Some(elapsed)).await;
                    debug!(
                        method = %current,
                        payload = payload.kind(),
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Synthesis succeeded"
                    );
                    return Ok(SynthesisOutcome {
                        payload,
                        synthesis_method: current,
                        elapsed,
                        query_type,
                    });
                }
                Err(e) => {
                    warn!(method = %current, kind = e.kind(), error = %e, "Synthesis failed");
                    self.record(&current, None).await;

                    let hops = tried.len() - 1;
                    if hops < self.config.max_fallback_hops
                        && let Some(next) = self.fallback_for(&current, &tried)
                    {
                        info!(from = %current, to = %next, "Trying fallback method");
                        current = next;
                        continue;
                    }

                    let terminal = SynthesisError::AllFailed {
                        last_error: e.to_string(),
                    };
                    return Err(SynthesisFailure {
                        kind: terminal.kind().to_string(),
                        message: terminal.to_string(),
                        synthesis_method: current,
                    });
                }
            }
        }
    }

    /// `None` elapsed records a failure.
    async fn record(&self, method: &str, elapsed: Option<Duration>) {
        let mut performance = self.performance.lock().await;
        let Some(record) = performance.get_mut(method) else {
            return;
        };
        match elapsed {
            Some(elapsed) => record.record_success(elapsed),
            None => record.record_failure(),
        }
    }

    /// Synthesize, execute and render an answer for `question`.
    pub async fn execute_query(&self, question: &str, method: &str) -> QueryExecution {
        let start = Instant::now();
        let outcome = match self.synthesize_query(question, method).await {
            Ok(outcome) => outcome,
            Err(failure) => {
                return QueryExecution {
                    answer: format!("Error: {}", failure.message),
                    sources: Vec::new(),
                    stats: ResultStats::default(),
                    method: failure.synthesis_method,
                    execution_time: start.elapsed().as_secs_f64(),
                    confidence: Confidence::Low,
                    query_type: Some(failure.kind),
                    query_spec: None,
                    error: Some(failure.message),
                };
            }
        };

        let (result, spec) = match outcome.payload {
            SynthesisPayload::Spec(spec) => {
                let dataset = self.dataset().await;
                let execution =
                    tabula_data::execute(&dataset, &spec, self.profile.date_columns());
                for warning in &execution.warnings {
                    warn!(warning = %warning, "Query stage skipped");
                }
                (QueryResult::Table(execution.table), Some(spec))
            }
            SynthesisPayload::Table(table) => (QueryResult::Table(table), None),
            SynthesisPayload::Column(column) => (QueryResult::from(column), None),
            SynthesisPayload::Scalar(value) => (QueryResult::Scalar(value), None),
        };

        let built = self.responses.build_response(Some(&result), spec.as_ref());
        QueryExecution {
            answer: built.answer,
            sources: built.sources,
            stats: built.stats,
            method: outcome.synthesis_method,
            execution_time: start.elapsed().as_secs_f64(),
            confidence: built.confidence,
            query_type: Some(outcome.query_type),
            query_spec: built.query_spec,
            error: None,
        }
    }

    pub async fn get_performance_stats(&self) -> BTreeMap<String, PerformanceRecord> {
        self.performance.lock().await.clone()
    }

    pub async fn get_stats(&self) -> DatasetSummary {
        self.dataset.read().await.summary()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tabula_core::ProfileConfig;
    use tabula_data::{Column, ConfigProfile, Value};

    /// Strategy returning a fixed payload or failing.
    struct Stub {
        name: &'static str,
        payload: Option<SynthesisPayload>,
        available: bool,
        calls: AtomicUsize,
    }

    impl Stub {
        fn ok(name: &'static str, payload: SynthesisPayload) -> Arc<Self> {
            Arc::new(Self {
                name,
                payload: Some(payload),
                available: true,
                calls: AtomicUsize::new(0),
            })
        }

        fn failing(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                payload: None,
                available: true,
                calls: AtomicUsize::new(0),
            })
        }

        fn unavailable(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                payload: None,
                available: false,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl SynthesisStrategy for Stub {
        fn name(&self) -> &str {
            self.name
        }

        fn is_available(&self) -> bool {
            self.available
        }

        async fn synthesize(
            &self,
            _question: &str,
            _ctx: &SynthesisContext,
        ) -> Result<SynthesisPayload, SynthesisError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.payload.clone().ok_or(SynthesisError::UnusableOutput {
                strategy: self.name.to_string(),
                message: "stub failure".to_string(),
            })
        }
    }

    fn dataset() -> Arc<Dataset> {
        Arc::new(
            Dataset::new(vec![
                Column::new(
                    "region",
                    vec![
                        Value::Text("north".into()),
                        Value::Text("south".into()),
                        Value::Text("north".into()),
                    ],
                ),
                Column::new("amount", vec![Value::Int(5), Value::Int(7), Value::Int(3)]),
            ])
            .unwrap(),
        )
    }

    fn engine() -> SynthesisEngine {
        SynthesisEngine::new(
            dataset(),
            Arc::new(ConfigProfile::default()),
            SynthesisConfig::default(),
            ResponseConfig::default(),
        )
        .unwrap()
    }

    fn scalar(v: i64) -> SynthesisPayload {
        SynthesisPayload::Scalar(Value::Int(v))
    }

    #[test]
    fn test_missing_required_columns_abort_construction() {
        let profile = ConfigProfile::new(ProfileConfig {
            required_columns: vec!["region".into(), "owner".into()],
            ..Default::default()
        });
        let err = SynthesisEngine::new(
            dataset(),
            Arc::new(profile),
            SynthesisConfig::default(),
            ResponseConfig::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, DataError::MissingColumns { missing } if missing == vec!["owner"]));
    }

    #[test]
    fn test_selection() {
        let e = engine()
            .with_strategy(Stub::ok(STRUCTURED, scalar(1)))
            .with_strategy(Stub::ok(PROCEDURE, scalar(2)))
            .with_strategy(Stub::ok(AGENT, scalar(3)));
        assert_eq!(e.select_strategy("Average amount by region").as_deref(), Some(PROCEDURE));
        assert_eq!(e.select_strategy("show north orders").as_deref(), Some(STRUCTURED));

        let e = engine()
            .with_strategy(Stub::ok(STRUCTURED, scalar(1)))
            .with_strategy(Stub::unavailable(PROCEDURE))
            .with_strategy(Stub::ok(AGENT, scalar(3)));
        assert_eq!(e.select_strategy("count orders").as_deref(), Some(AGENT));
        assert_eq!(e.get_available_methods(), vec![STRUCTURED, AGENT]);

        let e = engine().with_strategy(Stub::ok("custom", scalar(1)));
        assert_eq!(e.select_strategy("anything").as_deref(), Some("custom"));
        assert_eq!(engine().select_strategy("anything"), None);
    }

    #[tokio::test]
    async fn test_fallback_to_structured() {
        let e = engine()
            .with_strategy(Stub::ok(STRUCTURED, scalar(1)))
            .with_strategy(Stub::failing(PROCEDURE));
        let outcome = e.synthesize_query("sum of amount", AUTO).await.unwrap();
        assert_eq!(outcome.synthesis_method, STRUCTURED);
        assert_eq!(outcome.query_type, STRUCTURED);

        let perf = e.get_performance_stats().await;
        assert_eq!(perf[PROCEDURE].failure_count, 1);
        assert_eq!(perf[PROCEDURE].success_count, 0);
        assert_eq!(perf[STRUCTURED].attempts(), 1);
    }

    #[tokio::test]
    async fn test_fallback_never_retries_and_is_bounded() {
        let structured = Stub::failing(STRUCTURED);
        let procedure = Stub::failing(PROCEDURE);
        let agent = Stub::failing(AGENT);
        let e = engine()
            .with_strategy(structured.clone())
            .with_strategy(procedure.clone())
            .with_strategy(agent.clone());

        let failure = e.synthesize_query("q", AGENT).await.unwrap_err();
        assert_eq!(failure.kind, "synthesis_error");
        assert_eq!(failure.synthesis_method, PROCEDURE);
        assert!(failure.message.starts_with("All synthesis methods failed. Last error:"));
        assert_eq!(agent.calls.load(Ordering::SeqCst), 1);
        assert_eq!(structured.calls.load(Ordering::SeqCst), 1);
        assert_eq!(procedure.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_hop_limit_from_config() {
        let e = SynthesisEngine::new(
            dataset(),
            Arc::new(ConfigProfile::default()),
            SynthesisConfig {
                max_fallback_hops: 0,
                ..Default::default()
            },
            ResponseConfig::default(),
        )
        .unwrap()
        .with_strategy(Stub::ok(STRUCTURED, scalar(1)))
        .with_strategy(Stub::failing(PROCEDURE));
        let failure = e.synthesize_query("q", PROCEDURE).await.unwrap_err();
        assert_eq!(failure.synthesis_method, PROCEDURE);
    }

    #[tokio::test]
    async fn test_unknown_method_falls_back() {
        let e = engine().with_strategy(Stub::ok(STRUCTURED, scalar(9)));
        let outcome = e.synthesize_query("q", "telepathy").await.unwrap();
        assert_eq!(outcome.synthesis_method, STRUCTURED);
    }

    #[tokio::test]
    async fn test_average_latency_ignores_failures() {
        let mut record = PerformanceRecord::default();
        record.record_success(Duration::from_millis(100));
        record.record_failure();
        record.record_success(Duration::from_millis(300));
        assert_eq!(record.success_count, 2);
        assert_eq!(record.failure_count, 1);
        assert!((record.avg_time - 0.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_execute_spec_payload() {
        let spec = QuerySpec::from_json(&serde_json::json!({
            "group_by": ["region"],
            "aggregations": {"amount": "sum"},
            "sort": [{"by": "amount", "order": "desc"}]
        }));
        let e = engine().with_strategy(Stub::ok(STRUCTURED, SynthesisPayload::Spec(spec)));
        let result = e.execute_query("totals", AUTO).await;
        assert_eq!(result.answer, "region,amount\nnorth,8\nsouth,7\n");
        assert_eq!(result.method, STRUCTURED);
        assert_eq!(result.confidence, Confidence::High);
        assert_eq!(result.stats.rows, Some(2));
        assert!(result.query_spec.is_some());
        assert_eq!(result.error, None);
    }

    #[tokio::test]
    async fn test_execute_scalar_payload() {
        let e = engine().with_strategy(Stub::ok(PROCEDURE, scalar(15)));
        let result = e.execute_query("sum of amount", AUTO).await;
        assert_eq!(result.answer, "15");
        assert_eq!(result.sources[0]["result"], "15");
        assert_eq!(result.stats.value.as_deref(), Some("15"));
    }

    #[tokio::test]
    async fn test_execute_failure() {
        let e = engine().with_strategy(Stub::failing(STRUCTURED));
        let result = e.execute_query("q", AUTO).await;
        assert!(result.answer.starts_with("Error: All synthesis methods failed."));
        assert_eq!(result.confidence, Confidence::Low);
        assert!(result.error.is_some());
        assert!(result.sources.is_empty());
    }

    #[tokio::test]
    async fn test_set_dataset() {
        let e = engine();
        assert_eq!(e.get_stats().await.total_rows, 3);
        e.set_dataset(Arc::new(dataset().head(1))).await;
        assert_eq!(e.get_stats().await.total_rows, 1);
    }
}
