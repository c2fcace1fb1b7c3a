//! End-to-end tests for the question answering pipeline.
//!
//! These drive the real strategies through `MockLlmProvider`, so every model
//! reply is scripted and the tests are deterministic.

use pretty_assertions::assert_eq;
use std::io::Write;
use std::sync::Arc;
use tabula_core::brain::MockLlmProvider;
use tabula_core::{DataError, ProfileConfig, TabulaConfig, TabulaError};
use tabula_data::{ConfigProfile, CsvSource, DataProfile, Dataset, load_dataset};
use tabula_engine::{
    AUTO, Confidence, MethodUsed, RagAnswer, StaticRetrievalAgent, SynthesisEngine,
    UnifiedOrchestrator,
};

const SALES_CSV: &str = "region,product,amount,order_date\n\
north,tea,12,2024-05-01\n\
south,coffee,30,2024-05-02\n\
north,coffee,8,2024-05-03\n\
east,tea,5,2024-05-04\n";

fn write_csv(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

fn sales_profile() -> ProfileConfig {
    ProfileConfig {
        name: "sales".into(),
        required_columns: vec!["region".into(), "amount".into()],
        date_columns: vec!["order_date".into()],
        ..Default::default()
    }
}

async fn sales_dataset(profile: &dyn DataProfile) -> (tempfile::NamedTempFile, Arc<Dataset>) {
    let file = write_csv(SALES_CSV);
    let dataset = load_dataset(&CsvSource::new(file.path()), profile, true)
        .await
        .unwrap();
    (file, Arc::new(dataset))
}

fn engine_with(provider: Arc<MockLlmProvider>, dataset: Arc<Dataset>) -> SynthesisEngine {
    let profile: Arc<dyn DataProfile> = Arc::new(ConfigProfile::new(sales_profile()));
    SynthesisEngine::with_provider(provider, dataset, profile, &TabulaConfig::default()).unwrap()
}

#[tokio::test]
async fn test_fallback_switches_strategy_and_records_both() {
    let profile = ConfigProfile::new(sales_profile());
    let (_file, dataset) = sales_dataset(&profile).await;

    let provider = Arc::new(MockLlmProvider::new());
    // procedure is chosen for "sum"; its code is rejected by the sandbox
    provider.queue_response(MockLlmProvider::text_response(
        "import os\nresult = os.listdir('/')",
    ));
    // structured fallback
    provider.queue_response(MockLlmProvider::text_response(
        r#"{"group_by": ["region"], "aggregations": {"amount": "sum"}, "sort": [{"by": "amount", "order": "desc"}]}"#,
    ));

    let engine = engine_with(provider.clone(), dataset);
    assert_eq!(engine.select_strategy("sum of amount by region").as_deref(), Some("procedure"));

    let outcome = engine
        .synthesize_query("sum of amount by region", AUTO)
        .await
        .unwrap();
    assert_eq!(outcome.synthesis_method, "structured");

    let perf = engine.get_performance_stats().await;
    assert_eq!(perf["procedure"].failure_count, 1);
    assert_eq!(perf["procedure"].success_count, 0);
    assert_eq!(perf["structured"].attempts(), 1);
    assert_eq!(perf["agent"].attempts(), 0);
    assert_eq!(provider.request_count(), 2);
}

#[tokio::test]
async fn test_procedure_answer_end_to_end() {
    let profile = ConfigProfile::new(sales_profile());
    let (_file, dataset) = sales_dataset(&profile).await;
    let provider = Arc::new(MockLlmProvider::with_response(
        "```python\nresult = df[df['product'] == 'coffee']['amount'].sum()\n```",
    ));
    let engine = engine_with(provider, dataset);

    let result = engine.execute_query("sum of coffee amount", AUTO).await;
    assert_eq!(result.method, "procedure");
    assert_eq!(result.answer, "38");
    assert_eq!(result.confidence, Confidence::High);
    assert_eq!(result.error, None);
}

#[tokio::test]
async fn test_structured_answer_through_orchestrator() {
    let profile: Arc<dyn DataProfile> = Arc::new(ConfigProfile::new(sales_profile()));
    let (_file, dataset) = sales_dataset(profile.as_ref()).await;
    let provider = Arc::new(MockLlmProvider::with_response(
        r#"{"filters": [{"column": "region", "op": "eq", "value": "north"}], "select": ["region", "amount"]}"#,
    ));
    let engine = Arc::new(engine_with(provider, Arc::clone(&dataset)));
    let orchestrator = UnifiedOrchestrator::new(profile, dataset).with_engine(engine);

    let answer = orchestrator
        .answer_question("show orders in the north", AUTO)
        .await;
    assert_eq!(answer.method_used, MethodUsed::Text2Query);
    assert_eq!(answer.synthesis_method.as_deref(), Some("structured"));
    assert_eq!(answer.answer, "region,amount\nnorth,12\nnorth,8\n");
    assert_eq!(answer.sources.len(), 2);
    assert_eq!(answer.profile, "sales");
}

#[tokio::test]
async fn test_agent_strategy_when_requested() {
    let profile = ConfigProfile::new(sales_profile());
    let (_file, dataset) = sales_dataset(&profile).await;
    let provider = Arc::new(MockLlmProvider::new());
    provider.queue_response(MockLlmProvider::tool_call_response(
        "run_procedure",
        serde_json::json!({"code": "result = df.region.nunique()"}),
    ));
    provider.queue_response(MockLlmProvider::text_response("There are 3 regions."));
    let engine = engine_with(provider, dataset);

    let result = engine.execute_query("how many regions?", "agent").await;
    assert_eq!(result.method, "agent");
    assert_eq!(result.query_type.as_deref(), Some("agent"));
    assert!(result.answer.contains("There are 3 regions."));
    assert_eq!(result.stats.rows, Some(1));
}

#[tokio::test]
async fn test_everything_failing_falls_back_to_rag() {
    let profile: Arc<dyn DataProfile> = Arc::new(ConfigProfile::new(sales_profile()));
    let (_file, dataset) = sales_dataset(profile.as_ref()).await;
    let provider = Arc::new(MockLlmProvider::new());
    for _ in 0..3 {
        provider.queue_error("model offline");
    }
    let engine = Arc::new(engine_with(provider, Arc::clone(&dataset)));
    let rag = Arc::new(StaticRetrievalAgent::new(Some(RagAnswer {
        answer: "North leads on tea.".into(),
        sources: Vec::new(),
        confidence: Some(Confidence::High),
    })));
    let orchestrator = UnifiedOrchestrator::new(profile, dataset)
        .with_engine(engine)
        .with_retrieval(rag);

    let answer = orchestrator.answer_question("who sells the most?", AUTO).await;
    assert_eq!(answer.method_used, MethodUsed::Rag);
    assert_eq!(answer.confidence, Confidence::High);
    assert_eq!(answer.answer, "North leads on tea.");
}

#[tokio::test]
async fn test_from_config_loads_csv() {
    let file = write_csv(SALES_CSV);
    let mut config = TabulaConfig::default();
    config.profile = sales_profile();
    config.data.csv_path = Some(file.path().to_path_buf());
    config.llm.base_url = Some("http://localhost:11434/v1".into());

    let orchestrator = UnifiedOrchestrator::from_config(&config, None).await.unwrap();
    assert_eq!(orchestrator.get_available_methods(), vec!["text2query"]);
    let stats = orchestrator.get_stats().await;
    assert_eq!(stats.data.total_rows, 4);
    assert_eq!(stats.profile, "sales");

    let reloaded = orchestrator.reload().await.unwrap();
    assert_eq!(reloaded, stats.data);
}

#[tokio::test]
async fn test_from_config_without_provider_disables_text2query() {
    let file = write_csv(SALES_CSV);
    let mut config = TabulaConfig::default();
    config.data.csv_path = Some(file.path().to_path_buf());
    config.llm.provider = "carrier-pigeon".into();

    let orchestrator = UnifiedOrchestrator::from_config(&config, None).await.unwrap();
    assert!(orchestrator.get_available_methods().is_empty());
    let answer = orchestrator.answer_question("anything", AUTO).await;
    assert_eq!(answer.method_used, MethodUsed::None);
}

#[tokio::test]
async fn test_from_config_rejects_missing_columns() {
    let file = write_csv("region,qty\nnorth,1\n");
    let mut config = TabulaConfig::default();
    config.profile = sales_profile();
    config.data.csv_path = Some(file.path().to_path_buf());

    let err = UnifiedOrchestrator::from_config(&config, None)
        .await
        .err()
        .unwrap();
    match err {
        TabulaError::Data(DataError::MissingColumns { missing }) => {
            assert_eq!(missing, vec!["amount"]);
        }
        other => panic!("Expected MissingColumns, got: {:?}", other),
    }
}

#[tokio::test]
async fn test_from_config_requires_csv_path() {
    let err = UnifiedOrchestrator::from_config(&TabulaConfig::default(), None)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, TabulaError::Config(_)));
}
