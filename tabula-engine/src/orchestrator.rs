//! Unified orchestrator: one entry point answering questions through query
//! synthesis first and retrieval second.
//!
//! ```text
//! question ──► SynthesisEngine::execute_query ──► answer? ──► text2query
//!                         │ error / empty
//!                         ▼
//!              RetrievalAgent::answer_question ──► answer? ──► rag
//!                         │ nothing
//!                         ▼
//!                      apology ──► none
//! ```

use crate::engine::{AUTO, PerformanceRecord, QueryExecution, SynthesisEngine};
use crate::response::{Confidence, ResultStats};
use crate::retrieval::RetrievalAgent;
use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tabula_core::error::{ConfigError, SynthesisError, TabulaError};
use tabula_core::{TabulaConfig, create_provider};
use tabula_data::{
    ConfigProfile, CsvSource, DataProfile, DataSource, Dataset, DatasetSummary, Record,
    load_dataset,
};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

pub const APOLOGY: &str = "I'm sorry, I couldn't find an answer to your question. \
Please try rephrasing it or providing more specific details.";

pub const TEXT2QUERY: &str = "text2query";
pub const RAG: &str = "rag";

/// Which path produced an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MethodUsed {
    #[serde(rename = "text2query")]
    Text2Query,
    #[serde(rename = "rag")]
    Rag,
    #[serde(rename = "none")]
    None,
    #[serde(rename = "error")]
    Error,
}

impl fmt::Display for MethodUsed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MethodUsed::Text2Query => write!(f, "text2query"),
            MethodUsed::Rag => write!(f, "rag"),
            MethodUsed::None => write!(f, "none"),
            MethodUsed::Error => write!(f, "error"),
        }
    }
}

/// The externally visible answer contract.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnifiedAnswer {
    pub answer: String,
    pub sources: Vec<Record>,
    pub confidence: Confidence,
    pub method_used: MethodUsed,
    /// Strategy name when `method_used` is text2query.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synthesis_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<ResultStats>,
    /// Seconds.
    pub execution_time: f64,
    /// RFC 3339.
    pub timestamp: String,
    pub profile: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineAvailability {
    pub text2query_available: bool,
    pub rag_available: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrchestratorStats {
    pub profile: String,
    pub data: DatasetSummary,
    pub engines: EngineAvailability,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rag: Option<Json>,
}

/// Partial answer before metadata is stamped on.
struct Draft {
    answer: String,
    sources: Vec<Record>,
    confidence: Confidence,
    method_used: MethodUsed,
    synthesis_method: Option<String>,
    stats: Option<ResultStats>,
    error: Option<String>,
}

pub struct UnifiedOrchestrator {
    profile: Arc<dyn DataProfile>,
    engine: Option<Arc<SynthesisEngine>>,
    retrieval: Option<Arc<dyn RetrievalAgent>>,
    source: Option<Arc<dyn DataSource>>,
    dataset: RwLock<Arc<Dataset>>,
    convert_dates: bool,
}

impl UnifiedOrchestrator {
    /// An orchestrator over a prepared dataset with neither answering path.
    pub fn new(profile: Arc<dyn DataProfile>, dataset: Arc<Dataset>) -> Self {
        Self {
            profile,
            engine: None,
            retrieval: None,
            source: None,
            dataset: RwLock::new(dataset),
            convert_dates: true,
        }
    }

    pub fn with_engine(mut self, engine: Arc<SynthesisEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn with_retrieval(mut self, retrieval: Arc<dyn RetrievalAgent>) -> Self {
        self.retrieval = Some(retrieval);
        self
    }

    /// Source used by [`reload`](Self::reload).
    pub fn with_source(mut self, source: Arc<dyn DataSource>, convert_dates: bool) -> Self {
        self.source = Some(source);
        self.convert_dates = convert_dates;
        self
    }

    /// Build everything from configuration: load the CSV, create the LLM
    /// provider and the synthesis engine. A provider that cannot be created
    /// leaves the text2query path disabled; a dataset missing required
    /// columns is an error.
    pub async fn from_config(
        config: &TabulaConfig,
        retrieval: Option<Arc<dyn RetrievalAgent>>,
    ) -> Result<Self, TabulaError> {
        let profile: Arc<dyn DataProfile> = Arc::new(ConfigProfile::new(config.profile.clone()));
        let path = config
            .data
            .csv_path
            .clone()
            .ok_or_else(|| ConfigError::Invalid {
                message: "data.csv_path is not set".to_string(),
            })?;
        let source: Arc<dyn DataSource> =
            Arc::new(CsvSource::new(path).with_delimiter(config.data.delimiter));
        let dataset = Arc::new(
            load_dataset(source.as_ref(), profile.as_ref(), config.data.convert_dates).await?,
        );

        let mut orchestrator = Self::new(Arc::clone(&profile), Arc::clone(&dataset))
            .with_source(source, config.data.convert_dates);

        match create_provider(&config.llm) {
            Ok(provider) => {
                let engine = SynthesisEngine::with_provider(provider, dataset, profile, config)?;
                orchestrator = orchestrator.with_engine(Arc::new(engine));
            }
            Err(e) => {
                warn!(error = %e, "LLM provider unavailable; text2query disabled");
            }
        }
        if let Some(retrieval) = retrieval {
            orchestrator = orchestrator.with_retrieval(retrieval);
        }

        info!(
            profile = orchestrator.profile.name(),
            methods = ?orchestrator.get_available_methods(),
            "Orchestrator initialized"
        );
        Ok(orchestrator)
    }

    pub fn profile_name(&self) -> &str {
        self.profile.name()
    }

    pub fn engine(&self) -> Option<&Arc<SynthesisEngine>> {
        self.engine.as_ref()
    }

    /// Answer `question`. `method` is `auto`, `text2query` or `rag`.
    pub async fn answer_question(&self, question: &str, method: &str) -> UnifiedAnswer {
        info!(question = %question, method = %method, "Processing question");
        let start = Instant::now();

        let draft = match self.route(question, method).await {
            Ok(draft) => draft,
            Err(e) => {
                error!(error = %e, "Error processing question");
                Draft {
                    answer: format!("Error processing question: {}", e),
                    sources: Vec::new(),
                    confidence: Confidence::Low,
                    method_used: MethodUsed::Error,
                    synthesis_method: None,
                    stats: None,
                    error: Some(e.to_string()),
                }
            }
        };

        let execution_time = start.elapsed().as_secs_f64();
        info!(
            method_used = %draft.method_used,
            execution_time,
            "Question answered"
        );
        UnifiedAnswer {
            answer: draft.answer,
            sources: draft.sources,
            confidence: draft.confidence,
            method_used: draft.method_used,
            synthesis_method: draft.synthesis_method,
            stats: draft.stats,
            execution_time,
            timestamp: Local::now().to_rfc3339(),
            profile: self.profile.name().to_string(),
            error: draft.error,
        }
    }

    async fn route(&self, question: &str, method: &str) -> Result<Draft, TabulaError> {
        let method = if method.is_empty() { AUTO } else { method };

        if method == AUTO || method == TEXT2QUERY {
            match &self.engine {
                Some(engine) => {
                    let result = engine.execute_query(question, AUTO).await;
                    if result.error.is_none() && !result.answer.trim().is_empty() {
                        info!(synthesis_method = %result.method, "Text2query succeeded");
                        return Ok(Draft {
                            answer: result.answer,
                            sources: result.sources,
                            confidence: result.confidence,
                            method_used: MethodUsed::Text2Query,
                            synthesis_method: Some(result.method),
                            stats: Some(result.stats),
                            error: None,
                        });
                    }
                    info!("Text2query yielded no result");
                }
                None => warn!("Text2query engine not available"),
            }
        }

        if method == AUTO || method == RAG {
            match &self.retrieval {
                Some(retrieval) => {
                    let rag = retrieval.answer_question(question).await?;
                    if !rag.answer.trim().is_empty() {
                        info!("RAG succeeded");
                        return Ok(Draft {
                            answer: rag.answer,
                            sources: rag.sources,
                            confidence: rag.confidence.unwrap_or(Confidence::Medium),
                            method_used: MethodUsed::Rag,
                            synthesis_method: None,
                            stats: None,
                            error: None,
                        });
                    }
                    warn!("RAG also yielded no result");
                }
                None => warn!("RAG agent not available"),
            }
        }

        Ok(Draft {
            answer: APOLOGY.to_string(),
            sources: Vec::new(),
            confidence: Confidence::Low,
            method_used: MethodUsed::None,
            synthesis_method: None,
            stats: None,
            error: Some("No result from either method".to_string()),
        })
    }

    /// Run the synthesis engine directly.
    pub async fn execute_query(
        &self,
        question: &str,
        method: &str,
    ) -> Result<QueryExecution, TabulaError> {
        let engine = self.engine.as_ref().ok_or_else(|| SynthesisError::Unavailable {
            strategy: TEXT2QUERY.to_string(),
        })?;
        Ok(engine.execute_query(question, method).await)
    }

    pub fn get_available_methods(&self) -> Vec<String> {
        let mut methods = Vec::new();
        if self.engine.is_some() {
            methods.push(TEXT2QUERY.to_string());
        }
        if self.retrieval.is_some() {
            methods.push(RAG.to_string());
        }
        methods
    }

    /// Strategy performance records; empty without an engine.
    pub async fn get_performance_stats(&self) -> BTreeMap<String, PerformanceRecord> {
        match &self.engine {
            Some(engine) => engine.get_performance_stats().await,
            None => BTreeMap::new(),
        }
    }

    pub async fn get_stats(&self) -> OrchestratorStats {
        let data = self.dataset.read().await.summary();
        OrchestratorStats {
            profile: self.profile.name().to_string(),
            data,
            engines: EngineAvailability {
                text2query_available: self.engine.is_some(),
                rag_available: self.retrieval.is_some(),
            },
            rag: self.retrieval.as_ref().map(|r| r.get_stats()),
        }
    }

    /// Relevant chunks from the retrieval index. Errors yield no results.
    pub async fn search_data(&self, query: &str, top_k: usize) -> Vec<Json> {
        let Some(retrieval) = &self.retrieval else {
            warn!("RAG agent not available for search");
            return Vec::new();
        };
        match retrieval.search_relevant_chunks(query, top_k).await {
            Ok(chunks) => chunks,
            Err(e) => {
                error!(error = %e, "Error searching data");
                Vec::new()
            }
        }
    }

    /// Rebuild the retrieval index; `false` when unavailable or failed.
    pub async fn rebuild_rag_index(&self) -> bool {
        let Some(retrieval) = &self.retrieval else {
            warn!("RAG agent not available for rebuild");
            return false;
        };
        match retrieval.rebuild_index().await {
            Ok(rebuilt) => rebuilt,
            Err(e) => {
                error!(error = %e, "Error rebuilding RAG index");
                false
            }
        }
    }

    /// Re-load the dataset from its source. Readers wait until the new
    /// dataset is in place; on failure the old dataset stays.
    pub async fn reload(&self) -> Result<DatasetSummary, TabulaError> {
        let source = self.source.as_ref().ok_or_else(|| ConfigError::Invalid {
            message: "no data source configured".to_string(),
        })?;
        let mut guard = self.dataset.write().await;
        let dataset = Arc::new(
            load_dataset(source.as_ref(), self.profile.as_ref(), self.convert_dates).await?,
        );
        if let Some(engine) = &self.engine {
            engine.set_dataset(Arc::clone(&dataset)).await;
        }
        let summary = dataset.summary();
        *guard = dataset;
        info!(rows = summary.total_rows, "Dataset reloaded");
        Ok(summary)
    }
}
