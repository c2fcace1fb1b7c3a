//! # Tabula Engine
//!
//! Question answering over a tabular dataset. The synthesis engine turns a
//! question into a structured query or a sandboxed procedure, executes it and
//! renders the result; the orchestrator falls back to retrieval when that
//! yields nothing.

pub mod engine;
pub mod orchestrator;
pub mod response;
pub mod retrieval;
pub mod synthesis;

pub use engine::{AUTO, PerformanceRecord, QueryExecution, SynthesisEngine};
pub use orchestrator::{
    EngineAvailability, MethodUsed, OrchestratorStats, UnifiedAnswer, UnifiedOrchestrator,
};
pub use response::{
    BuiltResponse, Confidence, QueryResult, ResponseBuilder, ResultStats, format_table,
};
pub use retrieval::{RagAnswer, RetrievalAgent, StaticRetrievalAgent};
pub use synthesis::{
    AgentStrategy, ProcedureStrategy, StructuredStrategy, SynthesisContext, SynthesisFailure,
    SynthesisOutcome, SynthesisPayload, SynthesisStrategy,
};
