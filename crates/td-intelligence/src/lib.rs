//! Multi-model orchestration: routing, concurrent dispatch, consensus and
//! cost tracking over heterogeneous LLM backends.

pub mod backends;
pub mod client;
pub mod consensus;
pub mod cost_tracker;
pub mod embedding;
pub mod llm;
pub mod model_router;
pub mod orchestrator;
pub mod retry;

// Re-export the types most callers need.
pub use backends::{BackendCatalog, BackendInfo};
pub use client::{AllBackendsFailed, BackendFailure, BatchOutcome, ModelClient};
pub use consensus::{ConsensusEngine, ConsensusError, ConsensusMethod, ConsensusResult};
pub use cost_tracker::{BudgetCheck, CostAlert, CostRecord, CostTags, CostTracker};
pub use llm::{LlmError, LlmProvider, LlmRequest, LlmResponse, MockProvider};
pub use model_router::{Router, RoutingDecision, RoutingPreferences, TaskClassification};
pub use orchestrator::{
    OrchestrationRequest, OrchestrationResult, Orchestrator, OrchestratorError, OutputFilter,
    Strategy,
};
