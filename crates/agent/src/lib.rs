//! Agent side of execgate: runtime state, routing and the orchestrator.
//!
//! - `state` tracks per-agent health, load and isolation.
//! - `router` picks an eligible agent for a command and drives its executor.
//! - `guardrails` is the default governance evaluator for the write gateway.
//! - `orchestrator` drains the job queue and dispatches work to the router or the gateway.
//!
//! No side effect happens outside an executor adapter or a registered write handler.

pub mod executor;
pub mod guardrails;
pub mod orchestrator;
pub mod router;
pub mod state;

pub use executor::{resolve_binding, AgentTask, ExecutorAdapter};
pub use guardrails::GuardrailPolicy;
pub use orchestrator::{Orchestrator, OrchestratorSettings, SubmitRequest, SubmitResponse};
pub use router::{AgentExecution, AgentRegistration, AgentRouter};
pub use state::{AgentRuntimeState, RuntimeStateConfig};
