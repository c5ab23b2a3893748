use std::env;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use execgate_core::errors::Fault;

const ENV_BINDING_PREFIX: &str = "ENV:";

/// Unit of work handed to an agent's executor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentTask {
    pub execution_id: String,
    pub agent: String,
    pub command: String,
    pub payload: Value,
}

/// Transport to one agent. `target` is the resolved executor binding, usually an endpoint.
#[async_trait]
pub trait ExecutorAdapter: Send + Sync {
    async fn execute(&self, target: &str, task: &AgentTask) -> Result<Value, Fault>;

    async fn probe(&self, _target: &str) -> Result<(), Fault> {
        Ok(())
    }
}

/// Resolves an executor binding. `ENV:<NAME>` reads the named environment variable at call
/// time; anything else is used verbatim.
pub fn resolve_binding(binding: &str) -> Result<String, Fault> {
    let Some(var) = binding.trim().strip_prefix(ENV_BINDING_PREFIX) else {
        return Ok(binding.trim().to_string());
    };

    let var = var.trim();
    env::var(var)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            Fault::new("BindingUnresolved", format!("environment variable `{var}` is not set"))
        })
}
