use std::sync::{Arc, PoisonError, RwLock};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::executor::{resolve_binding, AgentTask, ExecutorAdapter};
use crate::state::{AgentRuntimeState, AgentStateSnapshot};

/// An agent the router may dispatch to.
#[derive(Clone)]
pub struct AgentRegistration {
    pub name: String,
    pub capabilities: Vec<String>,
    pub executor: String,
    pub max_concurrency: Option<u32>,
    adapter: Arc<dyn ExecutorAdapter>,
}

impl AgentRegistration {
    pub fn new(
        name: impl Into<String>,
        executor: impl Into<String>,
        adapter: Arc<dyn ExecutorAdapter>,
    ) -> Self {
        Self {
            name: name.into(),
            capabilities: Vec::new(),
            executor: executor.into(),
            max_concurrency: None,
            adapter,
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities.extend(capabilities.into_iter().map(Into::into));
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: u32) -> Self {
        self.max_concurrency = Some(max_concurrency);
        self
    }

    pub fn handles(&self, command: &str) -> bool {
        self.capabilities.iter().any(|capability| capability == command)
    }
}

impl std::fmt::Debug for AgentRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistration")
            .field("name", &self.name)
            .field("capabilities", &self.capabilities)
            .field("executor", &self.executor)
            .field("max_concurrency", &self.max_concurrency)
            .finish_non_exhaustive()
    }
}

/// Outcome of one routed execution. Failures are data, not errors.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentExecution {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentExecution {
    fn rejected(reason: &str) -> Self {
        Self { success: false, reason: Some(reason.to_string()), ..Self::default() }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoutedAgentSnapshot {
    pub capabilities: Vec<String>,
    pub executor: String,
    #[serde(flatten)]
    pub state: AgentStateSnapshot,
}

/// Releases the reserved slot when dropped, including when the owning future is cancelled.
struct LoadSlot<'a> {
    state: &'a AgentRuntimeState,
    agent: &'a str,
}

impl<'a> LoadSlot<'a> {
    fn reserve(state: &'a AgentRuntimeState, agent: &'a str) -> Result<Self, String> {
        state.load.reserve(agent).map_err(|error| error.to_string())?;
        Ok(Self { state, agent })
    }
}

impl Drop for LoadSlot<'_> {
    fn drop(&mut self) {
        self.state.load.release(self.agent);
    }
}

pub struct AgentRouter {
    state: Arc<AgentRuntimeState>,
    agents: RwLock<Vec<AgentRegistration>>,
}

impl AgentRouter {
    pub fn new(state: Arc<AgentRuntimeState>) -> Self {
        Self { state, agents: RwLock::new(Vec::new()) }
    }

    pub fn state(&self) -> &Arc<AgentRuntimeState> {
        &self.state
    }

    /// Adds an agent, or replaces the one with the same name while keeping its position.
    pub fn register_agent(&self, registration: AgentRegistration) {
        self.state.register(&registration.name, registration.max_concurrency);
        info!(
            event_name = "router.agent.registered",
            agent = %registration.name,
            capabilities = ?registration.capabilities,
            "agent registered"
        );

        let mut agents = self.agents.write().unwrap_or_else(PoisonError::into_inner);
        match agents.iter_mut().find(|existing| existing.name == registration.name) {
            Some(existing) => *existing = registration,
            None => agents.push(registration),
        }
    }

    pub fn agents(&self) -> Vec<String> {
        let agents = self.agents.read().unwrap_or_else(PoisonError::into_inner);
        agents.iter().map(|agent| agent.name.clone()).collect()
    }

    /// First eligible agent for `command`, in registration order.
    pub fn route(&self, command: &str) -> Option<String> {
        self.select(command).map(|registration| registration.name)
    }

    pub async fn execute(&self, payload: Value) -> AgentExecution {
        let Some(command) = payload
            .get("command")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|command| !command.is_empty())
            .map(str::to_string)
        else {
            return AgentExecution::rejected("missing_command");
        };

        let Some(registration) = self.select(&command) else {
            warn!(
                event_name = "router.execute.no_agent",
                command = %command,
                "no eligible agent for command"
            );
            return AgentExecution::rejected("no_available_agent_or_backpressure");
        };
        let agent = registration.name.clone();

        let target = match resolve_binding(&registration.executor) {
            Ok(target) => target,
            Err(fault) => {
                warn!(
                    event_name = "router.execute.binding_unresolved",
                    agent = %agent,
                    error = %fault,
                    "executor binding could not be resolved"
                );
                return AgentExecution {
                    success: false,
                    agent: Some(agent),
                    reason: Some("executor_binding_unresolved".to_string()),
                    error: Some(fault.to_string()),
                    ..AgentExecution::default()
                };
            }
        };

        let execution_id = Uuid::new_v4().to_string();
        let _slot = match LoadSlot::reserve(&self.state, &agent) {
            Ok(slot) => slot,
            Err(error) => {
                debug!(
                    event_name = "router.execute.backpressure",
                    agent = %agent,
                    error = %error,
                    "lost reservation race"
                );
                return AgentExecution {
                    success: false,
                    agent: Some(agent.clone()),
                    reason: Some("backpressure_rejected".to_string()),
                    error: Some(error),
                    ..AgentExecution::default()
                };
            }
        };

        let task = AgentTask {
            execution_id: execution_id.clone(),
            agent: agent.clone(),
            command,
            payload,
        };

        match registration.adapter.execute(&target, &task).await {
            Ok(result) => {
                self.state.load.record_success(&agent);
                self.state.health.mark_heartbeat(&agent);
                info!(
                    event_name = "router.execute.succeeded",
                    agent = %agent,
                    execution_id = %execution_id,
                    "agent execution succeeded"
                );
                AgentExecution {
                    success: true,
                    execution_id: Some(execution_id),
                    agent: Some(agent.clone()),
                    result: Some(result),
                    ..AgentExecution::default()
                }
            }
            Err(fault) => {
                let cooldown_opened = self.state.load.record_failure(&agent);
                self.state.health.mark_unhealthy(&agent, Some(fault.to_string()));
                warn!(
                    event_name = "router.execute.failed",
                    agent = %agent,
                    execution_id = %execution_id,
                    error = %fault,
                    cooldown_opened,
                    "agent execution failed"
                );
                AgentExecution {
                    success: false,
                    execution_id: Some(execution_id),
                    agent: Some(agent.clone()),
                    reason: Some("agent_execution_failed".to_string()),
                    error: Some(fault.to_string()),
                    ..AgentExecution::default()
                }
            }
        }
    }

    /// Probes every registered agent once, stamping a heartbeat on success and marking the
    /// agent unhealthy otherwise. Returns the number of agents that answered.
    pub async fn probe_agents(&self) -> usize {
        let registrations = self.registrations();
        let mut healthy = 0;

        for registration in registrations {
            let probe = match resolve_binding(&registration.executor) {
                Ok(target) => registration.adapter.probe(&target).await,
                Err(fault) => Err(fault),
            };

            match probe {
                Ok(()) => {
                    self.state.health.mark_heartbeat(&registration.name);
                    healthy += 1;
                }
                Err(fault) => {
                    debug!(
                        event_name = "router.probe.failed",
                        agent = %registration.name,
                        error = %fault,
                        "agent probe failed"
                    );
                    self.state.health.mark_unhealthy(&registration.name, Some(fault.to_string()));
                }
            }
        }

        healthy
    }

    pub fn snapshot(&self) -> Vec<RoutedAgentSnapshot> {
        self.registrations()
            .into_iter()
            .map(|registration| RoutedAgentSnapshot {
                state: self.state.snapshot(&registration.name),
                capabilities: registration.capabilities,
                executor: registration.executor,
            })
            .collect()
    }

    fn registrations(&self) -> Vec<AgentRegistration> {
        self.agents.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn select(&self, command: &str) -> Option<AgentRegistration> {
        let now = Utc::now();
        self.registrations()
            .into_iter()
            .filter(|registration| registration.handles(command))
            .find(|registration| self.state.is_eligible_at(&registration.name, now))
    }
}
