//! Agent runtime state: health, load and isolation.
//!
//! Each facet owns its own map behind its own lock, so a slow reader of one never blocks the
//! others. Eligibility is computed from all three at selection time and is advisory; only
//! `LoadTracker::reserve` is authoritative.

pub mod health;
pub mod isolation;
pub mod load;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use execgate_core::config::RuntimeConfig;

pub use health::{AgentHealth, HealthRegistry, HealthStatus};
pub use isolation::{IsolationEntry, IsolationSet};
pub use load::{AgentLoad, LoadError, LoadPolicy, LoadTracker};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeStateConfig {
    pub heartbeat_ttl: Duration,
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub default_max_concurrency: u32,
}

impl Default for RuntimeStateConfig {
    fn default() -> Self {
        Self {
            heartbeat_ttl: Duration::from_secs(120),
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
            default_max_concurrency: 1,
        }
    }
}

impl From<&RuntimeConfig> for RuntimeStateConfig {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            heartbeat_ttl: config.heartbeat_ttl(),
            failure_threshold: config.failure_threshold,
            cooldown: config.cooldown(),
            default_max_concurrency: config.default_max_concurrency,
        }
    }
}

/// Combined view of one agent's runtime state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentStateSnapshot {
    pub agent: String,
    pub health: Option<AgentHealth>,
    pub load: Option<AgentLoad>,
    pub isolation: Option<IsolationEntry>,
}

pub struct AgentRuntimeState {
    pub health: HealthRegistry,
    pub load: LoadTracker,
    pub isolation: IsolationSet,
}

impl Default for AgentRuntimeState {
    fn default() -> Self {
        Self::new(RuntimeStateConfig::default())
    }
}

impl AgentRuntimeState {
    pub fn new(config: RuntimeStateConfig) -> Self {
        Self {
            health: HealthRegistry::new(span(config.heartbeat_ttl)),
            load: LoadTracker::new(LoadPolicy {
                failure_threshold: config.failure_threshold.max(1),
                cooldown: span(config.cooldown),
                default_max_concurrency: config.default_max_concurrency.max(1),
            }),
            isolation: IsolationSet::default(),
        }
    }

    pub fn register(&self, agent: &str, max_concurrency: Option<u32>) {
        self.health.register(agent);
        self.load.register(agent, max_concurrency);
    }

    pub fn is_eligible(&self, agent: &str) -> bool {
        self.is_eligible_at(agent, Utc::now())
    }

    pub fn is_eligible_at(&self, agent: &str, now: DateTime<Utc>) -> bool {
        !self.isolation.is_isolated(agent)
            && self.health.is_healthy_at(agent, now)
            && self.load.can_accept_at(agent, now)
    }

    pub fn snapshot(&self, agent: &str) -> AgentStateSnapshot {
        AgentStateSnapshot {
            agent: agent.to_string(),
            health: self.health.get(agent),
            load: self.load.get(agent),
            isolation: self.isolation.get(agent),
        }
    }
}

fn span(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration)
        .unwrap_or_else(|_| chrono::Duration::seconds(i64::from(u32::MAX)))
}
