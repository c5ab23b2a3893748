use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentLoad {
    pub agent: String,
    pub in_flight: u32,
    pub max_concurrency: u32,
    pub consecutive_failures: u32,
    pub cooldown_until: Option<DateTime<Utc>>,
}

impl AgentLoad {
    pub fn cooling_down_at(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LoadError {
    #[error("agent `{0}` is not registered")]
    NotRegistered(String),
    #[error("agent `{agent}` is at capacity ({in_flight}/{max_concurrency})")]
    AtCapacity { agent: String, in_flight: u32, max_concurrency: u32 },
    #[error("agent `{agent}` is cooling down until {until}")]
    CoolingDown { agent: String, until: DateTime<Utc> },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoadPolicy {
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub default_max_concurrency: u32,
}

impl Default for LoadPolicy {
    fn default() -> Self {
        Self { failure_threshold: 3, cooldown: Duration::seconds(60), default_max_concurrency: 1 }
    }
}

/// In-flight counters and the consecutive-failure breaker per agent.
#[derive(Debug)]
pub struct LoadTracker {
    policy: LoadPolicy,
    records: Mutex<HashMap<String, AgentLoad>>,
}

impl LoadTracker {
    pub fn new(policy: LoadPolicy) -> Self {
        Self { policy, records: Mutex::new(HashMap::new()) }
    }

    pub fn register(&self, agent: &str, max_concurrency: Option<u32>) {
        let max_concurrency =
            max_concurrency.unwrap_or(self.policy.default_max_concurrency).max(1);
        let mut records = self.lock();
        let record = records.entry(agent.to_string()).or_insert_with(|| AgentLoad {
            agent: agent.to_string(),
            in_flight: 0,
            max_concurrency,
            consecutive_failures: 0,
            cooldown_until: None,
        });
        record.max_concurrency = max_concurrency;
    }

    pub fn can_accept(&self, agent: &str) -> bool {
        self.can_accept_at(agent, Utc::now())
    }

    pub fn can_accept_at(&self, agent: &str, now: DateTime<Utc>) -> bool {
        self.lock().get(agent).is_some_and(|record| {
            record.in_flight < record.max_concurrency && !record.cooling_down_at(now)
        })
    }

    pub fn reserve(&self, agent: &str) -> Result<u32, LoadError> {
        self.reserve_at(agent, Utc::now())
    }

    /// Takes one slot. Returns the in-flight count after the reservation.
    pub fn reserve_at(&self, agent: &str, now: DateTime<Utc>) -> Result<u32, LoadError> {
        let mut records = self.lock();
        let record =
            records.get_mut(agent).ok_or_else(|| LoadError::NotRegistered(agent.to_string()))?;

        if let Some(until) = record.cooldown_until.filter(|until| now < *until) {
            return Err(LoadError::CoolingDown { agent: agent.to_string(), until });
        }
        if record.in_flight >= record.max_concurrency {
            return Err(LoadError::AtCapacity {
                agent: agent.to_string(),
                in_flight: record.in_flight,
                max_concurrency: record.max_concurrency,
            });
        }

        record.in_flight += 1;
        Ok(record.in_flight)
    }

    /// Frees one slot; never drops below zero.
    pub fn release(&self, agent: &str) -> u32 {
        let mut records = self.lock();
        match records.get_mut(agent) {
            Some(record) => {
                record.in_flight = record.in_flight.saturating_sub(1);
                record.in_flight
            }
            None => 0,
        }
    }

    pub fn record_failure(&self, agent: &str) -> bool {
        self.record_failure_at(agent, Utc::now())
    }

    /// Counts a consecutive failure. Returns `true` when this failure opened the cooldown.
    pub fn record_failure_at(&self, agent: &str, now: DateTime<Utc>) -> bool {
        let mut records = self.lock();
        let Some(record) = records.get_mut(agent) else {
            return false;
        };

        record.consecutive_failures += 1;
        if record.consecutive_failures < self.policy.failure_threshold {
            return false;
        }

        let until = now + self.policy.cooldown;
        warn!(
            event_name = "runtime.load.cooldown_opened",
            agent = %agent,
            consecutive_failures = record.consecutive_failures,
            cooldown_until = %until,
            "agent failure threshold reached"
        );
        record.cooldown_until = Some(until);
        record.consecutive_failures = 0;
        true
    }

    /// Resets the failure counter. An open cooldown still runs to expiry.
    pub fn record_success(&self, agent: &str) {
        if let Some(record) = self.lock().get_mut(agent) {
            record.consecutive_failures = 0;
        }
    }

    pub fn get(&self, agent: &str) -> Option<AgentLoad> {
        self.lock().get(agent).cloned()
    }

    pub fn snapshot(&self) -> Vec<AgentLoad> {
        let mut snapshot: Vec<AgentLoad> = self.lock().values().cloned().collect();
        snapshot.sort_by(|left, right| left.agent.cmp(&right.agent));
        snapshot
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, AgentLoad>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
