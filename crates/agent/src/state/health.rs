use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "healthy" => Some(Self::Healthy),
            "degraded" => Some(Self::Degraded),
            "unhealthy" => Some(Self::Unhealthy),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentHealth {
    pub agent: String,
    pub alive: bool,
    pub status: HealthStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl AgentHealth {
    fn unknown(agent: &str, now: DateTime<Utc>) -> Self {
        Self {
            agent: agent.to_string(),
            alive: false,
            status: HealthStatus::Unknown,
            last_heartbeat: None,
            reason: None,
            updated_at: now,
        }
    }
}

/// Liveness per agent. A heartbeat older than the TTL demotes the agent the next time its
/// health is checked.
#[derive(Debug)]
pub struct HealthRegistry {
    ttl: Duration,
    records: Mutex<HashMap<String, AgentHealth>>,
}

impl HealthRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, records: Mutex::new(HashMap::new()) }
    }

    pub fn register(&self, agent: &str) {
        self.lock()
            .entry(agent.to_string())
            .or_insert_with(|| AgentHealth::unknown(agent, Utc::now()));
    }

    pub fn mark_heartbeat(&self, agent: &str) {
        self.mark_heartbeat_at(agent, Utc::now());
    }

    pub fn mark_heartbeat_at(&self, agent: &str, now: DateTime<Utc>) {
        let mut records = self.lock();
        let record =
            records.entry(agent.to_string()).or_insert_with(|| AgentHealth::unknown(agent, now));
        record.alive = true;
        record.status = HealthStatus::Healthy;
        record.last_heartbeat = Some(now);
        record.reason = None;
        record.updated_at = now;
    }

    pub fn mark_degraded(&self, agent: &str, reason: Option<String>) {
        self.set_status(agent, HealthStatus::Degraded, true, reason, Utc::now());
    }

    pub fn mark_unhealthy(&self, agent: &str, reason: Option<String>) {
        self.mark_unhealthy_at(agent, reason, Utc::now());
    }

    pub fn mark_unhealthy_at(&self, agent: &str, reason: Option<String>, now: DateTime<Utc>) {
        self.set_status(agent, HealthStatus::Unhealthy, false, reason, now);
    }

    pub fn is_healthy(&self, agent: &str) -> bool {
        self.is_healthy_at(agent, Utc::now())
    }

    pub fn is_healthy_at(&self, agent: &str, now: DateTime<Utc>) -> bool {
        let mut records = self.lock();
        let Some(record) = records.get_mut(agent) else {
            return false;
        };

        let Some(last_heartbeat) = record.last_heartbeat else {
            return false;
        };

        if now - last_heartbeat > self.ttl {
            if record.status != HealthStatus::Unhealthy {
                warn!(
                    event_name = "runtime.health.heartbeat_expired",
                    agent = %agent,
                    last_heartbeat = %last_heartbeat,
                    "agent heartbeat is stale"
                );
            }
            record.alive = false;
            record.status = HealthStatus::Unhealthy;
            record.reason = Some("heartbeat_ttl_expired".to_string());
            record.updated_at = now;
            return false;
        }

        record.status == HealthStatus::Healthy
    }

    pub fn get(&self, agent: &str) -> Option<AgentHealth> {
        self.lock().get(agent).cloned()
    }

    pub fn snapshot(&self) -> Vec<AgentHealth> {
        let mut snapshot: Vec<AgentHealth> = self.lock().values().cloned().collect();
        snapshot.sort_by(|left, right| left.agent.cmp(&right.agent));
        snapshot
    }

    fn set_status(
        &self,
        agent: &str,
        status: HealthStatus,
        alive: bool,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) {
        let mut records = self.lock();
        let record =
            records.entry(agent.to_string()).or_insert_with(|| AgentHealth::unknown(agent, now));
        record.alive = alive;
        record.status = status;
        record.reason = reason;
        record.updated_at = now;
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, AgentHealth>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
