use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolationEntry {
    pub agent: String,
    pub reason: Option<String>,
    pub isolated_at: DateTime<Utc>,
}

/// Operator-controlled exclusion list. Entries never expire on their own.
#[derive(Debug, Default)]
pub struct IsolationSet {
    entries: Mutex<HashMap<String, IsolationEntry>>,
}

impl IsolationSet {
    pub fn isolate(&self, agent: &str, reason: Option<String>) {
        info!(
            event_name = "runtime.isolation.opened",
            agent = %agent,
            reason = reason.as_deref().unwrap_or("none"),
            "agent isolated"
        );
        self.lock().insert(
            agent.to_string(),
            IsolationEntry { agent: agent.to_string(), reason, isolated_at: Utc::now() },
        );
    }

    /// Returns `true` when the agent was isolated.
    pub fn release(&self, agent: &str) -> bool {
        let released = self.lock().remove(agent).is_some();
        if released {
            info!(event_name = "runtime.isolation.released", agent = %agent, "agent released");
        }
        released
    }

    pub fn is_isolated(&self, agent: &str) -> bool {
        self.lock().contains_key(agent)
    }

    pub fn get(&self, agent: &str) -> Option<IsolationEntry> {
        self.lock().get(agent).cloned()
    }

    pub fn snapshot(&self) -> Vec<IsolationEntry> {
        let mut snapshot: Vec<IsolationEntry> = self.lock().values().cloned().collect();
        snapshot.sort_by(|left, right| left.agent.cmp(&right.agent));
        snapshot
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, IsolationEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
