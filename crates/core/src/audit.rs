use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::job::Job;
use crate::domain::write::WriteEnvelope;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    Gateway,
    Orchestrator,
    System,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Pending,
    Rejected,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: String,
    pub event_type: String,
    pub category: AuditCategory,
    pub actor: String,
    pub outcome: AuditOutcome,
    pub write_id: Option<String>,
    pub job_id: Option<String>,
    pub execution_id: Option<String>,
    pub data: Map<String, Value>,
    pub occurred_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        event_type: impl Into<String>,
        category: AuditCategory,
        actor: impl Into<String>,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            category,
            actor: actor.into(),
            outcome,
            write_id: None,
            job_id: None,
            execution_id: None,
            data: Map::new(),
            occurred_at: Utc::now(),
        }
    }

    pub fn for_write(
        envelope: &WriteEnvelope,
        event_type: impl Into<String>,
        outcome: AuditOutcome,
    ) -> Self {
        let mut event =
            Self::new(event_type, AuditCategory::Gateway, envelope.actor_id.clone(), outcome)
                .with_data("command", envelope.command.clone())
                .with_data("resource", envelope.resource.clone());
        event.write_id = Some(envelope.write_id.0.clone());
        event.execution_id = envelope.execution_id.clone();
        event
    }

    pub fn for_job(job: &Job, event_type: impl Into<String>, outcome: AuditOutcome) -> Self {
        let mut event = Self::new(event_type, AuditCategory::Orchestrator, "orchestrator", outcome)
            .with_data("job_type", job.job_type.as_str());
        event.job_id = Some(job.id.0.clone());
        event.execution_id = job.execution_id.clone();
        event
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AuditError {
    #[error("audit sink unavailable: {0}")]
    Unavailable(String),
    #[error("audit event rejected: {0}")]
    Rejected(String),
}

/// Append-only destination for audit and decision-outcome records.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, event: AuditEvent) -> Result<(), AuditError>;
}

/// Appends without letting a sink failure reach the caller. Returns the event id when the
/// sink accepted the event.
pub async fn append_best_effort(sink: &dyn AuditSink, event: AuditEvent) -> Option<String> {
    let event_id = event.event_id.clone();
    let event_type = event.event_type.clone();

    match sink.append(event).await {
        Ok(()) => Some(event_id),
        Err(error) => {
            warn!(
                event_name = "system.audit.append_failed",
                audit_event_type = %event_type,
                error = %error,
                "audit sink append failed; continuing"
            );
            None
        }
    }
}

#[derive(Clone, Default)]
pub struct InMemoryAuditSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl InMemoryAuditSink {
    pub fn events(&self) -> Vec<AuditEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn event_types(&self) -> Vec<String> {
        self.events().into_iter().map(|event| event.event_type).collect()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn append(&self, event: AuditEvent) -> Result<(), AuditError> {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
        Ok(())
    }
}

/// Writes every event to the structured log. Used when no persistent sink is wired.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn append(&self, event: AuditEvent) -> Result<(), AuditError> {
        let data = Value::Object(event.data);
        info!(
            event_name = %event.event_type,
            audit_event_id = %event.event_id,
            category = ?event.category,
            outcome = ?event.outcome,
            actor = %event.actor,
            write_id = event.write_id.as_deref().unwrap_or("none"),
            job_id = event.job_id.as_deref().unwrap_or("none"),
            execution_id = event.execution_id.as_deref().unwrap_or("none"),
            data = %data,
            "audit event"
        );
        Ok(())
    }
}
