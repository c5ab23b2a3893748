//! Orchestrator: the only consumer of the job queue.
//!
//! A single background worker claims jobs and dispatches them by type. `agent_execute` goes
//! to the [`AgentRouter`], `write_execute` goes through the [`WriteGateway`]. Structured
//! failures returned by either (for example `success: false`) are acknowledged as results;
//! only a [`Fault`] is negatively acknowledged and counts against the job's attempts.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use execgate_core::audit::{append_best_effort, AuditEvent, AuditOutcome, AuditSink};
use execgate_core::config::{OrchestratorConfig, QueueConfig};
use execgate_core::domain::job::{Job, JobId, JobStatus, JobType};
use execgate_core::domain::write::WriteEnvelope;
use execgate_core::errors::Fault;
use execgate_core::gateway::WriteGateway;
use execgate_core::queue::JobQueue;

use crate::router::AgentRouter;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrchestratorSettings {
    pub claim_poll: Duration,
    pub wait_poll: Duration,
    pub wait_timeout: Duration,
    pub outcome_summary_keys: usize,
    pub default_max_attempts: u32,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            claim_poll: Duration::from_millis(500),
            wait_poll: Duration::from_millis(150),
            wait_timeout: Duration::from_secs(30),
            outcome_summary_keys: 16,
            default_max_attempts: 1,
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(queue: &QueueConfig, orchestrator: &OrchestratorConfig) -> Self {
        Self {
            claim_poll: queue.claim_poll(),
            wait_poll: orchestrator.wait_poll(),
            wait_timeout: orchestrator.wait_timeout(),
            outcome_summary_keys: orchestrator.outcome_summary_keys,
            default_max_attempts: queue.default_max_attempts,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SubmitRequest {
    pub job_type: JobType,
    pub payload: Value,
    pub execution_id: Option<String>,
    pub max_attempts: Option<u32>,
    pub wait: bool,
    pub wait_timeout: Option<Duration>,
}

impl SubmitRequest {
    pub fn new(job_type: impl Into<JobType>, payload: Value) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            execution_id: None,
            max_attempts: None,
            wait: false,
            wait_timeout: None,
        }
    }

    pub fn with_execution_id(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = Some(execution_id.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Block until the job is terminal or `timeout` elapses.
    pub fn waiting(mut self, timeout: Duration) -> Self {
        self.wait = true;
        self.wait_timeout = Some(timeout);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: JobId,
    pub execution_id: Option<String>,
    pub status: JobStatus,
    pub queued: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl SubmitResponse {
    fn from_job(job: Job) -> Self {
        Self {
            queued: !job.status.is_terminal(),
            job_id: job.id,
            execution_id: job.execution_id,
            status: job.status,
            result: job.result,
            error: job.last_error,
            reason: None,
        }
    }

    fn timed_out(job: Job) -> Self {
        let mut response = Self::from_job(job);
        response.reason = Some("timeout_waiting_for_result".to_string());
        response
    }
}

struct Dispatcher {
    queue: Arc<JobQueue>,
    router: Arc<AgentRouter>,
    gateway: Arc<WriteGateway>,
    audit: Arc<dyn AuditSink>,
    settings: OrchestratorSettings,
}

struct Worker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct Orchestrator {
    dispatcher: Arc<Dispatcher>,
    worker: Mutex<Option<Worker>>,
}

impl Orchestrator {
    pub fn new(
        queue: Arc<JobQueue>,
        router: Arc<AgentRouter>,
        gateway: Arc<WriteGateway>,
        audit: Arc<dyn AuditSink>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            dispatcher: Arc::new(Dispatcher { queue, router, gateway, audit, settings }),
            worker: Mutex::new(None),
        }
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.dispatcher.queue
    }

    pub async fn submit(&self, request: SubmitRequest) -> SubmitResponse {
        let settings = &self.dispatcher.settings;
        let job = self.dispatcher.queue.enqueue(
            request.job_type,
            request.payload,
            request.execution_id,
            request.max_attempts.unwrap_or(settings.default_max_attempts),
        );

        if !request.wait {
            return SubmitResponse { queued: true, ..SubmitResponse::from_job(job) };
        }

        let deadline = Instant::now() + request.wait_timeout.unwrap_or(settings.wait_timeout);
        let mut latest = job;
        loop {
            if let Some(current) = self.dispatcher.queue.get_job(&latest.id) {
                latest = current;
            }
            if latest.status.is_terminal() {
                return SubmitResponse::from_job(latest);
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(
                    event_name = "orchestrator.submit.wait_timeout",
                    job_id = %latest.id,
                    status = latest.status.as_str(),
                    "job still running after wait timeout"
                );
                return SubmitResponse::timed_out(latest);
            }
            tokio::time::sleep(settings.wait_poll.min(deadline - now)).await;
        }
    }

    /// Spawns the worker loop. Returns `false` when a worker is already running.
    pub fn start(&self) -> bool {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.as_ref().is_some_and(|worker| !worker.handle.is_finished()) {
            return false;
        }

        let (shutdown, signal) = watch::channel(false);
        let handle = tokio::spawn(run_worker(self.dispatcher.clone(), signal));
        *worker = Some(Worker { shutdown, handle });
        true
    }

    /// Signals the worker, aborts it and waits for it to wind down. Jobs claimed but not yet
    /// finished stay `processing`.
    pub async fn stop(&self) {
        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(worker) = worker else {
            return;
        };

        let _ = worker.shutdown.send(true);
        worker.handle.abort();
        if let Err(error) = worker.handle.await {
            if !error.is_cancelled() {
                warn!(
                    event_name = "orchestrator.worker.join_failed",
                    error = %error,
                    "worker task ended abnormally"
                );
            }
        }
        info!(event_name = "orchestrator.worker.stopped", "orchestrator stopped");
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|worker| !worker.handle.is_finished())
    }
}

async fn run_worker(dispatcher: Arc<Dispatcher>, mut shutdown: watch::Receiver<bool>) {
    info!(
        event_name = "orchestrator.worker.started",
        claim_poll_ms = dispatcher.settings.claim_poll.as_millis() as u64,
        "orchestrator worker started"
    );

    loop {
        if *shutdown.borrow() {
            break;
        }

        let claimed = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            claimed = dispatcher.queue.claim(dispatcher.settings.claim_poll) => claimed,
        };

        match claimed {
            Some(job) => dispatcher.process(job).await,
            None => {
                dispatcher.gateway.purge_expired_tokens();
            }
        }
    }
}

impl Dispatcher {
    async fn process(&self, job: Job) {
        debug!(
            event_name = "orchestrator.job.claimed",
            job_id = %job.id,
            job_type = job.job_type.as_str(),
            attempt = job.attempts,
            "job claimed"
        );

        match self.dispatch(&job).await {
            Ok(result) => {
                let summary = summarize(&result, self.settings.outcome_summary_keys);
                if let Err(error) = self.queue.ack(&job.id, result) {
                    warn!(
                        event_name = "orchestrator.job.ack_failed",
                        job_id = %job.id,
                        error = %error,
                        "could not acknowledge job"
                    );
                    return;
                }
                info!(
                    event_name = "orchestrator.job.succeeded",
                    job_id = %job.id,
                    execution_id = job.execution_id.as_deref().unwrap_or("none"),
                    "job succeeded"
                );
                let event =
                    AuditEvent::for_job(&job, "orchestrator.job.succeeded", AuditOutcome::Success)
                        .with_data("success", true)
                        .with_data("result_keys", summary);
                append_best_effort(self.audit.as_ref(), event).await;
            }
            Err(fault) => {
                let error = fault.to_string();
                let retrying = match self.queue.nack(&job.id, error.clone()) {
                    Ok(updated) => updated.status == JobStatus::Queued,
                    Err(queue_error) => {
                        warn!(
                            event_name = "orchestrator.job.nack_failed",
                            job_id = %job.id,
                            error = %queue_error,
                            "could not record job failure"
                        );
                        return;
                    }
                };
                warn!(
                    event_name = "orchestrator.job.failed",
                    job_id = %job.id,
                    execution_id = job.execution_id.as_deref().unwrap_or("none"),
                    error = %error,
                    retrying,
                    "job attempt failed"
                );
                let event =
                    AuditEvent::for_job(&job, "orchestrator.job.failed", AuditOutcome::Failed)
                        .with_data("success", false)
                        .with_data("error", error)
                        .with_data("attempt", job.attempts)
                        .with_data("retrying", retrying);
                append_best_effort(self.audit.as_ref(), event).await;
            }
        }
    }

    async fn dispatch(&self, job: &Job) -> Result<Value, Fault> {
        match &job.job_type {
            JobType::AgentExecute => {
                let has_command = job
                    .payload
                    .get("command")
                    .and_then(Value::as_str)
                    .is_some_and(|command| !command.trim().is_empty());
                if !has_command {
                    return Err(Fault::invalid_payload("missing_command"));
                }

                let execution = self.router.execute(job.payload.clone()).await;
                serde_json::to_value(execution).map_err(|error| Fault::internal(error.to_string()))
            }
            JobType::WriteExecute => {
                let mut envelope: WriteEnvelope = serde_json::from_value(job.payload.clone())?;
                if envelope.execution_id.is_none() {
                    envelope.execution_id = job.execution_id.clone();
                }

                let result = self.gateway.write(envelope).await;
                serde_json::to_value(result).map_err(|error| Fault::internal(error.to_string()))
            }
            JobType::Other(other) => Err(Fault::invalid_job(format!("unknown_job_type:{other}"))),
        }
    }
}

/// Top-level keys of a result object, capped at `limit`.
fn summarize(result: &Value, limit: usize) -> Vec<String> {
    match result {
        Value::Object(map) => map.keys().take(limit).cloned().collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::summarize;

    #[test]
    fn summary_is_bounded_to_limit() {
        let mut object = serde_json::Map::new();
        for index in 0..40 {
            object.insert(format!("key_{index:02}"), json!(index));
        }

        let summary = summarize(&serde_json::Value::Object(object), 16);

        assert_eq!(summary.len(), 16);
        assert_eq!(summary[0], "key_00");
    }

    #[test]
    fn non_object_result_has_empty_summary() {
        assert!(summarize(&json!([1, 2, 3]), 16).is_empty());
        assert!(summarize(&json!(null), 16).is_empty());
    }
}
