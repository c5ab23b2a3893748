use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::domain::job::{Job, JobId, JobStatus, JobType};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("job not found: {0}")]
    JobNotFound(JobId),
    #[error("cannot {action} job {job_id} in status {}", .status.as_str())]
    InvalidTransition { job_id: JobId, status: JobStatus, action: &'static str },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: usize,
    pub processing: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<JobId, Job>,
    by_execution_id: HashMap<String, JobId>,
}

/// In-memory job queue. The job table is the source of truth; the work channel carries ids
/// only, so a stale id (cancelled or already claimed) is simply skipped at claim time.
pub struct JobQueue {
    state: Mutex<QueueState>,
    sender: mpsc::UnboundedSender<JobId>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<JobId>>,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            state: Mutex::new(QueueState::default()),
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
        }
    }

    /// Enqueues a job, or returns the existing job when one is already known for
    /// `execution_id`.
    pub fn enqueue(
        &self,
        job_type: impl Into<JobType>,
        payload: Value,
        execution_id: Option<String>,
        max_attempts: u32,
    ) -> Job {
        let mut state = self.lock_state();

        if let Some(existing) = execution_id
            .as_ref()
            .and_then(|execution_id| state.by_execution_id.get(execution_id))
            .and_then(|job_id| state.jobs.get(job_id))
        {
            debug!(
                event_name = "queue.job.deduplicated",
                job_id = %existing.id,
                execution_id = existing.execution_id.as_deref().unwrap_or("none"),
                "execution id already queued"
            );
            return existing.clone();
        }

        let job = Job::new(job_type.into(), payload, execution_id, max_attempts);
        if let Some(execution_id) = &job.execution_id {
            state.by_execution_id.insert(execution_id.clone(), job.id.clone());
        }
        state.jobs.insert(job.id.clone(), job.clone());
        self.dispatch(&job.id);

        info!(
            event_name = "queue.job.enqueued",
            job_id = %job.id,
            job_type = job.job_type.as_str(),
            execution_id = job.execution_id.as_deref().unwrap_or("none"),
            max_attempts = job.max_attempts,
            "job enqueued"
        );
        job
    }

    /// Waits up to `timeout` for work. Returns `None` on timeout or when the dequeued id no
    /// longer refers to a queued job.
    pub async fn claim(&self, timeout: Duration) -> Option<Job> {
        let next = tokio::time::timeout(timeout, async {
            let mut receiver = self.receiver.lock().await;
            receiver.recv().await
        })
        .await;

        let job_id = match next {
            Ok(Some(job_id)) => job_id,
            Ok(None) | Err(_) => return None,
        };

        let mut state = self.lock_state();
        let job = state.jobs.get_mut(&job_id)?;
        if job.status != JobStatus::Queued {
            debug!(
                event_name = "queue.job.claim_skipped",
                job_id = %job_id,
                status = job.status.as_str(),
                "dequeued job is no longer queued"
            );
            return None;
        }

        job.status = JobStatus::Processing;
        job.attempts += 1;
        job.updated_at = Utc::now();
        Some(job.clone())
    }

    pub fn ack(&self, job_id: &JobId, result: Value) -> Result<Job, QueueError> {
        let mut state = self.lock_state();
        let job = processing_job(&mut state, job_id, "ack")?;

        job.status = JobStatus::Succeeded;
        job.result = Some(result);
        job.last_error = None;
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    /// Records a failure. Requeues immediately while attempts remain, otherwise fails the job
    /// terminally.
    pub fn nack(&self, job_id: &JobId, error: impl Into<String>) -> Result<Job, QueueError> {
        let mut state = self.lock_state();
        let job = processing_job(&mut state, job_id, "nack")?;

        job.last_error = Some(error.into());
        job.updated_at = Utc::now();

        if job.attempts < job.max_attempts {
            job.status = JobStatus::Queued;
            let job = job.clone();
            self.dispatch(&job.id);
            debug!(
                event_name = "queue.job.requeued",
                job_id = %job.id,
                attempts = job.attempts,
                max_attempts = job.max_attempts,
                "job requeued after failure"
            );
            return Ok(job);
        }

        job.status = JobStatus::Failed;
        warn!(
            event_name = "queue.job.failed",
            job_id = %job.id,
            attempts = job.attempts,
            error = job.last_error.as_deref().unwrap_or_default(),
            "job exhausted its attempts"
        );
        Ok(job.clone())
    }

    pub fn cancel(&self, job_id: &JobId) -> Result<Job, QueueError> {
        let mut state = self.lock_state();
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| QueueError::JobNotFound(job_id.clone()))?;

        if job.status.is_terminal() {
            return Err(QueueError::InvalidTransition {
                job_id: job_id.clone(),
                status: job.status,
                action: "cancel",
            });
        }

        job.status = JobStatus::Cancelled;
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    pub fn get_job(&self, job_id: &JobId) -> Option<Job> {
        self.lock_state().jobs.get(job_id).cloned()
    }

    pub fn get_job_by_execution_id(&self, execution_id: &str) -> Option<Job> {
        let state = self.lock_state();
        state.by_execution_id.get(execution_id).and_then(|job_id| state.jobs.get(job_id)).cloned()
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.lock_state();
        let mut stats = QueueStats::default();
        for job in state.jobs.values() {
            match job.status {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Succeeded => stats.succeeded += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    fn dispatch(&self, job_id: &JobId) {
        if self.sender.send(job_id.clone()).is_err() {
            warn!(event_name = "queue.channel.closed", job_id = %job_id, "work channel closed");
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn processing_job<'a>(
    state: &'a mut QueueState,
    job_id: &JobId,
    action: &'static str,
) -> Result<&'a mut Job, QueueError> {
    let job = state.jobs.get_mut(job_id).ok_or_else(|| QueueError::JobNotFound(job_id.clone()))?;
    if job.status != JobStatus::Processing {
        return Err(QueueError::InvalidTransition {
            job_id: job_id.clone(),
            status: job.status,
            action,
        });
    }
    Ok(job)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::{JobQueue, QueueError};
    use crate::domain::job::{JobId, JobStatus, JobType};

    const CLAIM: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn enqueue_is_idempotent_on_execution_id() {
        let queue = JobQueue::new();

        let first = queue.enqueue(JobType::WriteExecute, json!({"a": 1}), Some("e1".into()), 1);
        let second = queue.enqueue(JobType::AgentExecute, json!({"b": 2}), Some("e1".into()), 5);

        assert_eq!(first, second);
        assert_eq!(queue.get_job_by_execution_id("e1").map(|job| job.id), Some(first.id));
        assert_eq!(queue.stats().queued, 1);
    }

    #[tokio::test]
    async fn claim_moves_job_to_processing_and_counts_attempt() {
        let queue = JobQueue::new();
        let job = queue.enqueue("custom", json!({}), None, 1);

        let claimed = queue.claim(CLAIM).await.expect("job should be claimable");

        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.status, JobStatus::Processing);
        assert_eq!(claimed.attempts, 1);
        assert_eq!(claimed.job_type, JobType::Other("custom".to_string()));
    }

    #[tokio::test]
    async fn claim_times_out_on_empty_queue() {
        let queue = JobQueue::new();
        assert!(queue.claim(CLAIM).await.is_none());
    }

    #[tokio::test]
    async fn cancelled_job_is_skipped_by_claim() {
        let queue = JobQueue::new();
        let job = queue.enqueue(JobType::AgentExecute, json!({}), None, 1);

        queue.cancel(&job.id).expect("queued job should cancel");

        assert!(queue.claim(CLAIM).await.is_none());
        assert_eq!(queue.get_job(&job.id).map(|job| job.status), Some(JobStatus::Cancelled));
    }

    #[tokio::test]
    async fn failing_job_is_claimed_exactly_max_attempts_times() {
        let queue = JobQueue::new();
        let job = queue.enqueue(JobType::AgentExecute, json!({}), Some("e-retry".into()), 3);

        let mut claims = 0;
        while let Some(claimed) = queue.claim(CLAIM).await {
            claims += 1;
            queue.nack(&claimed.id, "IntegrationError:boom").expect("nack");
        }

        let job = queue.get_job(&job.id).expect("job");
        assert_eq!(claims, 3);
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 3);
        assert_eq!(job.last_error.as_deref(), Some("IntegrationError:boom"));
    }

    #[tokio::test]
    async fn ack_after_retry_clears_last_error() {
        let queue = JobQueue::new();
        let job = queue.enqueue(JobType::AgentExecute, json!({}), None, 2);

        let claimed = queue.claim(CLAIM).await.expect("first claim");
        queue.nack(&claimed.id, "Timeout:slow").expect("nack");
        let claimed = queue.claim(CLAIM).await.expect("second claim");
        let done = queue.ack(&claimed.id, json!({"ok": true})).expect("ack");

        assert_eq!(done.id, job.id);
        assert_eq!(done.status, JobStatus::Succeeded);
        assert_eq!(done.attempts, 2);
        assert_eq!(done.last_error, None);
        assert_eq!(done.result, Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn invalid_transitions_are_rejected() {
        let queue = JobQueue::new();
        let job = queue.enqueue(JobType::AgentExecute, json!({}), None, 1);

        assert!(matches!(
            queue.ack(&job.id, json!({})),
            Err(QueueError::InvalidTransition { action: "ack", status: JobStatus::Queued, .. })
        ));

        let claimed = queue.claim(CLAIM).await.expect("claim");
        queue.ack(&claimed.id, json!({})).expect("ack");

        assert!(matches!(queue.cancel(&job.id), Err(QueueError::InvalidTransition { .. })));
        assert!(matches!(
            queue.nack(&JobId("missing".into()), "x"),
            Err(QueueError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn stats_count_jobs_by_status() {
        let queue = JobQueue::new();
        queue.enqueue(JobType::AgentExecute, json!({}), None, 1);
        let second = queue.enqueue(JobType::AgentExecute, json!({}), None, 1);
        queue.cancel(&second.id).expect("cancel");

        let stats = queue.stats();
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.cancelled, 1);
    }
}
