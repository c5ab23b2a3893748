//! Write Gateway: the single choke point for domain mutations.
//!
//! A write passes two phases. `request_write` validates the envelope, consults governance and,
//! when allowed, hands back a short-lived commit token. `commit_write` redeems the token,
//! enforces idempotency and runs the registered handler. Nothing else in the system performs
//! side effects.

pub mod handlers;
pub mod idempotency;
pub mod tokens;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{append_best_effort, AuditEvent, AuditOutcome, AuditSink};
use crate::domain::policy::{PolicyDecision, PolicyRequest};
use crate::domain::write::{
    IdempotencyKey, IdempotencyRecord, IdempotencyState, WriteEnvelope, WriteResult, WriteStatus,
};
use crate::errors::Fault;
use crate::governance::{ApprovalCreator, GovernanceEvaluator};

pub use handlers::{HandlerRegistry, WriteHandler};
pub use idempotency::{HeldKey, IdempotencyStore, Reservation, INTERRUPTED_REASON};
pub use tokens::{PendingCommits, TokenRejection};

pub const DEFAULT_COMMIT_TOKEN_TTL: Duration = Duration::from_secs(120);

pub struct WriteGateway {
    governance: Arc<dyn GovernanceEvaluator>,
    approvals: Option<Arc<dyn ApprovalCreator>>,
    audit: Arc<dyn AuditSink>,
    handlers: HandlerRegistry,
    pending: PendingCommits,
    idempotency: IdempotencyStore,
}

impl WriteGateway {
    pub fn new(
        governance: Arc<dyn GovernanceEvaluator>,
        audit: Arc<dyn AuditSink>,
        commit_token_ttl: Duration,
    ) -> Self {
        let fallback = chrono::Duration::seconds(DEFAULT_COMMIT_TOKEN_TTL.as_secs() as i64);
        let ttl = chrono::Duration::from_std(commit_token_ttl).unwrap_or(fallback);

        Self {
            governance,
            approvals: None,
            audit,
            handlers: HandlerRegistry::default(),
            pending: PendingCommits::new(ttl),
            idempotency: IdempotencyStore::default(),
        }
    }

    pub fn with_approval_creator(mut self, approvals: Arc<dyn ApprovalCreator>) -> Self {
        self.approvals = Some(approvals);
        self
    }

    pub fn register_handler<H>(&self, command: impl Into<String>, handler: H)
    where
        H: WriteHandler + 'static,
    {
        self.handlers.register(command, handler);
    }

    pub fn register_fn<F, Fut>(&self, command: impl Into<String>, handler: F)
    where
        F: Fn(WriteEnvelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Fault>> + Send + 'static,
    {
        self.handlers.register_fn(command, handler);
    }

    pub fn registered_commands(&self) -> Vec<String> {
        self.handlers.commands()
    }

    /// Phase one. Never performs a side effect.
    pub async fn request_write(&self, mut envelope: WriteEnvelope) -> WriteResult {
        let Some(execution_id) = envelope.execution_id.clone() else {
            warn!(
                event_name = "gateway.write.rejected",
                write_id = %envelope.write_id.0,
                command = %envelope.command,
                reason = "missing_execution_id",
                "write rejected before policy evaluation"
            );
            return WriteResult::new(WriteStatus::Rejected, envelope.write_id)
                .with_reason("missing_execution_id");
        };

        let key = envelope.resolved_idempotency_key();
        envelope.idempotency_key = key.clone();
        let key_text = key.as_ref().map(|key| key.0.clone()).unwrap_or_default();

        self.record(
            AuditEvent::for_write(&envelope, "write.received", AuditOutcome::Pending)
                .with_data("idempotency_key", key_text.clone()),
        )
        .await;

        let request = PolicyRequest {
            actor_id: envelope.actor_id.clone(),
            context_type: envelope.context_type().to_string(),
            directive: envelope.command.clone(),
            params: envelope.payload.clone(),
            execution_id: Some(execution_id.clone()),
            approval_id: envelope.approval_id.clone(),
        };

        let decision = match self.governance.evaluate(&request).await {
            Ok(decision) => decision,
            Err(fault) => {
                let reason = format!("governance_unavailable:{fault}");
                warn!(
                    event_name = "gateway.write.rejected",
                    execution_id = %execution_id,
                    write_id = %envelope.write_id.0,
                    reason = %reason,
                    "governance evaluation failed; failing closed"
                );
                let audit_id = self
                    .record(
                        AuditEvent::for_write(&envelope, "write.rejected", AuditOutcome::Rejected)
                            .with_data("reason", reason.clone()),
                    )
                    .await;
                return WriteResult::new(WriteStatus::Rejected, envelope.write_id)
                    .with_reason(reason)
                    .with_audit_id(audit_id)
                    .with_idempotency_key(key);
            }
        };

        self.record(
            AuditEvent::for_write(&envelope, "write.policy_evaluated", AuditOutcome::Success)
                .with_data("decision", decision.as_str())
                .with_data("reason", decision.reason().map(str::to_string)),
        )
        .await;

        match decision {
            PolicyDecision::Deny { reason } => {
                info!(
                    event_name = "gateway.write.rejected",
                    execution_id = %execution_id,
                    write_id = %envelope.write_id.0,
                    reason = %reason,
                    "write denied by governance"
                );
                let audit_id = self
                    .record(
                        AuditEvent::for_write(&envelope, "write.rejected", AuditOutcome::Rejected)
                            .with_data("reason", reason.clone()),
                    )
                    .await;
                WriteResult::new(WriteStatus::Rejected, envelope.write_id)
                    .with_reason(reason)
                    .with_audit_id(audit_id)
                    .with_idempotency_key(key)
            }
            PolicyDecision::RequiresApproval { reason, approval_id, approval_payload } => {
                let approval_id =
                    self.resolve_approval_id(&envelope, approval_id, &approval_payload).await;
                info!(
                    event_name = "gateway.write.approval_required",
                    execution_id = %execution_id,
                    write_id = %envelope.write_id.0,
                    approval_id = %approval_id,
                    "write parked pending approval"
                );
                let audit_id = self
                    .record(
                        AuditEvent::for_write(
                            &envelope,
                            "write.approval_required",
                            AuditOutcome::Pending,
                        )
                        .with_data("approval_id", approval_id.clone())
                        .with_data("reason", reason.clone()),
                    )
                    .await;
                WriteResult::new(WriteStatus::RequiresApproval, envelope.write_id)
                    .with_reason(reason)
                    .with_approval_id(approval_id)
                    .with_audit_id(audit_id)
                    .with_idempotency_key(key)
            }
            PolicyDecision::Allow { reason } => {
                let write_id = envelope.write_id.clone();
                let audit_event =
                    AuditEvent::for_write(&envelope, "write.accepted", AuditOutcome::Success);
                let (token, expires_at) = self.pending.issue(envelope, Utc::now());
                debug!(
                    event_name = "gateway.write.accepted",
                    execution_id = %execution_id,
                    write_id = %write_id.0,
                    expires_at = %expires_at,
                    "commit token issued"
                );
                let audit_id = self
                    .record(audit_event.with_data("expires_at", expires_at.to_rfc3339()))
                    .await;
                let mut result = WriteResult::new(WriteStatus::Accepted, write_id)
                    .with_commit_token(token)
                    .with_audit_id(audit_id)
                    .with_idempotency_key(key);
                result.reason = reason;
                result
            }
        }
    }

    /// Phase two. Redeems a commit token and runs the handler at most once per idempotency key.
    pub async fn commit_write(&self, commit_token: &str) -> WriteResult {
        let envelope = match self.pending.take(commit_token, Utc::now()) {
            Ok(envelope) => envelope,
            Err(TokenRejection::Unknown) => {
                warn!(
                    event_name = "gateway.commit.invalid_token",
                    reason = "unknown_token",
                    "commit rejected"
                );
                return WriteResult::new(WriteStatus::InvalidToken, Default::default())
                    .with_reason("unknown_token");
            }
            Err(TokenRejection::Expired(envelope)) => {
                warn!(
                    event_name = "gateway.commit.invalid_token",
                    write_id = %envelope.write_id.0,
                    execution_id = envelope.execution_id.as_deref().unwrap_or("none"),
                    reason = "token_expired",
                    "commit rejected"
                );
                return WriteResult::new(WriteStatus::InvalidToken, envelope.write_id)
                    .with_reason("token_expired");
            }
        };

        let Some(key) = envelope.resolved_idempotency_key() else {
            return WriteResult::new(WriteStatus::Failed, envelope.write_id)
                .with_reason("missing_execution_id");
        };

        match self.idempotency.begin(&key, Utc::now()) {
            Reservation::Reserved => {}
            Reservation::InProgress => {
                info!(
                    event_name = "gateway.commit.in_progress",
                    write_id = %envelope.write_id.0,
                    idempotency_key = %key.0,
                    "another commit holds this idempotency key"
                );
                return WriteResult::new(WriteStatus::Failed, envelope.write_id)
                    .with_reason("idempotency_in_progress")
                    .with_idempotency_key(Some(key));
            }
            Reservation::Replay(stored) => {
                info!(
                    event_name = "gateway.write.idempotent_replay",
                    write_id = %envelope.write_id.0,
                    original_write_id = %stored.write_id.0,
                    idempotency_key = %key.0,
                    "returning stored result"
                );
                let audit_id = self
                    .record(
                        AuditEvent::for_write(
                            &envelope,
                            "write.idempotent_replay",
                            AuditOutcome::Success,
                        )
                        .with_data("idempotency_key", key.0.clone())
                        .with_data("original_write_id", stored.write_id.0.clone()),
                    )
                    .await;
                return WriteResult::new(WriteStatus::Replayed, envelope.write_id)
                    .with_data(stored.data.clone())
                    .with_audit_id(audit_id)
                    .with_idempotency_key(Some(key));
            }
        }

        let held = self.idempotency.hold(&key, envelope.write_id.clone());
        let outcome = match self.handlers.get(&envelope.command) {
            Some(handler) => handler.apply(&envelope).await.map_err(|fault| fault.to_string()),
            None => Err(format!("no_handler_registered_for_command:{}", envelope.command)),
        };

        match outcome {
            Ok(data) => {
                let result = WriteResult::new(WriteStatus::Applied, envelope.write_id.clone())
                    .with_data(Some(data))
                    .with_idempotency_key(Some(key.clone()));
                held.settle(IdempotencyState::Succeeded, result.clone());
                info!(
                    event_name = "gateway.write.applied",
                    execution_id = envelope.execution_id.as_deref().unwrap_or("none"),
                    write_id = %envelope.write_id.0,
                    command = %envelope.command,
                    "write applied"
                );
                let audit_id = self
                    .record(
                        AuditEvent::for_write(&envelope, "write.applied", AuditOutcome::Success)
                            .with_data("idempotency_key", key.0.clone()),
                    )
                    .await;
                result.with_audit_id(audit_id)
            }
            Err(reason) => {
                let result = WriteResult::new(WriteStatus::Failed, envelope.write_id.clone())
                    .with_reason(reason.clone())
                    .with_idempotency_key(Some(key.clone()));
                held.settle(IdempotencyState::Failed, result.clone());
                warn!(
                    event_name = "gateway.write.failed",
                    execution_id = envelope.execution_id.as_deref().unwrap_or("none"),
                    write_id = %envelope.write_id.0,
                    command = %envelope.command,
                    reason = %reason,
                    "write handler failed"
                );
                let audit_id = self
                    .record(
                        AuditEvent::for_write(&envelope, "write.failed", AuditOutcome::Failed)
                            .with_data("idempotency_key", key.0.clone())
                            .with_data("reason", reason),
                    )
                    .await;
                result.with_audit_id(audit_id)
            }
        }
    }

    /// Request then, only when accepted, commit.
    pub async fn write(&self, envelope: WriteEnvelope) -> WriteResult {
        let requested = self.request_write(envelope).await;
        match (requested.status, requested.commit_token.as_deref()) {
            (WriteStatus::Accepted, Some(token)) => self.commit_write(token).await,
            _ => requested,
        }
    }

    pub fn purge_expired_tokens(&self) -> usize {
        let purged = self.pending.purge_expired(Utc::now());
        if purged > 0 {
            debug!(event_name = "gateway.tokens.purged", purged, "expired commit tokens dropped");
        }
        purged
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn idempotency_record(&self, key: &IdempotencyKey) -> Option<IdempotencyRecord> {
        self.idempotency.get(key)
    }

    pub fn idempotency_snapshot(&self) -> Vec<IdempotencyRecord> {
        self.idempotency.snapshot()
    }

    async fn resolve_approval_id(
        &self,
        envelope: &WriteEnvelope,
        decided: Option<String>,
        approval_payload: &Value,
    ) -> String {
        if let Some(approval_id) = decided {
            return approval_id;
        }

        if let Some(approvals) = &self.approvals {
            match approvals.create(envelope, approval_payload).await {
                Ok(approval_id) => return approval_id,
                Err(fault) => warn!(
                    event_name = "gateway.approval.create_failed",
                    write_id = %envelope.write_id.0,
                    error = %fault,
                    "approval creator failed; falling back"
                ),
            }
        }

        envelope.approval_id.clone().unwrap_or_else(|| format!("apr_{}", Uuid::new_v4()))
    }

    async fn record(&self, event: AuditEvent) -> Option<String> {
        append_best_effort(self.audit.as_ref(), event).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::{WriteGateway, WriteHandler, INTERRUPTED_REASON};
    use crate::audit::InMemoryAuditSink;
    use crate::domain::policy::{PolicyDecision, PolicyRequest};
    use crate::domain::write::{IdempotencyState, WriteEnvelope, WriteStatus};
    use crate::errors::Fault;
    use crate::governance::{ApprovalCreator, GovernanceEvaluator};

    struct FixedDecision(PolicyDecision);

    #[async_trait]
    impl GovernanceEvaluator for FixedDecision {
        async fn evaluate(&self, _request: &PolicyRequest) -> Result<PolicyDecision, Fault> {
            Ok(self.0.clone())
        }
    }

    struct Unreachable;

    #[async_trait]
    impl GovernanceEvaluator for Unreachable {
        async fn evaluate(&self, _request: &PolicyRequest) -> Result<PolicyDecision, Fault> {
            Err(Fault::integration("policy service down"))
        }
    }

    struct RecordingGovernance {
        requests: std::sync::Mutex<Vec<PolicyRequest>>,
    }

    #[async_trait]
    impl GovernanceEvaluator for RecordingGovernance {
        async fn evaluate(&self, request: &PolicyRequest) -> Result<PolicyDecision, Fault> {
            self.requests.lock().expect("lock").push(request.clone());
            Ok(PolicyDecision::allow())
        }
    }

    struct StaticApprovals;

    #[async_trait]
    impl ApprovalCreator for StaticApprovals {
        async fn create(
            &self,
            _envelope: &WriteEnvelope,
            _payload: &Value,
        ) -> Result<String, Fault> {
            Ok("apr_created".to_string())
        }
    }

    fn gateway(decision: PolicyDecision) -> (WriteGateway, InMemoryAuditSink) {
        let audit = InMemoryAuditSink::default();
        let gateway = WriteGateway::new(
            Arc::new(FixedDecision(decision)),
            Arc::new(audit.clone()),
            Duration::from_secs(120),
        );
        (gateway, audit)
    }

    fn counting_noop(gateway: &WriteGateway) -> Arc<AtomicUsize> {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        gateway.register_fn("noop_cmd", move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(json!({ "ok": true }))
            }
        });
        calls
    }

    fn envelope() -> WriteEnvelope {
        WriteEnvelope::new("noop_cmd", "u1", "notion:page/1", json!({})).with_execution_id("e1")
    }

    #[tokio::test]
    async fn missing_execution_id_is_rejected_without_audit() {
        let (gateway, audit) = gateway(PolicyDecision::allow());

        let result = gateway.write(WriteEnvelope::new("noop_cmd", "u1", "r1", json!({}))).await;

        assert_eq!(result.status, WriteStatus::Rejected);
        assert!(!result.success);
        assert_eq!(result.reason.as_deref(), Some("missing_execution_id"));
        assert!(audit.events().is_empty());
    }

    #[tokio::test]
    async fn allowed_write_is_applied_then_replayed() {
        let (gateway, audit) = gateway(PolicyDecision::allow());
        let calls = counting_noop(&gateway);

        let first = gateway.write(envelope()).await;
        let second = gateway.write(envelope()).await;

        assert_eq!(first.status, WriteStatus::Applied);
        assert_eq!(first.data, Some(json!({ "ok": true })));
        assert_eq!(second.status, WriteStatus::Replayed);
        assert_eq!(second.data, first.data);
        assert_ne!(second.write_id, first.write_id);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            audit.event_types(),
            vec![
                "write.received",
                "write.policy_evaluated",
                "write.accepted",
                "write.applied",
                "write.received",
                "write.policy_evaluated",
                "write.accepted",
                "write.idempotent_replay",
            ]
        );
    }

    #[tokio::test]
    async fn two_tokens_for_equivalent_envelopes_apply_once() {
        let (gateway, _) = gateway(PolicyDecision::allow());
        let calls = counting_noop(&gateway);

        let first = gateway.request_write(envelope()).await;
        let second = gateway.request_write(envelope()).await;
        assert_eq!(first.idempotency_key, second.idempotency_key);

        let first = gateway.commit_write(first.commit_token.as_deref().expect("token")).await;
        let second = gateway.commit_write(second.commit_token.as_deref().expect("token")).await;

        assert_eq!(first.status, WriteStatus::Applied);
        assert_eq!(second.status, WriteStatus::Replayed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_and_reused_tokens_never_reach_the_handler() {
        let (gateway, _) = gateway(PolicyDecision::allow());
        let calls = counting_noop(&gateway);

        let unknown = gateway.commit_write("not-a-token").await;
        assert_eq!(unknown.status, WriteStatus::InvalidToken);

        let accepted = gateway.request_write(envelope()).await;
        let token = accepted.commit_token.expect("token");
        assert_eq!(gateway.commit_write(&token).await.status, WriteStatus::Applied);
        assert_eq!(gateway.commit_write(&token).await.status, WriteStatus::InvalidToken);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_token_is_invalid() {
        let audit = InMemoryAuditSink::default();
        let gateway = WriteGateway::new(
            Arc::new(FixedDecision(PolicyDecision::allow())),
            Arc::new(audit),
            Duration::ZERO,
        );
        let calls = counting_noop(&gateway);

        let accepted = gateway.request_write(envelope()).await;
        let result = gateway.commit_write(accepted.commit_token.as_deref().expect("token")).await;

        assert_eq!(result.status, WriteStatus::InvalidToken);
        assert_eq!(result.reason.as_deref(), Some("token_expired"));
        assert_eq!(result.write_id, accepted.write_id);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn approval_path_never_issues_a_token() {
        let (gateway, audit) = gateway(PolicyDecision::requires_approval("discount_too_deep"));
        let calls = counting_noop(&gateway);

        let result = gateway.write(envelope()).await;

        assert_eq!(result.status, WriteStatus::RequiresApproval);
        assert!(!result.success);
        assert!(result.commit_token.is_none());
        assert!(result.approval_id.as_deref().is_some_and(|id| id.starts_with("apr_")));
        assert_eq!(gateway.pending_count(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(audit.event_types().contains(&"write.approval_required".to_string()));
    }

    #[tokio::test]
    async fn approval_id_prefers_creator_over_envelope() {
        let (gateway, _) = gateway(PolicyDecision::requires_approval("needs_review"));
        let gateway = gateway.with_approval_creator(Arc::new(StaticApprovals));

        let result = gateway.request_write(envelope().with_approval_id("apr_envelope")).await;

        assert_eq!(result.approval_id.as_deref(), Some("apr_created"));
    }

    #[tokio::test]
    async fn approval_id_falls_back_to_envelope() {
        let (gateway, _) = gateway(PolicyDecision::requires_approval("needs_review"));

        let result = gateway.request_write(envelope().with_approval_id("apr_envelope")).await;

        assert_eq!(result.approval_id.as_deref(), Some("apr_envelope"));
    }

    #[tokio::test]
    async fn deny_is_rejected_with_governance_reason() {
        let (gateway, audit) = gateway(PolicyDecision::deny("command_blocked"));

        let result = gateway.write(envelope()).await;

        assert_eq!(result.status, WriteStatus::Rejected);
        assert_eq!(result.reason.as_deref(), Some("command_blocked"));
        assert!(audit.event_types().contains(&"write.rejected".to_string()));
    }

    #[tokio::test]
    async fn governance_failure_fails_closed() {
        let gateway = WriteGateway::new(
            Arc::new(Unreachable),
            Arc::new(InMemoryAuditSink::default()),
            Duration::from_secs(120),
        );

        let result = gateway.write(envelope()).await;

        assert_eq!(result.status, WriteStatus::Rejected);
        assert_eq!(
            result.reason.as_deref(),
            Some("governance_unavailable:IntegrationError:policy service down")
        );
    }

    #[tokio::test]
    async fn policy_request_carries_context_type_from_resource() {
        let governance = Arc::new(RecordingGovernance { requests: Default::default() });
        let gateway = WriteGateway::new(
            governance.clone(),
            Arc::new(InMemoryAuditSink::default()),
            Duration::from_secs(120),
        );

        gateway.request_write(envelope().with_approval_id("apr_1")).await;

        let requests = governance.requests.lock().expect("lock").clone();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].context_type, "notion");
        assert_eq!(requests[0].directive, "noop_cmd");
        assert_eq!(requests[0].execution_id.as_deref(), Some("e1"));
        assert_eq!(requests[0].approval_id.as_deref(), Some("apr_1"));
    }

    #[tokio::test]
    async fn unregistered_command_fails_and_can_be_retried() {
        let (gateway, _) = gateway(PolicyDecision::allow());

        let failed = gateway.write(envelope()).await;
        assert_eq!(failed.status, WriteStatus::Failed);
        assert_eq!(failed.reason.as_deref(), Some("no_handler_registered_for_command:noop_cmd"));

        counting_noop(&gateway);
        let retried = gateway.write(envelope()).await;
        assert_eq!(retried.status, WriteStatus::Applied);

        let record = gateway
            .idempotency_record(retried.idempotency_key.as_ref().expect("key"))
            .expect("record");
        assert_eq!(record.attempt_count, 2);
    }

    #[tokio::test]
    async fn handler_fault_is_reported_as_kind_and_message() {
        let (gateway, _) = gateway(PolicyDecision::allow());
        gateway.register_fn("noop_cmd", |_| async { Err(Fault::integration("notion 503")) });

        let result = gateway.write(envelope()).await;

        assert_eq!(result.status, WriteStatus::Failed);
        assert_eq!(result.reason.as_deref(), Some("IntegrationError:notion 503"));
    }

    struct PageWriter {
        prefix: &'static str,
    }

    #[async_trait]
    impl WriteHandler for PageWriter {
        async fn apply(&self, envelope: &WriteEnvelope) -> Result<Value, Fault> {
            Ok(json!({ "page": format!("{}/{}", self.prefix, envelope.resource) }))
        }
    }

    #[tokio::test]
    async fn last_registered_handler_wins_and_outcome_is_recorded() {
        let (gateway, _) = gateway(PolicyDecision::allow());
        gateway.register_handler("noop_cmd", PageWriter { prefix: "old" });
        gateway.register_handler("noop_cmd", PageWriter { prefix: "new" });
        assert_eq!(gateway.registered_commands(), vec!["noop_cmd".to_string()]);

        let result = gateway.write(envelope()).await;

        assert_eq!(result.data, Some(json!({ "page": "new/notion:page/1" })));
        let snapshot = gateway.idempotency_snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].state, IdempotencyState::Succeeded);
        let stored = snapshot[0].result.as_ref().expect("stored result");
        assert_eq!(stored.status, WriteStatus::Applied);
    }

    fn slow_noop(gateway: &WriteGateway, first_delay: Duration) -> Arc<AtomicUsize> {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        gateway.register_fn("noop_cmd", move |_| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    tokio::time::sleep(first_delay).await;
                }
                Ok(json!({ "ok": true }))
            }
        });
        calls
    }

    async fn commit_token(gateway: &WriteGateway) -> String {
        let accepted = gateway.request_write(envelope()).await;
        assert_eq!(accepted.status, WriteStatus::Accepted);
        accepted.commit_token.expect("commit token")
    }

    #[tokio::test]
    async fn concurrent_duplicate_commit_is_refused_while_first_runs() {
        let (gateway, _) = gateway(PolicyDecision::allow());
        let calls = slow_noop(&gateway, Duration::from_millis(100));
        let first = commit_token(&gateway).await;
        let second = commit_token(&gateway).await;

        let (a, b) = tokio::join!(gateway.commit_write(&first), gateway.commit_write(&second));

        assert_eq!(a.status, WriteStatus::Applied);
        assert_eq!(b.status, WriteStatus::Failed);
        assert_eq!(b.reason.as_deref(), Some("idempotency_in_progress"));
        assert!(b.data.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn interrupted_commit_releases_its_idempotency_key() {
        let (gateway, _) = gateway(PolicyDecision::allow());
        let calls = slow_noop(&gateway, Duration::from_secs(30));
        let token = commit_token(&gateway).await;

        let interrupted =
            tokio::time::timeout(Duration::from_millis(20), gateway.commit_write(&token)).await;
        assert!(interrupted.is_err());

        let record = gateway.idempotency_snapshot().pop().expect("record");
        assert_eq!(record.state, IdempotencyState::Failed);
        let stored = record.result.expect("interrupted result");
        assert_eq!(stored.reason.as_deref(), Some(INTERRUPTED_REASON));

        let retried = gateway.write(envelope()).await;
        assert_eq!(retried.status, WriteStatus::Applied);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn purge_drops_expired_pending_commits() {
        let gateway = WriteGateway::new(
            Arc::new(FixedDecision(PolicyDecision::allow())),
            Arc::new(InMemoryAuditSink::default()),
            Duration::ZERO,
        );

        gateway.request_write(envelope()).await;
        assert_eq!(gateway.pending_count(), 1);
        assert_eq!(gateway.purge_expired_tokens(), 1);
        assert_eq!(gateway.pending_count(), 0);
    }
}
