use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use execgate_core::config::GuardrailsConfig;
use execgate_core::domain::policy::{PolicyDecision, PolicyRequest};
use execgate_core::errors::Fault;
use execgate_core::governance::{
    ApprovalState, ApprovalStatus, GovernanceEvaluator, InMemoryApprovals,
};

/// Static command policy used as the default governance evaluator. An approval id attached
/// to a request only lets an approval-required command through once `approvals` reports it
/// as approved.
#[derive(Clone)]
pub struct GuardrailPolicy {
    pub denied_commands: HashSet<String>,
    pub approval_required_commands: HashSet<String>,
    approvals: Arc<dyn ApprovalStatus>,
}

impl Default for GuardrailPolicy {
    fn default() -> Self {
        Self {
            denied_commands: HashSet::new(),
            approval_required_commands: HashSet::new(),
            approvals: Arc::new(InMemoryApprovals::default()),
        }
    }
}

impl std::fmt::Debug for GuardrailPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardrailPolicy")
            .field("denied_commands", &self.denied_commands)
            .field("approval_required_commands", &self.approval_required_commands)
            .finish_non_exhaustive()
    }
}

impl GuardrailPolicy {
    pub fn from_config(config: &GuardrailsConfig) -> Self {
        Self {
            denied_commands: config.denied_commands.iter().cloned().collect(),
            approval_required_commands: config.approval_required_commands.iter().cloned().collect(),
            ..Self::default()
        }
    }

    pub fn with_approvals(mut self, approvals: Arc<dyn ApprovalStatus>) -> Self {
        self.approvals = approvals;
        self
    }

    pub fn deny(mut self, command: impl Into<String>) -> Self {
        self.denied_commands.insert(command.into());
        self
    }

    pub fn require_approval(mut self, command: impl Into<String>) -> Self {
        self.approval_required_commands.insert(command.into());
        self
    }

    pub async fn decide(&self, request: &PolicyRequest) -> Result<PolicyDecision, Fault> {
        if self.denied_commands.contains(&request.directive) {
            return Ok(PolicyDecision::deny("command_denied"));
        }

        if !self.approval_required_commands.contains(&request.directive) {
            return Ok(PolicyDecision::allow());
        }

        let Some(approval_id) = request.approval_id.as_deref() else {
            return Ok(parked(request, "approval_required", None));
        };

        let decision = match self.approvals.status(approval_id).await? {
            Some(ApprovalState::Approved) => {
                PolicyDecision::Allow { reason: Some("approval_granted".to_string()) }
            }
            Some(ApprovalState::Rejected) => PolicyDecision::deny("approval_rejected"),
            Some(ApprovalState::Pending) => {
                parked(request, "approval_pending", Some(approval_id.to_string()))
            }
            // Never opened by the approval book: open a fresh one instead of trusting it.
            None => parked(request, "approval_unknown", None),
        };
        Ok(decision)
    }
}

fn parked(request: &PolicyRequest, reason: &str, approval_id: Option<String>) -> PolicyDecision {
    PolicyDecision::RequiresApproval {
        reason: reason.to_string(),
        approval_id,
        approval_payload: json!({
            "actor_id": request.actor_id,
            "context_type": request.context_type,
            "command": request.directive,
            "execution_id": request.execution_id,
        }),
    }
}

#[async_trait]
impl GovernanceEvaluator for GuardrailPolicy {
    async fn evaluate(&self, request: &PolicyRequest) -> Result<PolicyDecision, Fault> {
        self.decide(request).await
    }
}
