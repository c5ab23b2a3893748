use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::domain::policy::{PolicyDecision, PolicyRequest};
use crate::domain::write::WriteEnvelope;
use crate::errors::Fault;

/// Policy gate consulted before any write is allowed to proceed.
#[async_trait]
pub trait GovernanceEvaluator: Send + Sync {
    async fn evaluate(&self, request: &PolicyRequest) -> Result<PolicyDecision, Fault>;
}

/// Opens an approval request for a write that governance parked.
#[async_trait]
pub trait ApprovalCreator: Send + Sync {
    async fn create(&self, envelope: &WriteEnvelope, approval_payload: &Value)
        -> Result<String, Fault>;
}

/// Looks up the decision recorded for an approval id. `None` means the id was never opened.
#[async_trait]
pub trait ApprovalStatus: Send + Sync {
    async fn status(&self, approval_id: &str) -> Result<Option<ApprovalState>, Fault>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    Pending,
    Approved,
    Rejected,
}

/// Process-local approval book. Ids are opened by the gateway through [`ApprovalCreator`]
/// and decided by an operator through [`InMemoryApprovals::approve`] or
/// [`InMemoryApprovals::reject`].
#[derive(Debug, Default)]
pub struct InMemoryApprovals {
    approvals: RwLock<HashMap<String, ApprovalState>>,
}

impl InMemoryApprovals {
    /// Grants a pending approval. Returns `false` for ids this book never opened.
    pub fn approve(&self, approval_id: &str) -> bool {
        self.decide(approval_id, ApprovalState::Approved)
    }

    pub fn reject(&self, approval_id: &str) -> bool {
        self.decide(approval_id, ApprovalState::Rejected)
    }

    pub fn state(&self, approval_id: &str) -> Option<ApprovalState> {
        self.approvals.read().unwrap_or_else(PoisonError::into_inner).get(approval_id).copied()
    }

    pub fn pending_count(&self) -> usize {
        let approvals = self.approvals.read().unwrap_or_else(PoisonError::into_inner);
        approvals.values().filter(|state| **state == ApprovalState::Pending).count()
    }

    fn decide(&self, approval_id: &str, decision: ApprovalState) -> bool {
        let mut approvals = self.approvals.write().unwrap_or_else(PoisonError::into_inner);
        match approvals.get_mut(approval_id) {
            Some(state) => {
                *state = decision;
                info!(
                    event_name = "governance.approval.decided",
                    approval_id,
                    decision = ?decision,
                    "approval decided"
                );
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl ApprovalCreator for InMemoryApprovals {
    async fn create(
        &self,
        envelope: &WriteEnvelope,
        _approval_payload: &Value,
    ) -> Result<String, Fault> {
        let approval_id = format!("apr_{}", Uuid::new_v4());
        self.approvals
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(approval_id.clone(), ApprovalState::Pending);
        info!(
            event_name = "governance.approval.opened",
            approval_id = %approval_id,
            write_id = %envelope.write_id.0,
            command = %envelope.command,
            "approval opened"
        );
        Ok(approval_id)
    }
}

#[async_trait]
impl ApprovalStatus for InMemoryApprovals {
    async fn status(&self, approval_id: &str) -> Result<Option<ApprovalState>, Fault> {
        Ok(self.state(approval_id))
    }
}
