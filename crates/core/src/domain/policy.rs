use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Everything the governance evaluator sees about a requested write.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicyRequest {
    pub actor_id: String,
    pub context_type: String,
    pub directive: String,
    pub params: Value,
    pub execution_id: Option<String>,
    pub approval_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum PolicyDecision {
    Allow {
        reason: Option<String>,
    },
    Deny {
        reason: String,
    },
    RequiresApproval {
        reason: String,
        approval_id: Option<String>,
        #[serde(default)]
        approval_payload: Value,
    },
}

impl PolicyDecision {
    pub fn allow() -> Self {
        Self::Allow { reason: None }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self::Deny { reason: reason.into() }
    }

    pub fn requires_approval(reason: impl Into<String>) -> Self {
        Self::RequiresApproval {
            reason: reason.into(),
            approval_id: None,
            approval_payload: Value::Null,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow { .. } => "allow",
            Self::Deny { .. } => "deny",
            Self::RequiresApproval { .. } => "requires_approval",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Allow { reason } => reason.as_deref(),
            Self::Deny { reason } | Self::RequiresApproval { reason, .. } => Some(reason),
        }
    }
}

/// Raw verdict shape returned by external governance services.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GovernanceVerdict {
    pub allowed: bool,
    #[serde(default)]
    pub approval_id: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl From<GovernanceVerdict> for PolicyDecision {
    fn from(verdict: GovernanceVerdict) -> Self {
        if verdict.allowed {
            return Self::Allow { reason: verdict.reason };
        }

        let approval_pending = verdict.approval_id.is_some()
            || verdict.reason.as_deref() == Some("requires_approval");
        if approval_pending {
            return Self::RequiresApproval {
                reason: verdict.reason.unwrap_or_else(|| "requires_approval".to_string()),
                approval_id: verdict.approval_id,
                approval_payload: Value::Null,
            };
        }

        Self::Deny { reason: verdict.reason.unwrap_or_else(|| "policy_denied".to_string()) }
    }
}

#[cfg(test)]
mod tests {
    use super::{GovernanceVerdict, PolicyDecision};

    #[test]
    fn allowed_verdict_maps_to_allow() {
        let decision = PolicyDecision::from(GovernanceVerdict {
            allowed: true,
            approval_id: None,
            reason: Some("rule:default".to_string()),
        });
        assert_eq!(decision, PolicyDecision::Allow { reason: Some("rule:default".to_string()) });
    }

    #[test]
    fn verdict_with_approval_id_maps_to_requires_approval() {
        let decision = PolicyDecision::from(GovernanceVerdict {
            allowed: false,
            approval_id: Some("APR-7".to_string()),
            reason: None,
        });

        match decision {
            PolicyDecision::RequiresApproval { approval_id, reason, .. } => {
                assert_eq!(approval_id.as_deref(), Some("APR-7"));
                assert_eq!(reason, "requires_approval");
            }
            other => panic!("expected requires_approval, got {other:?}"),
        }
    }

    #[test]
    fn plain_refusal_maps_to_deny() {
        let decision = PolicyDecision::from(GovernanceVerdict::default());
        assert_eq!(decision.as_str(), "deny");
        assert_eq!(decision.reason(), Some("policy_denied"));
    }
}
