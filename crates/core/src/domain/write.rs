use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WriteId(pub String);

impl WriteId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(pub String);

impl IdempotencyKey {
    /// Derives the key for one logical write. Identical coordinates always yield the same key,
    /// so a retried submission collapses onto the original operation.
    pub fn derive(
        task_id: Option<&str>,
        execution_id: &str,
        command: &str,
        resource: &str,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(task_id.unwrap_or_default().as_bytes());
        hasher.update(b"|");
        hasher.update(execution_id.as_bytes());
        hasher.update(b"|");
        hasher.update(command.as_bytes());
        hasher.update(b"|");
        hasher.update(resource.as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }
}

/// Canonical description of one requested mutation, independent of transport.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WriteEnvelope {
    pub command: String,
    pub actor_id: String,
    pub resource: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub execution_id: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<IdempotencyKey>,
    #[serde(default)]
    pub approval_id: Option<String>,
    #[serde(default = "WriteId::generate")]
    pub write_id: WriteId,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl WriteEnvelope {
    pub fn new(
        command: impl Into<String>,
        actor_id: impl Into<String>,
        resource: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            command: command.into(),
            actor_id: actor_id.into(),
            resource: resource.into(),
            payload,
            task_id: None,
            execution_id: None,
            idempotency_key: None,
            approval_id: None,
            write_id: WriteId::generate(),
            created_at: Utc::now(),
        }
    }

    pub fn with_execution_id(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = Some(execution_id.into());
        self
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(IdempotencyKey(key.into()));
        self
    }

    pub fn with_approval_id(mut self, approval_id: impl Into<String>) -> Self {
        self.approval_id = Some(approval_id.into());
        self
    }

    /// The supplied key, or the derived one. `None` until an execution id is present.
    pub fn resolved_idempotency_key(&self) -> Option<IdempotencyKey> {
        if let Some(key) = &self.idempotency_key {
            return Some(key.clone());
        }

        let execution_id = self.execution_id.as_deref()?;
        Some(IdempotencyKey::derive(
            self.task_id.as_deref(),
            execution_id,
            &self.command,
            &self.resource,
        ))
    }

    /// Policy context derived from the resource: the segment before the first `:`.
    pub fn context_type(&self) -> &str {
        match self.resource.split_once(':') {
            Some((prefix, _)) if !prefix.is_empty() => prefix,
            _ => &self.resource,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteStatus {
    Accepted,
    RequiresApproval,
    Rejected,
    Applied,
    Replayed,
    Failed,
    InvalidToken,
}

impl WriteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::RequiresApproval => "requires_approval",
            Self::Rejected => "rejected",
            Self::Applied => "applied",
            Self::Replayed => "replayed",
            Self::Failed => "failed",
            Self::InvalidToken => "invalid_token",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "accepted" => Some(Self::Accepted),
            "requires_approval" => Some(Self::RequiresApproval),
            "rejected" => Some(Self::Rejected),
            "applied" => Some(Self::Applied),
            "replayed" => Some(Self::Replayed),
            "failed" => Some(Self::Failed),
            "invalid_token" => Some(Self::InvalidToken),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Accepted | Self::Applied | Self::Replayed)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WriteResult {
    pub success: bool,
    pub status: WriteStatus,
    pub write_id: WriteId,
    pub reason: Option<String>,
    pub data: Option<Value>,
    pub audit_id: Option<String>,
    pub idempotency_key: Option<IdempotencyKey>,
    pub commit_token: Option<String>,
    pub approval_id: Option<String>,
}

impl WriteResult {
    pub fn new(status: WriteStatus, write_id: WriteId) -> Self {
        Self {
            success: status.is_success(),
            status,
            write_id,
            reason: None,
            data: None,
            audit_id: None,
            idempotency_key: None,
            commit_token: None,
            approval_id: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_data(mut self, data: Option<Value>) -> Self {
        self.data = data;
        self
    }

    pub fn with_audit_id(mut self, audit_id: Option<String>) -> Self {
        self.audit_id = audit_id;
        self
    }

    pub fn with_idempotency_key(mut self, key: Option<IdempotencyKey>) -> Self {
        self.idempotency_key = key;
        self
    }

    pub fn with_commit_token(mut self, token: impl Into<String>) -> Self {
        self.commit_token = Some(token.into());
        self
    }

    pub fn with_approval_id(mut self, approval_id: impl Into<String>) -> Self {
        self.approval_id = Some(approval_id.into());
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyState {
    Processing,
    Succeeded,
    Failed,
}

impl IdempotencyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "processing" => Some(Self::Processing),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: IdempotencyKey,
    pub state: IdempotencyState,
    pub result: Option<WriteResult>,
    pub attempt_count: u32,
    pub first_seen_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{IdempotencyKey, IdempotencyState, WriteEnvelope, WriteStatus};

    #[test]
    fn derived_key_is_stable_for_identical_coordinates() {
        let first = WriteEnvelope::new("create_page", "u1", "notion:page/1", json!({"a": 1}))
            .with_task_id("t1")
            .with_execution_id("e1");
        let second = WriteEnvelope::new("create_page", "u1", "notion:page/1", json!({"a": 2}))
            .with_task_id("t1")
            .with_execution_id("e1");

        assert_ne!(first.write_id, second.write_id);
        assert_eq!(first.resolved_idempotency_key(), second.resolved_idempotency_key());
    }

    #[test]
    fn derived_key_changes_with_any_coordinate() {
        let base = IdempotencyKey::derive(Some("t1"), "e1", "cmd", "r1");

        assert_ne!(base, IdempotencyKey::derive(None, "e1", "cmd", "r1"));
        assert_ne!(base, IdempotencyKey::derive(Some("t1"), "e2", "cmd", "r1"));
        assert_ne!(base, IdempotencyKey::derive(Some("t1"), "e1", "other", "r1"));
        assert_ne!(base, IdempotencyKey::derive(Some("t1"), "e1", "cmd", "r2"));
        assert_eq!(base.0.len(), 64);
    }

    #[test]
    fn supplied_key_wins_over_derivation() {
        let envelope = WriteEnvelope::new("cmd", "u1", "r1", json!({}))
            .with_execution_id("e1")
            .with_idempotency_key("caller-key");

        assert_eq!(envelope.resolved_idempotency_key(), Some(IdempotencyKey("caller-key".into())));
    }

    #[test]
    fn no_key_without_execution_id() {
        let envelope = WriteEnvelope::new("cmd", "u1", "r1", json!({}));
        assert_eq!(envelope.resolved_idempotency_key(), None);
    }

    #[test]
    fn context_type_uses_resource_prefix() {
        let scoped = WriteEnvelope::new("cmd", "u1", "notion:page/42", json!({}));
        let bare = WriteEnvelope::new("cmd", "u1", "r1", json!({}));
        let leading_colon = WriteEnvelope::new("cmd", "u1", ":odd", json!({}));

        assert_eq!(scoped.context_type(), "notion");
        assert_eq!(bare.context_type(), "r1");
        assert_eq!(leading_colon.context_type(), ":odd");
    }

    #[test]
    fn envelope_deserializes_with_generated_identity() {
        let envelope: WriteEnvelope = serde_json::from_value(json!({
            "command": "demo_write",
            "actor_id": "u1",
            "resource": "r1",
            "payload": {"foo": "bar"}
        }))
        .expect("envelope should deserialize");

        assert_eq!(envelope.command, "demo_write");
        assert_eq!(envelope.execution_id, None);
        assert!(!envelope.write_id.0.is_empty());
    }

    #[test]
    fn statuses_round_trip_from_wire_encoding() {
        let cases = [
            WriteStatus::Accepted,
            WriteStatus::RequiresApproval,
            WriteStatus::Rejected,
            WriteStatus::Applied,
            WriteStatus::Replayed,
            WriteStatus::Failed,
            WriteStatus::InvalidToken,
        ];
        for status in cases {
            assert_eq!(WriteStatus::parse(status.as_str()), Some(status));
        }

        for state in
            [IdempotencyState::Processing, IdempotencyState::Succeeded, IdempotencyState::Failed]
        {
            assert_eq!(IdempotencyState::parse(state.as_str()), Some(state));
        }
    }
}
