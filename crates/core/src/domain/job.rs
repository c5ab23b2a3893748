use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum JobType {
    AgentExecute,
    WriteExecute,
    Other(String),
}

impl JobType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::AgentExecute => "agent_execute",
            Self::WriteExecute => "write_execute",
            Self::Other(name) => name,
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "agent_execute" => Self::AgentExecute,
            "write_execute" => Self::WriteExecute,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for JobType {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<&str> for JobType {
    fn from(value: &str) -> Self {
        Self::parse(value)
    }
}

impl From<JobType> for String {
    fn from(value: JobType) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "queued" => Some(Self::Queued),
            "processing" => Some(Self::Processing),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: JobType,
    pub payload: Value,
    pub execution_id: Option<String>,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        job_type: JobType,
        payload: Value,
        execution_id: Option<String>,
        max_attempts: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::generate(),
            job_type,
            payload,
            execution_id,
            status: JobStatus::Queued,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            last_error: None,
            result: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{Job, JobStatus, JobType};

    #[test]
    fn job_type_keeps_unknown_names() {
        assert_eq!(JobType::parse("agent_execute"), JobType::AgentExecute);
        assert_eq!(JobType::parse("write_execute"), JobType::WriteExecute);
        assert_eq!(JobType::parse("reindex").as_str(), "reindex");

        let encoded = serde_json::to_value(JobType::WriteExecute).expect("serialize job type");
        assert_eq!(encoded, json!("write_execute"));
    }

    #[test]
    fn job_status_round_trips_from_wire_encoding() {
        let cases = [
            JobStatus::Queued,
            JobStatus::Processing,
            JobStatus::Succeeded,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ];

        for status in cases {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn new_job_clamps_max_attempts_to_one() {
        let job = Job::new(JobType::AgentExecute, json!({}), None, 0);
        assert_eq!(job.max_attempts, 1);
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 0);
    }
}
