pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;
pub mod gateway;
pub mod governance;
pub mod queue;

pub use audit::{
    append_best_effort, AuditCategory, AuditError, AuditEvent, AuditOutcome, AuditSink,
    InMemoryAuditSink, TracingAuditSink,
};
pub use domain::job::{Job, JobId, JobStatus, JobType};
pub use domain::policy::{GovernanceVerdict, PolicyDecision, PolicyRequest};
pub use domain::write::{
    IdempotencyKey, IdempotencyRecord, IdempotencyState, WriteEnvelope, WriteId, WriteResult,
    WriteStatus,
};
pub use errors::Fault;
pub use gateway::{WriteGateway, WriteHandler};
pub use governance::{
    ApprovalCreator, ApprovalState, ApprovalStatus, GovernanceEvaluator, InMemoryApprovals,
};
pub use queue::{JobQueue, QueueError, QueueStats};
