use std::sync::Arc;

use execgate_agent::{
    AgentRegistration, AgentRouter, AgentRuntimeState, GuardrailPolicy, Orchestrator,
    OrchestratorSettings, RuntimeStateConfig,
};
use execgate_core::audit::{AuditSink, TracingAuditSink};
use execgate_core::config::{AppConfig, ConfigError};
use execgate_core::{InMemoryApprovals, JobQueue, WriteGateway};
use thiserror::Error;
use tracing::info;

use crate::executors::{HttpExecutor, DEFAULT_REQUEST_TIMEOUT};

pub struct Application {
    pub config: AppConfig,
    pub router: Arc<AgentRouter>,
    pub gateway: Arc<WriteGateway>,
    pub approvals: Arc<InMemoryApprovals>,
    pub queue: Arc<JobQueue>,
    pub orchestrator: Orchestrator,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("http client construction failed: {0}")]
    HttpClient(#[source] reqwest::Error),
}

pub fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        agents = config.agents.len(),
        "starting application bootstrap"
    );
    config.validate()?;

    let runtime_state = AgentRuntimeState::new(RuntimeStateConfig::from(&config.runtime));
    let router = Arc::new(AgentRouter::new(Arc::new(runtime_state)));

    let client =
        HttpExecutor::build_client(DEFAULT_REQUEST_TIMEOUT).map_err(BootstrapError::HttpClient)?;
    for agent in &config.agents {
        let executor = HttpExecutor::new(client.clone(), agent.auth_token.clone());
        let mut registration =
            AgentRegistration::new(agent.name.clone(), agent.executor.clone(), Arc::new(executor))
                .with_capabilities(agent.capabilities.iter().cloned());
        if let Some(max_concurrency) = agent.max_concurrency {
            registration = registration.with_max_concurrency(max_concurrency);
        }
        router.register_agent(registration);
    }

    let audit: Arc<dyn AuditSink> = Arc::new(TracingAuditSink);
    let approvals = Arc::new(InMemoryApprovals::default());
    let guardrails =
        GuardrailPolicy::from_config(&config.guardrails).with_approvals(approvals.clone());
    let gateway = Arc::new(
        WriteGateway::new(Arc::new(guardrails), audit.clone(), config.gateway.commit_token_ttl())
            .with_approval_creator(approvals.clone()),
    );

    let queue = Arc::new(JobQueue::new());
    let orchestrator = Orchestrator::new(
        queue.clone(),
        router.clone(),
        gateway.clone(),
        audit,
        OrchestratorSettings::from_config(&config.queue, &config.orchestrator),
    );

    info!(
        event_name = "system.bootstrap.ready",
        correlation_id = "bootstrap",
        agents = ?router.agents(),
        "application components wired"
    );

    Ok(Application { config, router, gateway, approvals, queue, orchestrator })
}
