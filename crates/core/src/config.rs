use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub gateway: GatewayConfig,
    pub queue: QueueConfig,
    pub orchestrator: OrchestratorConfig,
    pub runtime: RuntimeConfig,
    pub guardrails: GuardrailsConfig,
    pub agents: Vec<AgentConfig>,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub commit_token_ttl_secs: u64,
}

#[derive(Clone, Debug)]
pub struct QueueConfig {
    pub default_max_attempts: u32,
    pub claim_poll_ms: u64,
}

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    pub wait_poll_ms: u64,
    pub wait_timeout_secs: u64,
    pub outcome_summary_keys: usize,
}

#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub heartbeat_ttl_secs: u64,
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
    pub default_max_concurrency: u32,
    pub heartbeat_interval_secs: u64,
}

#[derive(Clone, Debug, Default)]
pub struct GuardrailsConfig {
    pub denied_commands: Vec<String>,
    pub approval_required_commands: Vec<String>,
}

/// One executor-backed agent. `executor` is either a literal endpoint or an `ENV:<NAME>`
/// binding resolved at dispatch time.
#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub name: String,
    pub capabilities: Vec<String>,
    pub executor: String,
    pub max_concurrency: Option<u32>,
    pub auth_token: Option<SecretString>,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub log_level: Option<String>,
    pub log_format: Option<LogFormat>,
    pub commit_token_ttl_secs: Option<u64>,
    pub claim_poll_ms: Option<u64>,
    pub heartbeat_ttl_secs: Option<u64>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig { commit_token_ttl_secs: 120 },
            queue: QueueConfig { default_max_attempts: 1, claim_poll_ms: 500 },
            orchestrator: OrchestratorConfig {
                wait_poll_ms: 150,
                wait_timeout_secs: 30,
                outcome_summary_keys: 16,
            },
            runtime: RuntimeConfig {
                heartbeat_ttl_secs: 120,
                failure_threshold: 3,
                cooldown_secs: 60,
                default_max_concurrency: 1,
                heartbeat_interval_secs: 30,
            },
            guardrails: GuardrailsConfig::default(),
            agents: Vec::new(),
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl GatewayConfig {
    pub fn commit_token_ttl(&self) -> Duration {
        Duration::from_secs(self.commit_token_ttl_secs)
    }
}

impl QueueConfig {
    pub fn claim_poll(&self) -> Duration {
        Duration::from_millis(self.claim_poll_ms)
    }
}

impl OrchestratorConfig {
    pub fn wait_poll(&self) -> Duration {
        Duration::from_millis(self.wait_poll_ms)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }
}

impl RuntimeConfig {
    pub fn heartbeat_ttl(&self) -> Duration {
        Duration::from_secs(self.heartbeat_ttl_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("execgate.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(gateway) = patch.gateway {
            if let Some(commit_token_ttl_secs) = gateway.commit_token_ttl_secs {
                self.gateway.commit_token_ttl_secs = commit_token_ttl_secs;
            }
        }

        if let Some(queue) = patch.queue {
            if let Some(default_max_attempts) = queue.default_max_attempts {
                self.queue.default_max_attempts = default_max_attempts;
            }
            if let Some(claim_poll_ms) = queue.claim_poll_ms {
                self.queue.claim_poll_ms = claim_poll_ms;
            }
        }

        if let Some(orchestrator) = patch.orchestrator {
            if let Some(wait_poll_ms) = orchestrator.wait_poll_ms {
                self.orchestrator.wait_poll_ms = wait_poll_ms;
            }
            if let Some(wait_timeout_secs) = orchestrator.wait_timeout_secs {
                self.orchestrator.wait_timeout_secs = wait_timeout_secs;
            }
            if let Some(outcome_summary_keys) = orchestrator.outcome_summary_keys {
                self.orchestrator.outcome_summary_keys = outcome_summary_keys;
            }
        }

        if let Some(runtime) = patch.runtime {
            if let Some(heartbeat_ttl_secs) = runtime.heartbeat_ttl_secs {
                self.runtime.heartbeat_ttl_secs = heartbeat_ttl_secs;
            }
            if let Some(failure_threshold) = runtime.failure_threshold {
                self.runtime.failure_threshold = failure_threshold;
            }
            if let Some(cooldown_secs) = runtime.cooldown_secs {
                self.runtime.cooldown_secs = cooldown_secs;
            }
            if let Some(default_max_concurrency) = runtime.default_max_concurrency {
                self.runtime.default_max_concurrency = default_max_concurrency;
            }
            if let Some(heartbeat_interval_secs) = runtime.heartbeat_interval_secs {
                self.runtime.heartbeat_interval_secs = heartbeat_interval_secs;
            }
        }

        if let Some(guardrails) = patch.guardrails {
            if let Some(denied_commands) = guardrails.denied_commands {
                self.guardrails.denied_commands = denied_commands;
            }
            if let Some(approval_required_commands) = guardrails.approval_required_commands {
                self.guardrails.approval_required_commands = approval_required_commands;
            }
        }

        if let Some(agents) = patch.agents {
            self.agents = agents
                .into_iter()
                .map(|agent| AgentConfig {
                    name: agent.name,
                    capabilities: agent.capabilities,
                    executor: agent.executor,
                    max_concurrency: agent.max_concurrency,
                    auth_token: agent.auth_token.map(secret_value),
                })
                .collect();
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("EXECGATE_GATEWAY_COMMIT_TOKEN_TTL_SECS") {
            self.gateway.commit_token_ttl_secs =
                parse_u64("EXECGATE_GATEWAY_COMMIT_TOKEN_TTL_SECS", &value)?;
        }

        if let Some(value) = read_env("EXECGATE_QUEUE_DEFAULT_MAX_ATTEMPTS") {
            self.queue.default_max_attempts =
                parse_u32("EXECGATE_QUEUE_DEFAULT_MAX_ATTEMPTS", &value)?;
        }
        if let Some(value) = read_env("EXECGATE_QUEUE_CLAIM_POLL_MS") {
            self.queue.claim_poll_ms = parse_u64("EXECGATE_QUEUE_CLAIM_POLL_MS", &value)?;
        }

        if let Some(value) = read_env("EXECGATE_ORCHESTRATOR_WAIT_POLL_MS") {
            self.orchestrator.wait_poll_ms =
                parse_u64("EXECGATE_ORCHESTRATOR_WAIT_POLL_MS", &value)?;
        }
        if let Some(value) = read_env("EXECGATE_ORCHESTRATOR_WAIT_TIMEOUT_SECS") {
            self.orchestrator.wait_timeout_secs =
                parse_u64("EXECGATE_ORCHESTRATOR_WAIT_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("EXECGATE_ORCHESTRATOR_OUTCOME_SUMMARY_KEYS") {
            self.orchestrator.outcome_summary_keys =
                parse_usize("EXECGATE_ORCHESTRATOR_OUTCOME_SUMMARY_KEYS", &value)?;
        }

        if let Some(value) = read_env("EXECGATE_RUNTIME_HEARTBEAT_TTL_SECS") {
            self.runtime.heartbeat_ttl_secs =
                parse_u64("EXECGATE_RUNTIME_HEARTBEAT_TTL_SECS", &value)?;
        }
        if let Some(value) = read_env("EXECGATE_RUNTIME_FAILURE_THRESHOLD") {
            self.runtime.failure_threshold =
                parse_u32("EXECGATE_RUNTIME_FAILURE_THRESHOLD", &value)?;
        }
        if let Some(value) = read_env("EXECGATE_RUNTIME_COOLDOWN_SECS") {
            self.runtime.cooldown_secs = parse_u64("EXECGATE_RUNTIME_COOLDOWN_SECS", &value)?;
        }
        if let Some(value) = read_env("EXECGATE_RUNTIME_DEFAULT_MAX_CONCURRENCY") {
            self.runtime.default_max_concurrency =
                parse_u32("EXECGATE_RUNTIME_DEFAULT_MAX_CONCURRENCY", &value)?;
        }
        if let Some(value) = read_env("EXECGATE_RUNTIME_HEARTBEAT_INTERVAL_SECS") {
            self.runtime.heartbeat_interval_secs =
                parse_u64("EXECGATE_RUNTIME_HEARTBEAT_INTERVAL_SECS", &value)?;
        }

        if let Some(value) = read_env("EXECGATE_GUARDRAILS_DENIED_COMMANDS") {
            self.guardrails.denied_commands = parse_list(&value);
        }
        if let Some(value) = read_env("EXECGATE_GUARDRAILS_APPROVAL_REQUIRED_COMMANDS") {
            self.guardrails.approval_required_commands = parse_list(&value);
        }

        let log_level =
            read_env("EXECGATE_LOGGING_LEVEL").or_else(|| read_env("EXECGATE_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("EXECGATE_LOGGING_FORMAT").or_else(|| read_env("EXECGATE_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(log_format) = overrides.log_format {
            self.logging.format = log_format;
        }
        if let Some(commit_token_ttl_secs) = overrides.commit_token_ttl_secs {
            self.gateway.commit_token_ttl_secs = commit_token_ttl_secs;
        }
        if let Some(claim_poll_ms) = overrides.claim_poll_ms {
            self.queue.claim_poll_ms = claim_poll_ms;
        }
        if let Some(heartbeat_ttl_secs) = overrides.heartbeat_ttl_secs {
            self.runtime.heartbeat_ttl_secs = heartbeat_ttl_secs;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_gateway(&self.gateway)?;
        validate_queue(&self.queue)?;
        validate_orchestrator(&self.orchestrator)?;
        validate_runtime(&self.runtime)?;
        validate_agents(&self.agents)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("execgate.toml"), PathBuf::from("config/execgate.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_gateway(gateway: &GatewayConfig) -> Result<(), ConfigError> {
    if gateway.commit_token_ttl_secs == 0 || gateway.commit_token_ttl_secs > 3600 {
        return Err(ConfigError::Validation(
            "gateway.commit_token_ttl_secs must be in range 1..=3600".to_string(),
        ));
    }
    Ok(())
}

fn validate_queue(queue: &QueueConfig) -> Result<(), ConfigError> {
    if queue.default_max_attempts == 0 {
        return Err(ConfigError::Validation(
            "queue.default_max_attempts must be greater than zero".to_string(),
        ));
    }
    if queue.claim_poll_ms == 0 || queue.claim_poll_ms > 60_000 {
        return Err(ConfigError::Validation(
            "queue.claim_poll_ms must be in range 1..=60000".to_string(),
        ));
    }
    Ok(())
}

fn validate_orchestrator(orchestrator: &OrchestratorConfig) -> Result<(), ConfigError> {
    if orchestrator.wait_poll_ms == 0 {
        return Err(ConfigError::Validation(
            "orchestrator.wait_poll_ms must be greater than zero".to_string(),
        ));
    }
    if orchestrator.wait_timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "orchestrator.wait_timeout_secs must be greater than zero".to_string(),
        ));
    }
    if orchestrator.outcome_summary_keys == 0 {
        return Err(ConfigError::Validation(
            "orchestrator.outcome_summary_keys must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_runtime(runtime: &RuntimeConfig) -> Result<(), ConfigError> {
    if runtime.heartbeat_ttl_secs == 0 {
        return Err(ConfigError::Validation(
            "runtime.heartbeat_ttl_secs must be greater than zero".to_string(),
        ));
    }
    if runtime.failure_threshold == 0 {
        return Err(ConfigError::Validation(
            "runtime.failure_threshold must be greater than zero".to_string(),
        ));
    }
    if runtime.default_max_concurrency == 0 {
        return Err(ConfigError::Validation(
            "runtime.default_max_concurrency must be greater than zero".to_string(),
        ));
    }
    if runtime.heartbeat_interval_secs == 0 {
        return Err(ConfigError::Validation(
            "runtime.heartbeat_interval_secs must be greater than zero".to_string(),
        ));
    }
    if runtime.heartbeat_interval_secs >= runtime.heartbeat_ttl_secs {
        return Err(ConfigError::Validation(
            "runtime.heartbeat_interval_secs must be shorter than runtime.heartbeat_ttl_secs"
                .to_string(),
        ));
    }
    Ok(())
}

fn validate_agents(agents: &[AgentConfig]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();

    for agent in agents {
        let name = agent.name.trim();
        if name.is_empty() {
            return Err(ConfigError::Validation("agents[].name must not be empty".to_string()));
        }
        if !seen.insert(name) {
            return Err(ConfigError::Validation(format!("agents[] has duplicate name `{name}`")));
        }
        if agent.capabilities.iter().all(|capability| capability.trim().is_empty()) {
            return Err(ConfigError::Validation(format!(
                "agent `{name}` must declare at least one capability"
            )));
        }

        let executor = agent.executor.trim();
        let env_binding = executor.strip_prefix("ENV:").map(str::trim);
        let valid_executor = match env_binding {
            Some(var) => !var.is_empty(),
            None => executor.starts_with("http://") || executor.starts_with("https://"),
        };
        if !valid_executor {
            return Err(ConfigError::Validation(format!(
                "agent `{name}` executor must be an http(s) URL or an `ENV:<NAME>` binding"
            )));
        }

        if agent.max_concurrency == Some(0) {
            return Err(ConfigError::Validation(format!(
                "agent `{name}` max_concurrency must be greater than zero"
            )));
        }
        if agent.auth_token.as_ref().is_some_and(|token| token.expose_secret().trim().is_empty()) {
            return Err(ConfigError::Validation(format!(
                "agent `{name}` auth_token must not be empty when set"
            )));
        }
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.parse::<usize>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    gateway: Option<GatewayPatch>,
    queue: Option<QueuePatch>,
    orchestrator: Option<OrchestratorPatch>,
    runtime: Option<RuntimePatch>,
    guardrails: Option<GuardrailsPatch>,
    agents: Option<Vec<AgentPatch>>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct GatewayPatch {
    commit_token_ttl_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct QueuePatch {
    default_max_attempts: Option<u32>,
    claim_poll_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct OrchestratorPatch {
    wait_poll_ms: Option<u64>,
    wait_timeout_secs: Option<u64>,
    outcome_summary_keys: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct RuntimePatch {
    heartbeat_ttl_secs: Option<u64>,
    failure_threshold: Option<u32>,
    cooldown_secs: Option<u64>,
    default_max_concurrency: Option<u32>,
    heartbeat_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct GuardrailsPatch {
    denied_commands: Option<Vec<String>>,
    approval_required_commands: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct AgentPatch {
    name: String,
    #[serde(default)]
    capabilities: Vec<String>,
    executor: String,
    max_concurrency: Option<u32>,
    auth_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
