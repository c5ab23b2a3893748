mod bootstrap;
mod executors;
mod heartbeat;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use execgate_core::config::{AppConfig, ConfigOverrides, LoadOptions};

use crate::heartbeat::HeartbeatProber;

#[derive(Debug, Parser)]
#[command(name = "execgate-server", version, about = "Governed agent execution and write gateway")]
struct Cli {
    /// Path to a TOML config file. Defaults to `execgate.toml` or `config/execgate.toml`.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,
}

impl Cli {
    fn load_options(self) -> LoadOptions {
        LoadOptions {
            require_file: self.config.is_some(),
            config_path: self.config,
            overrides: ConfigOverrides { log_level: self.log_level, ..ConfigOverrides::default() },
        }
    }
}

fn init_logging(config: &AppConfig) {
    use execgate_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run(Cli::parse()).await
}

async fn run(cli: Cli) -> Result<()> {
    let config = AppConfig::load(cli.load_options())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config)?;

    let prober =
        HeartbeatProber::spawn(app.router.clone(), app.config.runtime.heartbeat_interval());
    app.orchestrator.start();

    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        agents = app.router.agents().len(),
        handlers = app.gateway.registered_commands().len(),
        "execgate-server started"
    );
    wait_for_shutdown().await?;
    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        queued = app.queue.stats().queued,
        approvals_pending = app.approvals.pending_count(),
        "execgate-server stopping"
    );

    prober.stop().await;
    app.orchestrator.stop().await;

    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use clap::Parser;

    use super::Cli;

    #[test]
    fn explicit_config_path_makes_the_file_required() {
        let cli = Cli::parse_from([
            "execgate-server",
            "--config",
            "/etc/execgate/execgate.toml",
            "--log-level",
            "debug",
        ]);

        let options = cli.load_options();

        assert!(options.require_file);
        assert_eq!(options.config_path, Some(PathBuf::from("/etc/execgate/execgate.toml")));
        assert_eq!(options.overrides.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn bare_invocation_uses_default_search() {
        let options = Cli::parse_from(["execgate-server"]).load_options();

        assert!(!options.require_file);
        assert!(options.config_path.is_none());
    }
}
