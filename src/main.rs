use agent_orchestrator::cli::{self, Cli, Commands};
use agent_orchestrator::config::AppConfig;
use anyhow::Context;
use clap::Parser;
use std::time::Duration;
use tracing::{info, warn};

mod main_runtime;

use main_runtime::{init_logging, init_logging_simple};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Demo {
            dead_replacement,
            timeout_secs,
        } => {
            let config = match AppConfig::load() {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Warning: using default configuration ({})", e);
                    AppConfig::default()
                }
            };
            init_logging(&config.logging);
            if let Err(errors) = config.validate() {
                for e in &errors {
                    warn!("Config: {}", e);
                }
                anyhow::bail!("invalid configuration ({} problem(s))", errors.len());
            }

            info!("Running hot-swap demo (dead replacement: {})", dead_replacement);
            let session = cli::run_demo(&config, dead_replacement, Duration::from_secs(timeout_secs))
                .await
                .context("demo swap did not start")?;
            println!("{}", serde_json::to_string_pretty(&session)?);
        }
        Commands::Config { dir } => {
            init_logging_simple();
            let config = cli::load_config(&dir)
                .with_context(|| format!("failed to load configuration from {}", dir))?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
