use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::agent::AgentRuntime;
use crate::blackboard::{Blackboard, InMemoryStore};
use crate::bus::{InMemoryBus, MessageBus};
use crate::config::AppConfig;
use crate::context::OpContext;
use crate::domain::{AgentRegistration, AgentState, AgentTask, PerformanceMetrics};
use crate::error::{OrchestratorError, Result};
use crate::swap::{HotSwapCoordinator, SwapSession};

#[derive(Parser, Debug)]
#[command(name = "orchestrator")]
#[command(version)]
#[command(about = "Agent registry and hot-swap coordinator", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Swap agent-v1 for agent-v2 in-process and print the session
    Demo {
        /// Start no runtime for agent-v2, so verification fails and the swap rolls back
        #[arg(long)]
        dead_replacement: bool,

        /// Overall deadline for the swap
        #[arg(long, default_value = "30")]
        timeout_secs: u64,
    },
    /// Load, validate and print the configuration
    Config {
        /// Configuration directory
        #[arg(short, long, env = "ORCH_CONFIG_DIR", default_value = "config")]
        dir: String,
    },
}

/// Run a full swap against the embedded bus and store.
///
/// Returns the session whether the swap completed or not; only a swap that
/// never started is an error.
pub async fn run_demo(config: &AppConfig, dead_replacement: bool, timeout: Duration) -> Result<SwapSession> {
    let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new(&config.bus));
    let blackboard = Blackboard::new(
        Arc::new(InMemoryStore::new()),
        config.blackboard.key_prefix.clone(),
    );
    let coordinator = HotSwapCoordinator::new(bus.clone(), Some(blackboard), config);

    let old_runtime = AgentRuntime::start(bus.clone(), "agent-v1").await?;
    let new_runtime = if dead_replacement {
        info!("Not starting a runtime for agent-v2");
        None
    } else {
        Some(AgentRuntime::start(bus.clone(), "agent-v2").await?)
    };

    let ctx = OpContext::with_timeout(timeout);
    coordinator
        .register_agent(
            &ctx,
            AgentRegistration::new("agent-v1", "technical")
                .with_version("1.0.0")
                .with_capabilities(vec!["trend".into(), "momentum".into()])
                .with_state(demo_state()),
        )
        .await?;

    let mut new_config = HashMap::new();
    new_config.insert("version".to_string(), json!("2.0.0"));
    new_config.insert("improved_algorithm".to_string(), json!(true));

    let outcome = coordinator
        .swap_agent(&ctx, "agent-v1", "agent-v2", new_config)
        .await;
    coordinator.flush_mirror().await;

    old_runtime.stop();
    if let Some(runtime) = &new_runtime {
        runtime.stop();
    }

    match outcome {
        Ok(session) => Ok(session),
        Err(e) => match e.session {
            Some(session) => {
                warn!("Swap did not complete: {}", e.source);
                Ok(*session)
            }
            None => Err(e.source),
        },
    }
}

fn demo_state() -> AgentState {
    let mut state = AgentState::new()
        .with_memory("last_price", json!(50000.0))
        .with_memory("regime", json!({"trend": "up"}))
        .with_pending_task(
            AgentTask::new("task-1", "analyze", 1).with_payload(json!({"symbol": "BTCUSDT"})),
        )
        .with_configuration("ema_fast", json!(12));
    state.performance_metrics = PerformanceMetrics {
        total_tasks: 42,
        successful_tasks: 40,
        failed_tasks: 2,
        realized_pnl: Decimal::new(12540, 2),
        avg_latency_ms: 8.5,
        last_updated: None,
    };
    state
}

/// Load and validate configuration from `dir`
pub fn load_config(dir: &str) -> Result<AppConfig> {
    let config = AppConfig::load_from(dir)?;
    config
        .validate()
        .map_err(|errors| OrchestratorError::Validation(errors.join("; ")))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swap::SwapStatus;

    fn fast_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.swap.ping_timeout_ms = 100;
        config
    }

    #[tokio::test]
    async fn test_demo_completes() {
        let session = run_demo(&fast_config(), false, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(session.status, SwapStatus::Completed);
        assert_eq!(session.steps.len(), 6);
    }

    #[tokio::test]
    async fn test_demo_with_dead_replacement_rolls_back() {
        let session = run_demo(&fast_config(), true, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(session.status, SwapStatus::RolledBack);
        assert!(session.error.is_some());
    }

    #[test]
    fn test_cli_parses_demo_flags() {
        let cli = Cli::parse_from(["orchestrator", "demo", "--dead-replacement"]);
        match cli.command {
            Commands::Demo {
                dead_replacement,
                timeout_secs,
            } => {
                assert!(dead_replacement);
                assert_eq!(timeout_secs, 30);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_load_config_from_missing_dir_uses_defaults() {
        let config = load_config("/nonexistent/orchestrator-config").unwrap();
        assert_eq!(config.bus.subject_prefix, "agents.");
    }
}
