//! Hot-swap Coordinator
//!
//! Façade over the agent registry, the message bus and the blackboard. Exposes
//! agent lifecycle operations and drives the swap protocol:
//!   1. capture the old agent's state
//!   2. pause the old agent (fire-and-forget `pause`)
//!   3. register the new agent
//!   4. verify the new agent answers `ping`
//!   5. transfer the captured state to the new agent
//!   6. unregister the old agent
//!
//! A failure before step 2 ends the session `Failed` with the old agent
//! untouched. A failure or cancellation from step 2 on resumes the old agent,
//! undoes the new registration and ends the session `RolledBack`.

use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

use super::session::{SwapEvent, SwapSession, SwapStatus};
use super::SwapError;
use crate::blackboard::{agent_key, Blackboard, BlackboardMirror, AGENT_INDEX_KEY};
use crate::bus::{AgentMessage, ControlCommand, ControlReply, MessageBus, CONTROL_TOPIC};
use crate::config::AppConfig;
use crate::context::OpContext;
use crate::domain::{AgentRegistration, AgentState, AgentStatus, StateHistoryEntry};
use crate::error::{OrchestratorError, Result};
use crate::registry::AgentRegistry;

/// Sender identity on control messages
pub const COORDINATOR_ID: &str = "coordinator";

pub const STEP_CAPTURE_STATE: &str = "capture_state";
pub const STEP_PAUSE_OLD_AGENT: &str = "pause_old_agent";
pub const STEP_REGISTER_NEW_AGENT: &str = "register_new_agent";
pub const STEP_VERIFY_NEW_AGENT: &str = "verify_new_agent";
pub const STEP_TRANSFER_STATE: &str = "transfer_state";
pub const STEP_FINALIZE: &str = "finalize";

/// Swap config keys applied to the new registration instead of its configuration
const RESERVED_CONFIG_KEYS: &[&str] = &["type", "version", "capabilities"];

/// Budget for control messages sent while rolling back
const ROLLBACK_PUBLISH_TIMEOUT: Duration = Duration::from_secs(2);

/// What the protocol has changed so far, for rollback
#[derive(Debug, Default)]
struct SwapProgress {
    old_paused: bool,
    new_registered: bool,
    /// Registration `new_name` had before the swap replaced it
    displaced: Option<AgentRegistration>,
}

/// Agent lifecycle + hot-swap coordinator
pub struct HotSwapCoordinator {
    registry: AgentRegistry,
    bus: Arc<dyn MessageBus>,
    blackboard: Option<Blackboard>,
    mirror: Option<BlackboardMirror>,
    sessions: Arc<RwLock<HashMap<String, SwapSession>>>,
    ping_timeout: Duration,
    heartbeat_timeout: Duration,
    max_sessions: usize,
    event_tx: broadcast::Sender<SwapEvent>,
}

impl HotSwapCoordinator {
    /// Create a coordinator. Spawns the blackboard mirror task when a
    /// blackboard is given and mirroring is enabled, so it must be called
    /// inside a tokio runtime.
    pub fn new(bus: Arc<dyn MessageBus>, blackboard: Option<Blackboard>, config: &AppConfig) -> Self {
        let mirror = match &blackboard {
            Some(board) if config.blackboard.mirror_enabled => {
                Some(BlackboardMirror::spawn(board.clone()))
            }
            _ => None,
        };
        let registry = match &mirror {
            Some(mirror) => AgentRegistry::with_mirror(mirror.clone()),
            None => AgentRegistry::new(),
        };
        let (event_tx, _) = broadcast::channel(64);

        Self {
            registry,
            bus,
            blackboard,
            mirror,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            ping_timeout: config.swap.ping_timeout(),
            heartbeat_timeout: config.registry.heartbeat_timeout(),
            max_sessions: config.swap.max_sessions_retained.max(1),
            event_tx,
        }
    }

    /// Create with default configuration and no blackboard
    pub fn with_defaults(bus: Arc<dyn MessageBus>) -> Self {
        Self::new(bus, None, &AppConfig::default())
    }

    /// Subscribe to swap events
    pub fn subscribe_events(&self) -> broadcast::Receiver<SwapEvent> {
        self.event_tx.subscribe()
    }

    // ------------------------------------------------------------------
    // Agent lifecycle
    // ------------------------------------------------------------------

    pub async fn register_agent(&self, ctx: &OpContext, registration: AgentRegistration) -> Result<()> {
        ctx.check()?;
        let (stored, _) = self.registry.register(registration).await?;
        info!(
            "Agent {} registered (type: {}, version: {})",
            stored.name, stored.agent_type, stored.version
        );
        Ok(())
    }

    /// Remove an agent; unknown names succeed silently
    pub async fn unregister_agent(&self, ctx: &OpContext, name: &str) -> Result<()> {
        ctx.check()?;
        if self.registry.unregister(name).await.is_some() {
            info!("Agent {} unregistered", name);
        } else {
            debug!("Unregister of unknown agent {} ignored", name);
        }
        Ok(())
    }

    pub async fn get_agent(&self, name: &str) -> Result<AgentRegistration> {
        self.registry.get(name).await
    }

    pub async fn list_agents(&self) -> Vec<AgentRegistration> {
        self.registry.list().await
    }

    pub async fn update_agent_heartbeat(&self, name: &str) -> Result<()> {
        self.registry.heartbeat(name).await?;
        Ok(())
    }

    /// Replace an agent's state wholesale. Last write wins: there is no
    /// version check, so a concurrent writer can silently overwrite another.
    pub async fn update_agent_state(&self, name: &str, state: AgentState) -> Result<()> {
        self.registry.update_state(name, state).await?;
        Ok(())
    }

    /// Agents that missed heartbeats for longer than the configured timeout
    pub async fn stale_agents(&self) -> Vec<String> {
        self.registry.stale_agents(self.heartbeat_timeout).await
    }

    // ------------------------------------------------------------------
    // Swap sessions
    // ------------------------------------------------------------------

    pub async fn get_swap_session(&self, id: &str) -> Result<SwapSession> {
        let sessions = self.sessions.read().await;
        sessions
            .get(id)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(format!("swap session not found: {}", id)))
    }

    /// All retained sessions, oldest first
    pub async fn list_swap_sessions(&self) -> Vec<SwapSession> {
        let mut all: Vec<SwapSession> = {
            let sessions = self.sessions.read().await;
            sessions.values().cloned().collect()
        };
        all.sort_by_key(|s| s.started_at);
        all
    }

    /// Replace `old_name` by `new_name`, carrying the old agent's state across.
    ///
    /// On success the returned session is `Completed`, `new_name` holds the
    /// captured state and `old_name` is gone. On failure the error carries the
    /// terminal session (`Failed` or `RolledBack`) unless the swap never
    /// started.
    pub async fn swap_agent(
        &self,
        ctx: &OpContext,
        old_name: &str,
        new_name: &str,
        new_config: HashMap<String, serde_json::Value>,
    ) -> std::result::Result<SwapSession, SwapError> {
        if new_name.is_empty() {
            return Err(SwapError::before_start(OrchestratorError::Validation(
                "new agent name required".to_string(),
            )));
        }
        if new_name == old_name {
            return Err(SwapError::before_start(OrchestratorError::Validation(
                format!("new agent name must differ from {}", old_name),
            )));
        }
        let old_agent = match self.registry.get(old_name).await {
            Ok(agent) => agent,
            Err(_) => {
                return Err(SwapError::before_start(OrchestratorError::NotFound(format!(
                    "old agent not found: {}",
                    old_name
                ))))
            }
        };

        let mut session = SwapSession::new(old_name, new_name);
        info!(
            "Swap {} started: {} -> {} (trace {})",
            session.id, old_name, new_name, ctx.trace_id
        );
        self.store_session(&session).await;
        self.emit(SwapEvent::Started {
            session_id: session.id.clone(),
            old_agent: old_name.to_string(),
            new_agent: new_name.to_string(),
        });

        let mut progress = SwapProgress::default();
        let outcome = self
            .run_protocol(ctx, &mut session, &old_agent, &new_config, &mut progress)
            .await;

        match outcome {
            Ok(()) => {
                let duration = session.duration.unwrap_or_default();
                info!("Swap {} completed in {:?}", session.id, duration);
                self.store_session(&session).await;
                self.emit(SwapEvent::Completed {
                    session_id: session.id.clone(),
                    duration,
                });
                Ok(session)
            }
            Err(err) => {
                if progress.old_paused {
                    self.roll_back(&mut session, &mut progress, &err).await;
                } else {
                    error!("Swap {} failed: {}", session.id, err);
                    session.fail(&err);
                }
                self.store_session(&session).await;
                let message = session.error.clone().unwrap_or_else(|| err.to_string());
                self.emit(match session.status {
                    SwapStatus::RolledBack => SwapEvent::RolledBack {
                        session_id: session.id.clone(),
                        error: message,
                    },
                    _ => SwapEvent::Failed {
                        session_id: session.id.clone(),
                        error: message,
                    },
                });
                Err(SwapError::with_session(session, err))
            }
        }
    }

    async fn run_protocol(
        &self,
        ctx: &OpContext,
        session: &mut SwapSession,
        old_agent: &AgentRegistration,
        new_config: &HashMap<String, serde_json::Value>,
        progress: &mut SwapProgress,
    ) -> Result<()> {
        let old_name = old_agent.name.as_str();
        let new_name = session.new_agent_name.clone();

        // 1. Capture. Recorded before anything can stop the swap, so every
        // session carries a step and a snapshot.
        session.transition(SwapStatus::CapturingState)?;
        let step = session.add_step(STEP_CAPTURE_STATE);
        let entry = StateHistoryEntry::new("hot_swap_capture")
            .with_detail("swap_id", json!(session.id))
            .with_detail("successor", json!(new_name));
        let snapshot = match self.registry.capture_state(old_name, entry.clone()).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                // Gone since the lookup: keep what the lookup saw.
                let mut fallback = old_agent.state.clone();
                fallback.record_history(entry);
                session.state_snapshot = Some(fallback);
                return Err(e);
            }
        };
        debug!(
            "Swap {}: captured {} memory keys and {} outstanding tasks from {}",
            session.id,
            snapshot.memory.len(),
            snapshot.outstanding_tasks(),
            old_name
        );
        session.state_snapshot = Some(snapshot);
        ctx.check()?;
        self.finish_step(session, step).await;

        // 2. Pause old agent
        ctx.check()?;
        session.transition(SwapStatus::Pausing)?;
        let step = session.add_step(STEP_PAUSE_OLD_AGENT);
        self.pause_agent(ctx, old_name).await?;
        progress.old_paused = true;
        self.finish_step(session, step).await;

        // 3. Register new agent, without state for now
        ctx.check()?;
        let step = session.add_step(STEP_REGISTER_NEW_AGENT);
        progress.displaced = self.registry.get(&new_name).await.ok();
        let registration = build_successor(old_agent, &new_name, new_config);
        self.registry.register(registration).await?;
        progress.new_registered = true;
        self.finish_step(session, step).await;

        // 4. Verify the new agent is alive before handing anything over
        ctx.check()?;
        session.transition(SwapStatus::Verifying)?;
        let step = session.add_step(STEP_VERIFY_NEW_AGENT);
        self.verify_agent(ctx, &new_name).await?;
        self.finish_step(session, step).await;

        // 5. Transfer
        ctx.check()?;
        session.transition(SwapStatus::TransferringState)?;
        let step = session.add_step(STEP_TRANSFER_STATE);
        self.transfer_state(session, new_config).await?;
        self.finish_step(session, step).await;

        // 6. Finalize
        ctx.check()?;
        let step = session.add_step(STEP_FINALIZE);
        self.registry.unregister(old_name).await;
        self.finish_step(session, step).await;
        session.complete()?;
        Ok(())
    }

    /// Mark paused and notify the agent. The notification is not acknowledged.
    async fn pause_agent(&self, ctx: &OpContext, name: &str) -> Result<()> {
        self.registry.set_status(name, AgentStatus::Paused).await?;
        if let Err(e) = self.send_control(ctx, name, ControlCommand::Pause).await {
            warn!("Pause notification to {} not sent: {}", name, e);
        }
        info!("Agent {} paused", name);
        Ok(())
    }

    /// Mark active again and notify the agent
    async fn resume_agent(&self, ctx: &OpContext, name: &str) -> Result<()> {
        self.registry.set_status(name, AgentStatus::Active).await?;
        if let Err(e) = self.send_control(ctx, name, ControlCommand::Resume).await {
            warn!("Resume notification to {} not sent: {}", name, e);
        }
        info!("Agent {} resumed", name);
        Ok(())
    }

    /// Ping the agent and require a `{"status":"ok"}` reply in time
    async fn verify_agent(&self, ctx: &OpContext, name: &str) -> Result<()> {
        let ping = AgentMessage::new(COORDINATOR_ID, name, CONTROL_TOPIC, &ControlCommand::Ping)?;
        let reply = self.bus.request(ctx, &ping, self.ping_timeout).await?;
        let reply: ControlReply = reply.decode_payload()?;
        if !reply.is_ok() {
            return Err(OrchestratorError::Communication(format!(
                "agent {} answered ping with status {}",
                name, reply.status
            )));
        }
        debug!("Agent {} answered ping", name);
        Ok(())
    }

    /// Hand a copy of the snapshot to the new agent and activate it
    async fn transfer_state(
        &self,
        session: &SwapSession,
        new_config: &HashMap<String, serde_json::Value>,
    ) -> Result<()> {
        let mut state = session.state_snapshot.clone().ok_or_else(|| {
            OrchestratorError::Internal(format!("swap {} has no state snapshot", session.id))
        })?;
        for (key, value) in new_config {
            if !RESERVED_CONFIG_KEYS.contains(&key.as_str()) {
                state.configuration.insert(key.clone(), value.clone());
            }
        }
        state.record_history(
            StateHistoryEntry::new("hot_swap_transfer")
                .with_detail("swap_id", json!(session.id))
                .with_detail("predecessor", json!(session.old_agent_name)),
        );

        let new_name = session.new_agent_name.as_str();
        self.registry.update_state(new_name, state).await?;
        self.registry.set_status(new_name, AgentStatus::Active).await?;
        info!(
            "Swap {}: state of {} transferred to {}",
            session.id, session.old_agent_name, new_name
        );
        Ok(())
    }

    /// Undo what the protocol changed and end the session `RolledBack`.
    ///
    /// Runs with a fresh context: the caller's may already be cancelled.
    async fn roll_back(
        &self,
        session: &mut SwapSession,
        progress: &mut SwapProgress,
        err: &OrchestratorError,
    ) {
        warn!("Swap {} failed after pause, rolling back: {}", session.id, err);
        let ctx = OpContext::with_timeout(ROLLBACK_PUBLISH_TIMEOUT);
        let new_name = session.new_agent_name.clone();

        if progress.new_registered {
            match progress.displaced.take() {
                Some(previous) => {
                    if let Err(e) = self.registry.restore(previous).await {
                        error!("Could not restore previous {} registration: {}", new_name, e);
                    }
                }
                None => {
                    self.registry.unregister(&new_name).await;
                }
            }
        }

        if let Err(e) = self.resume_agent(&ctx, &session.old_agent_name).await {
            error!(
                "Swap {}: could not resume {}: {}",
                session.id, session.old_agent_name, e
            );
        }
        session.roll_back(err);
    }

    async fn send_control(&self, ctx: &OpContext, name: &str, command: ControlCommand) -> Result<()> {
        let msg = AgentMessage::new(COORDINATOR_ID, name, CONTROL_TOPIC, &command)?;
        self.bus.publish(ctx, &msg).await
    }

    async fn finish_step(&self, session: &mut SwapSession, step: usize) {
        session.complete_step(step);
        let name = session.steps[step].name.clone();
        self.store_session(session).await;
        self.emit(SwapEvent::StepCompleted {
            session_id: session.id.clone(),
            step: name,
        });
    }

    async fn store_session(&self, session: &SwapSession) {
        {
            let mut sessions = self.sessions.write().await;
            sessions.insert(session.id.clone(), session.clone());
            if sessions.len() > self.max_sessions {
                prune_terminal(&mut sessions, self.max_sessions);
            }
        }
        if let Some(mirror) = &self.mirror {
            mirror.put_session(session);
        }
    }

    fn emit(&self, event: SwapEvent) {
        let _ = self.event_tx.send(event);
    }

    // ------------------------------------------------------------------
    // Blackboard
    // ------------------------------------------------------------------

    /// Wait until queued blackboard writes were applied
    pub async fn flush_mirror(&self) {
        if let Some(mirror) = &self.mirror {
            mirror.flush().await;
        }
    }

    /// Re-register agents mirrored to the blackboard by a previous process.
    ///
    /// Agents already present in memory are left alone. Returns how many were
    /// restored.
    pub async fn recover_from_blackboard(&self) -> Result<usize> {
        let board = self.blackboard.as_ref().ok_or_else(|| {
            OrchestratorError::Validation("no blackboard configured".to_string())
        })?;

        let names: Vec<String> = board.get_json(AGENT_INDEX_KEY).await?.unwrap_or_default();
        let mut restored = 0;
        for name in names {
            if self.registry.contains(&name).await {
                continue;
            }
            match board.get_json::<AgentRegistration>(&agent_key(&name)).await {
                Ok(Some(registration)) => {
                    self.registry.restore(registration).await?;
                    restored += 1;
                }
                Ok(None) => warn!("Indexed agent {} missing from blackboard", name),
                Err(e) => warn!("Skipping unreadable blackboard entry for {}: {}", name, e),
            }
        }

        info!("Recovered {} agent(s) from blackboard", restored);
        Ok(restored)
    }
}

/// Registration for the successor: inherits type, version and capabilities
/// unless the swap config overrides them. Starts without state.
fn build_successor(
    old_agent: &AgentRegistration,
    new_name: &str,
    config: &HashMap<String, serde_json::Value>,
) -> AgentRegistration {
    let agent_type = config
        .get("type")
        .and_then(|v| v.as_str())
        .unwrap_or(old_agent.agent_type.as_str());
    let version = config
        .get("version")
        .and_then(|v| v.as_str())
        .unwrap_or(old_agent.version.as_str());
    let capabilities = config
        .get("capabilities")
        .and_then(|v| v.as_array())
        .map(|caps| {
            caps.iter()
                .filter_map(|c| c.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_else(|| old_agent.capabilities.clone());

    AgentRegistration::new(new_name, agent_type)
        .with_version(version)
        .with_capabilities(capabilities)
}

/// Drop the oldest terminal sessions until at most `max` remain
fn prune_terminal(sessions: &mut HashMap<String, SwapSession>, max: usize) {
    let mut terminal: Vec<(chrono::DateTime<chrono::Utc>, String)> = sessions
        .values()
        .filter(|s| s.is_terminal())
        .map(|s| (s.started_at, s.id.clone()))
        .collect();
    terminal.sort();

    let excess = sessions.len().saturating_sub(max);
    for (_, id) in terminal.into_iter().take(excess) {
        sessions.remove(&id);
    }
}
