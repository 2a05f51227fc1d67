//! Agent Registry
//!
//! In-memory map of agent name → registration: the single source of truth for
//! which agents are running right now. One lock covers the whole map and is
//! only held for map access and struct copies, never across I/O.
//!
//! With a mirror attached, every mutation enqueues its blackboard write
//! before the lock is released, so mirrored writes follow registry order.

use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

use crate::blackboard::BlackboardMirror;
use crate::domain::{AgentRegistration, AgentState, AgentStatus, StateHistoryEntry};
use crate::error::{OrchestratorError, Result};

/// Concurrency-safe agent registry
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: Arc<RwLock<HashMap<String, AgentRegistration>>>,
    mirror: Option<BlackboardMirror>,
}

fn not_found(name: &str) -> OrchestratorError {
    OrchestratorError::NotFound(format!("agent not found: {}", name))
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose mutations are mirrored to the blackboard
    pub fn with_mirror(mirror: BlackboardMirror) -> Self {
        Self {
            agents: Arc::default(),
            mirror: Some(mirror),
        }
    }

    fn mirror_put(&self, registration: &AgentRegistration) {
        if let Some(mirror) = &self.mirror {
            mirror.put_agent(registration);
        }
    }

    /// Insert or replace a registration, stamping registration and heartbeat time.
    ///
    /// Returns the registration that was replaced, if any.
    pub async fn register(
        &self,
        mut registration: AgentRegistration,
    ) -> Result<(AgentRegistration, Option<AgentRegistration>)> {
        if registration.name.is_empty() {
            return Err(OrchestratorError::Validation(
                "agent name required".to_string(),
            ));
        }
        let now = Utc::now();
        registration.registered_at = now;
        registration.last_heartbeat = now;

        let stored = registration.clone();
        let replaced = {
            let mut agents = self.agents.write().await;
            self.mirror_put(&stored);
            agents.insert(registration.name.clone(), registration)
        };
        debug!(
            "Registered agent {} ({}){}",
            stored.name,
            stored.agent_type,
            if replaced.is_some() { " replacing previous entry" } else { "" }
        );
        Ok((stored, replaced))
    }

    /// Insert a registration exactly as given (recovery, rollback)
    pub async fn restore(&self, registration: AgentRegistration) -> Result<()> {
        if registration.name.is_empty() {
            return Err(OrchestratorError::Validation(
                "agent name required".to_string(),
            ));
        }
        let mut agents = self.agents.write().await;
        self.mirror_put(&registration);
        agents.insert(registration.name.clone(), registration);
        Ok(())
    }

    /// Remove an agent. Removing an absent agent is not an error.
    pub async fn unregister(&self, name: &str) -> Option<AgentRegistration> {
        let mut agents = self.agents.write().await;
        if let Some(mirror) = &self.mirror {
            mirror.remove_agent(name);
        }
        agents.remove(name)
    }

    pub async fn get(&self, name: &str) -> Result<AgentRegistration> {
        let agents = self.agents.read().await;
        agents.get(name).cloned().ok_or_else(|| not_found(name))
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.agents.read().await.contains_key(name)
    }

    /// Point-in-time copy of every registration, sorted by name
    pub async fn list(&self) -> Vec<AgentRegistration> {
        let mut all: Vec<AgentRegistration> = {
            let agents = self.agents.read().await;
            agents.values().cloned().collect()
        };
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub async fn len(&self) -> usize {
        self.agents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.agents.read().await.is_empty()
    }

    /// Record a heartbeat. Heartbeat timestamps never move backwards.
    pub async fn heartbeat(&self, name: &str) -> Result<AgentRegistration> {
        self.modify(name, |reg| {
            let floor = reg.last_heartbeat + ChronoDuration::nanoseconds(1);
            reg.last_heartbeat = Utc::now().max(floor);
        })
        .await
    }

    /// Replace the agent's state wholesale (last write wins)
    pub async fn update_state(&self, name: &str, state: AgentState) -> Result<AgentRegistration> {
        self.modify(name, move |reg| reg.state = state).await
    }

    pub async fn set_status(&self, name: &str, status: AgentStatus) -> Result<AgentRegistration> {
        self.modify(name, move |reg| reg.status = status).await
    }

    /// Deep copy of the agent's state with `entry` appended to the copy's history.
    ///
    /// Taken under the lock, so it never observes half of a concurrent `update_state`.
    pub async fn capture_state(&self, name: &str, entry: StateHistoryEntry) -> Result<AgentState> {
        let mut snapshot = {
            let agents = self.agents.read().await;
            agents
                .get(name)
                .map(|reg| reg.state.clone())
                .ok_or_else(|| not_found(name))?
        };
        snapshot.record_history(entry);
        Ok(snapshot)
    }

    /// Names of agents whose last heartbeat is older than `max_age`
    pub async fn stale_agents(&self, max_age: Duration) -> Vec<String> {
        let max_age = ChronoDuration::from_std(max_age).unwrap_or(ChronoDuration::MAX);
        let now = Utc::now();
        let mut stale: Vec<String> = {
            let agents = self.agents.read().await;
            agents
                .values()
                .filter(|reg| reg.heartbeat_age(now) > max_age)
                .map(|reg| reg.name.clone())
                .collect()
        };
        stale.sort();
        stale
    }

    async fn modify<F>(&self, name: &str, f: F) -> Result<AgentRegistration>
    where
        F: FnOnce(&mut AgentRegistration),
    {
        let mut agents = self.agents.write().await;
        let reg = agents.get_mut(name).ok_or_else(|| not_found(name))?;
        f(reg);
        self.mirror_put(reg);
        Ok(reg.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_register_requires_name() {
        let registry = AgentRegistry::new();
        let err = registry
            .register(AgentRegistration::new("", "technical"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
        assert!(err.to_string().contains("agent name required"));
    }

    #[tokio::test]
    async fn test_register_replaces_same_name() {
        let registry = AgentRegistry::new();
        registry
            .register(AgentRegistration::new("a", "technical").with_version("1"))
            .await
            .unwrap();
        let (_, replaced) = registry
            .register(AgentRegistration::new("a", "technical").with_version("2"))
            .await
            .unwrap();

        assert_eq!(replaced.unwrap().version, "1");
        assert_eq!(registry.get("a").await.unwrap().version, "2");
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let registry = AgentRegistry::new();
        registry
            .register(AgentRegistration::new("a", "technical"))
            .await
            .unwrap();
        assert!(registry.unregister("a").await.is_some());
        assert!(registry.unregister("a").await.is_none());
        assert!(registry.get("a").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_list_is_a_snapshot() {
        let registry = AgentRegistry::new();
        registry
            .register(AgentRegistration::new("b", "trend"))
            .await
            .unwrap();
        registry
            .register(AgentRegistration::new("a", "technical"))
            .await
            .unwrap();

        let listed = registry.list().await;
        registry.unregister("a").await;

        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].name, "a");
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_heartbeat_strictly_increases() {
        let registry = AgentRegistry::new();
        registry
            .register(AgentRegistration::new("a", "technical"))
            .await
            .unwrap();
        let first = registry.heartbeat("a").await.unwrap().last_heartbeat;
        tokio::time::sleep(Duration::from_millis(2)).await;
        let second = registry.heartbeat("a").await.unwrap().last_heartbeat;
        assert!(second > first);

        assert!(registry.heartbeat("ghost").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_capture_state_is_a_deep_copy() {
        let registry = AgentRegistry::new();
        let state = AgentState::new().with_memory("last_price", json!(50000.0));
        registry
            .register(AgentRegistration::new("a", "technical").with_state(state))
            .await
            .unwrap();

        let snapshot = registry
            .capture_state("a", StateHistoryEntry::new("captured"))
            .await
            .unwrap();
        registry
            .update_state("a", AgentState::new().with_memory("last_price", json!(1.0)))
            .await
            .unwrap();

        assert_eq!(snapshot.memory["last_price"], json!(50000.0));
        assert_eq!(snapshot.history.len(), 1);
        assert!(registry.get("a").await.unwrap().state.history.is_empty());
    }

    #[tokio::test]
    async fn test_stale_agents() {
        let registry = AgentRegistry::new();
        let mut old = AgentRegistration::new("old", "technical");
        old.last_heartbeat = Utc::now() - ChronoDuration::minutes(5);
        registry.restore(old).await.unwrap();
        registry
            .register(AgentRegistration::new("fresh", "technical"))
            .await
            .unwrap();

        assert_eq!(
            registry.stale_agents(Duration::from_secs(30)).await,
            vec!["old".to_string()]
        );
    }
    #[tokio::test]
    async fn test_mirrored_heartbeat_never_resurrects_removed_agent() {
        use crate::blackboard::{agent_key, Blackboard, InMemoryStore};

        let board = Blackboard::with_defaults(Arc::new(InMemoryStore::new()));
        let mirror = BlackboardMirror::spawn(board.clone());
        let registry = AgentRegistry::with_mirror(mirror.clone());

        for i in 0..50 {
            let name = format!("agent-{}", i);
            registry
                .register(AgentRegistration::new(name.as_str(), "technical"))
                .await
                .unwrap();
            let beats = {
                let registry = registry.clone();
                let name = name.clone();
                tokio::spawn(async move {
                    for _ in 0..5 {
                        let _ = registry.heartbeat(&name).await;
                        tokio::task::yield_now().await;
                    }
                })
            };
            tokio::task::yield_now().await;
            registry.unregister(&name).await;
            beats.await.unwrap();
        }
        mirror.flush().await;

        for i in 0..50 {
            let key = agent_key(&format!("agent-{}", i));
            assert!(board.get(&key).await.unwrap().is_none(), "{} resurrected", key);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_capture_never_sees_a_torn_state() {
        let registry = AgentRegistry::new();
        let coherent = |n: i64| {
            AgentState::new()
                .with_memory("x", json!(n))
                .with_memory("y", json!(n))
        };
        registry
            .register(AgentRegistration::new("a", "technical").with_state(coherent(0)))
            .await
            .unwrap();

        let writer = {
            let registry = registry.clone();
            tokio::spawn(async move {
                for n in 1..=500 {
                    registry.update_state("a", coherent(n)).await.unwrap();
                }
            })
        };

        for _ in 0..500 {
            let snapshot = registry
                .capture_state("a", StateHistoryEntry::new("captured"))
                .await
                .unwrap();
            assert_eq!(snapshot.memory["x"], snapshot.memory["y"]);
        }
        writer.await.unwrap();
    }
}
