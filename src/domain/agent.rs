use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::state::AgentState;

/// Registry-level agent status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Running and accepting work
    Active,
    /// Told to stop taking work, state kept
    Paused,
    /// Shut down, kept only for audit
    Terminated,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Active => "active",
            AgentStatus::Paused => "paused",
            AgentStatus::Terminated => "terminated",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, AgentStatus::Active)
    }
}

impl Default for AgentStatus {
    fn default() -> Self {
        AgentStatus::Active
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One entry of the agent registry, keyed by `name`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub name: String,
    /// Agent family, e.g. "technical" or "trend"
    #[serde(rename = "type")]
    pub agent_type: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub status: AgentStatus,
    #[serde(default)]
    pub state: AgentState,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl AgentRegistration {
    pub fn new(name: impl Into<String>, agent_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            agent_type: agent_type.into(),
            version: String::new(),
            capabilities: Vec::new(),
            status: AgentStatus::Active,
            state: AgentState::default(),
            registered_at: now,
            last_heartbeat: now,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_state(mut self, state: AgentState) -> Self {
        self.state = state;
        self
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    /// Time since the last heartbeat (zero if the clock went backwards)
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> chrono::Duration {
        (now - self.last_heartbeat).max(chrono::Duration::zero())
    }
}
