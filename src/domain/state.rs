use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Task lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A unit of work queued on, or being worked by, an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTask {
    pub id: String,
    pub task_type: String,
    pub priority: i32,
    pub status: TaskStatus,
    /// Free-form task input (symbol, timeframe, ...)
    #[serde(default)]
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AgentTask {
    pub fn new(id: impl Into<String>, task_type: impl Into<String>, priority: i32) -> Self {
        Self {
            id: id.into(),
            task_type: task_type.into(),
            priority,
            status: TaskStatus::Pending,
            payload: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Performance counters an agent accumulates while running
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_tasks: i64,
    pub successful_tasks: i64,
    pub failed_tasks: i64,
    /// Realized PnL attributed to this agent's signals (USD)
    #[serde(default)]
    pub realized_pnl: Decimal,
    #[serde(default)]
    pub avg_latency_ms: f64,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl PerformanceMetrics {
    /// Fraction of finished tasks that succeeded, 0 when nothing finished
    pub fn success_rate(&self) -> f64 {
        if self.total_tasks == 0 {
            0.0
        } else {
            self.successful_tasks as f64 / self.total_tasks as f64
        }
    }

    pub fn record_success(&mut self, latency_ms: f64) {
        self.record(latency_ms);
        self.successful_tasks += 1;
    }

    pub fn record_failure(&mut self, latency_ms: f64) {
        self.record(latency_ms);
        self.failed_tasks += 1;
    }

    fn record(&mut self, latency_ms: f64) {
        let n = self.total_tasks as f64;
        self.avg_latency_ms = (self.avg_latency_ms * n + latency_ms) / (n + 1.0);
        self.total_tasks += 1;
        self.last_updated = Some(Utc::now());
    }
}

/// Audit trail entry appended to an agent's state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateHistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub event: String,
    #[serde(default)]
    pub details: HashMap<String, serde_json::Value>,
}

impl StateHistoryEntry {
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            event: event.into(),
            details: HashMap::new(),
        }
    }

    pub fn with_detail(mut self, key: &str, value: serde_json::Value) -> Self {
        self.details.insert(key.to_string(), value);
        self
    }
}

/// Everything an agent has accumulated in memory.
///
/// Owned by exactly one registration. Moving it to another agent is done by
/// cloning during a hot swap, never by sharing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    #[serde(default)]
    pub memory: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub pending_tasks: Vec<AgentTask>,
    #[serde(default)]
    pub active_task: Option<AgentTask>,
    #[serde(default)]
    pub configuration: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub performance_metrics: PerformanceMetrics,
    #[serde(default)]
    pub history: Vec<StateHistoryEntry>,
}

impl AgentState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_memory(mut self, key: &str, value: serde_json::Value) -> Self {
        self.memory.insert(key.to_string(), value);
        self
    }

    pub fn with_pending_task(mut self, task: AgentTask) -> Self {
        self.pending_tasks.push(task);
        self
    }

    pub fn with_configuration(mut self, key: &str, value: serde_json::Value) -> Self {
        self.configuration.insert(key.to_string(), value);
        self
    }

    pub fn record_history(&mut self, entry: StateHistoryEntry) {
        self.history.push(entry);
    }

    /// Pending plus active
    pub fn outstanding_tasks(&self) -> usize {
        self.pending_tasks.len() + usize::from(self.active_task.is_some())
    }
}
