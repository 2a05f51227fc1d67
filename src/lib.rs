pub mod agent;
pub mod blackboard;
pub mod bus;
pub mod cli;
pub mod config;
pub mod context;
pub mod domain;
pub mod error;
pub mod registry;
pub mod swap;

pub use agent::AgentRuntime;
pub use blackboard::{Blackboard, BlackboardMirror, InMemoryStore, KeyValueStore};
pub use bus::{
    AgentMessage, ControlCommand, ControlReply, InMemoryBus, MessageBus, MessageHandler,
    Subscription,
};
pub use config::AppConfig;
pub use context::OpContext;
pub use domain::{
    AgentRegistration, AgentState, AgentStatus, AgentTask, PerformanceMetrics, StateHistoryEntry,
    TaskStatus,
};
pub use error::{OrchestratorError, Result};
pub use registry::AgentRegistry;
pub use swap::{
    HotSwapCoordinator, StepStatus, SwapError, SwapEvent, SwapSession, SwapStatus, SwapStep,
};
