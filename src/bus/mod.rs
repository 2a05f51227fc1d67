//! Agent Message Bus
//!
//! Pub/sub and request/reply between the coordinator and agent processes.
//! Every message is addressed to `(agent, topic)` and travels on the subject
//! `"<prefix><agent>.<topic>"`. Delivery is best-effort and at-most-once;
//! liveness is established explicitly through request/reply (`ping`).

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::context::OpContext;
use crate::error::{OrchestratorError, Result};

pub use memory::InMemoryBus;

/// Default subject prefix
pub const DEFAULT_SUBJECT_PREFIX: &str = "agents.";

/// Control-plane topic every agent listens on
pub const CONTROL_TOPIC: &str = "control";

/// Build the subject for an agent topic
pub fn subject(prefix: &str, agent: &str, topic: &str) -> String {
    format!("{}{}.{}", prefix, agent, topic)
}

/// Message envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    #[serde(default = "new_message_id")]
    pub id: String,
    pub from: String,
    pub to: String,
    pub topic: String,
    /// Encoded command or response object
    pub payload: serde_json::Value,
    /// Inbox subject a requester is waiting on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default = "Utc::now")]
    pub sent_at: DateTime<Utc>,
}

fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

impl AgentMessage {
    /// Build an envelope around a serialized payload
    pub fn new<T: Serialize + ?Sized>(from: &str, to: &str, topic: &str, payload: &T) -> Result<Self> {
        let payload = serde_json::to_value(payload).map_err(|e| {
            OrchestratorError::Internal(format!("failed to encode payload for {}: {}", to, e))
        })?;
        Ok(Self {
            id: new_message_id(),
            from: from.to_string(),
            to: to.to_string(),
            topic: topic.to_string(),
            payload,
            reply_to: None,
            sent_at: Utc::now(),
        })
    }

    /// Decode the payload into a typed command/response
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            OrchestratorError::Internal(format!(
                "failed to decode payload of message {} on {}: {}",
                self.id, self.topic, e
            ))
        })
    }

    /// Envelope answering `self`, routed back to the requester's inbox
    pub fn reply_with(&self, payload: serde_json::Value) -> Self {
        Self {
            id: new_message_id(),
            from: self.to.clone(),
            to: self.from.clone(),
            topic: self.topic.clone(),
            payload,
            reply_to: None,
            sent_at: Utc::now(),
        }
    }
}

/// Commands on the control topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlCommand {
    /// Stop taking new work, keep state
    Pause,
    /// Resume after a pause
    Resume,
    /// Liveness check, answered with `ControlReply::ok()`
    Ping,
}

/// Response to a control request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlReply {
    pub status: String,
}

impl ControlReply {
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// Callback invoked once per delivered message, on its own task
pub type MessageHandler = Arc<dyn Fn(AgentMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a `MessageHandler`
pub fn handler_fn<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(AgentMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |msg| Box::pin(f(msg)))
}

/// Handle to a live subscription.
///
/// Dropping it leaves the subscription in place; call `unsubscribe`.
#[derive(Debug, Clone)]
pub struct Subscription {
    subject: String,
    token: CancellationToken,
}

impl Subscription {
    pub fn new(subject: String, token: CancellationToken) -> Self {
        Self { subject, token }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn unsubscribe(&self) {
        self.token.cancel();
    }

    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
    }
}

/// Pub/sub + request/reply transport between coordinator and agents
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Prefix placed in front of every subject
    fn subject_prefix(&self) -> &str;

    /// Register `handler` for messages sent to `agent` on `topic`
    async fn subscribe(
        &self,
        agent: &str,
        topic: &str,
        handler: MessageHandler,
    ) -> Result<Subscription>;

    /// Fire-and-forget delivery to `message.to` / `message.topic`
    async fn publish(&self, ctx: &OpContext, message: &AgentMessage) -> Result<()>;

    /// Publish and wait for a correlated reply, bounded by `timeout` and the context deadline
    async fn request(
        &self,
        ctx: &OpContext,
        message: &AgentMessage,
        timeout: Duration,
    ) -> Result<AgentMessage>;

    /// Answer a message received through `request`
    async fn reply(
        &self,
        ctx: &OpContext,
        original: &AgentMessage,
        payload: serde_json::Value,
    ) -> Result<()>;

    fn subject_for(&self, agent: &str, topic: &str) -> String {
        subject(self.subject_prefix(), agent, topic)
    }
}
