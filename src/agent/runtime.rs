use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::bus::{
    handler_fn, AgentMessage, ControlCommand, ControlReply, MessageBus, Subscription, CONTROL_TOPIC,
};
use crate::context::OpContext;
use crate::error::Result;

#[derive(Debug, Default)]
struct RuntimeFlags {
    paused: AtomicBool,
    pings_answered: AtomicU64,
}

/// Agent-process side of the control protocol.
///
/// Listens on `<prefix><name>.control`: `pause` and `resume` toggle the paused
/// flag, `ping` is answered with `{"status":"ok"}`.
pub struct AgentRuntime {
    name: String,
    flags: Arc<RuntimeFlags>,
    subscription: Subscription,
}

impl AgentRuntime {
    pub async fn start(bus: Arc<dyn MessageBus>, name: &str) -> Result<Self> {
        let flags = Arc::new(RuntimeFlags::default());
        let handler_flags = flags.clone();
        let handler_bus = bus.clone();
        let agent = name.to_string();

        let subscription = bus
            .subscribe(
                name,
                CONTROL_TOPIC,
                handler_fn(move |msg| {
                    let flags = handler_flags.clone();
                    let bus = handler_bus.clone();
                    let agent = agent.clone();
                    async move { handle_control(&agent, &flags, bus.as_ref(), msg).await }
                }),
            )
            .await?;

        info!("Agent runtime {} listening on {}", name, subscription.subject());
        Ok(Self {
            name: name.to_string(),
            flags,
            subscription,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_paused(&self) -> bool {
        self.flags.paused.load(Ordering::SeqCst)
    }

    pub fn pings_answered(&self) -> u64 {
        self.flags.pings_answered.load(Ordering::SeqCst)
    }

    /// Stop listening for control messages
    pub fn stop(&self) {
        self.subscription.unsubscribe();
        info!("Agent runtime {} stopped", self.name);
    }
}

async fn handle_control(agent: &str, flags: &RuntimeFlags, bus: &dyn MessageBus, msg: AgentMessage) {
    let command = match msg.decode_payload::<ControlCommand>() {
        Ok(command) => command,
        Err(e) => {
            warn!("Agent {} ignoring control message {}: {}", agent, msg.id, e);
            return;
        }
    };

    match command {
        ControlCommand::Pause => {
            flags.paused.store(true, Ordering::SeqCst);
            info!("Agent {} paused by {}", agent, msg.from);
        }
        ControlCommand::Resume => {
            flags.paused.store(false, Ordering::SeqCst);
            info!("Agent {} resumed by {}", agent, msg.from);
        }
        ControlCommand::Ping => {
            let payload = match serde_json::to_value(ControlReply::ok()) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("Agent {} could not encode ping reply: {}", agent, e);
                    return;
                }
            };
            match bus.reply(&OpContext::new(), &msg, payload).await {
                Ok(()) => {
                    flags.pings_answered.fetch_add(1, Ordering::SeqCst);
                    debug!("Agent {} answered ping {}", agent, msg.id);
                }
                Err(e) => warn!("Agent {} failed to answer ping: {}", agent, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use serde_json::json;
    use std::time::Duration;

    async fn eventually<F: Fn() -> bool>(check: F) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_pause_and_resume_toggle_flag() {
        let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::with_defaults());
        let runtime = AgentRuntime::start(bus.clone(), "agent-v1").await.unwrap();
        assert_eq!(runtime.name(), "agent-v1");
        assert!(!runtime.is_paused());

        let ctx = OpContext::new();
        let pause = AgentMessage::new("coordinator", "agent-v1", CONTROL_TOPIC, &ControlCommand::Pause)
            .unwrap();
        bus.publish(&ctx, &pause).await.unwrap();
        assert!(eventually(|| runtime.is_paused()).await);

        let resume =
            AgentMessage::new("coordinator", "agent-v1", CONTROL_TOPIC, &ControlCommand::Resume)
                .unwrap();
        bus.publish(&ctx, &resume).await.unwrap();
        assert!(eventually(|| !runtime.is_paused()).await);
    }

    #[tokio::test]
    async fn test_answers_ping() {
        let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::with_defaults());
        let runtime = AgentRuntime::start(bus.clone(), "agent-v2").await.unwrap();

        let ping = AgentMessage::new("coordinator", "agent-v2", CONTROL_TOPIC, &ControlCommand::Ping)
            .unwrap();
        let reply = bus
            .request(&OpContext::new(), &ping, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply.payload, json!({"status": "ok"}));
        assert_eq!(runtime.pings_answered(), 1);
    }

    #[tokio::test]
    async fn test_garbage_is_ignored() {
        let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::with_defaults());
        let runtime = AgentRuntime::start(bus.clone(), "agent-v1").await.unwrap();

        let junk = AgentMessage::new("x", "agent-v1", CONTROL_TOPIC, &json!({"command": "dance"}))
            .unwrap();
        bus.publish(&OpContext::new(), &junk).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!runtime.is_paused());
    }

    #[tokio::test]
    async fn test_stopped_runtime_no_longer_answers() {
        let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::with_defaults());
        let runtime = AgentRuntime::start(bus.clone(), "agent-v2").await.unwrap();
        runtime.stop();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let ping = AgentMessage::new("coordinator", "agent-v2", CONTROL_TOPIC, &ControlCommand::Ping)
            .unwrap();
        let err = bus
            .request(&OpContext::new(), &ping, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_communication());
    }
}
