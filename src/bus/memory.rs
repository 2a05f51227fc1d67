//! Embedded in-process broker
//!
//! Subjects map to subscriber channels held in a `DashMap`. Each subscription
//! runs a receive loop that spawns one task per delivered message, so handlers
//! on different subjects never wait on each other. Replies travel through
//! one-shot inboxes registered by `request`.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{subject, AgentMessage, MessageBus, MessageHandler, Subscription};
use crate::config::BusConfig;
use crate::context::OpContext;
use crate::error::{OrchestratorError, Result};

const INBOX_PREFIX: &str = "_INBOX.";

#[derive(Debug, Clone)]
struct Subscriber {
    id: u64,
    tx: mpsc::Sender<AgentMessage>,
}

/// Delivery counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// In-process `MessageBus`
#[derive(Clone)]
pub struct InMemoryBus {
    prefix: String,
    capacity: usize,
    subjects: Arc<DashMap<String, Vec<Subscriber>>>,
    inboxes: Arc<DashMap<String, oneshot::Sender<AgentMessage>>>,
    next_id: Arc<AtomicU64>,
    counters: Arc<Counters>,
}

impl InMemoryBus {
    pub fn new(config: &BusConfig) -> Self {
        Self {
            prefix: config.subject_prefix.clone(),
            capacity: config.channel_capacity.max(1),
            subjects: Arc::new(DashMap::new()),
            inboxes: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new(&BusConfig::default())
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.counters.published.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    /// Live subscribers on a subject
    pub fn subscriber_count(&self, subject: &str) -> usize {
        self.subjects
            .get(subject)
            .map(|subs| subs.iter().filter(|s| !s.tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Hand `message` to everyone on `subject`. Returns the number of receivers.
    fn deliver(&self, subject: &str, message: &AgentMessage) -> usize {
        self.counters.published.fetch_add(1, Ordering::Relaxed);

        if subject.starts_with(INBOX_PREFIX) {
            return match self.inboxes.remove(subject) {
                Some((_, tx)) => {
                    if tx.send(message.clone()).is_ok() {
                        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                        1
                    } else {
                        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                        0
                    }
                }
                None => {
                    debug!("Dropping reply for abandoned inbox {}", subject);
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    0
                }
            };
        }

        // Clone the senders out so no map guard is held while sending.
        let subscribers: Vec<Subscriber> = match self.subjects.get(subject) {
            Some(subs) => subs.clone(),
            None => return 0,
        };

        let mut delivered = 0;
        let mut closed = Vec::new();
        for sub in subscribers {
            match sub.tx.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        "Subscriber {} on {} is full, dropping message {}",
                        sub.id, subject, message.id
                    );
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(sub.id),
            }
        }

        if !closed.is_empty() {
            self.prune(subject, &closed);
        }
        self.counters
            .delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    fn prune(&self, subject: &str, ids: &[u64]) {
        let now_empty = match self.subjects.get_mut(subject) {
            Some(mut subs) => {
                subs.retain(|s| !ids.contains(&s.id));
                subs.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.subjects.remove_if(subject, |_, subs| subs.is_empty());
        }
        debug!("Pruned {} closed subscriber(s) from {}", ids.len(), subject);
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    fn subject_prefix(&self) -> &str {
        &self.prefix
    }

    async fn subscribe(
        &self,
        agent: &str,
        topic: &str,
        handler: MessageHandler,
    ) -> Result<Subscription> {
        if agent.is_empty() || topic.is_empty() {
            return Err(OrchestratorError::Validation(
                "agent and topic required to subscribe".to_string(),
            ));
        }

        let subject = subject(&self.prefix, agent, topic);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::channel::<AgentMessage>(self.capacity);
        let token = CancellationToken::new();

        self.subjects
            .entry(subject.clone())
            .or_default()
            .push(Subscriber { id, tx });

        let loop_token = token.clone();
        let loop_subject = subject.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Some(msg) => {
                            let handler = handler.clone();
                            tokio::spawn(async move { handler(msg).await });
                        }
                        None => break,
                    },
                }
            }
            debug!("Subscription {} on {} closed", id, loop_subject);
        });

        debug!("Subscribed {} to {}", id, subject);
        Ok(Subscription::new(subject, token))
    }

    async fn publish(&self, ctx: &OpContext, message: &AgentMessage) -> Result<()> {
        ctx.check()?;
        let subject = self.subject_for(&message.to, &message.topic);
        let receivers = self.deliver(&subject, message);
        if receivers == 0 {
            debug!("No subscribers on {} for message {}", subject, message.id);
        }
        Ok(())
    }

    async fn request(
        &self,
        ctx: &OpContext,
        message: &AgentMessage,
        timeout: Duration,
    ) -> Result<AgentMessage> {
        ctx.check()?;
        let subject = self.subject_for(&message.to, &message.topic);
        if self.subscriber_count(&subject) == 0 {
            return Err(OrchestratorError::Communication(format!(
                "no responders on {}",
                subject
            )));
        }

        let inbox = format!("{}{}", INBOX_PREFIX, Uuid::new_v4());
        let (tx, rx) = oneshot::channel();
        self.inboxes.insert(inbox.clone(), tx);

        let mut outgoing = message.clone();
        outgoing.reply_to = Some(inbox.clone());

        if self.deliver(&subject, &outgoing) == 0 {
            self.inboxes.remove(&inbox);
            return Err(OrchestratorError::Communication(format!(
                "request to {} was not delivered",
                subject
            )));
        }

        let wait = ctx.effective_timeout(timeout);
        let timeout_ms = wait.as_millis() as u64;
        let result = ctx
            .bound(&subject, async {
                match tokio::time::timeout(wait, rx).await {
                    Ok(Ok(reply)) => Ok(reply),
                    Ok(Err(_)) => Err(OrchestratorError::Communication(format!(
                        "reply inbox for {} closed",
                        subject
                    ))),
                    Err(_) => Err(OrchestratorError::Timeout {
                        subject: subject.clone(),
                        timeout_ms,
                    }),
                }
            })
            .await;

        self.inboxes.remove(&inbox);
        result
    }

    async fn reply(
        &self,
        ctx: &OpContext,
        original: &AgentMessage,
        payload: serde_json::Value,
    ) -> Result<()> {
        ctx.check()?;
        let inbox = original.reply_to.as_deref().ok_or_else(|| {
            OrchestratorError::Communication(format!(
                "message {} on {} has no reply inbox",
                original.id, original.topic
            ))
        })?;

        let response = original.reply_with(payload);
        if self.deliver(inbox, &response) == 0 {
            return Err(OrchestratorError::Communication(format!(
                "requester for message {} is gone",
                original.id
            )));
        }
        Ok(())
    }
}
