//! Ordered background writer from the registry to the blackboard
//!
//! Registry mutations enqueue an operation and return immediately. A single
//! task applies operations in submission order, so a register followed by an
//! unregister can never land in the store reversed.

use std::collections::BTreeSet;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::{agent_key, swap_key, Blackboard, AGENT_INDEX_KEY};
use crate::domain::AgentRegistration;
use crate::swap::SwapSession;

enum MirrorOp {
    PutAgent(Box<AgentRegistration>),
    RemoveAgent(String),
    PutSession(Box<SwapSession>),
    Flush(oneshot::Sender<()>),
}

/// Fire-and-forget handle to the mirror task
#[derive(Clone)]
pub struct BlackboardMirror {
    tx: mpsc::UnboundedSender<MirrorOp>,
}

impl BlackboardMirror {
    /// Spawn the writer task. Must be called inside a tokio runtime.
    pub fn spawn(blackboard: Blackboard) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(blackboard, rx));
        Self { tx }
    }

    pub fn put_agent(&self, registration: &AgentRegistration) {
        self.send(MirrorOp::PutAgent(Box::new(registration.clone())));
    }

    pub fn remove_agent(&self, name: &str) {
        self.send(MirrorOp::RemoveAgent(name.to_string()));
    }

    pub fn put_session(&self, session: &SwapSession) {
        self.send(MirrorOp::PutSession(Box::new(session.clone())));
    }

    /// Wait until every operation submitted before this call was applied
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(MirrorOp::Flush(done_tx));
        let _ = done_rx.await;
    }

    fn send(&self, op: MirrorOp) {
        if self.tx.send(op).is_err() {
            warn!("Blackboard mirror task is gone, dropping update");
        }
    }
}

async fn run(blackboard: Blackboard, mut rx: mpsc::UnboundedReceiver<MirrorOp>) {
    let mut index: BTreeSet<String> = match blackboard.get_json::<Vec<String>>(AGENT_INDEX_KEY).await
    {
        Ok(Some(names)) => names.into_iter().collect(),
        Ok(None) => BTreeSet::new(),
        Err(e) => {
            warn!("Could not load agent index from blackboard: {}", e);
            BTreeSet::new()
        }
    };
    info!(
        "Blackboard mirror started (prefix: {}, {} indexed agents)",
        blackboard.prefix(),
        index.len()
    );

    while let Some(op) = rx.recv().await {
        match op {
            MirrorOp::PutAgent(registration) => {
                let name = registration.name.clone();
                if let Err(e) = blackboard
                    .set_json(&agent_key(&name), registration.as_ref())
                    .await
                {
                    warn!("Failed to mirror agent {}: {}", name, e);
                    continue;
                }
                if index.insert(name) {
                    write_index(&blackboard, &index).await;
                }
            }
            MirrorOp::RemoveAgent(name) => {
                if let Err(e) = blackboard.delete(&agent_key(&name)).await {
                    warn!("Failed to remove mirrored agent {}: {}", name, e);
                }
                if index.remove(&name) {
                    write_index(&blackboard, &index).await;
                }
            }
            MirrorOp::PutSession(session) => {
                if let Err(e) = blackboard
                    .set_json(&swap_key(&session.id), session.as_ref())
                    .await
                {
                    warn!("Failed to mirror swap session {}: {}", session.id, e);
                }
            }
            MirrorOp::Flush(done) => {
                let _ = done.send(());
            }
        }
    }

    debug!("Blackboard mirror stopped");
}

async fn write_index(blackboard: &Blackboard, index: &BTreeSet<String>) {
    let names: Vec<&String> = index.iter().collect();
    if let Err(e) = blackboard.set_json(AGENT_INDEX_KEY, &names).await {
        warn!("Failed to write agent index: {}", e);
    }
}
