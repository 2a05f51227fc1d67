//! Blackboard
//!
//! Namespaced durable key-value access over an external shared store. Gives
//! other processes (and a restarted coordinator) visibility of agent presence
//! and swap history. It is a best-effort mirror: the in-memory registry stays
//! the authority for every hot-path decision.
//!
//! Key schema, relative to the configured prefix:
//! - `agents/<name>`  JSON `AgentRegistration`
//! - `index/agents`   JSON array of registered agent names
//! - `swaps/<id>`     JSON `SwapSession`

pub mod memory;
pub mod mirror;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

use crate::error::Result;

pub use memory::InMemoryStore;
pub use mirror::BlackboardMirror;

/// Default key namespace
pub const DEFAULT_KEY_PREFIX: &str = "blackboard:";

/// Key holding the list of mirrored agent names
pub const AGENT_INDEX_KEY: &str = "index/agents";

pub fn agent_key(name: &str) -> String {
    format!("agents/{}", name)
}

pub fn swap_key(session_id: &str) -> String {
    format!("swaps/{}", session_id)
}

/// External shared key-value store
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// `Ok(None)` when the key is absent
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: String) -> Result<()>;

    /// Deleting an absent key succeeds
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Prefix-scoped view of a `KeyValueStore`
#[derive(Clone)]
pub struct Blackboard {
    store: Arc<dyn KeyValueStore>,
    prefix: String,
}

impl Blackboard {
    pub fn new(store: Arc<dyn KeyValueStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    /// Create with the default `blackboard:` prefix
    pub fn with_defaults(store: Arc<dyn KeyValueStore>) -> Self {
        Self::new(store, DEFAULT_KEY_PREFIX)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Full key as stored in the backend
    pub fn scoped_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        self.store.get(&self.scoped_key(key)).await
    }

    pub async fn set(&self, key: &str, value: String) -> Result<()> {
        self.store.set(&self.scoped_key(key), value).await
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.store.delete(&self.scoped_key(key)).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn set_json<T: Serialize + Sync>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.set(key, raw).await
    }
}
