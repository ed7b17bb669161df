//! Durable key-value storage and change notification.
//!
//! The engine only needs synchronous `get`/`set`/`remove` of string payloads
//! plus a way to hear about writes made by *other* execution contexts. Each
//! store handle carries its own [`ContextId`]; a handle never receives
//! notifications for its own writes.

mod config;
mod memory;
mod persistence;
mod sqlite;

pub use config::{Config, EngineConfig, StorageConfig, TonesConfig};
pub use memory::MemoryStore;
pub use persistence::{
    decode_state, encode_state, LoadOutcome, LoadSource, PersistedEnvelope, PersistenceAdapter,
    DEFAULT_DEBOUNCE_MS, PERSIST_VERSION,
};
pub use sqlite::SqliteStore;

use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::StoreError;

/// Returns `~/.config/phaseclock[-dev]/` based on PHASECLOCK_ENV.
///
/// Set PHASECLOCK_ENV=dev to use development data directory.
///
/// # Errors
/// Returns an error if creating the config directory fails.
pub fn data_dir() -> Result<PathBuf, std::io::Error> {
    let base_dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config");

    let env = std::env::var("PHASECLOCK_ENV").unwrap_or_else(|_| "production".to_string());

    let dir = if env == "dev" {
        base_dir.join("phaseclock-dev")
    } else {
        base_dir.join("phaseclock")
    };

    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Identity of one execution context (a tab, a process) writing to a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(Uuid);

impl ContextId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A write observed from another context. `new_value` is `None` on removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    pub key: String,
    pub new_value: Option<String>,
    pub origin: ContextId,
}

pub trait KeyValueStore: Send + Sync {
    /// The context this handle writes as.
    fn context_id(&self) -> ContextId;

    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Hear about writes to `key` made by other contexts.
    fn subscribe(&self, key: &str) -> Subscription;
}

/// Receiving end of a [`KeyValueStore::subscribe`] call.
#[derive(Debug)]
pub struct Subscription {
    key: String,
    rx: mpsc::UnboundedReceiver<StoreChange>,
}

impl Subscription {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Next change if one is already queued.
    pub fn try_recv(&mut self) -> Option<StoreChange> {
        self.rx.try_recv().ok()
    }

    /// Wait for the next change. `None` once the store is gone.
    pub async fn recv(&mut self) -> Option<StoreChange> {
        self.rx.recv().await
    }
}

struct Subscriber {
    key: String,
    context: ContextId,
    tx: mpsc::UnboundedSender<StoreChange>,
}

/// Fan-out of store changes to subscribers of other contexts.
#[derive(Default)]
pub(crate) struct Subscribers {
    inner: Mutex<Vec<Subscriber>>,
}

impl Subscribers {
    pub(crate) fn add(&self, key: &str, context: ContextId) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut subs) = self.inner.lock() {
            subs.push(Subscriber {
                key: key.to_string(),
                context,
                tx,
            });
        }
        Subscription {
            key: key.to_string(),
            rx,
        }
    }

    /// Keys with at least one live subscriber.
    pub(crate) fn keys(&self) -> Vec<String> {
        let Ok(mut subs) = self.inner.lock() else {
            return Vec::new();
        };
        subs.retain(|s| !s.tx.is_closed());
        let mut keys: Vec<String> = subs.iter().map(|s| s.key.clone()).collect();
        keys.sort();
        keys.dedup();
        keys
    }

    /// Deliver `change` to every subscriber of its key outside its origin.
    pub(crate) fn publish(&self, change: &StoreChange) {
        let Ok(mut subs) = self.inner.lock() else {
            return;
        };
        subs.retain(|sub| {
            if sub.key != change.key || sub.context == change.origin {
                return !sub.tx.is_closed();
            }
            sub.tx.send(change.clone()).is_ok()
        });
    }
}

impl fmt::Debug for Subscribers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self.inner.lock().map(|s| s.len()).unwrap_or(0);
        f.debug_struct("Subscribers").field("count", &count).finish()
    }
}
