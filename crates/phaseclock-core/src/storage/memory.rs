//! In-process key-value store.
//!
//! One shared hub, many handles: [`MemoryStore::connect`] hands out a new
//! handle with its own context id, standing in for another tab on the same
//! origin.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{ContextId, KeyValueStore, StoreChange, Subscribers, Subscription};
use crate::error::StoreError;

#[derive(Debug, Default)]
struct Hub {
    entries: Mutex<HashMap<String, String>>,
    /// Total bytes of keys and values the hub will hold.
    quota_bytes: Option<usize>,
    subscribers: Subscribers,
}

#[derive(Debug, Clone)]
pub struct MemoryStore {
    hub: Arc<Hub>,
    context: ContextId,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            hub: Arc::new(Hub::default()),
            context: ContextId::new(),
        }
    }

    /// A store that rejects writes once `bytes` would be exceeded.
    pub fn with_quota(bytes: usize) -> Self {
        Self {
            hub: Arc::new(Hub {
                quota_bytes: Some(bytes),
                ..Hub::default()
            }),
            context: ContextId::new(),
        }
    }

    /// Another context on the same data.
    pub fn connect(&self) -> Self {
        Self {
            hub: Arc::clone(&self.hub),
            context: ContextId::new(),
        }
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>, StoreError> {
        self.hub
            .entries
            .lock()
            .map_err(|_| StoreError::Poisoned("memory store entries"))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for MemoryStore {
    fn context_id(&self) -> ContextId {
        self.context
    }

    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        {
            let mut entries = self.entries()?;
            if let Some(limit) = self.hub.quota_bytes {
                let used: usize = entries
                    .iter()
                    .filter(|(k, _)| k.as_str() != key)
                    .map(|(k, v)| k.len() + v.len())
                    .sum();
                if used + key.len() + value.len() > limit {
                    return Err(StoreError::QuotaExceeded {
                        key: key.to_string(),
                        limit,
                    });
                }
            }
            entries.insert(key.to_string(), value.to_string());
        }
        self.hub.subscribers.publish(&StoreChange {
            key: key.to_string(),
            new_value: Some(value.to_string()),
            origin: self.context,
        });
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let existed = self.entries()?.remove(key).is_some();
        if existed {
            self.hub.subscribers.publish(&StoreChange {
                key: key.to_string(),
                new_value: None,
                origin: self.context,
            });
        }
        Ok(())
    }

    fn subscribe(&self, key: &str) -> Subscription {
        self.hub.subscribers.add(key, self.context)
    }
}
