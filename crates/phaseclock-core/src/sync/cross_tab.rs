//! Follows writes other contexts make to a session's store key.

use std::sync::Arc;

use crate::storage::{decode_state, KeyValueStore, StoreChange, Subscription};
use crate::timer::{RuntimeState, SessionDefinition};

/// A remote change to apply locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteUpdate {
    /// Another context wrote this state.
    State(RuntimeState),
    /// Another context reset the session and removed its state.
    Cleared,
}

pub struct CrossTabSync {
    definition: Arc<SessionDefinition>,
    subscription: Subscription,
}

impl CrossTabSync {
    /// Subscribe to `definition`'s key on `store`.
    pub fn subscribe(store: &dyn KeyValueStore, definition: Arc<SessionDefinition>) -> Self {
        let subscription = store.subscribe(&definition.storage_key());
        Self {
            definition,
            subscription,
        }
    }

    /// Drain queued notifications and return the latest usable one.
    pub fn poll(&mut self) -> Option<RemoteUpdate> {
        let mut latest = None;
        while let Some(change) = self.subscription.try_recv() {
            if let Some(update) = self.decode(change) {
                latest = Some(update);
            }
        }
        latest
    }

    /// Wait for the next usable notification.
    ///
    /// Pends forever once the store has gone away, so it can sit in a
    /// `select!` next to a tick interval.
    pub async fn recv(&mut self) -> RemoteUpdate {
        loop {
            match self.subscription.recv().await {
                Some(change) => {
                    if let Some(update) = self.decode(change) {
                        return update;
                    }
                }
                None => std::future::pending::<()>().await,
            }
        }
    }

    fn decode(&self, change: StoreChange) -> Option<RemoteUpdate> {
        if change.key != self.subscription.key() {
            return None;
        }
        match change.new_value {
            None => Some(RemoteUpdate::Cleared),
            Some(raw) => match decode_state(&raw, &self.definition) {
                Some(state) => Some(RemoteUpdate::State(state)),
                None => {
                    tracing::debug!(
                        key = %change.key,
                        origin = %change.origin,
                        "ignoring unparseable remote state"
                    );
                    None
                }
            },
        }
    }
}
