//! Runtime state persistence with debounced writes.
//!
//! Bursts of state changes are coalesced: the first change arms a deadline
//! `debounce_ms` out, later changes replace the pending state without moving
//! the deadline, and whatever is pending at the deadline is written once.
//! [`PersistenceAdapter::flush`] (also run on drop) writes immediately.
//!
//! A failed write is logged once and switches the adapter to memory-only mode
//! for the rest of its life; the session keeps running.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::KeyValueStore;
use crate::timer::{ReloadPolicy, RuntimeState, SessionDefinition, SessionStatus};

/// Payload format version. Payloads with any other version are discarded.
pub const PERSIST_VERSION: u32 = 1;

pub const DEFAULT_DEBOUNCE_MS: u64 = 150;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedEnvelope {
    pub version: u32,
    #[serde(flatten)]
    pub state: RuntimeState,
}

/// Serialize `state` into the versioned envelope.
pub fn encode_state(state: &RuntimeState) -> Result<String, serde_json::Error> {
    serde_json::to_string(&PersistedEnvelope {
        version: PERSIST_VERSION,
        state: state.clone(),
    })
}

/// Parse a stored payload for `definition`.
///
/// Returns `None` for malformed JSON, a foreign version, or a state that is
/// inconsistent with the definition.
pub fn decode_state(raw: &str, definition: &SessionDefinition) -> Option<RuntimeState> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    let version = value.get("version").and_then(|v| v.as_u64());
    if version != Some(u64::from(PERSIST_VERSION)) {
        tracing::debug!(?version, "discarding payload with foreign version");
        return None;
    }
    let envelope: PersistedEnvelope = serde_json::from_value(value).ok()?;
    match envelope.state.check(definition) {
        Ok(()) => Some(envelope.state),
        Err(e) => {
            tracing::debug!(error = %e, "discarding inconsistent payload");
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    /// Nothing stored; fresh idle state.
    Fresh,
    /// Stored payload was unusable; fresh idle state.
    Discarded,
    /// Stored payload restored (and reconciled if it was running).
    Restored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOutcome {
    pub state: RuntimeState,
    pub source: LoadSource,
}

#[derive(Debug, Clone)]
struct PendingWrite {
    state: RuntimeState,
    due_at: u64,
}

pub struct PersistenceAdapter {
    store: Arc<dyn KeyValueStore>,
    key: String,
    debounce_ms: u64,
    pending: Option<PendingWrite>,
    memory_only: bool,
}

impl PersistenceAdapter {
    pub fn new(store: Arc<dyn KeyValueStore>, key: impl Into<String>, debounce_ms: u64) -> Self {
        Self {
            store,
            key: key.into(),
            debounce_ms,
            pending: None,
            memory_only: false,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_memory_only(&self) -> bool {
        self.memory_only
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Read and reconcile the stored state for `definition` at `now`.
    ///
    /// A state saved while running has the time spent away subtracted. Under
    /// [`ReloadPolicy::Resume`] it keeps running, re-anchored at `now` when
    /// time is left, or left on its old anchor so the tick driver crosses the
    /// boundaries it missed. Under [`ReloadPolicy::Pause`] it comes back paused.
    pub fn load(
        &self,
        definition: &SessionDefinition,
        policy: ReloadPolicy,
        now: u64,
    ) -> LoadOutcome {
        let raw = match self.store.get(&self.key) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "failed to read session state");
                None
            }
        };
        let Some(raw) = raw else {
            return LoadOutcome {
                state: RuntimeState::fresh(definition),
                source: LoadSource::Fresh,
            };
        };
        let Some(mut state) = decode_state(&raw, definition) else {
            tracing::warn!(key = %self.key, "stored session state unusable; starting fresh");
            return LoadOutcome {
                state: RuntimeState::fresh(definition),
                source: LoadSource::Discarded,
            };
        };

        if state.status == SessionStatus::Running {
            let remaining = state.remaining_at(now);
            match policy {
                ReloadPolicy::Resume if remaining > 0 => {
                    state.remaining_ms = remaining;
                    state.started_at = Some(now);
                }
                ReloadPolicy::Resume => {}
                ReloadPolicy::Pause => {
                    state.remaining_ms = remaining;
                    state.started_at = None;
                    state.status = SessionStatus::Paused;
                }
            }
            tracing::debug!(
                key = %self.key,
                ?policy,
                remaining_ms = remaining,
                "reconciled running state after reload"
            );
        }

        LoadOutcome {
            state,
            source: LoadSource::Restored,
        }
    }

    /// Queue `state` for writing no later than `debounce_ms` after the first
    /// unflushed change.
    pub fn save(&mut self, state: &RuntimeState, now: u64) {
        if self.memory_only {
            return;
        }
        match self.pending.as_mut() {
            Some(pending) => pending.state = state.clone(),
            None => {
                self.pending = Some(PendingWrite {
                    state: state.clone(),
                    due_at: now.saturating_add(self.debounce_ms),
                })
            }
        }
    }

    /// Write the pending state if its deadline has passed.
    pub fn flush_due(&mut self, now: u64) -> bool {
        match &self.pending {
            Some(pending) if pending.due_at <= now => self.flush(),
            _ => false,
        }
    }

    /// Write the pending state now. Returns whether a write happened.
    pub fn flush(&mut self) -> bool {
        let Some(pending) = self.pending.take() else {
            return false;
        };
        if self.memory_only {
            return false;
        }
        let payload = match encode_state(&pending.state) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "failed to encode session state");
                return false;
            }
        };
        match self.store.set(&self.key, &payload) {
            Ok(()) => {
                tracing::debug!(
                    key = %self.key,
                    status = %pending.state.status,
                    "persisted session state"
                );
                true
            }
            Err(e) => {
                tracing::warn!(
                    key = %self.key,
                    error = %e,
                    "failed to persist session state; continuing in memory only"
                );
                self.memory_only = true;
                false
            }
        }
    }

    /// Drop the pending write, e.g. after a newer remote state replaced it.
    pub fn discard_pending(&mut self) {
        self.pending = None;
    }

    /// Remove the stored state and anything pending.
    ///
    /// Attempted even in memory-only mode: a stale payload written before the
    /// failure would otherwise come back on the next load.
    pub fn clear(&mut self) {
        self.pending = None;
        if let Err(e) = self.store.remove(&self.key) {
            tracing::warn!(key = %self.key, error = %e, "failed to clear session state");
        }
    }
}

impl Drop for PersistenceAdapter {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::timer::{Phase, PhaseKind, SessionType};

    fn definition(session_type: SessionType) -> SessionDefinition {
        SessionDefinition::new(
            "persist",
            session_type,
            vec![
                Phase::new("a", PhaseKind::Work, 5_000),
                Phase::new("b", PhaseKind::Break, 2_000),
            ],
        )
        .unwrap()
    }

    fn adapter(store: &MemoryStore) -> PersistenceAdapter {
        PersistenceAdapter::new(Arc::new(store.clone()), "key", DEFAULT_DEBOUNCE_MS)
    }

    fn running_state(def: &SessionDefinition, remaining_ms: u64, started_at: u64) -> RuntimeState {
        let mut state = RuntimeState::fresh(def);
        state.status = SessionStatus::Running;
        state.remaining_ms = remaining_ms;
        state.started_at = Some(started_at);
        state
    }

    #[test]
    fn missing_payload_loads_fresh() {
        let store = MemoryStore::new();
        let def = definition(SessionType::Focus);
        let outcome = adapter(&store).load(&def, ReloadPolicy::Resume, 0);
        assert_eq!(outcome.source, LoadSource::Fresh);
        assert_eq!(outcome.state, RuntimeState::fresh(&def));
    }

    #[test]
    fn malformed_and_foreign_versions_are_discarded() {
        let store = MemoryStore::new();
        let def = definition(SessionType::Focus);
        for raw in [
            "not json",
            r#"{"version": 0, "sessionId": "persist"}"#,
            concat!(
                r#"{"version": 99, "sessionId": "persist", "currentIndex": 0, "remainingMs": 1,"#,
                r#" "status": "IDLE", "startedAt": null, "completedCount": 0}"#,
            ),
            concat!(
                r#"{"version": 1, "sessionId": "persist", "currentIndex": 7, "remainingMs": 1,"#,
                r#" "status": "IDLE", "startedAt": null, "completedCount": 0}"#,
            ),
        ] {
            store.set("key", raw).unwrap();
            let outcome = adapter(&store).load(&def, ReloadPolicy::Resume, 0);
            assert_eq!(outcome.source, LoadSource::Discarded, "payload {raw}");
            assert_eq!(outcome.state.status, SessionStatus::Idle);
        }
    }

    #[test]
    fn payload_shape_is_flat_and_versioned() {
        let def = definition(SessionType::Focus);
        let raw = encode_state(&running_state(&def, 4_000, 1_000)).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["version"], 1);
        assert_eq!(json["sessionId"], "persist");
        assert_eq!(json["status"], "RUNNING");
        assert_eq!(json["startedAt"], 1_000);
        assert_eq!(json["completedCount"], 0);
    }

    #[test]
    fn reload_resume_recomputes_remaining() {
        let store = MemoryStore::new();
        let def = definition(SessionType::Focus);
        let now = 100_000;
        store
            .set("key", &encode_state(&running_state(&def, 4_000, now - 1_000)).unwrap())
            .unwrap();

        let outcome = adapter(&store).load(&def, ReloadPolicy::Resume, now + 2_000);
        assert_eq!(outcome.source, LoadSource::Restored);
        assert_eq!(outcome.state.status, SessionStatus::Running);
        assert_eq!(outcome.state.remaining_ms, 1_000);
        assert_eq!(outcome.state.started_at, Some(now + 2_000));
    }

    #[test]
    fn reload_pause_freezes_remaining() {
        let store = MemoryStore::new();
        let def = definition(SessionType::Dialogue);
        store
            .set("key", &encode_state(&running_state(&def, 4_000, 0)).unwrap())
            .unwrap();
        let outcome = adapter(&store).load(&def, ReloadPolicy::Pause, 3_000);
        assert_eq!(outcome.state.status, SessionStatus::Paused);
        assert_eq!(outcome.state.remaining_ms, 1_000);
        assert!(outcome.state.started_at.is_none());
    }

    #[test]
    fn reload_resume_after_expiry_keeps_old_anchor() {
        let store = MemoryStore::new();
        let def = definition(SessionType::Focus);
        let saved = running_state(&def, 4_000, 0);
        store.set("key", &encode_state(&saved).unwrap()).unwrap();
        let outcome = adapter(&store).load(&def, ReloadPolicy::Resume, 10_000);
        assert_eq!(outcome.state, saved);
        assert_eq!(outcome.state.remaining_at(10_000), 0);
    }

    #[test]
    fn saves_are_debounced() {
        let store = MemoryStore::new();
        let def = definition(SessionType::Focus);
        let mut adapter = adapter(&store);
        let mut state = RuntimeState::fresh(&def);

        adapter.save(&state, 1_000);
        state.completed_count = 1;
        adapter.save(&state, 1_100);
        assert!(!adapter.flush_due(1_149));
        assert!(store.get("key").unwrap().is_none());

        assert!(adapter.flush_due(1_150));
        let stored = decode_state(&store.get("key").unwrap().unwrap(), &def).unwrap();
        assert_eq!(stored.completed_count, 1);
        assert!(!adapter.has_pending());
    }

    #[test]
    fn drop_flushes_pending_state() {
        let store = MemoryStore::new();
        let def = definition(SessionType::Focus);
        {
            let mut adapter = adapter(&store);
            adapter.save(&RuntimeState::fresh(&def), 0);
        }
        assert!(store.get("key").unwrap().is_some());
    }

    #[test]
    fn write_failure_degrades_to_memory_only() {
        let store = MemoryStore::with_quota(16);
        let def = definition(SessionType::Focus);
        let mut adapter = adapter(&store);
        adapter.save(&RuntimeState::fresh(&def), 0);
        assert!(!adapter.flush());
        assert!(adapter.is_memory_only());
        adapter.save(&RuntimeState::fresh(&def), 1);
        assert!(!adapter.has_pending());
    }

    #[test]
    fn clear_removes_stored_state() {
        let store = MemoryStore::new();
        let def = definition(SessionType::Focus);
        let mut adapter = adapter(&store);
        adapter.save(&RuntimeState::fresh(&def), 0);
        adapter.flush();
        adapter.clear();
        assert!(store.get("key").unwrap().is_none());
    }

    #[test]
    fn clear_in_memory_only_mode_still_removes_stale_state() {
        let def = definition(SessionType::Focus);
        let stale = encode_state(&running_state(&def, 4_000, 0)).unwrap();
        let store = MemoryStore::with_quota("key".len() + stale.len());
        store.set("key", &stale).unwrap();

        let mut adapter = adapter(&store);
        let mut bigger = RuntimeState::fresh(&def);
        bigger.completed_count = 1_000_000;
        adapter.save(&bigger, 0);
        assert!(!adapter.flush());
        assert!(adapter.is_memory_only());

        adapter.clear();
        assert!(store.get("key").unwrap().is_none());
        let outcome = adapter.load(&def, ReloadPolicy::Resume, 10_000);
        assert_eq!(outcome.source, LoadSource::Fresh);
        assert_eq!(outcome.state.status, SessionStatus::Idle);
    }
}
