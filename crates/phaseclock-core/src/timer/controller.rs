//! Session controller: the public surface of the engine.
//!
//! Hosts drive a session only through these commands and read it only
//! through [`SessionController::state`] and [`SessionController::snapshot`].
//!
//! ## State Transitions
//!
//! ```text
//! Idle -> Running <-> Paused
//!           |
//!           v
//!       Completed        (reset returns any state to Idle)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let mut session = SessionController::open(definition, store, ControllerOptions::default());
//! session.start()?;
//! // In a loop:
//! let events = session.tick();
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;

use super::schedule::{PhaseKind, ReloadPolicy, SessionDefinition};
use super::state::{RuntimeState, SessionStatus, Snapshot};
use super::tick::TickDriver;
use super::transition::{BranchPolicy, Transition, TransitionEngine};
use crate::clock::{Clock, SystemClock};
use crate::error::ControlError;
use crate::events::{at, Event};
use crate::storage::{
    Config, KeyValueStore, LoadSource, PersistenceAdapter, DEFAULT_DEBOUNCE_MS,
};
use crate::sync::{CrossTabSync, RemoteUpdate};
use crate::tone::{create_emitter, NullToneEmitter, ToneEmitter};

const DEFAULT_TICK_INTERVAL_MS: u64 = 100;

/// Collaborators and tuning for a [`SessionController`].
#[derive(Clone)]
pub struct ControllerOptions {
    pub clock: Arc<dyn Clock>,
    pub tones: Arc<dyn ToneEmitter>,
    /// Overrides the branching carried by the definition.
    pub policy: Option<BranchPolicy>,
    /// Overrides the session type's reload policy.
    pub reload_policy: Option<ReloadPolicy>,
    pub debounce_ms: u64,
    pub tick_interval_ms: u64,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            tones: Arc::new(NullToneEmitter),
            policy: None,
            reload_policy: None,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
        }
    }
}

impl ControllerOptions {
    /// Options for running `definition` under `config`.
    pub fn from_config(config: &Config, definition: &SessionDefinition) -> Self {
        Self {
            tones: create_emitter(
                config.tone_backend(),
                config.tone_table(),
                config.tones.volume,
            ),
            reload_policy: Some(config.reload_policy(definition.session_type())),
            debounce_ms: config.engine.debounce_ms,
            tick_interval_ms: config.engine.tick_interval_ms.max(1),
            ..Self::default()
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_tones(mut self, tones: Arc<dyn ToneEmitter>) -> Self {
        self.tones = tones;
        self
    }

    pub fn with_policy(mut self, policy: BranchPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_reload_policy(mut self, policy: ReloadPolicy) -> Self {
        self.reload_policy = Some(policy);
        self
    }
}

pub struct SessionController {
    definition: Arc<SessionDefinition>,
    state: RuntimeState,
    driver: TickDriver,
    persistence: PersistenceAdapter,
    sync: CrossTabSync,
    tones: Arc<dyn ToneEmitter>,
    clock: Arc<dyn Clock>,
    tick_interval: Duration,
    load_source: LoadSource,
}

impl SessionController {
    /// Open `definition` on `store`, restoring and reconciling any saved state.
    pub fn open(
        definition: SessionDefinition,
        store: Arc<dyn KeyValueStore>,
        options: ControllerOptions,
    ) -> Self {
        let definition = Arc::new(definition);
        let reload_policy = options
            .reload_policy
            .unwrap_or_else(|| definition.session_type().default_reload_policy());
        let engine = match options.policy {
            Some(policy) => TransitionEngine::new(policy),
            None => TransitionEngine::for_definition(&definition),
        };

        // Subscribe before reading so no write between the two is missed.
        let sync = CrossTabSync::subscribe(store.as_ref(), Arc::clone(&definition));
        let persistence =
            PersistenceAdapter::new(store, definition.storage_key(), options.debounce_ms);
        let outcome = persistence.load(&definition, reload_policy, options.clock.now_ms());

        tracing::info!(
            session = %definition.session_id(),
            source = ?outcome.source,
            status = %outcome.state.status,
            index = outcome.state.current_index,
            "opened session"
        );

        Self {
            definition,
            state: outcome.state,
            driver: TickDriver::new(engine),
            persistence,
            sync,
            tones: options.tones,
            clock: options.clock,
            tick_interval: Duration::from_millis(options.tick_interval_ms.max(1)),
            load_source: outcome.source,
        }
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn definition(&self) -> &SessionDefinition {
        &self.definition
    }

    pub fn state(&self) -> &RuntimeState {
        &self.state
    }

    pub fn status(&self) -> SessionStatus {
        self.state.status
    }

    /// Where the state came from when the session was opened.
    pub fn load_source(&self) -> LoadSource {
        self.load_source
    }

    /// Whether persistence gave up after a failed write.
    pub fn is_memory_only(&self) -> bool {
        self.persistence.is_memory_only()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.state.snapshot(&self.definition, self.clock.now_ms())
    }

    // ── Commands ─────────────────────────────────────────────────────

    /// Start an idle session at its current phase.
    pub fn start(&mut self) -> Result<Vec<Event>, ControlError> {
        let (now, mut events) = self.prepare();
        self.require(&[SessionStatus::Idle], "start")?;

        let duration = self.state.phase_duration(&self.definition);
        self.state.status = SessionStatus::Running;
        self.state.started_at = Some(now);
        self.state.remaining_ms = duration;
        tracing::info!(
            session = %self.state.session_id,
            index = self.state.current_index,
            "session started"
        );

        let phase = self.definition.phase(self.state.current_index);
        events.push(Event::SessionStarted {
            session_id: self.state.session_id.clone(),
            phase_index: self.state.current_index,
            phase_kind: phase.map(|p| p.kind.clone()).unwrap_or(PhaseKind::Work),
            duration_ms: duration,
            at: at(now),
        });
        events.extend(self.catch_up(now));
        self.commit(now);
        Ok(events)
    }

    /// Freeze the remaining time. Pausing a paused session changes nothing.
    pub fn pause(&mut self) -> Result<Vec<Event>, ControlError> {
        let (now, mut events) = self.prepare();
        if self.state.status == SessionStatus::Paused {
            return Ok(events);
        }
        self.require(&[SessionStatus::Running], "pause")?;

        let remaining_ms = self.state.remaining_at(now);
        self.state.remaining_ms = remaining_ms;
        self.state.started_at = None;
        self.state.status = SessionStatus::Paused;

        events.push(Event::SessionPaused {
            remaining_ms,
            at: at(now),
        });
        self.commit(now);
        Ok(events)
    }

    /// Continue a paused session from its frozen remaining time.
    pub fn resume(&mut self) -> Result<Vec<Event>, ControlError> {
        let (now, mut events) = self.prepare();
        self.require(&[SessionStatus::Paused], "resume")?;

        self.state.status = SessionStatus::Running;
        self.state.started_at = Some(now);

        events.push(Event::SessionResumed {
            remaining_ms: self.state.remaining_ms,
            at: at(now),
        });
        events.extend(self.catch_up(now));
        self.commit(now);
        Ok(events)
    }

    /// End the current phase now, whatever time is left.
    pub fn skip(&mut self) -> Result<Vec<Event>, ControlError> {
        let (now, mut events) = self.prepare();
        self.require(
            &[SessionStatus::Idle, SessionStatus::Running, SessionStatus::Paused],
            "skip",
        )?;

        let mut forced = self.state.clone();
        forced.remaining_ms = 0;
        if forced.is_running() {
            forced.started_at = Some(now);
        }
        let (next, transition) = self.driver.engine().step(&forced, &self.definition, now);
        self.state = next;

        if let Some(transition) = transition {
            self.tones.play(&transition.cue(&self.definition));
            events.push(if transition.completed {
                self.completion_event(&transition)
            } else {
                Event::PhaseSkipped {
                    from_index: transition.from_index,
                    to_index: transition.to_index,
                    at: at(now),
                }
            });
        }
        self.commit(now);
        Ok(events)
    }

    /// Back to idle at the first phase; the stored state is removed.
    pub fn reset(&mut self) -> Vec<Event> {
        let now = self.clock.now_ms();
        // Drain stale notifications so they cannot undo the reset.
        let _ = self.sync.poll();
        self.state = RuntimeState::fresh(&self.definition);
        self.persistence.clear();
        tracing::info!(session = %self.state.session_id, "session reset");
        vec![Event::SessionReset { at: at(now) }]
    }

    /// Shift the current phase's remaining time (and its effective duration)
    /// by `delta_ms`, keeping the status.
    ///
    /// A running phase is re-anchored at now with the adjusted remaining
    /// time, so the next tick counts down from the new value.
    pub fn adjust(&mut self, delta_ms: i64) -> Result<Vec<Event>, ControlError> {
        let (now, mut events) = self.prepare();
        self.require(
            &[SessionStatus::Idle, SessionStatus::Running, SessionStatus::Paused],
            "adjust",
        )?;

        let nominal = self.definition.duration_at(self.state.current_index);
        let duration = offset(self.state.phase_duration(&self.definition), delta_ms);
        let remaining = offset(self.state.remaining_at(now), delta_ms).min(duration);

        self.state.phase_duration_ms = (duration != nominal).then_some(duration);
        self.state.remaining_ms = remaining;
        if self.state.is_running() {
            self.state.started_at = Some(now);
        }

        events.push(Event::TimeAdjusted {
            delta_ms,
            remaining_ms: remaining,
            phase_duration_ms: duration,
            at: at(now),
        });
        events.extend(self.catch_up(now));
        self.commit(now);
        Ok(events)
    }

    /// Recompute from the wall clock, crossing any elapsed boundaries.
    ///
    /// Call once per redraw; calling late or rarely is harmless.
    pub fn tick(&mut self) -> Vec<Event> {
        let (now, events) = self.prepare();
        self.persistence.flush_due(now);
        events
    }

    /// Write any pending state immediately.
    pub fn flush(&mut self) {
        self.persistence.flush();
    }

    /// Drive the session until it completes.
    pub async fn run<F>(&mut self, on_update: F)
    where
        F: FnMut(&[Event], &Snapshot),
    {
        self.run_until(std::future::pending::<()>(), on_update).await
    }

    /// Drive the session until it completes or `shutdown` resolves.
    ///
    /// Ticks every `tick_interval_ms`, skipping missed ticks rather than
    /// bursting, and applies remote writes as soon as they are delivered.
    /// `on_update` sees each iteration's events and a fresh snapshot.
    pub async fn run_until<S, F>(&mut self, shutdown: S, mut on_update: F)
    where
        S: Future<Output = ()>,
        F: FnMut(&[Event], &Snapshot),
    {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        loop {
            let remote = tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => None,
                update = self.sync.recv() => Some(update),
            };

            let mut events = Vec::new();
            if let Some(update) = remote {
                events.extend(self.apply_remote(update));
            }
            events.extend(self.tick());
            on_update(&events, &self.snapshot());

            if self.state.status == SessionStatus::Completed {
                break;
            }
        }
        self.flush();
    }

    // ── Internal ─────────────────────────────────────────────────────

    /// Apply remote writes and catch up with the wall clock.
    fn prepare(&mut self) -> (u64, Vec<Event>) {
        let mut events = Vec::new();
        if let Some(update) = self.sync.poll() {
            events.extend(self.apply_remote(update));
        }
        let now = self.clock.now_ms();
        events.extend(self.catch_up(now));
        (now, events)
    }

    fn require(
        &self,
        allowed: &[SessionStatus],
        action: &'static str,
    ) -> Result<(), ControlError> {
        if allowed.contains(&self.state.status) {
            Ok(())
        } else {
            Err(ControlError::InvalidTransition {
                action,
                status: self.state.status,
            })
        }
    }

    fn apply_remote(&mut self, update: RemoteUpdate) -> Option<Event> {
        let incoming = match update {
            RemoteUpdate::State(state) => state,
            RemoteUpdate::Cleared => RuntimeState::fresh(&self.definition),
        };
        if incoming == self.state {
            return None;
        }
        // The remote write is newer than anything still queued here.
        self.persistence.discard_pending();
        self.state = incoming;
        tracing::debug!(
            session = %self.state.session_id,
            status = %self.state.status,
            index = self.state.current_index,
            "applied remote state"
        );
        Some(Event::RemoteStateApplied {
            status: self.state.status,
            phase_index: self.state.current_index,
            at: at(self.clock.now_ms()),
        })
    }

    fn catch_up(&mut self, now: u64) -> Vec<Event> {
        let outcome = self.driver.tick(&mut self.state, &self.definition, now);
        let transitions = outcome.transitions();
        if transitions.is_empty() {
            return Vec::new();
        }

        let mut events = Vec::with_capacity(transitions.len());
        for transition in transitions {
            self.tones.play(&transition.cue(&self.definition));
            events.push(if transition.completed {
                tracing::info!(session = %self.state.session_id, "session completed");
                self.completion_event(transition)
            } else {
                let phase = self.definition.phase(transition.to_index);
                Event::PhaseAdvanced {
                    from_index: transition.from_index,
                    to_index: transition.to_index,
                    phase_kind: phase.map(|p| p.kind.clone()).unwrap_or(PhaseKind::Work),
                    duration_ms: self.definition.duration_at(transition.to_index),
                    at: at(transition.at),
                }
            });
        }
        self.persistence.save(&self.state, now);
        events
    }

    fn completion_event(&self, transition: &Transition) -> Event {
        Event::SessionCompleted {
            session_id: self.state.session_id.clone(),
            completed_count: self.state.completed_count,
            at: at(transition.at),
        }
    }

    fn commit(&mut self, now: u64) {
        self.persistence.save(&self.state, now);
        self.persistence.flush_due(now);
    }
}

fn offset(value: u64, delta_ms: i64) -> u64 {
    if delta_ms >= 0 {
        value.saturating_add(delta_ms as u64)
    } else {
        value.saturating_sub(delta_ms.unsigned_abs())
    }
}
