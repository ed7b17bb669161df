//! Tick driver.
//!
//! Each tick recomputes the remaining time from the absolute anchor instead
//! of subtracting a per-tick delta, so a stalled or throttled loop shows the
//! right value on its next tick. When one or more boundaries have passed
//! since the last tick, all of them are crossed at once, each new phase
//! anchored at the exact boundary instant so overrun carries forward.

use super::schedule::SessionDefinition;
use super::state::RuntimeState;
use super::transition::{Transition, TransitionEngine};

/// Upper bound on boundaries crossed in one tick; guards zero-length loops
/// a custom branch policy could produce.
const MAX_CATCH_UP: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Not running; nothing to do.
    Inactive,
    /// Still inside the current phase.
    Counting { remaining_ms: u64 },
    /// One or more boundaries were crossed.
    Advanced {
        transitions: Vec<Transition>,
        remaining_ms: u64,
    },
}

impl TickOutcome {
    pub fn transitions(&self) -> &[Transition] {
        match self {
            TickOutcome::Advanced { transitions, .. } => transitions,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TickDriver {
    engine: TransitionEngine,
}

impl TickDriver {
    pub fn new(engine: TransitionEngine) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &TransitionEngine {
        &self.engine
    }

    /// Bring `state` up to `now`.
    ///
    /// Only a crossed boundary mutates `state`; otherwise the live remaining
    /// time is reported for display and the anchor is left alone.
    pub fn tick(
        &self,
        state: &mut RuntimeState,
        definition: &SessionDefinition,
        now: u64,
    ) -> TickOutcome {
        if !state.is_running() {
            return TickOutcome::Inactive;
        }

        let mut transitions = Vec::new();
        while let Some(boundary) = state.boundary_at() {
            if now < boundary || transitions.len() >= MAX_CATCH_UP {
                break;
            }
            let (next, transition) = self.engine.step(state, definition, boundary);
            *state = next;
            match transition {
                Some(t) => transitions.push(t),
                None => break,
            }
        }

        let remaining_ms = state.remaining_at(now);
        if transitions.is_empty() {
            TickOutcome::Counting { remaining_ms }
        } else {
            tracing::debug!(
                session = %state.session_id,
                crossed = transitions.len(),
                index = state.current_index,
                status = %state.status,
                "tick crossed phase boundaries"
            );
            TickOutcome::Advanced {
                transitions,
                remaining_ms,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::schedule::{Phase, PhaseKind, SessionType};
    use crate::timer::state::SessionStatus;

    fn definition() -> SessionDefinition {
        SessionDefinition::new(
            "tick",
            SessionType::Focus,
            vec![
                Phase::new("a", PhaseKind::Work, 5_000),
                Phase::new("b", PhaseKind::Break, 3_000),
                Phase::new("c", PhaseKind::Work, 1_000),
            ],
        )
        .unwrap()
    }

    fn started(def: &SessionDefinition) -> RuntimeState {
        let mut state = RuntimeState::fresh(def);
        state.status = SessionStatus::Running;
        state.started_at = Some(0);
        state
    }

    #[test]
    fn idle_is_inactive() {
        let def = definition();
        let mut state = RuntimeState::fresh(&def);
        assert_eq!(TickDriver::default().tick(&mut state, &def, 10), TickOutcome::Inactive);
    }

    #[test]
    fn counting_does_not_touch_anchor() {
        let def = definition();
        let mut state = started(&def);
        let before = state.clone();
        let outcome = TickDriver::default().tick(&mut state, &def, 1_234);
        assert_eq!(outcome, TickOutcome::Counting { remaining_ms: 3_766 });
        assert_eq!(state, before);
    }

    #[test]
    fn skipped_ticks_do_not_drift() {
        let def = definition();
        let mut state = started(&def);
        let outcome = TickDriver::default().tick(&mut state, &def, 5_001);
        assert_eq!(state.current_index, 1);
        assert_eq!(state.started_at, Some(5_000));
        assert_eq!(
            outcome,
            TickOutcome::Advanced {
                transitions: vec![Transition {
                    from_index: 0,
                    to_index: 1,
                    completed: false,
                    at: 5_000,
                }],
                remaining_ms: 2_999,
            }
        );
    }

    #[test]
    fn long_stall_catches_up_through_every_boundary() {
        let def = definition();
        let mut state = started(&def);
        let outcome = TickDriver::default().tick(&mut state, &def, 60_000);
        assert_eq!(outcome.transitions().len(), 3);
        assert!(outcome.transitions()[2].completed);
        assert_eq!(state.status, SessionStatus::Completed);
        assert_eq!(state.completed_count, 3);
    }

    #[test]
    fn exact_boundary_advances() {
        let def = definition();
        let mut state = started(&def);
        TickDriver::default().tick(&mut state, &def, 5_000);
        assert_eq!(state.current_index, 1);
        assert_eq!(state.remaining_at(5_000), 3_000);
    }

    #[test]
    fn zero_length_phases_are_crossed_in_one_tick() {
        let def = SessionDefinition::new(
            "zeros",
            SessionType::Custom,
            vec![
                Phase::new("a", PhaseKind::Work, 0),
                Phase::new("b", PhaseKind::Work, 0),
                Phase::new("c", PhaseKind::Work, 10),
            ],
        )
        .unwrap();
        let mut state = started(&def);
        let outcome = TickDriver::default().tick(&mut state, &def, 0);
        assert_eq!(outcome.transitions().len(), 2);
        assert_eq!(state.current_index, 2);
    }
}
