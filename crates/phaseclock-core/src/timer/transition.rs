//! Phase transitions.
//!
//! [`TransitionEngine::step`] is pure and total: given a state and its
//! definition it returns the state after the current phase ends, or the state
//! unchanged when there is nothing to advance.

use std::fmt;
use std::sync::Arc;

use super::schedule::{Branching, SessionDefinition};
use super::state::{RuntimeState, SessionStatus};
use crate::tone::Cue;

/// Chooses the next phase index from the current state.
///
/// Returning `None` (or an out-of-range index) completes the session.
pub type NextPhaseFn = dyn Fn(&RuntimeState, &SessionDefinition) -> Option<usize> + Send + Sync;

#[derive(Clone, Default)]
pub enum BranchPolicy {
    /// Next index, then completion after the last phase.
    #[default]
    Linear,
    /// Cycle through the speaking/transition block `slots_per_party` times,
    /// then continue with the phase after the block.
    Alternating { slots_per_party: u32 },
    Custom(Arc<NextPhaseFn>),
}

impl fmt::Debug for BranchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BranchPolicy::Linear => f.write_str("Linear"),
            BranchPolicy::Alternating { slots_per_party } => f
                .debug_struct("Alternating")
                .field("slots_per_party", slots_per_party)
                .finish(),
            BranchPolicy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl From<Branching> for BranchPolicy {
    fn from(branching: Branching) -> Self {
        match branching {
            Branching::Linear => BranchPolicy::Linear,
            Branching::Alternating { slots_per_party } => {
                BranchPolicy::Alternating { slots_per_party }
            }
        }
    }
}

impl BranchPolicy {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&RuntimeState, &SessionDefinition) -> Option<usize> + Send + Sync + 'static,
    {
        BranchPolicy::Custom(Arc::new(f))
    }

    /// Next `(index, slot)`, or `None` when the session is over.
    fn next(&self, state: &RuntimeState, definition: &SessionDefinition) -> Option<(usize, u32)> {
        let index = state.current_index;
        let linear = || {
            let next = index + 1;
            (next < definition.len()).then_some((next, state.slot))
        };
        match self {
            BranchPolicy::Linear => linear(),
            BranchPolicy::Alternating { slots_per_party } => {
                let Some(block) = definition.cycle_block() else {
                    return linear();
                };
                if index + 1 == block.start {
                    return Some((block.start, 0));
                }
                if !block.contains(&index) {
                    return linear();
                }
                let slot = state.slot + 1;
                let total = block.len() as u32 * (*slots_per_party).max(1);
                if slot < total {
                    Some((block.start + slot as usize % block.len(), slot))
                } else {
                    (block.end < definition.len()).then_some((block.end, slot))
                }
            }
            BranchPolicy::Custom(choose) => choose(state, definition)
                .filter(|next| *next < definition.len())
                .map(|next| (next, state.slot + 1)),
        }
    }
}

/// One crossed phase boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from_index: usize,
    /// Index of the phase that began; the last index on completion.
    pub to_index: usize,
    pub completed: bool,
    /// Epoch ms at which the new phase is anchored.
    pub at: u64,
}

impl Transition {
    /// High tone on completion, otherwise the new phase's own cue or the low tone.
    pub fn cue(&self, definition: &SessionDefinition) -> Cue {
        if self.completed {
            return Cue::High;
        }
        definition
            .phase(self.to_index)
            .and_then(|p| p.sound_cue_id.as_deref())
            .map(Cue::named)
            .unwrap_or(Cue::Low)
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransitionEngine {
    policy: BranchPolicy,
}

impl TransitionEngine {
    pub fn new(policy: BranchPolicy) -> Self {
        Self { policy }
    }

    /// Engine using the branching carried by `definition`.
    pub fn for_definition(definition: &SessionDefinition) -> Self {
        Self::new(definition.branching().into())
    }

    pub fn policy(&self) -> &BranchPolicy {
        &self.policy
    }

    /// State after the current phase ends at `at`.
    pub fn advance(
        &self,
        state: &RuntimeState,
        definition: &SessionDefinition,
        at: u64,
    ) -> RuntimeState {
        self.step(state, definition, at).0
    }

    /// Like [`advance`](Self::advance), also describing the boundary crossed.
    ///
    /// A running state stays running, anchored at `at`. Paused and idle
    /// states move to the next phase without starting it. Completed or
    /// out-of-range states come back clamped with no transition.
    pub fn step(
        &self,
        state: &RuntimeState,
        definition: &SessionDefinition,
        at: u64,
    ) -> (RuntimeState, Option<Transition>) {
        if state.status == SessionStatus::Completed
            || definition.is_empty()
            || state.current_index >= definition.len()
        {
            return (state.clamped(definition), None);
        }

        let from_index = state.current_index;
        let mut next = state.clone();
        next.completed_count = state.completed_count.saturating_add(1);
        next.phase_duration_ms = None;

        match self.policy.next(state, definition) {
            Some((index, slot)) => {
                next.current_index = index;
                next.slot = slot;
                next.remaining_ms = definition.duration_at(index);
                next.started_at = state.is_running().then_some(at);
                let transition = Transition {
                    from_index,
                    to_index: index,
                    completed: false,
                    at,
                };
                (next, Some(transition))
            }
            None => {
                next.current_index = definition.last_index();
                next.remaining_ms = 0;
                next.started_at = None;
                next.status = SessionStatus::Completed;
                let transition = Transition {
                    from_index,
                    to_index: next.current_index,
                    completed: true,
                    at,
                };
                (next, Some(transition))
            }
        }
    }
}
