mod controller;
mod schedule;
mod state;
mod tick;
mod transition;

pub use controller::{ControllerOptions, SessionController};
pub use schedule::{
    storage_key, Branching, Phase, PhaseKind, ReloadPolicy, SessionDefinition, SessionType,
};
pub use state::{RuntimeState, SessionStatus, Snapshot};
pub use tick::{TickDriver, TickOutcome};
pub use transition::{BranchPolicy, NextPhaseFn, Transition, TransitionEngine};
