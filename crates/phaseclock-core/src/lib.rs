//! # Phaseclock Core Library
//!
//! A phase-sequenced session timer. A session walks an ordered list of
//! timed phases (work and break blocks, speaking slots in a moderated
//! dialogue, any custom sequence), survives reloads, and stays in step
//! across every context that opens the same session.
//!
//! ## Architecture
//!
//! - **Timer**: wall-clock state machine. Hosts call `tick()` as often as
//!   they redraw; remaining time is always recomputed from the clock, so
//!   late or missed ticks never drift.
//! - **Storage**: key-value stores (in-memory and SQLite) with change
//!   notifications, debounced state persistence, and TOML configuration.
//! - **Sync**: applies state written by other contexts, last write wins.
//! - **Tone**: short audio cues at phase boundaries.
//!
//! ## Key Components
//!
//! - [`SessionController`]: commands, tick and snapshots for one session
//! - [`SessionDefinition`]: validated, immutable phase list
//! - [`TransitionEngine`]: pure next-phase computation
//! - [`KeyValueStore`]: storage seam shared by persistence and sync
//! - [`Config`]: application configuration management

pub mod clock;
pub mod error;
pub mod events;
pub mod storage;
pub mod sync;
pub mod timer;
pub mod tone;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ConfigError, ControlError, CoreError, StoreError, ValidationError};
pub use events::Event;
pub use storage::{Config, KeyValueStore, MemoryStore, PersistenceAdapter, SqliteStore};
pub use sync::{CrossTabSync, RemoteUpdate};
pub use timer::{
    BranchPolicy, Branching, ControllerOptions, Phase, PhaseKind, ReloadPolicy, RuntimeState,
    SessionController, SessionDefinition, SessionStatus, SessionType, Snapshot, TickDriver,
    TransitionEngine,
};
pub use tone::{create_emitter, Cue, ToneBackend, ToneEmitter, ToneSpec, ToneTable};
