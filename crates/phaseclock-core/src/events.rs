use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::timer::{PhaseKind, SessionStatus, Snapshot};

/// Every state change in a session produces an Event.
/// Hosts render from snapshots; events drive notifications and logs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    SessionStarted {
        session_id: String,
        phase_index: usize,
        phase_kind: PhaseKind,
        duration_ms: u64,
        at: DateTime<Utc>,
    },
    SessionPaused {
        remaining_ms: u64,
        at: DateTime<Utc>,
    },
    SessionResumed {
        remaining_ms: u64,
        at: DateTime<Utc>,
    },
    /// A phase ran out and the next one began.
    PhaseAdvanced {
        from_index: usize,
        to_index: usize,
        phase_kind: PhaseKind,
        duration_ms: u64,
        at: DateTime<Utc>,
    },
    PhaseSkipped {
        from_index: usize,
        to_index: usize,
        at: DateTime<Utc>,
    },
    SessionCompleted {
        session_id: String,
        completed_count: u32,
        at: DateTime<Utc>,
    },
    SessionReset {
        at: DateTime<Utc>,
    },
    TimeAdjusted {
        delta_ms: i64,
        remaining_ms: u64,
        phase_duration_ms: u64,
        at: DateTime<Utc>,
    },
    /// Another context's write replaced the local state.
    RemoteStateApplied {
        status: SessionStatus,
        phase_index: usize,
        at: DateTime<Utc>,
    },
    StateSnapshot(Snapshot),
}

/// Epoch milliseconds as a UTC timestamp.
pub(crate) fn at(ms: u64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms as i64).unwrap_or_else(Utc::now)
}
