//! Runtime progress of one session.
//!
//! While `Running`, `remaining_ms` is the time left *at* `started_at`; the
//! live value is recomputed from the wall clock on demand. Pausing, resuming,
//! ticking and reload reconciliation all reduce to that one computation.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::schedule::{PhaseKind, SessionDefinition};
use crate::error::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Idle,
    Running,
    Paused,
    Completed,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Running => "running",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeState {
    pub session_id: String,
    pub current_index: usize,
    pub remaining_ms: u64,
    pub status: SessionStatus,
    /// Epoch ms; set iff `status == Running`.
    pub started_at: Option<u64>,
    pub completed_count: u32,
    /// Position in an alternating cycle, independent of the phase index.
    #[serde(default)]
    pub slot: u32,
    /// Effective duration of the current phase after `adjust`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_duration_ms: Option<u64>,
}

impl RuntimeState {
    /// Idle at the first phase with its full duration.
    pub fn fresh(definition: &SessionDefinition) -> Self {
        Self {
            session_id: definition.session_id().to_string(),
            current_index: 0,
            remaining_ms: definition.duration_at(0),
            status: SessionStatus::Idle,
            started_at: None,
            completed_count: 0,
            slot: 0,
            phase_duration_ms: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == SessionStatus::Running
    }

    /// Effective duration of the current phase.
    pub fn phase_duration(&self, definition: &SessionDefinition) -> u64 {
        self.phase_duration_ms
            .unwrap_or_else(|| definition.duration_at(self.current_index))
    }

    /// Remaining time as of `now`, never negative.
    pub fn remaining_at(&self, now: u64) -> u64 {
        match (self.status, self.started_at) {
            (SessionStatus::Running, Some(started)) => self
                .remaining_ms
                .saturating_sub(now.saturating_sub(started)),
            _ => self.remaining_ms,
        }
    }

    /// Instant at which the current phase runs out, if running.
    pub fn boundary_at(&self) -> Option<u64> {
        match (self.status, self.started_at) {
            (SessionStatus::Running, Some(started)) => {
                Some(started.saturating_add(self.remaining_ms))
            }
            _ => None,
        }
    }

    /// Check this state is consistent with `definition`.
    ///
    /// Used to reject foreign or corrupt payloads read from storage.
    pub fn check(&self, definition: &SessionDefinition) -> Result<(), ValidationError> {
        if self.session_id != definition.session_id() {
            return Err(ValidationError::SessionMismatch {
                expected: definition.session_id().to_string(),
                found: self.session_id.clone(),
            });
        }
        if self.current_index >= definition.len() {
            return Err(ValidationError::OutOfBounds {
                collection: "phases".into(),
                index: self.current_index,
                len: definition.len(),
            });
        }
        let duration = self.phase_duration(definition);
        if self.remaining_ms > duration {
            return Err(ValidationError::InvalidValue {
                field: "remainingMs".into(),
                message: format!("{} exceeds phase duration {duration}", self.remaining_ms),
            });
        }
        if self.is_running() != self.started_at.is_some() {
            return Err(ValidationError::InvalidValue {
                field: "startedAt".into(),
                message: format!("must be set iff running (status {})", self.status),
            });
        }
        if self.status == SessionStatus::Completed
            && (self.current_index != definition.last_index() || self.remaining_ms != 0)
        {
            return Err(ValidationError::InvalidValue {
                field: "status".into(),
                message: "completed state must sit at the last phase with nothing left".into(),
            });
        }
        Ok(())
    }

    /// Pull out-of-range fields back into the definition's bounds.
    pub(crate) fn clamped(&self, definition: &SessionDefinition) -> Self {
        let mut state = self.clone();
        if state.current_index > definition.last_index() {
            state.current_index = definition.last_index();
            state.phase_duration_ms = None;
        }
        if state.status == SessionStatus::Completed {
            state.current_index = definition.last_index();
            state.remaining_ms = 0;
            state.started_at = None;
        }
        state.remaining_ms = state.remaining_ms.min(state.phase_duration(definition));
        state
    }

    /// Read-only view for display at `now`.
    pub fn snapshot(&self, definition: &SessionDefinition, now: u64) -> Snapshot {
        let phase = definition.phase(self.current_index);
        let phase_duration_ms = self.phase_duration(definition);
        let remaining_ms = self.remaining_at(now);
        let phase_progress = if phase_duration_ms == 0 {
            if self.status == SessionStatus::Completed {
                1.0
            } else {
                0.0
            }
        } else {
            1.0 - (remaining_ms as f64 / phase_duration_ms as f64)
        };
        let session_progress_pct = if self.status == SessionStatus::Completed {
            100.0
        } else {
            let total = definition.total_duration_ms() as f64;
            if total == 0.0 {
                0.0
            } else {
                let done = definition.cumulative_ms(self.current_index) as f64
                    + definition.duration_at(self.current_index) as f64 * phase_progress;
                (done / total * 100.0).min(100.0)
            }
        };
        Snapshot {
            session_id: self.session_id.clone(),
            status: self.status,
            current_index: self.current_index,
            phase_count: definition.len(),
            phase_id: phase.map(|p| p.id.clone()).unwrap_or_default(),
            phase_kind: phase.map(|p| p.kind.clone()),
            phase_label: phase.map(|p| p.label().to_string()).unwrap_or_default(),
            display_text: phase.map(|p| p.display_text.clone()).unwrap_or_default(),
            remaining_ms,
            phase_duration_ms,
            phase_progress,
            session_progress_pct,
            completed_count: self.completed_count,
            at: DateTime::from_timestamp_millis(now as i64).unwrap_or_else(Utc::now),
        }
    }
}

/// Display-ready view of a session. Never written back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub session_id: String,
    pub status: SessionStatus,
    pub current_index: usize,
    pub phase_count: usize,
    pub phase_id: String,
    pub phase_kind: Option<PhaseKind>,
    pub phase_label: String,
    pub display_text: String,
    pub remaining_ms: u64,
    pub phase_duration_ms: u64,
    /// 0.0 .. 1.0 within the current phase.
    pub phase_progress: f64,
    /// 0.0 .. 100.0 across the session.
    pub session_progress_pct: f64,
    pub completed_count: u32,
    pub at: DateTime<Utc>,
}
