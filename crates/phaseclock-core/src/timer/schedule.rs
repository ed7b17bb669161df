//! Session definitions: the immutable, ordered phases a session runs through.

use std::collections::HashSet;
use std::ops::Range;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, CoreError, ValidationError};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    Work,
    Break,
    Speaking,
    Transition,
    Closing,
    Cooldown,
    Custom(String),
}

impl PhaseKind {
    /// Whether this kind belongs to an alternating dialogue cycle.
    pub fn is_cycle_slot(&self) -> bool {
        matches!(self, PhaseKind::Speaking | PhaseKind::Transition)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    pub id: String,
    pub kind: PhaseKind,
    pub duration_ms: u64,
    #[serde(default)]
    pub display_text: String,
    /// Cue played when this phase begins. Falls back to the low tone.
    #[serde(default)]
    pub sound_cue_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl Phase {
    pub fn new(id: impl Into<String>, kind: PhaseKind, duration_ms: u64) -> Self {
        Self {
            id: id.into(),
            kind,
            duration_ms,
            display_text: String::new(),
            sound_cue_id: None,
            name: None,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.display_text = text.into();
        self
    }

    pub fn with_cue(mut self, cue_id: impl Into<String>) -> Self {
        self.sound_cue_id = Some(cue_id.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Human-facing label: name, then display text, then id.
    pub fn label(&self) -> &str {
        match &self.name {
            Some(name) if !name.is_empty() => name,
            _ if !self.display_text.is_empty() => &self.display_text,
            _ => &self.id,
        }
    }
}

/// The family of timer page a session belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    Focus,
    MultiTimer,
    Dialogue,
    #[default]
    Custom,
}

impl SessionType {
    pub const ALL: [SessionType; 4] = [
        SessionType::Focus,
        SessionType::MultiTimer,
        SessionType::Dialogue,
        SessionType::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionType::Focus => "focus",
            SessionType::MultiTimer => "multi_timer",
            SessionType::Dialogue => "dialogue",
            SessionType::Custom => "custom",
        }
    }

    /// What a reload does to a session that was running when it was saved.
    ///
    /// Dialogue sessions are moderated by a person who has to be present, so
    /// they come back paused; every other type keeps counting.
    pub fn default_reload_policy(&self) -> ReloadPolicy {
        match self {
            SessionType::Dialogue => ReloadPolicy::Pause,
            SessionType::Focus | SessionType::MultiTimer | SessionType::Custom => {
                ReloadPolicy::Resume
            }
        }
    }
}

/// Reconciliation applied on load to a state saved while running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReloadPolicy {
    /// Keep running from the wall-clock remaining time.
    Resume,
    /// Freeze at the wall-clock remaining time and wait for the user.
    Pause,
}

/// Serializable branching choice carried by a definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum Branching {
    #[default]
    Linear,
    /// Replay the speaking/transition block `slots_per_party` times.
    Alternating { slots_per_party: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "DefinitionDraft")]
pub struct SessionDefinition {
    session_id: String,
    session_type: SessionType,
    branching: Branching,
    phases: Vec<Phase>,
}

#[derive(Deserialize)]
struct DefinitionDraft {
    session_id: String,
    #[serde(default)]
    session_type: SessionType,
    #[serde(default)]
    branching: Branching,
    phases: Vec<Phase>,
}

impl TryFrom<DefinitionDraft> for SessionDefinition {
    type Error = ValidationError;

    fn try_from(draft: DefinitionDraft) -> Result<Self, Self::Error> {
        SessionDefinition::new(draft.session_id, draft.session_type, draft.phases)?
            .with_branching(draft.branching)
    }
}

impl SessionDefinition {
    /// Build a linear definition, validating ids and phase count.
    pub fn new(
        session_id: impl Into<String>,
        session_type: SessionType,
        phases: Vec<Phase>,
    ) -> Result<Self, ValidationError> {
        let definition = Self {
            session_id: session_id.into(),
            session_type,
            branching: Branching::Linear,
            phases,
        };
        definition.validate()?;
        Ok(definition)
    }

    pub fn with_branching(mut self, branching: Branching) -> Result<Self, ValidationError> {
        self.branching = branching;
        self.validate()?;
        Ok(self)
    }

    /// Load a definition from a `.json` or `.toml` file.
    pub fn from_path(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Ok(serde_json::from_str(&content)?)
        } else {
            toml::from_str(&content).map_err(|e| ConfigError::ParseFailed(e.to_string()).into())
        }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.session_id.trim().is_empty() {
            return Err(ValidationError::InvalidValue {
                field: "session_id".into(),
                message: "must not be empty".into(),
            });
        }
        if self.phases.is_empty() {
            return Err(ValidationError::EmptySession(self.session_id.clone()));
        }
        let mut seen = HashSet::new();
        for phase in &self.phases {
            if !seen.insert(phase.id.as_str()) {
                return Err(ValidationError::DuplicatePhaseId(phase.id.clone()));
            }
        }
        if let Branching::Alternating { slots_per_party } = self.branching {
            if slots_per_party == 0 {
                return Err(ValidationError::InvalidValue {
                    field: "branching.slots_per_party".into(),
                    message: "must be at least 1".into(),
                });
            }
            if self.cycle_block().is_none() {
                return Err(ValidationError::MissingAlternatingCycle);
            }
        }
        Ok(())
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn session_type(&self) -> SessionType {
        self.session_type
    }

    pub fn branching(&self) -> Branching {
        self.branching
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn phase(&self, index: usize) -> Option<&Phase> {
        self.phases.get(index)
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn last_index(&self) -> usize {
        self.phases.len().saturating_sub(1)
    }

    /// Nominal duration of the phase at `index`, 0 when out of range.
    pub fn duration_at(&self, index: usize) -> u64 {
        self.phases.get(index).map(|p| p.duration_ms).unwrap_or(0)
    }

    pub fn total_duration_ms(&self) -> u64 {
        self.phases
            .iter()
            .fold(0u64, |acc, p| acc.saturating_add(p.duration_ms))
    }

    /// Milliseconds of phases before (not including) `index`.
    pub fn cumulative_ms(&self, index: usize) -> u64 {
        self.phases
            .iter()
            .take(index)
            .fold(0u64, |acc, p| acc.saturating_add(p.duration_ms))
    }

    /// First contiguous run of speaking/transition phases.
    pub fn cycle_block(&self) -> Option<Range<usize>> {
        let start = self.phases.iter().position(|p| p.kind.is_cycle_slot())?;
        let len = self.phases[start..]
            .iter()
            .take_while(|p| p.kind.is_cycle_slot())
            .count();
        Some(start..start + len)
    }

    /// Wall-clock length of a full run, counting replayed cycle slots.
    pub fn planned_duration_ms(&self) -> u64 {
        let total = self.total_duration_ms();
        match (self.branching, self.cycle_block()) {
            (Branching::Alternating { slots_per_party }, Some(block)) => {
                let cycle: u64 = self.phases[block].iter().map(|p| p.duration_ms).sum();
                total.saturating_add(cycle.saturating_mul(u64::from(slots_per_party) - 1))
            }
            _ => total,
        }
    }

    /// Store key for this session's runtime state.
    pub fn storage_key(&self) -> String {
        storage_key(&self.session_id)
    }
}

/// Store key derived from a session id.
pub fn storage_key(session_id: &str) -> String {
    format!("phaseclock:session:{session_id}")
}
