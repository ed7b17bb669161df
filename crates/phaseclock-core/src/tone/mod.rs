//! Audible cues at phase boundaries.
//!
//! Cues are fire-and-forget: emitters never report failure and never touch
//! session state. Backends are created explicitly and injected into the
//! controller, so tests run against [`NullToneEmitter`] or
//! [`RecordingToneEmitter`].

#[cfg(feature = "audio")]
mod synth;

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

#[cfg(feature = "audio")]
pub use synth::RodioToneEmitter;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cue {
    /// Ordinary phase advance.
    Low,
    /// Session completed.
    High,
    /// Phase-specific cue by id.
    Named(String),
}

impl Cue {
    pub fn named(id: impl Into<String>) -> Self {
        match id.into() {
            id if id == "low" => Cue::Low,
            id if id == "high" => Cue::High,
            id => Cue::Named(id),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Cue::Low => "low",
            Cue::High => "high",
            Cue::Named(id) => id,
        }
    }
}

/// Frequency and envelope of one synthesized tone.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ToneSpec {
    pub frequency_hz: f32,
    pub duration_ms: u64,
    #[serde(default = "default_attack_ms")]
    pub attack_ms: u64,
    #[serde(default = "default_gain")]
    pub gain: f32,
}

fn default_attack_ms() -> u64 {
    10
}

fn default_gain() -> f32 {
    0.6
}

impl ToneSpec {
    pub const LOW: ToneSpec = ToneSpec {
        frequency_hz: 440.0,
        duration_ms: 180,
        attack_ms: 10,
        gain: 0.6,
    };
    pub const HIGH: ToneSpec = ToneSpec {
        frequency_hz: 880.0,
        duration_ms: 450,
        attack_ms: 20,
        gain: 0.7,
    };
    const CHIME: ToneSpec = ToneSpec {
        frequency_hz: 659.25,
        duration_ms: 600,
        attack_ms: 5,
        gain: 0.5,
    };
    const ALARM: ToneSpec = ToneSpec {
        frequency_hz: 1046.5,
        duration_ms: 900,
        attack_ms: 0,
        gain: 0.8,
    };
}

/// Maps cues to tones. User overrides win over built-ins; unknown names
/// fall back to the low tone.
#[derive(Debug, Clone, Default)]
pub struct ToneTable {
    overrides: HashMap<String, ToneSpec>,
}

impl ToneTable {
    pub fn new(overrides: HashMap<String, ToneSpec>) -> Self {
        Self { overrides }
    }

    pub fn resolve(&self, cue: &Cue) -> ToneSpec {
        if let Some(spec) = self.overrides.get(cue.id()) {
            return *spec;
        }
        match cue.id() {
            "high" => ToneSpec::HIGH,
            "chime" => ToneSpec::CHIME,
            "alarm" => ToneSpec::ALARM,
            _ => ToneSpec::LOW,
        }
    }
}

pub trait ToneEmitter: Send + Sync {
    /// Attempt to play `cue`. Failures are swallowed.
    fn play(&self, cue: &Cue);
}

/// Plays nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullToneEmitter;

impl ToneEmitter for NullToneEmitter {
    fn play(&self, _cue: &Cue) {}
}

/// Rings the terminal bell on stderr; twice for the high tone.
#[derive(Debug, Default, Clone, Copy)]
pub struct BellToneEmitter;

impl ToneEmitter for BellToneEmitter {
    fn play(&self, cue: &Cue) {
        let bells: &[u8] = if *cue == Cue::High { b"\x07\x07" } else { b"\x07" };
        let mut stderr = std::io::stderr();
        let _ = stderr.write_all(bells).and_then(|_| stderr.flush());
    }
}

/// Keeps every cue it is asked to play. Clones share the log.
#[derive(Debug, Default, Clone)]
pub struct RecordingToneEmitter {
    played: Arc<Mutex<Vec<Cue>>>,
}

impl RecordingToneEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn played(&self) -> Vec<Cue> {
        self.played.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

impl ToneEmitter for RecordingToneEmitter {
    fn play(&self, cue: &Cue) {
        if let Ok(mut played) = self.played.lock() {
            played.push(cue.clone());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToneBackend {
    None,
    #[default]
    Bell,
    Audio,
}

/// Create the emitter for `backend`.
///
/// `volume` is 0..=100. Without the `audio` feature an audio request falls
/// back to the terminal bell.
pub fn create_emitter(
    backend: ToneBackend,
    table: ToneTable,
    volume: u32,
) -> Arc<dyn ToneEmitter> {
    match backend {
        ToneBackend::None => Arc::new(NullToneEmitter),
        ToneBackend::Bell => Arc::new(BellToneEmitter),
        #[cfg(feature = "audio")]
        ToneBackend::Audio => Arc::new(RodioToneEmitter::new(table, volume)),
        #[cfg(not(feature = "audio"))]
        ToneBackend::Audio => {
            let _ = (table, volume);
            tracing::warn!("built without the `audio` feature; using the terminal bell");
            Arc::new(BellToneEmitter)
        }
    }
}
