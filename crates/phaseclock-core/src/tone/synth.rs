//! Sine-tone synthesis through `rodio`.
//!
//! The output stream is not `Send`, so it lives on a dedicated worker thread
//! that receives tone specs over a channel. Dropping the emitter closes the
//! channel and joins the worker once the tones it queued have played out.

use std::sync::mpsc::{self, Sender};
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;

use rodio::source::SineWave;
use rodio::{OutputStream, Sink, Source};

use super::{Cue, ToneEmitter, ToneSpec, ToneTable};

pub struct RodioToneEmitter {
    table: ToneTable,
    tx: Mutex<Option<Sender<ToneSpec>>>,
    worker: Option<JoinHandle<()>>,
}

impl RodioToneEmitter {
    /// Start the audio worker. `volume` is 0..=100.
    pub fn new(table: ToneTable, volume: u32) -> Self {
        let (tx, rx) = mpsc::channel::<ToneSpec>();
        let volume = volume.min(100) as f32 / 100.0;

        let worker = std::thread::Builder::new()
            .name("phaseclock-tones".into())
            .spawn(move || {
                let Ok((_stream, handle)) = OutputStream::try_default() else {
                    tracing::debug!("no audio output device; tones disabled");
                    return;
                };
                let mut voices = Voices::default();
                for spec in rx {
                    let Ok(sink) = Sink::try_new(&handle) else {
                        continue;
                    };
                    let source = SineWave::new(spec.frequency_hz)
                        .take_duration(Duration::from_millis(spec.duration_ms))
                        .fade_in(Duration::from_millis(spec.attack_ms))
                        .amplify(spec.gain);
                    sink.set_volume(volume);
                    sink.append(source);
                    voices.push(sink);
                }
                // `_stream` must outlive the last tone.
                voices.drain();
            });

        let (tx, worker) = match worker {
            Ok(handle) => (Some(tx), Some(handle)),
            Err(e) => {
                tracing::warn!(error = %e, "failed to spawn tone worker");
                (None, None)
            }
        };

        Self {
            table,
            tx: Mutex::new(tx),
            worker,
        }
    }

    /// Stop the worker. Later cues are ignored.
    pub fn dispose(&mut self) {
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl ToneEmitter for RodioToneEmitter {
    fn play(&self, cue: &Cue) {
        let spec = self.table.resolve(cue);
        if let Ok(tx) = self.tx.lock() {
            if let Some(tx) = tx.as_ref() {
                let _ = tx.send(spec);
            }
        }
    }
}

/// Sinks that may still be playing. Finished ones are dropped as new tones
/// arrive.
#[derive(Default)]
struct Voices(Vec<Sink>);

impl Voices {
    fn push(&mut self, sink: Sink) {
        self.0.retain(|sink| !sink.empty());
        self.0.push(sink);
    }

    /// Block until every queued tone has played out.
    fn drain(self) {
        for sink in self.0 {
            sink.sleep_until_end();
        }
    }
}

impl Drop for RodioToneEmitter {
    fn drop(&mut self) {
        self.dispose();
    }
}
