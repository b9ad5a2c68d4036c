//! Energy-based speech gate
//!
//! Turns a continuous microphone stream into speaker-start/speaker-end edges
//! so local mode can drive the same session as a voice channel.

use std::time::Duration;

/// Default RMS level above which a chunk counts as speech
pub const DEFAULT_THRESHOLD: f32 = 0.03;

/// Gate state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
    /// Waiting for speech
    Quiet,
    /// Speech detected, waiting for trailing silence
    Speaking,
}

/// Result of feeding one chunk into the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateEvent {
    /// No speech, nothing to forward
    Idle,
    /// Speech began with this chunk
    Started,
    /// Still inside an utterance; forward the chunk
    Continue,
    /// Trailing silence elapsed; the utterance is over
    Ended,
}

/// Detects utterance boundaries by RMS energy and trailing silence
#[derive(Debug)]
pub struct SpeechGate {
    threshold: f32,
    silence_samples: usize,
    state: GateState,
    silence_counter: usize,
}

impl SpeechGate {
    /// Create a gate for audio at `sample_rate`
    ///
    /// An utterance ends after `silence` of chunks below `threshold`.
    #[must_use]
    pub fn new(threshold: f32, silence: Duration, sample_rate: u32) -> Self {
        let silence_samples =
            usize::try_from(silence.as_millis() * u128::from(sample_rate) / 1000)
                .unwrap_or(usize::MAX);

        tracing::debug!(threshold, silence_samples, "speech gate initialized");

        Self {
            threshold,
            silence_samples,
            state: GateState::Quiet,
            silence_counter: 0,
        }
    }

    /// Feed one chunk of mono f32 samples
    pub fn process(&mut self, samples: &[f32]) -> GateEvent {
        let energy = calculate_energy(samples);
        let is_speech = energy > self.threshold;

        match self.state {
            GateState::Quiet => {
                if !is_speech {
                    return GateEvent::Idle;
                }
                self.state = GateState::Speaking;
                self.silence_counter = 0;
                tracing::trace!(energy, "speech detected");
                GateEvent::Started
            }
            GateState::Speaking => {
                if is_speech {
                    self.silence_counter = 0;
                } else {
                    self.silence_counter += samples.len();
                }

                if self.silence_counter > self.silence_samples {
                    tracing::trace!(silence = self.silence_counter, "speech ended");
                    self.reset();
                    return GateEvent::Ended;
                }
                GateEvent::Continue
            }
        }
    }

    /// Whether an utterance is in progress
    #[must_use]
    pub fn is_speaking(&self) -> bool {
        self.state == GateState::Speaking
    }

    /// Return to the quiet state
    pub const fn reset(&mut self) {
        self.state = GateState::Quiet;
        self.silence_counter = 0;
    }
}

/// Calculate RMS energy of audio samples
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn calculate_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}
