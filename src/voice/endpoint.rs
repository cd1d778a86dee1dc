//! Energy-based utterance endpointing
//!
//! Decides when the user has started and finished speaking by comparing the
//! RMS energy of each captured block against a threshold.

use std::time::Duration;

use crate::config::SttConfig;

/// Detector state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorState {
    /// Waiting for speech
    Idle,
    /// Speech started, accumulating until trailing silence
    Speaking,
}

/// Result of feeding one block of samples
#[derive(Debug, Clone, PartialEq)]
pub enum Endpoint {
    /// Nothing decided yet
    Pending,
    /// Speech followed by enough silence
    Complete(Vec<f32>),
}

/// Splits a sample stream into utterances
#[derive(Debug)]
pub struct UtteranceDetector {
    threshold: f32,
    silence_samples: usize,
    min_speech_samples: usize,
    max_samples: usize,
    state: DetectorState,
    speech: Vec<f32>,
    silence: usize,
}

impl UtteranceDetector {
    /// Create a detector for audio at `sample_rate`
    #[must_use]
    pub fn new(config: &SttConfig, sample_rate: u32) -> Self {
        let samples = |d: Duration| {
            usize::try_from(d.as_millis() * u128::from(sample_rate) / 1000).unwrap_or(usize::MAX)
        };

        Self {
            threshold: config.energy_threshold,
            silence_samples: samples(config.silence()),
            min_speech_samples: samples(config.min_speech()),
            max_samples: samples(Duration::from_secs(config.max_utterance_secs)),
            state: DetectorState::Idle,
            speech: Vec::new(),
            silence: 0,
        }
    }

    /// Feed a block of samples
    pub fn process(&mut self, samples: &[f32]) -> Endpoint {
        let energy = rms(samples);
        let is_speech = energy > self.threshold;

        match self.state {
            DetectorState::Idle => {
                if is_speech {
                    self.state = DetectorState::Speaking;
                    self.speech.clear();
                    self.speech.extend_from_slice(samples);
                    self.silence = 0;
                    tracing::trace!(energy, "speech started");
                }
            }
            DetectorState::Speaking => {
                self.speech.extend_from_slice(samples);

                if is_speech {
                    self.silence = 0;
                } else {
                    self.silence += samples.len();
                }

                let voiced = self.speech.len().saturating_sub(self.silence);

                if self.silence >= self.silence_samples {
                    if voiced >= self.min_speech_samples {
                        tracing::debug!(samples = self.speech.len(), "utterance complete");
                        return self.finish();
                    }
                    tracing::trace!(voiced, "too short, ignoring");
                    self.reset();
                } else if self.speech.len() >= self.max_samples {
                    tracing::debug!(samples = self.speech.len(), "utterance hit length cap");
                    return self.finish();
                }
            }
        }

        Endpoint::Pending
    }

    /// Back to idle, dropping anything accumulated
    pub fn reset(&mut self) {
        self.state = DetectorState::Idle;
        self.speech.clear();
        self.silence = 0;
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> DetectorState {
        self.state
    }

    fn finish(&mut self) -> Endpoint {
        let speech = std::mem::take(&mut self.speech);
        self.reset();
        Endpoint::Complete(speech)
    }
}

/// RMS energy of a block
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 1000;

    fn detector() -> UtteranceDetector {
        let config = SttConfig {
            energy_threshold: 0.1,
            silence_ms: 200,
            min_speech_ms: 100,
            max_utterance_secs: 2,
            ..SttConfig::default()
        };
        UtteranceDetector::new(&config, RATE)
    }

    fn block(level: f32, len: usize) -> Vec<f32> {
        vec![level; len]
    }

    #[test]
    fn energy_calculation() {
        assert!(rms(&block(0.0, 100)) < 0.001);
        assert!(rms(&block(0.5, 100)) > 0.4);
        assert_eq!(rms(&[]), 0.0);
    }

    #[test]
    fn silence_stays_idle() {
        let mut detector = detector();
        for _ in 0..20 {
            assert_eq!(detector.process(&block(0.0, 50)), Endpoint::Pending);
        }
        assert_eq!(detector.state(), DetectorState::Idle);
    }

    #[test]
    fn speech_then_silence_completes() {
        let mut detector = detector();
        assert_eq!(detector.process(&block(0.5, 150)), Endpoint::Pending);
        assert_eq!(detector.state(), DetectorState::Speaking);
        assert_eq!(detector.process(&block(0.0, 100)), Endpoint::Pending);

        match detector.process(&block(0.0, 100)) {
            Endpoint::Complete(samples) => assert_eq!(samples.len(), 350),
            Endpoint::Pending => panic!("expected a complete utterance"),
        }
        assert_eq!(detector.state(), DetectorState::Idle);
    }

    #[test]
    fn short_blip_is_ignored() {
        let mut detector = detector();
        detector.process(&block(0.5, 50));
        assert_eq!(detector.process(&block(0.0, 250)), Endpoint::Pending);
        assert_eq!(detector.state(), DetectorState::Idle);
    }

    #[test]
    fn long_speech_is_capped() {
        let mut detector = detector();
        let mut result = Endpoint::Pending;
        for _ in 0..30 {
            result = detector.process(&block(0.5, 100));
            if result != Endpoint::Pending {
                break;
            }
        }
        assert!(matches!(result, Endpoint::Complete(ref s) if s.len() == 2000));
    }
}
