//! Voice component tests
//!
//! Tests voice components without requiring audio hardware

use std::io::Cursor;

use immy::config::SttConfig;
use immy::voice::{
    DetectorState, Endpoint, SAMPLE_RATE, UtteranceDetector, decode_mp3, rms, samples_to_wav,
    sine_tone,
};

mod common;

/// Generate sine wave audio samples
fn generate_sine_samples(frequency: f32, duration_secs: f32, amplitude: f32) -> Vec<f32> {
    let num_samples = (SAMPLE_RATE as f32 * duration_secs) as usize;
    (0..num_samples)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin()
        })
        .collect()
}

/// Generate silence
fn generate_silence(duration_secs: f32) -> Vec<f32> {
    let num_samples = (SAMPLE_RATE as f32 * duration_secs) as usize;
    vec![0.0; num_samples]
}

fn detector() -> UtteranceDetector {
    UtteranceDetector::new(&SttConfig::default(), SAMPLE_RATE)
}

#[test]
fn test_silence_never_starts_an_utterance() {
    let mut detector = detector();

    for _ in 0..10 {
        assert_eq!(detector.process(&generate_silence(0.1)), Endpoint::Pending);
    }
    assert_eq!(detector.state(), DetectorState::Idle);
}

#[test]
fn test_speech_followed_by_silence_completes() {
    let mut detector = detector();

    let speech = generate_sine_samples(440.0, 0.5, 0.3);
    assert_eq!(detector.process(&speech), Endpoint::Pending);
    assert_eq!(detector.state(), DetectorState::Speaking);

    // Default trailing silence is 800ms
    assert_eq!(detector.process(&generate_silence(0.5)), Endpoint::Pending);

    match detector.process(&generate_silence(0.5)) {
        Endpoint::Complete(samples) => {
            assert_eq!(samples.len(), speech.len() + 2 * generate_silence(0.5).len());
        }
        Endpoint::Pending => panic!("utterance should be complete"),
    }
    assert_eq!(detector.state(), DetectorState::Idle);
}

#[test]
fn test_short_noise_is_discarded() {
    let mut detector = detector();

    detector.process(&generate_sine_samples(440.0, 0.1, 0.3));
    assert_eq!(detector.process(&generate_silence(1.0)), Endpoint::Pending);
    assert_eq!(detector.state(), DetectorState::Idle);
}

#[test]
fn test_detector_reset() {
    let mut detector = detector();

    detector.process(&generate_sine_samples(440.0, 0.3, 0.3));
    assert_eq!(detector.state(), DetectorState::Speaking);

    detector.reset();
    assert_eq!(detector.state(), DetectorState::Idle);
}

#[test]
fn test_energy_of_tone() {
    // RMS of a sine is amplitude / sqrt(2)
    let energy = rms(&generate_sine_samples(440.0, 0.5, 0.5));
    assert!((energy - 0.5 / 2f32.sqrt()).abs() < 0.01);
    assert!(rms(&generate_silence(0.1)) < 0.001);
}

#[test]
fn test_samples_to_wav() {
    let samples = generate_sine_samples(440.0, 0.1, 0.5);
    let wav_data = samples_to_wav(&samples, SAMPLE_RATE).unwrap();

    // Check WAV header magic
    assert_eq!(&wav_data[0..4], b"RIFF");
    assert_eq!(&wav_data[8..12], b"WAVE");

    // WAV header is 44 bytes
    assert!(wav_data.len() > 44);
}

#[test]
fn test_wav_roundtrip() {
    let original_samples: Vec<f32> = vec![0.0, 0.5, -0.5, 1.0, -1.0, 0.25];
    let wav_data = samples_to_wav(&original_samples, SAMPLE_RATE).unwrap();

    let mut reader = hound::WavReader::new(Cursor::new(wav_data)).unwrap();

    let spec = reader.spec();
    assert_eq!(spec.sample_rate, SAMPLE_RATE);
    assert_eq!(spec.channels, 1);

    let read_samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
    assert_eq!(read_samples.len(), original_samples.len());
}

#[test]
fn test_sine_tone_length() {
    let tone = sine_tone(22_050, 440.0, 2.0);
    assert_eq!(tone.len(), 44_100);
    assert!(tone.iter().all(|s| s.abs() <= 0.3 + f32::EPSILON));
}

#[test]
fn test_garbage_yields_no_audio() {
    let decoded = decode_mp3(&[0u8; 64]);
    assert!(decoded.map_or(true, |samples| samples.is_empty()));
}
