//! Audio in and out
//!
//! Microphone capture, endpointing and transcription on the input side;
//! the ordered [`AudioSink`] and the device player on the output side.

mod capture;
mod endpoint;
mod input;
mod playback;
mod sink;
mod stt;

pub use capture::{AudioCapture, SAMPLE_RATE, samples_to_wav};
pub use endpoint::{DetectorState, Endpoint, UtteranceDetector, rms};
pub use input::{MicrophoneInput, SpeechInput, StdinInput, TextInput, Utterance};
pub use playback::{DevicePlayer, Mp3Stream, decode_mp3, sine_tone};
pub use sink::{AudioSink, Player};
pub use stt::SpeechToText;
