//! User input for a conversation turn
//!
//! A turn first listens for an utterance, then transcribes it. The microphone
//! does both for real; typed input skips the audio entirely.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::Mutex;

use super::capture::{AudioCapture, samples_to_wav};
use super::endpoint::{Endpoint, UtteranceDetector};
use super::stt::SpeechToText;
use crate::config::SttConfig;
use crate::{Error, Result};

/// How often captured audio is handed to the endpoint detector
const CAPTURE_POLL: Duration = Duration::from_millis(100);

/// What the user said, before transcription
#[derive(Debug, Clone, PartialEq)]
pub enum Utterance {
    /// Recorded mono samples
    Audio {
        /// Samples in `[-1.0, 1.0]`
        samples: Vec<f32>,
        /// Capture rate
        sample_rate: u32,
    },
    /// Typed text
    Text(String),
}

/// Source of user prompts
#[async_trait]
pub trait SpeechInput: Send + Sync {
    /// Wait for the next utterance
    ///
    /// # Errors
    ///
    /// Returns `Error::InputClosed` when no more input will arrive, or an
    /// audio error if the device fails
    async fn listen(&self) -> Result<Utterance>;

    /// Turn an utterance into text
    ///
    /// # Errors
    ///
    /// Returns `Error::NoSpeechDetected` if nothing was said, or a
    /// transcription error
    async fn transcribe(&self, utterance: Utterance) -> Result<String>;
}

/// Microphone capture with energy endpointing and remote transcription
pub struct MicrophoneInput {
    stt: SpeechToText,
    config: SttConfig,
}

impl MicrophoneInput {
    /// Create microphone input
    ///
    /// # Errors
    ///
    /// Returns error if transcription is not configured
    pub fn new(config: &SttConfig) -> Result<Self> {
        Ok(Self {
            stt: SpeechToText::new(config)?,
            config: config.clone(),
        })
    }
}

/// Stops a blocking capture loop when the listening future is dropped
struct StopOnDrop(Arc<AtomicBool>);

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl SpeechInput for MicrophoneInput {
    async fn listen(&self) -> Result<Utterance> {
        let stop = Arc::new(AtomicBool::new(false));
        let _guard = StopOnDrop(Arc::clone(&stop));
        let config = self.config.clone();

        tokio::task::spawn_blocking(move || record_utterance(&config, &stop))
            .await
            .map_err(|e| Error::Audio(format!("capture thread failed: {e}")))?
    }

    async fn transcribe(&self, utterance: Utterance) -> Result<String> {
        match utterance {
            Utterance::Audio {
                samples,
                sample_rate,
            } => {
                let wav = samples_to_wav(&samples, sample_rate)?;
                self.stt.transcribe(&wav).await
            }
            Utterance::Text(text) => typed_transcript(&text),
        }
    }
}

/// Record until the detector reports a complete utterance
fn record_utterance(config: &SttConfig, stop: &AtomicBool) -> Result<Utterance> {
    let mut capture = AudioCapture::new()?;
    let sample_rate = capture.sample_rate();
    let mut detector = UtteranceDetector::new(config, sample_rate);

    capture.start()?;
    tracing::debug!("listening");

    while !stop.load(Ordering::SeqCst) {
        std::thread::sleep(CAPTURE_POLL);

        if let Endpoint::Complete(samples) = detector.process(&capture.take_buffer()) {
            capture.stop();
            return Ok(Utterance::Audio {
                samples,
                sample_rate,
            });
        }
    }

    capture.stop();
    Err(Error::Audio("listening cancelled".to_string()))
}

/// Line-based typed input
pub struct TextInput<R> {
    lines: Mutex<Lines<R>>,
}

/// Typed input from the terminal
pub type StdinInput = TextInput<BufReader<Stdin>>;

impl StdinInput {
    /// Read prompts from standard input
    #[must_use]
    pub fn stdin() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()))
    }
}

impl<R: AsyncBufRead + Unpin + Send> TextInput<R> {
    /// Read prompts line by line from `reader`
    pub fn new(reader: R) -> Self {
        Self {
            lines: Mutex::new(reader.lines()),
        }
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> SpeechInput for TextInput<R> {
    async fn listen(&self) -> Result<Utterance> {
        match self.lines.lock().await.next_line().await? {
            Some(line) => Ok(Utterance::Text(line)),
            None => Err(Error::InputClosed),
        }
    }

    async fn transcribe(&self, utterance: Utterance) -> Result<String> {
        match utterance {
            Utterance::Text(text) => typed_transcript(&text),
            Utterance::Audio { .. } => Err(Error::Transcription(
                "typed input cannot transcribe audio".to_string(),
            )),
        }
    }
}

fn typed_transcript(text: &str) -> Result<String> {
    let text = text.trim();
    if text.is_empty() {
        return Err(Error::NoSpeechDetected);
    }
    Ok(text.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn typed_lines_then_closed() {
        let input = TextInput::new(&b"hello there\n\n  second  \n"[..]);

        let first = input.listen().await.unwrap();
        assert_eq!(first, Utterance::Text("hello there".to_string()));
        assert_eq!(input.transcribe(first).await.unwrap(), "hello there");

        let blank = input.listen().await.unwrap();
        assert!(matches!(
            input.transcribe(blank).await,
            Err(Error::NoSpeechDetected)
        ));

        let second = input.listen().await.unwrap();
        assert_eq!(input.transcribe(second).await.unwrap(), "second");

        assert!(matches!(input.listen().await, Err(Error::InputClosed)));
    }
}
