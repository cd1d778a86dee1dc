//! Speech-to-text through an OpenAI-compatible transcription endpoint

use secrecy::{ExposeSecret, SecretString};

use crate::config::SttConfig;
use crate::{Error, Result};

/// Response from a Whisper-style transcription API
#[derive(serde::Deserialize)]
struct WhisperResponse {
    text: String,
}

/// Transcribes recorded utterances
pub struct SpeechToText {
    client: reqwest::Client,
    url: String,
    api_key: SecretString,
    model: String,
}

impl SpeechToText {
    /// Create a client from the STT settings
    ///
    /// # Errors
    ///
    /// Returns error if no API key is configured
    pub fn new(config: &SttConfig) -> Result<Self> {
        let api_key = config.api_key.clone().ok_or_else(|| {
            Error::Config("GROQ_API_KEY or OPENAI_API_KEY required for transcription".to_string())
        })?;

        Ok(Self {
            client: reqwest::Client::new(),
            url: config.url.clone(),
            api_key,
            model: config.model.clone(),
        })
    }

    /// Transcribe WAV audio
    ///
    /// # Errors
    ///
    /// Returns `Error::NoSpeechDetected` for an empty transcript,
    /// `Error::TranscriptionUnavailable` if the service is unreachable or
    /// failing, and `Error::Transcription` if it rejects the request
    pub async fn transcribe(&self, wav: &[u8]) -> Result<String> {
        tracing::debug!(audio_bytes = wav.len(), model = %self.model, "starting transcription");

        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(wav.to_vec())
                    .file_name("audio.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| Error::Transcription(e.to_string()))?,
            )
            .text("model", self.model.clone())
            .text("response_format", "json");

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(self.api_key.expose_secret())
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "transcription request failed");
                Error::TranscriptionUnavailable(e.to_string())
            })?;

        let status = response.status();
        tracing::debug!(status = %status, "received response");

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "transcription API error");
            return Err(classify_status(status, &body));
        }

        let result: WhisperResponse = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "failed to parse transcription response");
            Error::Transcription(e.to_string())
        })?;

        let transcript = clean_transcript(&result.text).ok_or(Error::NoSpeechDetected)?;
        tracing::info!(transcript = %transcript, "transcription complete");
        Ok(transcript)
    }
}

fn classify_status(status: reqwest::StatusCode, body: &str) -> Error {
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        Error::TranscriptionUnavailable(format!("{status}: {body}"))
    } else {
        Error::Transcription(format!("{status}: {body}"))
    }
}

/// Trimmed transcript, or `None` if nothing was said
///
/// Whisper transcribes silence as bracketed annotations or lone punctuation.
fn clean_transcript(text: &str) -> Option<String> {
    let text = text.trim();
    let annotation = (text.starts_with('[') && text.ends_with(']'))
        || (text.starts_with('(') && text.ends_with(')'));
    let has_words = text.chars().any(char::is_alphanumeric);

    (has_words && !annotation).then(|| text.to_string())
}
