//! Wire messages for the streaming TTS backend
//!
//! Outbound: one configuration message when the socket opens, one text
//! message per unit, and `{"text": ""}` to end a reply. Inbound: JSON with
//! base64 audio and an `isFinal` flag, or an error payload.

use base64::Engine as _;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};

use super::segmenter::SpeechUnit;
use crate::config::{SynthesisConfig, VoiceSettings};
use crate::{Error, Result};

/// End-of-reply and end-of-stream marker
pub const END_OF_STREAM: &str = r#"{"text":""}"#;

/// Close code sent by the backend for policy violations (bad key, quota)
pub const POLICY_VIOLATION: u16 = 1008;

/// First message on a new socket
#[derive(Debug, Serialize)]
struct InitMessage<'a> {
    /// The backend requires a single space to prime the stream
    text: &'static str,
    voice_settings: &'a VoiceSettings,
    generation_config: GenerationConfig<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    xi_api_key: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct GenerationConfig<'a> {
    chunk_length_schedule: &'a [u32],
}

#[derive(Debug, Serialize)]
struct TextMessage<'a> {
    text: &'a str,
}

/// Message received from the backend
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    audio: Option<String>,
    is_final: Option<bool>,
    error: Option<String>,
    message: Option<String>,
}

/// Decoded inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// Audio payload; `is_final` marks the end of the current synthesis
    Audio {
        /// Encoded audio bytes (possibly empty)
        data: Vec<u8>,
        /// Synthesis for the stream is complete
        is_final: bool,
    },
    /// Error payload for the current unit
    Failure {
        /// Human readable reason
        message: String,
        /// The backend rejected the credential
        auth: bool,
    },
}

/// Serialize the configuration message
///
/// # Errors
///
/// Returns error if serialization fails
pub fn init_message(config: &SynthesisConfig) -> Result<String> {
    let message = InitMessage {
        text: " ",
        voice_settings: &config.voice_settings,
        generation_config: GenerationConfig {
            chunk_length_schedule: &config.chunk_length_schedule,
        },
        xi_api_key: config.api_key.as_ref().map(ExposeSecret::expose_secret),
    };
    Ok(serde_json::to_string(&message)?)
}

/// Serialize one unit
///
/// The backend expects every text chunk to end with a space so words
/// across units are not glued together.
///
/// # Errors
///
/// Returns error if serialization fails
pub fn unit_message(unit: &SpeechUnit) -> Result<String> {
    let text = format!("{} ", unit.text());
    Ok(serde_json::to_string(&TextMessage { text: &text })?)
}

/// Decode a text frame from the backend
///
/// # Errors
///
/// Returns `Error::Protocol` for malformed JSON or invalid base64
pub fn decode(text: &str) -> Result<ServerEvent> {
    let message: ServerMessage = serde_json::from_str(text)
        .map_err(|e| Error::Protocol(format!("invalid server message: {e}")))?;

    if message.error.is_some() || (message.audio.is_none() && message.message.is_some()) {
        let reason = match (message.error, message.message) {
            (Some(code), Some(detail)) => format!("{code}: {detail}"),
            (Some(code), None) => code,
            (None, Some(detail)) => detail,
            (None, None) => "unknown error".to_string(),
        };
        let auth = is_auth_failure(&reason);
        return Ok(ServerEvent::Failure {
            message: reason,
            auth,
        });
    }

    let data = match message.audio.as_deref() {
        Some(encoded) if !encoded.is_empty() => base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| Error::Protocol(format!("invalid base64 audio: {e}")))?,
        _ => Vec::new(),
    };

    Ok(ServerEvent::Audio {
        data,
        is_final: message.is_final.unwrap_or(false),
    })
}

/// Whether an error reason means the credential was rejected
///
/// Matches whole words, so "author" or "authoring" in a reason is not a
/// credential failure.
#[must_use]
pub fn is_auth_failure(reason: &str) -> bool {
    let lower = reason.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .collect();

    let named = words.iter().any(|word| {
        matches!(
            *word,
            "auth" | "unauthorized" | "unauthenticated" | "authentication"
        )
    });
    named
        || words
            .windows(2)
            .any(|pair| matches!(pair, ["api" | "invalid", "key"]))
}
