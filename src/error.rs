//! Error types for the immy voice pipeline

use std::time::Duration;

use thiserror::Error;

/// Result type alias for immy operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voice pipeline
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Connection refused, reset or timed out
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed or unexpected message from the synthesis backend
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Handshake rejected by the synthesis backend (bad credential)
    #[error("auth error: {0}")]
    Auth(String),

    /// Unit sent while the connection is not open
    #[error("synthesis connection is not open")]
    NotConnected,

    /// Reconnect loop gave up after the configured number of attempts
    #[error("gave up reconnecting after {0} attempts")]
    RetriesExhausted(u32),

    /// Audio sink high-water mark exceeded, frame dropped
    #[error("audio overrun: {pending} frames pending (high-water mark {high_water})")]
    Overrun {
        /// Frames waiting for playback when the frame was rejected
        pending: usize,
        /// Configured high-water mark
        high_water: usize,
    },

    /// A bounded wait expired
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Audio device or codec error
    #[error("audio error: {0}")]
    Audio(String),

    /// Transcription failed
    #[error("transcription error: {0}")]
    Transcription(String),

    /// Transcription service unreachable or failing
    #[error("transcription service unavailable: {0}")]
    TranscriptionUnavailable(String),

    /// The utterance contained no recognizable speech
    #[error("no speech detected")]
    NoSpeechDetected,

    /// Language model reply failed or ended unexpectedly
    #[error("upstream error: {0}")]
    Upstream(String),

    /// No more user input will arrive
    #[error("input closed")]
    InputClosed,

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// WebSocket error
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl Error {
    /// Whether this error ends the current session
    ///
    /// Transport and protocol failures are recovered inside the synthesis
    /// connection; transcription failures only end the current turn.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Auth(_)
                | Self::Upstream(_)
                | Self::RetriesExhausted(_)
                | Self::Config(_)
                | Self::InputClosed
        )
    }

    /// Whether this error belongs to the transcription boundary
    #[must_use]
    pub const fn is_transcription(&self) -> bool {
        matches!(
            self,
            Self::Transcription(_) | Self::TranscriptionUnavailable(_) | Self::NoSpeechDetected
        )
    }
}
