//! Configuration management for immy
//!
//! Settings come from an optional TOML file and are then overridden by
//! environment variables. Credentials are only read from the environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default ElevenLabs voice ("Adam")
const DEFAULT_VOICE_ID: &str = "jBpfuIE2acCO8z3wKNLl";

/// immy configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Streaming synthesis connection
    pub synthesis: SynthesisConfig,

    /// Audio sink and output device
    pub playback: PlaybackConfig,

    /// Session orchestration
    pub session: SessionConfig,

    /// Language model
    pub llm: LlmConfig,

    /// Speech-to-text
    pub stt: SttConfig,
}

/// Streaming TTS connection configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SynthesisConfig {
    /// WebSocket base URL of the synthesis backend
    pub base_url: String,

    /// Voice identifier
    pub voice_id: String,

    /// Synthesis model identifier
    pub model_id: String,

    /// Output format requested from the backend (e.g. "mp3_22050_32")
    pub output_format: String,

    /// Voice stability and similarity parameters
    pub voice_settings: VoiceSettings,

    /// Characters buffered by the backend before each generation step
    pub chunk_length_schedule: Vec<u32>,

    /// Delay before the first reconnect attempt
    pub initial_backoff_ms: u64,

    /// Upper bound on the reconnect delay
    pub max_backoff_ms: u64,

    /// Give up after this many consecutive failed attempts (unbounded if unset)
    pub max_attempts: Option<u32>,

    /// Interval between keep-alive pings while open
    pub heartbeat_secs: u64,

    /// Timeout for dialing and the handshake write
    pub connect_timeout_secs: u64,

    /// Timeout for the polite close during shutdown
    pub close_timeout_secs: u64,

    /// Capacity of the outbound unit queue
    pub outbound_capacity: usize,

    /// Backend credential (`ELEVENLABS_API_KEY`)
    #[serde(skip)]
    pub api_key: Option<SecretString>,
}

/// Voice settings sent in the configuration message
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct VoiceSettings {
    /// Lower values are more expressive
    pub stability: f32,

    /// Adherence to the original voice
    pub similarity_boost: f32,

    /// Style exaggeration
    pub style: f32,

    /// Boost similarity to the original speaker
    pub use_speaker_boost: bool,
}

/// Audio sink configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Frames queued beyond this count are dropped
    pub high_water_mark: usize,

    /// Interval between "is the device still busy" polls
    pub poll_interval_ms: u64,

    /// Maximum wait for the queue to drain at the end of a reply
    pub drain_timeout_secs: u64,

    /// Output device sample rate; must match the decoded audio
    pub sample_rate: u32,
}

/// Session orchestration configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Units held while the connection is down before the oldest is dropped
    pub hold_queue_capacity: usize,

    /// Maximum wait for held units to be flushed after the reply text ends
    pub reply_timeout_secs: u64,

    /// Capacity of the session event broadcast channel
    pub event_capacity: usize,
}

/// Language model configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LlmConfig {
    /// OpenAI-compatible API base URL
    pub base_url: String,

    /// Model identifier
    pub model: String,

    /// System prompt prepended to every conversation
    pub system_prompt: String,

    /// Stream tokens instead of waiting for the full completion
    pub stream: bool,

    /// Completed exchanges kept as context
    pub max_history: usize,

    /// Request timeout
    pub timeout_secs: u64,

    /// API key (`GROQ_API_KEY`)
    #[serde(skip)]
    pub api_key: Option<SecretString>,
}

/// Speech-to-text configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SttConfig {
    /// OpenAI-compatible transcription endpoint
    pub url: String,

    /// Transcription model
    pub model: String,

    /// RMS energy above which audio counts as speech
    pub energy_threshold: f32,

    /// Trailing silence that ends an utterance
    pub silence_ms: u64,

    /// Utterances shorter than this are ignored
    pub min_speech_ms: u64,

    /// Hard cap on a single utterance
    pub max_utterance_secs: u64,

    /// API key (`GROQ_API_KEY` or `OPENAI_API_KEY`)
    #[serde(skip)]
    pub api_key: Option<SecretString>,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            base_url: "wss://api.elevenlabs.io".to_string(),
            voice_id: DEFAULT_VOICE_ID.to_string(),
            model_id: "eleven_turbo_v2_5".to_string(),
            output_format: "mp3_22050_32".to_string(),
            voice_settings: VoiceSettings::default(),
            chunk_length_schedule: vec![120, 160, 250, 290],
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
            max_attempts: None,
            heartbeat_secs: 30,
            connect_timeout_secs: 10,
            close_timeout_secs: 3,
            outbound_capacity: 64,
            api_key: None,
        }
    }
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            stability: 0.0,
            similarity_boost: 1.0,
            style: 0.0,
            use_speaker_boost: true,
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            high_water_mark: 256,
            poll_interval_ms: 50,
            drain_timeout_secs: 60,
            sample_rate: 22_050,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            hold_queue_capacity: 32,
            reply_timeout_secs: 30,
            event_capacity: 64,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.groq.com/openai/v1".to_string(),
            model: "llama-3.3-70b-versatile".to_string(),
            system_prompt: "You are Immy, a friendly voice assistant. Keep replies short, \
                            warm and conversational, and avoid lists or markdown because \
                            everything you write is spoken aloud."
                .to_string(),
            stream: true,
            max_history: 10,
            timeout_secs: 60,
            api_key: None,
        }
    }
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            url: "https://api.groq.com/openai/v1/audio/transcriptions".to_string(),
            model: "whisper-large-v3-turbo".to_string(),
            energy_threshold: 0.03,
            silence_ms: 800,
            min_speech_ms: 300,
            max_utterance_secs: 30,
            api_key: None,
        }
    }
}

impl SynthesisConfig {
    /// Full `stream-input` URL for the configured voice, model and format
    ///
    /// # Errors
    ///
    /// Returns error if the base URL is not a valid WebSocket URL
    pub fn stream_url(&self) -> Result<url::Url> {
        let mut url = url::Url::parse(&self.base_url)
            .map_err(|e| Error::Config(format!("invalid synthesis base_url: {e}")))?;

        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::Config(format!(
                "synthesis base_url must use ws:// or wss://, got {}",
                url.scheme()
            )));
        }

        url.set_path(&format!("/v1/text-to-speech/{}/stream-input", self.voice_id));
        url.query_pairs_mut()
            .clear()
            .append_pair("model_id", &self.model_id)
            .append_pair("output_format", &self.output_format);

        Ok(url)
    }

    /// Delay before the first reconnect attempt
    #[must_use]
    pub const fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    /// Upper bound on the reconnect delay
    #[must_use]
    pub const fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Interval between keep-alive pings
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    /// Timeout for dialing and the handshake write
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Timeout for the polite close
    #[must_use]
    pub const fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.close_timeout_secs)
    }
}

impl PlaybackConfig {
    /// Interval between device busy polls
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Maximum wait for the sink to drain
    #[must_use]
    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl SessionConfig {
    /// Maximum wait for held units after the reply text ends
    #[must_use]
    pub const fn reply_timeout(&self) -> Duration {
        Duration::from_secs(self.reply_timeout_secs)
    }
}

impl SttConfig {
    /// Trailing silence that ends an utterance
    #[must_use]
    pub const fn silence(&self) -> Duration {
        Duration::from_millis(self.silence_ms)
    }

    /// Minimum utterance length
    #[must_use]
    pub const fn min_speech(&self) -> Duration {
        Duration::from_millis(self.min_speech_ms)
    }
}

/// Default config file location (`~/.config/immy/config.toml` on Linux)
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "immy", "immy").map(|d| d.config_dir().join("config.toml"))
}

impl Config {
    /// Load configuration from the default file location and the environment
    ///
    /// # Errors
    ///
    /// Returns error if the config file exists but cannot be parsed
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).or_else(default_config_path);

        let mut config = match path {
            Some(ref p) if p.exists() => Self::from_file(p)?,
            Some(ref p) => {
                tracing::debug!(path = %p.display(), "no config file, using defaults");
                Self::default()
            }
            None => Self::default(),
        };

        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML config file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        tracing::info!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    /// Overlay environment variables using the given lookup
    pub fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = var("ELEVENLABS_API_KEY").filter(|k| !k.is_empty()) {
            self.synthesis.api_key = Some(SecretString::from(key));
        }
        if let Some(voice) = var("IMMY_VOICE_ID") {
            self.synthesis.voice_id = voice;
        }
        if let Some(model) = var("IMMY_TTS_MODEL") {
            self.synthesis.model_id = model;
        }
        if let Some(url) = var("IMMY_TTS_URL") {
            self.synthesis.base_url = url;
        }

        let groq = var("GROQ_API_KEY").filter(|k| !k.is_empty());
        let openai = var("OPENAI_API_KEY").filter(|k| !k.is_empty());

        if let Some(key) = groq.clone().or_else(|| openai.clone()) {
            self.llm.api_key = Some(SecretString::from(key));
        }
        if let Some(model) = var("IMMY_LLM_MODEL") {
            self.llm.model = model;
        }
        if let Some(url) = var("IMMY_LLM_URL") {
            self.llm.base_url = url;
        }

        if let Some(key) = groq.or(openai) {
            self.stt.api_key = Some(SecretString::from(key));
        }
        if let Some(url) = var("IMMY_STT_URL") {
            self.stt.url = url;
        }
        if let Some(model) = var("IMMY_STT_MODEL") {
            self.stt.model = model;
        }
    }

    /// Reject settings the pipeline cannot run with
    ///
    /// # Errors
    ///
    /// Returns error describing the first invalid setting
    pub fn validate(&self) -> Result<()> {
        if self.synthesis.initial_backoff_ms == 0 {
            return Err(Error::Config("synthesis.initial_backoff_ms must be > 0".to_string()));
        }
        if self.synthesis.max_backoff_ms < self.synthesis.initial_backoff_ms {
            return Err(Error::Config(
                "synthesis.max_backoff_ms must be >= initial_backoff_ms".to_string(),
            ));
        }
        if self.synthesis.heartbeat_secs == 0 {
            return Err(Error::Config("synthesis.heartbeat_secs must be > 0".to_string()));
        }
        if self.synthesis.outbound_capacity == 0 {
            return Err(Error::Config("synthesis.outbound_capacity must be > 0".to_string()));
        }
        if self.playback.high_water_mark == 0 {
            return Err(Error::Config("playback.high_water_mark must be > 0".to_string()));
        }
        if self.playback.poll_interval_ms == 0 {
            return Err(Error::Config("playback.poll_interval_ms must be > 0".to_string()));
        }
        if self.session.hold_queue_capacity == 0 {
            return Err(Error::Config("session.hold_queue_capacity must be > 0".to_string()));
        }
        if self.session.event_capacity == 0 {
            return Err(Error::Config("session.event_capacity must be > 0".to_string()));
        }
        self.synthesis.stream_url()?;
        Ok(())
    }
}
