//! immy - Realtime voice assistant
//!
//! Speaks language model replies while they are still being generated:
//! - Sentence segmentation of streamed reply text
//! - One persistent streaming TTS connection with reconnect and heartbeat
//! - Ordered, bounded audio playback
//! - Turn orchestration: listen, transcribe, reply, speak
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │              Speech input  →  Reply source            │
//! │   Microphone / stdin       │   Chat completions (SSE) │
//! └────────────────────┬─────────────────────────────────┘
//!                      │ text fragments
//! ┌────────────────────▼─────────────────────────────────┐
//! │               PipelineOrchestrator                    │
//! │  TextSegmenter → hold queue → SynthesisConnection    │
//! └────────────────────┬─────────────────────────────────┘
//!                      │ audio frames
//! ┌────────────────────▼─────────────────────────────────┐
//! │           AudioSink  →  Player (speakers)             │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod llm;
pub mod session;
pub mod synthesis;
pub mod voice;

pub use config::Config;
pub use error::{Error, Result};
pub use llm::{ChatClient, Reply, ReplySource};
pub use session::{
    PipelineOrchestrator, ReplyTimings, SessionEvent, SessionHandle, SessionState,
};
pub use synthesis::{
    AudioFrame, ConnectionState, SynthesisConnection, SynthesisEvent, TextSegmenter,
    WebSocketConnector,
};
pub use voice::{AudioSink, DevicePlayer, Player, SpeechInput};
