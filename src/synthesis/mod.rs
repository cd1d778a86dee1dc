//! Streaming speech synthesis
//!
//! Text is split into sentence units, sent over one long-lived connection,
//! and audio comes back as ordered frames.

pub mod backoff;
pub mod connection;
pub mod protocol;
pub mod segmenter;
pub mod transport;

pub use backoff::Backoff;
pub use connection::{
    AudioFrame, ConnectionState, ConnectionStats, Outbound, SynthesisConnection, SynthesisEvent,
};
pub use segmenter::{SpeechUnit, TextSegmenter};
pub use transport::{Connector, FrameSink, FrameStream, WebSocketConnector, WireFrame};
