//! Byte transport under the synthesis connection
//!
//! The connection works in terms of [`WireFrame`]s so the WebSocket can be
//! swapped for an in-memory peer in tests.

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt, future};
use tokio_tungstenite::tungstenite::{self, Message, protocol::CloseFrame};

use crate::config::SynthesisConfig;
use crate::{Error, Result};

/// One message on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    /// UTF-8 text
    Text(String),
    /// Raw bytes
    Binary(Vec<u8>),
    /// Keep-alive probe
    Ping(Vec<u8>),
    /// Keep-alive reply
    Pong(Vec<u8>),
    /// Close handshake
    Close {
        /// Close code (1000 is a normal close)
        code: u16,
        /// Reason given by the peer
        reason: String,
    },
}

impl WireFrame {
    /// Normal close with no reason
    #[must_use]
    pub const fn normal_close() -> Self {
        Self::Close {
            code: 1000,
            reason: String::new(),
        }
    }

    fn from_message(message: Message) -> Option<Self> {
        match message {
            Message::Text(text) => Some(Self::Text(text.as_str().to_string())),
            Message::Binary(data) => Some(Self::Binary(data.to_vec())),
            Message::Ping(data) => Some(Self::Ping(data.to_vec())),
            Message::Pong(data) => Some(Self::Pong(data.to_vec())),
            Message::Close(frame) => Some(frame.map_or_else(
                || Self::Close {
                    code: 1005,
                    reason: String::new(),
                },
                |f| Self::Close {
                    code: f.code.into(),
                    reason: f.reason.as_str().to_string(),
                },
            )),
            Message::Frame(_) => None,
        }
    }
}

impl From<WireFrame> for Message {
    fn from(frame: WireFrame) -> Self {
        match frame {
            WireFrame::Text(text) => Self::text(text),
            WireFrame::Binary(data) => Self::binary(data),
            WireFrame::Ping(data) => Self::Ping(data.into()),
            WireFrame::Pong(data) => Self::Pong(data.into()),
            WireFrame::Close { code, reason } => Self::Close(Some(CloseFrame {
                code: code.into(),
                reason: reason.into(),
            })),
        }
    }
}

/// Outbound half of a transport
pub type FrameSink = Pin<Box<dyn Sink<WireFrame, Error = Error> + Send>>;

/// Inbound half of a transport
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<WireFrame>> + Send>>;

/// Opens transports to the synthesis backend
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Dial the backend and complete the transport-level handshake
    ///
    /// # Errors
    ///
    /// Returns `Error::Auth` if the backend rejects the credential, or a
    /// transport error for anything else
    async fn connect(&self) -> Result<(FrameSink, FrameStream)>;
}

/// Connector for the backend's `stream-input` WebSocket
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: url::Url,
}

impl WebSocketConnector {
    /// Create a connector for the configured voice
    ///
    /// # Errors
    ///
    /// Returns error if the base URL is invalid
    pub fn new(config: &SynthesisConfig) -> Result<Self> {
        Ok(Self {
            url: config.stream_url()?,
        })
    }

    /// Endpoint this connector dials
    #[must_use]
    pub const fn url(&self) -> &url::Url {
        &self.url
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<(FrameSink, FrameStream)> {
        tracing::debug!(url = %redacted(&self.url), "dialing synthesis backend");

        let (socket, response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(classify)?;

        tracing::debug!(status = %response.status(), "websocket upgraded");

        let (sink, stream) = socket.split();

        let sink = sink
            .sink_map_err(classify)
            .with(|frame: WireFrame| future::ready(Ok::<_, Error>(Message::from(frame))));

        let stream = stream.filter_map(|message| {
            future::ready(match message {
                Ok(message) => WireFrame::from_message(message).map(Ok),
                Err(e) => Some(Err(classify(e))),
            })
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

/// Map a WebSocket error onto the pipeline's error kinds
fn classify(err: tungstenite::Error) -> Error {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status();
            if status.as_u16() == 401 || status.as_u16() == 403 {
                Error::Auth(format!("handshake rejected with status {status}"))
            } else {
                Error::Transport(format!("handshake rejected with status {status}"))
            }
        }
        tungstenite::Error::Io(e) => Error::Transport(e.to_string()),
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            Error::Transport("connection closed".to_string())
        }
        other => Error::WebSocket(other),
    }
}

/// URL without the query string, for logs
fn redacted(url: &url::Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.to_string()
}
