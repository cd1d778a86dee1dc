//! Shared test utilities
//!
//! An in-memory synthesis backend and a recording audio player, so the
//! pipeline runs without network or audio hardware.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use futures::channel::mpsc as wire;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;

use immy::config::SynthesisConfig;
use immy::synthesis::{Connector, FrameSink, FrameStream, SynthesisEvent, WireFrame};
use immy::{Config, Error, Player, Result};

/// What the next connection attempt does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    /// Fail like an unreachable host
    Refuse,
    /// Fail like a rejected credential
    RejectAuth,
    /// Hand out a new in-memory peer
    Accept,
}

/// Connector that follows a script, then accepts every attempt
#[derive(Clone)]
pub struct MockConnector {
    script: Arc<Mutex<VecDeque<Attempt>>>,
    attempts: Arc<Mutex<Vec<Instant>>>,
    peers: mpsc::UnboundedSender<ServerPeer>,
}

impl MockConnector {
    /// Create a connector and the receiver of the server side of each accepted connection
    pub fn new(
        script: impl IntoIterator<Item = Attempt>,
    ) -> (Self, mpsc::UnboundedReceiver<ServerPeer>) {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        let connector = Self {
            script: Arc::new(Mutex::new(script.into_iter().collect())),
            attempts: Arc::new(Mutex::new(Vec::new())),
            peers: peers_tx,
        };
        (connector, peers_rx)
    }

    /// When each attempt was made
    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<(FrameSink, FrameStream)> {
        self.attempts.lock().unwrap().push(Instant::now());
        let attempt = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Attempt::Accept);

        match attempt {
            Attempt::Refuse => Err(Error::Transport("connection refused".to_string())),
            Attempt::RejectAuth => Err(Error::Auth("HTTP 401: invalid api key".to_string())),
            Attempt::Accept => {
                let (to_server, from_client) = wire::unbounded();
                let (to_client, from_server) = wire::unbounded();

                let sink = to_server.sink_map_err(|e| Error::Transport(e.to_string()));
                let _ = self.peers.send(ServerPeer {
                    inbound: from_client,
                    outbound: to_client,
                });

                Ok((Box::pin(sink), Box::pin(from_server)))
            }
        }
    }
}

/// Server side of one accepted connection
///
/// Dropping it ends the client's inbound stream.
pub struct ServerPeer {
    inbound: wire::UnboundedReceiver<WireFrame>,
    outbound: wire::UnboundedSender<Result<WireFrame>>,
}

impl ServerPeer {
    /// Next frame from the client, `None` once the client has gone
    pub async fn recv(&mut self) -> Option<WireFrame> {
        self.inbound.next().await
    }

    /// Next text message, skipping keep-alives
    pub async fn recv_text(&mut self) -> Option<String> {
        while let Some(frame) = self.recv().await {
            if let WireFrame::Text(text) = frame {
                return Some(text);
            }
        }
        None
    }

    pub fn send(&self, frame: WireFrame) {
        let _ = self.outbound.unbounded_send(Ok(frame));
    }

    pub fn send_audio(&self, bytes: &[u8]) {
        let audio = base64::engine::general_purpose::STANDARD.encode(bytes);
        let message = serde_json::json!({ "audio": audio, "isFinal": false });
        self.send(WireFrame::Text(message.to_string()));
    }

    pub fn send_final(&self) {
        let message = serde_json::json!({ "audio": null, "isFinal": true });
        self.send(WireFrame::Text(message.to_string()));
    }

    pub fn send_error(&self, error: &str, detail: &str) {
        let message = serde_json::json!({ "error": error, "message": detail });
        self.send(WireFrame::Text(message.to_string()));
    }

    pub fn close(&self, code: u16, reason: &str) {
        self.send(WireFrame::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

/// The `text` field of a client message
pub fn unit_text(message: &str) -> String {
    let json: serde_json::Value = serde_json::from_str(message).unwrap();
    json["text"].as_str().unwrap().to_string()
}

/// Behave like the real backend on every accepted connection
///
/// Each unit comes back as audio holding the unit's own text, and the end of
/// a reply is answered with the final marker and a normal close. Returns the
/// unit texts received, in order.
pub fn spawn_backend(mut peers: mpsc::UnboundedReceiver<ServerPeer>) -> Arc<Mutex<Vec<String>>> {
    let received = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&received);

    tokio::spawn(async move {
        while let Some(peer) = peers.recv().await {
            tokio::spawn(echo(peer, Arc::clone(&log)));
        }
    });

    received
}

async fn echo(mut peer: ServerPeer, log: Arc<Mutex<Vec<String>>>) {
    while let Some(frame) = peer.recv().await {
        match frame {
            WireFrame::Text(message) => {
                let text = unit_text(&message);
                if text.is_empty() {
                    peer.send_final();
                    peer.close(1000, "");
                } else if !text.trim().is_empty() {
                    log.lock().unwrap().push(text.clone());
                    peer.send_audio(text.as_bytes());
                }
            }
            WireFrame::Ping(payload) => peer.send(WireFrame::Pong(payload)),
            _ => {}
        }
    }
}

/// Calls made on a [`MockPlayer`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerCall {
    Play(Vec<u8>),
    Stop,
}

/// Player that records what it was asked to play
///
/// In stalling mode every batch keeps the player busy until `finish` or
/// `stop`.
#[derive(Clone, Default)]
pub struct MockPlayer {
    calls: Arc<Mutex<Vec<PlayerCall>>>,
    stall: Arc<AtomicBool>,
    busy: Arc<AtomicBool>,
}

impl MockPlayer {
    pub fn stalling() -> Self {
        let player = Self::default();
        player.set_stall(true);
        player
    }

    pub fn set_stall(&self, stall: bool) {
        self.stall.store(stall, Ordering::SeqCst);
    }

    /// Let the batch in progress finish playing
    pub fn finish(&self) {
        self.busy.store(false, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<PlayerCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn played(&self) -> Vec<Vec<u8>> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                PlayerCall::Play(bytes) => Some(bytes),
                PlayerCall::Stop => None,
            })
            .collect()
    }

    /// Everything played, joined
    pub fn played_text(&self) -> String {
        String::from_utf8(self.played().concat()).unwrap()
    }
}

impl Player for MockPlayer {
    type Handle = Vec<u8>;

    fn load(&mut self, bytes: &[u8]) -> Result<Self::Handle> {
        Ok(bytes.to_vec())
    }

    fn play(&mut self, handle: Self::Handle) -> Result<()> {
        self.calls.lock().unwrap().push(PlayerCall::Play(handle));
        if self.stall.load(Ordering::SeqCst) {
            self.busy.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    fn stop(&mut self) {
        self.calls.lock().unwrap().push(PlayerCall::Stop);
        self.busy.store(false, Ordering::SeqCst);
    }
}

/// Fast reconnects and short waits
pub fn synthesis_config() -> SynthesisConfig {
    SynthesisConfig {
        initial_backoff_ms: 100,
        max_backoff_ms: 800,
        heartbeat_secs: 30,
        connect_timeout_secs: 5,
        close_timeout_secs: 1,
        ..SynthesisConfig::default()
    }
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.synthesis = synthesis_config();
    config.playback.poll_interval_ms = 5;
    config.playback.drain_timeout_secs = 5;
    config.session.reply_timeout_secs = 5;
    config
}

/// Poll until `condition` holds, failing the test after five seconds
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

/// Next synthesis event, failing the test if none arrives
pub async fn next_event(events: &mut mpsc::Receiver<SynthesisEvent>) -> SynthesisEvent {
    tokio::time::timeout(Duration::from_secs(60), events.recv())
        .await
        .expect("timed out waiting for synthesis event")
        .expect("synthesis event channel closed")
}
