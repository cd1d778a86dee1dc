//! Persistent connection to the streaming synthesis backend
//!
//! A supervisor task owns the transport. It dials, writes the configuration
//! message, then runs a single loop that reads audio, writes queued units and
//! sends heartbeat pings. Any failure drops the transport and retries with
//! exponential backoff until [`SynthesisConnection::close`] is called.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::backoff::Backoff;
use super::protocol::{self, END_OF_STREAM, POLICY_VIOLATION, ServerEvent};
use super::segmenter::SpeechUnit;
use super::transport::{Connector, FrameSink, FrameStream, WireFrame};
use crate::config::SynthesisConfig;
use crate::{Error, Result};

/// Capacity of the event channel handed to the consumer
const EVENT_CAPACITY: usize = 256;

/// Extra time given to the supervisor beyond the close timeout
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Lifecycle of the connection
///
/// Only `Open` accepts units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport and no attempt in progress
    Disconnected,
    /// Dialing the backend
    Connecting,
    /// Writing the configuration message
    Handshaking,
    /// Ready for units
    Open,
    /// Waiting out the backoff delay after a failure
    Reconnecting,
    /// Polite shutdown in progress
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::Open => "open",
            Self::Reconnecting => "reconnecting",
            Self::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Encoded audio received from the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    /// Receipt order, continues across reconnects
    pub seq: u64,
    /// Encoded audio bytes
    pub data: Vec<u8>,
    /// Last frame of the current unit
    pub end_of_unit: bool,
}

impl AudioFrame {
    /// Zero-length frame marking the end of a unit
    #[must_use]
    pub fn is_marker(&self) -> bool {
        self.end_of_unit && self.data.is_empty()
    }
}

/// Output of the connection
#[derive(Debug)]
pub enum SynthesisEvent {
    /// Audio in receipt order
    Audio(AudioFrame),
    /// The backend reported an error for the current unit
    UnitFailed(String),
    /// The connection stopped for good
    Fatal(Error),
}

/// Item queued for the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Text to synthesize
    Unit(SpeechUnit),
    /// End of the current reply
    EndOfReply,
}

/// Connection counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Times the connection entered `Reconnecting`
    pub reconnects: u64,
    /// Audio frames delivered, markers included
    pub frames_received: u64,
    /// Units written to the transport
    pub units_sent: u64,
    /// Malformed messages skipped
    pub protocol_errors: u64,
    /// Error payloads for individual units
    pub unit_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    reconnects: AtomicU64,
    frames_received: AtomicU64,
    units_sent: AtomicU64,
    protocol_errors: AtomicU64,
    unit_failures: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ConnectionStats {
        ConnectionStats {
            reconnects: self.reconnects.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            units_sent: self.units_sent.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            unit_failures: self.unit_failures.load(Ordering::Relaxed),
        }
    }
}

/// Handle to the supervised connection
pub struct SynthesisConnection {
    outbound: mpsc::Sender<Outbound>,
    state: watch::Receiver<ConnectionState>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    counters: Arc<Counters>,
    close_timeout: Duration,
}

impl SynthesisConnection {
    /// Start the supervisor and return the handle plus its event stream
    ///
    /// # Errors
    ///
    /// Returns error if the configuration message cannot be built
    pub fn open<C: Connector>(
        config: &SynthesisConfig,
        connector: C,
    ) -> Result<(Self, mpsc::Receiver<SynthesisEvent>)> {
        let init = protocol::init_message(config)?;

        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        let counters = Arc::new(Counters::default());

        let supervisor = Supervisor {
            connector,
            init,
            backoff: Backoff::from_config(config),
            heartbeat: config.heartbeat_interval(),
            connect_timeout: config.connect_timeout(),
            close_timeout: config.close_timeout(),
            state: state_tx,
            events: event_tx,
            outbound: outbound_rx,
            shutdown: shutdown_rx,
            counters: Arc::clone(&counters),
            seq: 0,
            unsent: None,
        };

        let task = tokio::spawn(supervisor.run());

        let connection = Self {
            outbound: outbound_tx,
            state: state_rx,
            shutdown: shutdown_tx,
            task: Mutex::new(Some(task)),
            closed: AtomicBool::new(false),
            counters,
            close_timeout: config.close_timeout(),
        };

        Ok((connection, event_rx))
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state transitions
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Whether units are currently accepted
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Queue a unit for synthesis
    ///
    /// # Errors
    ///
    /// Returns `Error::NotConnected` unless the connection is open
    pub async fn send_unit(&self, unit: &SpeechUnit) -> Result<()> {
        self.send(Outbound::Unit(unit.clone())).await
    }

    /// Queue the end-of-reply marker
    ///
    /// # Errors
    ///
    /// Returns `Error::NotConnected` unless the connection is open
    pub async fn end_reply(&self) -> Result<()> {
        self.send(Outbound::EndOfReply).await
    }

    /// Queue an outbound item
    ///
    /// Accepted items are written in order, and an item whose write fails is
    /// written again first after the next reconnect.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotConnected` unless the connection is open
    pub async fn send(&self, item: Outbound) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) || !self.is_open() {
            return Err(Error::NotConnected);
        }
        self.outbound
            .send(item)
            .await
            .map_err(|_| Error::NotConnected)
    }

    /// Stop the connection
    ///
    /// Sends the end-of-stream marker and a close frame if open, then waits
    /// for the supervisor. Later calls return immediately.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        tracing::debug!(state = %self.state(), "closing synthesis connection");
        self.shutdown.send_replace(true);

        let Some(mut task) = self.task.lock().await.take() else {
            return;
        };

        let limit = self.close_timeout + CLOSE_GRACE;
        if tokio::time::timeout(limit, &mut task).await.is_err() {
            tracing::warn!(timeout_ms = limit.as_millis(), "supervisor did not stop, aborting");
            task.abort();
        }
    }

    /// Whether `close` has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Counter snapshot
    #[must_use]
    pub fn stats(&self) -> ConnectionStats {
        self.counters.snapshot()
    }
}

impl fmt::Debug for SynthesisConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SynthesisConnection")
            .field("state", &self.state())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// How a served session ended
enum SessionEnd {
    /// `close` was called
    Shutdown,
    /// Backend closed normally after the reply ended
    Finished,
    /// Anything else
    Failed(Error),
}

struct Supervisor<C> {
    connector: C,
    init: String,
    backoff: Backoff,
    heartbeat: Duration,
    connect_timeout: Duration,
    close_timeout: Duration,
    state: watch::Sender<ConnectionState>,
    events: mpsc::Sender<SynthesisEvent>,
    outbound: mpsc::Receiver<Outbound>,
    shutdown: watch::Receiver<bool>,
    counters: Arc<Counters>,
    seq: u64,
    unsent: Option<Outbound>,
}

impl<C: Connector> Supervisor<C> {
    async fn run(mut self) {
        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let failure = match self.connect().await {
                Ok(Some((sink, stream))) => {
                    self.backoff.reset();
                    self.set_state(ConnectionState::Open);
                    tracing::info!("synthesis connection open");

                    match self.serve(sink, stream).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Finished => {
                            // Backend ends the stream after each reply
                            self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
                            self.set_state(ConnectionState::Reconnecting);
                            continue;
                        }
                        SessionEnd::Failed(err) => err,
                    }
                }
                Ok(None) => break,
                Err(err) => err,
            };

            if matches!(failure, Error::Auth(_)) {
                tracing::error!(error = %failure, "synthesis backend rejected credential");
                self.set_state(ConnectionState::Disconnected);
                self.emit(SynthesisEvent::Fatal(failure)).await;
                return;
            }

            self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
            self.set_state(ConnectionState::Reconnecting);

            let Some(delay) = self.backoff.next_delay() else {
                let attempts = self.backoff.attempts();
                tracing::error!(error = %failure, attempts, "giving up on synthesis backend");
                self.set_state(ConnectionState::Disconnected);
                self.emit(SynthesisEvent::Fatal(Error::RetriesExhausted(attempts)))
                    .await;
                return;
            };

            tracing::warn!(
                error = %failure,
                attempt = self.backoff.attempts(),
                delay_ms = delay.as_millis(),
                "synthesis connection failed, retrying"
            );

            tokio::select! {
                biased;
                () = wait_shutdown(&mut self.shutdown) => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(ConnectionState::Disconnected);
        tracing::debug!("synthesis supervisor stopped");
    }

    /// Dial and write the configuration message
    ///
    /// Returns `Ok(None)` if shutdown was requested while dialing.
    async fn connect(&mut self) -> Result<Option<(FrameSink, FrameStream)>> {
        self.set_state(ConnectionState::Connecting);

        let timeout = self.connect_timeout;
        let dial = tokio::time::timeout(timeout, self.connector.connect());

        let dialed = tokio::select! {
            biased;
            () = wait_shutdown(&mut self.shutdown) => return Ok(None),
            result = dial => result,
        };
        let (mut sink, stream) = dialed.map_err(|_| Error::Timeout(timeout))??;

        self.set_state(ConnectionState::Handshaking);

        let frame = WireFrame::Text(self.init.clone());
        tokio::time::timeout(timeout, sink.send(frame))
            .await
            .map_err(|_| Error::Timeout(timeout))??;

        Ok(Some((sink, stream)))
    }

    /// Run one open session until it fails or shutdown is requested
    async fn serve(&mut self, mut sink: FrameSink, mut stream: FrameStream) -> SessionEnd {
        let mut heartbeat = tokio::time::interval_at(Instant::now() + self.heartbeat, self.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut awaiting_pong = false;
        let mut reply_ended = false;

        if let Some(item) = self.unsent.take() {
            tracing::debug!("resending item from failed session");
            if let Err(e) = self.write(&mut sink, item, &mut reply_ended).await {
                return SessionEnd::Failed(e);
            }
        }

        loop {
            tokio::select! {
                biased;
                () = wait_shutdown(&mut self.shutdown) => {
                    self.close_politely(sink).await;
                    return SessionEnd::Shutdown;
                }
                frame = stream.next() => match frame {
                    Some(Ok(frame)) => {
                        if let Some(end) = self
                            .handle_frame(frame, &mut sink, &mut awaiting_pong, reply_ended)
                            .await
                        {
                            return end;
                        }
                    }
                    Some(Err(e)) => return SessionEnd::Failed(e),
                    None => {
                        return SessionEnd::Failed(Error::Transport(
                            "connection closed by backend".to_string(),
                        ));
                    }
                },
                Some(item) = self.outbound.recv() => {
                    if let Err(e) = self.write(&mut sink, item, &mut reply_ended).await {
                        return SessionEnd::Failed(e);
                    }
                }
                _ = heartbeat.tick() => {
                    if awaiting_pong {
                        return SessionEnd::Failed(Error::Transport(
                            "heartbeat not answered".to_string(),
                        ));
                    }
                    if let Err(e) = sink.send(WireFrame::Ping(Vec::new())).await {
                        return SessionEnd::Failed(e);
                    }
                    tracing::trace!("heartbeat ping");
                    awaiting_pong = true;
                }
            }
        }
    }

    async fn write(
        &mut self,
        sink: &mut FrameSink,
        item: Outbound,
        reply_ended: &mut bool,
    ) -> Result<()> {
        let text = match &item {
            Outbound::Unit(unit) => match protocol::unit_message(unit) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unit that cannot be encoded");
                    return Ok(());
                }
            },
            Outbound::EndOfReply => END_OF_STREAM.to_string(),
        };

        if let Err(e) = sink.send(WireFrame::Text(text)).await {
            self.unsent = Some(item);
            return Err(e);
        }

        match item {
            Outbound::Unit(unit) => {
                self.counters.units_sent.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(chars = unit.len(), "unit sent");
            }
            Outbound::EndOfReply => {
                *reply_ended = true;
                tracing::debug!("end of reply sent");
            }
        }
        Ok(())
    }

    /// Process one inbound frame; `Some` ends the session
    async fn handle_frame(
        &mut self,
        frame: WireFrame,
        sink: &mut FrameSink,
        awaiting_pong: &mut bool,
        reply_ended: bool,
    ) -> Option<SessionEnd> {
        match frame {
            WireFrame::Text(text) => match protocol::decode(&text) {
                Ok(ServerEvent::Audio { data, is_final }) => {
                    let empty = data.is_empty();
                    if !empty {
                        self.deliver(data, false).await;
                    }
                    if is_final || empty {
                        self.deliver(Vec::new(), true).await;
                    }
                }
                Ok(ServerEvent::Failure { message, auth: true }) => {
                    return Some(SessionEnd::Failed(Error::Auth(message)));
                }
                Ok(ServerEvent::Failure { message, auth: false }) => {
                    self.counters.unit_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(reason = %message, "backend failed to synthesize unit");
                    self.emit(SynthesisEvent::UnitFailed(message)).await;
                }
                Err(e) => {
                    self.counters.protocol_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = %e, "skipping malformed message");
                }
            },
            WireFrame::Binary(data) => {
                let end_of_unit = data.is_empty();
                self.deliver(data, end_of_unit).await;
            }
            WireFrame::Ping(payload) => {
                if let Err(e) = sink.send(WireFrame::Pong(payload)).await {
                    return Some(SessionEnd::Failed(e));
                }
            }
            WireFrame::Pong(_) => *awaiting_pong = false,
            WireFrame::Close { code, reason } => {
                // Idle timeouts also use 1008, but name themselves in the reason
                if code == POLICY_VIOLATION
                    && (reason.is_empty() || protocol::is_auth_failure(&reason))
                {
                    return Some(SessionEnd::Failed(Error::Auth(format!(
                        "closed by backend ({code}): {reason}"
                    ))));
                }
                if code == 1000 && reply_ended {
                    tracing::info!("synthesis stream finished");
                    return Some(SessionEnd::Finished);
                }
                return Some(SessionEnd::Failed(Error::Transport(format!(
                    "closed by backend ({code}): {reason}"
                ))));
            }
        }
        None
    }

    async fn deliver(&mut self, data: Vec<u8>, end_of_unit: bool) {
        let frame = AudioFrame {
            seq: self.seq,
            data,
            end_of_unit,
        };
        self.seq += 1;
        self.counters.frames_received.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(seq = frame.seq, bytes = frame.data.len(), end_of_unit, "audio frame");
        self.emit(SynthesisEvent::Audio(frame)).await;
    }

    async fn close_politely(&mut self, mut sink: FrameSink) {
        self.set_state(ConnectionState::Closing);

        let close = async {
            sink.send(WireFrame::Text(END_OF_STREAM.to_string())).await?;
            sink.close().await
        };

        match tokio::time::timeout(self.close_timeout, close).await {
            Ok(Ok(())) => tracing::debug!("synthesis connection closed"),
            Ok(Err(e)) => tracing::debug!(error = %e, "error during close"),
            Err(_) => tracing::warn!("timed out closing synthesis connection"),
        }
    }

    async fn emit(&self, event: SynthesisEvent) {
        if self.events.send(event).await.is_err() {
            tracing::trace!("synthesis event receiver dropped");
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(from = %previous, to = %next, "connection state");
        }
    }
}

/// Resolve once shutdown is requested or the handle is gone
async fn wait_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_is_empty_end_of_unit() {
        let marker = AudioFrame {
            seq: 3,
            data: Vec::new(),
            end_of_unit: true,
        };
        assert!(marker.is_marker());

        let audio = AudioFrame {
            seq: 4,
            data: vec![1],
            end_of_unit: true,
        };
        assert!(!audio.is_marker());
    }

    #[test]
    fn state_names() {
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
        assert_eq!(ConnectionState::Open.to_string(), "open");
    }

    #[tokio::test]
    async fn shutdown_resolves_when_sender_dropped() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        tokio_test::assert_ready!(tokio_test::task::spawn(wait_shutdown(&mut rx)).poll());
    }
}
