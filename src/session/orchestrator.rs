//! Pipeline orchestration
//!
//! Reply text goes through the segmenter into the synthesis connection, and
//! the connection's audio goes into the sink. While the connection is not
//! open, units wait in a bounded hold queue and are replayed in order once it
//! reopens.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::hold_queue::HoldQueue;
use super::{ReplyTimings, SessionEvent, SessionHandle, SessionState};
use crate::config::Config;
use crate::llm::{Reply, ReplySource};
use crate::synthesis::{
    ConnectionState, Outbound, SynthesisConnection, SynthesisEvent, TextSegmenter,
};
use crate::voice::{AudioSink, SpeechInput};
use crate::{Error, Result};

/// Text of the reply not yet segmented
enum Fragments {
    Once(Option<String>),
    Stream(mpsc::Receiver<Result<String>>),
}

impl Fragments {
    async fn next(&mut self) -> Option<Result<String>> {
        match self {
            Self::Once(text) => text.take().map(Ok),
            Self::Stream(rx) => rx.recv().await,
        }
    }
}

impl From<Reply> for Fragments {
    fn from(reply: Reply) -> Self {
        match reply {
            Reply::Complete(text) => Self::Once(Some(text)),
            Reply::Stream(rx) => Self::Stream(rx),
        }
    }
}

/// What the current reply has put on the wire
#[derive(Debug, Default, Clone, Copy)]
struct Progress {
    markers_at_start: u64,
    units_sent: usize,
    end_sent: bool,
    first_text: Option<Instant>,
}

impl Progress {
    fn record(&mut self, item: &Outbound) {
        match item {
            Outbound::Unit(_) => self.units_sent += 1,
            Outbound::EndOfReply => self.end_sent = true,
        }
    }
}

/// How a wait inside a reply ended early
enum Stop {
    Interrupted,
    Fatal(Error),
}

/// Runs conversation turns over one connection and one sink
pub struct PipelineOrchestrator {
    connection: SynthesisConnection,
    sink: Arc<AudioSink>,
    segmenter: TextSegmenter,
    hold: HoldQueue<Outbound>,
    handle: SessionHandle,
    events: broadcast::Sender<SessionEvent>,
    markers: watch::Receiver<u64>,
    fatal: mpsc::Receiver<Error>,
    muted: Arc<AtomicBool>,
    first_audio: Arc<Mutex<Option<Instant>>>,
    progress: Progress,
    reply_timeout: Duration,
    drain_timeout: Duration,
    tasks: Vec<JoinHandle<()>>,
}

impl PipelineOrchestrator {
    /// Wire a connection and its events to a sink
    ///
    /// Spawns the audio pump and the connection status forwarder.
    #[must_use]
    pub fn new(
        config: &Config,
        connection: SynthesisConnection,
        synthesis_events: mpsc::Receiver<SynthesisEvent>,
        sink: AudioSink,
    ) -> Self {
        let (events, _) = broadcast::channel(config.session.event_capacity.max(1));
        let (markers_tx, markers_rx) = watch::channel(0u64);
        let (fatal_tx, fatal_rx) = mpsc::channel(4);
        let sink = Arc::new(sink);
        let muted = Arc::new(AtomicBool::new(false));
        let first_audio = Arc::new(Mutex::new(None));

        let pump = AudioPump {
            sink: Arc::clone(&sink),
            markers: markers_tx,
            fatal: fatal_tx,
            events: events.clone(),
            muted: Arc::clone(&muted),
            first_audio: Arc::clone(&first_audio),
        };
        let pump = tokio::spawn(pump.run(synthesis_events, connection.subscribe()));
        let forwarder = tokio::spawn(forward_connection_state(
            connection.subscribe(),
            events.clone(),
        ));

        Self {
            connection,
            sink,
            segmenter: TextSegmenter::new(),
            hold: HoldQueue::new(config.session.hold_queue_capacity),
            handle: SessionHandle::new(),
            events,
            markers: markers_rx,
            fatal: fatal_rx,
            muted,
            first_audio,
            progress: Progress::default(),
            reply_timeout: config.session.reply_timeout(),
            drain_timeout: config.playback.drain_timeout(),
            tasks: vec![pump, forwarder],
        }
    }

    /// Control handle for interrupting or cancelling from another task
    #[must_use]
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Subscribe to status events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Current session state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.handle.state()
    }

    /// The synthesis connection
    #[must_use]
    pub const fn connection(&self) -> &SynthesisConnection {
        &self.connection
    }

    /// The audio sink
    #[must_use]
    pub fn sink(&self) -> &AudioSink {
        &self.sink
    }

    /// Run one listen, transcribe, reply and speak cycle
    ///
    /// The session is idle again when this returns, whatever the outcome.
    ///
    /// # Errors
    ///
    /// Returns the input, transcription or upstream error that ended the
    /// turn, or a fatal synthesis error
    pub async fn run_turn(
        &mut self,
        input: &dyn SpeechInput,
        replies: &dyn ReplySource,
    ) -> Result<()> {
        let result = self.turn(input, replies).await;
        if let Err(e) = &result {
            self.emit(SessionEvent::Error(e.to_string()));
        }
        self.set_state(SessionState::Idle);
        result
    }

    async fn turn(&mut self, input: &dyn SpeechInput, replies: &dyn ReplySource) -> Result<()> {
        if let Ok(err) = self.fatal.try_recv() {
            return Err(err);
        }

        self.set_state(SessionState::Listening);
        let utterance = input.listen().await?;

        self.set_state(SessionState::Transcribing);
        let started = Instant::now();
        let text = input.transcribe(utterance).await?;
        let transcription = started.elapsed();
        tracing::info!(transcript = %text, elapsed_ms = millis(transcription), "user said");
        self.emit(SessionEvent::Transcript(text.clone()));

        let requested = Instant::now();
        let reply = replies.reply(&text).await?;
        self.deliver(reply, requested, Some(transcription)).await
    }

    /// Speak plain text as one reply
    ///
    /// # Errors
    ///
    /// Returns a fatal synthesis error
    pub async fn speak(&mut self, text: &str) -> Result<()> {
        self.speak_reply(Reply::Complete(text.to_string())).await
    }

    /// Stream a reply through the segmenter, connection and sink
    ///
    /// Returns once the reply has been played, or immediately after an
    /// interrupt.
    ///
    /// # Errors
    ///
    /// Returns `Error::Upstream` if the reply stream fails, or a fatal
    /// synthesis error
    pub async fn speak_reply(&mut self, reply: Reply) -> Result<()> {
        self.deliver(reply, Instant::now(), None).await
    }

    async fn deliver(
        &mut self,
        reply: Reply,
        requested: Instant,
        transcription: Option<Duration>,
    ) -> Result<()> {
        self.set_state(SessionState::Replying);
        self.progress = Progress {
            markers_at_start: *self.markers.borrow(),
            ..Progress::default()
        };
        if let Ok(mut first_audio) = self.first_audio.lock() {
            *first_audio = None;
        }

        let mut interrupts = self.handle.subscribe_interrupts();
        let mut connection = self.connection.subscribe();
        connection.borrow_and_update();

        let result = match self
            .stream_reply(reply.into(), &mut interrupts, &mut connection)
            .await
        {
            Ok(()) => Ok(()),
            Err(Stop::Interrupted) => {
                self.abandon().await;
                Ok(())
            }
            Err(Stop::Fatal(err)) => {
                self.segmenter.clear();
                self.hold.clear();
                // Audio already queued still plays out
                if let Err(e) = self.sink.drain(self.drain_timeout).await {
                    tracing::warn!(error = %e, "audio did not finish playing after failure");
                }
                Err(err)
            }
        };

        self.report_timings(requested, transcription);
        self.set_state(SessionState::Idle);
        result
    }

    async fn stream_reply(
        &mut self,
        mut fragments: Fragments,
        interrupts: &mut watch::Receiver<u64>,
        connection: &mut watch::Receiver<ConnectionState>,
    ) -> std::result::Result<(), Stop> {
        loop {
            tokio::select! {
                biased;
                Ok(()) = interrupts.changed() => return Err(Stop::Interrupted),
                Some(err) = self.fatal.recv() => return Err(Stop::Fatal(err)),
                Ok(()) = connection.changed() => self.on_connection_change(connection).await,
                fragment = fragments.next() => match fragment {
                    Some(Ok(text)) => {
                        if self.progress.first_text.is_none() {
                            self.progress.first_text = Some(Instant::now());
                        }
                        for unit in self.segmenter.feed(&text) {
                            self.dispatch(Outbound::Unit(unit)).await;
                        }
                    }
                    Some(Err(err)) => {
                        tracing::error!(error = %err, "reply stream failed");
                        let err = match err {
                            Error::Upstream(_) => err,
                            other => Error::Upstream(other.to_string()),
                        };
                        // Finish speaking the sentences that were complete
                        self.segmenter.clear();
                        self.finish_reply(interrupts, connection).await?;
                        return Err(Stop::Fatal(err));
                    }
                    None => break,
                },
            }
        }

        if let Some(unit) = self.segmenter.end_of_reply() {
            self.dispatch(Outbound::Unit(unit)).await;
        }
        self.finish_reply(interrupts, connection).await
    }

    /// End the reply on the wire and wait for its audio to play
    async fn finish_reply(
        &mut self,
        interrupts: &mut watch::Receiver<u64>,
        connection: &mut watch::Receiver<ConnectionState>,
    ) -> std::result::Result<(), Stop> {
        self.dispatch(Outbound::EndOfReply).await;

        self.await_hold_flushed(interrupts, connection).await?;
        self.await_synthesis(interrupts, connection).await?;
        self.await_playback(interrupts).await
    }

    /// Wait for held items to go out, bounded by the reply timeout
    async fn await_hold_flushed(
        &mut self,
        interrupts: &mut watch::Receiver<u64>,
        connection: &mut watch::Receiver<ConnectionState>,
    ) -> std::result::Result<(), Stop> {
        if self.hold.is_empty() {
            return Ok(());
        }

        tracing::debug!(held = self.hold.len(), "waiting for connection to flush held units");
        let deadline = Instant::now() + self.reply_timeout;

        while !self.hold.is_empty() {
            tokio::select! {
                biased;
                Ok(()) = interrupts.changed() => return Err(Stop::Interrupted),
                Some(err) = self.fatal.recv() => return Err(Stop::Fatal(err)),
                Ok(()) = connection.changed() => self.on_connection_change(connection).await,
                () = tokio::time::sleep_until(deadline) => {
                    let held = self.hold.len();
                    tracing::warn!(held, "connection did not reopen, discarding held units");
                    self.hold.clear();
                    self.emit(SessionEvent::ReplyAbandoned { held });
                }
            }
        }
        Ok(())
    }

    /// Wait until the backend has finished the reply
    ///
    /// Done when a new end-of-unit marker arrives or the connection leaves
    /// `Open`.
    async fn await_synthesis(
        &mut self,
        interrupts: &mut watch::Receiver<u64>,
        connection: &mut watch::Receiver<ConnectionState>,
    ) -> std::result::Result<(), Stop> {
        if !self.progress.end_sent {
            return Ok(());
        }

        let deadline = Instant::now() + self.drain_timeout;
        loop {
            if self.final_marker_seen() || *connection.borrow_and_update() != ConnectionState::Open {
                return Ok(());
            }

            tokio::select! {
                biased;
                Ok(()) = interrupts.changed() => return Err(Stop::Interrupted),
                Some(err) = self.fatal.recv() => return Err(Stop::Fatal(err)),
                Ok(()) = self.markers.changed() => {}
                Ok(()) = connection.changed() => {}
                () = tokio::time::sleep_until(deadline) => {
                    tracing::warn!("timed out waiting for synthesis to finish");
                    return Ok(());
                }
            }
        }
    }

    async fn await_playback(
        &mut self,
        interrupts: &mut watch::Receiver<u64>,
    ) -> std::result::Result<(), Stop> {
        let sink = Arc::clone(&self.sink);
        tokio::select! {
            biased;
            Ok(()) = interrupts.changed() => Err(Stop::Interrupted),
            Some(err) = self.fatal.recv() => Err(Stop::Fatal(err)),
            drained = sink.drain(self.drain_timeout) => {
                if let Err(e) = drained {
                    tracing::warn!(error = %e, "reply audio did not finish playing");
                }
                Ok(())
            }
        }
    }

    async fn on_connection_change(&mut self, connection: &mut watch::Receiver<ConnectionState>) {
        let state = *connection.borrow_and_update();
        if state == ConnectionState::Open && !self.hold.is_empty() {
            let held = self.hold.len();
            self.flush_hold().await;
            tracing::info!(replayed = held - self.hold.len(), "replayed held units");
        }
    }

    /// Queue an item behind anything already held, then send what we can
    async fn dispatch(&mut self, item: Outbound) {
        if let Outbound::Unit(unit) = &item {
            self.emit(SessionEvent::Speaking(unit.text().to_string()));
        }

        if let Some(dropped) = self.hold.push(item) {
            tracing::warn!(capacity = self.hold.capacity(), "hold queue full, dropping oldest unit");
            let text = match dropped {
                Outbound::Unit(unit) => unit.text().to_string(),
                Outbound::EndOfReply => String::new(),
            };
            self.emit(SessionEvent::UnitDropped(text));
        }

        self.flush_hold().await;

        if !self.hold.is_empty() {
            tracing::debug!(held = self.hold.len(), state = %self.connection.state(), "holding unit");
            self.emit(SessionEvent::UnitHeld {
                held: self.hold.len(),
            });
        }
    }

    /// Send held items in order until the connection refuses one
    async fn flush_hold(&mut self) {
        while let Some(item) = self.hold.front().cloned() {
            if self.connection.send(item.clone()).await.is_err() {
                break;
            }
            self.hold.pop_front();
            self.progress.record(&item);
        }
    }

    /// Drop the rest of an interrupted reply
    async fn abandon(&mut self) {
        self.segmenter.clear();
        let held = self.hold.len();
        self.hold.clear();

        // Audio for units already sent is still coming; ask the backend to
        // finish the stream and discard everything up to its final marker
        if self.progress.units_sent > 0 && !self.final_marker_seen() && self.connection.is_open() {
            let ended = self.progress.end_sent || self.connection.end_reply().await.is_ok();
            if ended {
                self.muted.store(true, Ordering::SeqCst);
            }
        }

        self.sink.flush_immediately();
        tracing::info!(held, "reply interrupted");
        self.emit(SessionEvent::Interrupted);
    }

    fn final_marker_seen(&self) -> bool {
        *self.markers.borrow() > self.progress.markers_at_start
    }

    fn report_timings(&self, requested: Instant, transcription: Option<Duration>) {
        let first_audio = self.first_audio.lock().ok().and_then(|at| *at);
        let timings = ReplyTimings {
            transcription,
            first_text: self
                .progress
                .first_text
                .map(|at| at.saturating_duration_since(requested)),
            first_audio: first_audio.map(|at| at.saturating_duration_since(requested)),
            total: requested.elapsed(),
        };

        tracing::info!(
            transcription_ms = timings.transcription.map(millis),
            first_text_ms = timings.first_text.map(millis),
            first_audio_ms = timings.first_audio.map(millis),
            total_ms = millis(timings.total),
            "reply timings"
        );
        self.emit(SessionEvent::Timing(timings));
    }

    /// End the session
    ///
    /// Interrupts any reply, closes the connection and flushes audio. Every
    /// wait is bounded.
    pub async fn shutdown(self) {
        tracing::debug!(state = %self.state(), "shutting down session");
        self.handle.cancel();
        self.connection.close().await;
        self.sink.flush_immediately();
        for task in &self.tasks {
            task.abort();
        }
        self.handle.set_state(SessionState::Idle);
    }

    fn set_state(&self, next: SessionState) {
        if self.handle.state() != next {
            self.handle.set_state(next);
            self.emit(SessionEvent::State(next));
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

/// Moves synthesis output into the sink
struct AudioPump {
    sink: Arc<AudioSink>,
    markers: watch::Sender<u64>,
    fatal: mpsc::Sender<Error>,
    events: broadcast::Sender<SessionEvent>,
    muted: Arc<AtomicBool>,
    first_audio: Arc<Mutex<Option<Instant>>>,
}

impl AudioPump {
    async fn run(
        self,
        mut synthesis: mpsc::Receiver<SynthesisEvent>,
        mut connection: watch::Receiver<ConnectionState>,
    ) {
        loop {
            // Audio already received from an abandoned stream is handled
            // before the state change that unmutes
            tokio::select! {
                biased;
                event = synthesis.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
                Ok(()) = connection.changed() => {
                    let state = *connection.borrow_and_update();
                    // A new session never carries audio from an abandoned reply
                    if state != ConnectionState::Open {
                        self.muted.store(false, Ordering::SeqCst);
                    }
                }
            }
        }
        tracing::debug!("audio pump stopped");
    }

    async fn handle(&self, event: SynthesisEvent) {
        match event {
            SynthesisEvent::Audio(frame) => {
                let end_of_unit = frame.end_of_unit;

                if self.muted.load(Ordering::SeqCst) {
                    if end_of_unit {
                        self.muted.store(false, Ordering::SeqCst);
                        self.markers.send_modify(|n| *n += 1);
                    }
                    tracing::trace!(seq = frame.seq, "discarding audio from interrupted reply");
                    return;
                }

                let has_audio = !frame.data.is_empty();
                match self.sink.enqueue(frame) {
                    Ok(()) if has_audio => {
                        if let Ok(mut first_audio) = self.first_audio.lock() {
                            first_audio.get_or_insert_with(Instant::now);
                        }
                    }
                    Ok(()) => {}
                    Err(Error::Overrun { pending, .. }) => {
                        let _ = self.events.send(SessionEvent::Overrun { pending });
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to queue audio"),
                }

                if end_of_unit {
                    self.markers.send_modify(|n| *n += 1);
                }
            }
            SynthesisEvent::UnitFailed(reason) => {
                tracing::warn!(reason = %reason, "unit skipped");
                let _ = self.events.send(SessionEvent::UnitFailed(reason));
            }
            SynthesisEvent::Fatal(err) => {
                tracing::error!(error = %err, "synthesis connection failed");
                let _ = self.events.send(SessionEvent::Error(err.to_string()));
                let _ = self.fatal.send(err).await;
            }
        }
    }
}

/// Republish connection state changes as session events
async fn forward_connection_state(
    mut connection: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<SessionEvent>,
) {
    while connection.changed().await.is_ok() {
        let state = *connection.borrow_and_update();
        if state == ConnectionState::Reconnecting {
            tracing::info!("synthesis connection lost, reconnecting");
        }
        let _ = events.send(SessionEvent::Connection(state));
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}
