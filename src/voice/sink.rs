//! Ordered audio sink
//!
//! Frames are queued without blocking and played strictly in arrival order
//! by a single playback task. Each batch handed to the player stops at an
//! end-of-unit marker, so audio from two units is never mixed in one batch.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::PlaybackConfig;
use crate::synthesis::AudioFrame;
use crate::{Error, Result};

/// Audio output primitive driven by the sink
///
/// Calls are made from the playback task and must return quickly.
pub trait Player: Send + 'static {
    /// Prepared audio, ready to play
    type Handle: Send;

    /// Decode encoded audio into a playable handle
    ///
    /// # Errors
    ///
    /// Returns error if the bytes cannot be decoded
    fn load(&mut self, bytes: &[u8]) -> Result<Self::Handle>;

    /// Start playing a loaded handle
    ///
    /// # Errors
    ///
    /// Returns error if the device rejects the audio
    fn play(&mut self, handle: Self::Handle) -> Result<()>;

    /// Whether audio is still being output
    fn is_busy(&self) -> bool;

    /// Stop output and discard anything not yet played
    fn stop(&mut self);
}

struct Queued {
    generation: u64,
    frame: AudioFrame,
}

enum Control {
    Flush,
}

#[derive(Debug, Default)]
struct Shared {
    pending: AtomicUsize,
    playing: AtomicBool,
    overruns: AtomicU64,
    generation: AtomicU64,
}

impl Shared {
    fn is_current(&self, queued: &Queued) -> bool {
        queued.generation == self.generation.load(Ordering::SeqCst)
    }

    fn consumed(&self, count: usize) {
        self.pending.fetch_sub(count, Ordering::SeqCst);
    }
}

/// Handle to the playback task
#[derive(Debug)]
pub struct AudioSink {
    frames: mpsc::UnboundedSender<Queued>,
    control: mpsc::UnboundedSender<Control>,
    shared: Arc<Shared>,
    high_water: usize,
    poll_interval: Duration,
}

impl AudioSink {
    /// Start the playback task
    #[must_use]
    pub fn spawn<P: Player>(player: P, config: &PlaybackConfig) -> Self {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::default());

        let playback = Playback {
            player,
            frames: frames_rx,
            control: control_rx,
            queue: VecDeque::new(),
            shared: Arc::clone(&shared),
            poll_interval: config.poll_interval(),
        };
        tokio::spawn(playback.run());

        Self {
            frames: frames_tx,
            control: control_tx,
            shared,
            high_water: config.high_water_mark,
            poll_interval: config.poll_interval(),
        }
    }

    /// Queue a frame for playback
    ///
    /// Never blocks. End-of-unit markers are always accepted.
    ///
    /// # Errors
    ///
    /// Returns `Error::Overrun` if the high-water mark is reached; the frame
    /// is dropped
    pub fn enqueue(&self, frame: AudioFrame) -> Result<()> {
        if !frame.is_marker() {
            let pending = self.shared.pending.load(Ordering::SeqCst);
            if pending >= self.high_water {
                self.shared.overruns.fetch_add(1, Ordering::SeqCst);
                tracing::warn!(seq = frame.seq, pending, "audio overrun, dropping frame");
                return Err(Error::Overrun {
                    pending,
                    high_water: self.high_water,
                });
            }
        }

        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        let queued = Queued {
            generation: self.shared.generation.load(Ordering::SeqCst),
            frame,
        };

        if self.frames.send(queued).is_err() {
            self.shared.consumed(1);
            return Err(Error::Audio("playback task stopped".to_string()));
        }
        Ok(())
    }

    /// Wait until nothing is queued or playing
    ///
    /// # Errors
    ///
    /// Returns `Error::Timeout` if audio is still pending when `timeout` expires
    pub async fn drain(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;

        loop {
            if self.is_idle() {
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(pending = self.pending(), "audio drain timed out");
                return Err(Error::Timeout(timeout));
            }

            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Drop all queued audio and stop the player
    ///
    /// Returns without waiting for the playback task.
    pub fn flush_immediately(&self) {
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(generation, pending = self.pending(), "flushing audio");
        let _ = self.control.send(Control::Flush);
    }

    /// Whether the player is outputting audio
    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.shared.playing.load(Ordering::SeqCst)
    }

    /// Frames waiting for playback
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    /// Frames dropped on overrun
    #[must_use]
    pub fn overruns(&self) -> u64 {
        self.shared.overruns.load(Ordering::SeqCst)
    }

    fn is_idle(&self) -> bool {
        // Playing is set before pending is decremented, so read pending first
        self.pending() == 0 && !self.is_playing()
    }
}

struct Playback<P> {
    player: P,
    frames: mpsc::UnboundedReceiver<Queued>,
    control: mpsc::UnboundedReceiver<Control>,
    queue: VecDeque<Queued>,
    shared: Arc<Shared>,
    poll_interval: Duration,
}

impl<P: Player> Playback<P> {
    async fn run(mut self) {
        loop {
            while let Ok(Control::Flush) = self.control.try_recv() {
                self.flush();
            }

            if self.queue.is_empty() {
                tokio::select! {
                    biased;
                    control = self.control.recv() => match control {
                        Some(Control::Flush) => {
                            self.flush();
                            continue;
                        }
                        None => break,
                    },
                    queued = self.frames.recv() => match queued {
                        Some(queued) => self.queue.push_back(queued),
                        None => break,
                    },
                }
            }

            self.collect();
            self.play_next_batch().await;
        }

        self.player.stop();
        tracing::debug!("playback task stopped");
    }

    /// Move everything already sent into the local queue
    fn collect(&mut self) {
        while let Ok(queued) = self.frames.try_recv() {
            self.queue.push_back(queued);
        }
    }

    /// Play queued frames up to and including the next end-of-unit marker
    async fn play_next_batch(&mut self) {
        let mut bytes = Vec::new();
        let mut taken = 0;
        let mut first_seq = None;

        while let Some(queued) = self.queue.pop_front() {
            taken += 1;
            if !self.shared.is_current(&queued) {
                continue;
            }
            first_seq.get_or_insert(queued.frame.seq);
            bytes.extend_from_slice(&queued.frame.data);
            if queued.frame.end_of_unit {
                break;
            }
        }

        if bytes.is_empty() {
            self.shared.consumed(taken);
            return;
        }

        self.shared.playing.store(true, Ordering::SeqCst);
        self.shared.consumed(taken);

        tracing::trace!(first_seq, bytes = bytes.len(), frames = taken, "playing batch");

        let started = self
            .player
            .load(&bytes)
            .and_then(|handle| self.player.play(handle));

        match started {
            Ok(()) => self.wait_while_busy().await,
            Err(e) => tracing::warn!(error = %e, first_seq, "skipping unplayable audio"),
        }

        self.shared.playing.store(false, Ordering::SeqCst);
    }

    async fn wait_while_busy(&mut self) {
        while self.player.is_busy() {
            tokio::select! {
                biased;
                control = self.control.recv() => match control {
                    Some(Control::Flush) => {
                        self.flush();
                        return;
                    }
                    None => return,
                },
                () = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    fn flush(&mut self) {
        self.player.stop();
        self.collect();

        let before = self.queue.len();
        let shared = Arc::clone(&self.shared);
        self.queue.retain(|queued| shared.is_current(queued));
        let dropped = before - self.queue.len();
        self.shared.consumed(dropped);
        self.shared.playing.store(false, Ordering::SeqCst);

        tracing::debug!(dropped, "audio flushed");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Clone, Default)]
    struct Recorder {
        played: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl Player for Recorder {
        type Handle = Vec<u8>;

        fn load(&mut self, bytes: &[u8]) -> Result<Self::Handle> {
            Ok(bytes.to_vec())
        }

        fn play(&mut self, handle: Self::Handle) -> Result<()> {
            self.played.lock().unwrap().push(handle);
            Ok(())
        }

        fn is_busy(&self) -> bool {
            false
        }

        fn stop(&mut self) {}
    }

    fn frame(seq: u64, data: &[u8]) -> AudioFrame {
        AudioFrame {
            seq,
            data: data.to_vec(),
            end_of_unit: false,
        }
    }

    fn marker(seq: u64) -> AudioFrame {
        AudioFrame {
            seq,
            data: Vec::new(),
            end_of_unit: true,
        }
    }

    fn config(high_water_mark: usize) -> PlaybackConfig {
        PlaybackConfig {
            high_water_mark,
            poll_interval_ms: 5,
            ..PlaybackConfig::default()
        }
    }

    #[tokio::test]
    async fn batches_stop_at_unit_markers() {
        let player = Recorder::default();
        let sink = AudioSink::spawn(player.clone(), &config(16));

        sink.enqueue(frame(0, b"a1")).unwrap();
        sink.enqueue(frame(1, b"a2")).unwrap();
        sink.enqueue(marker(2)).unwrap();
        sink.enqueue(frame(3, b"b1")).unwrap();
        sink.enqueue(marker(4)).unwrap();

        sink.drain(Duration::from_secs(1)).await.unwrap();

        let played = player.played.lock().unwrap().clone();
        assert_eq!(played, vec![b"a1a2".to_vec(), b"b1".to_vec()]);
    }

    #[tokio::test]
    async fn markers_are_never_rejected() {
        let sink = AudioSink::spawn(Recorder::default(), &config(1));
        // Saturate before the task has a chance to run
        sink.enqueue(frame(0, b"x")).unwrap();
        assert!(sink.enqueue(frame(1, b"y")).is_err());
        assert!(sink.enqueue(marker(2)).is_ok());
        assert_eq!(sink.overruns(), 1);
    }

    #[tokio::test]
    async fn drain_on_idle_sink_returns_immediately() {
        let sink = AudioSink::spawn(Recorder::default(), &config(4));
        sink.drain(Duration::ZERO).await.unwrap();
        assert!(!sink.is_playing());
        assert_eq!(sink.pending(), 0);
    }
}
