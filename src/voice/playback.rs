//! Audio playback to speakers

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, mpsc};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};

use super::sink::Player;
use crate::{Error, Result};

type SampleQueue = Arc<Mutex<VecDeque<f32>>>;

/// Plays decoded audio on the default output device
///
/// The cpal stream lives on its own thread and pulls samples from a shared
/// queue; `play` only appends to that queue.
pub struct DevicePlayer {
    queue: SampleQueue,
    sample_rate: u32,
    mp3: Mp3Stream,
    stop_tx: Option<mpsc::Sender<()>>,
}

impl DevicePlayer {
    /// Open the default output device at `sample_rate`
    ///
    /// # Errors
    ///
    /// Returns error if no output device supports the rate
    pub fn new(sample_rate: u32) -> Result<Self> {
        let queue: SampleQueue = Arc::new(Mutex::new(VecDeque::new()));
        let (ready_tx, ready_rx) = mpsc::channel();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let stream_queue = Arc::clone(&queue);
        std::thread::Builder::new()
            .name("immy-audio".to_string())
            .spawn(move || {
                let stream = match open_stream(sample_rate, stream_queue) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                // Keep the stream alive until the player is dropped
                let _ = stop_rx.recv();
                drop(stream);
                tracing::debug!("audio output closed");
            })?;

        ready_rx
            .recv()
            .map_err(|_| Error::Audio("audio thread exited during startup".to_string()))??;

        Ok(Self {
            queue,
            sample_rate,
            mp3: Mp3Stream::new(),
            stop_tx: Some(stop_tx),
        })
    }

    /// Output sample rate
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Queue raw mono samples
    pub fn push_samples(&self, samples: &[f32]) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.extend(samples);
        }
    }
}

impl Player for DevicePlayer {
    type Handle = Vec<f32>;

    fn load(&mut self, bytes: &[u8]) -> Result<Self::Handle> {
        self.mp3.push(bytes)
    }

    fn play(&mut self, samples: Self::Handle) -> Result<()> {
        tracing::trace!(samples = samples.len(), "queueing samples");
        self.push_samples(&samples);
        Ok(())
    }

    fn is_busy(&self) -> bool {
        self.queue.lock().map(|q| !q.is_empty()).unwrap_or(false)
    }

    fn stop(&mut self) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.clear();
        }
        self.mp3.reset();
    }
}

impl Drop for DevicePlayer {
    fn drop(&mut self) {
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(());
        }
    }
}

/// Find an output config at `sample_rate` (mono preferred) and start the stream
fn open_stream(sample_rate: u32, queue: SampleQueue) -> Result<cpal::Stream> {
    let host = cpal::default_host();

    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

    let supports = |c: &cpal::SupportedStreamConfigRange, channels: u16| {
        c.channels() == channels
            && c.min_sample_rate() <= SampleRate(sample_rate)
            && c.max_sample_rate() >= SampleRate(sample_rate)
    };

    let supported_config = device
        .supported_output_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .find(|c| supports(c, 1))
        .or_else(|| {
            // Fallback: try stereo
            device
                .supported_output_configs()
                .ok()?
                .find(|c| supports(c, 2))
        })
        .ok_or_else(|| Error::Audio(format!("no output config supports {sample_rate} Hz")))?;

    let config: StreamConfig = supported_config
        .with_sample_rate(SampleRate(sample_rate))
        .config();
    let channels = usize::from(config.channels);

    tracing::debug!(
        device = %device.name().unwrap_or_default(),
        sample_rate,
        channels,
        "audio playback initialized"
    );

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let Ok(mut queue) = queue.lock() else {
                    data.fill(0.0);
                    return;
                };
                for frame in data.chunks_mut(channels) {
                    let sample = queue.pop_front().unwrap_or(0.0);
                    frame.fill(sample);
                }
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;
    Ok(stream)
}

/// Decode MP3 bytes to mono f32 samples
///
/// A trailing partial frame is ignored.
///
/// # Errors
///
/// Returns error if the decoder fails
pub fn decode_mp3(mp3_data: &[u8]) -> Result<Vec<f32>> {
    Mp3Stream::new().push(mp3_data)
}

/// Incremental MP3 decoder
///
/// Audio arrives in chunks cut at arbitrary byte offsets. Only whole frames
/// are handed to the decoder; a frame split across chunks waits for the rest
/// of its bytes, and the decoder state carries over between chunks.
pub struct Mp3Stream {
    pending: Vec<u8>,
    decoder: minimp3::Decoder<VecDeque<u8>>,
}

impl Mp3Stream {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
            decoder: minimp3::Decoder::new(VecDeque::new()),
        }
    }

    /// Add a chunk and decode every frame it completes
    ///
    /// # Errors
    ///
    /// Returns error if the decoder fails
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<f32>> {
        self.pending.extend_from_slice(bytes);

        let mut pos = 0;
        let mut skipped = 0;
        while pos < self.pending.len() {
            let rest = &self.pending[pos..];
            match next_chunk(rest) {
                Chunk::Frame(len) if len <= rest.len() => {
                    self.decoder.reader_mut().extend(&rest[..len]);
                    pos += len;
                }
                Chunk::Tag(len) if len <= rest.len() => pos += len,
                Chunk::Frame(_) | Chunk::Tag(_) | Chunk::Incomplete => break,
                Chunk::Junk => {
                    pos += 1;
                    skipped += 1;
                }
            }
        }
        self.pending.drain(..pos);

        if skipped > 0 {
            tracing::debug!(skipped, "skipped bytes between MP3 frames");
        }

        let mut samples = Vec::new();
        loop {
            match self.decoder.next_frame() {
                Ok(frame) => append_mono(&mut samples, &frame),
                Err(minimp3::Error::SkippedData) => {}
                Err(minimp3::Error::Eof | minimp3::Error::InsufficientData) => break,
                Err(e) => return Err(Error::Audio(format!("MP3 decode error: {e}"))),
            }
        }

        Ok(samples)
    }

    /// Bytes held back waiting for the rest of a frame
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Forget partial data, e.g. after playback was flushed
    pub fn reset(&mut self) {
        self.pending.clear();
        self.decoder = minimp3::Decoder::new(VecDeque::new());
    }
}

impl Default for Mp3Stream {
    fn default() -> Self {
        Self::new()
    }
}

enum Chunk {
    /// MPEG audio frame of this many bytes
    Frame(usize),
    /// ID3v2 tag of this many bytes
    Tag(usize),
    /// Not enough bytes to tell
    Incomplete,
    /// Not the start of a frame
    Junk,
}

fn next_chunk(rest: &[u8]) -> Chunk {
    if rest.starts_with(b"ID3") {
        return match rest.get(6..10) {
            Some(size) => {
                let size = size
                    .iter()
                    .fold(0usize, |acc, &b| (acc << 7) | usize::from(b & 0x7f));
                Chunk::Tag(10 + size)
            }
            None => Chunk::Incomplete,
        };
    }

    match rest.get(..4) {
        Some(header) => frame_len(header).map_or(Chunk::Junk, Chunk::Frame),
        None => Chunk::Incomplete,
    }
}

/// Length of the Layer III frame starting with `header`
fn frame_len(header: &[u8]) -> Option<usize> {
    const MPEG1_KBPS: [usize; 15] = [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320];
    const MPEG2_KBPS: [usize; 15] = [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160];

    let [b0, b1, b2, _] = *header else {
        return None;
    };
    if b0 != 0xFF || b1 & 0xE0 != 0xE0 || (b1 >> 1) & 0b11 != 0b01 {
        return None;
    }

    let version = (b1 >> 3) & 0b11;
    let bitrate_index = usize::from(b2 >> 4);
    let rate_index = usize::from((b2 >> 2) & 0b11);
    if version == 0b01 || bitrate_index == 0 || bitrate_index == 15 || rate_index == 3 {
        return None;
    }

    let (kbps, base_rate, slot) = match version {
        0b11 => (MPEG1_KBPS[bitrate_index], [44_100, 48_000, 32_000][rate_index], 144),
        0b10 => (MPEG2_KBPS[bitrate_index], [22_050, 24_000, 16_000][rate_index], 72),
        _ => (MPEG2_KBPS[bitrate_index], [11_025, 12_000, 8_000][rate_index], 72),
    };
    let padding = usize::from((b2 >> 1) & 1);

    Some(slot * kbps * 1000 / base_rate + padding)
}

fn append_mono(samples: &mut Vec<f32>, frame: &minimp3::Frame) {
    if frame.channels == 2 {
        samples.extend(frame.data.chunks(2).map(|pair| {
            let left = f32::from(pair[0]) / 32768.0;
            let right = f32::from(pair.get(1).copied().unwrap_or(pair[0])) / 32768.0;
            f32::midpoint(left, right)
        }));
    } else {
        samples.extend(frame.data.iter().map(|&s| f32::from(s) / 32768.0));
    }
}

/// Sine tone for checking the output device
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn sine_tone(sample_rate: u32, frequency: f32, seconds: f32) -> Vec<f32> {
    let count = (sample_rate as f32 * seconds) as usize;
    (0..count)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3
        })
        .collect()
}
