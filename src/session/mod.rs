//! Conversation session
//!
//! Owns one synthesis connection and one audio sink, and runs turns of
//! listen, transcribe, reply and speak on top of them.

mod hold_queue;
mod orchestrator;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

pub use hold_queue::HoldQueue;
pub use orchestrator::PipelineOrchestrator;

use crate::synthesis::ConnectionState;

/// Where the session is in a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Between turns
    Idle,
    /// Waiting for the user to speak
    Listening,
    /// Converting the utterance to text
    Transcribing,
    /// Speaking the reply
    Replying,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Transcribing => "transcribing",
            Self::Replying => "replying",
        };
        f.write_str(name)
    }
}

/// Status updates for the user interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Session state changed
    State(SessionState),
    /// Synthesis connection state changed
    Connection(ConnectionState),
    /// What the user said
    Transcript(String),
    /// A unit of the reply is being spoken
    Speaking(String),
    /// Units are waiting for the connection to reopen
    UnitHeld {
        /// Items in the hold queue
        held: usize,
    },
    /// The hold queue overflowed and dropped its oldest unit
    UnitDropped(String),
    /// The backend could not synthesize a unit
    UnitFailed(String),
    /// Audio was dropped because playback fell behind
    Overrun {
        /// Frames pending when the frame was dropped
        pending: usize,
    },
    /// The reply was cut off by the user
    Interrupted,
    /// Held units were discarded because the connection did not come back
    ReplyAbandoned {
        /// Items discarded
        held: usize,
    },
    /// How long each stage of a reply took
    Timing(ReplyTimings),
    /// Something failed
    Error(String),
}

/// Stage latencies of one reply, measured from when the reply was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyTimings {
    /// Speech to text, for replies to an utterance
    pub transcription: Option<Duration>,
    /// Until the first reply text arrived
    pub first_text: Option<Duration>,
    /// Until the first audio was queued for playback
    pub first_audio: Option<Duration>,
    /// Until the reply finished or was cut off
    pub total: Duration,
}

/// Cloneable control handle for a running session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    state: Arc<watch::Sender<SessionState>>,
    interrupts: Arc<watch::Sender<u64>>,
    cancel: Arc<watch::Sender<bool>>,
}

impl SessionHandle {
    fn new() -> Self {
        Self {
            state: Arc::new(watch::Sender::new(SessionState::Idle)),
            interrupts: Arc::new(watch::Sender::new(0)),
            cancel: Arc::new(watch::Sender::new(false)),
        }
    }

    /// Current session state
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch session state
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Cut off the current reply
    ///
    /// Drops unspoken text and queued audio; the session returns to idle.
    pub fn interrupt(&self) {
        self.interrupts.send_modify(|n| *n += 1);
    }

    /// End the session
    ///
    /// Also interrupts the current reply.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
        self.interrupt();
    }

    /// Whether `cancel` was called
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolve once `cancel` is called
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.subscribe();
        // Sender lives as long as this handle, so wait_for cannot fail
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    fn set_state(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(from = %previous, to = %next, "session state");
        }
    }

    fn subscribe_interrupts(&self) -> watch::Receiver<u64> {
        self.interrupts.subscribe()
    }
}
