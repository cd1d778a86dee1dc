//! End-to-end pipeline tests: segmenter, connection, sink and orchestrator

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use common::{
    Attempt, MockConnector, MockPlayer, PlayerCall, spawn_backend, test_config, wait_until,
};
use immy::session::SessionEvent;
use immy::voice::TextInput;
use immy::{
    AudioFrame, AudioSink, Config, ConnectionState, Error, PipelineOrchestrator, Reply,
    ReplySource, Result, SessionState, SynthesisConnection,
};

struct Harness {
    session: PipelineOrchestrator,
    player: MockPlayer,
    received: Arc<Mutex<Vec<String>>>,
    events: broadcast::Receiver<SessionEvent>,
}

impl Harness {
    fn start(config: &Config, script: impl IntoIterator<Item = Attempt>, player: MockPlayer) -> Self {
        let (connector, peers) = MockConnector::new(script);
        let received = spawn_backend(peers);
        let (connection, synthesis) = SynthesisConnection::open(&config.synthesis, connector).unwrap();
        let sink = AudioSink::spawn(player.clone(), &config.playback);
        let session = PipelineOrchestrator::new(config, connection, synthesis, sink);
        let events = session.subscribe();

        Self {
            session,
            player,
            received,
            events,
        }
    }

    fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }

    fn drain_events(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    async fn wait_open(&self) {
        wait_until(|| self.session.connection().is_open()).await;
    }
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

fn speaking(events: &[SessionEvent]) -> Vec<&str> {
    events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::Speaking(text) => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

struct Canned;

#[async_trait]
impl ReplySource for Canned {
    async fn reply(&self, prompt: &str) -> Result<Reply> {
        Ok(Reply::Complete(format!("You said {prompt}. Nice!")))
    }
}

#[tokio::test]
async fn test_sink_flush_drops_queued_audio() {
    let config = test_config();
    let player = MockPlayer::stalling();
    let sink = AudioSink::spawn(player.clone(), &config.playback);

    sink.enqueue(frame(0, b"a")).unwrap();
    sink.enqueue(marker(1)).unwrap();
    sink.enqueue(frame(2, b"b")).unwrap();
    sink.enqueue(marker(3)).unwrap();

    wait_until(|| sink.is_playing()).await;
    sink.flush_immediately();
    sink.drain(Duration::from_secs(1)).await.unwrap();

    assert_eq!(player.played(), vec![b"a".to_vec()]);
    assert!(player.calls().contains(&PlayerCall::Stop));

    // Audio queued after the flush still plays
    player.set_stall(false);
    sink.enqueue(frame(4, b"c")).unwrap();
    sink.enqueue(marker(5)).unwrap();
    sink.drain(Duration::from_secs(1)).await.unwrap();

    assert_eq!(player.played(), vec![b"a".to_vec(), b"c".to_vec()]);
}

#[tokio::test]
async fn test_sink_waits_for_busy_player() {
    let config = test_config();
    let player = MockPlayer::stalling();
    let sink = AudioSink::spawn(player.clone(), &config.playback);

    sink.enqueue(frame(0, b"a1")).unwrap();
    wait_until(|| player.played().len() == 1).await;

    sink.enqueue(frame(1, b"a2")).unwrap();
    sink.enqueue(marker(2)).unwrap();
    sink.enqueue(frame(3, b"b1")).unwrap();
    sink.enqueue(marker(4)).unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(player.played(), vec![b"a1".to_vec()]);

    // The next unit stays queued until the rest of the first has played
    player.finish();
    wait_until(|| player.played().len() == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(player.played(), vec![b"a1".to_vec(), b"a2".to_vec()]);

    player.set_stall(false);
    player.finish();
    sink.drain(Duration::from_secs(1)).await.unwrap();
    assert_eq!(player.played(), [b"a1", b"a2", b"b1"].map(|b| b.to_vec()));
}

#[tokio::test]
async fn test_sink_overrun_drops_audio_but_keeps_markers() {
    let mut config = test_config();
    config.playback.high_water_mark = 2;
    let player = MockPlayer::default();
    let sink = AudioSink::spawn(player.clone(), &config.playback);

    sink.enqueue(frame(0, b"a")).unwrap();
    sink.enqueue(frame(1, b"b")).unwrap();
    assert!(matches!(
        sink.enqueue(frame(2, b"c")),
        Err(Error::Overrun {
            pending: 2,
            high_water: 2
        })
    ));
    sink.enqueue(marker(3)).unwrap();
    assert_eq!(sink.overruns(), 1);

    sink.drain(Duration::from_secs(1)).await.unwrap();
    assert_eq!(player.played_text(), "ab");
}

#[tokio::test]
async fn test_streamed_reply_plays_in_order() {
    let mut h = Harness::start(&test_config(), [], MockPlayer::default());
    h.wait_open().await;

    let (tx, rx) = mpsc::channel(8);
    for fragment in ["Hello th", "ere. How are", " you? I am", " fine"] {
        tx.send(Ok(fragment.to_string())).await.unwrap();
    }
    drop(tx);

    h.session.speak_reply(Reply::Stream(rx)).await.unwrap();

    assert_eq!(
        h.received(),
        ["Hello there. ", "How are you? ", "I am fine "]
    );
    assert_eq!(h.player.played_text(), "Hello there. How are you? I am fine ");
    assert_eq!(h.session.state(), SessionState::Idle);
    assert_eq!(h.session.sink().pending(), 0);

    let events = h.drain_events();
    assert_eq!(
        speaking(&events),
        ["Hello there.", "How are you?", "I am fine"]
    );
    assert!(events.contains(&SessionEvent::State(SessionState::Replying)));

    h.session.shutdown().await;
}

#[tokio::test]
async fn test_held_units_replay_after_reconnect() {
    let mut h = Harness::start(
        &test_config(),
        [Attempt::Refuse, Attempt::Refuse],
        MockPlayer::default(),
    );

    h.session.speak("One. Two. Three.").await.unwrap();

    assert_eq!(h.received(), ["One. ", "Two. ", "Three. "]);
    assert_eq!(h.player.played_text(), "One. Two. Three. ");

    let events = h.drain_events();
    assert!(
        events
            .iter()
            .any(|event| matches!(event, SessionEvent::UnitHeld { .. }))
    );
    assert!(events.contains(&SessionEvent::Connection(ConnectionState::Open)));

    h.session.shutdown().await;
}

#[tokio::test]
async fn test_held_units_go_out_before_later_units() {
    let mut h = Harness::start(
        &test_config(),
        [Attempt::Refuse, Attempt::Refuse],
        MockPlayer::default(),
    );
    let mut states = h.session.connection().subscribe();

    let (tx, rx) = mpsc::channel(8);
    tx.send(Ok("One. Two. ".to_string())).await.unwrap();

    let feeder = async move {
        states
            .wait_for(|state| *state == ConnectionState::Open)
            .await
            .unwrap();
        tx.send(Ok("Three. Four.".to_string())).await.unwrap();
    };

    let (result, ()) = tokio::join!(h.session.speak_reply(Reply::Stream(rx)), feeder);
    result.unwrap();

    assert_eq!(h.received(), ["One. ", "Two. ", "Three. ", "Four. "]);
    assert_eq!(h.player.played_text(), "One. Two. Three. Four. ");

    let events = h.drain_events();
    let held = events
        .iter()
        .position(|event| matches!(event, SessionEvent::UnitHeld { .. }))
        .unwrap();
    let open = events
        .iter()
        .position(|event| *event == SessionEvent::Connection(ConnectionState::Open))
        .unwrap();
    assert!(held < open);

    h.session.shutdown().await;
}

#[tokio::test]
async fn test_full_hold_queue_drops_oldest() {
    let mut config = test_config();
    config.session.hold_queue_capacity = 2;
    let mut h = Harness::start(&config, [Attempt::Refuse], MockPlayer::default());

    h.session.speak("One. Two. Three. Four.").await.unwrap();

    assert_eq!(h.received(), ["Four. "]);
    assert_eq!(h.player.played_text(), "Four. ");

    let dropped: Vec<SessionEvent> = h
        .drain_events()
        .into_iter()
        .filter(|event| matches!(event, SessionEvent::UnitDropped(_)))
        .collect();
    assert_eq!(
        dropped,
        ["One.", "Two.", "Three."].map(|text| SessionEvent::UnitDropped(text.to_string()))
    );

    h.session.shutdown().await;
}

#[tokio::test]
async fn test_interrupt_cuts_reply_short() {
    let player = MockPlayer::stalling();
    let mut h = Harness::start(&test_config(), [], player.clone());
    h.wait_open().await;

    let (tx, rx) = mpsc::channel(8);
    tx.send(Ok("First sentence here. And then".to_string()))
        .await
        .unwrap();

    let handle = h.session.handle();
    let interrupter = async {
        wait_until(|| !player.played().is_empty()).await;
        assert_eq!(handle.state(), SessionState::Replying);
        handle.interrupt();
    };

    let (result, ()) = tokio::join!(h.session.speak_reply(Reply::Stream(rx)), interrupter);
    result.unwrap();

    assert_eq!(h.session.state(), SessionState::Idle);
    assert!(player.calls().contains(&PlayerCall::Stop));
    assert!(h.drain_events().contains(&SessionEvent::Interrupted));
    assert_eq!(h.received(), ["First sentence here. "]);

    // The backend finishes the abandoned stream and the connection cycles
    wait_until(|| {
        let connection = h.session.connection();
        connection.stats().reconnects >= 1 && connection.is_open()
    })
    .await;

    player.set_stall(false);
    h.session.speak("Second reply.").await.unwrap();

    let calls = player.calls();
    let stop = calls
        .iter()
        .position(|call| *call == PlayerCall::Stop)
        .unwrap();
    let after: Vec<u8> = calls[stop..]
        .iter()
        .filter_map(|call| match call {
            PlayerCall::Play(bytes) => Some(bytes.clone()),
            PlayerCall::Stop => None,
        })
        .flatten()
        .collect();
    assert_eq!(after, b"Second reply. ");

    drop(tx);
    h.session.shutdown().await;
}

#[tokio::test]
async fn test_failed_reply_stream_still_plays_sent_audio() {
    let mut h = Harness::start(&test_config(), [], MockPlayer::default());
    h.wait_open().await;

    let (tx, rx) = mpsc::channel(8);
    tx.send(Ok("Hello there. And th".to_string())).await.unwrap();
    tx.send(Err(Error::Upstream("model went away".to_string())))
        .await
        .unwrap();
    drop(tx);

    let err = h.session.speak_reply(Reply::Stream(rx)).await.unwrap_err();
    assert!(matches!(err, Error::Upstream(_)));

    // The complete sentence was spoken; the partial one was not
    assert_eq!(h.received(), ["Hello there. "]);
    assert_eq!(h.player.played_text(), "Hello there. ");
    assert_eq!(h.session.sink().pending(), 0);
    assert_eq!(h.session.state(), SessionState::Idle);

    h.session.shutdown().await;
}

#[tokio::test]
async fn test_rejected_credential_ends_reply() {
    let mut h = Harness::start(&test_config(), [Attempt::RejectAuth], MockPlayer::default());

    let err = h.session.speak("Hello there.").await.unwrap_err();
    assert!(matches!(err, Error::Auth(_)));
    assert!(err.is_fatal());
    assert_eq!(h.session.state(), SessionState::Idle);
    assert!(h.player.played().is_empty());

    h.session.shutdown().await;
}

#[tokio::test]
async fn test_typed_turns_until_input_closes() {
    let mut h = Harness::start(&test_config(), [], MockPlayer::default());
    h.wait_open().await;

    let input = TextInput::new(&b"hello\n"[..]);

    h.session.run_turn(&input, &Canned).await.unwrap();
    assert_eq!(h.received(), ["You said hello. ", "Nice! "]);
    assert_eq!(h.player.played_text(), "You said hello. Nice! ");

    let events = h.drain_events();
    assert!(events.contains(&SessionEvent::Transcript("hello".to_string())));

    let timings = events
        .iter()
        .find_map(|event| match event {
            SessionEvent::Timing(timings) => Some(*timings),
            _ => None,
        })
        .unwrap();
    assert!(timings.transcription.is_some());
    assert!(timings.first_text.is_some());
    let first_audio = timings.first_audio.unwrap();
    assert!(first_audio <= timings.total);

    let err = h.session.run_turn(&input, &Canned).await.unwrap_err();
    assert!(matches!(err, Error::InputClosed));
    assert_eq!(h.session.state(), SessionState::Idle);

    h.session.shutdown().await;
}
