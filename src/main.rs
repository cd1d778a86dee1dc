use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use immy::session::SessionEvent;
use immy::voice::{AudioCapture, MicrophoneInput, StdinInput, rms, sine_tone};
use immy::{
    AudioSink, ChatClient, Config, ConnectionState, DevicePlayer, Error, PipelineOrchestrator,
    SessionState, SpeechInput, SynthesisConnection, WebSocketConnector,
};

/// immy - talk to a language model and hear it answer while it thinks
#[derive(Parser)]
#[command(name = "immy", version, about)]
struct Cli {
    /// Config file (defaults to the platform config dir)
    #[arg(short, long, env = "IMMY_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Voice conversation through the microphone (default)
    Talk,
    /// Typed conversation; replies are still spoken
    Chat,
    /// Speak text through the streaming pipeline
    Say {
        /// Text to speak
        #[arg(default_value = "Hello! This is a test of the streaming speech pipeline.")]
        text: String,
    },
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "warn,immy=info",
        1 => "info,immy=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let command = cli.command.unwrap_or(Command::Talk);

    match command {
        Command::TestMic { duration } => return test_mic(duration).await,
        Command::TestSpeaker => return test_speaker().await,
        _ => {}
    }

    let config = Config::load(cli.config.as_deref())?;
    tracing::debug!(?config, "loaded configuration");

    match command {
        Command::Talk => {
            let input = MicrophoneInput::new(&config.stt)?;
            tracing::info!("immy is listening - say something");
            converse(&config, &input).await
        }
        Command::Chat => {
            println!("Type a message and press enter. Ctrl-C interrupts a reply, twice quits.");
            converse(&config, &StdinInput::stdin()).await
        }
        Command::Say { text } => say(&config, &text).await,
        Command::TestMic { .. } | Command::TestSpeaker => Ok(()),
    }
}

/// Open the synthesis connection and audio output
fn start_session(config: &Config) -> anyhow::Result<PipelineOrchestrator> {
    if config.synthesis.api_key.is_none() {
        anyhow::bail!("ELEVENLABS_API_KEY is not set");
    }

    let connector = WebSocketConnector::new(&config.synthesis)?;
    let (connection, events) = SynthesisConnection::open(&config.synthesis, connector)?;
    let player = DevicePlayer::new(config.playback.sample_rate)?;
    let sink = AudioSink::spawn(player, &config.playback);

    let session = PipelineOrchestrator::new(config, connection, events, sink);
    tokio::spawn(render(session.subscribe()));
    Ok(session)
}

/// Turn loop until input ends, ctrl-c, or a fatal error
async fn converse(config: &Config, input: &dyn SpeechInput) -> anyhow::Result<()> {
    let replies = ChatClient::new(&config.llm)?;
    let mut session = start_session(config)?;
    let handle = session.handle();

    // First ctrl-c during a reply interrupts it; otherwise it ends the session
    let signals = handle.clone();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if signals.state() == SessionState::Replying {
                signals.interrupt();
            } else {
                tracing::info!("shutting down");
                signals.cancel();
                break;
            }
        }
    });

    let result = loop {
        tokio::select! {
            () = handle.cancelled() => break Ok(()),
            turn = session.run_turn(input, &replies) => match turn {
                Ok(()) => {}
                Err(Error::NoSpeechDetected) => tracing::debug!("no speech detected"),
                Err(e) if e.is_fatal() => break Err(e),
                Err(e) => tracing::warn!(error = %e, "turn failed"),
            },
        }
    };

    session.shutdown().await;

    match result {
        Ok(()) | Err(Error::InputClosed) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Speak one piece of text and wait for it to finish playing
async fn say(config: &Config, text: &str) -> anyhow::Result<()> {
    let mut session = start_session(config)?;

    let result = tokio::select! {
        result = session.speak(text) => result,
        _ = tokio::signal::ctrl_c() => Ok(()),
    };

    session.shutdown().await;
    Ok(result?)
}

/// Print session events as they happen
async fn render(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "status display fell behind");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match event {
            SessionEvent::Transcript(text) => println!("you:  {text}"),
            SessionEvent::Speaking(text) => println!("immy: {text}"),
            SessionEvent::Connection(ConnectionState::Reconnecting) => {
                println!("      (reconnecting to speech service...)");
            }
            SessionEvent::Interrupted => println!("      (interrupted)"),
            SessionEvent::UnitDropped(text) => {
                tracing::warn!(unit = %text, "dropped unit while disconnected");
            }
            SessionEvent::ReplyAbandoned { held } => {
                tracing::warn!(held, "speech service unavailable, reply cut short");
            }
            SessionEvent::Overrun { pending } => {
                tracing::debug!(pending, "playback overrun");
            }
            SessionEvent::Timing(timings) => {
                if let Some(first_audio) = timings.first_audio {
                    println!(
                        "      ({:.2}s to first audio, {:.2}s total)",
                        first_audio.as_secs_f32(),
                        timings.total.as_secs_f32()
                    );
                }
            }
            SessionEvent::Error(message) => tracing::debug!(%message, "session error"),
            SessionEvent::State(state) => tracing::debug!(%state, "session state"),
            other => tracing::trace!(?other, "session event"),
        }
    }
}

/// Test microphone input
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let levels = tokio::task::spawn_blocking(move || -> immy::Result<()> {
        let mut capture = AudioCapture::new()?;
        capture.start()?;

        for i in 0..duration {
            std::thread::sleep(Duration::from_secs(1));

            let samples = capture.take_buffer();
            let energy = rms(&samples);
            let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let meter_len = (energy * 100.0).min(50.0) as usize;
            let meter = "#".repeat(meter_len) + &" ".repeat(50 - meter_len);

            println!("[{:2}s] RMS: {energy:.4} | Peak: {peak:.4} | [{meter}]", i + 1);
        }

        capture.stop();
        Ok(())
    });
    levels.await??;

    println!("\n---");
    println!("If the meter moved, your mic is working.");
    println!("If RMS stayed near 0, check the default input device and its levels.");

    Ok(())
}

/// Test speaker output with a sine wave
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let sample_rate = Config::default().playback.sample_rate;
    let player = DevicePlayer::new(sample_rate)?;
    let samples = sine_tone(sample_rate, 440.0, 2.0);

    println!("Playing {} samples at {} Hz...", samples.len(), sample_rate);
    player.push_samples(&samples);

    while immy::Player::is_busy(&player) {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");

    Ok(())
}
