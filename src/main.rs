use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use voxhook::pipeline::{ActiveQuery, AudioFrame, EventBus};
use voxhook::tools::{evaluate, format_number};
use voxhook::voice::{AudioFormat, CpalSink, OpenAiSpeech, PlaybackController, SpeechSynthesizer};
use voxhook::{Config, Daemon};

/// voxhook - barge-in voice assistant for rooted smart speakers
#[derive(Parser)]
#[command(name = "voxhook", version, about)]
struct Cli {
    /// ASR timeout sent to the device client, in milliseconds
    #[arg(long, env = "VOXHOOK_ASR_TIMEOUT")]
    asr_timeout: Option<u64>,

    /// Seconds between status log lines (0 disables)
    #[arg(long, env = "VOXHOOK_STATUS_INTERVAL", default_value = "5")]
    status_interval: u64,

    /// Only print recognized queries; no model, no speech
    #[arg(long)]
    demo: bool,

    /// Config file (default: ~/.config/voxhook/config.toml)
    #[arg(short, long, env = "VOXHOOK_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Test speaker output
    TestSpeaker,
    /// Test TTS output
    TestTts {
        /// Text to speak
        #[arg(default_value = "你好，这是一段语音合成测试。")]
        text: String,
    },
    /// Evaluate an expression with the calculator tool
    Calc {
        /// Expression, e.g. "sqrt(16) + 2^3"
        expression: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,voxhook=info",
        1 => "info,voxhook=debug",
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
    if let Some(cmd) = cli.command {
        return match cmd {
            Command::TestSpeaker => test_speaker(cli.config.as_deref()).await,
            Command::TestTts { text } => test_tts(cli.config.as_deref(), &text).await,
            Command::Calc { expression } => calc(&expression),
        };
    }

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(timeout) = cli.asr_timeout
        && let Some(device) = config.device.as_mut()
    {
        device.asr_timeout_ms = timeout;
    }
    tracing::debug!(?config, "loaded configuration");

    if cli.demo {
        tracing::info!(log = %config.log_tail.path.display(), "starting demo mode");
        voxhook::daemon::run_demo(config).await?;
        return Ok(());
    }

    tracing::info!(
        log = %config.log_tail.path.display(),
        status_interval = cli.status_interval,
        "starting voxhook"
    );

    let daemon = Daemon::new(config, Duration::from_secs(cli.status_interval))?;
    daemon.run().await?;

    Ok(())
}

/// Play encoded frames through the playback controller as one turn
async fn play_turn(
    config: &Config,
    format: AudioFormat,
    frames: Vec<Vec<u8>>,
) -> anyhow::Result<()> {
    let gate = ActiveQuery::new();
    gate.publish(1);

    let (controller, playback) = PlaybackController::new(
        CpalSink::new(config.playback.buffer_ms),
        format,
        gate,
        config.playback.clone(),
        EventBus::new(),
    )?;
    let cancel = CancellationToken::new();
    let task = tokio::spawn(controller.run(cancel.clone()));

    for (seq, data) in (0u64..).zip(frames) {
        playback
            .play(AudioFrame {
                turn_id: 1,
                seq,
                data,
            })
            .await?;
    }
    playback.end_turn(1).await?;

    cancel.cancel();
    task.await?;
    Ok(())
}

/// Test speaker output with a sine wave
async fn test_speaker(config_path: Option<&std::path::Path>) -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let config = Config::load(config_path)?;
    // Raw 16-bit mono PCM
    let format = AudioFormat::default();

    let frequency = 440.0_f32;
    #[allow(clippy::cast_precision_loss)]
    let rate = format.sample_rate as f32;
    let total = format.sample_rate as usize * 2;

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    let pcm: Vec<u8> = (0..total)
        .flat_map(|i| {
            let t = i as f32 / rate;
            // 30% volume
            let sample = (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3;
            ((sample * f32::from(i16::MAX)) as i16).to_le_bytes()
        })
        .collect();

    // 100 ms frames
    let frame_bytes = format.sample_rate as usize / 10 * 2;
    let frames = pcm.chunks(frame_bytes).map(<[u8]>::to_vec).collect();

    println!("Playing {total} samples at {} Hz...", format.sample_rate);
    play_turn(&config, format, frames).await?;

    println!("\n---");
    println!("If you heard the tone, your speaker is working!");
    println!("If you didn't hear anything, check the output device and volume.");

    Ok(())
}

/// Test TTS output end to end
async fn test_tts(config_path: Option<&std::path::Path>, text: &str) -> anyhow::Result<()> {
    println!("Testing TTS with text: \"{text}\"\n");

    let config = Config::load(config_path)?;
    config.validate_speech()?;
    let speech = OpenAiSpeech::new(config.speech.clone())?;

    println!("Synthesizing speech...");
    let mut session = speech.open(&config.format).await?;
    session.submit(text.to_string()).await?;
    session.finish();

    let mut frames = Vec::new();
    while let Some(frame) = session.next_audio().await {
        frames.push(frame?);
    }
    let bytes: usize = frames.iter().map(Vec::len).sum();
    println!(
        "Got {bytes} bytes of {} audio in {} frames",
        config.format.container,
        frames.len()
    );

    println!("Playing audio...");
    play_turn(&config, config.format, frames).await?;

    println!("\n---");
    println!("If you heard the speech, TTS is working!");

    Ok(())
}

/// Evaluate an expression and print the result
fn calc(expression: &str) -> anyhow::Result<()> {
    let value = evaluate(expression)?;
    println!("{expression} = {}", format_number(value));
    Ok(())
}
