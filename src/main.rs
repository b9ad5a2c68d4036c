use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use parley::voice::activity::{SpeechGate, calculate_energy};
use parley::voice::local::{self, Microphone, SpeakerSink};
use parley::voice::prepare_recordings_dir;
use parley::{Config, ControlChannel, Session, discord};

/// Parley - turn-taking voice bridge for a speech-processing service
#[derive(Parser)]
#[command(name = "parley", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the Discord voice bot (default)
    Discord,
    /// Run against the default microphone and speakers
    Local,
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
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,parley=info",
        1 => "info,parley=debug",
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
    let command = cli.command.unwrap_or(Command::Discord);

    match command {
        Command::TestMic { duration } => return test_mic(duration).await,
        Command::TestSpeaker => return test_speaker().await,
        Command::Discord | Command::Local => {}
    }

    let config = Config::load()?;
    tracing::debug!(?config, "loaded configuration");

    prepare_recordings_dir(&config.recordings_dir)?;

    let mut control = ControlChannel::new(config.control.clone());
    control.connect();
    let control = Arc::new(control);

    match command {
        Command::Local => run_local(&config, &control).await?,
        _ => {
            let token = config.require_discord_token()?;
            tracing::info!(control = %config.control.url, "starting parley");
            discord::run(token, config.voice_capture(), control).await?;
        }
    }

    Ok(())
}

/// Run one session on the default microphone and speakers until Ctrl-C
async fn run_local(config: &Config, control: &ControlChannel) -> anyhow::Result<()> {
    let (mic, chunks) = Microphone::open().await?;

    let session = Session::spawn(
        config.local_capture(),
        Arc::new(SpeakerSink::new()),
        Arc::new(control.handle()),
        control.subscribe(),
    );

    let gate = SpeechGate::new(config.energy_threshold, config.local_silence, mic.sample_rate());
    let listener = tokio::spawn(local::listen(chunks, gate, session.sender()));

    tracing::info!(control = %config.control.url, "parley ready - listening on the default microphone");
    tokio::signal::ctrl_c().await?;

    tracing::info!("shutting down");
    drop(mic);
    listener.await?;
    session.leave().await;

    Ok(())
}

/// Test microphone input
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let (mic, mut chunks) = Microphone::open().await?;

    println!("Sample rate: {} Hz", mic.sample_rate());
    println!("---");

    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let mut samples = Vec::new();
        while let Ok(chunk) = chunks.try_recv() {
            samples.extend(chunk);
        }

        let energy = calculate_energy(&samples);
        let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[{:2}s] RMS: {:.4} | Peak: {:.4} | [{}]",
            i + 1,
            energy,
            peak,
            meter
        );
    }

    drop(mic);

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Test speaker output with a sine wave
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let tone = local::tone(440.0, Duration::from_secs(2), 24_000);
    println!(
        "Playing {} samples at {} Hz...",
        tone.samples.len(),
        tone.sample_rate
    );

    tokio::task::spawn_blocking(move || local::play_blocking(&tone, &AtomicBool::new(false)))
        .await??;

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");

    Ok(())
}
