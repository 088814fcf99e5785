//! ClearVolume CLI Application

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use clearvolume_core::domain::audio::{MediaSource, NullSink, OutputSink};
use clearvolume_core::domain::config::{ClearVolumeConfig, Command, CommandResult, ConfigManager};
use clearvolume_core::domain::events::{NotificationHub, Notifier};
use clearvolume_infra::audio::CpalOutput;
use clearvolume_infra::{PipelineService, ServiceHandle, ToneSource, ToneSpec};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "clearvolume")]
#[command(about = "Per-source volume boost with clipping protection", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (defaults to the user config directory)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Boost synthetic tone sources and play them
    Run(RunArgs),
    /// Write the default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Tone frequency in Hz, one source per flag
    #[arg(long = "tone", value_name = "HZ")]
    tones: Vec<f32>,

    /// Tone amplitude (0.0 - 1.0)
    #[arg(long, default_value_t = 0.5)]
    amplitude: f32,

    /// Volume in percent (100 = unity, up to 600)
    #[arg(long)]
    volume: Option<f32>,

    /// Mid EQ gain in dB
    #[arg(long, allow_hyphen_values = true)]
    mid: Option<f32>,

    /// Treble EQ gain in dB
    #[arg(long, allow_hyphen_values = true)]
    treble: Option<f32>,

    /// How long to play, in seconds
    #[arg(long, default_value_t = 5.0)]
    seconds: f64,

    /// Render to a null sink instead of an audio device
    #[arg(long)]
    no_audio: bool,

    /// Print the final status as JSON
    #[arg(long)]
    json: bool,
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn config_manager(path: Option<PathBuf>) -> anyhow::Result<ConfigManager> {
    match path {
        Some(path) => Ok(ConfigManager::for_file(path)),
        None => Ok(ConfigManager::new(
            ConfigManager::default_config_dir().context("Could not resolve config directory")?,
        )),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let manager = config_manager(cli.config)?;
    match cli.command {
        Commands::Run(args) => run(&manager, args).await,
        Commands::InitConfig { force } => init_config(&manager, force).await,
    }
}

async fn init_config(manager: &ConfigManager, force: bool) -> anyhow::Result<()> {
    if manager.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            manager.config_path().display()
        );
    }

    manager
        .save(&ClearVolumeConfig::factory_default())
        .await
        .context("Failed to write configuration")?;
    println!("{}", manager.config_path().display());
    Ok(())
}

async fn run(manager: &ConfigManager, args: RunArgs) -> anyhow::Result<()> {
    let duration = play_duration(args.seconds)?;
    info!("ClearVolume starting...");
    let config = manager.load().await;

    let hub = Arc::new(NotificationHub::default());
    let mut events = hub.subscribe();
    let relay = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => info!(relay = %event.to_relay_json(), "Clipping notification"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Notification observer lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    // The device stream must stay on this thread for as long as audio plays
    let (output, sink) = open_output(&config, args.no_audio);

    let notifier: Arc<dyn Notifier> = hub.clone();
    let (handle, service) = PipelineService::from_config(&config, notifier, sink).spawn();

    apply_settings(&handle, &args).await?;

    let stream = config.stream_config();
    let frequencies = if args.tones.is_empty() {
        vec![ToneSpec::default().frequency]
    } else {
        args.tones.clone()
    };
    let tones: Vec<Arc<ToneSource>> = frequencies
        .into_iter()
        .map(|frequency| {
            Arc::new(ToneSource::new(
                ToneSpec {
                    frequency,
                    amplitude: args.amplitude,
                },
                stream.sample_rate.hz(),
                stream.channels.count(),
            ))
        })
        .collect();

    for tone in &tones {
        let source: Arc<dyn MediaSource> = tone.clone();
        match handle.send(Command::Attach { source }).await? {
            CommandResult::Attached { id } => info!(%id, label = %tone.label(), "Playing"),
            CommandResult::Error(message) => warn!(label = %tone.label(), "Attach failed: {}", message),
            other => warn!(label = %tone.label(), ?other, "Source not attached"),
        }
    }

    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    let status = handle.status().await?;
    drop(handle);
    service.await.context("Pipeline service panicked")?;
    relay.abort();

    if let Some(output) = &output {
        info!(
            device = output.device_name(),
            dropped = output.dropped(),
            underrun = output.underrun(),
            "Output stream closing"
        );
    }
    drop(tones);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!(
            "volume {:.0}% | mid {:+.1} dB | treble {:+.1} dB | {} active pipeline(s)",
            status.volume_percent, status.equalizer.mid, status.equalizer.treble, status.active_count
        );
    }

    info!("ClearVolume stopped");
    Ok(())
}

fn play_duration(seconds: f64) -> anyhow::Result<Duration> {
    match Duration::try_from_secs_f64(seconds) {
        Ok(duration) => Ok(duration),
        Err(e) => bail!("--seconds must be a finite, non-negative number, got {} ({})", seconds, e),
    }
}

fn open_output(config: &ClearVolumeConfig, no_audio: bool) -> (Option<CpalOutput>, Box<dyn OutputSink>) {
    if no_audio {
        return (None, Box::new(NullSink));
    }

    match CpalOutput::open(&config.stream_config(), config.output.device_name()) {
        Ok((output, sink)) => {
            info!(device = output.device_name(), "Audio output opened");
            (Some(output), Box::new(sink))
        }
        Err(e) => {
            warn!(error = %e, "No audio output available, rendering to null sink");
            (None, Box::new(NullSink))
        }
    }
}

async fn apply_settings(handle: &ServiceHandle, args: &RunArgs) -> anyhow::Result<()> {
    if let Some(percent) = args.volume {
        handle.send(Command::SetVolume { percent }).await?;
    }

    if args.mid.is_some() || args.treble.is_some() {
        let current = handle.status().await?.equalizer;
        handle
            .send(Command::SetEqualizer {
                mid_db: args.mid.unwrap_or(current.mid),
                treble_db: args.treble.unwrap_or(current.treble),
            })
            .await?;
    }

    Ok(())
}
