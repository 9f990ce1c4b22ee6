use anyhow::{Context, Result};
use camdecode::bootstrap;
use camdecode::capability::{CapabilityDetector, NativeProbe};
use camdecode::config::{ConfigError, PipelineConfig};
use camdecode::decoder::NativeBackend;
use camdecode::nal;
use camdecode::packet_queue::PushOutcome;
use camdecode::scheduler::PacketSender;
use camdecode::{
    CloseReason, CodecKind, DecodedFrame, FrameSink, Packet, StreamEvent, StreamScheduler,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "camdecode")]
#[command(about = "Decode camera streams with hardware acceleration and software fallback")]
#[command(version)]
struct Cli {
    /// Pipeline config file (default: $CAMDECODE_CONFIG)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode every configured stream (default)
    Run,

    /// Probe the hardware accelerator and exit
    Probe {
        /// Accelerator device node (default: configured device, then /dev/dri/renderD128)
        #[arg(short, long)]
        device: Option<PathBuf>,
    },
}

/// Logs every sampled frame
struct LoggingSink;

impl FrameSink for LoggingSink {
    fn on_frame(&self, stream_id: &str, frame: DecodedFrame) {
        info!(
            stream = stream_id,
            pts = frame.pts,
            width = frame.width,
            height = frame.height,
            bytes = frame.payload.len(),
            "frame"
        );
    }

    fn on_closed(&self, stream_id: &str, reason: &CloseReason) {
        if reason.is_failure() {
            warn!(stream = stream_id, %reason, "stream failed");
        } else {
            info!(stream = stream_id, %reason, "stream finished");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Set RUST_LOG to control log level, e.g. RUST_LOG=camdecode=debug
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .with_level(true)
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(load_config(cli.config.as_deref())?).await,
        Commands::Probe { device } => probe(cli.config.as_deref(), device),
    }
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    match path {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => PipelineConfig::from_env().context("no config given, pass --config"),
    }
}

fn configure_libraries(config: &PipelineConfig) {
    let report = match &config.third_party_dir {
        Some(dir) => bootstrap::ensure_library_paths_configured_at(dir),
        None => bootstrap::ensure_library_paths_configured(),
    };
    match &report.root {
        Some(root) => info!(
            root = %root.display(),
            added = report.library_paths_added.len(),
            "bundled libraries configured"
        ),
        None => info!("using system libraries"),
    }
}

fn probe(config_path: Option<&Path>, device: Option<PathBuf>) -> Result<()> {
    let config = match config_path {
        Some(path) => load_config(Some(path))?,
        None => match PipelineConfig::from_env() {
            Ok(config) => config,
            Err(ConfigError::MissingPath) => PipelineConfig::default(),
            Err(e) => return Err(e).context("failed to load config"),
        },
    };
    configure_libraries(&config);

    let detector = CapabilityDetector::new(Arc::new(NativeProbe)).with_timeout(config.probe_timeout);
    let device = device.or(config.hw_device);
    let capability = detector.detect(device.as_deref());

    println!("available:   {}", capability.available);
    println!("accelerator: {:?}", capability.accelerator);
    if let Some(path) = &capability.device_path {
        println!("device:      {}", path.display());
    }
    let codecs: Vec<String> = capability
        .supported_codecs
        .iter()
        .map(CodecKind::to_string)
        .collect();
    println!("codecs:      {}", codecs.join(", "));
    if let Some(reason) = &capability.reason {
        println!("reason:      {}", reason);
    }
    Ok(())
}

async fn run(config: PipelineConfig) -> Result<()> {
    if config.streams.is_empty() {
        anyhow::bail!("no streams configured");
    }
    configure_libraries(&config);

    let detector =
        Arc::new(CapabilityDetector::new(Arc::new(NativeProbe)).with_timeout(config.probe_timeout));
    let scheduler = Arc::new(StreamScheduler::new(
        Arc::new(NativeBackend),
        detector,
        Arc::new(LoggingSink),
    ));
    let events = scheduler.events();

    let mut feeders = Vec::new();
    for stream in &config.streams {
        let stream_id = scheduler.add_stream(stream.clone())?;
        let sender = scheduler.packet_sender(&stream_id)?;
        match stream.source.clone() {
            Some(path) => {
                let codec = stream.codec;
                let fps = stream.source_fps;
                feeders.push(tokio::spawn(async move {
                    if let Err(e) = feed_source(&sender, codec, &path, fps).await {
                        error!(stream = sender.stream_id(), "source failed: {:#}", e);
                    }
                    sender.finish();
                }));
            }
            None => warn!(stream = %stream_id, "no source configured, stream stays idle"),
        }
    }

    let total = config.streams.len();
    let all_closed = tokio::task::spawn_blocking(move || {
        let mut closed = 0;
        for event in events.iter() {
            match &event {
                StreamEvent::Closed { stream_id, reason } => {
                    info!(stream = %stream_id, %reason, "closed");
                    closed += 1;
                    if closed == total {
                        break;
                    }
                }
                StreamEvent::FellBack { stream_id, reason } => {
                    warn!(stream = %stream_id, %reason, "fell back to software");
                }
                StreamEvent::PathSelected { stream_id, path } => {
                    info!(stream = %stream_id, %path, "decode path selected");
                }
                StreamEvent::Started { stream_id } => info!(stream = %stream_id, "started"),
            }
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupted, stopping streams"),
        _ = all_closed => info!("all streams closed"),
    }

    for feeder in &feeders {
        feeder.abort();
    }

    for status in scheduler.statuses() {
        info!(
            stream = %status.stream_id,
            state = %status.state,
            decoded = status.frames_decoded,
            emitted = status.frames_emitted,
            dropped = status.packets_dropped,
            "summary"
        );
    }

    let stopping = scheduler.clone();
    tokio::task::spawn_blocking(move || stopping.shutdown())
        .await
        .context("shutdown task failed")?;
    Ok(())
}

/// Feed an Annex-B file at `fps` access units per second
async fn feed_source(sender: &PacketSender, codec: CodecKind, path: &Path, fps: u32) -> Result<()> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let units = nal::access_units(codec, &data);
    info!(
        stream = sender.stream_id(),
        source = %path.display(),
        packets = units.len(),
        "feeding source"
    );

    let fps = fps.max(1);
    let mut ticker = tokio::time::interval(Duration::from_secs(1) / fps);
    let mut dropped = 0u64;
    for (index, unit) in units.into_iter().enumerate() {
        ticker.tick().await;
        let pts = index as i64 * 1000 / fps as i64;
        match sender.send(Packet::new(unit.data, pts, unit.is_keyframe)) {
            PushOutcome::Dropped => dropped += 1,
            PushOutcome::Closed => break,
            PushOutcome::Queued | PushOutcome::Evicted => {}
        }
    }

    if dropped > 0 {
        warn!(stream = sender.stream_id(), dropped, "decoder fell behind the source");
    }
    Ok(())
}
