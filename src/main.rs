use anyhow::{Context, Result};
use clap::Parser;
use colored::*;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sensor_pipeline_lib::{
    Pipeline, PipelineConfig, PipelineError, SimulatedBackend, StreamFormat, StreamKind, StreamRequest,
};

/// Stream synchronized framesets from a simulated depth camera
#[derive(Parser, Debug)]
#[command(name = "sensor-pipeline", version, about)]
struct Cli {
    /// Pipeline configuration (JSON)
    #[arg(long, env = "SENSOR_PIPELINE_CONFIG")]
    config: Option<PathBuf>,

    /// Simulated device catalog (JSON); the built-in catalog is used otherwise
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Only use the device with this serial
    #[arg(long)]
    serial: Option<String>,

    /// Stop after this many framesets (runs until Ctrl-C when omitted)
    #[arg(long)]
    frames: Option<u64>,

    /// Let the device choose its default streams instead of depth + color
    #[arg(long)]
    any: bool,

    /// Log every sample (rate limited) through the pipeline debug channel
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    if cli.debug {
        sensor_pipeline_lib::log::set_pipeline_debug(true);
    }

    let config = match &cli.config {
        Some(path) => PipelineConfig::from_json_file(path)?,
        None => PipelineConfig::default(),
    };
    let backend = match &cli.catalog {
        Some(path) => SimulatedBackend::from_json_file(path)?,
        None => SimulatedBackend::new(SimulatedBackend::default_catalog()),
    }
    .with_free_running(true);

    let pipeline = Arc::new(Pipeline::with_config(Arc::new(backend), config));

    if let Some(serial) = &cli.serial {
        pipeline.enable_device(serial)?;
    }
    if !cli.any {
        pipeline.enable_stream(StreamRequest::video(StreamKind::Depth, 640, 480, StreamFormat::Any, 30))?;
        pipeline.enable_stream(StreamRequest::video(StreamKind::Color, 1280, 720, StreamFormat::Any, 30))?;
    }

    pipeline.start().context("Failed to start pipeline")?;
    let device = pipeline.get_active_device()?;
    info!(
        "{}: {} ({})",
        "DEMO".on_green().white(),
        device.name,
        device.serial
    );
    for profile in pipeline.get_active_streams()? {
        info!("  {}", profile);
    }

    let mut reader = {
        let pipeline = pipeline.clone();
        let limit = cli.frames;
        tokio::task::spawn_blocking(move || -> u64 {
            let mut received = 0u64;
            while limit.map_or(true, |limit| received < limit) {
                match pipeline.wait_for_frameset_default() {
                    Ok(frameset) => {
                        received += 1;
                        let streams: Vec<String> =
                            frameset.iter().map(|frame| frame.key().to_string()).collect();
                        info!(
                            "Frameset #{} at {:.1}ms: {}",
                            received,
                            frameset.timestamp_ms(),
                            streams.join(", ")
                        );
                    }
                    Err(PipelineError::Timeout { timeout_ms }) => {
                        warn!("No frameset within {}ms", timeout_ms);
                    }
                    Err(PipelineError::PipelineStopped) => break,
                    Err(e) => {
                        warn!("Frameset retrieval failed: {}", e);
                        break;
                    }
                }
            }
            received
        })
    };

    let received = tokio::select! {
        result = &mut reader => result.context("Frameset reader panicked")?,
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received, stopping");
            pipeline.stop();
            reader.await.context("Frameset reader panicked")?
        }
    };

    pipeline.stop();
    let stats = pipeline.delivery_stats();
    info!(
        "{}: {} framesets received, {} published, {} dropped, {} samples superseded",
        "DEMO".on_green().white(),
        received,
        stats.framesets_published,
        stats.framesets_dropped,
        stats.samples_superseded
    );
    Ok(())
}
