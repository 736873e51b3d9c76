//! labcap: synchronized multi-camera recorder

use std::path::PathBuf;
use std::time::Duration;

use color_eyre::Result;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use labcap::capture::{Camera, SyntheticCamera};
use labcap::session::{Session, StopMode};
use labcap::storage::RawChunkSink;
use labcap::{CameraSource, Config, StreamConfig};

const PROGRESS_EVERY: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    init_tracing();

    info!("labcap launching...");

    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("labcap.toml"));
    let config = Config::load(Some(path.as_path()))?;
    info!("Loaded configuration ({} stream(s))", config.streams.len());

    let sink = RawChunkSink::create(
        &config.storage.path,
        config.dataset_specs(),
        config.storage.sync_on_chunk,
    )?;

    let streams = config
        .streams
        .iter()
        .map(|stream| Ok((stream.clone(), open_camera(stream)?)))
        .collect::<Result<Vec<_>>>()?;

    let pipeline = config.pipeline.clone();
    let session =
        tokio::task::spawn_blocking(move || Session::start(&pipeline, streams, Box::new(sink)))
            .await??;

    let mut ticker = tokio::time::interval(PROGRESS_EVERY);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mode = loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                warn!("Interrupted; draining buffered frames");
                break StopMode::Drain;
            }
            _ = ticker.tick() => {
                for stream in session.progress() {
                    info!(
                        "{}: acquired {:.1} s, saved {:.1} s, queued {}",
                        stream.name,
                        stream.acquired_secs(),
                        stream.saved_secs(),
                        stream.queued
                    );
                }
                if session.is_complete() {
                    break StopMode::Drain;
                }
            }
        }
    };

    let report = tokio::task::spawn_blocking(move || session.stop(mode)).await??;
    info!(
        "labcap shutting down after {:.1} s",
        report.elapsed.as_secs_f64()
    );
    Ok(())
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("labcap=info"));
    let fmt = tracing_subscriber::fmt::layer().with_timer(tracing_subscriber::fmt::time::uptime());

    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    let registry = tracing_subscriber::registry().with(filter).with(fmt);

    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());

    registry.init();
}

fn open_camera(stream: &StreamConfig) -> Result<Box<dyn Camera>> {
    match &stream.source {
        CameraSource::Synthetic => Ok(Box::new(SyntheticCamera::new(
            &stream.name,
            stream.geometry(),
            stream.fps,
        ))),
        #[cfg(feature = "v4l2")]
        CameraSource::V4l2 { device } => Ok(Box::new(labcap::capture::V4l2Camera::new(
            device,
            stream.width as u32,
            stream.height as u32,
            stream.fps,
        ))),
        #[cfg(not(feature = "v4l2"))]
        CameraSource::V4l2 { .. } => Err(color_eyre::eyre::eyre!(
            "stream '{}' needs a V4L2 camera; rebuild with --features v4l2",
            stream.name
        )),
    }
}
