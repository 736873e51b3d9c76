//! Recording session: wires cameras, acquirers, the saver and a sink together
//! and exposes start / stop / progress.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{info, instrument, warn};

use crate::capture::Camera;
use crate::error::SessionError;
use crate::pipeline::schedule::StreamState;
use crate::pipeline::{Acquirer, Saver};
use crate::storage::{AttributeValue, StorageSink};
use crate::timing::StageTimers;
use crate::{PipelineConfig, StreamConfig};

/// How [`Session::stop`] treats frames not yet persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Stop capture, then wait until everything captured is saved
    Drain,
    /// Stop capture and saving at once; buffered frames are discarded
    Immediate,
}

/// Point-in-time progress of one stream
#[derive(Debug, Clone, PartialEq)]
pub struct StreamProgress {
    pub name: String,
    pub fps: f64,
    pub frames_to_acquire: u64,
    pub frames_received: u64,
    pub frames_saved: u64,
    pub buffered: usize,
    pub queued: usize,
    pub capture_failures: u64,
    pub state: StreamState,
}

impl StreamProgress {
    /// Seconds' worth of frames captured
    pub fn acquired_secs(&self) -> f64 {
        self.frames_received as f64 / self.fps
    }

    /// Seconds' worth of frames persisted
    pub fn saved_secs(&self) -> f64 {
        self.frames_saved as f64 / self.fps
    }
}

/// Summary returned when a session ends
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub streams: Vec<StreamProgress>,
    pub elapsed: Duration,
}

/// A running recording.
pub struct Session {
    acquirers: Vec<Arc<Acquirer>>,
    saver: Saver,
    timers: Arc<StageTimers>,
    started: Instant,
}

impl Session {
    /// Initialize every camera, start the saving thread and one capture
    /// thread per stream. Stream `i` is written to dataset `i` of `sink`.
    #[instrument(skip_all, fields(streams = streams.len()))]
    pub fn start(
        pipeline: &PipelineConfig,
        streams: Vec<(StreamConfig, Box<dyn Camera>)>,
        sink: Box<dyn StorageSink>,
    ) -> Result<Self, SessionError> {
        if streams.is_empty() {
            return Err(SessionError::NoStreams);
        }

        let timers = Arc::new(StageTimers::new());
        let mut acquirers = Vec::with_capacity(streams.len());
        for (index, (config, camera)) in streams.into_iter().enumerate() {
            let acquirer = build_acquirer(index, &config, camera, pipeline, &timers)?;
            acquirers.push(Arc::new(acquirer));
        }

        for acquirer in &acquirers {
            acquirer
                .begin_acquisition()
                .map_err(|source| SessionError::Camera {
                    name: acquirer.name().to_string(),
                    source,
                })?;
        }
        wait_until_ready(&acquirers, Duration::from_millis(pipeline.ready_timeout_ms));

        let saver = Saver::start(acquirers.clone(), sink, pipeline, Arc::clone(&timers))?;
        for acquirer in &acquirers {
            acquirer.run()?;
        }

        info!("Recording started with {} stream(s)", acquirers.len());
        Ok(Self {
            acquirers,
            saver,
            timers,
            started: Instant::now(),
        })
    }

    pub fn progress(&self) -> Vec<StreamProgress> {
        self.acquirers
            .iter()
            .enumerate()
            .map(|(i, acquirer)| {
                // Saved first: a frame is counted as received before it can be saved
                let frames_saved = self.saver.frames_saved(i);
                StreamProgress {
                    name: acquirer.name().to_string(),
                    fps: acquirer.fps(),
                    frames_to_acquire: acquirer.frames_to_acquire(),
                    frames_received: acquirer.frames_received(),
                    frames_saved,
                    buffered: self.saver.buffered(i),
                    queued: acquirer.save_queue().len(),
                    capture_failures: acquirer.capture_failures(),
                    state: self.saver.stream_state(i),
                }
            })
            .collect()
    }

    /// The saver reached its natural exit: every bounded stream is saved
    pub fn is_complete(&self) -> bool {
        !self.saver.is_saving()
    }

    /// Acquirers in stream order, for preview consumers
    pub fn acquirers(&self) -> &[Arc<Acquirer>] {
        &self.acquirers
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// End the session, write session attributes and finish the sink.
    pub fn stop(mut self, mode: StopMode) -> Result<SessionReport, SessionError> {
        info!("Stopping session ({:?})", mode);
        for acquirer in &self.acquirers {
            acquirer.abort_acquisition();
        }
        for acquirer in &self.acquirers {
            if let Err(e) = acquirer.end_acquisition() {
                warn!("Failed to stop camera '{}': {}", acquirer.name(), e);
            }
        }

        self.saver.abort_saving(mode == StopMode::Immediate);

        let report = SessionReport {
            streams: self.progress(),
            elapsed: self.started.elapsed(),
        };

        if let Some(mut sink) = self.saver.take_sink() {
            self.write_attributes(sink.as_mut())?;
            sink.finish()?;
        } else {
            warn!("Sink unavailable; session attributes not written");
        }

        for stream in &report.streams {
            info!(
                "  {}: received {}, saved {} ({:.2} s), {:?}",
                stream.name,
                stream.frames_received,
                stream.frames_saved,
                stream.saved_secs(),
                stream.state
            );
        }
        info!("Stage timings:");
        self.timers.report();
        Ok(report)
    }

    fn write_attributes(&self, sink: &mut dyn StorageSink) -> Result<(), SessionError> {
        for (i, acquirer) in self.acquirers.iter().enumerate() {
            let name = acquirer.name();
            sink.write_attribute(&format!("{}_fps", name), acquirer.fps().into())?;
            let saved = i64::try_from(self.saver.frames_saved(i)).unwrap_or(i64::MAX);
            sink.write_attribute(&format!("{}_frames", name), saved.into())?;
            for (key, value) in acquirer.camera_attributes() {
                sink.write_attribute(&format!("{}_{}", name, key), value)?;
            }
        }
        let chunk = i64::try_from(self.saver.frame_chunk_size()).unwrap_or(i64::MAX);
        sink.write_attribute("frame_chunk_size", AttributeValue::Int(chunk))?;
        Ok(())
    }
}

fn build_acquirer(
    index: usize,
    config: &StreamConfig,
    camera: Box<dyn Camera>,
    pipeline: &PipelineConfig,
    timers: &Arc<StageTimers>,
) -> Result<Acquirer, SessionError> {
    if config.fps.is_nan() || config.fps <= 0.0 {
        return Err(SessionError::InvalidStream {
            name: config.name.clone(),
            reason: format!("fps must be positive, got {}", config.fps),
        });
    }

    let mut acquirer = Acquirer::new(&config.name, camera, pipeline, Arc::clone(timers))
        .map_err(|source| SessionError::Camera {
            name: config.name.clone(),
            source,
        })?;

    if acquirer.geometry() != config.geometry() {
        warn!(
            "Camera '{}' reports {:?}, configured {:?}; using the camera's",
            config.name,
            acquirer.geometry(),
            config.geometry()
        );
    }
    if (acquirer.fps() - config.fps).abs() > f64::EPSILON {
        warn!(
            "Camera '{}' runs at {} fps, configured {}",
            config.name,
            acquirer.fps(),
            config.fps
        );
    }
    if acquirer.fps().is_nan() || acquirer.fps() <= 0.0 {
        return Err(SessionError::InvalidStream {
            name: config.name.clone(),
            reason: format!("camera reports fps {}", acquirer.fps()),
        });
    }

    if pipeline.pin_threads {
        acquirer.pin_to_core(index);
    }
    acquirer.set_frames_to_acquire(config.frames_to_acquire());
    info!(
        "  {}: {:.1} fps, {} frame(s) to acquire ({:.1} s)",
        config.name,
        acquirer.fps(),
        acquirer.frames_to_acquire(),
        acquirer.seconds_to_acquire()
    );
    Ok(acquirer)
}

fn wait_until_ready(acquirers: &[Arc<Acquirer>], timeout: Duration) {
    let deadline = Instant::now() + timeout;
    for acquirer in acquirers {
        while !acquirer.is_camera_ready() {
            if Instant::now() >= deadline {
                warn!(
                    "Camera '{}' not ready after {:?}; starting anyway",
                    acquirer.name(),
                    timeout
                );
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }
}
