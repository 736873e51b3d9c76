use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use labcap::capture::{Camera, Frame, Geometry, PixelFormat};
use labcap::error::{CameraError, SinkError};
use labcap::pipeline::{Acquirer, Saver, StreamState};
use labcap::session::{Session, StopMode};
use labcap::storage::{
    AttributeValue, DatasetSpec, MemorySink, RawChunkSink, Segment, StorageSink,
};
use labcap::timing::StageTimers;
use labcap::{CameraSource, PipelineConfig, StreamConfig};

const WIDTH: usize = 8;

fn geometry() -> Geometry {
    Geometry::for_format(WIDTH, 1, PixelFormat::Gray8)
}

fn tag(frame: &Frame) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&frame.data()[..8]);
    u64::from_le_bytes(bytes)
}

/// Delivers frames tagged 0, 1, 2, ... as fast as asked. Every
/// `invalid_every`-th call yields an invalid frame and every `error_every`-th
/// call an error; neither consumes a tag.
struct TagCamera {
    fps: f64,
    next: u64,
    calls: u64,
    invalid_every: u64,
    error_every: u64,
}

impl TagCamera {
    fn new(fps: f64) -> Self {
        Self {
            fps,
            next: 0,
            calls: 0,
            invalid_every: 0,
            error_every: 0,
        }
    }
}

impl Camera for TagCamera {
    fn get_frame(&mut self) -> Result<Frame, CameraError> {
        self.calls += 1;
        if self.error_every > 0 && self.calls % self.error_every == 0 {
            return Err(CameraError::Timeout);
        }
        if self.invalid_every > 0 && self.calls % self.invalid_every == 0 {
            return Ok(Frame::invalid());
        }
        let frame = Frame::from_vec(geometry(), self.next.to_le_bytes().to_vec())?;
        self.next += 1;
        Ok(frame)
    }

    fn geometry(&self) -> Geometry {
        geometry()
    }

    fn fps(&self) -> f64 {
        self.fps
    }
}

fn stream(name: &str, fps: f64, frames: u64) -> StreamConfig {
    StreamConfig {
        name: name.to_string(),
        source: CameraSource::Synthetic,
        width: WIDTH,
        height: 1,
        format: PixelFormat::Gray8,
        fps,
        duration_secs: frames as f64 / fps,
    }
}

fn pipeline(chunk: usize, capacity: usize) -> PipelineConfig {
    PipelineConfig {
        queue_capacity: capacity,
        frame_chunk_size: chunk,
        enqueue_poll_ms: 5,
        ready_timeout_ms: 100,
        max_flush_failures: 0,
        ..PipelineConfig::default()
    }
}

fn specs(streams: &[StreamConfig]) -> Vec<DatasetSpec> {
    streams.iter().map(StreamConfig::dataset_spec).collect()
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn frames_arrive_in_capture_order_with_final_partial_chunk() {
    let config = stream("tags", 30.0, 100);
    let sink = MemorySink::new(specs(&[config.clone()]));
    let handle = sink.handle();

    let session = Session::start(
        &pipeline(30, 100),
        vec![(config, Box::new(TagCamera::new(30.0)) as Box<dyn Camera>)],
        Box::new(sink),
    )
    .unwrap();

    let mut last_saved = 0;
    wait_until("completion", || {
        let progress = &session.progress()[0];
        assert!(progress.frames_saved <= progress.frames_received);
        assert!(progress.frames_saved >= last_saved);
        last_saved = progress.frames_saved;
        session.is_complete()
    });
    session.stop(StopMode::Drain).unwrap();

    assert_eq!(handle.chunk_sizes(0), vec![30, 30, 30, 10]);
    let tags: Vec<u64> = handle.frames(0).iter().map(tag).collect();
    assert_eq!(tags, (0..100).collect::<Vec<_>>());
}

#[test]
fn saved_never_runs_ahead_of_received() {
    let config = pipeline(1, 1);
    let timers = Arc::new(StageTimers::new());
    let acquirer = Arc::new(
        Acquirer::new("tight", Box::new(TagCamera::new(30.0)), &config, Arc::clone(&timers))
            .unwrap(),
    );
    let sink = MemorySink::new(vec![DatasetSpec::new("tight", geometry())]);
    let mut saver = Saver::start(vec![Arc::clone(&acquirer)], Box::new(sink), &config, timers)
        .unwrap();
    acquirer.run().unwrap();

    let deadline = Instant::now() + Duration::from_millis(200);
    let mut samples = 0u64;
    while Instant::now() < deadline {
        // Same order as a progress report: saved, then received
        let saved = saver.frames_saved(0);
        let received = acquirer.frames_received();
        assert!(saved <= received, "saved {} > received {}", saved, received);
        samples += 1;
    }

    acquirer.abort_acquisition();
    saver.abort_saving(true);
    assert!(samples > 0);
    assert!(saver.frames_saved(0) > 0);
    assert!(saver.frames_saved(0) <= acquirer.frames_received());
}

/// Tagged camera that switches from `WIDTH` to `WIDTH + 1` pixels per row
/// after `switch_at` frames.
struct WideningCamera {
    next: u64,
    switch_at: u64,
}

impl WideningCamera {
    fn current(&self) -> Geometry {
        let width = if self.next < self.switch_at { WIDTH } else { WIDTH + 1 };
        Geometry::for_format(width, 1, PixelFormat::Gray8)
    }
}

impl Camera for WideningCamera {
    fn get_frame(&mut self) -> Result<Frame, CameraError> {
        let geometry = self.current();
        let mut pixels = self.next.to_le_bytes().to_vec();
        pixels.resize(geometry.bytes(), 0xff);
        let frame = Frame::from_vec(geometry, pixels)?;
        self.next += 1;
        Ok(frame)
    }

    fn geometry(&self) -> Geometry {
        self.current()
    }

    fn fps(&self) -> f64 {
        30.0
    }
}

#[test]
fn geometry_change_mid_stream_keeps_every_frame() {
    let config = stream("widening", 30.0, 30);
    let sink = MemorySink::new(specs(&[config.clone()]));
    let handle = sink.handle();
    let camera = WideningCamera {
        next: 0,
        switch_at: 15,
    };

    let session = Session::start(
        &pipeline(10, 100),
        vec![(config, Box::new(camera) as Box<dyn Camera>)],
        Box::new(sink),
    )
    .unwrap();
    wait_until("completion", || session.is_complete());
    let report = session.stop(StopMode::Drain).unwrap();

    assert_eq!(report.streams[0].state, StreamState::Complete);
    assert_eq!(report.streams[0].frames_saved, 30);
    let tags: Vec<u64> = handle.frames(0).iter().map(tag).collect();
    assert_eq!(tags, (0..30).collect::<Vec<_>>());
    // Chunks stop at the shape change instead of mixing shapes
    assert_eq!(handle.chunk_sizes(0), vec![10, 5, 10, 5]);
    assert_eq!(
        handle.segments(0),
        vec![
            Segment {
                first_frame: 0,
                geometry: geometry(),
            },
            Segment {
                first_frame: 15,
                geometry: Geometry::for_format(WIDTH + 1, 1, PixelFormat::Gray8),
            },
        ]
    );
}

/// Records saving progress of every stream after each acknowledged chunk.
struct ProgressSink {
    inner: MemorySink,
    fps: Vec<f64>,
    saved: Vec<u64>,
    spread: Arc<Mutex<Vec<f64>>>,
}

impl StorageSink for ProgressSink {
    fn append_chunk(&mut self, stream: usize, frames: &[Frame]) -> Result<(), SinkError> {
        self.inner.append_chunk(stream, frames)?;
        self.saved[stream] += frames.len() as u64;
        let progress: Vec<f64> = self
            .saved
            .iter()
            .zip(&self.fps)
            .map(|(&saved, &fps)| saved as f64 / fps)
            .collect();
        let max = progress.iter().cloned().fold(f64::MIN, f64::max);
        let min = progress.iter().cloned().fold(f64::MAX, f64::min);
        self.spread.lock().unwrap().push(max - min);
        Ok(())
    }

    fn write_attribute(&mut self, name: &str, value: AttributeValue) -> Result<(), SinkError> {
        self.inner.write_attribute(name, value)
    }
}

#[test]
fn streams_stay_level_in_recorded_time() {
    let streams = [stream("fast", 30.0, 300), stream("slow", 10.0, 100)];
    let spread = Arc::new(Mutex::new(Vec::new()));
    let sink = ProgressSink {
        inner: MemorySink::new(specs(&streams)),
        fps: vec![30.0, 10.0],
        saved: vec![0, 0],
        spread: Arc::clone(&spread),
    };

    let inputs: Vec<(StreamConfig, Box<dyn Camera>)> = streams
        .iter()
        .map(|s| (s.clone(), Box::new(TagCamera::new(s.fps)) as Box<dyn Camera>))
        .collect();
    let session = Session::start(&pipeline(10, 100), inputs, Box::new(sink)).unwrap();
    wait_until("completion", || session.is_complete());
    let report = session.stop(StopMode::Drain).unwrap();

    assert_eq!(report.streams[0].frames_saved, 300);
    assert_eq!(report.streams[1].frames_saved, 100);
    let spread = spread.lock().unwrap();
    assert_eq!(spread.len(), 40);
    for (i, gap) in spread.iter().enumerate() {
        assert!(*gap <= 1.0 + 1e-9, "chunk {}: streams {} s apart", i, gap);
    }
}

/// Sink whose appends block until the gate opens.
#[derive(Clone)]
struct Gate(Arc<(Mutex<bool>, Condvar)>);

impl Gate {
    fn closed() -> Self {
        Gate(Arc::new((Mutex::new(false), Condvar::new())))
    }

    fn open(&self) {
        *self.0 .0.lock().unwrap() = true;
        self.0 .1.notify_all();
    }

    fn wait(&self) {
        let mut open = self.0 .0.lock().unwrap();
        while !*open {
            open = self.0 .1.wait(open).unwrap();
        }
    }
}

struct GatedSink {
    inner: MemorySink,
    gate: Gate,
}

impl StorageSink for GatedSink {
    fn append_chunk(&mut self, stream: usize, frames: &[Frame]) -> Result<(), SinkError> {
        self.gate.wait();
        self.inner.append_chunk(stream, frames)
    }

    fn write_attribute(&mut self, name: &str, value: AttributeValue) -> Result<(), SinkError> {
        self.inner.write_attribute(name, value)
    }
}

#[test]
fn stalled_sink_throttles_capture() {
    let chunk = 4;
    let capacity = 5;
    let config = stream("stalled", 30.0, 0);
    let gate = Gate::closed();
    let sink = GatedSink {
        inner: MemorySink::new(specs(&[config.clone()])),
        gate: gate.clone(),
    };

    let session = Session::start(
        &pipeline(chunk, capacity),
        vec![(config, Box::new(TagCamera::new(30.0)) as Box<dyn Camera>)],
        Box::new(sink),
    )
    .unwrap();

    // Saver blocked in its first flush and the acquirer blocked on a full queue
    wait_until("pipeline to stall", || {
        session.progress()[0].buffered >= chunk && session.acquirers()[0].save_queue().is_full()
    });
    thread::sleep(Duration::from_millis(50));
    let received = session.progress()[0].frames_received;
    thread::sleep(Duration::from_millis(100));
    let later = session.progress()[0].frames_received;

    assert_eq!(received, later, "capture kept running against a stalled sink");
    assert!(later as usize <= 2 * chunk + capacity);
    assert_eq!(session.progress()[0].frames_saved, 0);

    gate.open();
    let report = session.stop(StopMode::Drain).unwrap();
    assert_eq!(report.streams[0].frames_saved, report.streams[0].frames_received);
}

/// Fails the first `failures` appends, then delegates.
struct FlakySink {
    inner: MemorySink,
    failures: Arc<AtomicUsize>,
}

impl StorageSink for FlakySink {
    fn append_chunk(&mut self, stream: usize, frames: &[Frame]) -> Result<(), SinkError> {
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(SinkError::Rejected("disk full".to_string()));
        }
        self.inner.append_chunk(stream, frames)
    }

    fn write_attribute(&mut self, name: &str, value: AttributeValue) -> Result<(), SinkError> {
        self.inner.write_attribute(name, value)
    }
}

#[test]
fn failed_chunk_is_retried_without_loss_or_duplication() {
    let config = stream("retry", 30.0, 50);
    let sink = MemorySink::new(specs(&[config.clone()]));
    let handle = sink.handle();
    let flaky = FlakySink {
        inner: sink,
        failures: Arc::new(AtomicUsize::new(2)),
    };

    let session = Session::start(
        &pipeline(10, 100),
        vec![(config, Box::new(TagCamera::new(30.0)) as Box<dyn Camera>)],
        Box::new(flaky),
    )
    .unwrap();
    wait_until("completion", || session.is_complete());
    let report = session.stop(StopMode::Drain).unwrap();

    assert_eq!(report.streams[0].state, StreamState::Complete);
    let tags: Vec<u64> = handle.frames(0).iter().map(tag).collect();
    assert_eq!(tags, (0..50).collect::<Vec<_>>());
}

#[test]
fn persistent_sink_failure_marks_stream_failed() {
    let streams = [stream("broken", 30.0, 40), stream("fine", 30.0, 40)];
    let sink = MemorySink::new(specs(&streams));
    let handle = sink.handle();

    struct BrokenFirst(MemorySink);
    impl StorageSink for BrokenFirst {
        fn append_chunk(&mut self, stream: usize, frames: &[Frame]) -> Result<(), SinkError> {
            if stream == 0 {
                return Err(SinkError::Rejected("read-only".to_string()));
            }
            self.0.append_chunk(stream, frames)
        }

        fn write_attribute(&mut self, name: &str, value: AttributeValue) -> Result<(), SinkError> {
            self.0.write_attribute(name, value)
        }
    }

    let config = PipelineConfig {
        max_flush_failures: 3,
        ..pipeline(10, 100)
    };
    let inputs: Vec<(StreamConfig, Box<dyn Camera>)> = streams
        .iter()
        .map(|s| (s.clone(), Box::new(TagCamera::new(s.fps)) as Box<dyn Camera>))
        .collect();
    let session = Session::start(&config, inputs, Box::new(BrokenFirst(sink))).unwrap();
    wait_until("completion", || session.is_complete());
    let report = session.stop(StopMode::Drain).unwrap();

    assert_eq!(report.streams[0].state, StreamState::Failed);
    assert_eq!(report.streams[0].frames_saved, 0);
    assert_eq!(report.streams[1].state, StreamState::Complete);
    assert_eq!(handle.frame_count(0), 0);
    assert_eq!(handle.frame_count(1), 40);
}

#[test]
fn invalid_frames_and_errors_never_reach_storage() {
    let config = stream("noisy", 30.0, 30);
    let sink = MemorySink::new(specs(&[config.clone()]));
    let handle = sink.handle();
    let camera = TagCamera {
        invalid_every: 3,
        error_every: 5,
        ..TagCamera::new(30.0)
    };

    let session = Session::start(
        &pipeline(10, 100),
        vec![(config, Box::new(camera) as Box<dyn Camera>)],
        Box::new(sink),
    )
    .unwrap();
    wait_until("completion", || session.is_complete());
    let report = session.stop(StopMode::Drain).unwrap();

    assert!(report.streams[0].capture_failures > 0);
    assert_eq!(report.streams[0].frames_received, 30);
    let tags: Vec<u64> = handle.frames(0).iter().map(tag).collect();
    assert_eq!(tags, (0..30).collect::<Vec<_>>());
}

#[test]
fn aborts_are_idempotent() {
    let config = pipeline(10, 8);
    let timers = Arc::new(StageTimers::new());
    let acquirer = Arc::new(
        Acquirer::new("solo", Box::new(TagCamera::new(30.0)), &config, Arc::clone(&timers))
            .unwrap(),
    );
    let sink = MemorySink::new(vec![DatasetSpec::new("solo", geometry())]);
    let handle = sink.handle();

    let mut saver = Saver::start(vec![Arc::clone(&acquirer)], Box::new(sink), &config, timers)
        .unwrap();
    acquirer.run().unwrap();
    wait_until("some frames saved", || saver.frames_saved(0) >= 20);

    acquirer.abort_acquisition();
    acquirer.abort_acquisition();
    let received = acquirer.frames_received();
    assert!(!acquirer.is_acquiring());

    saver.abort_saving(true);
    let saved = saver.frames_saved(0);
    saver.abort_saving(true);
    assert_eq!(saver.frames_saved(0), saved);
    assert!(!saver.is_saving());
    assert!(saved <= received);
    assert_eq!(handle.frame_count(0) as u64, saved);
    assert!(saver.take_sink().is_some());
}

#[test]
fn records_session_to_disk() {
    let dir = tempfile::tempdir().unwrap();
    let streams = [stream("left", 20.0, 25), stream("right", 10.0, 12)];
    let sink = RawChunkSink::create(dir.path(), specs(&streams), false).unwrap();

    let inputs: Vec<(StreamConfig, Box<dyn Camera>)> = streams
        .iter()
        .map(|s| (s.clone(), Box::new(TagCamera::new(s.fps)) as Box<dyn Camera>))
        .collect();
    let session = Session::start(&pipeline(10, 100), inputs, Box::new(sink)).unwrap();
    wait_until("completion", || session.is_complete());
    session.stop(StopMode::Drain).unwrap();

    let left = std::fs::read(dir.path().join("left.frames")).unwrap();
    assert_eq!(left.len(), 25 * WIDTH);
    let right_times = std::fs::read(dir.path().join("right_time.f64")).unwrap();
    assert_eq!(right_times.len(), 12 * 8);

    let manifest: toml::Value =
        toml::from_str(&std::fs::read_to_string(dir.path().join("session.toml")).unwrap())
            .unwrap();
    let datasets = manifest["datasets"].as_array().unwrap();
    assert_eq!(datasets[0]["frames"].as_integer(), Some(25));
    assert_eq!(datasets[1]["dims"].as_array().unwrap().len(), 3);
    assert_eq!(manifest["attributes"]["right_fps"].as_float(), Some(10.0));
    assert_eq!(manifest["attributes"]["frame_chunk_size"].as_integer(), Some(10));
}
