//! Saving thread: drains every stream's save-queue into a per-stream write
//! buffer and flushes chunks to the storage sink, serving the stream with
//! the least saving progress first.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::utils::Backoff;
use metrics::{Counter, Gauge};
use tracing::{debug, error, info, warn};

use crate::capture::Frame;
use crate::error::{SessionError, SinkError};
use crate::pipeline::acquirer::Acquirer;
use crate::pipeline::schedule::{self, StreamState, StreamView};
use crate::storage::StorageSink;
use crate::timing::{Stage, StageTimers};
use crate::PipelineConfig;

/// Progress of one stream, published by the saving thread
#[derive(Default)]
struct Progress {
    frames_saved: AtomicU64,
    buffered: AtomicUsize,
    state: AtomicU8,
}

fn encode_state(state: StreamState) -> u8 {
    match state {
        StreamState::Active => 0,
        StreamState::Complete => 1,
        StreamState::Failed => 2,
    }
}

fn decode_state(raw: u8) -> StreamState {
    match raw {
        1 => StreamState::Complete,
        2 => StreamState::Failed,
        _ => StreamState::Active,
    }
}

struct Shared {
    saving: AtomicBool,
    finished: AtomicBool,
    progress: Vec<Progress>,
}

/// Owns the saving thread for one recording session.
pub struct Saver {
    shared: Arc<Shared>,
    fps: Vec<f64>,
    frame_chunk_size: usize,
    thread: Option<JoinHandle<Box<dyn StorageSink>>>,
    sink: Option<Box<dyn StorageSink>>,
}

impl Saver {
    /// Spawn the saving thread over `acquirers`; stream `i` of the sink is
    /// `acquirers[i]`.
    pub fn start(
        acquirers: Vec<Arc<Acquirer>>,
        sink: Box<dyn StorageSink>,
        config: &PipelineConfig,
        timers: Arc<StageTimers>,
    ) -> Result<Self, SessionError> {
        let streams = acquirers.len();
        let shared = Arc::new(Shared {
            saving: AtomicBool::new(true),
            finished: AtomicBool::new(false),
            progress: (0..streams).map(|_| Progress::default()).collect(),
        });
        let fps = acquirers.iter().map(|a| a.fps()).collect();
        let frame_chunk_size = config.frame_chunk_size.max(1);

        let save_loop = SaveLoop {
            buffers: (0..streams).map(|_| VecDeque::new()).collect(),
            saved: vec![0; streams],
            failures: vec![0; streams],
            states: vec![StreamState::Active; streams],
            meters: acquirers.iter().map(|a| StreamMeters::new(a.name())).collect(),
            acquirers,
            sink,
            shared: Arc::clone(&shared),
            frame_chunk_size,
            idle_poll: Duration::from_millis(config.idle_poll_ms.max(1)),
            max_flush_failures: config.max_flush_failures,
            timers,
        };

        let thread = thread::Builder::new()
            .name("saver".to_string())
            .spawn(move || save_loop.run())
            .map_err(SessionError::Spawn)?;

        info!(
            "Saving thread started: {} stream(s), chunks of {} frame(s)",
            streams, frame_chunk_size
        );
        Ok(Self {
            shared,
            fps,
            frame_chunk_size,
            thread: Some(thread),
            sink: None,
        })
    }

    /// Join the saving thread. Idempotent.
    ///
    /// With `stop_immediately` the loop is told to exit at its next pass and
    /// frames still in write buffers are not flushed. Without it this waits
    /// for every bounded stream to be fully saved.
    pub fn abort_saving(&mut self, stop_immediately: bool) {
        if stop_immediately {
            self.shared.saving.store(false, Ordering::Release);
        }
        if let Some(handle) = self.thread.take() {
            match handle.join() {
                Ok(sink) => self.sink = Some(sink),
                Err(_) => error!("Saving thread panicked; sink is lost"),
            }
        }
    }

    /// The sink, once the saving thread has been joined
    pub fn take_sink(&mut self) -> Option<Box<dyn StorageSink>> {
        self.sink.take()
    }

    /// Saving thread is still running
    pub fn is_saving(&self) -> bool {
        self.shared.saving.load(Ordering::Acquire) && !self.shared.finished.load(Ordering::Acquire)
    }

    pub fn streams(&self) -> usize {
        self.fps.len()
    }

    pub fn frame_chunk_size(&self) -> usize {
        self.frame_chunk_size
    }

    pub fn frames_saved(&self, stream: usize) -> u64 {
        self.shared.progress[stream]
            .frames_saved
            .load(Ordering::Acquire)
    }

    /// Seconds' worth of frames saved for `stream`
    pub fn saving_progress(&self, stream: usize) -> f64 {
        schedule::saving_progress(self.frames_saved(stream), self.fps[stream])
    }

    /// Frames waiting in `stream`'s write buffer
    pub fn buffered(&self, stream: usize) -> usize {
        self.shared.progress[stream].buffered.load(Ordering::Relaxed)
    }

    pub fn stream_state(&self, stream: usize) -> StreamState {
        decode_state(self.shared.progress[stream].state.load(Ordering::Acquire))
    }
}

impl Drop for Saver {
    fn drop(&mut self) {
        self.abort_saving(true);
    }
}

struct StreamMeters {
    saved: Counter,
    flush_failures: Counter,
    buffered: Gauge,
}

impl StreamMeters {
    fn new(name: &str) -> Self {
        Self {
            saved: metrics::counter!("labcap_frames_saved_total", "stream" => name.to_string()),
            flush_failures: metrics::counter!(
                "labcap_flush_failures_total",
                "stream" => name.to_string()
            ),
            buffered: metrics::gauge!("labcap_write_buffer_frames", "stream" => name.to_string()),
        }
    }
}

/// State owned by the saving thread
struct SaveLoop {
    acquirers: Vec<Arc<Acquirer>>,
    sink: Box<dyn StorageSink>,
    buffers: Vec<VecDeque<Frame>>,
    saved: Vec<u64>,
    failures: Vec<u32>,
    states: Vec<StreamState>,
    meters: Vec<StreamMeters>,
    shared: Arc<Shared>,
    frame_chunk_size: usize,
    idle_poll: Duration,
    max_flush_failures: u32,
    timers: Arc<StageTimers>,
}

impl SaveLoop {
    fn run(mut self) -> Box<dyn StorageSink> {
        let backoff = Backoff::new();

        while self.shared.saving.load(Ordering::Acquire) {
            let start = Instant::now();
            let moved = self.drain();
            self.timers.add(Stage::Drain, start.elapsed());

            let views = self.views();
            let selected = schedule::select_stream(&views);

            if schedule::all_finished(&views) {
                break;
            }

            let flushed = match selected {
                Some(stream) => self.flush(stream, &views[stream]),
                None => false,
            };

            if moved > 0 || flushed {
                backoff.reset();
            } else if backoff.is_completed() {
                thread::sleep(self.idle_poll);
            } else {
                backoff.snooze();
            }
        }

        self.shared.finished.store(true, Ordering::Release);
        let totals = self
            .saved
            .iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        info!("[!] Exiting saving thread. Saved {} frames.", totals);
        self.sink
    }

    /// Move at most one frame per stream per round from the save-queues into
    /// the write buffers, for up to one chunk's worth of rounds. Stops after
    /// the first round that moves nothing.
    fn drain(&mut self) -> usize {
        let mut moved = 0;
        for _ in 0..self.frame_chunk_size {
            let mut round = 0;
            for (stream, acquirer) in self.acquirers.iter().enumerate() {
                let Some(frame) = acquirer.save_queue().try_dequeue() else {
                    continue;
                };
                round += 1;
                // Failed streams keep draining so their acquirer never blocks
                if self.states[stream] != StreamState::Failed {
                    self.buffers[stream].push_back(frame);
                }
            }
            if round == 0 {
                break;
            }
            moved += round;
        }

        for (stream, buffer) in self.buffers.iter().enumerate() {
            self.shared.progress[stream]
                .buffered
                .store(buffer.len(), Ordering::Relaxed);
            self.meters[stream].buffered.set(buffer.len() as f64);
        }
        moved
    }

    fn views(&mut self) -> Vec<StreamView> {
        let mut views = Vec::with_capacity(self.acquirers.len());
        for (stream, acquirer) in self.acquirers.iter().enumerate() {
            let target = acquirer.capture_target();
            if self.states[stream] == StreamState::Active
                && target.is_some_and(|t| self.saved[stream] >= t)
            {
                self.states[stream] = StreamState::Complete;
                self.shared.progress[stream]
                    .state
                    .store(encode_state(StreamState::Complete), Ordering::Release);
                debug!("Stream '{}' fully saved", acquirer.name());
            }
            views.push(StreamView {
                fps: acquirer.fps(),
                frames_saved: self.saved[stream],
                buffered: self.buffers[stream].len(),
                target,
                acquiring: acquirer.is_acquiring(),
                state: self.states[stream],
            });
        }
        views
    }

    /// Flush the planned number of frames from the front of `stream`'s write
    /// buffer. Returns whether a chunk was acknowledged.
    fn flush(&mut self, stream: usize, view: &StreamView) -> bool {
        let Some(planned) = schedule::plan_flush(view, self.frame_chunk_size) else {
            return false;
        };
        let buffer = &mut self.buffers[stream];
        let count = uniform_prefix(buffer, planned);
        if count < planned {
            info!(
                "Stream #{} changed geometry; flushing {} frame(s) of the old shape",
                stream, count
            );
        } else if count < self.frame_chunk_size {
            debug!("Last chunk for stream #{}: {} frame(s)", stream, count);
        }

        let chunk = &buffer.make_contiguous()[..count];
        let sink = &mut self.sink;

        let start = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(|| sink.append_chunk(stream, chunk)))
            .unwrap_or_else(|_| Err(SinkError::Rejected("sink panicked".to_string())));
        self.timers.add(Stage::WriteChunk, start.elapsed());

        match result {
            Ok(()) => {
                buffer.drain(..count);
                self.saved[stream] += count as u64;
                self.failures[stream] = 0;
                self.shared.progress[stream]
                    .frames_saved
                    .store(self.saved[stream], Ordering::Release);
                self.shared.progress[stream]
                    .buffered
                    .store(buffer.len(), Ordering::Relaxed);
                self.meters[stream].saved.increment(count as u64);
                true
            }
            Err(e) => {
                self.failures[stream] += 1;
                self.meters[stream].flush_failures.increment(1);
                let failures = self.failures[stream];
                warn!(
                    "Failed to write chunk for acquirer #{} ({} consecutive): {}",
                    stream, failures, e
                );
                if self.max_flush_failures > 0 && failures >= self.max_flush_failures {
                    let dropped = buffer.len();
                    buffer.clear();
                    self.shared.progress[stream].buffered.store(0, Ordering::Relaxed);
                    self.set_state(stream, StreamState::Failed);
                    error!(
                        "Stream #{} failed after {} consecutive write errors; dropped {} buffered frame(s)",
                        stream, failures, dropped
                    );
                }
                false
            }
        }
    }

    fn set_state(&mut self, stream: usize, state: StreamState) {
        self.states[stream] = state;
        self.shared.progress[stream]
            .state
            .store(encode_state(state), Ordering::Release);
    }
}

/// Length of the leading run of at most `limit` frames sharing the first
/// frame's geometry. A chunk never mixes frame shapes.
fn uniform_prefix(buffer: &VecDeque<Frame>, limit: usize) -> usize {
    let Some(head) = buffer.front() else {
        return 0;
    };
    let geometry = head.geometry();
    buffer
        .iter()
        .take(limit)
        .take_while(|frame| frame.geometry() == geometry)
        .count()
}
