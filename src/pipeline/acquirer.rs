//! Per-stream capture thread
//!
//! One [`Acquirer`] drives one camera at its native rate. Every valid frame is
//! pushed onto the save-queue (blocking when it is full) and every `r`-th frame
//! is also offered to the preview-queue, where `r` downsamples the camera rate
//! to the preview rate.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use arc_swap::ArcSwap;
use metrics::Counter;
use tracing::{debug, error, info, instrument, warn};

use crate::capture::{Camera, Frame, Geometry};
use crate::error::{CameraError, SessionError};
use crate::pipeline::queue::BoundedFrameQueue;
use crate::storage::AttributeValue;
use crate::timing::{Stage, StageTimers};
use crate::PipelineConfig;

/// Capture-failure log lines are emitted for the first failure and then
/// every this many
const FAILURE_LOG_EVERY: u64 = 100;

/// Drives one camera and fans its frames out to a save-queue and a
/// preview-queue.
pub struct Acquirer {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
    pin_core: Option<usize>,
}

struct Shared {
    name: String,
    camera: Mutex<Box<dyn Camera>>,
    fps: f64,
    geometry: ArcSwap<Geometry>,

    save_queue: BoundedFrameQueue,
    preview_queue: BoundedFrameQueue,
    preview_every: u64,

    // 0 = acquire until aborted
    frames_to_acquire: AtomicU64,
    frames_received: AtomicU64,
    capture_failures: AtomicU64,
    acquiring: AtomicBool,
    // Set once an abort has truncated `frames_to_acquire`
    stopped: AtomicBool,
    started: AtomicBool,

    timers: Arc<StageTimers>,
    received_counter: Counter,
    failure_counter: Counter,
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// `max(1, round(camera_fps / preview_fps))`
pub fn preview_downsample_rate(camera_fps: f64, preview_fps: f64) -> u64 {
    if preview_fps <= 0.0 || !camera_fps.is_finite() {
        return 1;
    }
    let rate = (camera_fps / preview_fps).round();
    if rate < 1.0 {
        1
    } else {
        rate as u64
    }
}

impl Acquirer {
    /// Take ownership of `camera` and initialize it.
    ///
    /// The camera is finalized when the acquirer is dropped.
    #[instrument(skip(camera, config, timers))]
    pub fn new(
        name: &str,
        mut camera: Box<dyn Camera>,
        config: &PipelineConfig,
        timers: Arc<StageTimers>,
    ) -> Result<Self, CameraError> {
        camera.initialize()?;

        let fps = camera.fps();
        let geometry = camera.geometry();
        let preview_every = preview_downsample_rate(fps, config.preview_fps);
        let poll = Duration::from_millis(config.enqueue_poll_ms.max(1));
        debug!(
            "Acquirer '{}': {:?} @ {} fps, preview every {} frame(s)",
            name, geometry, fps, preview_every
        );

        let shared = Shared {
            name: name.to_string(),
            camera: Mutex::new(camera),
            fps,
            geometry: ArcSwap::from_pointee(geometry),
            save_queue: BoundedFrameQueue::new(config.queue_capacity, poll),
            preview_queue: BoundedFrameQueue::new(config.queue_capacity, poll),
            preview_every,
            frames_to_acquire: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            capture_failures: AtomicU64::new(0),
            acquiring: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            started: AtomicBool::new(false),
            timers,
            received_counter: metrics::counter!(
                "labcap_frames_received_total",
                "stream" => name.to_string()
            ),
            failure_counter: metrics::counter!(
                "labcap_capture_failures_total",
                "stream" => name.to_string()
            ),
        };

        Ok(Self {
            shared: Arc::new(shared),
            thread: Mutex::new(None),
            pin_core: None,
        })
    }

    /// Pin the capture thread to the `index`-th core (modulo core count)
    pub fn pin_to_core(&mut self, index: usize) {
        self.pin_core = Some(index);
    }

    /// Start the capture thread.
    ///
    /// Runs once per instance; starting again requires [`reset`](Self::reset).
    pub fn run(&self) -> Result<(), SessionError> {
        if self.shared.started.swap(true, Ordering::AcqRel) {
            return Err(SessionError::AlreadyRunning(self.shared.name.clone()));
        }

        let shared = Arc::clone(&self.shared);
        let pin_core = self.pin_core;
        let handle = thread::Builder::new()
            .name(format!("acq-{}", self.shared.name))
            .spawn(move || {
                if let Some(index) = pin_core {
                    pin_current_thread(&shared.name, index);
                }
                shared.capture_loop();
            })
            .map_err(|e| {
                self.shared.started.store(false, Ordering::Release);
                SessionError::Spawn(e)
            })?;

        *lock(&self.thread) = Some(handle);
        info!("Acquisition thread for '{}' started", self.shared.name);
        Ok(())
    }

    /// Stop capturing and join the capture thread. Idempotent.
    ///
    /// Afterwards the stream's target is truncated to the frames actually
    /// received, so the saver can finish the stream.
    pub fn abort_acquisition(&self) {
        self.shared.acquiring.store(false, Ordering::Release);

        if let Some(handle) = lock(&self.thread).take() {
            if handle.join().is_err() {
                error!("Acquisition thread for '{}' panicked", self.shared.name);
            }
        }

        let received = self.shared.frames_received.load(Ordering::Acquire);
        self.shared
            .frames_to_acquire
            .store(received, Ordering::Release);
        self.shared.stopped.store(true, Ordering::Release);
    }

    /// Return to the freshly constructed state without touching the camera.
    pub fn reset(&self) {
        self.abort_acquisition();

        let dropped = self.shared.save_queue.clear() + self.shared.preview_queue.clear();
        if dropped > 0 {
            debug!("Reset of '{}' discarded {} queued frame(s)", self.shared.name, dropped);
        }

        self.shared.frames_to_acquire.store(0, Ordering::Release);
        self.shared.frames_received.store(0, Ordering::Release);
        self.shared.capture_failures.store(0, Ordering::Release);
        self.shared.stopped.store(false, Ordering::Release);
        self.shared.acquiring.store(true, Ordering::Release);
        self.shared.started.store(false, Ordering::Release);
    }

    /// Start the hardware stream
    pub fn begin_acquisition(&self) -> Result<(), CameraError> {
        lock(&self.shared.camera).begin_acquisition()
    }

    /// Stop the hardware stream
    pub fn end_acquisition(&self) -> Result<(), CameraError> {
        lock(&self.shared.camera).end_acquisition()
    }

    pub fn is_camera_ready(&self) -> bool {
        lock(&self.shared.camera).is_ready()
    }

    pub fn camera_attributes(&self) -> Vec<(String, AttributeValue)> {
        lock(&self.shared.camera).attributes()
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn fps(&self) -> f64 {
        self.shared.fps
    }

    /// Declared geometry; follows the camera if it reports a different shape
    pub fn geometry(&self) -> Geometry {
        **self.shared.geometry.load()
    }

    /// `[channels, height, width]`
    pub fn dims(&self) -> [usize; 3] {
        self.geometry().dims()
    }

    pub fn preview_downsample(&self) -> u64 {
        self.shared.preview_every
    }

    pub fn frames_received(&self) -> u64 {
        self.shared.frames_received.load(Ordering::Acquire)
    }

    pub fn capture_failures(&self) -> u64 {
        self.shared.capture_failures.load(Ordering::Relaxed)
    }

    /// Configured target; 0 means acquire until aborted
    pub fn frames_to_acquire(&self) -> u64 {
        self.shared.frames_to_acquire.load(Ordering::Acquire)
    }

    pub fn set_frames_to_acquire(&self, frames: u64) {
        self.shared.frames_to_acquire.store(frames, Ordering::Release);
    }

    /// Number of frames this stream will end with, once that is known.
    ///
    /// `None` while an unbounded stream is still capturing. After an abort
    /// this is the number of frames received.
    pub fn capture_target(&self) -> Option<u64> {
        let stopped = self.shared.stopped.load(Ordering::Acquire);
        let target = self.shared.frames_to_acquire.load(Ordering::Acquire);
        if target > 0 || stopped {
            Some(target)
        } else {
            None
        }
    }

    pub fn seconds_to_acquire(&self) -> f64 {
        self.frames_to_acquire() as f64 / self.shared.fps
    }

    /// Still expecting frames from the camera
    pub fn is_acquiring(&self) -> bool {
        self.shared.is_acquiring()
    }

    /// Seconds' worth of frames captured so far
    pub fn acquisition_progress(&self) -> f64 {
        self.frames_received() as f64 / self.shared.fps
    }

    pub fn save_queue(&self) -> &BoundedFrameQueue {
        &self.shared.save_queue
    }

    pub fn preview_queue(&self) -> &BoundedFrameQueue {
        &self.shared.preview_queue
    }

    pub fn has_preview_frame(&self) -> bool {
        self.shared.preview_queue.peek_nonempty()
    }

    /// Oldest pending preview frame
    pub fn take_preview(&self) -> Option<Frame> {
        self.shared.preview_queue.try_dequeue()
    }

    /// Newest pending preview frame; older ones are discarded
    pub fn take_latest_preview(&self) -> Option<Frame> {
        std::iter::from_fn(|| self.shared.preview_queue.try_dequeue()).last()
    }

    /// A preview consumer should stop waiting on this stream
    pub fn should_draw(&self) -> bool {
        let target = self.frames_to_acquire();
        self.has_preview_frame() || (target > 0 && self.frames_received() >= target)
    }
}

impl Drop for Acquirer {
    fn drop(&mut self) {
        self.abort_acquisition();
        if let Err(e) = lock(&self.shared.camera).finalize() {
            warn!("Failed to finalize camera '{}': {}", self.shared.name, e);
        }
        self.shared.save_queue.clear();
        self.shared.preview_queue.clear();
    }
}

impl Shared {
    fn is_acquiring(&self) -> bool {
        let target = self.frames_to_acquire.load(Ordering::Acquire);
        self.acquiring.load(Ordering::Acquire)
            && (target == 0 || self.frames_received.load(Ordering::Acquire) < target)
    }

    fn capture_loop(&self) {
        while self.is_acquiring() {
            self.get_and_enqueue();
        }
        info!(
            "[!] Exiting {} acquisition thread (acquired {} frames)",
            self.name,
            self.frames_received.load(Ordering::Acquire)
        );
    }

    fn get_and_enqueue(&self) {
        let result = self.timers.time(Stage::GetFrame, || {
            let mut camera = lock(&self.camera);
            panic::catch_unwind(AssertUnwindSafe(|| camera.get_frame()))
        });

        let mut frame = match result {
            Ok(Ok(frame)) if frame.is_valid() => frame,
            Ok(Ok(_)) => return self.capture_failed("camera returned an invalid frame"),
            Ok(Err(e)) => return self.capture_failed(&e.to_string()),
            Err(_) => return self.capture_failed("camera panicked in get_frame"),
        };

        frame.stamp_if_unset();
        self.check_geometry(&frame);

        // Count the frame before the saver can see it, so frames saved never
        // exceeds frames received
        let index = self.frames_received.fetch_add(1, Ordering::AcqRel);
        let preview = (index % self.preview_every == 0).then(|| frame.deep_copy());

        let queued = self.timers.time(Stage::Enqueue, || {
            self.save_queue.enqueue(frame, &self.acquiring)
        });
        if !queued {
            self.frames_received.fetch_sub(1, Ordering::AcqRel);
            return;
        }
        self.received_counter.increment(1);

        if let Some(preview) = preview {
            // Preview is lossy; a full preview-queue never stalls capture
            self.preview_queue.try_enqueue(preview);
        }
    }

    fn capture_failed(&self, reason: &str) {
        let failures = self.capture_failures.fetch_add(1, Ordering::Relaxed) + 1;
        self.failure_counter.increment(1);
        if failures == 1 || failures % FAILURE_LOG_EVERY == 0 {
            warn!(
                "[{}] Failed to receive {} frame: {} ({} failure(s) so far)",
                self.frames_received.load(Ordering::Relaxed),
                self.name,
                reason,
                failures
            );
        } else {
            debug!("Failed to receive {} frame: {}", self.name, reason);
        }
    }

    fn check_geometry(&self, frame: &Frame) {
        let declared = **self.geometry.load();
        let actual = frame.geometry();
        if actual != declared {
            warn!(
                "Camera '{}' delivered {:?}, expected {:?}; updating declared geometry",
                self.name, actual, declared
            );
            self.geometry.store(Arc::new(actual));
        }
    }
}

fn pin_current_thread(name: &str, index: usize) {
    let Some(cores) = core_affinity::get_core_ids().filter(|c| !c.is_empty()) else {
        warn!("Cannot pin '{}': core list unavailable", name);
        return;
    };
    let core = cores[index % cores.len()];
    if core_affinity::set_for_current(core) {
        debug!("Pinned '{}' capture thread to core {}", name, core.id);
    } else {
        warn!("Failed to pin '{}' capture thread to core {}", name, core.id);
    }
}
