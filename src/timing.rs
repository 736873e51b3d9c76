//! Accumulated wall time per pipeline stage, reported at session end

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Waiting on `Camera::get_frame` (all capture threads)
    GetFrame,
    /// Blocked on a full save-queue (all capture threads)
    Enqueue,
    /// Moving frames from save-queues to write buffers
    Drain,
    /// Inside `StorageSink::append_chunk`
    WriteChunk,
}

const STAGES: [Stage; 4] = [Stage::GetFrame, Stage::Enqueue, Stage::Drain, Stage::WriteChunk];

impl Stage {
    fn index(self) -> usize {
        self as usize
    }

    fn label(self) -> &'static str {
        match self {
            Stage::GetFrame => "Getting frames",
            Stage::Enqueue => "Waiting on save-queues",
            Stage::Drain => "Moving frames to write buffers",
            Stage::WriteChunk => "Writing chunks",
        }
    }
}

/// Lock-free stage timers shared by every pipeline thread.
#[derive(Default)]
pub struct StageTimers {
    nanos: [AtomicU64; 4],
    calls: [AtomicU64; 4],
}

impl StageTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f`, charging its duration to `stage`
    pub fn time<R>(&self, stage: Stage, f: impl FnOnce() -> R) -> R {
        let start = Instant::now();
        let out = f();
        self.add(stage, start.elapsed());
        out
    }

    pub fn add(&self, stage: Stage, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.nanos[stage.index()].fetch_add(nanos, Ordering::Relaxed);
        self.calls[stage.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn total(&self, stage: Stage) -> Duration {
        Duration::from_nanos(self.nanos[stage.index()].load(Ordering::Relaxed))
    }

    pub fn calls(&self, stage: Stage) -> u64 {
        self.calls[stage.index()].load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        for stage in STAGES {
            self.nanos[stage.index()].store(0, Ordering::Relaxed);
            self.calls[stage.index()].store(0, Ordering::Relaxed);
        }
    }

    /// Log every stage's total
    pub fn report(&self) {
        for stage in STAGES {
            info!(
                "  {:<32} {:>10.3} s over {} call(s)",
                stage.label(),
                self.total(stage).as_secs_f64(),
                self.calls(stage)
            );
        }
    }
}
