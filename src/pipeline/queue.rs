//! Bounded single-producer/single-consumer frame queue

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam::utils::CachePadded;
use flume::{Receiver, SendTimeoutError, Sender, TryRecvError, TrySendError};
use tracing::debug;

use crate::capture::Frame;

/// Default number of frame slots per queue
pub const DEFAULT_CAPACITY: usize = 100;

/// Capacity-bounded frame queue.
///
/// Exactly one thread produces and exactly one thread consumes per queue; the
/// acquirer and its consumers are built so that holds. A full queue blocks the
/// producer in [`enqueue`](Self::enqueue), which is how a slow sink throttles
/// capture.
pub struct BoundedFrameQueue {
    tx: Sender<Frame>,
    rx: Receiver<Frame>,
    capacity: usize,
    poll: Duration,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    frames_written: AtomicUsize,
    frames_read: AtomicUsize,
    frames_dropped: AtomicUsize,
}

/// Snapshot of a queue's lifetime counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub written: usize,
    pub read: usize,
    pub dropped: usize,
}

impl BoundedFrameQueue {
    /// Queue of `capacity` slots; a blocked producer re-checks its run flag
    /// every `poll`
    pub fn new(capacity: usize, poll: Duration) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = flume::bounded(capacity);
        Self {
            tx,
            rx,
            capacity,
            poll,
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Producer: push `frame`, blocking while the queue is full.
    ///
    /// Returns `false` without enqueueing when the frame is invalid, or when
    /// `running` is cleared while waiting for space.
    pub fn enqueue(&self, frame: Frame, running: &AtomicBool) -> bool {
        if !frame.is_valid() {
            return false;
        }

        let mut pending = frame;
        loop {
            match self.tx.send_timeout(pending, self.poll) {
                Ok(()) => {
                    self.stats.frames_written.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
                Err(SendTimeoutError::Timeout(frame)) => {
                    if !running.load(Ordering::Acquire) {
                        debug!("Gave up enqueueing: producer stopped while queue was full");
                        return false;
                    }
                    pending = frame;
                }
                // Unreachable while `self` holds the receiver
                Err(SendTimeoutError::Disconnected(_)) => return false,
            }
        }
    }

    /// Producer: push `frame` only if a slot is free; a full queue drops it
    pub fn try_enqueue(&self, frame: Frame) -> bool {
        if !frame.is_valid() {
            return false;
        }
        match self.tx.try_send(frame) {
            Ok(()) => {
                self.stats.frames_written.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Consumer: pop the oldest frame without blocking
    pub fn try_dequeue(&self) -> Option<Frame> {
        match self.rx.try_recv() {
            Ok(frame) => {
                self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
                Some(frame)
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Consumer: whether a frame is waiting
    pub fn peek_nonempty(&self) -> bool {
        !self.rx.is_empty()
    }

    /// Discard everything queued; returns how many frames were dropped
    pub fn clear(&self) -> usize {
        let dropped = self.rx.drain().count();
        self.stats
            .frames_dropped
            .fetch_add(dropped, Ordering::Relaxed);
        dropped
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.tx.is_full()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            written: self.stats.frames_written.load(Ordering::Relaxed),
            read: self.stats.frames_read.load(Ordering::Relaxed),
            dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
        }
    }
}
