//! Cross-stream flush policy
//!
//! Streams are compared by *saving progress*: frames saved divided by the
//! stream's native rate, i.e. seconds of recording persisted. The scheduler
//! always serves the stream that is furthest behind, which keeps streams of
//! different frame rates level in recorded time.

/// Where a stream stands from the saver's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Still has frames to persist (or is unbounded)
    Active,
    /// Bounded stream with every target frame persisted
    Complete,
    /// Gave up after repeated flush failures
    Failed,
}

/// Snapshot of one stream taken by the saver each scheduling pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamView {
    pub fps: f64,
    pub frames_saved: u64,
    /// Frames sitting in the stream's write buffer
    pub buffered: usize,
    /// Final frame count once known; `None` for an unbounded stream
    pub target: Option<u64>,
    /// The acquirer still expects frames from its camera
    pub acquiring: bool,
    pub state: StreamState,
}

impl StreamView {
    pub fn saving_progress(&self) -> f64 {
        saving_progress(self.frames_saved, self.fps)
    }

    /// Needs no further scheduling
    pub fn is_finished(&self) -> bool {
        match self.state {
            StreamState::Complete | StreamState::Failed => true,
            StreamState::Active => self
                .target
                .is_some_and(|target| self.frames_saved >= target),
        }
    }

    fn remaining(&self) -> Option<u64> {
        self.target
            .map(|target| target.saturating_sub(self.frames_saved))
    }
}

/// Saved frames expressed in seconds of recording
pub fn saving_progress(frames_saved: u64, fps: f64) -> f64 {
    if fps > 0.0 {
        frames_saved as f64 / fps
    } else {
        frames_saved as f64
    }
}

/// Stream with the strictly smallest saving progress among unfinished
/// streams; ties go to the lowest index.
pub fn select_stream(views: &[StreamView]) -> Option<usize> {
    let mut least: Option<(usize, f64)> = None;
    for (index, view) in views.iter().enumerate() {
        if view.is_finished() {
            continue;
        }
        let progress = view.saving_progress();
        let behind = match least {
            None => true,
            Some((_, so_far)) => progress < so_far,
        };
        if behind {
            least = Some((index, progress));
        }
    }
    least.map(|(index, _)| index)
}

/// Every stream is bounded and finished. Unbounded streams never are, so a
/// session containing one only ends on abort.
pub fn all_finished(views: &[StreamView]) -> bool {
    views
        .iter()
        .all(|view| {
            view.state == StreamState::Failed || (view.target.is_some() && view.is_finished())
        })
}

/// How many frames to flush from the selected stream, if any.
///
/// The full-chunk rule is checked before the final-partial rule on purpose.
/// A full chunk is flushed whenever one is buffered, capped at the stream's
/// remaining count. Only when less than a chunk is buffered does a bounded
/// stream that stopped acquiring flush its final partial chunk, once all of
/// it is buffered. A backlog left after acquisition ends is therefore still
/// written in whole chunks, and the last append of a bounded stream holds
/// `target mod chunk_size` frames, and no append exceeds `chunk_size`.
pub fn plan_flush(view: &StreamView, chunk_size: usize) -> Option<usize> {
    let remaining = view.remaining();
    if remaining == Some(0) {
        return None;
    }

    let chunk_size = chunk_size.max(1);
    if view.buffered >= chunk_size {
        let count = match remaining {
            Some(remaining) => chunk_size.min(remaining as usize),
            None => chunk_size,
        };
        return Some(count);
    }

    match remaining {
        Some(remaining) if !view.acquiring && view.buffered as u64 >= remaining => {
            Some(remaining as usize)
        }
        _ => None,
    }
}
