//! In-memory sink, used for dry runs and tests

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::capture::Frame;
use crate::error::SinkError;
use crate::storage::{check_chunk, AttributeValue, DatasetSpec, Segment, Segments, StorageSink};

#[derive(Default)]
struct Store {
    frames: Vec<Vec<Frame>>,
    chunks: Vec<Vec<usize>>,
    segments: Vec<Segments>,
    attributes: BTreeMap<String, AttributeValue>,
    finished: bool,
}

/// Sink that keeps deep copies of every appended frame.
pub struct MemorySink {
    specs: Vec<DatasetSpec>,
    store: Arc<Mutex<Store>>,
}

/// Read side of a [`MemorySink`], usable after the sink moved to the saver.
#[derive(Clone)]
pub struct MemoryHandle {
    store: Arc<Mutex<Store>>,
}

impl MemorySink {
    pub fn new(specs: Vec<DatasetSpec>) -> Self {
        let store = Store {
            frames: specs.iter().map(|_| Vec::new()).collect(),
            chunks: specs.iter().map(|_| Vec::new()).collect(),
            segments: specs.iter().map(|_| Segments::default()).collect(),
            ..Store::default()
        };
        Self {
            specs,
            store: Arc::new(Mutex::new(store)),
        }
    }

    pub fn handle(&self) -> MemoryHandle {
        MemoryHandle {
            store: Arc::clone(&self.store),
        }
    }
}

fn lock(store: &Mutex<Store>) -> MutexGuard<'_, Store> {
    // A panic while holding the lock leaves the store consistent
    store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl StorageSink for MemorySink {
    fn append_chunk(&mut self, stream: usize, frames: &[Frame]) -> Result<(), SinkError> {
        if stream >= self.specs.len() {
            return Err(SinkError::UnknownStream(stream));
        }
        let geometry = check_chunk(frames)?;

        let mut store = lock(&self.store);
        let first_frame = store.frames[stream].len() as u64;
        store.segments[stream].open(first_frame, geometry);
        store.frames[stream].extend(frames.iter().map(Frame::deep_copy));
        store.chunks[stream].push(frames.len());
        Ok(())
    }

    fn write_attribute(&mut self, name: &str, value: AttributeValue) -> Result<(), SinkError> {
        lock(&self.store).attributes.insert(name.to_string(), value);
        Ok(())
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        lock(&self.store).finished = true;
        Ok(())
    }
}

impl MemoryHandle {
    /// Frames stored for `stream`, as deep copies
    pub fn frames(&self, stream: usize) -> Vec<Frame> {
        lock(&self.store)
            .frames
            .get(stream)
            .map(|frames| frames.iter().map(Frame::deep_copy).collect())
            .unwrap_or_default()
    }

    pub fn frame_count(&self, stream: usize) -> usize {
        lock(&self.store).frames.get(stream).map_or(0, Vec::len)
    }

    /// Size of every chunk appended to `stream`, in order
    pub fn chunk_sizes(&self, stream: usize) -> Vec<usize> {
        lock(&self.store)
            .chunks
            .get(stream)
            .cloned()
            .unwrap_or_default()
    }

    /// Geometry runs of `stream`, in order
    pub fn segments(&self, stream: usize) -> Vec<Segment> {
        lock(&self.store)
            .segments
            .get(stream)
            .map(|s| s.as_slice().to_vec())
            .unwrap_or_default()
    }

    pub fn attribute(&self, name: &str) -> Option<AttributeValue> {
        lock(&self.store).attributes.get(name).cloned()
    }

    pub fn is_finished(&self) -> bool {
        lock(&self.store).finished
    }
}
