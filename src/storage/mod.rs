//! Append-only persistence for flushed chunks
//!
//! The saver talks to storage only through [`StorageSink`]: one ordered,
//! append-only dataset per stream, extended a chunk at a time. A chunk the
//! sink acknowledges with `Ok` is retained; on `Err` nothing of that chunk
//! may remain, so the caller can retry the same frames.

pub mod memory;
pub mod raw;

use serde::{Deserialize, Serialize};

use crate::capture::{Frame, Geometry};
use crate::error::SinkError;

pub use memory::{MemoryHandle, MemorySink};
pub use raw::RawChunkSink;

/// Scalar metadata written once at session end
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        AttributeValue::Int(v)
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        AttributeValue::Float(v)
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        AttributeValue::Text(v)
    }
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        AttributeValue::Text(v.to_string())
    }
}

/// Shape of one stream's dataset, fixed when the sink is created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSpec {
    pub name: String,
    pub geometry: Geometry,
}

impl DatasetSpec {
    pub fn new(name: impl Into<String>, geometry: Geometry) -> Self {
        Self {
            name: name.into(),
            geometry,
        }
    }
}

/// Ordered append-only store with one dataset per stream index.
pub trait StorageSink: Send {
    /// Extend dataset `stream` by `frames`, preserving their order.
    ///
    /// On error the dataset must be left as it was before the call.
    fn append_chunk(&mut self, stream: usize, frames: &[Frame]) -> Result<(), SinkError>;

    /// Record a named scalar for the session
    fn write_attribute(&mut self, name: &str, value: AttributeValue) -> Result<(), SinkError>;

    /// Flush any pending metadata; called once when the session ends
    fn finish(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Check that `frames` is a non-empty run of valid frames of one shape and
/// return that shape.
///
/// The shape may differ from the dataset's declared one: a camera that
/// changes geometry mid-stream starts a new segment of its dataset.
pub(crate) fn check_chunk(frames: &[Frame]) -> Result<Geometry, SinkError> {
    let first = frames.first().ok_or(SinkError::EmptyChunk)?;
    let geometry = first.geometry();
    for frame in frames {
        if !frame.is_valid() || frame.geometry() != geometry || geometry.is_empty() {
            return Err(SinkError::Geometry {
                expected: geometry,
                actual: frame.geometry(),
            });
        }
    }
    Ok(geometry)
}

/// A run of frames sharing one geometry within a dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// Index of the segment's first frame within the dataset
    pub first_frame: u64,
    pub geometry: Geometry,
}

/// Segment list of one dataset: the shape of the frames appended next, and
/// where each shape began.
#[derive(Debug, Clone, Default)]
pub(crate) struct Segments(Vec<Segment>);

impl Segments {
    /// Record that frames of `geometry` start at `first_frame`. Returns
    /// whether a new segment was opened.
    pub(crate) fn open(&mut self, first_frame: u64, geometry: Geometry) -> bool {
        if self.0.last().is_some_and(|s| s.geometry == geometry) {
            return false;
        }
        self.0.push(Segment {
            first_frame,
            geometry,
        });
        true
    }

    /// Undo an `open` that returned `true`
    pub(crate) fn revert(&mut self) {
        self.0.pop();
    }

    pub(crate) fn as_slice(&self) -> &[Segment] {
        &self.0
    }
}
