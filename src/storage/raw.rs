//! Chunked append-only file sink
//!
//! Layout of a session directory:
//!
//! ```text
//! <dir>/<stream>.frames   frame pixels, back to back, in capture order
//! <dir>/<stream>_time.f64 one little-endian f64 capture time per frame
//! <dir>/session.toml      dataset shapes, frame counts, segments, attributes
//! ```
//!
//! A failed append truncates both files back to the last acknowledged chunk,
//! so retrying the same chunk never duplicates frames. If that truncation
//! itself fails the dataset refuses further appends.
//!
//! When a camera changes geometry mid-stream the frames file simply carries
//! on with the new frame size; the manifest lists each segment's first frame
//! and shape.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::capture::Frame;
use crate::error::SinkError;
use crate::storage::{check_chunk, AttributeValue, DatasetSpec, Segment, Segments, StorageSink};

const MANIFEST: &str = "session.toml";

struct Dataset {
    spec: DatasetSpec,
    frames: File,
    times: File,
    frames_written: u64,
    bytes_written: u64,
    segments: Segments,
    // Set when a rollback failed and the files may hold a partial chunk
    unusable: bool,
}

impl Dataset {
    fn create(dir: &Path, spec: DatasetSpec) -> Result<Self, SinkError> {
        if !is_plain_name(&spec.name) {
            return Err(SinkError::Rejected(format!(
                "dataset name '{}' is not a plain file name",
                spec.name
            )));
        }
        let open = |path: PathBuf| {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(path)
        };
        let frames = open(dir.join(format!("{}.frames", spec.name)))?;
        let times = open(dir.join(format!("{}_time.f64", spec.name)))?;
        Ok(Self {
            spec,
            frames,
            times,
            frames_written: 0,
            bytes_written: 0,
            segments: Segments::default(),
            unusable: false,
        })
    }

    fn write(&mut self, chunk: &[Frame], sync: bool) -> std::io::Result<()> {
        let mut stamps = Vec::with_capacity(chunk.len() * 8);
        for frame in chunk {
            self.frames.write_all(frame.data())?;
            stamps.extend_from_slice(&frame.timestamp_secs().to_le_bytes());
        }
        self.times.write_all(&stamps)?;
        self.frames.flush()?;
        self.times.flush()?;
        if sync {
            self.frames.sync_data()?;
            self.times.sync_data()?;
        }
        Ok(())
    }

    fn rollback(&mut self) -> std::io::Result<()> {
        let (frames_len, times_len) = (self.bytes_written, self.frames_written * 8);
        self.frames.set_len(frames_len)?;
        self.frames.seek(SeekFrom::Start(frames_len))?;
        self.times.set_len(times_len)?;
        self.times.seek(SeekFrom::Start(times_len))?;
        Ok(())
    }
}

#[derive(Serialize)]
struct Manifest<'a> {
    datasets: Vec<ManifestDataset<'a>>,
    attributes: &'a BTreeMap<String, AttributeValue>,
}

#[derive(Serialize)]
struct ManifestDataset<'a> {
    name: &'a str,
    dims: [usize; 3],
    bytes_per_channel: usize,
    frames: u64,
    segments: Vec<ManifestSegment>,
}

#[derive(Serialize)]
struct ManifestSegment {
    first_frame: u64,
    dims: [usize; 3],
    bytes_per_channel: usize,
}

impl From<&Segment> for ManifestSegment {
    fn from(segment: &Segment) -> Self {
        Self {
            first_frame: segment.first_frame,
            dims: segment.geometry.dims(),
            bytes_per_channel: segment.geometry.bytes_per_channel,
        }
    }
}

/// No path separators or parent references
pub(crate) fn is_plain_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && !name.contains("..")
        && !name.contains(['/', '\\', '\0'])
}

/// Sink writing one pair of append-only files per stream.
pub struct RawChunkSink {
    dir: PathBuf,
    datasets: Vec<Dataset>,
    attributes: BTreeMap<String, AttributeValue>,
    sync_on_chunk: bool,
}

impl RawChunkSink {
    /// Create the session directory and empty datasets.
    ///
    /// Existing datasets of the same names are overwritten.
    pub fn create(
        dir: impl AsRef<Path>,
        specs: Vec<DatasetSpec>,
        sync_on_chunk: bool,
    ) -> Result<Self, SinkError> {
        let dir = dir.as_ref().to_path_buf();
        if dir.join(MANIFEST).exists() {
            warn!("Session already exists at {:?}. Overwriting...", dir);
        }
        fs::create_dir_all(&dir)?;

        let datasets = specs
            .into_iter()
            .map(|spec| Dataset::create(&dir, spec))
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            "Recording {} stream(s) to {:?}",
            datasets.len(),
            dir
        );
        Ok(Self {
            dir,
            datasets,
            attributes: BTreeMap::new(),
            sync_on_chunk,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Frames acknowledged so far for `stream`
    pub fn frames_written(&self, stream: usize) -> Option<u64> {
        self.datasets.get(stream).map(|d| d.frames_written)
    }

    fn write_manifest(&self) -> Result<(), SinkError> {
        let manifest = Manifest {
            datasets: self
                .datasets
                .iter()
                .map(|d| ManifestDataset {
                    name: &d.spec.name,
                    dims: d.spec.geometry.dims(),
                    bytes_per_channel: d.spec.geometry.bytes_per_channel,
                    frames: d.frames_written,
                    segments: d
                        .segments
                        .as_slice()
                        .iter()
                        .map(ManifestSegment::from)
                        .collect(),
                })
                .collect(),
            attributes: &self.attributes,
        };
        let text = toml::to_string_pretty(&manifest)?;
        let tmp = self.dir.join(format!("{}.tmp", MANIFEST));
        fs::write(&tmp, text)?;
        fs::rename(&tmp, self.dir.join(MANIFEST))?;
        Ok(())
    }
}

impl StorageSink for RawChunkSink {
    fn append_chunk(&mut self, stream: usize, frames: &[Frame]) -> Result<(), SinkError> {
        let sync = self.sync_on_chunk;
        let dataset = self
            .datasets
            .get_mut(stream)
            .ok_or(SinkError::UnknownStream(stream))?;
        if dataset.unusable {
            return Err(SinkError::Rejected(format!(
                "dataset '{}' is unusable after a failed rollback",
                dataset.spec.name
            )));
        }
        let geometry = check_chunk(frames)?;
        let opened = dataset.segments.open(dataset.frames_written, geometry);
        if opened && dataset.frames_written > 0 {
            warn!(
                "'{}' changes geometry at frame {}: {:?}",
                dataset.spec.name, dataset.frames_written, geometry
            );
        }

        if let Err(e) = dataset.write(frames, sync) {
            if opened {
                dataset.segments.revert();
            }
            if let Err(rollback) = dataset.rollback() {
                error!(
                    "Failed to roll back '{}' after write error: {}; refusing further appends",
                    dataset.spec.name, rollback
                );
                dataset.unusable = true;
            }
            return Err(e.into());
        }

        dataset.frames_written += frames.len() as u64;
        dataset.bytes_written += (frames.len() * geometry.bytes()) as u64;
        debug!(
            "Appended {} frame(s) to '{}' ({} total)",
            frames.len(),
            dataset.spec.name,
            dataset.frames_written
        );
        Ok(())
    }

    fn write_attribute(&mut self, name: &str, value: AttributeValue) -> Result<(), SinkError> {
        self.attributes.insert(name.to_string(), value);
        Ok(())
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        self.write_manifest()?;
        info!("Wrote session manifest to {:?}", self.dir.join(MANIFEST));
        Ok(())
    }
}
