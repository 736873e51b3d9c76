//! Error types shared across the capture, storage and session layers

use std::io;

use thiserror::Error;

/// Failure building a frame from caller-provided pixel data.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("pixel buffer holds {actual} bytes, geometry needs {expected}")]
    SizeMismatch { expected: usize, actual: usize },
}

/// Failure reported by a camera implementation.
///
/// The acquirer treats every variant as a transient capture failure.
#[derive(Debug, Error)]
pub enum CameraError {
    #[error("camera timed out waiting for a frame")]
    Timeout,
    #[error("camera is not streaming")]
    NotStreaming,
    #[error("camera device error: {0}")]
    Device(String),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[cfg(feature = "v4l2")]
    #[error("failed to decode frame: {0}")]
    Decode(#[from] jpeg_decoder::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Failure appending to, or annotating, a storage sink.
///
/// Append failures are transient: the caller keeps the chunk and retries it.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("unknown stream index {0}")]
    UnknownStream(usize),
    #[error("refusing to append an empty chunk")]
    EmptyChunk,
    #[error("frame geometry {actual:?} does not match dataset {expected:?}")]
    Geometry {
        expected: crate::capture::Geometry,
        actual: crate::capture::Geometry,
    },
    #[error("sink rejected the write: {0}")]
    Rejected(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("failed to encode attributes: {0}")]
    Encode(#[from] toml::ser::Error),
}

/// Failure starting or controlling a recording session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session needs at least one stream")]
    NoStreams,
    #[error("stream '{name}': {reason}")]
    InvalidStream { name: String, reason: String },
    #[error("camera for stream '{name}' failed: {source}")]
    Camera {
        name: String,
        #[source]
        source: CameraError,
    },
    #[error("acquirer '{0}' is already running; reset it first")]
    AlreadyRunning(String),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error("failed to spawn thread: {0}")]
    Spawn(#[source] io::Error),
}

/// Failure loading the layered configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
