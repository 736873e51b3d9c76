use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::BytesMut;
use serde::{Deserialize, Serialize};

use crate::error::FrameError;

/// Pixel formats produced by the supported sensors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// 8-bit grayscale (machine-vision cameras)
    Gray8,
    /// 16-bit little-endian grayscale
    Gray16,
    /// 16-bit little-endian depth in millimetres
    Depth16,
    /// Packed 8-bit RGB
    Rgb24,
}

impl PixelFormat {
    pub fn channels(self) -> usize {
        match self {
            PixelFormat::Rgb24 => 3,
            _ => 1,
        }
    }

    pub fn bytes_per_channel(self) -> usize {
        match self {
            PixelFormat::Gray8 | PixelFormat::Rgb24 => 1,
            PixelFormat::Gray16 | PixelFormat::Depth16 => 2,
        }
    }
}

/// Shape of a frame: what a stream declares and what each frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub width: usize,
    pub height: usize,
    pub channels: usize,
    pub bytes_per_channel: usize,
}

impl Geometry {
    pub fn new(width: usize, height: usize, channels: usize, bytes_per_channel: usize) -> Self {
        Self {
            width,
            height,
            channels,
            bytes_per_channel,
        }
    }

    pub fn for_format(width: usize, height: usize, format: PixelFormat) -> Self {
        Self::new(width, height, format.channels(), format.bytes_per_channel())
    }

    /// Number of samples (pixels times channels)
    pub fn samples(&self) -> usize {
        self.width * self.height * self.channels
    }

    /// Size of one frame's pixel buffer in bytes
    pub fn bytes(&self) -> usize {
        self.samples() * self.bytes_per_channel
    }

    /// `[channels, height, width]`, the per-frame dataset shape
    pub fn dims(&self) -> [usize; 3] {
        [self.channels, self.height, self.width]
    }

    pub fn is_empty(&self) -> bool {
        self.bytes() == 0
    }
}

/// One captured image.
///
/// A frame exclusively owns its pixel buffer. It is move-only: duplicating a
/// frame goes through [`Frame::deep_copy`], which allocates a fresh buffer.
/// An invalid frame carries no buffer and is ignored by every consumer.
pub struct Frame {
    geometry: Geometry,
    timestamp: Option<SystemTime>,
    data: Option<BytesMut>,
}

impl Frame {
    /// Valid frame with a zero-filled buffer
    pub fn zeroed(geometry: Geometry) -> Self {
        Self {
            geometry,
            timestamp: None,
            data: Some(BytesMut::zeroed(geometry.bytes())),
        }
    }

    /// Valid frame holding `pixels`, which must match `geometry`
    pub fn from_vec(geometry: Geometry, pixels: Vec<u8>) -> Result<Self, FrameError> {
        if pixels.len() != geometry.bytes() {
            return Err(FrameError::SizeMismatch {
                expected: geometry.bytes(),
                actual: pixels.len(),
            });
        }
        Ok(Self {
            geometry,
            timestamp: None,
            data: Some(BytesMut::from(&pixels[..])),
        })
    }

    /// Valid frame copying `pixels`, which must match `geometry`
    pub fn from_slice(geometry: Geometry, pixels: &[u8]) -> Result<Self, FrameError> {
        if pixels.len() != geometry.bytes() {
            return Err(FrameError::SizeMismatch {
                expected: geometry.bytes(),
                actual: pixels.len(),
            });
        }
        Ok(Self {
            geometry,
            timestamp: None,
            data: Some(BytesMut::from(pixels)),
        })
    }

    /// Frame marking a failed capture
    pub fn invalid() -> Self {
        Self {
            geometry: Geometry::new(0, 0, 0, 0),
            timestamp: None,
            data: None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.data.is_some()
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Pixel bytes; empty for an invalid frame
    pub fn data(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }

    /// Mutable pixel bytes; `None` for an invalid frame
    pub fn data_mut(&mut self) -> Option<&mut [u8]> {
        self.data.as_deref_mut()
    }

    pub fn timestamp(&self) -> Option<SystemTime> {
        self.timestamp
    }

    pub fn set_timestamp(&mut self, timestamp: SystemTime) {
        self.timestamp = Some(timestamp);
    }

    pub fn with_timestamp(mut self, timestamp: SystemTime) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Stamp with the current wall-clock time unless the camera already did
    pub fn stamp_if_unset(&mut self) {
        if self.timestamp.is_none() {
            self.timestamp = Some(SystemTime::now());
        }
    }

    /// Capture time in seconds since the UNIX epoch (0.0 when unstamped)
    pub fn timestamp_secs(&self) -> f64 {
        self.timestamp
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }

    /// Duplicate into an independent buffer.
    ///
    /// The only way to get a second live frame with the same pixels; the two
    /// never share storage.
    pub fn deep_copy(&self) -> Self {
        Self {
            geometry: self.geometry,
            timestamp: self.timestamp,
            data: self.data.as_deref().map(BytesMut::from),
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("geometry", &self.geometry)
            .field("timestamp", &self.timestamp)
            .field("valid", &self.is_valid())
            .finish()
    }
}
