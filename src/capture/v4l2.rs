//! V4L2 camera producing 8-bit grayscale frames

use std::path::Path;
use std::time::SystemTime;

use tracing::{info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::camera::Camera;
use crate::capture::decoder::{decode_gray, WireFormat};
use crate::capture::frame::{Frame, Geometry, PixelFormat};
use crate::error::CameraError;
use crate::storage::AttributeValue;

const BUFFER_COUNT: u32 = 4;

/// Scan `/dev/video0..9` for the first capture device offering a format
/// we can decode.
pub fn detect_device() -> Result<String, CameraError> {
    info!("Auto-detecting capture devices...");
    for i in 0..10 {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }
        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            continue;
        }
        let Ok(formats) = dev.enum_formats() else {
            continue;
        };
        if formats.iter().any(|f| wire_format(f.fourcc).is_some()) {
            info!("Found capture device: {} - {}", path, caps.card);
            return Ok(path);
        }
    }
    Err(CameraError::Device("no suitable capture device found".to_string()))
}

fn wire_format(fourcc: FourCC) -> Option<WireFormat> {
    match &fourcc.repr {
        b"GREY" => Some(WireFormat::Grey),
        b"YUYV" => Some(WireFormat::Yuyv),
        b"MJPG" => Some(WireFormat::Mjpeg),
        _ => None,
    }
}

pub struct V4l2Camera {
    path: String,
    requested: (u32, u32),
    fps: f64,
    geometry: Geometry,
    wire: WireFormat,
    card: String,
    device: Option<Device>,
    stream: Option<MmapStream<'static>>,
}

impl V4l2Camera {
    /// `path` may be `"auto"` to pick the first usable device
    pub fn new(path: &str, width: u32, height: u32, fps: f64) -> Self {
        Self {
            path: path.to_string(),
            requested: (width, height),
            fps,
            geometry: Geometry::for_format(width as usize, height as usize, PixelFormat::Gray8),
            wire: WireFormat::Grey,
            card: String::new(),
            device: None,
            stream: None,
        }
    }
}

impl Camera for V4l2Camera {
    #[instrument(skip(self), fields(path = %self.path))]
    fn initialize(&mut self) -> Result<(), CameraError> {
        if self.path == "auto" {
            self.path = detect_device()?;
        }
        let device = Device::with_path(&self.path)?;
        let caps = device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(CameraError::Device(format!(
                "{} doesn't support video capture",
                self.path
            )));
        }

        let supported: Vec<FourCC> = device.enum_formats()?.iter().map(|f| f.fourcc).collect();
        let fourcc = [b"GREY", b"YUYV", b"MJPG"]
            .into_iter()
            .map(FourCC::new)
            .find(|f| supported.contains(f))
            .ok_or_else(|| CameraError::Device("no GREY, YUYV or MJPG format".to_string()))?;

        let mut fmt = device.format()?;
        fmt.width = self.requested.0;
        fmt.height = self.requested.1;
        fmt.fourcc = fourcc;
        let fmt = device.set_format(&fmt)?;
        if (fmt.width, fmt.height) != self.requested {
            warn!(
                "{} negotiated {}x{} instead of {}x{}",
                self.path, fmt.width, fmt.height, self.requested.0, self.requested.1
            );
        }

        if let Err(e) = device.set_params(&Parameters::with_fps(self.fps.round() as u32)) {
            warn!("Failed to set {} fps on {}: {}", self.fps, self.path, e);
        }

        self.wire = wire_format(fmt.fourcc).unwrap_or(WireFormat::Grey);
        self.geometry =
            Geometry::for_format(fmt.width as usize, fmt.height as usize, PixelFormat::Gray8);
        self.card = caps.card;
        self.device = Some(device);
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), CameraError> {
        self.stream = None;
        self.device = None;
        Ok(())
    }

    fn begin_acquisition(&mut self) -> Result<(), CameraError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let device = self.device.as_ref().ok_or(CameraError::NotStreaming)?;
        let stream = MmapStream::with_buffers(device, Type::VideoCapture, BUFFER_COUNT)?;
        self.stream = Some(stream);
        info!("Capture stream started with {} buffers", BUFFER_COUNT);
        Ok(())
    }

    fn end_acquisition(&mut self) -> Result<(), CameraError> {
        self.stream = None;
        Ok(())
    }

    fn get_frame(&mut self) -> Result<Frame, CameraError> {
        let stream = self.stream.as_mut().ok_or(CameraError::NotStreaming)?;
        let (buf, _meta) = stream.next()?;
        let timestamp = SystemTime::now();
        let gray = decode_gray(buf, self.wire, self.geometry.width, self.geometry.height)?;
        Ok(Frame::from_vec(self.geometry, gray)?.with_timestamp(timestamp))
    }

    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn fps(&self) -> f64 {
        self.fps
    }

    fn is_ready(&self) -> bool {
        self.stream.is_some()
    }

    fn attributes(&self) -> Vec<(String, AttributeValue)> {
        vec![
            ("device".to_string(), self.path.clone().into()),
            ("card".to_string(), self.card.clone().into()),
        ]
    }
}
