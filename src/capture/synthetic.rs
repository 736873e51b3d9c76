//! Synthetic test-pattern camera for dry runs without hardware

use std::thread;
use std::time::{Duration, Instant, SystemTime};

use tracing::info;

use crate::capture::camera::Camera;
use crate::capture::frame::{Frame, Geometry};
use crate::error::CameraError;
use crate::storage::AttributeValue;

/// Camera that renders a moving gradient and stamps each frame with its
/// sequence number (little-endian `u64` in the first eight bytes).
pub struct SyntheticCamera {
    name: String,
    geometry: Geometry,
    fps: f64,
    paced: bool,
    streaming: bool,
    sequence: u64,
    next_due: Option<Instant>,
}

impl SyntheticCamera {
    /// Camera delivering frames at `fps` in real time
    pub fn new(name: impl Into<String>, geometry: Geometry, fps: f64) -> Self {
        Self {
            name: name.into(),
            geometry,
            fps,
            paced: true,
            streaming: false,
            sequence: 0,
            next_due: None,
        }
    }

    /// Deliver frames as fast as they are requested while still reporting
    /// `fps` as the native rate
    pub fn unpaced(mut self) -> Self {
        self.paced = false;
        self
    }

    fn render(&self) -> Frame {
        let mut frame = Frame::zeroed(self.geometry);
        if let Some(pixels) = frame.data_mut() {
            let row = self.geometry.width * self.geometry.channels * self.geometry.bytes_per_channel;
            for (i, px) in pixels.iter_mut().enumerate() {
                let x = if row == 0 { 0 } else { i % row };
                *px = (x as u64).wrapping_add(self.sequence) as u8;
            }
            let tag = self.sequence.to_le_bytes();
            let n = tag.len().min(pixels.len());
            pixels[..n].copy_from_slice(&tag[..n]);
        }
        frame
    }

    fn wait_for_slot(&mut self) {
        if !self.paced || self.fps <= 0.0 {
            return;
        }
        let period = Duration::from_secs_f64(1.0 / self.fps);
        let now = Instant::now();
        let due = self.next_due.unwrap_or(now);
        if due > now {
            thread::sleep(due - now);
        }
        // Never let the schedule fall more than one period behind
        self.next_due = Some(due.max(now) + period);
    }
}

impl Camera for SyntheticCamera {
    fn initialize(&mut self) -> Result<(), CameraError> {
        info!(
            "Synthetic camera '{}' ready: {}x{}x{} @ {} fps",
            self.name, self.geometry.width, self.geometry.height, self.geometry.channels, self.fps
        );
        Ok(())
    }

    fn begin_acquisition(&mut self) -> Result<(), CameraError> {
        self.streaming = true;
        self.next_due = None;
        Ok(())
    }

    fn end_acquisition(&mut self) -> Result<(), CameraError> {
        self.streaming = false;
        Ok(())
    }

    fn get_frame(&mut self) -> Result<Frame, CameraError> {
        if !self.streaming {
            // Behave like a real device timing out while idle
            thread::sleep(Duration::from_millis(10));
            return Err(CameraError::NotStreaming);
        }
        self.wait_for_slot();
        let frame = self.render().with_timestamp(SystemTime::now());
        self.sequence += 1;
        Ok(frame)
    }

    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn fps(&self) -> f64 {
        self.fps
    }

    fn attributes(&self) -> Vec<(String, AttributeValue)> {
        vec![(
            "serial".to_string(),
            AttributeValue::Text(format!("synthetic-{}", self.name)),
        )]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;

    fn tag(frame: &Frame) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&frame.data()[..8]);
        u64::from_le_bytes(bytes)
    }

    #[test]
    fn idle_camera_reports_not_streaming() {
        let geometry = Geometry::for_format(4, 4, PixelFormat::Gray8);
        let mut cam = SyntheticCamera::new("idle", geometry, 30.0).unpaced();
        assert!(matches!(cam.get_frame(), Err(CameraError::NotStreaming)));
    }

    #[test]
    fn frames_carry_sequence_tags() {
        let geometry = Geometry::for_format(4, 4, PixelFormat::Depth16);
        let mut cam = SyntheticCamera::new("depth", geometry, 30.0).unpaced();
        cam.begin_acquisition().unwrap();

        for expected in 0..5 {
            let frame = cam.get_frame().unwrap();
            assert!(frame.is_valid());
            assert_eq!(frame.geometry(), geometry);
            assert!(frame.timestamp().is_some());
            assert_eq!(tag(&frame), expected);
        }
    }

    #[test]
    fn paced_camera_holds_its_rate() {
        let geometry = Geometry::for_format(2, 2, PixelFormat::Gray8);
        let mut cam = SyntheticCamera::new("paced", geometry, 100.0);
        cam.begin_acquisition().unwrap();

        let start = Instant::now();
        for _ in 0..6 {
            cam.get_frame().unwrap();
        }
        // First frame is immediate, the next five wait 10 ms each
        assert!(start.elapsed() >= Duration::from_millis(45));
    }
}
