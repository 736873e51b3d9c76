//! Capability set every camera driver implements

use crate::capture::frame::{Frame, Geometry};
use crate::error::CameraError;
use crate::storage::AttributeValue;

/// A physical (or simulated) frame source.
///
/// The acquirer owns one camera and calls it from a single capture thread.
/// `get_frame` must return within a bounded, implementation-defined timeout;
/// a stuck call delays shutdown of the owning stream.
pub trait Camera: Send {
    /// Acquire driver resources. Called once before any other method.
    fn initialize(&mut self) -> Result<(), CameraError> {
        Ok(())
    }

    /// Release driver resources. Called once when the acquirer is dropped.
    fn finalize(&mut self) -> Result<(), CameraError> {
        Ok(())
    }

    /// Start the hardware stream. Idempotent.
    fn begin_acquisition(&mut self) -> Result<(), CameraError> {
        Ok(())
    }

    /// Stop the hardware stream. Idempotent.
    fn end_acquisition(&mut self) -> Result<(), CameraError> {
        Ok(())
    }

    /// Block until the next frame arrives.
    ///
    /// Errors and invalid frames are both treated as a transient capture
    /// failure by the caller.
    fn get_frame(&mut self) -> Result<Frame, CameraError>;

    /// Frame shape, stable once `initialize` has succeeded
    fn geometry(&self) -> Geometry;

    /// Native frame rate
    fn fps(&self) -> f64;

    /// Whether the device is armed and will deliver frames (e.g. waiting on
    /// an external trigger reports `false` until armed)
    fn is_ready(&self) -> bool {
        true
    }

    /// Device metadata recorded with the session (serial, exposure, gain)
    fn attributes(&self) -> Vec<(String, AttributeValue)> {
        Vec::new()
    }
}
