pub mod camera;
#[cfg(feature = "v4l2")]
pub mod decoder;
pub mod frame;
pub mod synthetic;
#[cfg(feature = "v4l2")]
pub mod v4l2;

pub use camera::Camera;
pub use frame::{Frame, Geometry, PixelFormat};
pub use synthetic::SyntheticCamera;
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Camera;
