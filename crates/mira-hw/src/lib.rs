//! mira-hw: V4L2 camera capture for live recognition.
//!
//! Negotiates a capture format and converts each buffer into an RGB frame.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, FrameStream, PixelFormat};
pub use frame::Frame;
