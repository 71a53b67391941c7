//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame};
use image::RgbImage;
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Frames where more than this share of pixels is near-black are flagged dark.
const DARK_FRAME_THRESHOLD: f32 = 0.95;
const STREAM_BUFFERS: u32 = 4;
/// `/dev/videoN` nodes probed by [`Camera::list_devices`].
const MAX_VIDEO_NODES: u32 = 16;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("no camera at {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("camera is in use by another process")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("device does not support video capture")]
    StreamingNotSupported,
}

/// A V4L2 node that supports video capture.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Pixel layout the driver settled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed, 2 bytes per pixel.
    Yuyv,
    /// One JPEG image per buffer.
    Mjpeg,
    /// 8-bit grayscale.
    Grey,
    /// 16-bit little-endian grayscale.
    Y16,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(Self::Yuyv),
            b"MJPG" => Some(Self::Mjpeg),
            b"GREY" => Some(Self::Grey),
            b"Y16 " | b"Y16\0" => Some(Self::Y16),
            _ => None,
        }
    }
}

/// An opened capture device with a negotiated format.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open `device_path` (e.g. "/dev/video0") and ask for `width`×`height` YUYV.
    ///
    /// Drivers may answer with another size or format; MJPG, GREY and Y16 are
    /// accepted as well.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        let device = open_capture_device(device_path)?;

        let mut requested = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("reading current format: {e}"))
        })?;
        requested.fourcc = FourCC::new(b"YUYV");
        requested.width = width;
        requested.height = height;

        let negotiated = device.set_format(&requested).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("setting format: {e}"))
        })?;
        let pixel_format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "driver offered {:?}; supported are YUYV, MJPG, GREY, Y16",
                negotiated.fourcc
            ))
        })?;

        tracing::info!(
            device = device_path,
            width = negotiated.width,
            height = negotiated.height,
            format = ?pixel_format,
            "camera format negotiated"
        );

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            pixel_format,
        })
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    /// Start a memory-mapped capture stream; capture stops when it is dropped.
    pub fn stream(&self) -> Result<FrameStream<'_>, CameraError> {
        let stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CameraError::CaptureFailed(format!("starting mmap stream: {e}")))?;
        Ok(FrameStream { camera: self, stream })
    }

    fn decode(&self, buf: &[u8]) -> Result<RgbImage, CameraError> {
        let (w, h) = (self.width, self.height);
        let converted = match self.pixel_format {
            PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, w, h),
            PixelFormat::Grey => frame::grey_to_rgb(buf, w, h),
            PixelFormat::Y16 => frame::y16_to_rgb(buf, w, h),
            PixelFormat::Mjpeg => {
                return image::load_from_memory_with_format(buf, image::ImageFormat::Jpeg)
                    .map(|img| img.to_rgb8())
                    .map_err(|e| CameraError::CaptureFailed(format!("MJPG decode: {e}")));
            }
        };
        converted.map_err(|e| CameraError::CaptureFailed(e.to_string()))
    }

    /// Enumerate `/dev/video*` nodes that can capture video.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..MAX_VIDEO_NODES)
            .map(|i| format!("/dev/video{i}"))
            .filter_map(|path| probe(&path))
            .collect()
    }
}

fn open_capture_device(device_path: &str) -> Result<Device, CameraError> {
    if !Path::new(device_path).exists() {
        return Err(CameraError::DeviceNotFound(device_path.to_string()));
    }

    let device = Device::with_path(device_path).map_err(|e| {
        if e.raw_os_error() == Some(16) || e.to_string().contains("busy") {
            CameraError::DeviceBusy
        } else {
            CameraError::DeviceNotFound(format!("{device_path}: {e}"))
        }
    })?;

    let caps = device
        .query_caps()
        .map_err(|e| CameraError::CaptureFailed(format!("querying capabilities: {e}")))?;
    tracing::debug!(device = device_path, driver = %caps.driver, card = %caps.card, "device opened");

    if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
        return Err(CameraError::StreamingNotSupported);
    }
    Ok(device)
}

fn probe(path: &str) -> Option<DeviceInfo> {
    if !Path::new(path).exists() {
        return None;
    }
    let caps = Device::with_path(path).ok()?.query_caps().ok()?;
    caps.capabilities
        .contains(CapFlags::VIDEO_CAPTURE)
        .then(|| DeviceInfo {
            path: path.to_string(),
            name: caps.card,
            driver: caps.driver,
            bus: caps.bus,
        })
}

/// Open mmap capture stream on a [`Camera`].
pub struct FrameStream<'a> {
    camera: &'a Camera,
    stream: MmapStream<'a>,
}

impl FrameStream<'_> {
    /// Block until the next buffer is filled and convert it to RGB.
    pub fn next_frame(&mut self) -> Result<Frame, CameraError> {
        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("dequeue: {e}")))?;
        let sequence = meta.sequence;

        let image = self.camera.decode(buf)?;
        let is_dark = frame::is_dark_frame(&image, DARK_FRAME_THRESHOLD);

        Ok(Frame {
            image,
            sequence,
            is_dark,
        })
    }
}
