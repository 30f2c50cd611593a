use crate::camera::{FrameSource, SourceKind};
use crate::decoder::{FrameDecoder, MjpegDecoder, YuyvDecoder};
use crate::errors::CaptureError;
use crate::frame::Frame;
use common::retry::retry_with_backoff;
use std::time::Duration;
use v4l::{
    Device, FourCC,
    buffer::Type,
    control::{Control, Value},
    io::{mmap::Stream, traits::CaptureStream},
    video::{Capture, capture::Parameters},
};

const BUFFER_COUNT: u32 = 4;
const READ_TIMEOUT: Duration = Duration::from_secs(2);

const FOURCC_YUYV: FourCC = FourCC { repr: *b"YUYV" };
const FOURCC_MJPG: FourCC = FourCC { repr: *b"MJPG" };

// V4L2 control IDs (from videodev2.h)
const V4L2_CID_EXPOSURE_AUTO: u32 = 0x009a0901;
const V4L2_CID_EXPOSURE_ABSOLUTE: u32 = 0x009a0902;

// Auto-exposure bounded by EXPOSURE_ABSOLUTE
const V4L2_EXPOSURE_APERTURE_PRIORITY: i64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Yuyv,
    Mjpeg,
}

/// Requested capture mode for a locally attached camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalSettings {
    pub device_index: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

fn find_usable_camera() -> Option<u32> {
    v4l::context::enum_devices()
        .into_iter()
        .find(|dev| {
            Device::with_path(dev.path())
                .and_then(|d| d.query_caps())
                .map(|caps| {
                    caps.capabilities
                        .contains(v4l::capability::Flags::VIDEO_CAPTURE)
                })
                .unwrap_or(false)
        })
        .map(|dev| dev.index() as u32)
}

fn open_device(index: u32) -> Result<Device, CaptureError> {
    if let Ok(dev) = Device::new(index as usize)
        && dev.query_caps().is_ok()
    {
        return Ok(dev);
    }

    tracing::debug!(
        "Camera index {} busy or missing, scanning alternatives...",
        index
    );

    let fallback = find_usable_camera()
        .ok_or_else(|| CaptureError::open(format!("/dev/video{index}"), "no usable video devices"))?;
    Ok(Device::new(fallback as usize)?)
}

/// Prefer YUYV (cheaper decode), fall back to MJPEG.
fn select_format(device: &Device) -> Result<PixelFormat, CaptureError> {
    let formats = device.enum_formats()?;

    for fmt in &formats {
        tracing::debug!("  {:?}: {}", fmt.fourcc, fmt.description);
    }

    if formats.iter().any(|f| f.fourcc == FOURCC_YUYV) {
        return Ok(PixelFormat::Yuyv);
    }
    if formats.iter().any(|f| f.fourcc == FOURCC_MJPG) {
        return Ok(PixelFormat::Mjpeg);
    }

    Err(CaptureError::open(
        "v4l2 device",
        format!(
            "supports neither YUYV nor MJPEG, available: {:?}",
            formats.iter().map(|f| f.fourcc).collect::<Vec<_>>()
        ),
    ))
}

/// Cap exposure so fast-moving game pieces stay sharp.
fn limit_exposure(device: &Device) {
    let controls = match device.query_controls() {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!("Failed to query camera controls: {}", e);
            return;
        }
    };

    if controls.iter().any(|c| c.id == V4L2_CID_EXPOSURE_AUTO)
        && let Err(e) = device.set_control(Control {
            id: V4L2_CID_EXPOSURE_AUTO,
            value: Value::Integer(V4L2_EXPOSURE_APERTURE_PRIORITY),
        })
    {
        tracing::debug!("Aperture priority mode not supported: {}", e);
    }

    if let Some(desc) = controls.iter().find(|c| c.id == V4L2_CID_EXPOSURE_ABSOLUTE) {
        // 200 units = 20ms
        let exposure = 200i64.min(desc.maximum);
        match device.set_control(Control {
            id: V4L2_CID_EXPOSURE_ABSOLUTE,
            value: Value::Integer(exposure),
        }) {
            Ok(()) => tracing::debug!("Exposure limit: {}ms", exposure as f64 / 10.0),
            Err(e) => tracing::debug!("Failed to set exposure limit: {}", e),
        }
    }
}

/// V4L2 camera read through memory-mapped buffers.
pub struct PhysicalSource {
    stream: Stream<'static>,
    // Keeps the file descriptor open for the stream's lifetime.
    _device: Device,
    decoder: Box<dyn FrameDecoder>,
    width: u32,
    height: u32,
    failures: u64,
}

impl PhysicalSource {
    pub fn open(settings: PhysicalSettings) -> Result<Self, CaptureError> {
        let device = retry_with_backoff(
            || open_device(settings.device_index),
            10,
            200,
            "Camera init",
        )?;

        let caps = device.query_caps()?;
        tracing::info!(
            device_index = settings.device_index,
            "Camera opened: {} ({})",
            caps.card,
            caps.driver
        );

        let pixel_format = select_format(&device)?;
        let mut format = device.format()?;
        format.width = settings.width;
        format.height = settings.height;
        format.fourcc = match pixel_format {
            PixelFormat::Yuyv => FOURCC_YUYV,
            PixelFormat::Mjpeg => FOURCC_MJPG,
        };
        let format = device.set_format(&format)?;

        if format.width != settings.width || format.height != settings.height {
            tracing::warn!(
                "Requested {}x{}, driver chose {}x{}",
                settings.width,
                settings.height,
                format.width,
                format.height
            );
        }

        if let Err(e) = device.set_params(&Parameters::with_fps(settings.fps)) {
            tracing::warn!("Failed to set frame rate to {} fps: {}", settings.fps, e);
        }

        limit_exposure(&device);

        let decoder: Box<dyn FrameDecoder> = match pixel_format {
            PixelFormat::Yuyv => Box::new(YuyvDecoder),
            PixelFormat::Mjpeg => Box::new(MjpegDecoder::new()?),
        };

        let mut stream = Stream::with_buffers(&device, Type::VideoCapture, BUFFER_COUNT)?;
        stream.set_timeout(READ_TIMEOUT);

        tracing::info!(
            "Capture format: {}x{} {:?}",
            format.width,
            format.height,
            pixel_format
        );

        Ok(Self {
            stream,
            _device: device,
            decoder,
            width: format.width,
            height: format.height,
            failures: 0,
        })
    }
}

impl FrameSource for PhysicalSource {
    fn next_frame(&mut self) -> Option<Frame> {
        let result = match self.stream.next() {
            Ok((buf, _meta)) => self.decoder.decode(buf, self.width, self.height),
            Err(e) => Err(e.into()),
        };

        match result {
            Ok(frame) => Some(frame),
            Err(e) => {
                self.failures += 1;
                if self.failures.is_multiple_of(30) || self.failures == 1 {
                    tracing::warn!(failures = self.failures, "Camera read failed: {}", e);
                }
                None
            }
        }
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Physical
    }
}
