use crate::errors::CaptureError;
use crate::frame::Frame;
use common::span;

/// Decodes raw capture buffers into RGB frames.
pub trait FrameDecoder: Send {
    /// Decode one raw buffer. `width`/`height` describe the negotiated capture
    /// format; compressed decoders read the real size from the bitstream.
    fn decode(&mut self, raw: &[u8], width: u32, height: u32) -> Result<Frame, CaptureError>;
}

/// YUYV (YUV 4:2:2) decoder.
///
/// YUYV packs 2 pixels in 4 bytes: [Y0, U, Y1, V]
#[derive(Default)]
pub struct YuyvDecoder;

impl FrameDecoder for YuyvDecoder {
    fn decode(&mut self, raw: &[u8], width: u32, height: u32) -> Result<Frame, CaptureError> {
        let _s = span!("decode_yuyv");

        let bytes_per_row = (width * 2) as usize;
        if height == 0 || raw.len() < bytes_per_row * height as usize {
            return Err(CaptureError::Decode(format!(
                "YUYV buffer too small: {} bytes for {}x{}",
                raw.len(),
                width,
                height
            )));
        }

        let stride = raw.len() / height as usize;
        let mut rgb = Vec::with_capacity((width * height * 3) as usize);

        for row in 0..height as usize {
            let row_start = row * stride;
            let row_data = &raw[row_start..row_start + bytes_per_row];

            for chunk in row_data.chunks_exact(4) {
                let y0 = chunk[0] as i32;
                let u = chunk[1] as i32 - 128;
                let y1 = chunk[2] as i32;
                let v = chunk[3] as i32 - 128;

                // BT.601 fixed-point coefficients (8-bit fraction)
                let rv = (359 * v) >> 8;
                let gu = (88 * u + 183 * v) >> 8;
                let bu = (454 * u) >> 8;

                for y in [y0, y1] {
                    rgb.push((y + rv).clamp(0, 255) as u8);
                    rgb.push((y - gu).clamp(0, 255) as u8);
                    rgb.push((y + bu).clamp(0, 255) as u8);
                }
            }
        }

        Frame::new(width, height, rgb)
    }
}

/// JPEG decoder backed by libjpeg-turbo. Used for MJPEG devices, HTTP streams
/// and recorded files.
pub struct MjpegDecoder {
    decompressor: turbojpeg::Decompressor,
}

impl MjpegDecoder {
    pub fn new() -> Result<Self, CaptureError> {
        Ok(Self {
            decompressor: turbojpeg::Decompressor::new()?,
        })
    }

    /// Decode a single JPEG image, sized from its own header.
    pub fn decode_jpeg(&mut self, jpeg: &[u8]) -> Result<Frame, CaptureError> {
        let _s = span!("decode_jpeg");

        let header = self.decompressor.read_header(jpeg)?;
        let (width, height) = (header.width, header.height);
        let mut pixels = vec![0u8; width * height * 3];

        let output = turbojpeg::Image {
            pixels: pixels.as_mut_slice(),
            width,
            pitch: width * 3,
            height,
            format: turbojpeg::PixelFormat::RGB,
        };
        self.decompressor.decompress(jpeg, output)?;

        Frame::new(width as u32, height as u32, pixels)
    }
}

impl FrameDecoder for MjpegDecoder {
    fn decode(&mut self, raw: &[u8], _width: u32, _height: u32) -> Result<Frame, CaptureError> {
        self.decode_jpeg(raw)
    }
}
