use crate::errors::CaptureError;
use serde::Deserialize;

/// An RGB8 image in row-major HWC layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl Frame {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self, CaptureError> {
        let expected = (width as usize) * (height as usize) * 3;
        if pixels.len() != expected {
            return Err(CaptureError::SizeMismatch {
                width,
                height,
                expected,
                actual: pixels.len(),
            });
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// `(width, height)` in pixels.
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Rotate clockwise by `rotation`. Quarter turns swap width and height.
    pub fn rotated(self, rotation: Rotation) -> Frame {
        if rotation == Rotation::None {
            return self;
        }

        let (w, h) = (self.width as usize, self.height as usize);
        let (out_w, out_h) = match rotation {
            Rotation::Clockwise90 | Rotation::Clockwise270 => (h, w),
            _ => (w, h),
        };
        let mut out = vec![0u8; self.pixels.len()];

        for y in 0..h {
            for x in 0..w {
                let (dx, dy) = match rotation {
                    Rotation::Clockwise90 => (h - 1 - y, x),
                    Rotation::Rotate180 => (w - 1 - x, h - 1 - y),
                    Rotation::Clockwise270 => (y, w - 1 - x),
                    Rotation::None => (x, y),
                };
                let src = (y * w + x) * 3;
                let dst = (dy * out_w + dx) * 3;
                out[dst..dst + 3].copy_from_slice(&self.pixels[src..src + 3]);
            }
        }

        Frame {
            width: out_w as u32,
            height: out_h as u32,
            pixels: out,
        }
    }
}

/// Clockwise rotation applied to every frame so downstream code sees the
/// canonical orientation regardless of how the camera is mounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "u16")]
pub enum Rotation {
    #[default]
    None,
    Clockwise90,
    Rotate180,
    Clockwise270,
}

impl Rotation {
    pub fn degrees(self) -> u16 {
        match self {
            Rotation::None => 0,
            Rotation::Clockwise90 => 90,
            Rotation::Rotate180 => 180,
            Rotation::Clockwise270 => 270,
        }
    }
}

impl TryFrom<u16> for Rotation {
    type Error = CaptureError;

    fn try_from(degrees: u16) -> Result<Self, Self::Error> {
        match degrees {
            0 => Ok(Rotation::None),
            90 => Ok(Rotation::Clockwise90),
            180 => Ok(Rotation::Rotate180),
            270 => Ok(Rotation::Clockwise270),
            other => Err(CaptureError::InvalidRotation(other)),
        }
    }
}
