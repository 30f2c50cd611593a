use capture::Frame;
use common::span;
use fast_image_resize::{FilterType, PixelType, ResizeAlg, ResizeOptions, Resizer, images::Image};
use fusion::BoundingBox;
use ndarray::{Array, IxDyn};

const LETTERBOX_COLOR: u8 = 114;

pub const DEFAULT_INPUT_SIZE: u32 = 320;

/// Mapping between original frame pixels and the square model input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub offset_x: f32,
    pub offset_y: f32,
    pub orig_width: u32,
    pub orig_height: u32,
    pub input_size: u32,
}

impl Letterbox {
    pub fn compute(width: u32, height: u32, input_size: u32) -> Self {
        let scale = (input_size as f32 / width as f32).min(input_size as f32 / height as f32);
        let (new_width, new_height) = Self::scaled_dims(width, height, scale, input_size);

        Self {
            scale,
            offset_x: ((input_size - new_width) / 2) as f32,
            offset_y: ((input_size - new_height) / 2) as f32,
            orig_width: width,
            orig_height: height,
            input_size,
        }
    }

    fn scaled_dims(width: u32, height: u32, scale: f32, input_size: u32) -> (u32, u32) {
        let w = ((width as f32 * scale) as u32).clamp(1, input_size);
        let h = ((height as f32 * scale) as u32).clamp(1, input_size);
        (w, h)
    }

    pub fn resized_dims(&self) -> (u32, u32) {
        Self::scaled_dims(self.orig_width, self.orig_height, self.scale, self.input_size)
    }

    /// Undo the letterbox and clamp to the original frame.
    pub fn to_original(&self, bbox: BoundingBox) -> BoundingBox {
        let max_x = self.orig_width as f32;
        let max_y = self.orig_height as f32;
        let x = |v: f32| ((v - self.offset_x) / self.scale).clamp(0.0, max_x);
        let y = |v: f32| ((v - self.offset_y) / self.scale).clamp(0.0, max_y);

        BoundingBox::new(x(bbox.x1), y(bbox.y1), x(bbox.x2), y(bbox.y2))
    }
}

/// Letterboxes RGB frames into a `[1, 3, S, S]` tensor scaled to `0..=1`.
pub struct PreProcessor {
    input_size: u32,
    rgb_buffer: Vec<u8>,
    letterboxed_buffer: Vec<u8>,
    resizer: Resizer,
}

impl PreProcessor {
    pub fn new(input_size: u32) -> Self {
        let side = input_size as usize;
        Self {
            input_size,
            rgb_buffer: Vec::with_capacity(1920 * 1080 * 3),
            letterboxed_buffer: vec![LETTERBOX_COLOR; side * side * 3],
            resizer: Resizer::new(),
        }
    }

    pub fn input_size(&self) -> u32 {
        self.input_size
    }

    pub fn preprocess(&mut self, frame: &Frame) -> anyhow::Result<(Array<f32, IxDyn>, Letterbox)> {
        let _s = span!("preprocess_frame");

        tracing::trace!(
            width = frame.width(),
            height = frame.height(),
            input_size = self.input_size,
            "Preprocessing frame"
        );

        self.rgb_buffer.clear();
        self.rgb_buffer.extend_from_slice(frame.pixels());

        let letterbox = Letterbox::compute(frame.width(), frame.height(), self.input_size);
        self.resize_and_letterbox(&letterbox)?;

        Ok((self.normalize()?, letterbox))
    }

    fn resize_and_letterbox(&mut self, letterbox: &Letterbox) -> anyhow::Result<()> {
        let _s = span!("resize_and_letterbox");

        let (new_width, new_height) = letterbox.resized_dims();
        let src = Image::from_slice_u8(
            letterbox.orig_width,
            letterbox.orig_height,
            &mut self.rgb_buffer,
            PixelType::U8x3,
        )?;
        let mut resized = Image::new(new_width, new_height, PixelType::U8x3);

        self.resizer.resize(
            &src,
            &mut resized,
            &ResizeOptions::new().resize_alg(ResizeAlg::Convolution(FilterType::Bilinear)),
        )?;

        self.letterboxed_buffer.fill(LETTERBOX_COLOR);

        let resized_data = resized.buffer();
        let stride = (self.input_size * 3) as usize;
        let row_bytes = (new_width * 3) as usize;
        let (offset_x, offset_y) = (letterbox.offset_x as usize, letterbox.offset_y as usize);

        for y in 0..new_height as usize {
            let src_row = y * row_bytes;
            let dst_row = (y + offset_y) * stride + offset_x * 3;
            self.letterboxed_buffer[dst_row..dst_row + row_bytes]
                .copy_from_slice(&resized_data[src_row..src_row + row_bytes]);
        }

        Ok(())
    }

    fn normalize(&self) -> anyhow::Result<Array<f32, IxDyn>> {
        let _s = span!("normalize");

        let side = self.input_size as usize;
        let spatial = side * side;
        let mut output = vec![0.0f32; 3 * spatial];

        for (i, px) in self.letterboxed_buffer.chunks_exact(3).enumerate() {
            output[i] = px[0] as f32 / 255.0;
            output[i + spatial] = px[1] as f32 / 255.0;
            output[i + 2 * spatial] = px[2] as f32 / 255.0;
        }

        Ok(Array::from_shape_vec(IxDyn(&[1, 3, side, side]), output)?)
    }
}

impl Default for PreProcessor {
    fn default() -> Self {
        Self::new(DEFAULT_INPUT_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_frame(width: u32, height: u32, rgb: [u8; 3]) -> Frame {
        let pixels = rgb.repeat((width * height) as usize);
        Frame::new(width, height, pixels).unwrap()
    }

    #[test]
    fn test_output_shape() {
        let mut pre = PreProcessor::new(64);
        let (tensor, _) = pre.preprocess(&solid_frame(2, 2, [255, 0, 0])).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 64, 64]);
    }

    #[test]
    fn test_letterboxing_preserves_aspect_ratio() {
        let letterbox = Letterbox::compute(800, 600, 640);

        // min(640/800, 640/600) = 0.8, resized to 640x480
        assert_eq!(letterbox.scale, 0.8);
        assert_eq!(letterbox.resized_dims(), (640, 480));
        assert_eq!(letterbox.offset_x, 0.0, "Wide frames are not padded horizontally");
        assert_eq!(letterbox.offset_y, 80.0, "Wide frames are centred vertically");
    }

    #[test]
    fn test_padding_and_content_values() {
        let mut pre = PreProcessor::new(64);
        let (tensor, letterbox) = pre.preprocess(&solid_frame(64, 32, [128, 128, 128])).unwrap();
        assert_eq!(letterbox.offset_y, 16.0);

        let pad = tensor[[0, 0, 2, 32]];
        assert!(
            (pad - 114.0 / 255.0).abs() < 1e-6,
            "Padding should use the letterbox colour (got {})",
            pad
        );

        let content = tensor[[0, 1, 32, 32]];
        assert!(
            (content - 128.0 / 255.0).abs() < 2.0 / 255.0,
            "Content pixel should be ~0.502 (got {})",
            content
        );
    }

    #[test]
    fn test_channels_are_planar_rgb() {
        let mut pre = PreProcessor::new(16);
        let (tensor, _) = pre.preprocess(&solid_frame(16, 16, [255, 0, 0])).unwrap();

        assert!(tensor[[0, 0, 8, 8]] > 0.99, "R plane should be saturated");
        assert!(tensor[[0, 1, 8, 8]] < 0.01, "G plane should be empty");
        assert!(tensor[[0, 2, 8, 8]] < 0.01, "B plane should be empty");
    }

    #[test]
    fn test_to_original_inverts_letterbox() {
        let letterbox = Letterbox::compute(800, 600, 640);
        let model_box = BoundingBox::new(80.0, 160.0, 320.0, 400.0);

        let original = letterbox.to_original(model_box);
        assert_eq!(original, BoundingBox::new(100.0, 100.0, 400.0, 400.0));
    }

    #[test]
    fn test_to_original_clamps_to_frame() {
        let letterbox = Letterbox::compute(800, 600, 640);
        let overshoot = BoundingBox::new(-10.0, 0.0, 700.0, 640.0);

        let original = letterbox.to_original(overshoot);
        assert_eq!(original.x1, 0.0);
        assert_eq!(original.y1, 0.0, "Box in the top padding clamps to the frame edge");
        assert_eq!(original.x2, 800.0);
        assert_eq!(original.y2, 600.0);
    }

    #[test]
    fn test_tiny_frame_still_produces_input() {
        let letterbox = Letterbox::compute(1, 2000, 640);
        let (w, h) = letterbox.resized_dims();
        assert!(w >= 1 && h <= 640);
    }
}
