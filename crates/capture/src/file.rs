use crate::camera::{FrameSource, SourceKind};
use crate::decoder::MjpegDecoder;
use crate::errors::CaptureError;
use crate::frame::Frame;
use crate::mjpeg;
use std::path::Path;

/// Plays back a recorded MJPEG file (concatenated JPEG images).
///
/// Every frame is decoded when the source is opened so playback speed is
/// bounded by the consumer, not by decoding.
pub struct FileSource {
    frames: Vec<Frame>,
    position: usize,
    looping: bool,
}

impl FileSource {
    pub fn open(path: &Path, looping: bool) -> Result<Self, CaptureError> {
        let source_name = path.display().to_string();
        let data = std::fs::read(path).map_err(|e| CaptureError::open(&source_name, e))?;

        let mut decoder = MjpegDecoder::new()?;
        let mut frames = Vec::new();
        let mut skipped = 0usize;

        for jpeg in mjpeg::split_all(&data) {
            match decoder.decode_jpeg(jpeg) {
                Ok(frame) => frames.push(frame),
                Err(e) => {
                    skipped += 1;
                    tracing::debug!(path = %source_name, error = %e, "Skipping corrupt frame");
                }
            }
        }

        if frames.is_empty() {
            return Err(CaptureError::open(source_name, "no decodable JPEG frames"));
        }

        tracing::info!(
            path = %source_name,
            frames = frames.len(),
            skipped,
            looping,
            "Recorded video loaded"
        );

        Ok(Self::from_frames(frames, looping))
    }

    pub fn from_frames(frames: Vec<Frame>, looping: bool) -> Self {
        Self {
            frames,
            position: 0,
            looping,
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl FrameSource for FileSource {
    fn next_frame(&mut self) -> Option<Frame> {
        if self.position >= self.frames.len() {
            if !self.looping || self.frames.is_empty() {
                return None;
            }
            self.position = 0;
        }

        let frame = self.frames[self.position].clone();
        self.position += 1;
        Some(frame)
    }

    fn kind(&self) -> SourceKind {
        SourceKind::File
    }
}
