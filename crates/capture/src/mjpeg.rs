//! Splitting of MJPEG byte streams into individual JPEG images.

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Upper bound on bytes held while waiting for an end-of-image marker.
pub const DEFAULT_MAX_BUFFERED: usize = 100_000;

fn find_marker(haystack: &[u8], marker: [u8; 2]) -> Option<usize> {
    haystack.windows(2).position(|w| w == marker)
}

/// Incremental splitter for an MJPEG byte stream (multipart HTTP body or a
/// raw `.mjpeg` file). Boundary headers between images are skipped.
pub struct JpegSplitter {
    buffer: Vec<u8>,
    max_buffered: usize,
}

impl Default for JpegSplitter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUFFERED)
    }
}

impl JpegSplitter {
    pub fn new(max_buffered: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(max_buffered.min(1 << 20)),
            max_buffered,
        }
    }

    /// Feed a chunk and return the newest complete JPEG, if any finished.
    /// Older images completed by the same chunk are discarded.
    pub fn push(&mut self, chunk: &[u8]) -> Option<Vec<u8>> {
        if self.buffer.len() > self.max_buffered {
            let excess = self.buffer.len() - self.max_buffered;
            self.buffer.drain(..excess);
        }
        self.buffer.extend_from_slice(chunk);

        let mut latest = None;
        while let Some(jpeg) = self.take_next() {
            latest = Some(jpeg);
        }
        latest
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn take_next(&mut self) -> Option<Vec<u8>> {
        let start = find_marker(&self.buffer, SOI)?;
        let end = start + 2 + find_marker(&self.buffer[start + 2..], EOI)? + 2;
        let jpeg = self.buffer[start..end].to_vec();
        self.buffer.drain(..end);
        Some(jpeg)
    }
}

/// Split a complete in-memory MJPEG payload into its JPEG images.
pub fn split_all(data: &[u8]) -> Vec<&[u8]> {
    let mut frames = Vec::new();
    let mut rest = data;

    while let Some(start) = find_marker(rest, SOI) {
        let Some(len) = find_marker(&rest[start + 2..], EOI) else {
            break;
        };
        let end = start + 2 + len + 2;
        frames.push(&rest[start..end]);
        rest = &rest[end..];
    }

    frames
}
