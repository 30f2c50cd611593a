use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to open {source_name}: {reason}")]
    Open { source_name: String, reason: String },

    #[error("Frame decode failed: {0}")]
    Decode(String),

    #[error("Pixel buffer is {actual} bytes, expected {expected} for {width}x{height} RGB")]
    SizeMismatch {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },

    #[error("Unsupported frame rotation: {0} degrees")]
    InvalidRotation(u16),
}

impl CaptureError {
    pub(crate) fn open(source_name: impl Into<String>, reason: impl ToString) -> Self {
        Self::Open {
            source_name: source_name.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<turbojpeg::Error> for CaptureError {
    fn from(e: turbojpeg::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_error_names_the_source() {
        let err = CaptureError::open("stream http://sim:1181/1", "connection refused");
        assert_eq!(
            err.to_string(),
            "Failed to open stream http://sim:1181/1: connection refused"
        );
    }

    #[test]
    fn test_io_errors_convert_with_question_mark() {
        fn fails() -> Result<(), CaptureError> {
            Err(io::Error::new(io::ErrorKind::NotFound, "no such file"))?;
            Ok(())
        }

        match fails() {
            Err(CaptureError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::NotFound),
            other => panic!("Expected Io variant, got {:?}", other),
        }
    }
}
