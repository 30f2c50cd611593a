use crate::device::{PhysicalSettings, PhysicalSource};
use crate::errors::CaptureError;
use crate::file::FileSource;
use crate::frame::{Frame, Rotation};
use crate::stream::StreamSource;
use serde::Deserialize;
use std::{fmt, path::PathBuf, time::Duration};

/// Anything that can hand out the most recent frame.
///
/// Implementations must not block longer than about one frame interval.
/// `None` means no frame right now (not started, end of file, transient read
/// failure) and is never fatal.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Option<Frame>;

    fn kind(&self) -> SourceKind;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Physical,
    Stream,
    File,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SourceKind::Physical => "physical",
            SourceKind::Stream => "stream",
            SourceKind::File => "file",
        })
    }
}

fn default_read_timeout_ms() -> u64 {
    2000
}

/// How a camera obtains its frames.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    Physical {
        device_index: u32,
        width: u32,
        height: u32,
        fps: u32,
    },
    Stream {
        url: String,
        #[serde(default = "default_read_timeout_ms")]
        read_timeout_ms: u64,
    },
    File {
        path: PathBuf,
        #[serde(rename = "loop", default)]
        looping: bool,
    },
}

/// A named frame source whose output is rotated to canonical orientation.
pub struct Camera {
    name: String,
    rotation: Rotation,
    source: Box<dyn FrameSource>,
}

impl Camera {
    /// Open the underlying source. Failure here is fatal for the pipeline;
    /// later read failures only surface as missing frames.
    pub fn open(
        name: impl Into<String>,
        rotation: Rotation,
        config: &SourceConfig,
    ) -> Result<Self, CaptureError> {
        let name = name.into();
        let source: Box<dyn FrameSource> = match config {
            SourceConfig::Physical {
                device_index,
                width,
                height,
                fps,
            } => Box::new(PhysicalSource::open(PhysicalSettings {
                device_index: *device_index,
                width: *width,
                height: *height,
                fps: *fps,
            })?),
            SourceConfig::Stream {
                url,
                read_timeout_ms,
            } => Box::new(StreamSource::open(
                url,
                Duration::from_millis(*read_timeout_ms),
            )?),
            SourceConfig::File { path, looping } => Box::new(FileSource::open(path, *looping)?),
        };

        tracing::info!(
            camera = %name,
            kind = %source.kind(),
            rotation = rotation.degrees(),
            "Camera ready"
        );

        Ok(Self::with_source(name, rotation, source))
    }

    pub fn with_source(
        name: impl Into<String>,
        rotation: Rotation,
        source: Box<dyn FrameSource>,
    ) -> Self {
        Self {
            name: name.into(),
            rotation,
            source,
        }
    }

    /// Most recent frame in canonical orientation, if one is available.
    pub fn get_frame(&mut self) -> Option<Frame> {
        self.source
            .next_frame()
            .map(|frame| frame.rotated(self.rotation))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rotation(&self) -> Rotation {
        self.rotation
    }

    pub fn kind(&self) -> SourceKind {
        self.source.kind()
    }
}

impl fmt::Debug for Camera {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Camera")
            .field("name", &self.name)
            .field("rotation", &self.rotation)
            .field("kind", &self.kind())
            .finish()
    }
}
