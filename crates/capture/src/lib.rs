pub mod camera;
pub mod decoder;
pub mod device;
pub mod errors;
pub mod file;
pub mod frame;
pub mod mjpeg;
pub mod stream;

pub use camera::{Camera, FrameSource, SourceConfig, SourceKind};
pub use decoder::{FrameDecoder, MjpegDecoder, YuyvDecoder};
pub use device::{PhysicalSettings, PhysicalSource, PixelFormat};
pub use errors::CaptureError;
pub use file::FileSource;
pub use frame::{Frame, Rotation};
pub use mjpeg::JpegSplitter;
pub use stream::StreamSource;
