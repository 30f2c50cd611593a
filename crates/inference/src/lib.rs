pub mod backend;
pub mod detector;
pub mod device;
pub mod errors;
pub mod processing;
pub mod selector;

#[cfg(feature = "ort-backend")]
pub use backend::ort::OrtBackend;
pub use backend::{InferenceBackend, InferenceParams, RawDetection};
pub use detector::{CameraBinding, Detector, DetectorSettings, DetectorStats};
pub use device::Device;
pub use errors::InferenceError;
pub use processing::{DEFAULT_INPUT_SIZE, Letterbox, PreProcessor, decode_yolo, non_max_suppression};
pub use selector::ModelSelector;
