use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InferenceError {
    #[error("Invalid processing device '{0}' (expected cpu, gpu:N or tpu:N)")]
    InvalidDevice(String),

    #[error("Model index {index} out of range ({count} models loaded)")]
    ModelIndexOutOfRange { index: i64, count: usize },

    #[error("At least one model is required")]
    NoModels,

    #[error("Detector has no cameras")]
    NoCameras,

    #[error("Detector expects {expected} models but the selector covers {actual}")]
    ModelCountMismatch { expected: usize, actual: usize },

    #[error("Unexpected model output shape {0:?}")]
    UnexpectedOutputShape(Vec<usize>),
}
