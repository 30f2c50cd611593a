use crate::processing::DEFAULT_INPUT_SIZE;
use capture::Frame;
use fusion::BoundingBox;

#[cfg(feature = "ort-backend")]
pub mod ort;

/// A box in original frame pixels, before any floor projection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawDetection {
    pub class_id: usize,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InferenceParams {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub input_size: u32,
}

impl Default for InferenceParams {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.65,
            iou_threshold: 0.5,
            input_size: DEFAULT_INPUT_SIZE,
        }
    }
}

/// A loaded detection model bound to one device.
///
/// Implementations own their device state and are driven by a single
/// detector thread.
pub trait InferenceBackend: Send {
    fn detect(
        &mut self,
        frame: &Frame,
        params: &InferenceParams,
    ) -> anyhow::Result<Vec<RawDetection>>;

    fn class_names(&self) -> &[String];

    /// Label for a class id. Ids the model reports beyond its label list get a
    /// synthetic name instead of being dropped.
    fn class_name(&self, class_id: usize) -> String {
        self.class_names()
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| format!("class_{class_id}"))
    }
}
