use super::{InferenceBackend, InferenceParams, RawDetection};
use crate::device::Device;
use crate::processing::{PreProcessor, decode_yolo};
use capture::Frame;
use common::span;
use ort::{
    execution_providers::{CUDAExecutionProvider, TensorRTExecutionProvider},
    session::{Session, builder::GraphOptimizationLevel},
    value::TensorRef,
};
use std::path::Path;

const INPUT_NAME: &str = "images";
const OUTPUT_NAME: &str = "output0";

/// YOLO model running on ONNX Runtime.
pub struct OrtBackend {
    session: Session,
    class_names: Vec<String>,
    preprocessor: PreProcessor,
}

impl OrtBackend {
    /// Load a model onto `device`. CPU uses the default provider, GPUs use
    /// CUDA and accelerators use TensorRT. Provider failures are fatal rather
    /// than silently falling back to CPU.
    pub fn load(
        path: &Path,
        class_names: Vec<String>,
        device: Device,
        input_size: u32,
    ) -> anyhow::Result<Self> {
        let _ = ort::init().commit();

        let mut builder = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?;

        match device {
            Device::Cpu => {
                tracing::info!("Initializing ONNX Runtime with CPU execution provider");
            }
            Device::Gpu(id) => {
                tracing::info!(device_id = id, "Initializing ONNX Runtime with CUDA execution provider");
                builder = builder.with_execution_providers([CUDAExecutionProvider::default()
                    .with_device_id(id as i32)
                    .build()
                    .error_on_failure()])?;
            }
            Device::Accelerator(id) => {
                tracing::info!(device_id = id, "Initializing ONNX Runtime with TensorRT execution provider");
                builder = builder.with_execution_providers([TensorRTExecutionProvider::default()
                    .with_device_id(id as i32)
                    .build()
                    .error_on_failure()])?;
            }
        }

        let session = builder.commit_from_file(path)?;

        tracing::info!(
            model = %path.display(),
            %device,
            classes = class_names.len(),
            "Model loaded"
        );

        Ok(Self {
            session,
            class_names,
            preprocessor: PreProcessor::new(input_size),
        })
    }
}

impl InferenceBackend for OrtBackend {
    fn detect(
        &mut self,
        frame: &Frame,
        params: &InferenceParams,
    ) -> anyhow::Result<Vec<RawDetection>> {
        if self.preprocessor.input_size() != params.input_size {
            self.preprocessor = PreProcessor::new(params.input_size);
        }

        let (input, letterbox) = self.preprocessor.preprocess(frame)?;

        let _s = span!("inference");
        let outputs = self
            .session
            .run(ort::inputs![INPUT_NAME => TensorRef::from_array_view(input.view())?])?;
        let head = outputs[OUTPUT_NAME].try_extract_array::<f32>()?;

        Ok(decode_yolo(&head, &letterbox, params)?)
    }

    fn class_names(&self) -> &[String] {
        &self.class_names
    }
}
