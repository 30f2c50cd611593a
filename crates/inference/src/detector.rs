use crate::{
    backend::{InferenceBackend, InferenceParams, RawDetection},
    device::Device,
    errors::InferenceError,
    selector::ModelSelector,
};
use capture::{Camera, Frame};
use fusion::{CameraMount, Detection, DetectionStore, locate_detection};
use opentelemetry::{
    global,
    metrics::{Counter, Histogram},
};
use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

/// Back-off when no bound camera produced a frame this cycle.
const IDLE_SLEEP: Duration = Duration::from_millis(10);

/// A camera plus the mount geometry used to project its detections.
#[derive(Debug)]
pub struct CameraBinding {
    pub camera: Camera,
    pub mount: CameraMount,
}

#[derive(Debug, Clone, Copy)]
pub struct DetectorSettings {
    pub params: InferenceParams,
    /// Detections projected further than this (metres) are discarded.
    pub max_range: f64,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            params: InferenceParams::default(),
            max_range: 10.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetectorStats {
    pub cycles: u64,
    pub frames: u64,
    pub frames_missing: u64,
    pub inference_errors: u64,
    pub detections: u64,
    pub discarded: u64,
}

struct DetectorMetrics {
    inference_duration: Histogram<f64>,
    frames: Counter<u64>,
    frames_missing: Counter<u64>,
    inference_errors: Counter<u64>,
    detections: Counter<u64>,
    discarded: Counter<u64>,
}

impl DetectorMetrics {
    fn init() -> Self {
        let meter = global::meter("detector");
        let latency_buckets = [
            0.001, 0.002, 0.005, 0.01, 0.02, 0.03, 0.05, 0.075, 0.1, 0.15, 0.2, 0.3, 0.5,
        ];

        Self {
            inference_duration: meter
                .f64_histogram("detector_inference_duration_seconds")
                .with_description("Time spent in the inference backend per frame")
                .with_unit("s")
                .with_boundaries(latency_buckets.to_vec())
                .build(),
            frames: meter
                .u64_counter("detector_frames_total")
                .with_description("Frames passed to the inference backend")
                .build(),
            frames_missing: meter
                .u64_counter("detector_frames_missing_total")
                .with_description("Cycles where a camera had no frame")
                .build(),
            inference_errors: meter
                .u64_counter("detector_inference_errors_total")
                .with_description("Backend failures treated as empty results")
                .build(),
            detections: meter
                .u64_counter("detector_detections_total")
                .with_description("Detections written to the shared store")
                .build(),
            discarded: meter
                .u64_counter("detector_detections_discarded_total")
                .with_description("Detections dropped by geometry or range checks")
                .build(),
        }
    }
}

/// Inference loop for one device and the cameras it serves.
///
/// Each cycle reads the active model once, then visits every bound camera in
/// order and replaces that camera's slot in the store.
pub struct Detector<B: InferenceBackend> {
    device: Device,
    models: Vec<B>,
    selector: ModelSelector,
    cameras: Vec<CameraBinding>,
    store: Arc<DetectionStore>,
    settings: DetectorSettings,
    metrics: DetectorMetrics,
    stats: DetectorStats,
}

impl<B: InferenceBackend> Detector<B> {
    pub fn new(
        device: Device,
        models: Vec<B>,
        selector: ModelSelector,
        cameras: Vec<CameraBinding>,
        store: Arc<DetectionStore>,
        settings: DetectorSettings,
    ) -> Result<Self, InferenceError> {
        if models.is_empty() {
            return Err(InferenceError::NoModels);
        }
        if cameras.is_empty() {
            return Err(InferenceError::NoCameras);
        }
        if models.len() != selector.count() {
            return Err(InferenceError::ModelCountMismatch {
                expected: models.len(),
                actual: selector.count(),
            });
        }

        Ok(Self {
            device,
            models,
            selector,
            cameras,
            store,
            settings,
            metrics: DetectorMetrics::init(),
            stats: DetectorStats::default(),
        })
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn camera_names(&self) -> impl Iterator<Item = &str> {
        self.cameras.iter().map(|b| b.camera.name())
    }

    pub fn stats(&self) -> &DetectorStats {
        &self.stats
    }

    /// Run one pass over every bound camera. Returns how many cameras
    /// delivered a frame.
    pub fn run_cycle(&mut self) -> usize {
        let model_index = self.selector.current();
        let model = &mut self.models[model_index.min(self.models.len() - 1)];
        let mut processed = 0;

        for binding in &mut self.cameras {
            let frame = binding.camera.get_frame();
            let name = binding.camera.name();

            let Some(frame) = frame else {
                self.stats.frames_missing += 1;
                self.metrics.frames_missing.add(1, &[]);
                if let Err(e) = self.store.clear(name) {
                    tracing::error!(camera = %name, error = %e, "Failed to clear detections");
                }
                continue;
            };

            processed += 1;
            self.stats.frames += 1;
            self.metrics.frames.add(1, &[]);

            let started = Instant::now();
            let raw = match model.detect(&frame, &self.settings.params) {
                Ok(raw) => raw,
                Err(e) => {
                    self.stats.inference_errors += 1;
                    self.metrics.inference_errors.add(1, &[]);
                    tracing::warn!(
                        camera = %name,
                        model = model_index,
                        error = %e,
                        "Inference failed, treating as no detections"
                    );
                    Vec::new()
                }
            };
            self.metrics
                .inference_duration
                .record(started.elapsed().as_secs_f64(), &[]);

            let raw_count = raw.len();
            let detections = project(model, &raw, &frame, &binding.mount, self.settings.max_range);
            let discarded = (raw_count - detections.len()) as u64;

            self.stats.detections += detections.len() as u64;
            self.stats.discarded += discarded;
            self.metrics.detections.add(detections.len() as u64, &[]);
            self.metrics.discarded.add(discarded, &[]);

            tracing::trace!(
                camera = %name,
                raw = raw_count,
                kept = detections.len(),
                "Detections located"
            );

            if let Err(e) = self.store.replace(name, detections) {
                tracing::error!(camera = %name, error = %e, "Failed to store detections");
            }
        }

        self.stats.cycles += 1;
        processed
    }

    pub fn run(mut self, shutdown: &AtomicBool) -> DetectorStats {
        tracing::info!(
            device = %self.device,
            cameras = ?self.camera_names().collect::<Vec<_>>(),
            models = self.models.len(),
            confidence_threshold = self.settings.params.confidence_threshold,
            iou_threshold = self.settings.params.iou_threshold,
            "Detector starting"
        );

        while !shutdown.load(Ordering::Relaxed) {
            let span = tracing::info_span!(
                "detector_cycle",
                device = %self.device,
                cycle = self.stats.cycles
            );
            let _enter = span.enter();

            let processed = self.run_cycle();

            if self.stats.cycles.is_multiple_of(100) {
                tracing::debug!(
                    cycles = self.stats.cycles,
                    frames = self.stats.frames,
                    missing = self.stats.frames_missing,
                    errors = self.stats.inference_errors,
                    detections = self.stats.detections,
                    "Detector status"
                );
            }

            drop(_enter);
            if processed == 0 {
                thread::sleep(IDLE_SLEEP);
            }
        }

        tracing::info!(device = %self.device, stats = ?self.stats, "Detector stopped");
        self.stats
    }
}

impl<B: InferenceBackend + 'static> Detector<B> {
    pub fn spawn(self, shutdown: Arc<AtomicBool>) -> io::Result<JoinHandle<DetectorStats>> {
        thread::Builder::new()
            .name(format!("detector-{}", self.device))
            .spawn(move || self.run(&shutdown))
    }
}

/// Turn raw boxes into floor-plane detections, dropping any that fail
/// projection or lie out of range.
fn project<B: InferenceBackend>(
    model: &B,
    raw: &[RawDetection],
    frame: &Frame,
    mount: &CameraMount,
    max_range: f64,
) -> Vec<Detection> {
    raw.iter()
        .filter_map(|det| {
            locate_detection(
                model.class_name(det.class_id),
                det.confidence,
                det.bbox,
                frame.size(),
                mount,
                max_range,
            )
            .inspect_err(|e| tracing::trace!(error = %e, "Discarding detection"))
            .ok()
        })
        .collect()
}
