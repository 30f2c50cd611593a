use crate::{
    config::{PipelineFile, TableBackend, VisionConfig, plan_detectors},
    mqtt_table::MqttTable,
};
use anyhow::{Context, Result};
use capture::Camera;
use fusion::{
    DetectionStore, EntryListener, FusionEngine, FusionSettings, MemoryTable, TableValue,
    TelemetryTable,
};
use inference::{CameraBinding, Detector, DetectorSettings, ModelSelector, OrtBackend};
use std::{
    sync::{Arc, atomic::AtomicBool},
    thread::{self, JoinHandle},
};

pub struct VisionService {
    config: VisionConfig,
    pipeline: PipelineFile,
    store: Arc<DetectionStore>,
    table: Arc<dyn TelemetryTable>,
    selector: ModelSelector,
}

impl VisionService {
    pub fn new(config: VisionConfig) -> Result<Self> {
        let pipeline = PipelineFile::load(&config.pipeline_path)?;
        tracing::info!(
            path = %config.pipeline_path.display(),
            models = pipeline.models.len(),
            cameras = pipeline.cameras.len(),
            "Pipeline loaded"
        );

        let store = Arc::new(DetectionStore::new(
            pipeline.cameras.iter().map(|c| c.name.clone()),
        )?);

        let table: Arc<dyn TelemetryTable> = match config.table_backend {
            TableBackend::Mqtt => Arc::new(
                MqttTable::connect(&config.mqtt).context("Failed to create MQTT telemetry table")?,
            ),
            TableBackend::Memory => {
                tracing::warn!("Using in-process telemetry table, nothing will leave this process");
                Arc::new(MemoryTable::new())
            }
        };

        let selector = ModelSelector::new(pipeline.models.len())?;
        table.add_entry_listener(&config.active_model_key, model_listener(selector.clone()))?;

        Ok(Self {
            config,
            pipeline,
            store,
            table,
            selector,
        })
    }

    /// Open every camera, start detector and fusion threads, and block until
    /// all of them have exited after `shutdown` is set.
    pub fn run(self, shutdown: Arc<AtomicBool>) -> Result<()> {
        let plans = plan_detectors(&self.pipeline.cameras)?;
        let settings = DetectorSettings {
            params: self.config.inference_params(),
            max_range: self.config.max_range,
        };

        let mut bindings: Vec<Option<CameraBinding>> = Vec::with_capacity(self.pipeline.cameras.len());
        for spec in &self.pipeline.cameras {
            let camera = Camera::open(&spec.name, spec.rotation, &spec.source)
                .with_context(|| format!("Failed to open camera '{}'", spec.name))?;
            bindings.push(Some(CameraBinding {
                camera,
                mount: spec.mount(),
            }));
        }

        let mut detectors: Vec<(String, JoinHandle<_>)> = Vec::with_capacity(plans.len());
        for plan in plans {
            let cameras: Vec<CameraBinding> = plan
                .cameras
                .iter()
                .filter_map(|&index| bindings[index].take())
                .collect();

            let models = self
                .pipeline
                .models
                .iter()
                .map(|model| {
                    OrtBackend::load(
                        &model.path,
                        model.class_names.clone(),
                        plan.device,
                        settings.params.input_size,
                    )
                    .with_context(|| {
                        format!("Failed to load {} on {}", model.path.display(), plan.device)
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            let detector = Detector::new(
                plan.device,
                models,
                self.selector.clone(),
                cameras,
                Arc::clone(&self.store),
                settings,
            )?;
            let label = format!(
                "{} [{}]",
                plan.device,
                detector.camera_names().collect::<Vec<_>>().join(", ")
            );
            let handle = detector
                .spawn(Arc::clone(&shutdown))
                .context("Failed to spawn detector thread")?;
            tracing::info!(detector = %label, "Detector thread started");
            detectors.push((label, handle));
        }

        let engine = FusionEngine::new(
            Arc::clone(&self.store),
            Arc::clone(&self.table),
            FusionSettings {
                combine_threshold: self.config.combine_threshold,
                robot_pose_key: self.config.robot_pose_key.clone(),
            },
        );
        let interval = self.config.fusion_interval;
        let fusion = {
            let shutdown = Arc::clone(&shutdown);
            thread::Builder::new()
                .name("fusion".into())
                .spawn(move || engine.run(&shutdown, interval))
                .context("Failed to spawn fusion thread")?
        };

        tracing::info!(detectors = detectors.len(), "Vision service running");

        for (label, handle) in detectors {
            match handle.join() {
                Ok(stats) => tracing::info!(detector = %label, stats = ?stats, "Detector joined"),
                Err(_) => tracing::error!(detector = %label, "Detector thread panicked"),
            }
        }
        match fusion.join() {
            Ok(stats) => tracing::info!(stats = ?stats, "Fusion joined"),
            Err(_) => tracing::error!("Fusion thread panicked"),
        }

        tracing::info!("Vision service stopped");
        Ok(())
    }
}

/// Table listener that forwards the controller's model choice to the
/// selector. Invalid values are logged and ignored.
fn model_listener(selector: ModelSelector) -> EntryListener {
    Arc::new(move |key: &str, value: &TableValue| {
        let requested = value.as_numbers().and_then(|v| v.first().copied());
        let Some(requested) = requested else {
            tracing::warn!(key, value = ?value, "Model selection is not a number");
            return;
        };

        if let Err(e) = selector.set_from_value(requested) {
            tracing::warn!(key, error = %e, "Rejected model selection");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_listener_switches_model() {
        let table = MemoryTable::new();
        let selector = ModelSelector::new(3).unwrap();
        table
            .add_entry_listener("active_model", model_listener(selector.clone()))
            .unwrap();

        table.put_number_array("active_model", vec![2.0]).unwrap();
        assert_eq!(selector.current(), 2);
    }

    #[test]
    fn test_model_listener_ignores_invalid_values() {
        let table = MemoryTable::new();
        let selector = ModelSelector::new(2).unwrap();
        table.put_number_array("active_model", vec![1.0]).unwrap();
        table
            .add_entry_listener("active_model", model_listener(selector.clone()))
            .unwrap();
        assert_eq!(selector.current(), 1, "Existing value applies on registration");

        table.put_number_array("active_model", vec![5.0]).unwrap();
        table.put_number_array("active_model", Vec::new()).unwrap();
        table.put_string_array("active_model", vec!["0".into()]).unwrap();
        assert_eq!(selector.current(), 1);
    }
}
