use capture::{Rotation, SourceConfig};
use common::{Environment, env_opt, env_or, env_string};
use fusion::CameraMount;
use inference::{Device, InferenceParams};
use serde::Deserialize;
use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read pipeline file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid pipeline file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Pipeline must list at least one model")]
    NoModels,

    #[error("Pipeline must list at least one camera")]
    NoCameras,

    #[error("Model {0} lists no class names")]
    NoClassNames(String),

    #[error("Duplicate camera name '{0}'")]
    DuplicateCamera(String),

    #[error("Camera '{camera}': {reason}")]
    InvalidCamera { camera: String, reason: String },

    #[error("{name} must be {expected}, got {value}")]
    OutOfRange {
        name: &'static str,
        expected: &'static str,
        value: f64,
    },

    #[error("Unknown table backend '{0}' (expected mqtt or memory)")]
    UnknownTableBackend(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableBackend {
    Mqtt,
    Memory,
}

impl FromStr for TableBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mqtt" => Ok(TableBackend::Mqtt),
            "memory" => Ok(TableBackend::Memory),
            _ => Err(ConfigError::UnknownTableBackend(s.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub topic_prefix: String,
    pub client_id: String,
}

#[derive(Debug, Clone)]
pub struct VisionConfig {
    pub environment: Environment,
    pub otel_endpoint: Option<String>,
    pub pipeline_path: PathBuf,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub input_size: u32,
    pub combine_threshold: f64,
    pub max_range: f64,
    pub fusion_interval: Duration,
    pub table_backend: TableBackend,
    pub mqtt: MqttSettings,
    pub robot_pose_key: String,
    pub active_model_key: String,
}

impl VisionConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            environment: Environment::from_env(),
            otel_endpoint: env_opt("OTEL_EXPORTER_OTLP_ENDPOINT"),
            pipeline_path: PathBuf::from(env_string("PIPELINE_CONFIG", "config/pipeline.json")),
            confidence_threshold: env_or("CONFIDENCE_THRESHOLD", 0.65),
            iou_threshold: env_or("IOU_THRESHOLD", 0.5),
            input_size: env_or("INPUT_SIZE", 320),
            combine_threshold: env_or("COMBINE_THRESHOLD_M", 0.25),
            max_range: env_or("MAX_DETECTION_RANGE_M", 10.0),
            fusion_interval: Duration::from_millis(env_or("FUSION_INTERVAL_MS", 100)),
            table_backend: env_string("TABLE_BACKEND", "mqtt").parse()?,
            mqtt: MqttSettings {
                host: env_string("MQTT_BROKER_HOST", "localhost"),
                port: env_or("MQTT_BROKER_PORT", 1883),
                topic_prefix: env_string("MQTT_TOPIC_PREFIX", "vision/table"),
                client_id: env_string("MQTT_CLIENT_ID", "vision-fusion"),
            },
            robot_pose_key: env_string("ROBOT_POSE_KEY", "robot_position"),
            active_model_key: env_string("ACTIVE_MODEL_KEY", "active_model"),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        unit_interval("CONFIDENCE_THRESHOLD", self.confidence_threshold as f64)?;
        unit_interval("IOU_THRESHOLD", self.iou_threshold as f64)?;
        positive("INPUT_SIZE", self.input_size as f64)?;
        positive("COMBINE_THRESHOLD_M", self.combine_threshold)?;
        positive("MAX_DETECTION_RANGE_M", self.max_range)?;
        positive("FUSION_INTERVAL_MS", self.fusion_interval.as_millis() as f64)?;
        Ok(())
    }

    pub fn inference_params(&self) -> InferenceParams {
        InferenceParams {
            confidence_threshold: self.confidence_threshold,
            iou_threshold: self.iou_threshold,
            input_size: self.input_size,
        }
    }
}

fn unit_interval(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            name,
            expected: "within [0, 1]",
            value,
        })
    }
}

fn positive(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            name,
            expected: "positive",
            value,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelSpec {
    pub path: PathBuf,
    pub class_names: Vec<String>,
}

fn default_fov() -> (f64, f64) {
    CameraMount::default().fov_deg
}

fn default_device() -> String {
    "cpu".to_string()
}

fn default_bearing_scale() -> f64 {
    1.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraSpec {
    pub name: String,
    pub source: SourceConfig,
    #[serde(default = "default_fov")]
    pub fov: (f64, f64),
    #[serde(default)]
    pub offset: (f64, f64, f64),
    #[serde(default)]
    pub pitch: f64,
    #[serde(default)]
    pub yaw: f64,
    #[serde(default)]
    pub rotation: Rotation,
    #[serde(default = "default_device")]
    pub processing_device: String,
    #[serde(default = "default_bearing_scale")]
    pub bearing_scale: f64,
}

impl CameraSpec {
    pub fn mount(&self) -> CameraMount {
        CameraMount {
            fov_deg: self.fov,
            offset: self.offset,
            pitch_deg: self.pitch,
            yaw_deg: self.yaw,
            bearing_scale: self.bearing_scale,
        }
    }

    pub fn device(&self) -> Result<Device, ConfigError> {
        self.processing_device
            .parse()
            .map_err(|e: inference::InferenceError| self.invalid(e.to_string()))
    }

    fn invalid(&self, reason: impl Into<String>) -> ConfigError {
        ConfigError::InvalidCamera {
            camera: self.name.clone(),
            reason: reason.into(),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(self.invalid("name must not be empty"));
        }
        let (h, v) = self.fov;
        if !(h > 0.0 && v > 0.0 && h < 180.0 && v < 180.0) {
            return Err(self.invalid(format!("field of view ({h}, {v}) must be within (0, 180)")));
        }
        if !(self.bearing_scale > 0.0 && self.bearing_scale.is_finite()) {
            return Err(self.invalid("bearing_scale must be positive"));
        }
        let (x, y, z) = self.offset;
        if ![x, y, z, self.pitch, self.yaw].iter().all(|v| v.is_finite()) {
            return Err(self.invalid("offset, pitch and yaw must be finite"));
        }
        self.device()?;
        Ok(())
    }
}

/// Camera and model description loaded from `PIPELINE_CONFIG`.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineFile {
    pub models: Vec<ModelSpec>,
    pub cameras: Vec<CameraSpec>,
}

impl PipelineFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;
        Self::parse(&raw, &display)
    }

    pub fn parse(raw: &str, origin: &str) -> Result<Self, ConfigError> {
        let pipeline: Self = serde_json::from_str(raw).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })?;
        pipeline.validate()?;
        Ok(pipeline)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.models.is_empty() {
            return Err(ConfigError::NoModels);
        }
        if self.cameras.is_empty() {
            return Err(ConfigError::NoCameras);
        }
        for model in &self.models {
            if model.class_names.is_empty() {
                return Err(ConfigError::NoClassNames(model.path.display().to_string()));
            }
        }

        let mut seen = HashSet::new();
        for camera in &self.cameras {
            camera.validate()?;
            if !seen.insert(camera.name.as_str()) {
                return Err(ConfigError::DuplicateCamera(camera.name.clone()));
            }
        }
        Ok(())
    }
}

/// One detector thread: the device it runs on and the cameras it serves,
/// as indices into [`PipelineFile::cameras`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectorPlan {
    pub device: Device,
    pub cameras: Vec<usize>,
}

/// Accelerators get one detector for all their cameras, in configuration
/// order. CPU and GPU cameras each get their own detector.
pub fn plan_detectors(cameras: &[CameraSpec]) -> Result<Vec<DetectorPlan>, ConfigError> {
    let mut plans: Vec<DetectorPlan> = Vec::new();

    for (index, camera) in cameras.iter().enumerate() {
        let device = camera.device()?;
        let shared = if device.is_shared() {
            plans.iter().position(|p| p.device == device)
        } else {
            None
        };

        match shared {
            Some(existing) => plans[existing].cameras.push(index),
            None => plans.push(DetectorPlan {
                device,
                cameras: vec![index],
            }),
        }
    }

    Ok(plans)
}
