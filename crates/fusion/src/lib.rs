pub mod detection;
pub mod engine;
pub mod geometry;
pub mod pacing;
pub mod store;
pub mod table;

pub use detection::{BoundingBox, Detection, FusedGroup, RobotPose, Vec2};
pub use engine::{CycleReport, FusionEngine, FusionSettings, FusionStats, deduplicate, group_by_class};
pub use geometry::{
    CameraMount, GeometryError, calculate_local_position, convert_to_global_position,
    locate_detection, pixel_to_degrees,
};
pub use pacing::CyclePacing;
pub use store::{DetectionStore, StoreError};
pub use table::{EntryListener, MemoryTable, TableError, TableValue, TelemetryTable};
