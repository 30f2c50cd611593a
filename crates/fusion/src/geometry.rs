//! Pixel to floor-plane projection. Everything here is pure.

use crate::detection::{BoundingBox, Detection, RobotPose, Vec2};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GeometryError {
    #[error("Target at vertical angle {vertical_deg:.2} deg is not below the horizon")]
    AboveHorizon { vertical_deg: f64 },

    #[error("Projected distance {0} is not a finite non-negative number")]
    InvalidDistance(f64),

    #[error("Distance {distance:.2}m exceeds maximum range {max_range:.2}m")]
    OutOfRange { distance: f64, max_range: f64 },
}

/// Where and how a camera is mounted on the robot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraMount {
    /// Horizontal and vertical field of view, degrees.
    pub fov_deg: (f64, f64),
    /// Lens position relative to the robot origin (x forward, y left, z up), metres.
    pub offset: (f64, f64, f64),
    pub pitch_deg: f64,
    pub yaw_deg: f64,
    /// Multiplicative lens correction applied to both bearing angles.
    pub bearing_scale: f64,
}

impl Default for CameraMount {
    fn default() -> Self {
        Self {
            fov_deg: (70.0, 38.0),
            offset: (0.0, 0.0, 0.0),
            pitch_deg: 0.0,
            yaw_deg: 0.0,
            bearing_scale: 1.0,
        }
    }
}

/// Camera-relative bearing of a pixel, degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bearing {
    /// Positive to the right of the optical axis.
    pub horizontal: f64,
    /// Positive above the optical axis.
    pub vertical: f64,
}

/// Floor-plane fix for a single pixel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalFix {
    pub bearing: Bearing,
    pub position: Vec2,
    pub distance: f64,
}

/// Linear pixel to angle mapping: `offset / (total / 2) * (fov / 2)`.
///
/// `total_pixels` must be non-zero. Offsets beyond half the axis are accepted
/// with a warning since boxes can overshoot the frame edge by rounding.
pub fn pixel_to_degrees(pixel_offset: f64, total_pixels: f64, fov_deg: f64) -> f64 {
    let fraction = pixel_offset / (total_pixels / 2.0);
    if fraction.abs() > 1.0 {
        tracing::warn!(
            pixel_offset,
            total_pixels,
            "Pixel position is outside the expected range"
        );
    }
    fraction * (fov_deg / 2.0)
}

impl CameraMount {
    pub fn bearing(&self, pixel: (f64, f64), frame_size: (u32, u32)) -> Bearing {
        let (width, height) = (frame_size.0 as f64, frame_size.1 as f64);
        let dx = pixel.0 - width / 2.0;
        let dy = height / 2.0 - pixel.1;

        Bearing {
            horizontal: pixel_to_degrees(dx, width, self.fov_deg.0) * self.bearing_scale
                + self.yaw_deg,
            vertical: pixel_to_degrees(dy, height, self.fov_deg.1) * self.bearing_scale
                + self.pitch_deg,
        }
    }
}

/// Project a pixel onto the floor, relative to the robot origin.
///
/// Valid only for pixels below the horizon: `tan(90 + vertical)` must have an
/// argument in (0, 90) degrees, otherwise the distance is negative or infinite.
pub fn calculate_local_position(
    pixel: (f64, f64),
    frame_size: (u32, u32),
    mount: &CameraMount,
) -> Result<LocalFix, GeometryError> {
    let bearing = mount.bearing(pixel, frame_size);

    let elevation = 90.0 + bearing.vertical;
    if !(elevation > 0.0 && elevation < 90.0) {
        return Err(GeometryError::AboveHorizon {
            vertical_deg: bearing.vertical,
        });
    }

    let flat_distance = mount.offset.2 * elevation.to_radians().tan();
    if !flat_distance.is_finite() || flat_distance < 0.0 {
        return Err(GeometryError::InvalidDistance(flat_distance));
    }

    let position = Vec2::new(flat_distance, 0.0).rotate(-bearing.horizontal.to_radians())
        + Vec2::new(mount.offset.0, mount.offset.1);
    let distance = position.norm();
    if !distance.is_finite() {
        return Err(GeometryError::InvalidDistance(distance));
    }

    Ok(LocalFix {
        bearing,
        position,
        distance,
    })
}

/// Rigid transform from robot frame to field frame.
pub fn convert_to_global_position(local: Vec2, pose: &RobotPose) -> Vec2 {
    local.rotate(pose.heading) + pose.position()
}

/// Build a [`Detection`] from a pixel box, rejecting fixes that can't be
/// trusted or lie beyond `max_range`.
pub fn locate_detection(
    class_name: impl Into<String>,
    confidence: f32,
    bbox: BoundingBox,
    frame_size: (u32, u32),
    mount: &CameraMount,
    max_range: f64,
) -> Result<Detection, GeometryError> {
    let fix = calculate_local_position(bbox.ground_anchor(), frame_size, mount)?;
    if fix.distance > max_range {
        return Err(GeometryError::OutOfRange {
            distance: fix.distance,
            max_range,
        });
    }

    Ok(Detection {
        class_name: class_name.into(),
        confidence,
        bbox,
        bearing_deg: fix.bearing.horizontal,
        local_position: fix.position,
        distance: fix.distance,
    })
}
