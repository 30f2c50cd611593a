use std::ops::{Add, Sub};

/// A point or vector on the floor plane, in metres.
///
/// Robot frame: +x forward, +y left.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vec2 {
    pub x: f64,
    pub y: f64,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn norm(self) -> f64 {
        self.x.hypot(self.y)
    }

    pub fn distance(self, other: Vec2) -> f64 {
        (self - other).norm()
    }

    /// Rotate counter-clockwise about the origin.
    pub fn rotate(self, radians: f64) -> Vec2 {
        let (sin, cos) = radians.sin_cos();
        Vec2 {
            x: cos * self.x - sin * self.y,
            y: sin * self.x + cos * self.y,
        }
    }

    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

impl Add for Vec2 {
    type Output = Vec2;

    fn add(self, rhs: Vec2) -> Vec2 {
        Vec2::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for Vec2 {
    type Output = Vec2;

    fn sub(self, rhs: Vec2) -> Vec2 {
        Vec2::new(self.x - rhs.x, self.y - rhs.y)
    }
}

/// Pixel-space box, corners in (x1, y1) top-left / (x2, y2) bottom-right order.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Bottom-centre of the box, the best guess for where the object meets
    /// the floor.
    pub fn ground_anchor(&self) -> (f64, f64) {
        (((self.x1 + self.x2) / 2.0) as f64, self.y2 as f64)
    }

    /// Intersection over union.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);

        let intersection = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 { 0.0 } else { intersection / union }
    }
}

/// One object seen by one camera in one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub class_name: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
    /// Horizontal bearing in degrees, positive to the right of the camera axis.
    pub bearing_deg: f64,
    /// Robot-relative floor position.
    pub local_position: Vec2,
    /// Norm of `local_position`; finite and non-negative.
    pub distance: f64,
}

/// Robot pose on the field: metres and radians (counter-clockwise).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RobotPose {
    pub x: f64,
    pub y: f64,
    pub heading: f64,
}

impl RobotPose {
    /// Parse `[x, y, heading]`. Missing trailing components default to zero;
    /// non-finite input yields the origin.
    pub fn from_array(values: &[f64]) -> Self {
        let get = |i: usize| values.get(i).copied().unwrap_or(0.0);
        let pose = RobotPose {
            x: get(0),
            y: get(1),
            heading: get(2),
        };
        if pose.x.is_finite() && pose.y.is_finite() && pose.heading.is_finite() {
            pose
        } else {
            RobotPose::default()
        }
    }

    pub fn position(&self) -> Vec2 {
        Vec2::new(self.x, self.y)
    }
}

/// Detections judged to be the same physical object in one fusion cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedGroup {
    /// The closest member.
    pub representative: Detection,
    pub members: usize,
}
