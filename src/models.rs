//! Core data models for the scanning head
//!
//! Defines all data structures flowing between the producer tasks and the
//! fusion engine, plus the small amount of vector/quaternion math the
//! transform needs.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// All samples are stamped on arrival with wall-clock time.
///
/// Fusion only ever compares timestamps produced by this process, so
/// wall-clock is good enough and keeps the debug output human-readable.
pub type Timestamp = DateTime<Utc>;

/// Maximum number of points a single revolution may carry.
pub const MAX_CLOUD_POINTS: usize = 8192;

/// 2D vector in the lidar scan plane.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f64,
    pub y: f64,
}

impl Vec2 {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Rotate around the origin by `a` radians.
    pub fn rotate(&self, a: f64) -> Self {
        Self {
            x: self.x * a.cos() - self.y * a.sin(),
            y: self.y * a.cos() + self.x * a.sin(),
        }
    }
}

/// 3D vector representation for acceleration, rotation, and emitted points
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    /// Create a new 3D vector
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Zero vector
    pub fn zero() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }

    /// Calculate magnitude of the vector
    pub fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    /// Normalize the vector to unit length
    pub fn normalize(&self) -> Self {
        let mag = self.magnitude();
        if mag > 0.0 {
            Self::new(self.x / mag, self.y / mag, self.z / mag)
        } else {
            Self::zero()
        }
    }
}

/// Quaternion representation for 3D orientation
///
/// Used for representing rotation without gimbal lock issues. Hamilton
/// convention throughout.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Quat {
    pub w: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Quat {
    /// Create a new quaternion
    pub fn new(w: f64, x: f64, y: f64, z: f64) -> Self {
        Self { w, x, y, z }
    }

    /// Identity quaternion (no rotation)
    pub fn identity() -> Self {
        Self::new(1.0, 0.0, 0.0, 0.0)
    }

    pub fn norm(&self) -> f64 {
        (self.w * self.w + self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    /// Normalize to unit length; a degenerate quaternion collapses to identity.
    pub fn normalize(&self) -> Self {
        let n = self.norm();
        if n > 1e-6 {
            Self::new(self.w / n, self.x / n, self.y / n, self.z / n)
        } else {
            Self::identity()
        }
    }

    /// Conjugate: negated vector part.
    pub fn conjugate(&self) -> Self {
        Self::new(self.w, -self.x, -self.y, -self.z)
    }

    /// Hamilton product `self * rhs`.
    pub fn mul(&self, rhs: &Quat) -> Quat {
        let (w1, x1, y1, z1) = (self.w, self.x, self.y, self.z);
        let (w2, x2, y2, z2) = (rhs.w, rhs.x, rhs.y, rhs.z);
        Quat::new(
            w1 * w2 - x1 * x2 - y1 * y2 - z1 * z2,
            w1 * x2 + x1 * w2 + y1 * z2 - z1 * y2,
            w1 * y2 + y1 * w2 + z1 * x2 - x1 * z2,
            w1 * z2 + z1 * w2 + x1 * y2 - y1 * x2,
        )
    }

    /// Rotate a vector by this quaternion: `v' = q * v * q^-1` (active
    /// rotation; the quaternion is assumed normalized).
    pub fn rotate_vec(&self, v: &Vec3) -> Vec3 {
        let p = Quat::new(0.0, v.x, v.y, v.z);
        let w = self.mul(&p).mul(&self.conjugate());
        Vec3::new(w.x, w.y, w.z)
    }
}

/// A single lidar measurement: angle in degrees, distance in millimeters.
///
/// `dist_mm == 0` means "no return" and is skipped by the fusion transform.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Point {
    pub angle_deg: f32,
    pub dist_mm: f32,
}

/// One full ~360 degree lidar revolution.
///
/// Multi-kilobyte; always heap-allocated and handed over channels as
/// `Box<PointCloud>` so the handoff stays O(1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointCloud {
    /// Sequential revolution id.
    pub id: u32,

    /// Time point of reading the revolution marker that started this cloud.
    ///
    /// Caveat: this is line-read time, not actual revolution start.
    pub t_begin: Timestamp,

    /// Declared duration of the measurement in milliseconds.
    pub t_diff_ms: u32,

    /// `t_begin` advanced by `t_diff_ms`.
    pub t_end: Timestamp,

    /// Measurements, in scan order.
    pub points: Vec<Point>,
}

impl PointCloud {
    pub fn new(id: u32, t_begin: Timestamp, t_diff_ms: u32) -> Self {
        Self {
            id,
            t_begin,
            t_diff_ms,
            t_end: t_begin + Duration::milliseconds(i64::from(t_diff_ms)),
            points: Vec::new(),
        }
    }

    /// Append a measurement. Fails when the cloud is at capacity, in which
    /// case the point is dropped by the caller.
    pub fn push(&mut self, point: Point) -> bool {
        if self.points.len() >= MAX_CLOUD_POINTS {
            return false;
        }
        self.points.push(point);
        true
    }

    pub fn size(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Calibrated inertial sample: accelerometer in g, gyro in deg/s.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RawImuSample {
    pub ax: f64,
    pub ay: f64,
    pub az: f64,
    pub gx: f64,
    pub gy: f64,
    pub gz: f64,
    pub t: Timestamp,
}

/// Attitude of the sensor body frame relative to the world frame.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AttitudeSample {
    pub q: Quat,
    pub t: Timestamp,
}

/// What a single IMU frame parses into, depending on the configured mode.
#[derive(Debug, Clone, Copy)]
pub enum ImuSample {
    Raw(RawImuSample),
    Attitude(AttitudeSample),
}

/// Servo position as commanded, stamped at frame-send time.
///
/// Caveat: `t` is when the frame left the UART, not when the horn actually
/// reached `position`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ServoSample {
    pub position: u16,
    pub t: Timestamp,
}
