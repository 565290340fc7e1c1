//! Per-cloud fusion transform
//!
//! For every completed revolution this picks the attitude (or servo
//! position) sample nearest before the cloud began, pushes each 2D
//! measurement through the fixed head-mount rotation and that attitude,
//! and writes world-frame 3D points to the output sink.
//!
//! One attitude per cloud is a deliberate first-order approximation: a
//! revolution takes ~90 ms and the head moves slowly compared to that.

use std::io::{self, Write};

use tracing::debug;

use crate::buffer::RingBuffer;
use crate::models::{AttitudeSample, PointCloud, ServoSample, Vec2, Vec3};

/// Head-mount angle of the first scanning-head prototype, radians.
pub const PROTOTYPE_CLOUD_ROTATION: f64 = -std::f64::consts::FRAC_PI_4;

/// One servo position unit corresponds to this many degrees of tilt.
pub const SERVO_UNIT_TO_DEG: f64 = 0.1;

pub struct Fusion {
    /// Each scanned 2D cloud is rotated by this many radians in its own
    /// plane before being lifted to 3D (the lidar is bolted at an angle).
    cloud_rotation: f64,

    /// Completed clouds pushed through the transform.
    clouds_count: u64,
}

impl Fusion {
    pub fn new(cloud_rotation: f64) -> Self {
        Self {
            cloud_rotation,
            clouds_count: 0,
        }
    }

    pub fn clouds_count(&self) -> u64 {
        self.clouds_count
    }

    /// Transform `cloud` using the newest attitude measured at or before
    /// the cloud began, emitting one `x\ty\tz` line per point.
    ///
    /// Clouds with no usable attitude are skipped whole; a revolution is
    /// cheap, a wrongly-rotated one is not.
    pub fn update_with_attitude<W: Write>(
        &mut self,
        out: &mut W,
        cloud: &PointCloud,
        attitudes: &RingBuffer<AttitudeSample>,
    ) -> io::Result<()> {
        if cloud.is_empty() {
            return Ok(());
        }

        let attitude = attitudes
            .newest_first()
            .find(|sample| sample.t <= cloud.t_begin);
        let q = match attitude {
            Some(sample) => sample.q,
            None => {
                debug!(cloud = cloud.id, "no attitude sample before cloud begin, skipping");
                return Ok(());
            }
        };

        for point in &cloud.points {
            if point.dist_mm == 0.0 {
                continue;
            }
            let pt3 = q.rotate_vec(&self.lift(point.angle_deg, point.dist_mm));
            emit(out, &pt3)?;
        }

        self.clouds_count += 1;
        Ok(())
    }

    /// Transform `cloud` using the servo tilt instead of the estimated
    /// attitude: the alternative path when the IMU is not available.
    pub fn update_with_servo<W: Write>(
        &mut self,
        out: &mut W,
        cloud: &PointCloud,
        servos: &RingBuffer<ServoSample>,
        position_start: u16,
    ) -> io::Result<()> {
        if cloud.is_empty() {
            return Ok(());
        }

        let servo = servos
            .newest_first()
            .find(|sample| sample.t <= cloud.t_begin);
        let s0 = match servo {
            Some(sample) => *sample,
            None => {
                debug!(cloud = cloud.id, "no servo sample before cloud begin, skipping");
                return Ok(());
            }
        };

        let pitch_deg = (f64::from(s0.position) - f64::from(position_start)) * SERVO_UNIT_TO_DEG;
        let pitch = pitch_deg.to_radians();

        for point in &cloud.points {
            if point.dist_mm == 0.0 {
                continue;
            }
            let pt2 = self.plane(point.angle_deg, point.dist_mm);
            // Tilt swings the X axis of the scan plane out of it.
            let tilted = Vec2::new(pt2.x, 0.0).rotate(pitch);
            emit(out, &Vec3::new(tilted.x, pt2.y, tilted.y))?;
        }

        self.clouds_count += 1;
        Ok(())
    }

    /// Polar measurement to head-mount-corrected scan-plane coordinates.
    fn plane(&self, angle_deg: f32, dist_mm: f32) -> Vec2 {
        let angle = f64::from(angle_deg).to_radians();
        let dist = f64::from(dist_mm);
        Vec2::new(dist * angle.cos(), dist * angle.sin()).rotate(self.cloud_rotation)
    }

    /// Scan-plane coordinates lifted into 3D with Z = 0.
    fn lift(&self, angle_deg: f32, dist_mm: f32) -> Vec3 {
        let pt2 = self.plane(angle_deg, dist_mm);
        Vec3::new(pt2.x, pt2.y, 0.0)
    }
}

fn emit<W: Write>(out: &mut W, pt: &Vec3) -> io::Result<()> {
    writeln!(out, "{:.6}\t{:.6}\t{:.6}", pt.x, pt.y, pt.z)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Point, Quat};
    use chrono::{Duration, Utc};
    use pretty_assertions::assert_eq;

    fn cloud_with(points: &[(f32, f32)]) -> PointCloud {
        let mut cloud = PointCloud::new(1, Utc::now(), 100);
        for &(angle_deg, dist_mm) in points {
            assert!(cloud.push(Point { angle_deg, dist_mm }));
        }
        cloud
    }

    fn attitude_before(cloud: &PointCloud, q: Quat) -> RingBuffer<AttitudeSample> {
        let mut buf = RingBuffer::new(8);
        buf.append(AttitudeSample {
            q,
            t: cloud.t_begin - Duration::milliseconds(5),
        });
        buf
    }

    #[test]
    fn identity_attitude_passes_points_through() {
        let cloud = cloud_with(&[(0.0, 100.0)]);
        let attitudes = attitude_before(&cloud, Quat::identity());

        let mut fusion = Fusion::new(0.0);
        let mut out = Vec::new();
        fusion
            .update_with_attitude(&mut out, &cloud, &attitudes)
            .unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "100.000000\t0.000000\t0.000000\n"
        );
        assert_eq!(fusion.clouds_count(), 1);
    }

    #[test]
    fn roll_about_x_leaves_x_points_unchanged() {
        let cloud = cloud_with(&[(0.0, 100.0)]);
        let half = std::f64::consts::FRAC_PI_4;
        let attitudes = attitude_before(&cloud, Quat::new(half.cos(), half.sin(), 0.0, 0.0));

        let mut fusion = Fusion::new(0.0);
        let mut out = Vec::new();
        fusion
            .update_with_attitude(&mut out, &cloud, &attitudes)
            .unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "100.000000\t0.000000\t0.000000\n"
        );
    }

    #[test]
    fn zero_distance_points_are_skipped() {
        let cloud = cloud_with(&[(10.0, 0.0), (0.0, 50.0), (20.0, 0.0)]);
        let attitudes = attitude_before(&cloud, Quat::identity());

        let mut fusion = Fusion::new(0.0);
        let mut out = Vec::new();
        fusion
            .update_with_attitude(&mut out, &cloud, &attitudes)
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().count(), 1);
    }

    #[test]
    fn cloud_without_prior_attitude_is_skipped() {
        let cloud = cloud_with(&[(0.0, 100.0)]);
        let mut attitudes = RingBuffer::new(8);
        // Only a sample from after the cloud began.
        attitudes.append(AttitudeSample {
            q: Quat::identity(),
            t: cloud.t_begin + Duration::milliseconds(50),
        });

        let mut fusion = Fusion::new(0.0);
        let mut out = Vec::new();
        fusion
            .update_with_attitude(&mut out, &cloud, &attitudes)
            .unwrap();
        assert!(out.is_empty());
        assert_eq!(fusion.clouds_count(), 0);
    }

    #[test]
    fn empty_cloud_emits_nothing() {
        let cloud = cloud_with(&[]);
        let attitudes = attitude_before(&cloud, Quat::identity());
        let mut fusion = Fusion::new(0.0);
        let mut out = Vec::new();
        fusion
            .update_with_attitude(&mut out, &cloud, &attitudes)
            .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn mount_rotation_spins_the_scan_plane() {
        // 90 degree mount rotation turns the +X ray into +Y.
        let cloud = cloud_with(&[(0.0, 100.0)]);
        let attitudes = attitude_before(&cloud, Quat::identity());
        let mut fusion = Fusion::new(std::f64::consts::FRAC_PI_2);
        let mut out = Vec::new();
        fusion
            .update_with_attitude(&mut out, &cloud, &attitudes)
            .unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "0.000000\t100.000000\t0.000000\n"
        );
    }

    #[test]
    fn transform_is_deterministic() {
        let cloud = cloud_with(&[(12.5, 431.0), (181.0, 77.5), (359.0, 2040.0)]);
        let half: f64 = 0.3;
        let attitudes = attitude_before(&cloud, Quat::new(half.cos(), 0.1, half.sin(), 0.05).normalize());

        let mut first = Vec::new();
        let mut second = Vec::new();
        Fusion::new(PROTOTYPE_CLOUD_ROTATION)
            .update_with_attitude(&mut first, &cloud, &attitudes)
            .unwrap();
        Fusion::new(PROTOTYPE_CLOUD_ROTATION)
            .update_with_attitude(&mut second, &cloud, &attitudes)
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn servo_path_tilts_the_x_component() {
        let cloud = cloud_with(&[(0.0, 100.0)]);
        let mut servos = RingBuffer::new(8);
        // 900 units above start = 90 degrees of tilt: +X folds onto +Z.
        servos.append(ServoSample {
            position: 2900,
            t: cloud.t_begin - Duration::milliseconds(3),
        });

        let mut fusion = Fusion::new(0.0);
        let mut out = Vec::new();
        fusion
            .update_with_servo(&mut out, &cloud, &servos, 2000)
            .unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "0.000000\t0.000000\t100.000000\n"
        );
    }

    #[test]
    fn servo_path_at_start_position_is_flat() {
        let cloud = cloud_with(&[(90.0, 60.0)]);
        let mut servos = RingBuffer::new(8);
        servos.append(ServoSample {
            position: 2000,
            t: cloud.t_begin - Duration::milliseconds(3),
        });

        let mut fusion = Fusion::new(0.0);
        let mut out = Vec::new();
        fusion
            .update_with_servo(&mut out, &cloud, &servos, 2000)
            .unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "0.000000\t60.000000\t0.000000\n"
        );
    }
}
