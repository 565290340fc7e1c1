//! Complementary attitude filter
//!
//! Fuses gyroscope integration (short-term accurate, drifts) with the
//! accelerometer's gravity reference (noisy, but does not drift) into a
//! unit quaternion, Mahony style: the error between measured and predicted
//! gravity feeds back into the gyro rates through a proportional and an
//! integral term, the integral doubling as a gyro bias estimate.
//!
//! A magnetometer channel exists in the update contract but the head
//! carries no magnetometer, so the inputs are zero and yaw drifts freely.
//! Only tilt matters for rotating the scan plane, so that is acceptable.

use crate::models::{Quat, Vec3};

/// Proportional feedback gain.
const DEFAULT_KP: f64 = 2.0;
/// Integral feedback gain (gyro bias convergence rate).
const DEFAULT_KI: f64 = 0.005;
/// Accel corrections apply only while ||a| - 1 g| stays within this band,
/// rejecting transient shocks and sustained maneuvers.
const DEFAULT_ACCEL_BAND_G: f64 = 0.3;

/// Nominal update interval when no measured one is available (50 Hz tick).
pub const NOMINAL_DT: f64 = 0.02;

/// Complementary filter estimating body attitude from gyro + accel
pub struct ComplementaryFilter {
    /// Current orientation estimate.
    q: Quat,

    /// Integral feedback accumulator; converges on the gyro bias.
    integral: Vec3,

    /// Proportional gain.
    kp: f64,

    /// Integral gain.
    ki: f64,

    /// Half-width of the accepted accel magnitude band, in g.
    accel_band: f64,
}

impl ComplementaryFilter {
    pub fn new() -> Self {
        Self::with_gains(DEFAULT_KP, DEFAULT_KI)
    }

    pub fn with_gains(kp: f64, ki: f64) -> Self {
        Self {
            q: Quat::identity(),
            integral: Vec3::zero(),
            kp,
            ki,
            accel_band: DEFAULT_ACCEL_BAND_G,
        }
    }

    /// Current attitude as a unit quaternion.
    pub fn attitude(&self) -> Quat {
        self.q
    }

    /// Zero all state and return to the identity attitude.
    pub fn reset(&mut self) {
        self.q = Quat::identity();
        self.integral = Vec3::zero();
    }

    /// Advance the estimate by one sample.
    ///
    /// `dt` in seconds, gyro in rad/s, accel in g (any consistent scale
    /// works, only the direction is used), magnetometer in any unit or all
    /// zero when absent.
    #[allow(clippy::too_many_arguments)]
    pub fn update(
        &mut self,
        dt: f64,
        gx: f64,
        gy: f64,
        gz: f64,
        ax: f64,
        ay: f64,
        az: f64,
        _mx: f64,
        _my: f64,
        _mz: f64,
    ) {
        let mut gx = gx;
        let mut gy = gy;
        let mut gz = gz;

        let accel = Vec3::new(ax, ay, az);
        let mag = accel.magnitude();
        if (mag - 1.0).abs() <= self.accel_band {
            let a = accel.normalize();

            // Gravity direction predicted by the current attitude.
            let vx = 2.0 * (self.q.x * self.q.z - self.q.w * self.q.y);
            let vy = 2.0 * (self.q.w * self.q.x + self.q.y * self.q.z);
            let vz =
                self.q.w * self.q.w - self.q.x * self.q.x - self.q.y * self.q.y
                    + self.q.z * self.q.z;

            // Error is the cross product between measured and predicted.
            let ex = a.y * vz - a.z * vy;
            let ey = a.z * vx - a.x * vz;
            let ez = a.x * vy - a.y * vx;

            self.integral.x += self.ki * ex * dt;
            self.integral.y += self.ki * ey * dt;
            self.integral.z += self.ki * ez * dt;

            gx += self.kp * ex + self.integral.x;
            gy += self.kp * ey + self.integral.y;
            gz += self.kp * ez + self.integral.z;
        }

        // Integrate the rate of change of the quaternion.
        let half_dt = 0.5 * dt;
        let (qw, qx, qy, qz) = (self.q.w, self.q.x, self.q.y, self.q.z);
        self.q = Quat::new(
            qw + (-qx * gx - qy * gy - qz * gz) * half_dt,
            qx + (qw * gx + qy * gz - qz * gy) * half_dt,
            qy + (qw * gy - qx * gz + qz * gx) * half_dt,
            qz + (qw * gz + qx * gy - qy * gx) * half_dt,
        )
        .normalize();
    }
}

impl Default for ComplementaryFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    #[test]
    fn starts_at_identity() {
        let filter = ComplementaryFilter::new();
        let q = filter.attitude();
        assert!((q.w - 1.0).abs() < 1e-12);
        assert_eq!((q.x, q.y, q.z), (0.0, 0.0, 0.0));
    }

    #[test]
    fn stays_unit_norm_through_arbitrary_updates() {
        let mut filter = ComplementaryFilter::new();
        for i in 0..5000 {
            let t = i as f64 * NOMINAL_DT;
            filter.update(
                NOMINAL_DT,
                (0.3 * t).sin(),
                0.8 * (0.2 * t).cos(),
                0.1,
                0.05 * t.sin(),
                0.02,
                1.0,
                0.0,
                0.0,
                0.0,
            );
            assert!((filter.attitude().norm() - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn pure_gyro_integration_matches_commanded_rotation() {
        let mut filter = ComplementaryFilter::new();
        // Freefall accel (zero magnitude) keeps the gravity correction out.
        let rate = PI / 2.0; // 90 deg/s around x
        for _ in 0..100 {
            filter.update(0.01, rate, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0);
        }
        // One second at 90 deg/s: q = (cos 45, sin 45, 0, 0).
        let q = filter.attitude();
        let half = PI / 4.0;
        assert!((q.w - half.cos()).abs() < 1e-3, "got {:?}", q);
        assert!((q.x - half.sin()).abs() < 1e-3, "got {:?}", q);
        assert!(q.y.abs() < 1e-6);
        assert!(q.z.abs() < 1e-6);
    }

    #[test]
    fn gravity_pulls_tilt_error_back() {
        let mut filter = ComplementaryFilter::new();
        // Seed a deliberate 20 degree roll error.
        let half = 10.0_f64.to_radians();
        filter.q = Quat::new(half.cos(), half.sin(), 0.0, 0.0);

        // Still sensor: accel reads straight gravity, gyro silent.
        for _ in 0..20000 {
            filter.update(NOMINAL_DT, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0);
        }
        let q = filter.attitude();
        assert!(q.x.abs() < 0.01, "roll error not corrected: {:?}", q);
    }

    #[test]
    fn shock_outside_band_is_ignored() {
        let mut filter = ComplementaryFilter::new();
        let before = filter.attitude();
        // 5 g shock with silent gyro must not move the estimate.
        filter.update(NOMINAL_DT, 0.0, 0.0, 0.0, 5.0, 0.0, 0.0, 0.0, 0.0, 0.0);
        let after = filter.attitude();
        assert_eq!(
            (before.w, before.x, before.y, before.z),
            (after.w, after.x, after.y, after.z)
        );
    }

    #[test]
    fn reset_returns_to_identity() {
        let mut filter = ComplementaryFilter::new();
        for _ in 0..50 {
            filter.update(NOMINAL_DT, 0.4, -0.2, 0.1, 0.0, 0.1, 1.0, 0.0, 0.0, 0.0);
        }
        filter.reset();
        let q = filter.attitude();
        assert!((q.w - 1.0).abs() < 1e-12);
        assert_eq!((q.x, q.y, q.z), (0.0, 0.0, 0.0));
    }
}
