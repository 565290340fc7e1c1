//! scanhead - real-time fusion core of the 3D-scanning rover head
//!
//! Drives a servo-tilted 2D lidar, reads the MPU-6050 over a shared UART
//! to the AVR, and emits world-frame 3D points on stdout, one
//! `x<TAB>y<TAB>z` line per point. Everything human-readable goes to
//! stderr through tracing.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod buffer;
mod frames;
mod fusion;
mod models;
mod scheduler;
mod sensors;

use fusion::engine::PROTOTYPE_CLOUD_ROTATION;
use scheduler::{Config, DebugFlags, FusionSource};
use sensors::imu::{AccelRange, GyroRange, ImuMode};
use sensors::lidar::{
    LidarConfig, RPLIDAR_MODE_BOOST, RPLIDAR_MODE_DEFAULT, RPLIDAR_MODE_STABILITY,
};
use sensors::servo::{ServoConfig, SERVO_MAX_POS, SERVO_MIN_POS};

#[derive(Debug, Parser)]
#[command(name = "scanhead", about, version)]
struct Args {
    /// AVR serial communication port
    #[arg(long, default_value = "/dev/ttyUSB0")]
    avrport: String,

    /// AVR port baud rate (bps)
    #[arg(long, default_value_t = 19200)]
    avrbaud: u32,

    /// lidar-scan executable
    #[arg(long, default_value = "lidar-scan")]
    lidarexe: PathBuf,

    /// RPLIDAR serial communication port
    #[arg(long, default_value = "/dev/ttyUSB1")]
    lidarport: String,

    /// RPLIDAR mode (2 boost, 3 sensitivity, 4 stability)
    #[arg(long, default_value_t = RPLIDAR_MODE_DEFAULT,
          value_parser = clap::value_parser!(u8)
              .range(RPLIDAR_MODE_BOOST as i64..=RPLIDAR_MODE_STABILITY as i64))]
    lidarmode: u8,

    /// RPLIDAR given revolutions per minute
    #[arg(long, default_value_t = 660)]
    lidarpm: u32,

    /// Servo position step per tick
    #[arg(long, default_value_t = 25)]
    servostep: u16,

    /// Delay between servo steps (milliseconds)
    #[arg(long, default_value_t = 40)]
    servodelay: u64,

    /// Lowest allowed servo position
    #[arg(long, default_value_t = SERVO_MIN_POS)]
    servomin: u16,

    /// Highest allowed servo position
    #[arg(long, default_value_t = SERVO_MAX_POS)]
    servomax: u16,

    /// Servo position held during IMU calibration
    #[arg(long, default_value_t = 2000)]
    servocalib: u16,

    /// Servo position the sweep starts from (tilt angle reference)
    #[arg(long, default_value_t = 2000)]
    servostart: u16,

    /// Head-mount angle in radians applied to every 2D cloud
    #[arg(long, default_value_t = PROTOTYPE_CLOUD_ROTATION)]
    cloudrotation: f64,

    /// IMU frame format streamed by the MCU
    #[arg(long, value_enum, default_value = "raw")]
    imu_mode: ImuMode,

    /// Accelerometer full-scale range
    #[arg(long, value_enum, default_value = "g2")]
    accel_range: AccelRange,

    /// Gyroscope full-scale range
    #[arg(long, value_enum, default_value = "dps250")]
    gyro_range: GyroRange,

    /// Still-sensor readings averaged into the calibration offsets
    #[arg(long, default_value_t = 500)]
    calib_samples: usize,

    /// Which sample stream rotates the clouds
    #[arg(long, value_enum, default_value = "attitude")]
    fusion_source: FusionSource,

    /// Print accelerometer data on stdout
    #[arg(long = "accel")]
    accel_out: bool,

    /// Print set servo position on stdout
    #[arg(long = "servo")]
    servo_out: bool,

    /// Print lidar cloud summaries on stdout
    #[arg(long = "lidar")]
    lidar_out: bool,

    /// Print attitude estimator output on stdout
    #[arg(long = "est")]
    est_out: bool,
}

impl Args {
    fn into_config(self) -> Config {
        Config {
            avr_port: self.avrport,
            avr_baud: self.avrbaud,
            imu_mode: self.imu_mode,
            accel_range: self.accel_range,
            gyro_range: self.gyro_range,
            calib_samples: self.calib_samples,
            servo: ServoConfig {
                position_min: self.servomin,
                position_max: self.servomax,
                position_start: self.servostart,
                position_calib: self.servocalib,
                step: self.servostep,
                delay: Duration::from_millis(self.servodelay),
            },
            lidar: LidarConfig {
                exe: self.lidarexe,
                port: self.lidarport,
                mode: self.lidarmode,
                rpm: self.lidarpm,
            },
            cloud_rotation: self.cloudrotation,
            fusion_source: self.fusion_source,
            debug: DebugFlags {
                accel: self.accel_out,
                servo: self.servo_out,
                lidar: self.lidar_out,
                est: self.est_out,
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Structured logging on stderr; stdout belongs to the point stream.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scanhead=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let config = Args::parse().into_config();
    info!("starting scanhead");
    info!("configuration: {:?}", config);

    scheduler::run(config).await
}
