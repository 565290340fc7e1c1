//! Producer tasks
//!
//! One module per data source: the inertial reader and the servo driver
//! share the UART (read and write halves respectively), the lidar source
//! supervises the external scanner process. Each runs as its own task and
//! feeds the scheduler over a channel.

pub mod imu;
pub mod lidar;
pub mod servo;

pub use imu::{ImuEvent, ImuReader};
pub use lidar::LidarSource;
pub use servo::ServoDriver;
