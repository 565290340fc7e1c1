//! Sensor fusion
//!
//! The attitude filter turns calibrated inertial samples into a unit
//! quaternion; the engine applies one such quaternion (or the servo tilt)
//! to every completed lidar revolution.

pub mod complementary;
pub mod engine;

pub use complementary::ComplementaryFilter;
pub use engine::Fusion;
