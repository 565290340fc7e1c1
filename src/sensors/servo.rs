//! Servo tilt driver
//!
//! Sweeps the head between its two bounds: every step advances the
//! commanded position by a fixed vector, reflecting at the limits, writes
//! one position frame to the UART and publishes the sample. The MCU does
//! the actual PWM; this loop only paces and frames the commands.

use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{trace, warn};

use crate::frames;
use crate::models::ServoSample;

/// Logical position window of the tilt servo, overrideable per hardware.
pub const SERVO_MIN_POS: u16 = 1000;
pub const SERVO_MAX_POS: u16 = 3000;

#[derive(Debug, Clone, Copy)]
pub struct ServoConfig {
    pub position_min: u16,
    pub position_max: u16,
    /// Where the sweep begins, also the reference for the tilt angle.
    pub position_start: u16,
    /// Position commanded while the IMU calibrates.
    pub position_calib: u16,
    /// Step added to the position every tick; sign flips at the bounds.
    pub step: u16,
    /// Pause between steps.
    pub delay: Duration,
}

impl Default for ServoConfig {
    fn default() -> Self {
        Self {
            position_min: SERVO_MIN_POS,
            position_max: SERVO_MAX_POS,
            position_start: 2000,
            position_calib: 2000,
            step: 25,
            delay: Duration::from_millis(40),
        }
    }
}

pub struct ServoDriver<W> {
    port: W,
    position: u16,
    vector: i32,
    config: ServoConfig,
}

impl<W: AsyncWrite + Unpin> ServoDriver<W> {
    pub fn new(port: W, config: ServoConfig) -> Self {
        Self {
            port,
            position: config.position_start,
            vector: i32::from(config.step),
            config,
        }
    }

    /// Advance one step, reflecting the movement vector at the bounds.
    fn step(&mut self) {
        let next = i32::from(self.position) + self.vector;
        if next < i32::from(self.config.position_min) {
            self.position = self.config.position_min;
            self.vector = -self.vector;
        } else if next > i32::from(self.config.position_max) {
            self.position = self.config.position_max;
            self.vector = -self.vector;
        } else {
            self.position = next as u16;
        }
    }

    /// Frame and send the current position in one write attempt.
    ///
    /// A failed write is logged, not fatal: the published sample still
    /// carries the attempted position and the send timestamp.
    async fn send(&mut self) -> ServoSample {
        let frame = frames::encode(frames::HEADER_LIDAR, &self.position.to_be_bytes());
        if let Err(e) = self.port.write_all(&frame).await {
            warn!("position frame write failed: {e}");
        }
        trace!("sent position {}", self.position);
        ServoSample {
            position: self.position,
            t: Utc::now(),
        }
    }

    /// Force a position and send it immediately.
    pub async fn set_position(&mut self, position: u16) -> ServoSample {
        self.position = position
            .clamp(self.config.position_min, self.config.position_max);
        self.send().await
    }

    /// Step, send and publish until shutdown.
    pub async fn run(
        mut self,
        tx: mpsc::Sender<ServoSample>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            self.step();
            let sample = self.send().await;
            if tx.send(sample).await.is_err() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(self.config.delay) => {}
            }
        }
    }
}
