//! lidar-scan ingestion
//!
//! Spawns and supervises the external scanner process, tokenizes its
//! line-oriented stdout into per-revolution point clouds and ships each
//! completed cloud to the scheduler as a boxed value (a cloud is several
//! kilobytes; the handoff must stay O(1)).
//!
//! Stream grammar: `# ...` comments, `! <count> <elapsed_ms>` revolution
//! markers, `<angle_deg> <dist_mm>` measurements.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::models::{Point, PointCloud, Timestamp};

/// rplidar scanning modes understood by lidar-scan.
pub const RPLIDAR_MODE_BOOST: u8 = 2;
pub const RPLIDAR_MODE_SENSITIVITY: u8 = 3;
pub const RPLIDAR_MODE_STABILITY: u8 = 4;
pub const RPLIDAR_MODE_DEFAULT: u8 = RPLIDAR_MODE_SENSITIVITY;

/// Pause before respawning a scanner that went away on its own.
const RESTART_BACKOFF: Duration = Duration::from_millis(500);

/// How long a closed scanner gets to clean up after SIGINT.
#[cfg(unix)]
const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct LidarConfig {
    /// Path to the lidar-scan executable.
    pub exe: PathBuf,
    /// Serial port of the rplidar itself, passed through to lidar-scan.
    pub port: String,
    pub mode: u8,
    /// Declared revolutions per minute (the actual rate may differ).
    pub rpm: u32,
}

impl LidarConfig {
    fn argv(&self) -> Vec<String> {
        vec![
            self.port.clone(),
            "--rpm".into(),
            self.rpm.to_string(),
            "--mode".into(),
            self.mode.to_string(),
        ]
    }
}

pub struct LidarSource {
    config: LidarConfig,
    child: Option<Child>,
}

impl LidarSource {
    pub fn new(config: LidarConfig) -> Self {
        Self {
            config,
            child: None,
        }
    }

    fn spawn(&mut self) -> Result<ChildStdout> {
        let argv = self.config.argv();
        info!("starting {} {}", self.config.exe.display(), argv.join(" "));
        let mut child = Command::new(&self.config.exe)
            .args(&argv)
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("start {}", self.config.exe.display()))?;
        let stdout = child
            .stdout
            .take()
            .context("no stdout pipe on lidar-scan")?;
        self.child = Some(child);
        Ok(stdout)
    }

    /// Stop the scanner, politely where the platform allows it.
    ///
    /// SIGINT first so lidar-scan can spin the motor down; kill only when
    /// that is ignored or unsupported.
    async fn close(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            info!("closing lidar-scan");
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGINT);
            }
            match tokio::time::timeout(CLOSE_GRACE, child.wait()).await {
                Ok(_) => return,
                Err(_) => warn!("lidar-scan ignored SIGINT, killing"),
            }
        }
        info!("killing lidar-scan");
        if let Err(e) = child.kill().await {
            warn!("kill lidar-scan: {e}");
        }
    }

    /// Collect the exit status of a scanner that already went away.
    async fn reap(&mut self) {
        if let Some(mut child) = self.child.take() {
            match child.wait().await {
                Ok(status) => warn!("lidar-scan exited: {status}"),
                Err(e) => warn!("waiting for lidar-scan: {e}"),
            }
        }
    }

    /// Replace the scanner argv by restarting the process; there is no way
    /// to change the arguments of a running one.
    #[allow(dead_code)]
    pub async fn update_args(&mut self, config: LidarConfig) -> Result<ChildStdout> {
        self.close().await;
        self.config = config;
        self.spawn()
    }

    /// Supervise the scanner until shutdown: ingest stdout into clouds,
    /// respawn the process if it dies underneath us.
    pub async fn run(
        mut self,
        tx: mpsc::Sender<Box<PointCloud>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            let stdout = self.spawn()?;
            let mut lines = BufReader::new(stdout).lines();
            let mut assembler = CloudAssembler::default();

            loop {
                let line = tokio::select! {
                    _ = shutdown.changed() => {
                        self.close().await;
                        return Ok(());
                    }
                    line = lines.next_line() => line,
                };
                match line {
                    Ok(Some(line)) => {
                        if let Some(cloud) = assembler.ingest(&line, Utc::now()) {
                            if tx.send(cloud).await.is_err() {
                                self.close().await;
                                return Ok(());
                            }
                        }
                    }
                    Ok(None) => {
                        warn!("lidar-scan stdout closed");
                        break;
                    }
                    Err(e) => {
                        warn!("reading lidar-scan stdout: {e}");
                        break;
                    }
                }
            }

            if *shutdown.borrow() {
                return Ok(());
            }
            self.reap().await;
            tokio::time::sleep(RESTART_BACKOFF).await;
        }
    }
}

/// Cuts the line stream into clouds at the revolution markers.
#[derive(Default)]
struct CloudAssembler {
    current: Option<Box<PointCloud>>,
}

impl CloudAssembler {
    /// Feed one line; returns the previous cloud when `line` sealed it.
    fn ingest(&mut self, line: &str, now: Timestamp) -> Option<Box<PointCloud>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        if let Some(marker) = line.strip_prefix('!') {
            let mut fields = marker.split_whitespace();
            let parsed = (|| {
                let count: u32 = fields.next()?.parse().ok()?;
                let elapsed_ms: u32 = fields.next()?.parse().ok()?;
                Some((count, elapsed_ms))
            })();
            let Some((count, elapsed_ms)) = parsed else {
                warn!("malformed revolution marker: {line:?}");
                return None;
            };
            let sealed = self.current.take();
            self.current = Some(Box::new(PointCloud::new(count + 1, now, elapsed_ms)));
            return sealed;
        }

        let mut fields = line.split_whitespace();
        let parsed = (|| {
            let angle_deg: f32 = fields.next()?.parse().ok()?;
            let dist_mm: f32 = fields.next()?.parse().ok()?;
            Some(Point { angle_deg, dist_mm })
        })();
        let Some(point) = parsed else {
            warn!("malformed measurement line: {line:?}");
            return None;
        };

        match self.current.as_mut() {
            Some(cloud) => {
                if !cloud.push(point) {
                    warn!("cloud {} overflowed, dropping point", cloud.id);
                }
            }
            None => debug!("measurement before the first revolution marker"),
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MAX_CLOUD_POINTS;
    use pretty_assertions::assert_eq;

    fn feed(assembler: &mut CloudAssembler, line: &str) -> Option<Box<PointCloud>> {
        assembler.ingest(line, Utc::now())
    }

    #[test]
    fn marker_seals_the_previous_cloud() {
        let mut asm = CloudAssembler::default();
        assert!(feed(&mut asm, "! 0 0").is_none(), "nothing to seal yet");
        assert!(feed(&mut asm, "10.5 1200").is_none());
        assert!(feed(&mut asm, "11.0 1210").is_none());
        assert!(feed(&mut asm, "11.5 0").is_none());

        let cloud = feed(&mut asm, "! 1 95").expect("first cloud sealed");
        assert_eq!(cloud.id, 1);
        assert_eq!(cloud.size(), 3);
        assert_eq!(cloud.t_diff_ms, 0);
        assert_eq!(cloud.points[0].angle_deg, 10.5);
        assert_eq!(cloud.points[0].dist_mm, 1200.0);

        // The fresh cloud picked up the marker's fields.
        let next = asm.current.as_ref().unwrap();
        assert_eq!(next.id, 2);
        assert_eq!(next.t_diff_ms, 95);
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let mut asm = CloudAssembler::default();
        feed(&mut asm, "! 0 0");
        assert!(feed(&mut asm, "# lidar-scan banner").is_none());
        assert!(feed(&mut asm, "").is_none());
        feed(&mut asm, "1.0 500");
        assert_eq!(asm.current.as_ref().unwrap().size(), 1);
    }

    #[test]
    fn malformed_lines_do_not_abort_the_cloud() {
        let mut asm = CloudAssembler::default();
        feed(&mut asm, "! 0 0");
        feed(&mut asm, "1.0 500");
        assert!(feed(&mut asm, "not numbers").is_none());
        assert!(feed(&mut asm, "3.5").is_none(), "missing distance");
        assert!(feed(&mut asm, "! broken marker").is_none());
        feed(&mut asm, "2.0 600");

        // Still the same cloud, two good points in it.
        let cloud = feed(&mut asm, "! 1 90").unwrap();
        assert_eq!(cloud.size(), 2);
    }

    #[test]
    fn overflow_drops_points_but_keeps_collecting() {
        let mut asm = CloudAssembler::default();
        feed(&mut asm, "! 0 0");
        for i in 0..MAX_CLOUD_POINTS + 10 {
            feed(&mut asm, &format!("{} 1000", i % 360));
        }
        let cloud = feed(&mut asm, "! 1 90").unwrap();
        assert_eq!(cloud.size(), MAX_CLOUD_POINTS);
    }

    #[test]
    fn measurements_before_any_marker_are_dropped() {
        let mut asm = CloudAssembler::default();
        assert!(feed(&mut asm, "1.0 500").is_none());
        assert!(asm.current.is_none());
    }

    #[test]
    fn clouds_carry_ascending_ids() {
        let mut asm = CloudAssembler::default();
        feed(&mut asm, "! 0 0");
        let mut ids = Vec::new();
        for rev in 1..=4u32 {
            feed(&mut asm, "0.0 100");
            ids.push(feed(&mut asm, &format!("! {rev} 90")).unwrap().id);
        }
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }
}
