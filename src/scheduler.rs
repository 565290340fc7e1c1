//! Task scheduler and event multiplexer
//!
//! Owns the UART (split into halves for the IMU reader and the servo
//! driver), the ring buffers of recent samples, and the channels from all
//! three producer tasks. The select loop is the single owner of the rings
//! and of stdout, so no locking is needed anywhere on the hot path.

use std::io::{BufWriter, Write};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::ValueEnum;
use tokio::io::BufReader;
use tokio::sync::{mpsc, watch};
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, StopBits};
use tracing::{error, info, warn};

use crate::buffer::{RingBuffer, DEFAULT_CAPACITY};
use crate::fusion::Fusion;
use crate::models::{AttitudeSample, PointCloud, ServoSample, Timestamp};
use crate::sensors::imu::{AccelRange, GyroRange, ImuMode};
use crate::sensors::lidar::LidarConfig;
use crate::sensors::servo::ServoConfig;
use crate::sensors::{ImuEvent, ImuReader, LidarSource, ServoDriver};

/// Pause after commanding the calibration position, so the mechanics are
/// actually there before the lidar starts painting.
const SERVO_SETTLE: Duration = Duration::from_millis(1500);

/// Which sample stream rotates the clouds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FusionSource {
    /// Estimated attitude quaternion (primary).
    Attitude,
    /// Commanded servo tilt (fallback when no usable IMU is fitted).
    Servo,
}

/// Debug line toggles; everything here is off by default so stdout stays
/// a clean stream of emitted points.
#[derive(Debug, Clone, Copy, Default)]
pub struct DebugFlags {
    pub accel: bool,
    pub servo: bool,
    pub lidar: bool,
    pub est: bool,
}

/// Everything the scheduler needs, assembled from argv in `main`.
#[derive(Debug, Clone)]
pub struct Config {
    pub avr_port: String,
    pub avr_baud: u32,
    pub imu_mode: ImuMode,
    pub accel_range: AccelRange,
    pub gyro_range: GyroRange,
    pub calib_samples: usize,
    pub servo: ServoConfig,
    pub lidar: LidarConfig,
    pub cloud_rotation: f64,
    pub fusion_source: FusionSource,
    pub debug: DebugFlags,
}

/// Open the UART, bring the producers up in order, then multiplex their
/// events until interrupt or a producer gives up.
pub async fn run(config: Config) -> Result<()> {
    let port = tokio_serial::new(&config.avr_port, config.avr_baud)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .open_native_async()
        .with_context(|| format!("open serial port {}", config.avr_port))?;
    info!("serial port {} open at {} bps", config.avr_port, config.avr_baud);
    let (uart_rx, uart_tx) = tokio::io::split(port);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (imu_tx, mut imu_rx) = mpsc::channel::<ImuEvent>(64);
    let (servo_tx, mut servo_rx) = mpsc::channel::<ServoSample>(32);
    let (cloud_tx, mut cloud_rx) = mpsc::channel::<Box<PointCloud>>(8);

    // The IMU comes up first; its calibration gates everything else, and
    // the head must not move while it runs.
    let reader = ImuReader::new(
        BufReader::new(uart_rx),
        config.imu_mode,
        config.accel_range,
        config.gyro_range,
    );
    let mut imu_task = tokio::spawn(reader.run(imu_tx, shutdown_rx.clone(), config.calib_samples));

    info!("waiting for the first attitude sample");
    let first = tokio::select! {
        event = imu_rx.recv() => match event {
            Some(event) => event,
            None => {
                return Err(match (&mut imu_task).await {
                    Ok(Err(e)) => e.context("imu reader"),
                    Ok(Ok(())) => anyhow::anyhow!("imu reader exited before producing samples"),
                    Err(e) => anyhow::anyhow!("imu task panicked: {e}"),
                });
            }
        },
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted during startup");
            let _ = shutdown_tx.send(true);
            let _ = (&mut imu_task).await;
            return Ok(());
        }
    };

    // Servo to the calibration position, wait for the mechanics.
    let mut servo = ServoDriver::new(uart_tx, config.servo);
    info!("servo moving to position {}", config.servo.position_calib);
    servo.set_position(config.servo.position_calib).await;
    tokio::time::sleep(SERVO_SETTLE).await;
    let mut servo_task = tokio::spawn(servo.run(servo_tx, shutdown_rx.clone()));

    let lidar = LidarSource::new(config.lidar.clone());
    let mut lidar_task = tokio::spawn(lidar.run(cloud_tx, shutdown_rx.clone()));

    let mut attitudes: RingBuffer<AttitudeSample> = RingBuffer::new(DEFAULT_CAPACITY);
    let mut servo_samples: RingBuffer<ServoSample> = RingBuffer::new(DEFAULT_CAPACITY);
    let mut latest_cloud: Option<Box<PointCloud>> = None;
    let mut fusion = Fusion::new(config.cloud_rotation);
    let mut out = BufWriter::new(std::io::stdout());

    handle_imu_event(&mut out, &config.debug, &mut attitudes, first)?;
    info!("entering the fusion loop");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            event = imu_rx.recv() => match event {
                Some(event) => handle_imu_event(&mut out, &config.debug, &mut attitudes, event)?,
                None => {
                    warn!("imu channel closed");
                    break;
                }
            },
            sample = servo_rx.recv() => match sample {
                Some(sample) => {
                    if config.debug.servo {
                        writeln!(out, "S {} {}", nanos(sample.t), sample.position)?;
                    }
                    servo_samples.append(sample);
                }
                None => {
                    warn!("servo channel closed");
                    break;
                }
            },
            cloud = cloud_rx.recv() => match cloud {
                Some(cloud) => {
                    if config.debug.lidar {
                        writeln!(out, "L {} {}", cloud.id, cloud.size())?;
                    }
                    match config.fusion_source {
                        FusionSource::Attitude => {
                            fusion.update_with_attitude(&mut out, &cloud, &attitudes)?
                        }
                        FusionSource::Servo => fusion.update_with_servo(
                            &mut out,
                            &cloud,
                            &servo_samples,
                            config.servo.position_start,
                        )?,
                    }
                    latest_cloud = Some(cloud);
                }
                None => {
                    warn!("lidar channel closed");
                    break;
                }
            },
            _ = &mut ctrl_c => {
                info!("interrupt received");
                break;
            }
        }
        out.flush()?;
    }

    // Shutdown: flag the producers, let the lidar task close its child,
    // then collect everything. A producer that died with an error turns
    // the whole run into a failure.
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    out.flush()?;

    let mut failure: Option<anyhow::Error> = None;
    let mut record = |err: anyhow::Error| {
        if failure.is_none() {
            failure = Some(err);
        } else {
            error!("{err:#}");
        }
    };

    match tokio::time::timeout(Duration::from_secs(5), &mut lidar_task).await {
        Ok(Ok(Err(e))) => record(e.context("lidar source")),
        Ok(Err(e)) => record(anyhow::anyhow!("lidar task panicked: {e}")),
        Ok(Ok(Ok(()))) => {}
        Err(_) => {
            warn!("lidar task did not stop in time");
            lidar_task.abort();
        }
    }
    match tokio::time::timeout(Duration::from_secs(2), &mut imu_task).await {
        Ok(Ok(Err(e))) => record(e.context("imu reader")),
        Ok(Err(e)) => record(anyhow::anyhow!("imu task panicked: {e}")),
        Ok(Ok(Ok(()))) => {}
        Err(_) => {
            warn!("imu task did not stop in time");
            imu_task.abort();
        }
    }
    if tokio::time::timeout(Duration::from_secs(2), &mut servo_task)
        .await
        .is_err()
    {
        servo_task.abort();
    }

    // Drain whatever the producers still had in flight.
    while imu_rx.try_recv().is_ok() {}
    while servo_rx.try_recv().is_ok() {}
    while cloud_rx.try_recv().is_ok() {}

    if let Some(e) = failure {
        return Err(e);
    }
    info!(
        "done: {} clouds fused, last id {:?}",
        fusion.clouds_count(),
        latest_cloud.map(|c| c.id)
    );
    Ok(())
}

fn handle_imu_event(
    out: &mut impl Write,
    debug: &DebugFlags,
    attitudes: &mut RingBuffer<AttitudeSample>,
    event: ImuEvent,
) -> Result<()> {
    if debug.accel {
        match event.raw {
            Some(raw) => writeln!(
                out,
                "A {}\t{:.6}\t{:.6}\t{:.6}\t{:.6}\t{:.6}\t{:.6}",
                nanos(raw.t),
                raw.ax,
                raw.ay,
                raw.az,
                raw.gx,
                raw.gy,
                raw.gz
            )?,
            None => writeln!(
                out,
                "a {}\t{:.6}\t{:.6}\t{:.6}\t{:.6}",
                nanos(event.attitude.t),
                event.attitude.q.w,
                event.attitude.q.x,
                event.attitude.q.y,
                event.attitude.q.z
            )?,
        }
    }
    if debug.est {
        let q = event.attitude.q;
        writeln!(out, "{:.6}\t{:.6}\t{:.6}\t{:.6}", q.w, q.x, q.y, q.z)?;
    }
    attitudes.append(event.attitude);
    Ok(())
}

fn nanos(t: Timestamp) -> i64 {
    t.timestamp_nanos_opt().unwrap_or_default()
}
