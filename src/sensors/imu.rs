//! MPU-6050 reader
//!
//! Consumes the UART byte stream coming from the MCU, recovers frame
//! boundaries after desync, parses raw or DMP frames, applies the startup
//! calibration and feeds the attitude filter. Publishes one event per
//! frame on a channel towards the scheduler.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::ValueEnum;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, watch};
use tracing::{info, trace, warn};

use crate::frames;
use crate::fusion::complementary::NOMINAL_DT;
use crate::fusion::ComplementaryFilter;
use crate::models::{AttitudeSample, ImuSample, Quat, RawImuSample, Timestamp};

/// Sync prefix `LD\x0C+`, 12 data bytes, `'#'`, CRC.
pub const RAW_FRAME_LEN: usize = 18;
/// Sync prefix `LQ\x10+`, 16 data bytes (4 LE floats), `'#'`, CRC.
pub const DMP_FRAME_LEN: usize = 22;

/// Every IMU frame starts with this byte; anything else seen while waiting
/// for a frame to start is a stray byte to drop.
const SYNC_BYTE: u8 = b'L';

/// More consecutive I/O failures than this and the reader gives up.
const MAX_CONSECUTIVE_IO_ERRORS: u32 = 8;

/// What the MCU is configured to stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ImuMode {
    /// Six big-endian i16 counts: ax ay az gx gy gz.
    Raw,
    /// Four little-endian f32 from the on-chip DMP: qw qx qy qz.
    Dmp,
}

impl ImuMode {
    fn tag(self) -> u8 {
        match self {
            ImuMode::Raw => b'D',
            ImuMode::Dmp => b'Q',
        }
    }

    fn len_byte(self) -> u8 {
        match self {
            ImuMode::Raw => 12,
            ImuMode::Dmp => 16,
        }
    }

    fn frame_len(self) -> usize {
        match self {
            ImuMode::Raw => RAW_FRAME_LEN,
            ImuMode::Dmp => DMP_FRAME_LEN,
        }
    }
}

/// MPU-6050 accelerometer full-scale range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum AccelRange {
    /// ±2 g
    #[default]
    G2,
    /// ±4 g
    G4,
    /// ±8 g
    G8,
    /// ±16 g
    G16,
}

impl AccelRange {
    /// Sensitivity in LSB per g.
    pub fn lsb_per_g(self) -> f64 {
        match self {
            AccelRange::G2 => 16384.0,
            AccelRange::G4 => 8192.0,
            AccelRange::G8 => 4096.0,
            AccelRange::G16 => 2048.0,
        }
    }
}

/// MPU-6050 gyroscope full-scale range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum GyroRange {
    /// ±250 deg/s
    #[default]
    Dps250,
    /// ±500 deg/s
    Dps500,
    /// ±1000 deg/s
    Dps1000,
    /// ±2000 deg/s
    Dps2000,
}

impl GyroRange {
    /// Sensitivity in LSB per deg/s.
    pub fn lsb_per_dps(self) -> f64 {
        match self {
            GyroRange::Dps250 => 131.0,
            GyroRange::Dps500 => 65.5,
            GyroRange::Dps1000 => 32.8,
            GyroRange::Dps2000 => 16.4,
        }
    }
}

/// Unscaled counts as they appear on the wire.
#[derive(Debug, Clone, Copy)]
struct RawCounts {
    ax: i16,
    ay: i16,
    az: i16,
    gx: i16,
    gy: i16,
    gz: i16,
}

/// What one frame carries, before calibration and scaling.
enum FramePayload {
    Counts(RawCounts, Timestamp),
    Quat(AttitudeSample),
}

/// Offsets added to raw counts before scaling.
///
/// Computed once at startup from a window of still-sensor readings and
/// immutable afterwards. The z-accel offset carries an extra +1 g worth of
/// counts so a still sensor reads (0, 0, 1 g).
#[derive(Debug, Clone, Copy, Default)]
pub struct Calibration {
    pub ax: f64,
    pub ay: f64,
    pub az: f64,
    pub gx: f64,
    pub gy: f64,
    pub gz: f64,
}

impl Calibration {
    fn from_still_counts(samples: &[RawCounts], accel_scale: f64) -> Self {
        let n = samples.len() as f64;
        let mut sum = [0.0f64; 6];
        for s in samples {
            sum[0] += f64::from(s.ax);
            sum[1] += f64::from(s.ay);
            sum[2] += f64::from(s.az);
            sum[3] += f64::from(s.gx);
            sum[4] += f64::from(s.gy);
            sum[5] += f64::from(s.gz);
        }
        Self {
            ax: -sum[0] / n,
            ay: -sum[1] / n,
            az: accel_scale - sum[2] / n,
            gx: -sum[3] / n,
            gy: -sum[4] / n,
            gz: -sum[5] / n,
        }
    }
}

/// One failed read attempt. The run loop decides what each kind means.
#[derive(Debug, Error)]
pub enum ImuError {
    /// A stray byte arrived while waiting for a frame to start.
    #[error("stream desync: dropped byte {0:#04x}")]
    Desync(u8),
    /// The collected frame does not start with the expected sync prefix.
    #[error("bad frame prefix")]
    BadPrefix,
    /// The collected frame fails its CRC.
    #[error("checksum mismatch")]
    BadChecksum,
    #[error("serial read: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-frame event towards the scheduler: the attitude that goes into the
/// ring buffer, plus the raw sample behind it when one exists (raw mode).
#[derive(Debug, Clone, Copy)]
pub struct ImuEvent {
    pub raw: Option<RawImuSample>,
    pub attitude: AttitudeSample,
}

pub struct ImuReader<R> {
    port: R,
    mode: ImuMode,
    accel_scale: f64,
    gyro_scale: f64,
    calibration: Calibration,
    filter: ComplementaryFilter,
    last_sample_at: Option<Timestamp>,
    desync_drops: u64,
    rejected_frames: u64,
}

impl<R: AsyncRead + Unpin> ImuReader<R> {
    pub fn new(port: R, mode: ImuMode, accel_range: AccelRange, gyro_range: GyroRange) -> Self {
        Self {
            port,
            mode,
            accel_scale: accel_range.lsb_per_g(),
            gyro_scale: gyro_range.lsb_per_dps(),
            calibration: Calibration::default(),
            filter: ComplementaryFilter::new(),
            last_sample_at: None,
            desync_drops: 0,
            rejected_frames: 0,
        }
    }

    pub fn calibration(&self) -> Calibration {
        self.calibration
    }

    pub fn desync_drops(&self) -> u64 {
        self.desync_drops
    }

    pub fn rejected_frames(&self) -> u64 {
        self.rejected_frames
    }

    /// One attempt at reading a frame off the stream.
    ///
    /// WaitSync: a single byte is read; anything but `'L'` is dropped and
    /// reported. Collect: the rest of the expected frame length follows.
    /// Validate: sync prefix and CRC; a failed frame is discarded whole.
    async fn read_frame(&mut self) -> Result<FramePayload, ImuError> {
        let mut buf = [0u8; DMP_FRAME_LEN];

        // WaitSync
        let first = self.port.read_u8().await?;
        if first != SYNC_BYTE {
            self.desync_drops += 1;
            return Err(ImuError::Desync(first));
        }
        buf[0] = first;

        // Collect
        let len = self.mode.frame_len();
        self.port.read_exact(&mut buf[1..len]).await?;
        let t = Utc::now();
        let frame = &buf[..len];

        // Validate
        if frame[1] != self.mode.tag()
            || frame[2] != self.mode.len_byte()
            || frame[3] != frames::START_BYTE
        {
            self.rejected_frames += 1;
            return Err(ImuError::BadPrefix);
        }
        if !frames::verify(frame) {
            self.rejected_frames += 1;
            return Err(ImuError::BadChecksum);
        }

        let data = &frame[4..len - 2];
        match self.mode {
            ImuMode::Raw => Ok(FramePayload::Counts(
                RawCounts {
                    ax: i16::from_be_bytes([data[0], data[1]]),
                    ay: i16::from_be_bytes([data[2], data[3]]),
                    az: i16::from_be_bytes([data[4], data[5]]),
                    gx: i16::from_be_bytes([data[6], data[7]]),
                    gy: i16::from_be_bytes([data[8], data[9]]),
                    gz: i16::from_be_bytes([data[10], data[11]]),
                },
                t,
            )),
            ImuMode::Dmp => {
                let mut q = [0.0f32; 4];
                for (i, chunk) in data.chunks_exact(4).enumerate() {
                    q[i] = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                }
                let q = Quat::new(
                    f64::from(q[0]),
                    f64::from(q[1]),
                    f64::from(q[2]),
                    f64::from(q[3]),
                )
                .normalize();
                Ok(FramePayload::Quat(AttitudeSample { q, t }))
            }
        }
    }

    /// One attempt at reading a calibrated sample.
    pub async fn read_sample(&mut self) -> Result<ImuSample, ImuError> {
        match self.read_frame().await? {
            FramePayload::Counts(counts, t) => Ok(ImuSample::Raw(self.convert(counts, t))),
            FramePayload::Quat(sample) => Ok(ImuSample::Attitude(sample)),
        }
    }

    fn convert(&self, c: RawCounts, t: Timestamp) -> RawImuSample {
        RawImuSample {
            ax: (f64::from(c.ax) + self.calibration.ax) / self.accel_scale,
            ay: (f64::from(c.ay) + self.calibration.ay) / self.accel_scale,
            az: (f64::from(c.az) + self.calibration.az) / self.accel_scale,
            gx: (f64::from(c.gx) + self.calibration.gx) / self.gyro_scale,
            gy: (f64::from(c.gy) + self.calibration.gy) / self.gyro_scale,
            gz: (f64::from(c.gz) + self.calibration.gz) / self.gyro_scale,
            t,
        }
    }

    /// Average `n` still-sensor readings into the calibration offsets.
    ///
    /// Synchronizes on the stream as a side effect (the first valid frame
    /// is part of the window). No samples are published while this runs.
    /// Raw mode only; DMP quaternions need no host-side calibration.
    pub async fn calibrate(&mut self, n: usize) -> Result<()> {
        if self.mode != ImuMode::Raw {
            bail!("calibration requested in DMP mode");
        }
        if n == 0 {
            return Ok(());
        }

        let mut window: Vec<RawCounts> = Vec::with_capacity(n);
        let mut attempts = 0usize;
        let mut io_errors = 0u32;

        while window.len() < n {
            attempts += 1;
            if attempts > n.saturating_mul(4) + 64 {
                bail!(
                    "calibration impossible: {} valid of {} needed after {} attempts",
                    window.len(),
                    n,
                    attempts
                );
            }
            match self.read_frame().await {
                Ok(FramePayload::Counts(counts, _)) => {
                    io_errors = 0;
                    window.push(counts);
                }
                Ok(FramePayload::Quat(_)) => unreachable!("raw mode yields counts"),
                Err(ImuError::Io(e)) => {
                    io_errors += 1;
                    if io_errors > MAX_CONSECUTIVE_IO_ERRORS {
                        return Err(e).context("calibration read failed repeatedly");
                    }
                    warn!("calibration read: {e}");
                }
                Err(e) => {
                    trace!("calibration: {e}");
                }
            }
        }

        self.calibration = Calibration::from_still_counts(&window, self.accel_scale);
        self.filter.reset();
        Ok(())
    }

    /// Sync on the stream, calibrate, then stream events until shutdown.
    pub async fn run(
        mut self,
        tx: mpsc::Sender<ImuEvent>,
        mut shutdown: watch::Receiver<bool>,
        calib_samples: usize,
    ) -> Result<()> {
        if self.mode == ImuMode::Raw {
            info!("calibrating, keep the head still");
            self.calibrate(calib_samples).await?;
            let c = self.calibration();
            info!(
                "calibration offsets: accel ({:.1}, {:.1}, {:.1}) gyro ({:.1}, {:.1}, {:.1})",
                c.ax, c.ay, c.az, c.gx, c.gy, c.gz
            );
        }

        let mut consecutive_io = 0u32;
        loop {
            let result = tokio::select! {
                _ = shutdown.changed() => break,
                result = self.read_sample() => result,
            };
            match result {
                Ok(sample) => {
                    consecutive_io = 0;
                    let event = self.build_event(sample);
                    if tx.send(event).await.is_err() {
                        // Scheduler is gone; nothing left to feed.
                        break;
                    }
                }
                Err(ImuError::Desync(b)) => {
                    trace!("dropped {}", frames::describe_byte(b));
                }
                Err(e @ (ImuError::BadPrefix | ImuError::BadChecksum)) => {
                    warn!("dropped frame: {e} ({} so far)", self.rejected_frames());
                }
                Err(ImuError::Io(e)) => {
                    consecutive_io += 1;
                    warn!("serial read failed ({consecutive_io} in a row): {e}");
                    if consecutive_io > MAX_CONSECUTIVE_IO_ERRORS {
                        bail!("imu stream unreadable: {e}");
                    }
                }
            }
        }
        info!(
            "imu reader stopping: {} desync drops, {} rejected frames",
            self.desync_drops(),
            self.rejected_frames()
        );
        Ok(())
    }

    /// Raw samples pass through the attitude filter with the measured
    /// inter-sample interval; DMP samples are already attitudes.
    fn build_event(&mut self, sample: ImuSample) -> ImuEvent {
        match sample {
            ImuSample::Raw(raw) => {
                let dt = self
                    .last_sample_at
                    .and_then(|prev| (raw.t - prev).num_microseconds())
                    .map(|us| (us as f64 / 1e6).clamp(1e-4, 0.2))
                    .unwrap_or(NOMINAL_DT);
                self.last_sample_at = Some(raw.t);

                self.filter.update(
                    dt,
                    raw.gx.to_radians(),
                    raw.gy.to_radians(),
                    raw.gz.to_radians(),
                    raw.ax,
                    raw.ay,
                    raw.az,
                    0.0,
                    0.0,
                    0.0,
                );
                ImuEvent {
                    raw: Some(raw),
                    attitude: AttitudeSample {
                        q: self.filter.attitude(),
                        t: raw.t,
                    },
                }
            }
            ImuSample::Attitude(attitude) => ImuEvent {
                raw: None,
                attitude,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio_test::io::Builder;

    const RAW_DATA: [u8; 12] = [
        0x00, 0x01, // ax = 1
        0xff, 0xfe, // ay = -2
        0x40, 0x00, // az = 16384
        0x00, 0x0a, // gx = 10
        0x00, 0x0b, // gy = 11
        0x00, 0x0c, // gz = 12
    ];

    fn raw_frame() -> Vec<u8> {
        frames::encode(&[b'L', b'D', 12], &RAW_DATA)
    }

    fn dmp_frame(q: [f32; 4]) -> Vec<u8> {
        let mut data = Vec::with_capacity(16);
        for v in q {
            data.extend_from_slice(&v.to_le_bytes());
        }
        frames::encode(&[b'L', b'Q', 16], &data)
    }

    fn raw_reader(stream: &[u8]) -> ImuReader<tokio_test::io::Mock> {
        let mock = Builder::new().read(stream).build();
        ImuReader::new(mock, ImuMode::Raw, AccelRange::G2, GyroRange::Dps250)
    }

    #[tokio::test]
    async fn parses_a_raw_frame() {
        let frame = raw_frame();
        assert_eq!(frame.len(), RAW_FRAME_LEN);
        let mut reader = raw_reader(&frame);

        let sample = match reader.read_sample().await.unwrap() {
            ImuSample::Raw(sample) => sample,
            other => panic!("expected raw sample, got {other:?}"),
        };
        // Default calibration is all-zero offsets, so counts only scale.
        assert!((sample.ax - 1.0 / 16384.0).abs() < 1e-12);
        assert!((sample.ay - -2.0 / 16384.0).abs() < 1e-12);
        assert!((sample.az - 1.0).abs() < 1e-12);
        assert!((sample.gx - 10.0 / 131.0).abs() < 1e-12);
        assert!((sample.gy - 11.0 / 131.0).abs() < 1e-12);
        assert!((sample.gz - 12.0 / 131.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn recovers_from_desync() {
        let mut stream = vec![0x58, 0x59];
        stream.extend_from_slice(&raw_frame());
        let mut reader = raw_reader(&stream);

        assert!(matches!(
            reader.read_sample().await,
            Err(ImuError::Desync(0x58))
        ));
        assert!(matches!(
            reader.read_sample().await,
            Err(ImuError::Desync(0x59))
        ));
        assert!(matches!(
            reader.read_sample().await,
            Ok(ImuSample::Raw(_))
        ));
        assert_eq!(reader.desync_drops(), 2);
    }

    #[tokio::test]
    async fn rejects_corrupted_checksum() {
        let mut frame = raw_frame();
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        let mut reader = raw_reader(&frame);

        assert!(matches!(
            reader.read_sample().await,
            Err(ImuError::BadChecksum)
        ));
        assert_eq!(reader.rejected_frames(), 1);
    }

    #[tokio::test]
    async fn rejects_wrong_mode_tag() {
        // A DMP frame arriving at a raw-mode reader: same sync byte, wrong
        // tag. Only the first RAW_FRAME_LEN bytes get consumed.
        let frame = dmp_frame([1.0, 0.0, 0.0, 0.0]);
        let mut reader = raw_reader(&frame[..RAW_FRAME_LEN]);

        assert!(matches!(
            reader.read_sample().await,
            Err(ImuError::BadPrefix)
        ));
    }

    #[tokio::test]
    async fn parses_a_dmp_frame() {
        let frame = dmp_frame([0.5f32.sqrt(), 0.5f32.sqrt(), 0.0, 0.0]);
        assert_eq!(frame.len(), DMP_FRAME_LEN);
        let mock = Builder::new().read(&frame).build();
        let mut reader = ImuReader::new(mock, ImuMode::Dmp, AccelRange::G2, GyroRange::Dps250);

        let sample = match reader.read_sample().await.unwrap() {
            ImuSample::Attitude(sample) => sample,
            other => panic!("expected attitude sample, got {other:?}"),
        };
        assert!((sample.q.norm() - 1.0).abs() < 1e-3);
        assert!((sample.q.w - std::f64::consts::FRAC_1_SQRT_2).abs() < 1e-6);
        assert!(sample.q.y.abs() < 1e-9);
    }

    #[tokio::test]
    async fn calibration_yields_zero_mean_samples() {
        // Five identical still-sensor frames: four for the window, one to
        // read back calibrated.
        let frame = raw_frame();
        let mut stream = Vec::new();
        for _ in 0..5 {
            stream.extend_from_slice(&frame);
        }
        let mut reader = raw_reader(&stream);

        reader.calibrate(4).await.unwrap();
        let c = reader.calibration();
        assert_eq!(c.ax, -1.0);
        assert_eq!(c.ay, 2.0);
        assert_eq!(c.az, 16384.0 - 16384.0);
        assert_eq!(c.gx, -10.0);

        let sample = match reader.read_sample().await.unwrap() {
            ImuSample::Raw(sample) => sample,
            other => panic!("expected raw sample, got {other:?}"),
        };
        assert_eq!(sample.ax, 0.0);
        assert_eq!(sample.ay, 0.0);
        assert_eq!(sample.az, 1.0, "still z-axis reads one gravity");
        assert_eq!(sample.gx, 0.0);
        assert_eq!(sample.gy, 0.0);
        assert_eq!(sample.gz, 0.0);
    }
}
