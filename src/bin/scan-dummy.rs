//! scan-dummy - synthetic stand-in for the lidar-scan process
//!
//! Emits endless revolutions in the lidar-scan stdout format so the rest
//! of the pipeline can run on a desk with no hardware attached: a comment
//! line, `<angle> <dist>` measurements with Gaussian range noise around a
//! drifting baseline, and a `! <count> <elapsed_ms>` marker per turn.

use std::io::{BufWriter, Write};
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use rand::Rng;
use rand_distr::{Distribution, Normal};

#[derive(Debug, Parser)]
#[command(name = "scan-dummy", about)]
struct Args {
    /// Simulated revolutions per minute
    #[arg(long, default_value_t = 660)]
    rpm: u32,

    /// Points per revolution
    #[arg(long, default_value_t = 1000)]
    points: u32,

    /// Range noise standard deviation in millimeters
    #[arg(long, default_value_t = 15.0)]
    noise: f64,

    /// Fraction of points reported as "no return" (distance 0)
    #[arg(long, default_value_t = 0.02)]
    dropout: f64,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let mut stdout = BufWriter::new(std::io::stdout());
    let mut rng = rand::thread_rng();
    let noise = Normal::new(0.0, args.noise)?;

    let rev_period = Duration::from_secs_f64(60.0 / f64::from(args.rpm.max(1)));
    let mut count: u32 = 0;
    let mut time_start = Instant::now();

    writeln!(stdout, "! 0 0")?;
    loop {
        count += 1;
        writeln!(stdout, "# scan-dummy synthetic data, revolution {count}")?;

        for i in 0..args.points {
            let angle = f64::from(i) / f64::from(args.points) * 360.0;
            // A lumpy room: slow sinusoidal walls plus measurement noise.
            let baseline = 2000.0
                + 600.0 * (angle.to_radians() * 3.0).sin()
                + 200.0 * (f64::from(count) * 0.05).cos();
            let dist = if rng.gen_bool(args.dropout.clamp(0.0, 1.0)) {
                0.0
            } else {
                (baseline + noise.sample(&mut rng)).max(1.0)
            };
            writeln!(stdout, "{:.6} {:.6}", angle, dist)?;
        }

        let elapsed = time_start.elapsed().as_millis();
        writeln!(stdout, "! {} {}", count, elapsed)?;
        stdout.flush()?;
        time_start = Instant::now();

        std::thread::sleep(rev_period);
    }
}
