//! transmitter - relays the emitted point stream over UDP
//!
//! Reads lines from stdin, accumulates everything between revolution
//! markers into one chunk, and sends each chunk as a single datagram.
//! A marker's elapsed-ms field paces the sends, so replaying a recorded
//! stream over the network keeps roughly the original timing.

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UdpSocket;
use tracing::{info, warn};

/// UDP datagrams must not outgrow this; a chunk that would is flushed early.
const MAX_CHUNK: usize = 65536;

#[derive(Debug, Parser)]
#[command(name = "transmitter", about)]
struct Args {
    /// Address to send packets to
    #[arg(long, default_value = "192.168.1.1")]
    dest: String,

    /// Port on dest to route packets to
    #[arg(long, default_value_t = 8080)]
    port: u16,
}

/// `! <count> <elapsed_ms>` marker fields, when the line carries them.
fn marker_fields(line: &str) -> Option<(u32, u64)> {
    let mut fields = line.split_whitespace();
    if fields.next() != Some("!") {
        return None;
    }
    let count = fields.next()?.parse().ok()?;
    let elapsed_ms = fields.next()?.parse().ok()?;
    Some((count, elapsed_ms))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
    let args = Args::parse();

    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .context("bind local socket")?;
    let target = format!("{}:{}", args.dest, args.port);
    socket
        .connect(&target)
        .await
        .with_context(|| format!("connect to {target}"))?;
    info!("relaying stdin to {target}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut chunk: Vec<u8> = Vec::with_capacity(MAX_CHUNK);

    while let Some(line) = lines.next_line().await.context("read stdin")? {
        if line.starts_with('#') {
            continue;
        }

        if chunk.len() + line.len() + 1 > MAX_CHUNK {
            warn!("chunk full at {} bytes, flushing early", chunk.len());
            send(&socket, &chunk).await;
            chunk.clear();
        }

        chunk.extend_from_slice(line.as_bytes());
        chunk.push(b'\n');

        if let Some((count, elapsed_ms)) = marker_fields(&line) {
            // Pace the replay like the original scan.
            tokio::time::sleep(std::time::Duration::from_millis(elapsed_ms)).await;
            info!(
                "sending chunk of {} KB (cloud {count}, t {elapsed_ms})",
                chunk.len() / 1024
            );
            send(&socket, &chunk).await;
            chunk.clear();
        }
    }

    if !chunk.is_empty() {
        send(&socket, &chunk).await;
    }
    info!("end of input");
    Ok(())
}

async fn send(socket: &UdpSocket, chunk: &[u8]) {
    if chunk.is_empty() {
        return;
    }
    if let Err(e) = socket.send(chunk).await {
        warn!("send failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_marker_lines() {
        assert_eq!(marker_fields("! 12 95"), Some((12, 95)));
        assert_eq!(marker_fields("!"), None);
        assert_eq!(marker_fields("! twelve 95"), None);
        assert_eq!(marker_fields("12 95"), None);
    }
}
