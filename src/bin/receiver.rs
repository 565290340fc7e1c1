//! receiver - prints UDP datagrams from a transmitter
//!
//! The counterpart of `transmitter`, useful for eyeballing what actually
//! makes it across the link.

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::UdpSocket;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "receiver", about)]
struct Args {
    /// Port to listen on
    #[arg(long, default_value_t = 8080)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
    let args = Args::parse();

    let socket = UdpSocket::bind(("0.0.0.0", args.port))
        .await
        .with_context(|| format!("listen on port {}", args.port))?;
    info!("listening on port {}", args.port);

    let mut buf = vec![0u8; 65536];
    loop {
        let (n, addr) = socket.recv_from(&mut buf).await.context("receive")?;
        let text = String::from_utf8_lossy(&buf[..n]);
        println!("{} bytes received from {} --> {}", n, addr, text.trim());
    }
}
