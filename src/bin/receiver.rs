//! Development receiver: accepts one node at a time and drains its chunk
//! stream, reporting throughput. Audio is counted and discarded, never
//! stored. The production receiver lives elsewhere; this exists so a node
//! can be exercised end to end on a single machine.

use std::io::Read;
use std::net::TcpListener;
use std::time::{Duration, Instant};

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "receiver", about = "Chunk-stream receiver for local testing")]
struct Cli {
    /// Listen address.
    #[arg(long, default_value = "0.0.0.0:9000")]
    listen: String,

    /// Chunk size in bytes; must match the node's `tcp.chunk_bytes`.
    #[arg(long, default_value_t = 19_200)]
    chunk_bytes: usize,
}

fn main() -> std::io::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt().with_target(false).init();

    let listener = TcpListener::bind(&cli.listen)?;
    tracing::info!(
        listen = %cli.listen,
        chunk_bytes = cli.chunk_bytes,
        "receiver listening"
    );

    for stream in listener.incoming() {
        let mut stream = match stream {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("accept failed: {e}");
                continue;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!("failed to set TCP_NODELAY: {e}");
        }
        match stream.peer_addr() {
            Ok(peer) => tracing::info!(%peer, "node connected"),
            Err(_) => tracing::info!("node connected"),
        }

        let mut chunk = vec![0u8; cli.chunk_bytes.max(1)];
        let mut total: u64 = 0;
        let started = Instant::now();
        let mut last_report = Instant::now();

        loop {
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    total += n as u64;
                    if last_report.elapsed() >= Duration::from_secs(10) {
                        let elapsed = started.elapsed().as_secs_f64();
                        let rate_kib_per_s = total as f64 / 1024.0 / elapsed.max(0.001);
                        tracing::info!(total_bytes = total, rate_kib_per_s, "receiving");
                        last_report = Instant::now();
                    }
                }
                Err(e) => {
                    tracing::warn!("read failed: {e}");
                    break;
                }
            }
        }

        tracing::info!(
            total_bytes = total,
            session_s = started.elapsed().as_secs(),
            "node disconnected"
        );
    }

    Ok(())
}
