//! Throwaway throughput harness for the copy-in sink.
//!
//! Streams synthetic rows through a simulated connection that acks the
//! handshake, swallows frames, and periodically reports transport
//! saturation so the drain path gets exercised under load. Reports rows/s
//! and MiB/s at the end. Numbers here measure the sink's own overhead, not
//! a real server.

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;

use pgpump::{copy_in, CopyConnection, CopyInConfig, CopyInEvents};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "pgpump-bench - measure copy-in sink throughput against a simulated backend"
)]
struct Args {
    /// Total rows to stream
    #[arg(long, default_value_t = 1_000_000)]
    rows: u64,

    /// Payload bytes per row (before the trailing newline)
    #[arg(long, default_value_t = 64)]
    row_bytes: usize,

    /// Rows per write() call
    #[arg(long, default_value_t = 100)]
    batch: u64,

    /// Flush threshold in KiB
    #[arg(long, default_value_t = 512)]
    buffer_kib: usize,

    /// Simulate transport saturation every N frames (0 = never)
    #[arg(long, default_value_t = 64)]
    stall_every: u64,
}

/// In-memory stand-in for a database connection. Counts what the sink
/// writes and feeds backend events from spawned tasks, the way a real
/// dispatch loop would deliver them off the socket.
struct SimConnection {
    events: CopyInEvents,
    rows: u64,
    stall_every: u64,
    frames: u64,
    stats: Arc<Mutex<SimStats>>,
}

#[derive(Default)]
struct SimStats {
    data_frames: u64,
    payload_bytes: u64,
}

impl CopyConnection for SimConnection {
    fn submit(&mut self, _command: &str) {
        let events = self.events.clone();
        // The ready signal arrives from the dispatch task, never inline.
        tokio::spawn(async move {
            events.copy_in_ready();
        });
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<bool> {
        self.frames += 1;
        match frame[0] {
            pgpump::protocol::COPY_DATA => {
                let mut stats = self.stats.lock();
                stats.data_frames += 1;
                stats.payload_bytes += frame.len() as u64 - 5;
            }
            pgpump::protocol::COPY_DONE => {
                let events = self.events.clone();
                let tag = format!("COPY {}", self.rows);
                tokio::spawn(async move {
                    events.command_complete(&tag);
                    events.ready_for_query();
                });
            }
            _ => {}
        }
        if self.stall_every > 0 && self.frames % self.stall_every == 0 {
            return Ok(false);
        }
        Ok(true)
    }

    fn drain_signal(&mut self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        // Drain "immediately" from another task; enough to exercise the
        // suspended-write path without modelling a real socket buffer.
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            let _ = tx.send(());
        });
        rx
    }

    fn send_abort(&mut self, _reason: &str) {}
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    if args.row_bytes == 0 || args.batch == 0 {
        anyhow::bail!("--row-bytes and --batch must be nonzero");
    }

    let config = CopyInConfig {
        max_buffer: args.buffer_kib * 1024,
    };
    let (mut sink, events) = copy_in("COPY bench_target FROM STDIN", config)?;

    let stats = Arc::new(Mutex::new(SimStats::default()));
    sink.start(Box::new(SimConnection {
        events,
        rows: args.rows,
        stall_every: args.stall_every,
        frames: 0,
        stats: stats.clone(),
    }))?;

    // One synthetic row: fixed filler plus newline, reused for every write.
    let mut row = vec![b'x'; args.row_bytes];
    row.push(b'\n');
    let mut batch = Vec::with_capacity(row.len() * args.batch as usize);

    let pb = ProgressBar::new(args.rows);
    pb.set_style(
        ProgressStyle::with_template("{bar:40} {pos}/{len} rows ({per_sec})")
            .context("bad progress template")?,
    );

    let started = Instant::now();
    let mut sent = 0u64;
    while sent < args.rows {
        let n = args.batch.min(args.rows - sent);
        batch.clear();
        for _ in 0..n {
            batch.extend_from_slice(&row);
        }
        sink.write(&batch).await?;
        sent += n;
        pb.inc(n);
    }
    let reported = sink.finish().await?;
    pb.finish_and_clear();

    let elapsed = started.elapsed().as_secs_f64();
    let total_bytes = sent * (args.row_bytes as u64 + 1);
    let stats = stats.lock();
    println!("Streamed {} rows in {:.2}s", sent, elapsed);
    println!(
        "  {:.0} rows/s, {:.1} MiB/s",
        sent as f64 / elapsed,
        total_bytes as f64 / elapsed / (1024.0 * 1024.0)
    );
    println!(
        "  {} data frames, {} payload bytes on the wire",
        stats.data_frames, stats.payload_bytes
    );
    match reported {
        Some(rows) => println!("  backend reported COPY {}", rows),
        None => println!("  backend reported no row count"),
    }
    Ok(())
}
