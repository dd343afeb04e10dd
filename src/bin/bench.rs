// Load-test client: open N connections against a running publisher and
// report per-connection receive rates and gap counts.
//
// Usage: tickcast-bench [ADDR] [CONNECTIONS] [SECONDS]

use anyhow::Context;
use log::info;
use std::io::{self, Read};
use std::net::TcpStream;
use std::thread;
use std::time::{Duration, Instant};
use tickcast::reframe::{FrameSink, Reframer, ReframerStats};
use tickcast::util;
use tickcast::wire::{EventHeader, QuotePayload, TradePayload};

struct NullSink;

impl FrameSink for NullSink {
    fn on_trade(&mut self, _: &EventHeader, _: &TradePayload) {}
    fn on_quote(&mut self, _: &EventHeader, _: &QuotePayload) {}
    fn on_heartbeat(&mut self, _: &EventHeader) {}
}

fn main() -> anyhow::Result<()> {
    util::init_logging(false);

    let mut args = std::env::args().skip(1);
    let addr = args.next().unwrap_or_else(|| "127.0.0.1:9876".to_string());
    let connections: usize = args
        .next()
        .map(|s| s.parse())
        .transpose()
        .context("CONNECTIONS must be a number")?
        .unwrap_or(4);
    let seconds: u64 = args
        .next()
        .map(|s| s.parse())
        .transpose()
        .context("SECONDS must be a number")?
        .unwrap_or(10);

    info!("benching {addr} with {connections} connections for {seconds}s");

    let mut handles = Vec::with_capacity(connections);
    for i in 0..connections {
        let addr = addr.clone();
        let t = thread::Builder::new()
            .name(format!("bench-{i}"))
            .spawn(move || drain_connection(&addr, Duration::from_secs(seconds)))?;
        handles.push(t);
    }

    let mut per_conn = Vec::with_capacity(connections);
    for (i, t) in handles.into_iter().enumerate() {
        match t.join().expect("bench thread panicked") {
            Ok(stats) => per_conn.push(stats),
            Err(e) => log::error!("connection {i} failed: {e:#}"),
        }
    }
    anyhow::ensure!(!per_conn.is_empty(), "no connection survived the run");

    let total: u64 = per_conn.iter().map(|s| s.parsed).sum();
    let gaps: u64 = per_conn.iter().map(|s| s.gaps).sum();
    let errors: u64 = per_conn.iter().map(|s| s.integrity_errors).sum();
    let slowest = per_conn.iter().map(|s| s.parsed).min().unwrap_or(0);
    let fastest = per_conn.iter().map(|s| s.parsed).max().unwrap_or(0);

    info!(
        "received {} frames over {} connections in {}s ({}/s aggregate)",
        total,
        per_conn.len(),
        seconds,
        total / seconds.max(1)
    );
    info!("per-connection frames: min={slowest} max={fastest} | gaps={gaps} integrity_errors={errors}");
    Ok(())
}

fn drain_connection(addr: &str, duration: Duration) -> anyhow::Result<ReframerStats> {
    let mut stream = TcpStream::connect(addr).with_context(|| format!("connect {addr}"))?;
    stream.set_nodelay(true).ok();
    stream
        .set_read_timeout(Some(Duration::from_millis(100)))
        .context("set read timeout")?;

    let mut reframer = Reframer::new(NullSink);
    let mut buf = [0u8; 64 * 1024];
    let deadline = Instant::now() + duration;

    while Instant::now() < deadline {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                reframer.feed(&buf[..n]);
            }
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut => {}
            Err(e) => return Err(e).context("read"),
        }
    }
    Ok(*reframer.stats())
}
