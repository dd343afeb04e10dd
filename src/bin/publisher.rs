// Publisher binary: paced tick broadcast over TCP.

use anyhow::Context;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tickcast::config::AppConfig;
use tickcast::engine::BroadcastEngine;
use tickcast::gen::TickGenerator;
use tickcast::hist::LatencyHistogram;
use tickcast::metrics;
use tickcast::util::{self, PipelineThread, ShutdownFlag};

fn main() -> anyhow::Result<()> {
    let cfg_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    // Load config before the logger so the JSON formatting choice applies
    let cfg = AppConfig::load_or_default(&cfg_path)?;
    util::init_logging(cfg.general.json_logs);
    info!("loaded config: {:?}", cfg);

    let shutdown = Arc::new(ShutdownFlag::default());
    {
        let s = shutdown.clone();
        ctrlc::set_handler(move || {
            s.raise();
        })?;
    }

    util::apply_os_tuning(&cfg, PipelineThread::Publisher);

    let metrics_handle = cfg
        .metrics
        .as_ref()
        .map(|m| metrics::spawn_http(m.bind.clone(), None));

    let encode_hist = Arc::new(LatencyHistogram::new(
        cfg.histogram.bucket_size_ns,
        cfg.histogram.max_latency_ns,
    ));
    let gen = TickGenerator::new(cfg.publisher.num_symbols);
    let mut engine = BroadcastEngine::new(cfg.publisher.clone(), gen, Some(encode_hist.clone()));
    engine.start().context("start broadcast engine")?;

    let start = Instant::now();
    let mut last_stats = Instant::now();
    let mut last_count = 0u64;

    while !shutdown.is_raised() {
        engine.run_once()?;

        if last_stats.elapsed() >= Duration::from_secs(5) {
            let count = engine.total_messages_sent();
            let secs = last_stats.elapsed().as_secs().max(1);
            let l = encode_hist.stats();
            info!(
                "[{}s] peers={} messages={} rate={}/s bytes={} | encode p50={}ns p99={}ns max={}ns",
                start.elapsed().as_secs(),
                engine.peer_count(),
                count,
                (count - last_count) / secs,
                engine.total_bytes_sent(),
                l.p50_ns,
                l.p99_ns,
                l.max_ns
            );
            last_count = count;
            last_stats = Instant::now();
        }

        // Yield between iterations; the poll timeout already bounds latency
        std::thread::sleep(Duration::from_micros(10));
    }

    engine.stop();
    if let Some(m) = &cfg.metrics {
        metrics::request_http_shutdown(&m.bind);
    }
    if let Some(h) = metrics_handle {
        let _ = h.join();
    }
    info!(
        "clean shutdown after {}s: {} messages, {} bytes",
        start.elapsed().as_secs(),
        engine.total_messages_sent(),
        engine.total_bytes_sent()
    );
    Ok(())
}
