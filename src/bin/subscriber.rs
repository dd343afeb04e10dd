// Subscriber binary: reconnect loop feeding the seqlock cache, plus
// reader threads exercising the wait-free snapshot path.

use log::{error, info};
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tickcast::cache::{CacheReader, SymbolCache};
use tickcast::config::AppConfig;
use tickcast::hist::LatencyHistogram;
use tickcast::metrics;
use tickcast::sub;
use tickcast::util::{self, PipelineThread, ShutdownFlag};

fn main() -> anyhow::Result<()> {
    let cfg_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

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

    let (reset_tx, reset_rx) = crossbeam_channel::bounded(4);
    let metrics_handle = cfg
        .metrics
        .as_ref()
        .map(|m| metrics::spawn_http(m.bind.clone(), Some(reset_tx)));

    let apply_hist = Arc::new(LatencyHistogram::new(
        cfg.histogram.bucket_size_ns,
        cfg.histogram.max_latency_ns,
    ));
    let (mut writer, reader) = SymbolCache::new(cfg.publisher.num_symbols as usize);

    // Reader threads poll consistent snapshots concurrently with the feed.
    let mut reader_handles = Vec::with_capacity(cfg.subscriber.reader_threads);
    for i in 0..cfg.subscriber.reader_threads {
        let r = reader.clone();
        let sd = shutdown.clone();
        let interval_ms = cfg.subscriber.stats_interval_ms;
        let t = thread::Builder::new()
            .name(format!("reader-{i}"))
            .spawn(move || reader_loop(i, r, sd, interval_ms))?;
        reader_handles.push(t);
    }

    util::apply_os_tuning(&cfg, PipelineThread::Feed);

    let addr = format!("{}:{}", cfg.subscriber.host, cfg.subscriber.port);
    while !shutdown.is_raised() {
        match TcpStream::connect(&addr) {
            Ok(stream) => {
                let outcome = sub::run_feed(
                    stream,
                    &mut writer,
                    apply_hist.clone(),
                    &cfg.subscriber,
                    shutdown.clone(),
                    Some(reset_rx.clone()),
                );
                match outcome {
                    Ok(stats) => info!(
                        "feed ended: parsed={} trades={} quotes={} gaps={} integrity_errors={}",
                        stats.parsed, stats.trades, stats.quotes, stats.gaps, stats.integrity_errors
                    ),
                    Err(e) => error!("feed failed: {e:#}"),
                }
            }
            Err(e) => error!("connect {addr} failed: {e}"),
        }
        if shutdown.is_raised() {
            break;
        }
        // Recycle the connection after a pause
        thread::sleep(Duration::from_secs(1));
    }

    for t in reader_handles {
        let _ = t.join();
    }
    if let Some(m) = &cfg.metrics {
        metrics::request_http_shutdown(&m.bind);
    }
    if let Some(h) = metrics_handle {
        let _ = h.join();
    }

    let l = apply_hist.stats();
    info!(
        "clean shutdown: {} cache updates | apply min={}ns p50={}ns p95={}ns p99={}ns p999={}ns max={}ns ({} samples)",
        reader.total_updates(),
        l.min_ns,
        l.p50_ns,
        l.p95_ns,
        l.p99_ns,
        l.p999_ns,
        l.max_ns,
        l.count
    );
    Ok(())
}

fn reader_loop(idx: usize, reader: CacheReader, shutdown: Arc<ShutdownFlag>, interval_ms: u64) {
    let ids: Vec<u16> = (0..reader.num_symbols() as u16).collect();
    let mut snapshots = Vec::new();
    let mut scans = 0u64;
    let mut last_log = Instant::now();

    while !shutdown.is_raised() {
        reader.snapshot_batch(&ids, &mut snapshots);
        scans += 1;

        if last_log.elapsed() >= Duration::from_millis(interval_ms.max(1)) {
            let live = snapshots.iter().filter(|s| s.update_count > 0).count();
            let total: u64 = snapshots.iter().map(|s| s.update_count).sum();
            info!("reader-{idx}: scans={scans} live_symbols={live}/{} updates_seen={total}", ids.len());
            last_log = Instant::now();
        }
        thread::sleep(Duration::from_millis(1));
    }
}
