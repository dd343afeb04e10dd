// src/sub.rs
//
// Subscriber side: one thread reads the socket and owns both the reframer
// and the cache writer, so all cache mutation happens from exactly one
// place. Liveness is frame-based: heartbeats count, bytes alone do not.

use crate::cache::CacheWriter;
use crate::config::SubscriberCfg;
use crate::hist::LatencyHistogram;
use crate::metrics;
use crate::reframe::{FrameSink, Reframer, ReframerStats};
use crate::util::{now_nanos, ShutdownFlag};
use crate::wire::{EventHeader, QuotePayload, TradePayload};
use anyhow::Context;
use crossbeam_channel::Receiver;
use std::io::{self, Read};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

const READ_BUF_SIZE: usize = 4096;
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Applies parsed frames to the symbol cache and records the apply span.
/// Borrows the writer so one connection cycle cannot outlive another.
pub struct CacheSink<'a> {
    writer: &'a mut CacheWriter,
    hist: Arc<LatencyHistogram>,
}

impl<'a> CacheSink<'a> {
    pub fn new(writer: &'a mut CacheWriter, hist: Arc<LatencyHistogram>) -> Self {
        Self { writer, hist }
    }

    #[inline]
    fn record_span(&self, start_ns: u64) {
        let dt = now_nanos().saturating_sub(start_ns);
        self.hist.record(dt);
        metrics::observe_apply_latency_ns(dt);
    }
}

impl FrameSink for CacheSink<'_> {
    fn on_trade(&mut self, header: &EventHeader, trade: &TradePayload) {
        let start = now_nanos();
        self.writer.update_trade(
            header.symbol_id.get(),
            trade.price.get(),
            trade.quantity.get(),
        );
        self.record_span(start);
    }

    fn on_quote(&mut self, header: &EventHeader, quote: &QuotePayload) {
        let start = now_nanos();
        self.writer.update_quote(
            header.symbol_id.get(),
            quote.bid_price.get(),
            quote.bid_quantity.get(),
            quote.ask_price.get(),
            quote.ask_quantity.get(),
        );
        self.record_span(start);
    }

    fn on_heartbeat(&mut self, _header: &EventHeader) {
        // Liveness only; the feed loop tracks frame arrival times.
    }
}

/// Drives one connection until EOF, shutdown, a read error, or the
/// heartbeat timeout. Returns the final parser statistics on a clean end;
/// a silent or failed connection is an error so the caller can recycle it.
pub fn run_feed(
    stream: TcpStream,
    writer: &mut CacheWriter,
    hist: Arc<LatencyHistogram>,
    cfg: &SubscriberCfg,
    shutdown: Arc<ShutdownFlag>,
    reset_rx: Option<Receiver<()>>,
) -> anyhow::Result<ReframerStats> {
    stream.set_nodelay(true).ok();
    stream
        .set_read_timeout(Some(READ_TIMEOUT))
        .context("set read timeout")?;
    let peer = stream.peer_addr().context("peer addr")?;
    log::info!("feed connected to {peer}");

    let sink = CacheSink::new(writer, hist.clone());
    let mut reframer =
        Reframer::with_validation(sink, cfg.validate_integrity, cfg.validate_sequence);

    let mut stream = stream;
    let mut buf = [0u8; READ_BUF_SIZE];
    let heartbeat_timeout = Duration::from_millis(cfg.heartbeat_timeout_ms);
    let stats_every = Duration::from_millis(cfg.stats_interval_ms.max(1));

    let mut last_frame = Instant::now();
    let mut last_stats = Instant::now();
    let mut frames_seen = 0u64;
    let mut synced = ReframerStats::default();

    loop {
        if shutdown.is_raised() {
            break;
        }
        if let Some(rx) = &reset_rx {
            if rx.try_recv().is_ok() {
                hist.reset();
                log::info!("latency histogram reset");
            }
        }

        match stream.read(&mut buf) {
            Ok(0) => {
                log::info!("publisher closed the connection");
                break;
            }
            Ok(n) => {
                reframer.feed(&buf[..n]);
                let parsed = reframer.stats().parsed;
                if parsed != frames_seen {
                    frames_seen = parsed;
                    last_frame = Instant::now();
                }
            }
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut => {}
            Err(e) => {
                sync_metrics(&synced, reframer.stats());
                return Err(e).context("feed read");
            }
        }

        if last_frame.elapsed() >= heartbeat_timeout {
            sync_metrics(&synced, reframer.stats());
            anyhow::bail!(
                "no frames from {} within {:?}, connection presumed dead",
                peer,
                heartbeat_timeout
            );
        }

        if last_stats.elapsed() >= stats_every {
            let s = *reframer.stats();
            sync_metrics(&synced, &s);
            synced = s;
            last_stats = Instant::now();
            let l = hist.stats();
            log::info!(
                "parsed={} trades={} quotes={} heartbeats={} gaps={} integrity_errors={} malformed={} | apply p50={}ns p99={}ns max={}ns",
                s.parsed, s.trades, s.quotes, s.heartbeats, s.gaps, s.integrity_errors, s.malformed,
                l.p50_ns, l.p99_ns, l.max_ns
            );
        }
    }

    let s = *reframer.stats();
    sync_metrics(&synced, &s);
    Ok(s)
}

fn sync_metrics(prev: &ReframerStats, cur: &ReframerStats) {
    metrics::inc_parsed("trade", cur.trades - prev.trades);
    metrics::inc_parsed("quote", cur.quotes - prev.quotes);
    metrics::inc_parsed("heartbeat", cur.heartbeats - prev.heartbeats);
    metrics::inc_gaps(cur.gaps - prev.gaps);
    metrics::inc_integrity_errors(cur.integrity_errors - prev.integrity_errors);
    metrics::inc_malformed(cur.malformed - prev.malformed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SymbolCache;
    use crate::wire::{self, kind};
    use std::io::Write;
    use std::net::TcpListener;
    use std::thread;
    use zerocopy::FromBytes;

    fn trade_frame(seq: u32, sym: u16, price: f64, qty: u32) -> Vec<u8> {
        let mut h = EventHeader::new_zeroed();
        h.kind.set(kind::TRADE);
        h.sequence.set(seq);
        h.timestamp_ns.set(now_nanos());
        h.symbol_id.set(sym);
        let mut p = TradePayload::new_zeroed();
        p.price.set(price);
        p.quantity.set(qty);
        let mut buf = vec![0u8; wire::TRADE_FRAME_SIZE];
        wire::encode_trade(&h, &p, &mut buf);
        buf
    }

    fn quote_frame(seq: u32, sym: u16, bid: f64, ask: f64) -> Vec<u8> {
        let mut h = EventHeader::new_zeroed();
        h.kind.set(kind::QUOTE);
        h.sequence.set(seq);
        h.timestamp_ns.set(now_nanos());
        h.symbol_id.set(sym);
        let mut p = QuotePayload::new_zeroed();
        p.bid_price.set(bid);
        p.bid_quantity.set(7);
        p.ask_price.set(ask);
        p.ask_quantity.set(9);
        let mut buf = vec![0u8; wire::QUOTE_FRAME_SIZE];
        wire::encode_quote(&h, &p, &mut buf);
        buf
    }

    #[test]
    fn sink_applies_frames_to_the_cache() {
        let (mut writer, reader) = SymbolCache::new(4);
        let hist = Arc::new(LatencyHistogram::new(100, 1_000_000));
        let mut r = Reframer::new(CacheSink::new(&mut writer, hist.clone()));

        r.feed(&quote_frame(1, 2, 99.0, 101.0));
        r.feed(&trade_frame(2, 2, 100.25, 500));

        let s = reader.snapshot(2);
        assert_eq!(s.best_bid, 99.0);
        assert_eq!(s.best_ask, 101.0);
        assert_eq!(s.last_price, 100.25);
        assert_eq!(s.last_qty, 500);
        assert_eq!(s.update_count, 2);
        assert_eq!(hist.stats().count, 2);
    }

    #[test]
    fn feed_ends_cleanly_on_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut s, _) = listener.accept().unwrap();
            s.write_all(&quote_frame(1, 0, 10.0, 11.0)).unwrap();
            s.write_all(&trade_frame(2, 0, 10.5, 200)).unwrap();
            s.write_all(&trade_frame(3, 1, 20.5, 300)).unwrap();
            // dropping the stream closes the connection
        });

        let (mut writer, reader) = SymbolCache::new(2);
        let hist = Arc::new(LatencyHistogram::new(100, 1_000_000));
        let cfg = SubscriberCfg::default();
        let shutdown = Arc::new(ShutdownFlag::default());

        let stream = TcpStream::connect(addr).unwrap();
        let stats = run_feed(stream, &mut writer, hist, &cfg, shutdown, None).unwrap();
        server.join().unwrap();

        assert_eq!(stats.parsed, 3);
        assert_eq!(stats.gaps, 0);
        assert_eq!(reader.snapshot(0).last_price, 10.5);
        assert_eq!(reader.snapshot(1).last_price, 20.5);
        assert_eq!(reader.total_updates(), 3);
    }

    #[test]
    fn silent_connection_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (s, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(800));
            drop(s);
        });

        let (mut writer, _reader) = SymbolCache::new(1);
        let hist = Arc::new(LatencyHistogram::new(100, 1_000_000));
        let cfg = SubscriberCfg {
            heartbeat_timeout_ms: 200,
            ..SubscriberCfg::default()
        };
        let shutdown = Arc::new(ShutdownFlag::default());

        let stream = TcpStream::connect(addr).unwrap();
        let err = run_feed(stream, &mut writer, hist, &cfg, shutdown, None).unwrap_err();
        assert!(err.to_string().contains("presumed dead"), "{err}");
        server.join().unwrap();
    }

    #[test]
    fn reset_trigger_clears_the_histogram() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = crossbeam_channel::bounded(1);
        let server = thread::spawn(move || {
            let (mut s, _) = listener.accept().unwrap();
            s.write_all(&trade_frame(1, 0, 10.0, 100)).unwrap();
            thread::sleep(Duration::from_millis(300));
            drop(s);
        });

        let (mut writer, _reader) = SymbolCache::new(1);
        let hist = Arc::new(LatencyHistogram::new(100, 1_000_000));
        let cfg = SubscriberCfg::default();
        let shutdown = Arc::new(ShutdownFlag::default());

        // Preload a sample, then ask for a reset before the feed starts.
        hist.record(42);
        tx.send(()).unwrap();

        let stream = TcpStream::connect(addr).unwrap();
        let stats =
            run_feed(stream, &mut writer, hist.clone(), &cfg, shutdown, Some(rx)).unwrap();
        server.join().unwrap();

        assert_eq!(stats.parsed, 1);
        // Only the post-reset apply sample remains.
        assert_eq!(hist.stats().count, 1);
    }
}
