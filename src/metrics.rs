// src/metrics.rs
use crossbeam_channel::Sender;
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::net::ToSocketAddrs;
use std::thread;

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// Publisher side -----

static OUT_FRAMES: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("out_frames_total", "Frames broadcast to peers").expect("out_frames_total");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static OUT_BYTES: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("out_bytes_total", "Bytes broadcast to peers").expect("out_bytes_total");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static SEND_DROPS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "send_drops_total",
        "Frames dropped for a peer whose send buffer was full",
    )
    .expect("send_drops_total");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static PEER_DISCONNECTS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("peer_disconnects_total", "Peers dropped after a write failure")
        .expect("peer_disconnects_total");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static PEERS: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("peers", "Currently connected peers").expect("peers");
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

// Subscriber side -----

static FRAMES_PARSED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("frames_parsed", "Frames parsed per message kind"),
        &["kind"],
    )
    .expect("frames_parsed");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static SEQUENCE_GAPS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("sequence_gaps_total", "Sequence discontinuities observed")
        .expect("sequence_gaps_total");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static INTEGRITY_ERRORS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("integrity_errors_total", "Frames dropped on checksum mismatch")
        .expect("integrity_errors_total");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static MALFORMED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("malformed_total", "Resyncs after unknown kinds or overflow")
        .expect("malformed_total");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static APPLY_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    // Buckets in seconds: 100ns .. 100us
    let buckets = vec![1e-7, 2e-7, 5e-7, 1e-6, 2e-6, 5e-6, 1e-5, 2e-5, 5e-5, 1e-4];
    let h = Histogram::with_opts(
        HistogramOpts::new("apply_latency_seconds", "Parse-to-cache-apply latency").buckets(buckets),
    )
    .expect("apply_latency");
    REGISTRY.register(Box::new(h.clone())).ok();
    h
});

pub fn inc_out_frame(bytes: usize) {
    OUT_FRAMES.inc();
    OUT_BYTES.inc_by(bytes as u64);
}

pub fn inc_send_drop() {
    SEND_DROPS.inc();
}

pub fn inc_peer_disconnect() {
    PEER_DISCONNECTS.inc();
}

pub fn set_peers(n: usize) {
    PEERS.set(n as i64);
}

pub fn inc_parsed(kind: &str, n: u64) {
    if n > 0 {
        FRAMES_PARSED.with_label_values(&[kind]).inc_by(n);
    }
}

pub fn inc_gaps(n: u64) {
    if n > 0 {
        SEQUENCE_GAPS.inc_by(n);
    }
}

pub fn inc_integrity_errors(n: u64) {
    if n > 0 {
        INTEGRITY_ERRORS.inc_by(n);
    }
}

pub fn inc_malformed(n: u64) {
    if n > 0 {
        MALFORMED.inc_by(n);
    }
}

pub fn observe_apply_latency_ns(ns: u64) {
    APPLY_LATENCY.observe(ns as f64 / 1_000_000_000.0);
}

/// Serves /metrics, /healthz, /reset and /shutdown. The optional sender is
/// poked on /reset so the owner of the latency histogram can clear it.
pub fn spawn_http<A: ToSocketAddrs + Send + 'static>(
    addr: A,
    reset_trigger: Option<Sender<()>>,
) -> thread::JoinHandle<()> {
    let addr_string = addr
        .to_socket_addrs()
        .ok()
        .and_then(|mut it| it.next())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "0.0.0.0:9100".to_string());

    thread::spawn(move || {
        let server = match tiny_http::Server::http(&addr_string) {
            Ok(s) => s,
            Err(e) => {
                log::error!("metrics http failed to start on {addr_string}: {e}");
                return;
            }
        };
        log::info!("prometheus metrics listening on http://{addr_string}/metrics");
        let encoder = TextEncoder::new();
        loop {
            if let Ok(req) = server.recv() {
                let url = req.url().to_string();
                if url == "/metrics" {
                    let metric_families = REGISTRY.gather();
                    let mut buf = Vec::with_capacity(16 * 1024);
                    encoder.encode(&metric_families, &mut buf).ok();
                    let resp = tiny_http::Response::from_data(buf)
                        .with_status_code(200)
                        .with_header(
                            tiny_http::Header::from_bytes(
                                &b"Content-Type"[..],
                                &b"text/plain; version=0.0.4"[..],
                            )
                            .unwrap(),
                        );
                    let _ = req.respond(resp);
                } else if url == "/reset" {
                    let ok = reset_trigger
                        .as_ref()
                        .map(|tx| tx.try_send(()).is_ok())
                        .unwrap_or(false);
                    let status = if ok { 202 } else { 503 };
                    let _ = req.respond(tiny_http::Response::empty(status));
                } else if url == "/live" || url == "/healthz" {
                    let _ =
                        req.respond(tiny_http::Response::from_string("OK").with_status_code(200));
                } else if url == "/shutdown" {
                    let _ =
                        req.respond(tiny_http::Response::from_string("BYE").with_status_code(200));
                    break;
                } else {
                    let _ = req.respond(tiny_http::Response::empty(404));
                }
            }
        }
    })
}

/// Pokes /shutdown so the exporter thread can be joined.
pub fn request_http_shutdown(addr: &str) {
    use std::io::Write;
    if let Ok(mut s) = std::net::TcpStream::connect(addr) {
        let _ = s.write_all(b"GET /shutdown HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        let _ = s.flush();
    }
}
