// src/engine.rs
//
// Non-blocking broadcast engine. One readiness loop owns the listening
// socket and every peer; emission is paced to the configured rate, one
// symbol per tick, round-robin. Fan-out is lossy: a peer whose kernel send
// buffer is full silently misses that frame and stays connected, while a
// partial write or any other error disconnects it. Removal swaps with the
// last peer so the loop index must not advance on removal.

use crate::config::PublisherCfg;
use crate::gen::TickGenerator;
use crate::hist::{LatencyHistogram, ScopedTimer};
use crate::metrics;
use crate::poller::{PollEvent, Poller};
use crate::util::now_nanos;
use crate::wire::{self, EventHeader, QuotePayload, TradePayload, MAX_FRAME_SIZE};
use anyhow::Context;
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use zerocopy::FromBytes;

const LISTENER_TOKEN: u64 = 0;
const MAX_POLL_TIMEOUT_MS: isize = 1;

struct Peer {
    stream: TcpStream,
    addr: SocketAddr,
    active: bool,
    messages_sent: u64,
    bytes_sent: u64,
    last_send_ns: u64,
}

/// Read-only view of one peer's counters.
#[derive(Debug, Clone)]
pub struct PeerStats {
    pub addr: SocketAddr,
    pub active: bool,
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub last_send_ns: u64,
}

enum SendOutcome {
    Sent,
    Dropped,
    Disconnect,
}

pub struct BroadcastEngine {
    cfg: PublisherCfg,
    gen: TickGenerator,
    listener: Option<TcpListener>,
    poller: Option<Poller>,
    peers: Vec<Peer>,
    interval_ns: u64,
    last_tick_ns: u64,
    last_emit_ns: u64,
    next_symbol: u16,
    running: bool,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
    encode_hist: Option<Arc<LatencyHistogram>>,
    events_scratch: Vec<PollEvent>,
}

impl BroadcastEngine {
    pub fn new(
        cfg: PublisherCfg,
        gen: TickGenerator,
        encode_hist: Option<Arc<LatencyHistogram>>,
    ) -> Self {
        let interval_ns = rate_to_interval(cfg.rate);
        Self {
            cfg,
            gen,
            listener: None,
            poller: None,
            peers: Vec::new(),
            interval_ns,
            last_tick_ns: 0,
            last_emit_ns: 0,
            next_symbol: 0,
            running: false,
            total_messages: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            encode_hist,
            events_scratch: Vec::new(),
        }
    }

    /// Binds the listener and registers it with the poller. Failure here is
    /// fatal to the publisher.
    pub fn start(&mut self) -> anyhow::Result<()> {
        let listener = build_listener(self.cfg.port).context("create listener")?;
        let mut poller = Poller::new().context("create poller")?;
        poller
            .register_readable(listener.as_raw_fd(), LISTENER_TOKEN)
            .context("register listener")?;
        log::info!(
            "broadcast engine listening on {} ({} symbols, {} events/s)",
            listener.local_addr().context("local addr")?,
            self.cfg.num_symbols,
            self.cfg.rate
        );

        self.listener = Some(listener);
        self.poller = Some(poller);
        self.running = true;
        let now = now_nanos();
        self.last_tick_ns = now;
        self.last_emit_ns = now;
        Ok(())
    }

    /// Closes every peer, the listener and the poller, and reports totals.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        for peer in &mut self.peers {
            peer.active = false;
        }
        self.peers.clear();
        self.listener = None;
        self.poller = None;
        metrics::set_peers(0);
        log::info!(
            "broadcast engine stopped: {} messages, {} bytes sent",
            self.total_messages.load(Ordering::Relaxed),
            self.total_bytes.load(Ordering::Relaxed)
        );
    }

    /// One iteration of the event loop: poll for readiness (bounded 1 ms),
    /// drain pending accepts, then emit at most one paced tick.
    pub fn run_once(&mut self) -> anyhow::Result<()> {
        if !self.running {
            return Ok(());
        }

        let timeout = self.poll_timeout_ms(now_nanos());
        let mut events = std::mem::take(&mut self.events_scratch);
        if let Some(poller) = self.poller.as_mut() {
            poller.wait(timeout, &mut events)?;
        }
        for ev in &events {
            if ev.token == LISTENER_TOKEN && ev.readable {
                self.accept_drain();
            }
        }
        self.events_scratch = events;

        let now = now_nanos();
        if self.interval_ns > 0 && now.saturating_sub(self.last_tick_ns) >= self.interval_ns {
            let symbol = self.next_symbol;
            self.next_symbol = (self.next_symbol + 1) % self.cfg.num_symbols;
            self.generate_and_broadcast(symbol);
            self.last_tick_ns = now;
            self.last_emit_ns = now;
        } else if self.heartbeat_due(now) {
            self.broadcast_heartbeat();
            self.last_emit_ns = now;
        }
        Ok(())
    }

    pub fn set_rate(&mut self, rate: u32) {
        self.cfg.rate = rate;
        self.interval_ns = rate_to_interval(rate);
        log::info!("tick rate set to {}/s (interval {} ns)", rate, self.interval_ns);
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peer_stats(&self) -> Vec<PeerStats> {
        self.peers
            .iter()
            .map(|p| PeerStats {
                addr: p.addr,
                active: p.active,
                messages_sent: p.messages_sent,
                bytes_sent: p.bytes_sent,
                last_send_ns: p.last_send_ns,
            })
            .collect()
    }

    pub fn total_messages_sent(&self) -> u64 {
        self.total_messages.load(Ordering::Relaxed)
    }

    pub fn total_bytes_sent(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    // Bounded at 1 ms, collapsed to 0 when the next paced tick is due (or
    // will be due before a millisecond elapses) so high rates are reachable.
    fn poll_timeout_ms(&self, now: u64) -> isize {
        if self.interval_ns > 0 {
            let elapsed = now.saturating_sub(self.last_tick_ns);
            if elapsed >= self.interval_ns || self.interval_ns - elapsed < 1_000_000 {
                return 0;
            }
        }
        MAX_POLL_TIMEOUT_MS
    }

    fn heartbeat_due(&self, now: u64) -> bool {
        let interval_ms = self.cfg.heartbeat_interval_ms;
        interval_ms > 0 && now.saturating_sub(self.last_emit_ns) >= interval_ms * 1_000_000
    }

    fn accept_drain(&mut self) {
        loop {
            let accepted = match self.listener.as_ref() {
                Some(l) => l.accept(),
                None => return,
            };
            match accepted {
                Ok((stream, addr)) => {
                    if let Err(e) = setup_peer_socket(&stream, self.cfg.send_buffer_bytes) {
                        log::warn!("peer {addr} setup failed, dropping: {e:#}");
                        continue;
                    }
                    self.peers.push(Peer {
                        stream,
                        addr,
                        active: true,
                        messages_sent: 0,
                        bytes_sent: 0,
                        last_send_ns: 0,
                    });
                    metrics::set_peers(self.peers.len());
                    log::info!("peer connected: {} (total {})", addr, self.peers.len());
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::error!("accept failed: {e}");
                    break;
                }
            }
        }
    }

    pub(crate) fn generate_and_broadcast(&mut self, symbol_id: u16) {
        let mut frame = [0u8; MAX_FRAME_SIZE];
        let len = {
            let _span = self.encode_hist.as_deref().map(ScopedTimer::new);
            let mut header = EventHeader::new_zeroed();
            if self.gen.generate(symbol_id, &mut header) {
                let mut payload = TradePayload::new_zeroed();
                self.gen.fill_trade_payload(symbol_id, &mut payload);
                wire::encode_trade(&header, &payload, &mut frame)
            } else {
                let mut payload = QuotePayload::new_zeroed();
                self.gen.fill_quote_payload(symbol_id, &mut payload);
                wire::encode_quote(&header, &payload, &mut frame)
            }
        };
        self.broadcast(&frame[..len]);
    }

    pub(crate) fn broadcast_heartbeat(&mut self) {
        let mut frame = [0u8; MAX_FRAME_SIZE];
        let mut header = EventHeader::new_zeroed();
        self.gen.heartbeat(&mut header);
        let len = wire::encode_heartbeat(&header, &mut frame);
        self.broadcast(&frame[..len]);
    }

    fn broadcast(&mut self, frame: &[u8]) {
        if self.peers.is_empty() {
            return;
        }
        let mut i = 0;
        while i < self.peers.len() {
            match send_frame(&mut self.peers[i], frame) {
                SendOutcome::Sent => i += 1,
                SendOutcome::Dropped => {
                    metrics::inc_send_drop();
                    i += 1;
                }
                // swap_remove: do not advance i, the last peer moved here
                SendOutcome::Disconnect => self.disconnect_peer(i),
            }
        }
        self.total_messages.fetch_add(1, Ordering::Relaxed);
        self.total_bytes.fetch_add(frame.len() as u64, Ordering::Relaxed);
        metrics::inc_out_frame(frame.len());
    }

    fn disconnect_peer(&mut self, index: usize) {
        let mut peer = self.peers.swap_remove(index);
        peer.active = false;
        metrics::inc_peer_disconnect();
        metrics::set_peers(self.peers.len());
        log::info!(
            "peer disconnected: {} (sent {} messages, {} bytes)",
            peer.addr,
            peer.messages_sent,
            peer.bytes_sent
        );
    }
}

fn rate_to_interval(rate: u32) -> u64 {
    if rate == 0 {
        0 // paced emission disabled
    } else {
        1_000_000_000 / rate as u64
    }
}

fn build_listener(port: u16) -> anyhow::Result<TcpListener> {
    let sock = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).context("socket")?;
    sock.set_reuse_address(true).ok();
    sock.set_nonblocking(true).context("set nonblocking")?;
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    sock.bind(&SocketAddr::V4(addr).into()).context("bind")?;
    sock.listen(libc::SOMAXCONN).context("listen")?;
    Ok(sock.into())
}

fn setup_peer_socket(stream: &TcpStream, send_buffer_bytes: usize) -> anyhow::Result<()> {
    stream.set_nonblocking(true).context("peer nonblocking")?;
    stream.set_nodelay(true).context("peer nodelay")?;
    if send_buffer_bytes > 0 {
        socket2::SockRef::from(stream)
            .set_send_buffer_size(send_buffer_bytes)
            .context("peer send buffer")?;
    }
    Ok(())
}

fn send_frame(peer: &mut Peer, frame: &[u8]) -> SendOutcome {
    match peer.stream.write(frame) {
        Ok(n) if n == frame.len() => {
            peer.messages_sent += 1;
            peer.bytes_sent += frame.len() as u64;
            peer.last_send_ns = now_nanos();
            SendOutcome::Sent
        }
        // Partial write: no per-peer pending queues, treat as fatal.
        Ok(_) => SendOutcome::Disconnect,
        // Kernel send buffer full: lossy fan-out keeps the peer.
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => SendOutcome::Dropped,
        Err(_) => SendOutcome::Disconnect,
    }
}
