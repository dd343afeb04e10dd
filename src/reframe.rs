// src/reframe.rs
//
// Reassembles the framed tick stream out of arbitrary TCP byte arrivals.
// The buffer is fixed-capacity; a full drain runs after every append so
// that frames arriving together are all delivered from one call. Recovery
// policy: an unknown kind drops exactly one header's worth of bytes and
// re-parses; an integrity failure drops exactly that frame.

use crate::wire::{self, EventHeader, QuotePayload, TradePayload, CHECKSUM_SIZE, HEADER_SIZE};

pub const BUFFER_CAPACITY: usize = 8192;

/// Typed receiver for parsed frames. Views borrow the reframer's buffer;
/// copy out whatever must outlive the call.
pub trait FrameSink {
    fn on_trade(&mut self, header: &EventHeader, trade: &TradePayload);
    fn on_quote(&mut self, header: &EventHeader, quote: &QuotePayload);
    fn on_heartbeat(&mut self, header: &EventHeader);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReframerStats {
    pub parsed: u64,
    pub trades: u64,
    pub quotes: u64,
    pub heartbeats: u64,
    pub gaps: u64,
    pub integrity_errors: u64,
    pub malformed: u64,
}

pub struct Reframer<S> {
    sink: S,
    buf: Box<[u8; BUFFER_CAPACITY]>,
    used: usize,
    last_sequence: u32,
    first_message: bool,
    validate_integrity: bool,
    validate_sequence: bool,
    stats: ReframerStats,
}

impl<S: FrameSink> Reframer<S> {
    pub fn new(sink: S) -> Self {
        Self::with_validation(sink, true, true)
    }

    pub fn with_validation(sink: S, validate_integrity: bool, validate_sequence: bool) -> Self {
        Self {
            sink,
            buf: Box::new([0u8; BUFFER_CAPACITY]),
            used: 0,
            last_sequence: 0,
            first_message: true,
            validate_integrity,
            validate_sequence,
            stats: ReframerStats::default(),
        }
    }

    pub fn stats(&self) -> &ReframerStats {
        &self.stats
    }

    pub fn last_sequence(&self) -> u32 {
        self.last_sequence
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Appends `data` and dispatches every complete frame. Returns the
    /// number of bytes consumed (all of `data`, or 0 when the input cannot
    /// fit and the parser resets).
    pub fn feed(&mut self, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }
        if self.used + data.len() > BUFFER_CAPACITY {
            // Backstop only; capacity is far beyond twice the largest frame.
            log::warn!(
                "reframe buffer overflow ({} buffered + {} incoming), resetting",
                self.used,
                data.len()
            );
            self.stats.malformed += 1;
            self.reset();
            return 0;
        }
        self.buf[self.used..self.used + data.len()].copy_from_slice(data);
        self.used += data.len();
        self.drain();
        data.len()
    }

    /// Clears buffered bytes and sequence tracking, keeping statistics.
    /// Call on reconnect.
    pub fn reset(&mut self) {
        self.used = 0;
        self.last_sequence = 0;
        self.first_message = true;
    }

    fn drain(&mut self) {
        loop {
            if self.used < HEADER_SIZE {
                return;
            }
            let k = u16::from_le_bytes([self.buf[0], self.buf[1]]);
            let size = wire::frame_size(k);
            if size == 0 {
                // Unrecognized kind: drop one header's worth and resync.
                self.stats.malformed += 1;
                self.discard(HEADER_SIZE);
                continue;
            }
            if self.used < size {
                return; // wait for the rest of the frame
            }
            if self.validate_integrity && !wire::verify(&self.buf[..size]) {
                self.stats.integrity_errors += 1;
                self.discard(size);
                continue;
            }
            self.dispatch(k, size);
            self.discard(size);
        }
    }

    fn dispatch(&mut self, k: u16, size: usize) {
        let frame: &[u8] = &self.buf[..size];
        let Some(hdr) = wire::header_view(&frame[..HEADER_SIZE]) else {
            self.stats.malformed += 1;
            return;
        };

        let seq = hdr.sequence.get();
        if self.validate_sequence && !self.first_message {
            let expected = self.last_sequence.wrapping_add(1);
            if seq != expected {
                // One gap event per discontinuity, whatever its width.
                self.stats.gaps += 1;
                log::debug!(
                    "sequence gap: expected {}, got {} (width {})",
                    expected,
                    seq,
                    seq.wrapping_sub(expected)
                );
            }
        }
        self.last_sequence = seq;
        self.first_message = false;

        let body = &frame[HEADER_SIZE..size - CHECKSUM_SIZE];
        match k {
            wire::kind::TRADE => {
                if let Some(p) = wire::trade_view(body) {
                    self.stats.parsed += 1;
                    self.stats.trades += 1;
                    self.sink.on_trade(hdr, p);
                }
            }
            wire::kind::QUOTE => {
                if let Some(p) = wire::quote_view(body) {
                    self.stats.parsed += 1;
                    self.stats.quotes += 1;
                    self.sink.on_quote(hdr, p);
                }
            }
            wire::kind::HEARTBEAT => {
                self.stats.parsed += 1;
                self.stats.heartbeats += 1;
                self.sink.on_heartbeat(hdr);
            }
            _ => {}
        }
    }

    fn discard(&mut self, n: usize) {
        debug_assert!(n <= self.used);
        self.buf.copy_within(n..self.used, 0);
        self.used -= n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::kind;
    use zerocopy::FromBytes;

    #[derive(Debug, Clone, PartialEq)]
    enum Seen {
        Trade { seq: u32, sym: u16, price: f64, qty: u32 },
        Quote { seq: u32, sym: u16, bid: f64, ask: f64 },
        Heartbeat { seq: u32 },
    }

    #[derive(Default)]
    struct Recorder {
        seen: Vec<Seen>,
    }

    impl FrameSink for Recorder {
        fn on_trade(&mut self, h: &EventHeader, t: &TradePayload) {
            self.seen.push(Seen::Trade {
                seq: h.sequence.get(),
                sym: h.symbol_id.get(),
                price: t.price.get(),
                qty: t.quantity.get(),
            });
        }
        fn on_quote(&mut self, h: &EventHeader, q: &QuotePayload) {
            self.seen.push(Seen::Quote {
                seq: h.sequence.get(),
                sym: h.symbol_id.get(),
                bid: q.bid_price.get(),
                ask: q.ask_price.get(),
            });
        }
        fn on_heartbeat(&mut self, h: &EventHeader) {
            self.seen.push(Seen::Heartbeat { seq: h.sequence.get() });
        }
    }

    fn header(k: u16, seq: u32, sym: u16) -> EventHeader {
        let mut h = EventHeader::new_zeroed();
        h.kind.set(k);
        h.sequence.set(seq);
        h.timestamp_ns.set(42);
        h.symbol_id.set(sym);
        h
    }

    fn trade_frame(seq: u32, sym: u16, price: f64, qty: u32) -> Vec<u8> {
        let h = header(kind::TRADE, seq, sym);
        let mut p = TradePayload::new_zeroed();
        p.price.set(price);
        p.quantity.set(qty);
        let mut buf = vec![0u8; wire::TRADE_FRAME_SIZE];
        wire::encode_trade(&h, &p, &mut buf);
        buf
    }

    fn quote_frame(seq: u32, sym: u16, bid: f64, ask: f64) -> Vec<u8> {
        let h = header(kind::QUOTE, seq, sym);
        let mut p = QuotePayload::new_zeroed();
        p.bid_price.set(bid);
        p.bid_quantity.set(10);
        p.ask_price.set(ask);
        p.ask_quantity.set(20);
        let mut buf = vec![0u8; wire::QUOTE_FRAME_SIZE];
        wire::encode_quote(&h, &p, &mut buf);
        buf
    }

    fn heartbeat_frame(seq: u32) -> Vec<u8> {
        let h = header(kind::HEARTBEAT, seq, 0);
        let mut buf = vec![0u8; wire::HEARTBEAT_FRAME_SIZE];
        wire::encode_heartbeat(&h, &mut buf);
        buf
    }

    #[test]
    fn single_trade_frame() {
        let mut r = Reframer::new(Recorder::default());
        let frame = trade_frame(1, 42, 1234.56, 1000);
        assert_eq!(r.feed(&frame), frame.len());

        assert_eq!(
            r.sink().seen,
            vec![Seen::Trade { seq: 1, sym: 42, price: 1234.56, qty: 1000 }]
        );
        let s = r.stats();
        assert_eq!(s.parsed, 1);
        assert_eq!(s.trades, 1);
        assert_eq!(s.gaps, 0);
        assert_eq!(s.integrity_errors, 0);
    }

    #[test]
    fn fragmented_delivery_reassembles() {
        let mut r = Reframer::new(Recorder::default());
        let frame = trade_frame(1, 42, 1234.56, 1000);
        r.feed(&frame[..10]);
        assert!(r.sink().seen.is_empty());
        r.feed(&frame[10..25]);
        assert!(r.sink().seen.is_empty());
        r.feed(&frame[25..]);

        assert_eq!(r.sink().seen.len(), 1);
        let s = r.stats();
        assert_eq!(s.parsed, 1);
        assert_eq!(s.trades, 1);
        assert_eq!(s.gaps, 0);
    }

    #[test]
    fn gap_counts_once_whatever_its_width() {
        let mut r = Reframer::new(Recorder::default());
        for seq in [1u32, 2, 5] {
            r.feed(&trade_frame(seq, 0, 10.0, 100));
        }
        let s = r.stats();
        assert_eq!(s.parsed, 3);
        assert_eq!(s.gaps, 1);
        assert_eq!(r.last_sequence(), 5);
    }

    #[test]
    fn integrity_failure_drops_only_that_frame() {
        let mut r = Reframer::new(Recorder::default());
        let mut bad = trade_frame(1, 0, 10.0, 100);
        *bad.last_mut().unwrap() ^= 0xFF;
        r.feed(&bad);
        assert_eq!(r.stats().parsed, 0);
        assert_eq!(r.stats().integrity_errors, 1);

        // The corrupted frame never became the sequence baseline, so the
        // next valid frame starts fresh.
        r.feed(&trade_frame(2, 0, 11.0, 100));
        let s = r.stats();
        assert_eq!(s.parsed, 1);
        assert_eq!(s.gaps, 0);
    }

    #[test]
    fn corrupted_middle_frame_surfaces_as_one_gap() {
        let mut r = Reframer::new(Recorder::default());
        r.feed(&trade_frame(1, 0, 10.0, 100));
        let mut bad = trade_frame(2, 0, 10.5, 100);
        *bad.last_mut().unwrap() ^= 0xFF;
        r.feed(&bad);
        r.feed(&trade_frame(3, 0, 11.0, 100));

        let s = r.stats();
        assert_eq!(s.parsed, 2);
        assert_eq!(s.integrity_errors, 1);
        assert_eq!(s.gaps, 1);
    }

    #[test]
    fn unknown_kind_drops_one_header_and_resyncs() {
        let mut r = Reframer::new(Recorder::default());
        let mut stream = vec![0xEEu8; HEADER_SIZE]; // kind 0xEEEE: unknown
        stream.extend_from_slice(&trade_frame(1, 7, 20.0, 300));
        r.feed(&stream);

        let s = r.stats();
        assert_eq!(s.malformed, 1);
        assert_eq!(s.parsed, 1);
        assert_eq!(r.sink().seen.len(), 1);
    }

    #[test]
    fn mixed_stream_arbitrarily_repartitioned() {
        let mut stream = Vec::new();
        let mut expected = Vec::new();
        for seq in 1..=30u32 {
            match seq % 3 {
                0 => {
                    stream.extend_from_slice(&heartbeat_frame(seq));
                    expected.push(Seen::Heartbeat { seq });
                }
                1 => {
                    stream.extend_from_slice(&trade_frame(seq, 1, seq as f64, 100 + seq));
                    expected.push(Seen::Trade { seq, sym: 1, price: seq as f64, qty: 100 + seq });
                }
                _ => {
                    stream.extend_from_slice(&quote_frame(seq, 2, 9.0, 11.0));
                    expected.push(Seen::Quote { seq, sym: 2, bid: 9.0, ask: 11.0 });
                }
            }
        }

        // Feed the identical byte stream in several unfriendly partitions.
        for chunk_sizes in [&[1usize, 3, 7, 13, 31][..], &[5, 11][..], &[1][..], &[997][..]] {
            let mut r = Reframer::new(Recorder::default());
            let mut off = 0;
            let mut i = 0;
            while off < stream.len() {
                let n = chunk_sizes[i % chunk_sizes.len()].min(stream.len() - off);
                assert_eq!(r.feed(&stream[off..off + n]), n);
                off += n;
                i += 1;
            }
            assert_eq!(r.sink().seen, expected);
            let s = r.stats();
            assert_eq!(s.parsed, 30);
            assert_eq!(s.gaps, 0);
            assert_eq!(s.integrity_errors, 0);
            assert_eq!(s.malformed, 0);
        }
    }

    #[test]
    fn empty_feed_is_a_no_op() {
        let mut r = Reframer::new(Recorder::default());
        assert_eq!(r.feed(&[]), 0);
        assert_eq!(*r.stats(), ReframerStats::default());
    }

    #[test]
    fn oversized_input_resets_parser() {
        let mut r = Reframer::new(Recorder::default());
        let big = vec![0u8; BUFFER_CAPACITY + 1];
        assert_eq!(r.feed(&big), 0);
        assert_eq!(r.stats().malformed, 1);

        // Parser is usable again afterwards.
        r.feed(&trade_frame(9, 0, 10.0, 100));
        assert_eq!(r.stats().parsed, 1);
        assert_eq!(r.stats().gaps, 0);
    }

    #[test]
    fn reset_clears_sequence_state_but_keeps_stats() {
        let mut r = Reframer::new(Recorder::default());
        r.feed(&trade_frame(1, 0, 10.0, 100));
        r.feed(&trade_frame(5, 0, 10.0, 100));
        assert_eq!(r.stats().gaps, 1);

        r.reset();
        r.feed(&trade_frame(99, 0, 10.0, 100));
        let s = r.stats();
        assert_eq!(s.gaps, 1, "first frame after reset is not a gap");
        assert_eq!(s.parsed, 3);
    }

    #[test]
    fn disabled_validation_skips_checks() {
        let mut r = Reframer::with_validation(Recorder::default(), false, false);
        let mut bad = trade_frame(1, 0, 10.0, 100);
        *bad.last_mut().unwrap() ^= 0xFF;
        r.feed(&bad);
        r.feed(&trade_frame(50, 0, 10.0, 100));
        let s = r.stats();
        assert_eq!(s.parsed, 2);
        assert_eq!(s.integrity_errors, 0);
        assert_eq!(s.gaps, 0);
    }
}
