// src/cache.rs
//
// Last-known market state per symbol, written by exactly one thread and
// read by any number of threads without locks. Each slot carries a seqlock
// counter: even = stable, odd = write in progress. Writers bump the counter
// with release stores around the in-place field writes; readers bracket a
// volatile copy with acquire loads and retry on mismatch. The single-writer
// discipline is enforced by construction: `SymbolCache::new` hands out one
// non-cloneable `CacheWriter` and a cloneable `CacheReader`.

use crate::util::now_nanos;
use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Reader-visible snapshot of one symbol. Plain data, bytewise copyable.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SymbolState {
    pub best_bid: f64,
    pub best_ask: f64,
    pub bid_qty: u32,
    pub ask_qty: u32,
    pub last_price: f64,
    pub last_qty: u32,
    pub last_update_ns: u64,
    pub update_count: u64,
}

// Cache-line aligned so adjacent symbols never share a line.
#[repr(align(64))]
struct Slot {
    seq: AtomicU64,
    state: UnsafeCell<SymbolState>,
}

// SAFETY: concurrent access to `state` is mediated by the seqlock counter;
// readers only keep copies that two equal even counter loads have validated.
unsafe impl Sync for Slot {}

pub struct SymbolCache {
    slots: Box<[Slot]>,
}

impl SymbolCache {
    pub fn new(num_symbols: usize) -> (CacheWriter, CacheReader) {
        let slots: Box<[Slot]> = (0..num_symbols)
            .map(|_| Slot {
                seq: AtomicU64::new(0),
                state: UnsafeCell::new(SymbolState::default()),
            })
            .collect();
        let cache = Arc::new(SymbolCache { slots });
        (
            CacheWriter { cache: cache.clone() },
            CacheReader { cache },
        )
    }
}

/// Mutating handle. Deliberately not Clone: one writer per cache.
pub struct CacheWriter {
    cache: Arc<SymbolCache>,
}

#[derive(Clone)]
pub struct CacheReader {
    cache: Arc<SymbolCache>,
}

impl CacheWriter {
    #[inline]
    fn write(&mut self, symbol_id: u16, f: impl FnOnce(&mut SymbolState)) {
        let Some(slot) = self.cache.slots.get(symbol_id as usize) else {
            return; // out-of-range writes are a no-op
        };
        let s = slot.seq.load(Ordering::Relaxed);
        slot.seq.store(s + 1, Ordering::Release);

        // SAFETY: this is the only mutating handle, so no other writer
        // exists; readers detect the odd counter and retry.
        let state = unsafe { &mut *slot.state.get() };
        f(state);
        state.last_update_ns = now_nanos();
        state.update_count += 1;

        slot.seq.store(s + 2, Ordering::Release);
    }

    pub fn update_bid(&mut self, symbol_id: u16, price: f64, qty: u32) {
        self.write(symbol_id, |st| {
            st.best_bid = price;
            st.bid_qty = qty;
        });
    }

    pub fn update_ask(&mut self, symbol_id: u16, price: f64, qty: u32) {
        self.write(symbol_id, |st| {
            st.best_ask = price;
            st.ask_qty = qty;
        });
    }

    pub fn update_trade(&mut self, symbol_id: u16, price: f64, qty: u32) {
        self.write(symbol_id, |st| {
            st.last_price = price;
            st.last_qty = qty;
        });
    }

    /// Writes all four quote fields in one cycle. An incoherent quote
    /// (bid >= ask) is stored as (mid - 0.01, mid + 0.01) instead.
    pub fn update_quote(
        &mut self,
        symbol_id: u16,
        bid_price: f64,
        bid_qty: u32,
        ask_price: f64,
        ask_qty: u32,
    ) {
        let (bid, ask) = if bid_price >= ask_price {
            let mid = (bid_price + ask_price) / 2.0;
            (mid - 0.01, mid + 0.01)
        } else {
            (bid_price, ask_price)
        };
        self.write(symbol_id, |st| {
            st.best_bid = bid;
            st.bid_qty = bid_qty;
            st.best_ask = ask;
            st.ask_qty = ask_qty;
        });
    }
}

impl CacheReader {
    pub fn num_symbols(&self) -> usize {
        self.cache.slots.len()
    }

    /// Consistent copy of one symbol's state. Wait-free when no write is in
    /// flight; retries while the writer is mid-update. Out-of-range ids
    /// return a zeroed state.
    pub fn snapshot(&self, symbol_id: u16) -> SymbolState {
        let Some(slot) = self.cache.slots.get(symbol_id as usize) else {
            return SymbolState::default();
        };
        loop {
            let s1 = slot.seq.load(Ordering::Acquire);
            if s1 & 1 != 0 {
                std::hint::spin_loop();
                continue;
            }
            // SAFETY: the copy may race the writer; the counter re-check
            // below discards any torn result before it escapes.
            let snap = unsafe { ptr::read_volatile(slot.state.get()) };
            let s2 = slot.seq.load(Ordering::Acquire);
            if s1 == s2 {
                return snap;
            }
        }
    }

    pub fn snapshot_batch(&self, symbol_ids: &[u16], out: &mut Vec<SymbolState>) {
        out.clear();
        out.reserve(symbol_ids.len());
        for &id in symbol_ids {
            out.push(self.snapshot(id));
        }
    }

    /// Sum of per-symbol update counts. Read without the seqlock; values may
    /// be mid-update, which is fine for monitoring.
    pub fn total_updates(&self) -> u64 {
        let mut total = 0u64;
        for slot in self.cache.slots.iter() {
            // SAFETY: single-field volatile read; staleness is acceptable.
            total += unsafe { ptr::read_volatile(ptr::addr_of!((*slot.state.get()).update_count)) };
        }
        total
    }

    #[cfg(test)]
    pub(crate) fn raw_counter(&self, symbol_id: u16) -> u64 {
        self.cache.slots[symbol_id as usize].seq.load(Ordering::Acquire)
    }
}
