// src/gen.rs
//
// Synthetic tick source. Each symbol follows a discrete Geometric Brownian
// Motion step dS = mu*S*dt + sigma*S*sqrt(dt)*dW with per-symbol volatility
// and spread drawn at startup. Emissions carry one global, strictly
// incrementing sequence number across all symbols.

use crate::util::now_nanos;
use crate::wire::{kind, EventHeader, QuotePayload, TradePayload};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

const TRADE_FRACTION: f64 = 0.3;

#[derive(Debug, Clone)]
struct SymbolParams {
    price: f64,
    volatility: f64,    // sigma, 0.01 .. 0.06
    drift: f64,         // mu, neutral by default
    dt: f64,            // time step in years-ish units; 0.001 per tick
    spread_pct: f64,    // bid/ask spread as a fraction of mid, 0.05% .. 0.2%
    base_volume: u32,
}

pub struct TickGenerator {
    symbols: Vec<SymbolParams>,
    rng: SmallRng,
    sequence: u32,
}

impl TickGenerator {
    pub fn new(num_symbols: u16) -> Self {
        Self::from_rng(num_symbols, SmallRng::from_entropy())
    }

    /// Deterministic variant for tests and replays.
    pub fn with_seed(num_symbols: u16, seed: u64) -> Self {
        Self::from_rng(num_symbols, SmallRng::seed_from_u64(seed))
    }

    fn from_rng(num_symbols: u16, mut rng: SmallRng) -> Self {
        let symbols = (0..num_symbols)
            .map(|_| SymbolParams {
                price: 100.0 + rng.gen_range(0.0..4900.0),
                volatility: 0.01 + rng.gen_range(0.0..0.05),
                drift: 0.0,
                dt: 0.001,
                spread_pct: 0.0005 + rng.gen_range(0.0..0.0015),
                base_volume: rng.gen_range(1_000..10_000),
            })
            .collect();
        Self { symbols, rng, sequence: 0 }
    }

    pub fn num_symbols(&self) -> u16 {
        self.symbols.len() as u16
    }

    /// Advance the symbol's price by one step and fill the header for the
    /// next emission. Returns true when the event is a trade, false for a
    /// quote. Out-of-range symbols are a no-op returning false.
    pub fn generate(&mut self, symbol_id: u16, header: &mut EventHeader) -> bool {
        if symbol_id as usize >= self.symbols.len() {
            return false;
        }

        self.step_price(symbol_id);

        let is_trade = self.rng.gen::<f64>() < TRADE_FRACTION;
        self.sequence = self.sequence.wrapping_add(1);

        header.kind.set(if is_trade { kind::TRADE } else { kind::QUOTE });
        header.sequence.set(self.sequence);
        header.timestamp_ns.set(now_nanos());
        header.symbol_id.set(symbol_id);

        is_trade
    }

    /// Fill a HEARTBEAT header, consuming the next sequence number so that
    /// subscribers see an unbroken sequence across idle periods.
    pub fn heartbeat(&mut self, header: &mut EventHeader) {
        self.sequence = self.sequence.wrapping_add(1);
        header.kind.set(kind::HEARTBEAT);
        header.sequence.set(self.sequence);
        header.timestamp_ns.set(now_nanos());
        header.symbol_id.set(0);
    }

    /// Trade prints at the current mid.
    pub fn fill_trade_payload(&mut self, symbol_id: u16, payload: &mut TradePayload) {
        if symbol_id as usize >= self.symbols.len() {
            return;
        }
        let price = self.symbols[symbol_id as usize].price;
        let qty = self.volume(symbol_id);
        payload.price.set(price);
        payload.quantity.set(qty);
    }

    pub fn fill_quote_payload(&mut self, symbol_id: u16, payload: &mut QuotePayload) {
        if symbol_id as usize >= self.symbols.len() {
            return;
        }
        let (bid, ask) = self.bid_ask(symbol_id);
        let bid_qty = self.volume(symbol_id);
        let ask_qty = self.volume(symbol_id);
        payload.bid_price.set(bid);
        payload.bid_quantity.set(bid_qty);
        payload.ask_price.set(ask);
        payload.ask_quantity.set(ask_qty);
    }

    pub fn current_price(&self, symbol_id: u16) -> f64 {
        self.symbols
            .get(symbol_id as usize)
            .map(|s| s.price)
            .unwrap_or(0.0)
    }

    fn step_price(&mut self, symbol_id: u16) {
        let dw: f64 = self.rng.sample(StandardNormal);
        let s = &mut self.symbols[symbol_id as usize];

        let prev = s.price;
        let ds = s.drift * prev * s.dt + s.volatility * prev * s.dt.sqrt() * dw;

        // One tick moves at most into [0.5x, 2x] of the previous price,
        // with an absolute floor of 1.0.
        let mut px = (prev + ds).clamp(prev * 0.5, prev * 2.0);
        if px < 1.0 {
            px = 1.0;
        }
        s.price = px;
    }

    fn bid_ask(&self, symbol_id: u16) -> (f64, f64) {
        let s = &self.symbols[symbol_id as usize];
        let mid = s.price;
        let half_spread = mid * s.spread_pct / 2.0;
        let (bid, ask) = (mid - half_spread, mid + half_spread);
        if bid >= ask {
            (mid - 0.01, mid + 0.01)
        } else {
            (bid, ask)
        }
    }

    fn volume(&mut self, symbol_id: u16) -> u32 {
        let base = self.symbols[symbol_id as usize].base_volume;
        let factor = 0.5 + self.rng.gen::<f64>(); // 0.5 .. 1.5
        ((base as f64 * factor) as u32).max(100)
    }
}
