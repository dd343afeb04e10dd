//! Low-latency synthetic market-data fan-out.
//!
//! A publisher paces Geometric-Brownian-Motion ticks onto a framed binary
//! TCP stream and fans them out, lossily, to any number of subscribers.
//! Each subscriber reframes the byte stream, validates integrity and
//! sequencing, and maintains a seqlock-protected per-symbol cache that
//! display and analytics threads snapshot without locks. Fixed-bucket
//! histograms track encode and apply latencies on both sides.

pub mod cache;
pub mod config;
pub mod engine;
pub mod gen;
pub mod hist;
pub mod metrics;
pub mod poller;
pub mod reframe;
pub mod sub;
pub mod util;
pub mod wire;
