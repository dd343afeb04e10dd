// src/hist.rs
//
// Fixed-bucket latency histogram. Any thread may record; all counters are
// relaxed atomics, min/max are CAS loops. Percentiles come from a single
// forward scan and report the lower bound of the bucket where the running
// count reaches the target.

use crate::util::now_nanos;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencyStats {
    pub min_ns: u64,
    pub max_ns: u64,
    pub mean_ns: u64,
    pub p50_ns: u64,
    pub p95_ns: u64,
    pub p99_ns: u64,
    pub p999_ns: u64,
    pub count: u64,
}

pub struct LatencyHistogram {
    bucket_size_ns: u64,
    buckets: Box<[AtomicU64]>,
    min: AtomicU64,
    max: AtomicU64,
    sum: AtomicU64,
    count: AtomicU64,
}

impl LatencyHistogram {
    /// `bucket_size_ns` is the bucket width; samples beyond `max_latency_ns`
    /// saturate into the last bucket.
    pub fn new(bucket_size_ns: u64, max_latency_ns: u64) -> Self {
        let width = bucket_size_ns.max(1);
        let num_buckets = ((max_latency_ns + width - 1) / width + 1) as usize;
        let buckets = (0..num_buckets).map(|_| AtomicU64::new(0)).collect();
        Self {
            bucket_size_ns: width,
            buckets,
            min: AtomicU64::new(u64::MAX),
            max: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn bucket_size_ns(&self) -> u64 {
        self.bucket_size_ns
    }

    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    pub fn record(&self, latency_ns: u64) {
        let mut cur = self.min.load(Ordering::Relaxed);
        while latency_ns < cur {
            match self.min.compare_exchange_weak(cur, latency_ns, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => break,
                Err(seen) => cur = seen,
            }
        }

        let mut cur = self.max.load(Ordering::Relaxed);
        while latency_ns > cur {
            match self.max.compare_exchange_weak(cur, latency_ns, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => break,
                Err(seen) => cur = seen,
            }
        }

        let idx = ((latency_ns / self.bucket_size_ns) as usize).min(self.buckets.len() - 1);
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(latency_ns, Ordering::Relaxed);
    }

    /// Best-effort snapshot: counters may move while the scan runs.
    pub fn stats(&self) -> LatencyStats {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return LatencyStats::default();
        }

        let mut stats = LatencyStats {
            count,
            min_ns: self.min.load(Ordering::Relaxed),
            max_ns: self.max.load(Ordering::Relaxed),
            mean_ns: self.sum.load(Ordering::Relaxed) / count,
            ..Default::default()
        };

        let p50_target = (count * 50 / 100).max(1);
        let p95_target = (count * 95 / 100).max(1);
        let p99_target = (count * 99 / 100).max(1);
        let p999_target = (count * 999 / 1000).max(1);

        let mut cumulative = 0u64;
        let (mut p50, mut p95, mut p99) = (false, false, false);
        for (i, bucket) in self.buckets.iter().enumerate() {
            cumulative += bucket.load(Ordering::Relaxed);
            let lower = i as u64 * self.bucket_size_ns;
            if !p50 && cumulative >= p50_target {
                stats.p50_ns = lower;
                p50 = true;
            }
            if !p95 && cumulative >= p95_target {
                stats.p95_ns = lower;
                p95 = true;
            }
            if !p99 && cumulative >= p99_target {
                stats.p99_ns = lower;
                p99 = true;
            }
            if cumulative >= p999_target {
                stats.p999_ns = lower;
                break;
            }
        }
        stats
    }

    /// Clears every counter. Not atomic as a whole: records racing a reset
    /// may land in the new window, which is acceptable for monitoring.
    pub fn reset(&self) {
        for bucket in self.buckets.iter() {
            bucket.store(0, Ordering::Relaxed);
        }
        self.min.store(u64::MAX, Ordering::Relaxed);
        self.max.store(0, Ordering::Relaxed);
        self.sum.store(0, Ordering::Relaxed);
        self.count.store(0, Ordering::Relaxed);
    }

    /// Copies raw bucket counts out, for offline analysis.
    pub fn export(&self, out: &mut Vec<u64>) {
        out.clear();
        out.reserve(self.buckets.len());
        for bucket in self.buckets.iter() {
            out.push(bucket.load(Ordering::Relaxed));
        }
    }
}

/// Records the elapsed span into the histogram when dropped.
pub struct ScopedTimer<'a> {
    hist: &'a LatencyHistogram,
    start_ns: u64,
}

impl<'a> ScopedTimer<'a> {
    pub fn new(hist: &'a LatencyHistogram) -> Self {
        Self { hist, start_ns: now_nanos() }
    }
}

impl Drop for ScopedTimer<'_> {
    fn drop(&mut self) {
        self.hist.record(now_nanos().saturating_sub(self.start_ns));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn empty_histogram_reports_zeros() {
        let h = LatencyHistogram::new(100, 1_000);
        assert_eq!(h.stats(), LatencyStats::default());
    }

    #[test]
    fn bucket_count_is_ceil_plus_one() {
        assert_eq!(LatencyHistogram::new(100, 1_000).num_buckets(), 11);
        assert_eq!(LatencyHistogram::new(100, 1_001).num_buckets(), 12);
        assert_eq!(LatencyHistogram::new(100, 99).num_buckets(), 2);
    }

    #[test]
    fn percentiles_from_uniform_samples() {
        let h = LatencyHistogram::new(100, 1_000);
        for v in (0..1_000).step_by(10) {
            h.record(v);
        }
        let s = h.stats();
        assert_eq!(s.count, 100);
        assert_eq!(s.min_ns, 0);
        assert_eq!(s.max_ns, 990);
        assert_eq!(s.mean_ns, 495);
        assert_eq!(s.p50_ns, 400);
        assert_eq!(s.p95_ns, 900);
        assert_eq!(s.p99_ns, 900);
        assert_eq!(s.p999_ns, 900);
    }

    #[test]
    fn oversized_samples_saturate_into_last_bucket() {
        let h = LatencyHistogram::new(100, 1_000);
        h.record(50_000_000);
        let s = h.stats();
        assert_eq!(s.count, 1);
        assert_eq!(s.max_ns, 50_000_000);
        let last_lower = (h.num_buckets() as u64 - 1) * h.bucket_size_ns();
        assert_eq!(s.p50_ns, last_lower);
        assert_eq!(s.p999_ns, last_lower);
    }

    #[test]
    fn record_is_commutative() {
        let samples = [900u64, 0, 450, 450, 120, 999, 30, 770, 5, 5];
        let a = LatencyHistogram::new(50, 1_000);
        let b = LatencyHistogram::new(50, 1_000);
        for v in samples {
            a.record(v);
        }
        for v in samples.iter().rev() {
            b.record(*v);
        }
        assert_eq!(a.stats(), b.stats());
        let (mut ea, mut eb) = (Vec::new(), Vec::new());
        a.export(&mut ea);
        b.export(&mut eb);
        assert_eq!(ea, eb);
    }

    #[test]
    fn reset_clears_everything() {
        let h = LatencyHistogram::new(100, 1_000);
        h.record(123);
        h.record(456);
        h.reset();
        assert_eq!(h.stats(), LatencyStats::default());
        let mut buckets = Vec::new();
        h.export(&mut buckets);
        assert!(buckets.iter().all(|&c| c == 0));
    }

    #[test]
    fn concurrent_records_all_land() {
        let h = Arc::new(LatencyHistogram::new(10, 10_000));
        let threads: Vec<_> = (0..4)
            .map(|t| {
                let h = h.clone();
                thread::spawn(move || {
                    for i in 0..10_000u64 {
                        h.record(t * 1_000 + (i % 100));
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        let s = h.stats();
        assert_eq!(s.count, 40_000);
        assert_eq!(s.min_ns, 0);
        assert_eq!(s.max_ns, 3_099);
    }

    #[test]
    fn scoped_timer_records_one_sample() {
        let h = LatencyHistogram::new(100, 1_000_000);
        {
            let _t = ScopedTimer::new(&h);
        }
        assert_eq!(h.stats().count, 1);
    }
}
