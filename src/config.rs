// src/config.rs
use serde::Deserialize;
use std::{fs, path::Path};

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub general: General,
    #[serde(default)]
    pub publisher: PublisherCfg,
    #[serde(default)]
    pub subscriber: SubscriberCfg,
    #[serde(default)]
    pub histogram: HistogramCfg,
    pub metrics: Option<MetricsCfg>,
    #[serde(default)]
    pub cpu: Cpu,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct General {
    #[serde(default)]
    pub json_logs: bool,            // structured JSON logs to stdout
    #[serde(default)]
    pub mlock_all: bool,            // mlockall current+future (Linux; best-effort)
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublisherCfg {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_num_symbols")]
    pub num_symbols: u16,
    /// Target emissions per second; 0 disables paced emission entirely.
    #[serde(default = "default_rate")]
    pub rate: u32,
    /// Broadcast a HEARTBEAT after this much emission silence; 0 disables.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Per-peer kernel send buffer; 0 keeps the OS default.
    #[serde(default)]
    pub send_buffer_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriberCfg {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub validate_integrity: bool,
    #[serde(default = "default_true")]
    pub validate_sequence: bool,
    /// Connection is deemed dead after this long without any frame.
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_reader_threads")]
    pub reader_threads: usize,
    #[serde(default = "default_stats_interval_ms")]
    pub stats_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistogramCfg {
    #[serde(default = "default_bucket_size_ns")]
    pub bucket_size_ns: u64,
    #[serde(default = "default_max_latency_ns")]
    pub max_latency_ns: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsCfg {
    /// Bind address for the Prometheus exporter (e.g. "0.0.0.0:9100")
    pub bind: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Cpu {
    pub publisher_core: Option<usize>,
    pub feed_core: Option<usize>,
    #[serde(default)]
    pub rt_priority: Option<i32>,   // SCHED_FIFO priority if set (Linux)
}

fn default_port() -> u16 { 9876 }
fn default_num_symbols() -> u16 { 100 }
fn default_rate() -> u32 { 100_000 }
fn default_heartbeat_interval_ms() -> u64 { 1_000 }
fn default_host() -> String { "127.0.0.1".to_string() }
fn default_true() -> bool { true }
fn default_heartbeat_timeout_ms() -> u64 { 5_000 }
fn default_reader_threads() -> usize { 2 }
fn default_stats_interval_ms() -> u64 { 5_000 }
fn default_bucket_size_ns() -> u64 { 100 }
fn default_max_latency_ns() -> u64 { 1_000_000 }

impl Default for PublisherCfg {
    fn default() -> Self {
        Self {
            port: default_port(),
            num_symbols: default_num_symbols(),
            rate: default_rate(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            send_buffer_bytes: 0,
        }
    }
}

impl Default for SubscriberCfg {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            validate_integrity: true,
            validate_sequence: true,
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            reader_threads: default_reader_threads(),
            stats_interval_ms: default_stats_interval_ms(),
        }
    }
}

impl Default for HistogramCfg {
    fn default() -> Self {
        Self {
            bucket_size_ns: default_bucket_size_ns(),
            max_latency_ns: default_max_latency_ns(),
        }
    }
}

impl AppConfig {
    pub fn from_file(p: &Path) -> anyhow::Result<Self> {
        let s = fs::read_to_string(p)?;
        let cfg: AppConfig = toml::from_str(&s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load the given file if it exists, otherwise fall back to defaults.
    pub fn load_or_default(p: &Path) -> anyhow::Result<Self> {
        if p.exists() {
            Self::from_file(p)
        } else {
            log::info!("config {} not found, using defaults", p.display());
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.publisher.port == 0 {
            anyhow::bail!("publisher.port must be nonzero");
        }
        if self.publisher.num_symbols == 0 {
            anyhow::bail!("publisher.num_symbols must be at least 1");
        }
        if self.histogram.bucket_size_ns == 0 {
            anyhow::bail!("histogram.bucket_size_ns must be > 0");
        }
        if self.histogram.max_latency_ns < self.histogram.bucket_size_ns {
            anyhow::bail!("histogram.max_latency_ns must be >= bucket_size_ns");
        }
        if self.subscriber.heartbeat_timeout_ms == 0 {
            anyhow::bail!("subscriber.heartbeat_timeout_ms must be > 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_the_reference_setup() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.publisher.port, 9876);
        assert_eq!(cfg.publisher.num_symbols, 100);
        assert_eq!(cfg.publisher.rate, 100_000);
        assert_eq!(cfg.histogram.bucket_size_ns, 100);
        assert_eq!(cfg.histogram.max_latency_ns, 1_000_000);
        assert!(cfg.subscriber.validate_integrity);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn loads_partial_toml() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            "[publisher]\nport = 4000\nrate = 500\n\n[subscriber]\nvalidate_sequence = false\n"
        )
        .unwrap();
        let cfg = AppConfig::from_file(f.path()).unwrap();
        assert_eq!(cfg.publisher.port, 4000);
        assert_eq!(cfg.publisher.rate, 500);
        assert_eq!(cfg.publisher.num_symbols, 100);
        assert!(!cfg.subscriber.validate_sequence);
        assert!(cfg.subscriber.validate_integrity);
    }

    #[test]
    fn rejects_bad_histogram_config() {
        let cfg: AppConfig =
            toml::from_str("[histogram]\nbucket_size_ns = 0\n").unwrap();
        assert!(cfg.validate().is_err());

        let cfg: AppConfig =
            toml::from_str("[histogram]\nbucket_size_ns = 1000\nmax_latency_ns = 10\n").unwrap();
        assert!(cfg.validate().is_err());
    }
}
