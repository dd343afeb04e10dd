// src/util.rs
use std::sync::atomic::{AtomicBool, Ordering};

/// Cooperative shutdown flag shared across loops and the signal handler.
pub struct ShutdownFlag(AtomicBool);

impl Default for ShutdownFlag {
    fn default() -> Self { Self(AtomicBool::new(false)) }
}

impl ShutdownFlag {
    #[inline]
    pub fn raise(&self) { self.0.store(true, Ordering::SeqCst); }
    #[inline]
    pub fn is_raised(&self) -> bool { self.0.load(Ordering::Relaxed) }
}

#[inline]
pub fn now_nanos() -> u64 {
    #[cfg(target_os = "linux")]
    {
        use nix::time::{clock_gettime, ClockId};
        if let Ok(ts) = clock_gettime(ClockId::CLOCK_MONOTONIC) {
            return (ts.tv_sec() as u64) * 1_000_000_000 + (ts.tv_nsec() as u64);
        }
    }
    // Fallback portable monotonic
    use std::time::Instant;
    static START: once_cell::sync::Lazy<Instant> = once_cell::sync::Lazy::new(Instant::now);
    START.elapsed().as_nanos() as u64
}

/// Which hot-path thread is being tuned; selects the `[cpu]` core entry.
#[derive(Clone, Copy)]
pub enum PipelineThread {
    Publisher,
    Feed,
}

/// Best-effort OS tuning for one pipeline thread: pin to its configured
/// core, raise it to SCHED_FIFO, and lock pages when asked. Refusals are
/// logged and the pipeline runs untuned.
pub fn apply_os_tuning(cfg: &crate::config::AppConfig, thread: PipelineThread) {
    let core = match thread {
        PipelineThread::Publisher => cfg.cpu.publisher_core,
        PipelineThread::Feed => cfg.cpu.feed_core,
    };
    if let Some(idx) = core {
        let found = core_affinity::get_core_ids()
            .into_iter()
            .flatten()
            .find(|c| c.id == idx);
        match found {
            Some(core_id) => {
                let _ = core_affinity::set_for_current(core_id);
            }
            None => log::warn!("cpu core {idx} not present, leaving thread unpinned"),
        }
    }

    #[cfg(target_os = "linux")]
    {
        if let Some(pri) = cfg.cpu.rt_priority {
            let param = libc::sched_param { sched_priority: pri };
            if unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) } != 0 {
                log::warn!("SCHED_FIFO priority {pri} refused (needs CAP_SYS_NICE)");
            }
        }
        if cfg.general.mlock_all {
            unsafe {
                let lim = libc::rlimit {
                    rlim_cur: libc::RLIM_INFINITY,
                    rlim_max: libc::RLIM_INFINITY,
                };
                let _ = libc::setrlimit(libc::RLIMIT_MEMLOCK, &lim);
                if libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) != 0 {
                    log::warn!("mlockall failed, pages may fault under load");
                }
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    if cfg.cpu.rt_priority.is_some() || cfg.general.mlock_all {
        log::warn!("cpu.rt_priority and general.mlock_all are Linux-only, ignoring");
    }
}

/// Logger setup shared by both binaries. JSON lines when requested, the
/// stock env_logger format otherwise.
pub fn init_logging(json: bool) {
    if json {
        let mut b = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        b.format(|buf, record| {
            use std::io::Write;
            let ts = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
            writeln!(buf, "{{\"ts\":\"{}\",\"level\":\"{}\",\"target\":\"{}\",\"msg\":\"{}\"}}",
                ts, record.level(), record.target(), record.args().to_string().replace('"', "'"))
        }).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }
}
