//! Server statistics reported by the `stats` command.
//!
//! Running counters are plain atomics bumped by the dispatcher and the
//! listener. Everything else is sampled at query time.

use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug)]
pub struct Stats {
    started: Instant,
    curr_connections: AtomicU64,
    total_connections: AtomicU64,
    cmd_get: AtomicU64,
    cmd_set: AtomicU64,
    cmd_flush: AtomicU64,
    get_hits: AtomicU64,
    get_misses: AtomicU64,
    delete_hits: AtomicU64,
    delete_misses: AtomicU64,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            curr_connections: AtomicU64::new(0),
            total_connections: AtomicU64::new(0),
            cmd_get: AtomicU64::new(0),
            cmd_set: AtomicU64::new(0),
            cmd_flush: AtomicU64::new(0),
            get_hits: AtomicU64::new(0),
            get_misses: AtomicU64::new(0),
            delete_hits: AtomicU64::new(0),
            delete_misses: AtomicU64::new(0),
        }
    }

    pub fn connection_opened(&self) {
        self.curr_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.curr_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// One `get` line, counted per requested key.
    pub fn record_get(&self, hits: u64, misses: u64) {
        self.cmd_get.fetch_add(hits + misses, Ordering::Relaxed);
        self.get_hits.fetch_add(hits, Ordering::Relaxed);
        self.get_misses.fetch_add(misses, Ordering::Relaxed);
    }

    pub fn record_set(&self) {
        self.cmd_set.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self, hit: bool) {
        if hit {
            self.delete_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.delete_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_flush(&self) {
        self.cmd_flush.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time view, in the order the `stats` command prints it.
    pub fn snapshot(&self, curr_items: usize) -> Vec<(&'static str, String)> {
        let (user, system) = rusage();
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed).to_string();

        vec![
            ("pid", std::process::id().to_string()),
            ("uptime", self.started.elapsed().as_secs().to_string()),
            ("time", chrono::Utc::now().timestamp().to_string()),
            ("version", env!("CARGO_PKG_VERSION").to_string()),
            ("rusage_user", user),
            ("rusage_system", system),
            ("curr_connections", load(&self.curr_connections)),
            ("total_connections", load(&self.total_connections)),
            ("cmd_get", load(&self.cmd_get)),
            ("cmd_set", load(&self.cmd_set)),
            ("cmd_flush", load(&self.cmd_flush)),
            ("get_hits", load(&self.get_hits)),
            ("get_misses", load(&self.get_misses)),
            ("delete_hits", load(&self.delete_hits)),
            ("delete_misses", load(&self.delete_misses)),
            ("curr_items", curr_items.to_string()),
        ]
    }
}

/// User and system CPU time of this process as `seconds.micros`.
fn rusage() -> (String, String) {
    let mut usage = MaybeUninit::<libc::rusage>::uninit();
    // SAFETY: the pointer is valid for writes of one rusage struct.
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, usage.as_mut_ptr()) };
    if rc != 0 {
        return ("0.000000".to_string(), "0.000000".to_string());
    }
    // SAFETY: getrusage fills the whole struct when it returns 0.
    let usage = unsafe { usage.assume_init() };

    let fmt = |tv: libc::timeval| format!("{}.{:06}", tv.tv_sec, tv.tv_usec);
    (fmt(usage.ru_utime), fmt(usage.ru_stime))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value<'a>(snapshot: &'a [(&'static str, String)], name: &str) -> &'a str {
        snapshot
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
            .unwrap()
    }

    #[test]
    fn test_counters() {
        let stats = Stats::new();
        stats.connection_opened();
        stats.connection_opened();
        stats.connection_closed();
        stats.record_get(2, 1);
        stats.record_set();
        stats.record_delete(true);
        stats.record_delete(false);
        stats.record_delete(false);

        let snapshot = stats.snapshot(7);
        assert_eq!(value(&snapshot, "curr_connections"), "1");
        assert_eq!(value(&snapshot, "total_connections"), "2");
        assert_eq!(value(&snapshot, "cmd_get"), "3");
        assert_eq!(value(&snapshot, "get_hits"), "2");
        assert_eq!(value(&snapshot, "get_misses"), "1");
        assert_eq!(value(&snapshot, "cmd_set"), "1");
        assert_eq!(value(&snapshot, "delete_hits"), "1");
        assert_eq!(value(&snapshot, "delete_misses"), "2");
        assert_eq!(value(&snapshot, "curr_items"), "7");
    }

    #[test]
    fn test_sampled_values() {
        let snapshot = Stats::new().snapshot(0);
        assert_eq!(snapshot[0].0, "pid");
        assert_eq!(value(&snapshot, "pid"), std::process::id().to_string());
        assert!(value(&snapshot, "rusage_user").contains('.'));
        assert!(value(&snapshot, "time").parse::<i64>().unwrap() > 0);
    }
}
