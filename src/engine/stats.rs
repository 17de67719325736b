// Live statistics: network throughput, fetch counts and cache effectiveness.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

/// Byte counter reading at the previous snapshot; turns totals into a rate.
struct RateWindow {
    at: Instant,
    seen: u64,
}

impl RateWindow {
    fn new() -> Self {
        Self {
            at: Instant::now(),
            seen: 0,
        }
    }

    /// Bytes per second since the last call. Reports 0 for windows under 100ms.
    fn advance(&mut self, total: u64) -> u64 {
        let now = Instant::now();
        let secs = now.duration_since(self.at).as_secs_f64();
        let rate = if secs > 0.1 {
            (total.saturating_sub(self.seen) as f64 / secs) as u64
        } else {
            0
        };
        self.at = now;
        self.seen = total;
        rate
    }
}

#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub download_bps: u64,
    pub downloaded_bytes: u64,
    pub fetches_started: u64,
    pub active_workers: u32,
    pub active_transfers: usize,
    pub complete_hits: u64,
    pub partial_hits: u64,
    pub misses: u64,
}

impl StatsSnapshot {
    /// Fraction of cache lookups that found any usable bytes.
    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.complete_hits + self.partial_hits;
        let lookups = hits + self.misses;
        if lookups > 0 {
            hits as f64 / lookups as f64
        } else {
            0.0
        }
    }
}

pub struct StatsCollector {
    download_bytes_total: AtomicU64,
    fetches_started: AtomicU64,
    active_workers: AtomicU32,
    complete_hits: AtomicU64,
    partial_hits: AtomicU64,
    misses: AtomicU64,
    window: Mutex<RateWindow>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            download_bytes_total: AtomicU64::new(0),
            fetches_started: AtomicU64::new(0),
            active_workers: AtomicU32::new(0),
            complete_hits: AtomicU64::new(0),
            partial_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            window: Mutex::new(RateWindow::new()),
        }
    }

    pub fn record_downloaded(&self, bytes: u64) {
        self.download_bytes_total.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_fetch_started(&self) {
        self.fetches_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_complete_hit(&self) {
        self.complete_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_partial_hit(&self) {
        self.partial_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_workers(&self) {
        self.active_workers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement_workers(&self) {
        self.active_workers.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, active_transfers: usize) -> StatsSnapshot {
        let downloaded = self.total_downloaded();
        let download_bps = self.window.lock().advance(downloaded);

        StatsSnapshot {
            download_bps,
            downloaded_bytes: downloaded,
            fetches_started: self.fetches_started.load(Ordering::Relaxed),
            active_workers: self.active_workers.load(Ordering::Relaxed),
            active_transfers,
            complete_hits: self.complete_hits.load(Ordering::Relaxed),
            partial_hits: self.partial_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    pub fn total_downloaded(&self) -> u64 {
        self.download_bytes_total.load(Ordering::Relaxed)
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_hit_rate() {
        let stats = StatsCollector::new();
        stats.record_downloaded(1000);
        stats.record_downloaded(500);
        assert_eq!(stats.total_downloaded(), 1500);

        stats.record_fetch_started();
        stats.record_complete_hit();
        stats.record_partial_hit();
        stats.record_miss();
        stats.record_miss();

        stats.increment_workers();
        stats.increment_workers();
        stats.decrement_workers();

        let snap = stats.snapshot(2);
        assert_eq!(snap.active_transfers, 2);
        assert_eq!(snap.active_workers, 1);
        assert_eq!(snap.fetches_started, 1);
        assert_eq!(snap.downloaded_bytes, 1500);
        assert!((snap.cache_hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_rate_window_ignores_short_intervals() {
        let mut window = RateWindow::new();
        assert_eq!(window.advance(10_000), 0);
        assert_eq!(window.seen, 10_000);
    }
}
