use lru::LruCache;
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::trace;

/// EMA smoothing for observed speeds; newer samples dominate.
const SPEED_EMA_ALPHA: f64 = 0.3;

/// Transient retries older than this fall out of the rolling window.
const RETRY_RETENTION: Duration = Duration::from_secs(300);

pub const DEFAULT_MAX_HOSTS: usize = 64;

/// Counters accumulated since the last `take_window` call, consumed by the
/// adaptive concurrency evaluator.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WindowSnapshot {
    pub bytes: u64,
    pub errors: u64,
    pub successes: u64,
}

impl WindowSnapshot {
    pub fn attempts(&self) -> u64 {
        self.errors + self.successes
    }

    pub fn error_rate(&self) -> f64 {
        let attempts = self.attempts();
        if attempts == 0 {
            0.0
        } else {
            self.errors as f64 / attempts as f64
        }
    }
}

#[derive(Debug)]
struct HostStats {
    completed_count: u64,
    avg_speed_bps: f64,
    speed_samples: u64,
    transient_retries: VecDeque<Instant>,
    window: WindowSnapshot,
    last_update: Instant,
}

impl HostStats {
    fn new() -> Self {
        Self {
            completed_count: 0,
            avg_speed_bps: 0.0,
            speed_samples: 0,
            transient_retries: VecDeque::new(),
            window: WindowSnapshot::default(),
            last_update: Instant::now(),
        }
    }

    fn prune_retries(&mut self, now: Instant) {
        while let Some(front) = self.transient_retries.front() {
            if now.duration_since(*front) > RETRY_RETENTION {
                self.transient_retries.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Per-host rolling aggregation of observed speed, completions, and
/// transient retries. Feeds chunk sizing, write-buffer sizing, and
/// adaptive concurrency. Retention is LRU-bounded by host count.
pub struct HostMetrics {
    hosts: Mutex<LruCache<String, HostStats>>,
}

impl HostMetrics {
    pub fn new(max_hosts: usize) -> Self {
        let cap = NonZeroUsize::new(max_hosts.max(1)).unwrap();
        Self {
            hosts: Mutex::new(LruCache::new(cap)),
        }
    }

    fn with_host<R>(&self, host: &str, f: impl FnOnce(&mut HostStats) -> R) -> R {
        let mut hosts = self.hosts.lock().unwrap();
        if !hosts.contains(host) {
            hosts.put(host.to_string(), HostStats::new());
        }
        let stats = hosts.get_mut(host).unwrap();
        stats.last_update = Instant::now();
        f(stats)
    }

    /// Record a byte delta observed over `elapsed` of wall time; folds the
    /// implied instantaneous speed into the host's EMA.
    pub fn record_progress(&self, host: &str, delta_bytes: u64, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return;
        }
        let instantaneous = delta_bytes as f64 / secs;

        self.with_host(host, |stats| {
            if stats.speed_samples == 0 {
                stats.avg_speed_bps = instantaneous;
            } else {
                stats.avg_speed_bps = SPEED_EMA_ALPHA * instantaneous
                    + (1.0 - SPEED_EMA_ALPHA) * stats.avg_speed_bps;
            }
            stats.speed_samples += 1;
            stats.window.bytes += delta_bytes;
            trace!(
                "Host {} speed sample {:.0} B/s, EMA {:.0} B/s",
                host, instantaneous, stats.avg_speed_bps
            );
        });
    }

    pub fn record_completed(&self, host: &str) {
        self.with_host(host, |stats| {
            stats.completed_count += 1;
            stats.window.successes += 1;
        });
    }

    pub fn record_error(&self, host: &str) {
        self.with_host(host, |stats| stats.window.errors += 1);
    }

    /// Record a 429/503 or similar transient rejection.
    pub fn record_transient_retry(&self, host: &str) {
        self.with_host(host, |stats| {
            let now = Instant::now();
            stats.transient_retries.push_back(now);
            stats.prune_retries(now);
        });
    }

    /// EMA speed for the host, when at least one sample exists.
    pub fn avg_speed_bps(&self, host: &str) -> Option<u64> {
        let mut hosts = self.hosts.lock().unwrap();
        hosts.get(host).and_then(|stats| {
            if stats.speed_samples > 0 {
                Some(stats.avg_speed_bps as u64)
            } else {
                None
            }
        })
    }

    pub fn speed_samples(&self, host: &str) -> u64 {
        let mut hosts = self.hosts.lock().unwrap();
        hosts.get(host).map(|s| s.speed_samples).unwrap_or(0)
    }

    pub fn completed_count(&self, host: &str) -> u64 {
        let mut hosts = self.hosts.lock().unwrap();
        hosts.get(host).map(|s| s.completed_count).unwrap_or(0)
    }

    /// Transient retries observed within `window`.
    pub fn transient_retry_count(&self, host: &str, window: Duration) -> usize {
        let mut hosts = self.hosts.lock().unwrap();
        match hosts.get_mut(host) {
            Some(stats) => {
                let now = Instant::now();
                stats.prune_retries(now);
                stats
                    .transient_retries
                    .iter()
                    .filter(|t| now.duration_since(**t) <= window)
                    .count()
            }
            None => 0,
        }
    }

    /// Drain the accumulation window for the adaptive evaluator.
    pub fn take_window(&self, host: &str) -> WindowSnapshot {
        let mut hosts = self.hosts.lock().unwrap();
        match hosts.get_mut(host) {
            Some(stats) => std::mem::take(&mut stats.window),
            None => WindowSnapshot::default(),
        }
    }

    /// Hosts currently tracked, most recently used first.
    pub fn tracked_hosts(&self) -> Vec<String> {
        let hosts = self.hosts.lock().unwrap();
        hosts.iter().map(|(host, _)| host.clone()).collect()
    }

    pub fn host_count(&self) -> usize {
        self.hosts.lock().unwrap().len()
    }
}

impl Default for HostMetrics {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HOSTS)
    }
}

/// Hostname of a URL, lowercased. The unit of metrics and per-host
/// concurrency bookkeeping.
pub fn host_of(url: &str) -> Option<String> {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speed_ema() {
        let metrics = HostMetrics::default();
        assert_eq!(metrics.avg_speed_bps("a.example"), None);

        metrics.record_progress("a.example", 1000, Duration::from_secs(1));
        assert_eq!(metrics.avg_speed_bps("a.example"), Some(1000));

        // Second sample pulls the EMA toward the new value without jumping
        metrics.record_progress("a.example", 2000, Duration::from_secs(1));
        let ema = metrics.avg_speed_bps("a.example").unwrap();
        assert!(ema > 1000 && ema < 2000, "ema was {ema}");
        assert_eq!(metrics.speed_samples("a.example"), 2);
    }

    #[test]
    fn test_zero_elapsed_ignored() {
        let metrics = HostMetrics::default();
        metrics.record_progress("a.example", 1000, Duration::from_secs(0));
        assert_eq!(metrics.speed_samples("a.example"), 0);
    }

    #[test]
    fn test_transient_retry_window() {
        let metrics = HostMetrics::default();
        metrics.record_transient_retry("a.example");
        metrics.record_transient_retry("a.example");

        assert_eq!(
            metrics.transient_retry_count("a.example", Duration::from_secs(60)),
            2
        );
        assert_eq!(
            metrics.transient_retry_count("b.example", Duration::from_secs(60)),
            0
        );
    }

    #[test]
    fn test_window_snapshot_reset_on_read() {
        let metrics = HostMetrics::default();
        metrics.record_progress("a.example", 500, Duration::from_secs(1));
        metrics.record_completed("a.example");
        metrics.record_error("a.example");

        let window = metrics.take_window("a.example");
        assert_eq!(window.bytes, 500);
        assert_eq!(window.successes, 1);
        assert_eq!(window.errors, 1);
        assert_eq!(window.error_rate(), 0.5);

        assert_eq!(metrics.take_window("a.example"), WindowSnapshot::default());
    }

    #[test]
    fn test_lru_bound() {
        let metrics = HostMetrics::new(2);
        metrics.record_completed("a.example");
        metrics.record_completed("b.example");
        metrics.record_completed("c.example");

        assert_eq!(metrics.host_count(), 2);
        // Least recently touched host was evicted
        assert_eq!(metrics.completed_count("a.example"), 0);
        assert_eq!(metrics.completed_count("c.example"), 1);
    }

    #[test]
    fn test_host_of() {
        assert_eq!(
            host_of("https://Files.Example.com/path/file.bin"),
            Some("files.example.com".to_string())
        );
        assert_eq!(host_of("not a url"), None);
    }
}
