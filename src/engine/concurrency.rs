use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AdaptiveConcurrencyConfig;
use crate::transfer::metrics::HostMetrics;

#[derive(Debug)]
struct Inner {
    global_limit: usize,
    per_host_limit: usize,
    global_active: usize,
    per_host: HashMap<String, usize>,
    /// Host of every slot a download currently holds
    per_download: HashMap<i64, Vec<String>>,
}

/// Global and per-host chunk slot accounting. Every chunk worker holds
/// exactly one slot for its lifetime; the engine's transition hook releases
/// whatever a download still holds when it leaves an active state.
pub struct ConcurrencyController {
    inner: Mutex<Inner>,
}

impl ConcurrencyController {
    pub fn new(global_limit: usize, per_host_limit: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                global_limit: global_limit.max(1),
                per_host_limit: per_host_limit.max(1),
                global_active: 0,
                per_host: HashMap::new(),
                per_download: HashMap::new(),
            }),
        }
    }

    /// Try to take one slot for a chunk of `download_id` against `host`.
    pub fn acquire_chunk_slot(&self, download_id: i64, host: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();

        if inner.global_active >= inner.global_limit {
            return false;
        }
        let host_active = inner.per_host.get(host).copied().unwrap_or(0);
        if host_active >= inner.per_host_limit {
            return false;
        }

        inner.global_active += 1;
        *inner.per_host.entry(host.to_string()).or_insert(0) += 1;
        inner
            .per_download
            .entry(download_id)
            .or_default()
            .push(host.to_string());
        true
    }

    pub fn release_chunk_slot(&self, download_id: i64, host: &str) {
        let mut inner = self.inner.lock().unwrap();
        release_one(&mut inner, download_id, host);
    }

    /// Release every slot a download still holds. Transition-hook path for
    /// exits from active states.
    pub fn release_all(&self, download_id: i64) {
        let mut inner = self.inner.lock().unwrap();
        let hosts = inner.per_download.remove(&download_id).unwrap_or_default();
        let count = hosts.len();
        for host in hosts {
            inner.global_active = inner.global_active.saturating_sub(1);
            if let Some(active) = inner.per_host.get_mut(&host) {
                *active = active.saturating_sub(1);
                if *active == 0 {
                    inner.per_host.remove(&host);
                }
            }
        }
        if count > 0 {
            debug!("Released {} slot(s) held by download {}", count, download_id);
        }
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().unwrap().global_active
    }

    pub fn active_for_host(&self, host: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .per_host
            .get(host)
            .copied()
            .unwrap_or(0)
    }

    pub fn per_host_limit(&self) -> usize {
        self.inner.lock().unwrap().per_host_limit
    }

    pub fn global_limit(&self) -> usize {
        self.inner.lock().unwrap().global_limit
    }

    /// Override both limits (turbo mode toggling).
    pub fn set_limits(&self, global: usize, per_host: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.global_limit = global.max(1);
        inner.per_host_limit = per_host.max(1);
    }

    fn adjust_per_host_limit(&self, delta: i64, max: usize) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let current = inner.per_host_limit as i64;
        let adjusted = (current + delta).clamp(1, max as i64) as usize;
        inner.per_host_limit = adjusted;
        adjusted
    }
}

fn release_one(inner: &mut Inner, download_id: i64, host: &str) {
    let held = inner.per_download.entry(download_id).or_default();
    if let Some(pos) = held.iter().position(|h| h == host) {
        held.swap_remove(pos);
    } else {
        warn!(
            "Release without matching acquire: download {} host {}",
            download_id, host
        );
        return;
    }
    if held.is_empty() {
        inner.per_download.remove(&download_id);
    }

    inner.global_active = inner.global_active.saturating_sub(1);
    if let Some(active) = inner.per_host.get_mut(host) {
        *active = active.saturating_sub(1);
        if *active == 0 {
            inner.per_host.remove(host);
        }
    }
}

/// Periodically adjust the per-host limit from observed throughput and
/// error rates. Scale up on clean fast windows, scale down on error spikes,
/// transient-retry bursts, or throughput collapse; changes respect a
/// cooldown and never drop the limit below one.
pub fn spawn_adaptive_evaluator(
    controller: Arc<ConcurrencyController>,
    metrics: Arc<HostMetrics>,
    config: AdaptiveConcurrencyConfig,
    max_per_host: usize,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(config.evaluation_interval_ms.max(100)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut prior_throughput: Option<f64> = None;
        let mut last_change: Option<Instant> = None;
        let retry_window = Duration::from_millis(config.evaluation_interval_ms.max(100));

        loop {
            ticker.tick().await;

            let mut window = crate::transfer::metrics::WindowSnapshot::default();
            let mut transient_retries = 0u64;
            for host in metrics.tracked_hosts() {
                let snapshot = metrics.take_window(&host);
                window.bytes += snapshot.bytes;
                window.errors += snapshot.errors;
                window.successes += snapshot.successes;
                transient_retries += metrics.transient_retry_count(&host, retry_window) as u64;
            }

            let interval_secs = config.evaluation_interval_ms as f64 / 1000.0;
            let throughput = window.bytes as f64 / interval_secs.max(0.001);
            let error_rate = window.error_rate();

            let in_cooldown = last_change
                .map(|t| t.elapsed() < Duration::from_millis(config.cooldown_ms))
                .unwrap_or(false);
            if in_cooldown {
                prior_throughput = Some(throughput);
                continue;
            }

            let throughput_collapsed = prior_throughput
                .map(|prior| {
                    prior > 0.0 && throughput < prior * (1.0 - config.throughput_drop_threshold)
                })
                .unwrap_or(false);

            if error_rate >= config.scale_down_error_rate_min
                || transient_retries >= config.scale_down_transient_retry_threshold
                || throughput_collapsed
            {
                let new_limit = controller.adjust_per_host_limit(-1, max_per_host);
                info!(
                    "Adaptive concurrency: scaling down to {} per host \
                     (error rate {:.2}, retries {}, throughput {:.0} B/s)",
                    new_limit, error_rate, transient_retries, throughput
                );
                last_change = Some(Instant::now());
            } else if window.attempts() >= config.min_samples
                && error_rate <= config.scale_up_error_rate_max
                && throughput >= config.scale_up_min_throughput_bps as f64
            {
                let new_limit = controller.adjust_per_host_limit(1, max_per_host);
                info!(
                    "Adaptive concurrency: scaling up to {} per host \
                     (error rate {:.2}, throughput {:.0} B/s)",
                    new_limit, error_rate, throughput
                );
                last_change = Some(Instant::now());
            }

            prior_throughput = Some(throughput);
        }
    })
}
