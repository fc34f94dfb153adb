use chrono::NaiveDateTime;

use crate::config::SchedulerConfig;
use crate::db::models::DownloadRow;

const LOWEST_PRIORITY: i64 = 1;

/// Score a queued download. Higher wins; ties break on queue position.
///
/// score = priority + agingBonus − retryPenalty + sjfBias. In turbo mode
/// aging and SJF are ignored and ordering degenerates to priority + FIFO.
pub fn score(
    config: &SchedulerConfig,
    turbo: bool,
    row: &DownloadRow,
    now: NaiveDateTime,
    sjf_band: Option<(u64, u64)>,
) -> f64 {
    let mut score = row.priority as f64;

    if !turbo && config.aging_enabled {
        let waited_ms = (now - row.created_at).num_milliseconds().max(0) as u64;
        let mut bonus = ((waited_ms / config.aging_interval_ms.max(1)) as f64)
            .min(config.max_aging_bonus);
        if row.priority == LOWEST_PRIORITY {
            bonus = (bonus * config.low_priority_aging_multiplier).min(config.max_aging_bonus);
        }
        score += bonus;
    }

    if config.retry_penalty_enabled {
        let over = (row.retry_count - config.free_retries as i64).max(0) as f64;
        score -= (over * config.retry_penalty_per_retry).min(config.max_retry_penalty);
    }

    if !turbo && config.sjf_enabled {
        if let Some((band_min, band_max)) = sjf_band {
            if band_max > band_min {
                let clipped = (row.total_bytes as u64).clamp(band_min, band_max);
                let inverse =
                    (band_max - clipped) as f64 / (band_max - band_min) as f64;
                score += config.sjf_weight * inverse;
            }
        }
    }

    score
}

/// The size band shortest-job-first bias operates in: from the smallest
/// queued size up to the tolerance above it. Everything past the band
/// ceiling counts the same.
fn sjf_band(config: &SchedulerConfig, candidates: &[DownloadRow]) -> Option<(u64, u64)> {
    if !config.sjf_enabled || candidates.len() < 2 {
        return None;
    }
    let min = candidates.iter().map(|r| r.total_bytes as u64).min()?;
    let span = (min as f64 * config.sjf_tolerance_percent / 100.0) as u64;
    Some((min, min + span.max(1)))
}

/// Pick the next download to start from the QUEUED candidates.
pub fn pick_next(
    config: &SchedulerConfig,
    turbo: bool,
    candidates: &[DownloadRow],
    now: NaiveDateTime,
) -> Option<i64> {
    let band = if turbo { None } else { sjf_band(config, candidates) };

    candidates
        .iter()
        .map(|row| (row, score(config, turbo, row, now, band)))
        .max_by(|(a, sa), (b, sb)| {
            sa.partial_cmp(sb)
                .unwrap_or(std::cmp::Ordering::Equal)
                // Lower queue position wins a tie, so compare reversed
                .then_with(|| b.queue_position.cmp(&a.queue_position))
        })
        .map(|(row, _)| row.id)
}
