use tracing::debug;

use crate::config::ChunkingConfig;

/// Plan the byte ranges for a download of `total_bytes`.
///
/// Ranges are inclusive `(start, end)` pairs, ordered, and tile
/// `[0, total_bytes)` exactly. Policy, in order: small files get a single
/// range; with enough measured speed samples the adaptive bands pick the
/// target size; otherwise the static size bands apply.
pub fn plan_chunks(
    config: &ChunkingConfig,
    total_bytes: u64,
    measured_speed_bps: Option<u64>,
    speed_samples: u64,
) -> Vec<(u64, u64)> {
    if total_bytes == 0 {
        return Vec::new();
    }

    if total_bytes < config.size_threshold_bytes {
        return vec![(0, total_bytes - 1)];
    }

    let count = if let Some(speed) = measured_speed_bps.filter(|_| {
        config.adaptive.enabled && speed_samples >= config.adaptive.min_samples
    }) {
        adaptive_count(config, total_bytes, speed)
    } else {
        static_count(config, total_bytes)
    };

    ranges_for_count(total_bytes, count)
}

fn adaptive_count(config: &ChunkingConfig, total_bytes: u64, speed_bps: u64) -> usize {
    let adaptive = &config.adaptive;

    let target = adaptive
        .bands
        .iter()
        .find(|band| speed_bps < band.max_speed_bps)
        .or_else(|| adaptive.bands.last())
        .map(|band| band.bytes)
        .unwrap_or(adaptive.max_chunk_bytes);

    let target = target.clamp(adaptive.min_chunk_bytes, adaptive.max_chunk_bytes);
    let count = total_bytes.div_ceil(target) as usize;
    let count = count.clamp(config.min_chunks, config.max_chunks);

    debug!(
        "Adaptive sizing: {} bytes at {} B/s -> target {} bytes, {} chunks",
        total_bytes, speed_bps, target, count
    );
    count
}

fn static_count(config: &ChunkingConfig, total_bytes: u64) -> usize {
    let band = if total_bytes >= config.large_band_from_bytes {
        &config.large_band
    } else {
        &config.medium_band
    };

    let count = total_bytes.div_ceil(band.target_chunk_bytes) as usize;
    count
        .clamp(band.min_chunks, band.max_chunks)
        .min(config.max_chunks)
}

fn ranges_for_count(total_bytes: u64, count: usize) -> Vec<(u64, u64)> {
    // Never plan more chunks than bytes
    let count = (count.max(1) as u64).min(total_bytes);
    let chunk_size = total_bytes.div_ceil(count);

    let mut ranges = Vec::with_capacity(count as usize);
    let mut start = 0u64;
    while start < total_bytes {
        let end = (start + chunk_size - 1).min(total_bytes - 1);
        ranges.push((start, end));
        start = end + 1;
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    fn assert_tiles(ranges: &[(u64, u64)], total: u64) {
        assert!(!ranges.is_empty());
        assert_eq!(ranges[0].0, 0);
        assert_eq!(ranges.last().unwrap().1, total - 1);
        for pair in ranges.windows(2) {
            assert_eq!(pair[1].0, pair[0].1 + 1, "ranges must be contiguous");
        }
        let sum: u64 = ranges.iter().map(|(s, e)| e - s + 1).sum();
        assert_eq!(sum, total);
    }

    #[test]
    fn test_small_file_single_range() {
        let config = ChunkingConfig::default();
        let ranges = plan_chunks(&config, MIB, None, 0);
        assert_eq!(ranges, vec![(0, MIB - 1)]);
    }

    #[test]
    fn test_at_threshold_splits() {
        let config = ChunkingConfig::default();
        let ranges = plan_chunks(&config, config.size_threshold_bytes, None, 0);
        assert!(ranges.len() >= config.min_chunks);
        assert_tiles(&ranges, config.size_threshold_bytes);
    }

    #[test]
    fn test_static_medium_band() {
        let config = ChunkingConfig::default();
        // 128 MiB with the 8 MiB medium target wants 16 chunks, clamped to 8
        let total = 128 * MIB;
        let ranges = plan_chunks(&config, total, None, 0);
        assert_eq!(ranges.len(), 8);
        assert_tiles(&ranges, total);
    }

    #[test]
    fn test_static_large_band() {
        let config = ChunkingConfig::default();
        let total = 1024 * MIB;
        let ranges = plan_chunks(&config, total, None, 0);
        // 1 GiB / 32 MiB = 32, clamped to the large band max of 16
        assert_eq!(ranges.len(), 16);
        assert_tiles(&ranges, total);
    }

    #[test]
    fn test_adaptive_slow_host_small_chunks() {
        let config = ChunkingConfig::default();
        let total = 128 * MIB;

        // 256 KB/s falls in the 4 MiB band: 32 chunks, clamped to max 16
        let slow = plan_chunks(&config, total, Some(256 * 1024), 5);
        assert_eq!(slow.len(), config.max_chunks);
        assert_tiles(&slow, total);

        // 20 MB/s falls in the 32 MiB band: 4 chunks
        let fast = plan_chunks(&config, total, Some(20 * MIB), 5);
        assert_eq!(fast.len(), 4);
        assert_tiles(&fast, total);
    }

    #[test]
    fn test_adaptive_requires_samples() {
        let config = ChunkingConfig::default();
        let total = 128 * MIB;

        // One sample is not enough; the static band applies instead
        let ranges = plan_chunks(&config, total, Some(20 * MIB), 1);
        assert_eq!(ranges.len(), 8);
    }

    #[test]
    fn test_uneven_tail() {
        let config = ChunkingConfig::default();
        let total = 128 * MIB + 12_345;
        let ranges = plan_chunks(&config, total, None, 0);
        assert_tiles(&ranges, total);
    }

    #[test]
    fn test_zero_bytes() {
        let config = ChunkingConfig::default();
        assert!(plan_chunks(&config, 0, None, 0).is_empty());
    }
}
