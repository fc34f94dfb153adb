use crate::config::BufferConfig;
use crate::transfer::metrics::HostMetrics;

/// Pick the stream write high-water-mark for a chunk worker.
///
/// With adaptive sizing on and a measured host speed available, the
/// smallest band whose threshold covers the speed wins; the result is
/// clamped into the configured min/max. Without a measurement the static
/// default applies.
pub fn recommend(config: &BufferConfig, metrics: &HostMetrics, host: Option<&str>) -> usize {
    let speed = host.and_then(|h| metrics.avg_speed_bps(h));

    let bytes = match speed {
        Some(speed) if config.adaptive_write_buffers => config
            .write_buffer_bands
            .iter()
            .find(|band| speed < band.max_speed_bps)
            .or_else(|| config.write_buffer_bands.last())
            .map(|band| band.bytes as usize)
            .unwrap_or(config.write_buffer_bytes),
        _ => config.write_buffer_bytes,
    };

    bytes.clamp(config.min_write_buffer_bytes, config.max_write_buffer_bytes)
}
