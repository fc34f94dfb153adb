use rand::Rng;
use std::time::Duration;

use crate::config::{NetworkConfig, RetryProfile, RetryProfilesConfig};
use crate::error::{EngineError, RetryCategory};

/// Map an error message (OS code mnemonics included, since transport errors
/// carry them in their rendered text) to a transient category. Rules apply
/// in a fixed order; the first match wins.
pub fn classify_message(message: &str) -> RetryCategory {
    let msg = message.to_ascii_lowercase();

    let matches_any = |needles: &[&str]| needles.iter().any(|needle| msg.contains(needle));

    if matches_any(&["etimedout", "timed out", "timeout"]) {
        return RetryCategory::Timeout;
    }
    if matches_any(&["network changed", "network-changed", "internet disconnected", "internet-disconnected"]) {
        return RetryCategory::NetworkChange;
    }
    if matches_any(&[
        "econnreset",
        "connection reset",
        "connection closed",
        "connection-closed",
        "http2 ping failed",
        "http2-ping-failed",
        "http2 protocol error",
        "http2-protocol-error",
    ]) {
        return RetryCategory::ConnectionReset;
    }
    if matches_any(&[
        "econnrefused",
        "connection refused",
        "enetunreach",
        "network unreachable",
        "ehostunreach",
        "host unreachable",
    ]) {
        return RetryCategory::ConnectionRefused;
    }
    if matches_any(&[
        "enotfound",
        "eai_again",
        "name not resolved",
        "name-not-resolved",
        "dns error",
        "failed to lookup",
    ]) {
        return RetryCategory::Dns;
    }
    if matches_any(&["epipe", "broken pipe"]) {
        return RetryCategory::PipeBroken;
    }
    if matches_any(&["http_429", "http_503", "too many requests", "service unavailable"]) {
        return RetryCategory::ServerOverload;
    }

    RetryCategory::Unknown
}

/// Classify a transport error from reqwest into a transient category.
pub fn classify_reqwest(err: &reqwest::Error) -> RetryCategory {
    if err.is_timeout() {
        return RetryCategory::Timeout;
    }
    if err.is_connect() {
        // Refused vs. reset vs. dns shows up in the rendered chain
        let rendered = format!("{err:?}");
        let category = classify_message(&rendered);
        if category != RetryCategory::Unknown {
            return category;
        }
        return RetryCategory::ConnectionRefused;
    }
    classify_message(&format!("{err:?}"))
}

/// Category for an already-typed engine error.
pub fn classify(err: &EngineError) -> RetryCategory {
    match err {
        EngineError::TransientNetwork { category, .. } => *category,
        EngineError::HttpStatus { code: 429, .. } | EngineError::HttpStatus { code: 503, .. } => {
            RetryCategory::ServerOverload
        }
        EngineError::Timeout(_) => RetryCategory::Timeout,
        _ => classify_message(&err.to_string()),
    }
}

/// Whether the error is worth another attempt at all.
pub fn is_transient(err: &EngineError) -> bool {
    err.is_retryable()
}

fn profile_for<'a>(
    profiles: &'a RetryProfilesConfig,
    category: RetryCategory,
) -> &'a RetryProfile {
    match category {
        RetryCategory::Timeout => &profiles.timeout,
        RetryCategory::ConnectionReset => &profiles.connection_reset,
        RetryCategory::ConnectionRefused => &profiles.connection_refused,
        RetryCategory::Dns => &profiles.dns,
        RetryCategory::NetworkChange => &profiles.network_change,
        RetryCategory::ServerOverload => &profiles.server_overload,
        RetryCategory::PipeBroken => &profiles.pipe_broken,
        RetryCategory::Unknown => &profiles.unknown,
    }
}

/// Compute the delay before retry number `retry_count` (0-based).
///
/// A server-supplied Retry-After on the error wins outright; otherwise the
/// category profile drives exponential growth with uniform jitter, clamped
/// at the profile maximum.
pub fn compute_delay(
    profiles: &RetryProfilesConfig,
    retry_count: u32,
    error: Option<&EngineError>,
) -> Duration {
    if let Some(ms) = error.and_then(|e| e.retry_after_ms()) {
        return Duration::from_millis(ms);
    }

    let category = error.map(classify).unwrap_or(RetryCategory::Unknown);
    let profile = profile_for(profiles, category);

    let grown =
        profile.base_delay_ms as f64 * profile.growth_factor.powi(retry_count.min(16) as i32);
    let jitter = if profile.jitter_factor > 0.0 {
        rand::thread_rng().gen_range(0.0..=profile.jitter_factor) * grown
    } else {
        0.0
    };

    let total = (grown + jitter).min(profile.max_delay_ms as f64);
    Duration::from_millis(total as u64)
}

/// Parse a Retry-After header: integer seconds or an HTTP-date. Negative or
/// unparsable values yield None; the result is clamped by the configured
/// absolute maximum.
pub fn parse_retry_after(value: &str, network: &NetworkConfig) -> Option<Duration> {
    let max = Duration::from_secs(network.max_retry_after_secs);

    if let Ok(secs) = value.trim().parse::<i64>() {
        if secs < 0 {
            return None;
        }
        return Some(Duration::from_secs(secs as u64).min(max));
    }

    if let Ok(date) = chrono::DateTime::parse_from_rfc2822(value.trim()) {
        let delta = date.signed_duration_since(chrono::Utc::now());
        let secs = delta.num_seconds();
        if secs < 0 {
            return None;
        }
        return Some(Duration::from_secs(secs as u64).min(max));
    }

    None
}
