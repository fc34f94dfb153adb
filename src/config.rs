use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const MIB: u64 = 1024 * 1024;

/// Network-level timeouts and Retry-After handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    /// TCP connect timeout in seconds
    pub connect_timeout_secs: u64,

    /// Budget for response headers to arrive after a request is sent
    pub response_timeout_secs: u64,

    /// A chunk with no byte progress for this long is aborted
    pub chunk_idle_timeout_secs: u64,

    /// Floor applied to 429/503 batch delays when the server's Retry-After
    /// is missing or smaller
    pub default_retry_after_secs: u64,

    /// Hard cap on any parsed Retry-After value
    pub max_retry_after_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            response_timeout_secs: 30,
            chunk_idle_timeout_secs: 60,
            default_retry_after_secs: 30,
            max_retry_after_secs: 300,
        }
    }
}

/// A speed band: applies while measured speed is below `max_speed_bps`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpeedBand {
    pub max_speed_bps: u64,
    pub bytes: u64,
}

/// Static sizing band for a file-size range.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StaticBand {
    pub target_chunk_bytes: u64,
    pub min_chunks: usize,
    pub max_chunks: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdaptiveSizerConfig {
    pub enabled: bool,

    /// Minimum host speed samples before adaptive sizing kicks in
    pub min_samples: u64,

    /// Speed bands mapping measured host speed to a target chunk size,
    /// ordered by ascending `max_speed_bps`; the last band is the fallback
    pub bands: Vec<SpeedBand>,

    pub min_chunk_bytes: u64,
    pub max_chunk_bytes: u64,
}

impl Default for AdaptiveSizerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_samples: 2,
            bands: vec![
                SpeedBand {
                    max_speed_bps: 512 * 1024,
                    bytes: 4 * MIB,
                },
                SpeedBand {
                    max_speed_bps: 2 * MIB,
                    bytes: 8 * MIB,
                },
                SpeedBand {
                    max_speed_bps: 10 * MIB,
                    bytes: 16 * MIB,
                },
                SpeedBand {
                    max_speed_bps: 50 * MIB,
                    bytes: 32 * MIB,
                },
                SpeedBand {
                    max_speed_bps: u64::MAX,
                    bytes: 64 * MIB,
                },
            ],
            min_chunk_bytes: 2 * MIB,
            max_chunk_bytes: 128 * MIB,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChunkingConfig {
    /// Files below this size are fetched as a single range
    pub size_threshold_bytes: u64,

    pub min_chunks: usize,
    pub max_chunks: usize,

    /// Static band for files between the threshold and `large_band_from_bytes`
    pub medium_band: StaticBand,

    /// Static band for files at or above `large_band_from_bytes`
    pub large_band: StaticBand,
    pub large_band_from_bytes: u64,

    pub adaptive: AdaptiveSizerConfig,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            size_threshold_bytes: 50 * MIB,
            min_chunks: 2,
            max_chunks: 16,
            medium_band: StaticBand {
                target_chunk_bytes: 8 * MIB,
                min_chunks: 4,
                max_chunks: 8,
            },
            large_band: StaticBand {
                target_chunk_bytes: 32 * MIB,
                min_chunks: 8,
                max_chunks: 16,
            },
            large_band_from_bytes: 500 * MIB,
            adaptive: AdaptiveSizerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BufferPoolConfig {
    pub buffer_bytes: usize,
    pub max_pooled: usize,
    pub pre_allocate: bool,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            buffer_bytes: 4 * MIB as usize,
            max_pooled: 8,
            pre_allocate: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BufferConfig {
    /// Default stream write high-water-mark
    pub write_buffer_bytes: usize,

    /// Pick the write buffer from `write_buffer_bands` by host speed
    pub adaptive_write_buffers: bool,

    /// Ordered by ascending `max_speed_bps`; `bytes` is the buffer size
    pub write_buffer_bands: Vec<SpeedBand>,

    pub min_write_buffer_bytes: usize,
    pub max_write_buffer_bytes: usize,

    pub pool: BufferPoolConfig,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            write_buffer_bytes: 256 * 1024,
            adaptive_write_buffers: true,
            write_buffer_bands: vec![
                SpeedBand {
                    max_speed_bps: 512 * 1024,
                    bytes: 64 * 1024,
                },
                SpeedBand {
                    max_speed_bps: 2 * MIB,
                    bytes: 128 * 1024,
                },
                SpeedBand {
                    max_speed_bps: 10 * MIB,
                    bytes: 256 * 1024,
                },
                SpeedBand {
                    max_speed_bps: u64::MAX,
                    bytes: MIB,
                },
            ],
            min_write_buffer_bytes: 64 * 1024,
            max_write_buffer_bytes: 4 * MIB as usize,
            pool: BufferPoolConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdaptiveConcurrencyConfig {
    pub enabled: bool,
    pub evaluation_interval_ms: u64,
    pub min_samples: u64,
    pub scale_up_error_rate_max: f64,
    pub scale_up_min_throughput_bps: u64,
    pub scale_down_error_rate_min: f64,
    pub scale_down_transient_retry_threshold: u64,
    /// Fractional throughput drop vs. the prior window that triggers a
    /// scale-down (0.5 = half)
    pub throughput_drop_threshold: f64,
    pub cooldown_ms: u64,
}

impl Default for AdaptiveConcurrencyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            evaluation_interval_ms: 10_000,
            min_samples: 3,
            scale_up_error_rate_max: 0.02,
            scale_up_min_throughput_bps: MIB,
            scale_down_error_rate_min: 0.15,
            scale_down_transient_retry_threshold: 5,
            throughput_drop_threshold: 0.5,
            cooldown_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DownloadsConfig {
    /// Global concurrent chunk limit across all downloads
    pub max_concurrent: usize,

    /// Concurrent chunk limit per remote host
    pub max_concurrent_per_host: usize,

    /// Maximum queue size; `add` refuses beyond this unless skip_queue_limit
    pub max_queue_size: usize,

    /// Coalescing delay for progress-only database writes
    pub progress_batch_delay_ms: u64,

    /// Per-chunk retry budget before the download fails
    pub max_chunk_retries: u32,

    /// Overall budget for a single chunk operation
    pub chunk_operation_timeout_minutes: u64,

    /// Skip the final hash verification pass
    pub skip_verification: bool,

    /// Force every download through the single-range path
    pub disable_chunked_downloads: bool,

    /// One download, one connection: global=1, per-host=1, plain FIFO
    pub turbo_download: bool,

    pub adaptive_concurrency: AdaptiveConcurrencyConfig,
}

impl Default for DownloadsConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 6,
            max_concurrent_per_host: 4,
            max_queue_size: 500,
            progress_batch_delay_ms: 100,
            max_chunk_retries: 5,
            chunk_operation_timeout_minutes: 5,
            skip_verification: false,
            disable_chunked_downloads: false,
            turbo_download: false,
            adaptive_concurrency: AdaptiveConcurrencyConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    pub aging_enabled: bool,
    pub aging_interval_ms: u64,
    pub max_aging_bonus: f64,
    pub low_priority_aging_multiplier: f64,
    pub sjf_enabled: bool,
    pub sjf_weight: f64,
    pub sjf_tolerance_percent: f64,
    pub retry_penalty_enabled: bool,
    pub retry_penalty_per_retry: f64,
    pub max_retry_penalty: f64,
    pub free_retries: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            aging_enabled: true,
            aging_interval_ms: 60_000,
            max_aging_bonus: 3.0,
            low_priority_aging_multiplier: 1.5,
            sjf_enabled: true,
            sjf_weight: 0.5,
            sjf_tolerance_percent: 20.0,
            retry_penalty_enabled: true,
            retry_penalty_per_retry: 0.5,
            max_retry_penalty: 2.0,
            free_retries: 1,
        }
    }
}

/// Backoff profile for one transient error category.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryProfile {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub growth_factor: f64,
    pub jitter_factor: f64,
}

impl Default for RetryProfile {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            growth_factor: 2.0,
            jitter_factor: 0.3,
        }
    }
}

impl RetryProfile {
    fn new(base_delay_ms: u64, max_delay_ms: u64, growth_factor: f64, jitter_factor: f64) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
            growth_factor,
            jitter_factor,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryProfilesConfig {
    pub timeout: RetryProfile,
    pub connection_reset: RetryProfile,
    pub connection_refused: RetryProfile,
    pub dns: RetryProfile,
    pub network_change: RetryProfile,
    pub server_overload: RetryProfile,
    pub pipe_broken: RetryProfile,
    pub unknown: RetryProfile,
}

impl Default for RetryProfilesConfig {
    fn default() -> Self {
        Self {
            timeout: RetryProfile::new(5000, 20_000, 1.5, 0.2),
            connection_reset: RetryProfile::new(10_000, 60_000, 2.0, 0.3),
            connection_refused: RetryProfile::new(15_000, 120_000, 2.5, 0.3),
            dns: RetryProfile::new(10_000, 60_000, 2.0, 0.2),
            network_change: RetryProfile::new(3000, 15_000, 1.5, 0.2),
            server_overload: RetryProfile::new(30_000, 300_000, 2.0, 0.1),
            pipe_broken: RetryProfile::new(5000, 30_000, 2.0, 0.3),
            unknown: RetryProfile::new(1000, 30_000, 2.0, 0.3),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    /// Base directory for engine data; platform default when unset
    pub user_data_dir: Option<PathBuf>,

    /// Explicit state-db location; `<user_data>/config/downloads-state.db`
    /// when unset
    pub state_db_path: Option<PathBuf>,

    /// Base for per-download chunk temp directories; `<user_data>/tmp`
    /// when unset
    pub temp_dir: Option<PathBuf>,

    /// Hosts downloads may be fetched from; empty list allows any host
    pub allowed_hosts: Vec<String>,
}

/// Complete engine configuration. Every recognized option is enumerated;
/// unknown keys are rejected at load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub network: NetworkConfig,
    pub chunking: ChunkingConfig,
    pub buffers: BufferConfig,
    pub downloads: DownloadsConfig,
    pub scheduler: SchedulerConfig,
    pub retry: RetryProfilesConfig,
    pub paths: PathsConfig,
}

impl EngineConfig {
    /// Load from a TOML file; missing sections fall back to defaults,
    /// unknown keys fail the load.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the user-data base directory.
    pub fn user_data_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.paths.user_data_dir {
            Ok(dir.clone())
        } else {
            let base = dirs::data_dir()
                .ok_or_else(|| anyhow::anyhow!("Failed to determine data directory"))?;
            Ok(base.join("depot"))
        }
    }

    /// Resolve the state database path.
    pub fn state_db_path(&self) -> Result<PathBuf> {
        if let Some(ref path) = self.paths.state_db_path {
            Ok(path.clone())
        } else {
            Ok(self
                .user_data_dir()?
                .join("config")
                .join("downloads-state.db"))
        }
    }

    /// Resolve the chunk temp base directory.
    pub fn temp_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.paths.temp_dir {
            Ok(dir.clone())
        } else {
            Ok(self.user_data_dir()?.join("tmp"))
        }
    }

    /// Check a URL host against the allow-list. An empty list allows any.
    pub fn host_allowed(&self, host: &str) -> bool {
        self.paths.allowed_hosts.is_empty()
            || self
                .paths
                .allowed_hosts
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(host))
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.downloads.max_concurrent == 0 {
            return Err(anyhow::anyhow!("max_concurrent must be greater than 0"));
        }

        if self.downloads.max_concurrent_per_host == 0 {
            return Err(anyhow::anyhow!(
                "max_concurrent_per_host must be greater than 0"
            ));
        }

        if self.downloads.max_queue_size == 0 {
            return Err(anyhow::anyhow!("max_queue_size must be greater than 0"));
        }

        if self.chunking.min_chunks == 0 || self.chunking.max_chunks < self.chunking.min_chunks {
            return Err(anyhow::anyhow!(
                "chunking min/max chunks must satisfy 0 < min <= max"
            ));
        }

        if self.chunking.adaptive.min_chunk_bytes == 0
            || self.chunking.adaptive.max_chunk_bytes < self.chunking.adaptive.min_chunk_bytes
        {
            return Err(anyhow::anyhow!(
                "adaptive chunk sizes must satisfy 0 < min <= max"
            ));
        }

        if self.buffers.pool.buffer_bytes == 0 {
            return Err(anyhow::anyhow!("pool buffer_bytes must be greater than 0"));
        }

        if self.buffers.min_write_buffer_bytes == 0
            || self.buffers.max_write_buffer_bytes < self.buffers.min_write_buffer_bytes
        {
            return Err(anyhow::anyhow!(
                "write buffer sizes must satisfy 0 < min <= max"
            ));
        }

        if self.network.max_retry_after_secs == 0 {
            return Err(anyhow::anyhow!(
                "max_retry_after_secs must be greater than 0"
            ));
        }

        for (name, profile) in [
            ("timeout", &self.retry.timeout),
            ("connection_reset", &self.retry.connection_reset),
            ("connection_refused", &self.retry.connection_refused),
            ("dns", &self.retry.dns),
            ("network_change", &self.retry.network_change),
            ("server_overload", &self.retry.server_overload),
            ("pipe_broken", &self.retry.pipe_broken),
            ("unknown", &self.retry.unknown),
        ] {
            if profile.max_delay_ms < profile.base_delay_ms {
                return Err(anyhow::anyhow!(
                    "retry profile {name}: max_delay_ms must be >= base_delay_ms"
                ));
            }
            if profile.growth_factor < 1.0 {
                return Err(anyhow::anyhow!(
                    "retry profile {name}: growth_factor must be >= 1.0"
                ));
            }
            if !(0.0..=1.0).contains(&profile.jitter_factor) {
                return Err(anyhow::anyhow!(
                    "retry profile {name}: jitter_factor must be in [0, 1]"
                ));
            }
        }

        Ok(())
    }
}
