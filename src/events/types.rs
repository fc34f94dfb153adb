use serde::{Deserialize, Serialize};

/// Discriminant for subscription filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    StateChanged,
    DownloadProgress,
    DownloadCompleted,
    DownloadFailed,
    ChunkCompleted,
    ChunkFailed,
    NeedsConfirmation,
    MergeStarted,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StateChanged => "state.changed",
            Self::DownloadProgress => "download.progress",
            Self::DownloadCompleted => "download.completed",
            Self::DownloadFailed => "download.failed",
            Self::ChunkCompleted => "chunk.completed",
            Self::ChunkFailed => "chunk.failed",
            Self::NeedsConfirmation => "download.needs_confirmation",
            Self::MergeStarted => "download.merge_started",
        }
    }
}

/// Events emitted by the engine. Consumers receive these over the bus;
/// there is no other notification channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineEvent {
    /// The persistent queue changed; consumers re-fetch a snapshot
    StateChanged { state_version: i64 },

    DownloadProgress {
        download_id: i64,
        downloaded_bytes: u64,
        total_bytes: u64,
        progress: f64,
        speed_bps: u64,
    },

    DownloadCompleted {
        download_id: i64,
        save_path: String,
    },

    DownloadFailed {
        download_id: i64,
        error: String,
        failed_during_merge: bool,
    },

    ChunkCompleted {
        download_id: i64,
        chunk_index: u32,
    },

    ChunkFailed {
        download_id: i64,
        chunk_index: u32,
        error: String,
        will_retry: bool,
    },

    /// Target file exists and force_overwrite is unset; waits for
    /// `confirm_overwrite`
    NeedsConfirmation {
        download_id: i64,
        save_path: String,
    },

    MergeStarted {
        download_id: i64,
    },
}

impl EngineEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::StateChanged { .. } => EventKind::StateChanged,
            Self::DownloadProgress { .. } => EventKind::DownloadProgress,
            Self::DownloadCompleted { .. } => EventKind::DownloadCompleted,
            Self::DownloadFailed { .. } => EventKind::DownloadFailed,
            Self::ChunkCompleted { .. } => EventKind::ChunkCompleted,
            Self::ChunkFailed { .. } => EventKind::ChunkFailed,
            Self::NeedsConfirmation { .. } => EventKind::NeedsConfirmation,
            Self::MergeStarted { .. } => EventKind::MergeStarted,
        }
    }

    /// Download this event concerns, when it concerns exactly one.
    pub fn download_id(&self) -> Option<i64> {
        match self {
            Self::StateChanged { .. } => None,
            Self::DownloadProgress { download_id, .. }
            | Self::DownloadCompleted { download_id, .. }
            | Self::DownloadFailed { download_id, .. }
            | Self::ChunkCompleted { download_id, .. }
            | Self::ChunkFailed { download_id, .. }
            | Self::NeedsConfirmation { download_id, .. }
            | Self::MergeStarted { download_id } => Some(*download_id),
        }
    }
}
