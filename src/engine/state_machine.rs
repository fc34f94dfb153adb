use serde::{Deserialize, Serialize};

/// Lifecycle state of a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DownloadState {
    /// Waiting in the queue for a scheduler slot
    Queued,
    /// Picked by the scheduler, provisioning chunks
    Starting,
    /// Chunk workers actively transferring
    Downloading,
    /// Paused by the user; chunks keep their partial files
    Paused,
    /// Assembling chunks into the staging file
    Merging,
    /// Final hash/size check against the assembled artifact
    Verifying,
    /// Terminal success
    Completed,
    /// Terminal failure (restartable)
    Failed,
    /// Cancelled by the user (restartable)
    Cancelled,
}

impl DownloadState {
    /// Convert to string for database storage
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Starting => "starting",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Merging => "merging",
            Self::Verifying => "verifying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse from database string
    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "starting" => Some(Self::Starting),
            "downloading" => Some(Self::Downloading),
            "paused" => Some(Self::Paused),
            "merging" => Some(Self::Merging),
            "verifying" => Some(Self::Verifying),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// A download in an active state holds concurrency slots and may have
    /// in-flight tasks.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Starting | Self::Downloading | Self::Merging | Self::Verifying
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for DownloadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_db_str())
    }
}

/// Check if a state transition is allowed.
///
/// Failed → Merging supports the silent single merge re-try; Completed and
/// Cancelled re-enter the queue for re-downloads.
pub fn can_transition(from: DownloadState, to: DownloadState) -> bool {
    use DownloadState::*;

    match (from, to) {
        (Queued, Starting) | (Queued, Paused) | (Queued, Cancelled) | (Queued, Failed) => true,

        (Starting, Downloading)
        | (Starting, Paused)
        | (Starting, Failed)
        | (Starting, Cancelled) => true,

        (Downloading, Paused)
        | (Downloading, Merging)
        | (Downloading, Verifying)
        | (Downloading, Failed)
        | (Downloading, Cancelled) => true,

        (Paused, Queued) | (Paused, Cancelled) => true,

        (Merging, Verifying) | (Merging, Failed) | (Merging, Cancelled) => true,

        (Verifying, Completed) | (Verifying, Failed) => true,

        (Completed, Queued) | (Completed, Paused) => true,

        (Failed, Queued) | (Failed, Merging) => true,

        (Cancelled, Paused) | (Cancelled, Queued) => true,

        _ => false,
    }
}

/// State of a single chunk within a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChunkState {
    Pending,
    Downloading,
    Completed,
    Failed,
}

impl ChunkState {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "downloading" => Some(Self::Downloading),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChunkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_db_str())
    }
}
