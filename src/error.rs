use crate::engine::state_machine::DownloadState;

/// Transient error category used for backoff profile selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryCategory {
    Timeout,
    ConnectionReset,
    ConnectionRefused,
    Dns,
    NetworkChange,
    ServerOverload,
    PipeBroken,
    Unknown,
}

impl RetryCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::ConnectionReset => "connection_reset",
            Self::ConnectionRefused => "connection_refused",
            Self::Dns => "dns",
            Self::NetworkChange => "network_change",
            Self::ServerOverload => "server_overload",
            Self::PipeBroken => "pipe_broken",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityKind {
    HashMismatch { expected: String, actual: String },
    SizeMismatch { expected: u64, actual: u64 },
    ChunkIncomplete { expected: u64, actual: u64 },
}

impl std::fmt::Display for IntegrityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HashMismatch { expected, actual } => {
                write!(f, "hash mismatch (expected {expected}, got {actual})")
            }
            Self::SizeMismatch { expected, actual } => {
                write!(f, "size mismatch (expected {expected} bytes, got {actual})")
            }
            Self::ChunkIncomplete { expected, actual } => {
                write!(f, "chunk incomplete ({actual} of {expected} bytes)")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    InvalidTransition {
        from: DownloadState,
        to: DownloadState,
    },
    QueueFull {
        max: usize,
    },
    Duplicate {
        url: String,
    },
    UnknownDownload {
        id: i64,
    },
    HostNotAllowed {
        host: String,
    },
}

impl std::fmt::Display for StateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidTransition { from, to } => {
                write!(f, "invalid state transition {from} -> {to}")
            }
            Self::QueueFull { max } => write!(f, "queue is full (max {max})"),
            Self::Duplicate { url } => write!(f, "download for {url} already queued"),
            Self::UnknownDownload { id } => write!(f, "unknown download id {id}"),
            Self::HostNotAllowed { host } => write!(f, "host {host} is not in the allow-list"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// No response headers within the response-start budget
    Response,
    /// Bytes stopped flowing for longer than the chunk idle budget
    Inactivity,
    /// Whole-chunk operation exceeded its overall budget
    Operation,
}

impl std::fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Response => f.write_str("response"),
            Self::Inactivity => f.write_str("inactivity"),
            Self::Operation => f.write_str("operation"),
        }
    }
}

/// Engine error taxonomy. Downstream code matches on variants; retry
/// metadata travels inside the variant instead of ad-hoc properties.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("transient network error ({}): {message}", .category.as_str())]
    TransientNetwork {
        category: RetryCategory,
        message: String,
        /// Parsed Retry-After, when the server supplied one
        retry_after_ms: Option<u64>,
    },

    #[error("http status {code}")]
    HttpStatus {
        code: u16,
        retry_after_ms: Option<u64>,
    },

    #[error("integrity error: {0}")]
    Integrity(IntegrityKind),

    #[error("disk error: {0}")]
    Disk(String),

    #[error("{0}")]
    State(StateError),

    #[error("{0} timeout")]
    Timeout(TimeoutKind),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl EngineError {
    /// Whether the standard chunk retry path applies to this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransientNetwork { .. } => true,
            Self::HttpStatus { code, .. } => matches!(code, 408 | 429 | 503),
            Self::Timeout(TimeoutKind::Response) | Self::Timeout(TimeoutKind::Inactivity) => true,
            // One retry with a fresh file handle, enforced by the chunk
            // downloader's per-chunk counter
            Self::Disk(_) => true,
            _ => false,
        }
    }

    /// Retry-After attached by the response handler, if any.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::TransientNetwork { retry_after_ms, .. } => *retry_after_ms,
            Self::HttpStatus { retry_after_ms, .. } => *retry_after_ms,
            _ => None,
        }
    }

    /// Short machine-readable code persisted into the attempts log.
    pub fn code(&self) -> &'static str {
        match self {
            Self::TransientNetwork { category, .. } => category.as_str(),
            Self::HttpStatus { code: 429, .. } | Self::HttpStatus { code: 503, .. } => {
                "server_overload"
            }
            Self::HttpStatus { .. } => "http_error",
            Self::Integrity(IntegrityKind::ChunkIncomplete { .. }) => "chunk_incomplete",
            Self::Integrity(IntegrityKind::HashMismatch { .. }) => "hash_mismatch",
            Self::Integrity(IntegrityKind::SizeMismatch { .. }) => "size_mismatch",
            Self::Disk(_) => "disk_error",
            Self::State(_) => "state_error",
            Self::Timeout(TimeoutKind::Response) => "response_timeout",
            Self::Timeout(TimeoutKind::Inactivity) => "progress_timeout",
            Self::Timeout(TimeoutKind::Operation) => "operation_timeout",
            Self::Fatal(_) => "fatal",
        }
    }
}

/// Check if an I/O error is due to disk space exhaustion (ENOSPC)
pub fn is_disk_full_error(err: &std::io::Error) -> bool {
    #[cfg(unix)]
    if err.raw_os_error() == Some(28) {
        return true;
    }

    #[cfg(windows)]
    if err.raw_os_error() == Some(112) {
        return true;
    }

    let msg = err.to_string().to_lowercase();
    msg.contains("no space left") || msg.contains("disk full") || msg.contains("enospc")
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        if is_disk_full_error(&err) {
            EngineError::Disk(format!("no space left on device: {err}"))
        } else {
            EngineError::Disk(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_variants() {
        let transient = EngineError::TransientNetwork {
            category: RetryCategory::ConnectionReset,
            message: "reset".into(),
            retry_after_ms: None,
        };
        assert!(transient.is_retryable());

        assert!(
            EngineError::HttpStatus {
                code: 429,
                retry_after_ms: Some(2000)
            }
            .is_retryable()
        );
        assert!(
            EngineError::HttpStatus {
                code: 503,
                retry_after_ms: None
            }
            .is_retryable()
        );
        assert!(
            EngineError::HttpStatus {
                code: 408,
                retry_after_ms: None
            }
            .is_retryable()
        );
        assert!(
            !EngineError::HttpStatus {
                code: 404,
                retry_after_ms: None
            }
            .is_retryable()
        );
        assert!(
            !EngineError::Integrity(IntegrityKind::HashMismatch {
                expected: "a".into(),
                actual: "b".into()
            })
            .is_retryable()
        );
    }

    #[test]
    fn test_retry_after_carried() {
        let err = EngineError::HttpStatus {
            code: 429,
            retry_after_ms: Some(2000),
        };
        assert_eq!(err.retry_after_ms(), Some(2000));
        assert_eq!(err.code(), "server_overload");
    }

    #[test]
    fn test_attempt_codes() {
        assert_eq!(
            EngineError::Timeout(TimeoutKind::Inactivity).code(),
            "progress_timeout"
        );
        assert_eq!(
            EngineError::Integrity(IntegrityKind::ChunkIncomplete {
                expected: 10,
                actual: 9
            })
            .code(),
            "chunk_incomplete"
        );
    }
}
