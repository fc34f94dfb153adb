use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use crate::engine::state_machine::{ChunkState, DownloadState};

/// Persistent record of one download.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRow {
    pub id: i64,
    pub title: String,
    pub url: String,
    pub save_path: String,
    /// Base directory holding this download's chunk temp files
    pub temp_base: String,
    pub total_bytes: i64,
    pub downloaded_bytes: i64,
    pub progress: f64,
    pub state: DownloadState,
    /// 1 (low) .. 3 (high)
    pub priority: i64,
    pub force_overwrite: bool,
    pub created_at: NaiveDateTime,
    pub started_at: Option<NaiveDateTime>,
    pub completed_at: Option<NaiveDateTime>,
    pub updated_at: NaiveDateTime,
    pub retry_count: i64,
    pub last_error: Option<String>,
    pub expected_hash: Option<String>,
    pub actual_hash: Option<String>,
    pub verified: bool,
    pub queue_position: i64,
    /// Tail checkpoint persisted at pause: hash of the last window of the
    /// partial artifact plus its size at that moment
    pub tail_hash: Option<String>,
    pub tail_size: Option<i64>,
}

impl sqlx::FromRow<'_, SqliteRow> for DownloadRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let state_str: String = row.try_get("state")?;
        let state = DownloadState::from_db_str(&state_str).ok_or_else(|| {
            sqlx::Error::ColumnDecode {
                index: "state".into(),
                source: format!("unknown download state {state_str:?}").into(),
            }
        })?;

        Ok(Self {
            id: row.try_get("id")?,
            title: row.try_get("title")?,
            url: row.try_get("url")?,
            save_path: row.try_get("save_path")?,
            temp_base: row.try_get("temp_base")?,
            total_bytes: row.try_get("total_bytes")?,
            downloaded_bytes: row.try_get("downloaded_bytes")?,
            progress: row.try_get("progress")?,
            state,
            priority: row.try_get("priority")?,
            force_overwrite: row.try_get("force_overwrite")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            updated_at: row.try_get("updated_at")?,
            retry_count: row.try_get("retry_count")?,
            last_error: row.try_get("last_error")?,
            expected_hash: row.try_get("expected_hash")?,
            actual_hash: row.try_get("actual_hash")?,
            verified: row.try_get("verified")?,
            queue_position: row.try_get("queue_position")?,
            tail_hash: row.try_get("tail_hash")?,
            tail_size: row.try_get("tail_size")?,
        })
    }
}

/// Persistent record of one chunk. Unique by (download_id, chunk_index).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRow {
    pub id: i64,
    pub download_id: i64,
    pub chunk_index: i64,
    pub start_byte: i64,
    /// Inclusive
    pub end_byte: i64,
    pub downloaded_bytes: i64,
    pub state: ChunkState,
    pub temp_path: String,
    pub hash: Option<String>,
    pub tail_hash: Option<String>,
    pub tail_size: Option<i64>,
}

impl ChunkRow {
    pub fn size(&self) -> u64 {
        (self.end_byte - self.start_byte + 1) as u64
    }
}

impl sqlx::FromRow<'_, SqliteRow> for ChunkRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let state_str: String = row.try_get("state")?;
        let state =
            ChunkState::from_db_str(&state_str).ok_or_else(|| sqlx::Error::ColumnDecode {
                index: "state".into(),
                source: format!("unknown chunk state {state_str:?}").into(),
            })?;

        Ok(Self {
            id: row.try_get("id")?,
            download_id: row.try_get("download_id")?,
            chunk_index: row.try_get("chunk_index")?,
            start_byte: row.try_get("start_byte")?,
            end_byte: row.try_get("end_byte")?,
            downloaded_bytes: row.try_get("downloaded_bytes")?,
            state,
            temp_path: row.try_get("temp_path")?,
            hash: row.try_get("hash")?,
            tail_hash: row.try_get("tail_hash")?,
            tail_size: row.try_get("tail_size")?,
        })
    }
}

/// Append-only audit log entry for a failed or completed attempt.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct AttemptRow {
    pub id: i64,
    pub download_id: i64,
    pub chunk_id: Option<i64>,
    pub attempt_number: i64,
    pub created_at: NaiveDateTime,
    pub error_text: Option<String>,
    pub error_code: Option<String>,
    pub bytes_transferred: i64,
}

/// Terminal-outcome record for the catalog UI's recent-downloads listing.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct HistoryRow {
    pub id: i64,
    pub download_id: i64,
    pub title: String,
    pub url: String,
    pub save_path: String,
    pub total_bytes: i64,
    pub outcome: String,
    pub duration_ms: Option<i64>,
    pub created_at: NaiveDateTime,
}

/// Parameters for enqueuing a new download.
#[derive(Debug, Clone)]
pub struct NewDownload {
    pub title: String,
    pub url: String,
    pub save_path: String,
    pub temp_base: String,
    pub total_bytes: u64,
    pub priority: i64,
    pub force_overwrite: bool,
    pub expected_hash: Option<String>,
    /// Enqueue paused instead of queued
    pub start_paused: bool,
    /// Bypass the queue-size limit check
    pub skip_queue_limit: bool,
}

/// Partial update of a download row; None fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct DownloadPatch {
    pub title: Option<String>,
    pub save_path: Option<String>,
    pub temp_base: Option<String>,
    pub downloaded_bytes: Option<i64>,
    pub progress: Option<f64>,
    pub state: Option<DownloadState>,
    pub priority: Option<i64>,
    pub force_overwrite: Option<bool>,
    pub started_at: Option<NaiveDateTime>,
    pub completed_at: Option<NaiveDateTime>,
    pub retry_count: Option<i64>,
    pub last_error: Option<Option<String>>,
    pub actual_hash: Option<Option<String>>,
    pub verified: Option<bool>,
    pub tail_hash: Option<Option<String>>,
    pub tail_size: Option<Option<i64>>,
}

impl DownloadPatch {
    /// A patch that only moves progress counters can ride the batch path.
    pub fn is_progress_only(&self) -> bool {
        let Self {
            title,
            save_path,
            temp_base,
            downloaded_bytes,
            progress,
            state,
            priority,
            force_overwrite,
            started_at,
            completed_at,
            retry_count,
            last_error,
            actual_hash,
            verified,
            tail_hash,
            tail_size,
        } = self;

        (downloaded_bytes.is_some() || progress.is_some())
            && title.is_none()
            && save_path.is_none()
            && temp_base.is_none()
            && state.is_none()
            && priority.is_none()
            && force_overwrite.is_none()
            && started_at.is_none()
            && completed_at.is_none()
            && retry_count.is_none()
            && last_error.is_none()
            && actual_hash.is_none()
            && verified.is_none()
            && tail_hash.is_none()
            && tail_size.is_none()
    }
}

/// Parameters for one planned chunk.
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub chunk_index: u32,
    pub start_byte: u64,
    pub end_byte: u64,
    pub temp_path: String,
}

/// Partial update of a chunk row.
#[derive(Debug, Clone, Default)]
pub struct ChunkPatch {
    pub downloaded_bytes: Option<i64>,
    pub state: Option<ChunkState>,
    pub temp_path: Option<String>,
    pub hash: Option<Option<String>>,
    pub tail_hash: Option<Option<String>>,
    pub tail_size: Option<Option<i64>>,
}

#[derive(Debug, Clone)]
pub struct NewAttempt {
    pub download_id: i64,
    pub chunk_id: Option<i64>,
    pub attempt_number: i64,
    pub error_text: Option<String>,
    pub error_code: Option<String>,
    pub bytes_transferred: i64,
}

#[derive(Debug, Clone)]
pub struct NewHistory {
    pub download_id: i64,
    pub title: String,
    pub url: String,
    pub save_path: String,
    pub total_bytes: i64,
    pub outcome: String,
    pub duration_ms: Option<i64>,
}

/// Aggregate counters over the whole queue, included in snapshots.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueSummary {
    pub total: usize,
    pub queued: usize,
    pub active: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total_bytes: i64,
    pub downloaded_bytes: i64,
}

impl QueueSummary {
    pub fn from_rows(rows: &[DownloadRow]) -> Self {
        let mut summary = Self {
            total: rows.len(),
            ..Default::default()
        };
        for row in rows {
            match row.state {
                DownloadState::Queued => summary.queued += 1,
                DownloadState::Paused => summary.paused += 1,
                DownloadState::Completed => summary.completed += 1,
                DownloadState::Failed => summary.failed += 1,
                DownloadState::Cancelled => summary.cancelled += 1,
                s if s.is_active() => summary.active += 1,
                _ => {}
            }
            summary.total_bytes += row.total_bytes;
            summary.downloaded_bytes += row.downloaded_bytes;
        }
        summary
    }
}

/// Immutable view of the queue at a particular state version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub state_version: i64,
    pub downloads: Vec<DownloadRow>,
    pub summary: QueueSummary,
    /// False when the caller's version is current and nothing is active
    pub has_changes: bool,
}

/// Rows changed since a timestamp, plus the id universe so consumers can
/// detect deletions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncrementalSnapshot {
    pub state_version: i64,
    pub updated: Vec<DownloadRow>,
    pub current_ids: Vec<i64>,
    pub has_changes: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_only_patch() {
        let patch = DownloadPatch {
            downloaded_bytes: Some(100),
            progress: Some(0.5),
            ..Default::default()
        };
        assert!(patch.is_progress_only());

        let patch = DownloadPatch {
            downloaded_bytes: Some(100),
            state: Some(DownloadState::Paused),
            ..Default::default()
        };
        assert!(!patch.is_progress_only());

        assert!(!DownloadPatch::default().is_progress_only());
    }

    #[test]
    fn test_queue_summary() {
        fn row(state: DownloadState, total: i64, downloaded: i64) -> DownloadRow {
            let now = chrono::Utc::now().naive_utc();
            DownloadRow {
                id: 1,
                title: "t".into(),
                url: "http://example.com/f".into(),
                save_path: "/tmp/f".into(),
                temp_base: "/tmp".into(),
                total_bytes: total,
                downloaded_bytes: downloaded,
                progress: 0.0,
                state,
                priority: 2,
                force_overwrite: false,
                created_at: now,
                started_at: None,
                completed_at: None,
                updated_at: now,
                retry_count: 0,
                last_error: None,
                expected_hash: None,
                actual_hash: None,
                verified: false,
                queue_position: 0,
                tail_hash: None,
                tail_size: None,
            }
        }

        let rows = vec![
            row(DownloadState::Queued, 100, 0),
            row(DownloadState::Downloading, 200, 50),
            row(DownloadState::Completed, 300, 300),
        ];
        let summary = QueueSummary::from_rows(&rows);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.queued, 1);
        assert_eq!(summary.active, 1);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.total_bytes, 600);
        assert_eq!(summary.downloaded_bytes, 350);
    }

    #[test]
    fn test_chunk_size() {
        let chunk = ChunkRow {
            id: 1,
            download_id: 1,
            chunk_index: 0,
            start_byte: 0,
            end_byte: 1023,
            downloaded_bytes: 0,
            state: ChunkState::Pending,
            temp_path: "/tmp/chunk_0".into(),
            hash: None,
            tail_hash: None,
            tail_size: None,
        };
        assert_eq!(chunk.size(), 1024);
    }
}
