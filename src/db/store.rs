use async_trait::async_trait;
use chrono::NaiveDateTime;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::connection;
use super::models::{
    AttemptRow, ChunkPatch, ChunkRow, DownloadPatch, DownloadRow, HistoryRow, IncrementalSnapshot,
    NewAttempt, NewChunk, NewDownload, NewHistory, QueueSummary, Snapshot,
};
use crate::engine::state_machine::{self, DownloadState};
use crate::error::{EngineError, StateError};

/// Flush the progress batch early once it holds this many downloads.
const BATCH_FLUSH_THRESHOLD: usize = 64;

/// Delay before the single retry after a failed batch flush.
const BATCH_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Observer invoked around validated state transitions. The engine
/// registers one to release and acquire concurrency slots.
#[async_trait]
pub trait TransitionObserver: Send + Sync {
    async fn on_exit(&self, download: &DownloadRow, from: DownloadState);
    async fn on_enter(&self, download: &DownloadRow, to: DownloadState);
}

/// Durable, transactional record of downloads, chunks, and attempts.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn add(&self, new: NewDownload) -> Result<DownloadRow, EngineError>;
    async fn get(&self, id: i64) -> Result<Option<DownloadRow>, EngineError>;
    async fn list(&self) -> Result<Vec<DownloadRow>, EngineError>;
    async fn list_by_state(&self, state: DownloadState) -> Result<Vec<DownloadRow>, EngineError>;

    /// Merge non-null fields. A state change is validated against the
    /// transition table and fires the observer; progress-only patches ride
    /// the coalescing batch instead of hitting the database directly.
    async fn update(&self, id: i64, patch: DownloadPatch) -> Result<DownloadRow, EngineError>;

    /// Atomic CAS-style state change. With `expected_from` set, the change
    /// is rejected when the stored state differs.
    async fn transition(
        &self,
        id: i64,
        to: DownloadState,
        expected_from: Option<DownloadState>,
    ) -> Result<DownloadRow, EngineError>;

    async fn delete(&self, id: i64) -> Result<(), EngineError>;

    async fn snapshot(&self, min_version: Option<i64>) -> Result<Snapshot, EngineError>;
    async fn incremental_snapshot(
        &self,
        since: NaiveDateTime,
        min_version: Option<i64>,
    ) -> Result<IncrementalSnapshot, EngineError>;
    async fn current_version(&self) -> Result<i64, EngineError>;

    async fn create_chunks(
        &self,
        download_id: i64,
        chunks: Vec<NewChunk>,
    ) -> Result<Vec<ChunkRow>, EngineError>;
    async fn get_chunks(&self, download_id: i64) -> Result<Vec<ChunkRow>, EngineError>;
    async fn update_chunk(
        &self,
        download_id: i64,
        chunk_index: u32,
        patch: ChunkPatch,
    ) -> Result<(), EngineError>;
    async fn delete_chunks(&self, download_id: i64) -> Result<(), EngineError>;

    async fn record_attempt(&self, attempt: NewAttempt) -> Result<(), EngineError>;
    async fn attempts_for(&self, download_id: i64) -> Result<Vec<AttemptRow>, EngineError>;

    async fn record_history(&self, entry: NewHistory) -> Result<(), EngineError>;
    async fn list_history(&self, limit: usize) -> Result<Vec<HistoryRow>, EngineError>;
    async fn clear_history(&self) -> Result<(), EngineError>;

    /// Queue a progress-only update for the coalescing batch.
    async fn submit_progress(&self, id: i64, downloaded_bytes: i64, progress: f64);

    /// Write out everything currently batched.
    async fn flush_progress(&self) -> Result<(), EngineError>;

    /// Remove terminal rows in the given states, returning what was removed
    /// so the caller can clean up files.
    async fn clear_finished(
        &self,
        states: &[DownloadState],
    ) -> Result<Vec<DownloadRow>, EngineError>;

    fn set_transition_observer(&self, observer: Arc<dyn TransitionObserver>);

    async fn close(&self);
}

#[derive(Default)]
struct BatchInner {
    entries: HashMap<i64, (i64, f64)>,
    retry_pending: bool,
}

/// SQLite-backed state store. Single writer by construction: all writes go
/// through this type, multi-row operations run in transactions.
pub struct SqliteStateStore {
    pool: SqlitePool,
    max_queue_size: usize,
    batch: Arc<Mutex<BatchInner>>,
    observer: Mutex<Option<Arc<dyn TransitionObserver>>>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl SqliteStateStore {
    /// Open the on-disk store, run recovery, and start the progress-flush
    /// timer.
    pub async fn open(
        path: &Path,
        max_queue_size: usize,
        progress_batch_delay: Duration,
    ) -> Result<Self, EngineError> {
        let pool = connection::open_pool(path)
            .await
            .map_err(|e| EngineError::Fatal(format!("failed to open state database: {e:#}")))?;
        Self::from_pool(pool, max_queue_size, progress_batch_delay).await
    }

    /// In-memory store for tests.
    pub async fn open_in_memory(
        max_queue_size: usize,
        progress_batch_delay: Duration,
    ) -> Result<Self, EngineError> {
        let pool = connection::open_memory_pool()
            .await
            .map_err(|e| EngineError::Fatal(format!("failed to open state database: {e:#}")))?;
        Self::from_pool(pool, max_queue_size, progress_batch_delay).await
    }

    async fn from_pool(
        pool: SqlitePool,
        max_queue_size: usize,
        progress_batch_delay: Duration,
    ) -> Result<Self, EngineError> {
        let store = Self {
            pool,
            max_queue_size,
            batch: Arc::new(Mutex::new(BatchInner::default())),
            observer: Mutex::new(None),
            flush_task: Mutex::new(None),
        };

        store.recover().await?;
        store.start_flush_timer(progress_batch_delay);

        Ok(store)
    }

    /// Downloads left in an active state belong to a process that died
    /// mid-work; put them back in the queue.
    async fn recover(&self) -> Result<(), EngineError> {
        let result = sqlx::query(
            "UPDATE downloads SET state = 'queued', updated_at = ?
             WHERE state IN ('starting', 'downloading', 'merging', 'verifying')",
        )
        .bind(now())
        .execute(&self.pool)
        .await
        .map_err(db_fatal)?;

        if result.rows_affected() > 0 {
            info!(
                "Recovery: moved {} interrupted download(s) back to queued",
                result.rows_affected()
            );
        }
        Ok(())
    }

    fn start_flush_timer(&self, delay: Duration) {
        let pool = self.pool.clone();
        let batch = self.batch.clone();
        let delay = delay.max(Duration::from_millis(10));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(delay);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = flush_batch(&pool, &batch).await {
                    warn!("Progress flush failed: {e}");
                }
            }
        });

        *self.flush_task.lock().unwrap() = Some(handle);
    }

    async fn fetch(&self, id: i64) -> Result<DownloadRow, EngineError> {
        self.get(id)
            .await?
            .ok_or(EngineError::State(StateError::UnknownDownload { id }))
    }

    async fn notify_observer(&self, row: &DownloadRow, from: DownloadState, to: DownloadState) {
        let observer = self.observer.lock().unwrap().clone();
        if let Some(observer) = observer {
            observer.on_exit(row, from).await;
            observer.on_enter(row, to).await;
        }
    }

    /// Validate and apply a state change inside one transaction.
    async fn transition_inner(
        &self,
        id: i64,
        to: DownloadState,
        expected_from: Option<DownloadState>,
    ) -> Result<(DownloadRow, DownloadState), EngineError> {
        let mut tx = self.pool.begin().await.map_err(db_fatal)?;

        let row: Option<DownloadRow> = sqlx::query_as("SELECT * FROM downloads WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_fatal)?;
        let row = row.ok_or(EngineError::State(StateError::UnknownDownload { id }))?;

        let from = row.state;

        if let Some(expected) = expected_from {
            if from != expected {
                return Err(EngineError::State(StateError::InvalidTransition {
                    from,
                    to,
                }));
            }
        }

        if from == to {
            tx.commit().await.map_err(db_fatal)?;
            return Ok((row, from));
        }

        if !state_machine::can_transition(from, to) {
            return Err(EngineError::State(StateError::InvalidTransition {
                from,
                to,
            }));
        }

        let now = now();
        let started_at = if to == DownloadState::Starting && row.started_at.is_none() {
            Some(now)
        } else {
            row.started_at
        };
        let completed_at = if to == DownloadState::Completed {
            Some(now)
        } else {
            row.completed_at
        };

        sqlx::query(
            "UPDATE downloads
             SET state = ?, started_at = ?, completed_at = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(to.as_db_str())
        .bind(started_at)
        .bind(completed_at)
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(db_fatal)?;

        tx.commit().await.map_err(db_fatal)?;

        debug!("Download {} transition {} -> {}", id, from, to);

        let updated = self.fetch(id).await?;
        Ok((updated, from))
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn add(&self, new: NewDownload) -> Result<DownloadRow, EngineError> {
        let mut tx = self.pool.begin().await.map_err(db_fatal)?;

        if !new.skip_queue_limit {
            let (pending,): (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM downloads
                 WHERE state NOT IN ('completed', 'failed', 'cancelled')",
            )
            .fetch_one(&mut *tx)
            .await
            .map_err(db_fatal)?;

            if pending as usize >= self.max_queue_size {
                return Err(EngineError::State(StateError::QueueFull {
                    max: self.max_queue_size,
                }));
            }
        }

        let (duplicates,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM downloads
             WHERE url = ? AND state NOT IN ('completed', 'failed', 'cancelled')",
        )
        .bind(&new.url)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_fatal)?;

        if duplicates > 0 {
            return Err(EngineError::State(StateError::Duplicate { url: new.url }));
        }

        let (max_position,): (Option<i64>,) =
            sqlx::query_as("SELECT MAX(queue_position) FROM downloads")
                .fetch_one(&mut *tx)
                .await
                .map_err(db_fatal)?;

        let state = if new.start_paused {
            DownloadState::Paused
        } else {
            DownloadState::Queued
        };
        let now = now();

        let result = sqlx::query(
            "INSERT INTO downloads
                 (title, url, save_path, temp_base, total_bytes, state, priority,
                  force_overwrite, expected_hash, created_at, updated_at, queue_position)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&new.title)
        .bind(&new.url)
        .bind(&new.save_path)
        .bind(&new.temp_base)
        .bind(new.total_bytes as i64)
        .bind(state.as_db_str())
        .bind(new.priority)
        .bind(new.force_overwrite)
        .bind(&new.expected_hash)
        .bind(now)
        .bind(now)
        .bind(max_position.unwrap_or(0) + 1)
        .execute(&mut *tx)
        .await
        .map_err(db_fatal)?;

        let id = result.last_insert_rowid();
        tx.commit().await.map_err(db_fatal)?;

        info!("Enqueued download {} ({})", id, new.title);
        self.fetch(id).await
    }

    async fn get(&self, id: i64) -> Result<Option<DownloadRow>, EngineError> {
        sqlx::query_as("SELECT * FROM downloads WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_fatal)
    }

    async fn list(&self) -> Result<Vec<DownloadRow>, EngineError> {
        sqlx::query_as("SELECT * FROM downloads ORDER BY queue_position ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(db_fatal)
    }

    async fn list_by_state(&self, state: DownloadState) -> Result<Vec<DownloadRow>, EngineError> {
        sqlx::query_as(
            "SELECT * FROM downloads WHERE state = ?
             ORDER BY priority DESC, queue_position ASC",
        )
        .bind(state.as_db_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_fatal)
    }

    async fn update(&self, id: i64, patch: DownloadPatch) -> Result<DownloadRow, EngineError> {
        if patch.is_progress_only() {
            let current = self.fetch(id).await?;
            let downloaded = patch.downloaded_bytes.unwrap_or(current.downloaded_bytes);
            let progress = patch.progress.unwrap_or(current.progress);
            self.submit_progress(id, downloaded, progress).await;
            let mut merged = current;
            merged.downloaded_bytes = downloaded;
            merged.progress = progress;
            return Ok(merged);
        }

        // Non-progress writes force the batch out first so ordering holds
        let _ = self.flush_progress().await;

        let transition = if let Some(to) = patch.state {
            let current = self.fetch(id).await?;
            if current.state != to && !state_machine::can_transition(current.state, to) {
                return Err(EngineError::State(StateError::InvalidTransition {
                    from: current.state,
                    to,
                }));
            }
            Some((current.state, to))
        } else {
            None
        };

        let current = self.fetch(id).await?;
        let merged_last_error = match patch.last_error {
            Some(value) => value,
            None => current.last_error.clone(),
        };
        let merged_actual_hash = match patch.actual_hash {
            Some(value) => value,
            None => current.actual_hash.clone(),
        };
        let merged_tail_hash = match patch.tail_hash {
            Some(value) => value,
            None => current.tail_hash.clone(),
        };
        let merged_tail_size = match patch.tail_size {
            Some(value) => value,
            None => current.tail_size,
        };

        sqlx::query(
            "UPDATE downloads SET
                 title = ?, save_path = ?, temp_base = ?, downloaded_bytes = ?,
                 progress = ?, state = ?, priority = ?, force_overwrite = ?,
                 started_at = ?, completed_at = ?, retry_count = ?, last_error = ?,
                 actual_hash = ?, verified = ?, tail_hash = ?, tail_size = ?,
                 updated_at = ?
             WHERE id = ?",
        )
        .bind(patch.title.unwrap_or(current.title))
        .bind(patch.save_path.unwrap_or(current.save_path))
        .bind(patch.temp_base.unwrap_or(current.temp_base))
        .bind(patch.downloaded_bytes.unwrap_or(current.downloaded_bytes))
        .bind(patch.progress.unwrap_or(current.progress))
        .bind(patch.state.unwrap_or(current.state).as_db_str())
        .bind(patch.priority.unwrap_or(current.priority))
        .bind(patch.force_overwrite.unwrap_or(current.force_overwrite))
        .bind(patch.started_at.or(current.started_at))
        .bind(patch.completed_at.or(current.completed_at))
        .bind(patch.retry_count.unwrap_or(current.retry_count))
        .bind(merged_last_error)
        .bind(merged_actual_hash)
        .bind(patch.verified.unwrap_or(current.verified))
        .bind(merged_tail_hash)
        .bind(merged_tail_size)
        .bind(now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_fatal)?;

        let updated = self.fetch(id).await?;

        if let Some((from, to)) = transition {
            if from != to {
                debug!("Download {} transition {} -> {}", id, from, to);
                self.notify_observer(&updated, from, to).await;
            }
        }

        Ok(updated)
    }

    async fn transition(
        &self,
        id: i64,
        to: DownloadState,
        expected_from: Option<DownloadState>,
    ) -> Result<DownloadRow, EngineError> {
        let _ = self.flush_progress().await;

        let (updated, from) = self.transition_inner(id, to, expected_from).await?;
        if from != to {
            self.notify_observer(&updated, from, to).await;
        }
        Ok(updated)
    }

    async fn delete(&self, id: i64) -> Result<(), EngineError> {
        let _ = self.flush_progress().await;

        let mut tx = self.pool.begin().await.map_err(db_fatal)?;
        sqlx::query("DELETE FROM chunks WHERE download_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_fatal)?;
        sqlx::query("DELETE FROM downloads WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_fatal)?;
        // Deletes bypass the triggers; bump the version explicitly
        sqlx::query("UPDATE state_version SET version = version + 1 WHERE id = 1")
            .execute(&mut *tx)
            .await
            .map_err(db_fatal)?;
        tx.commit().await.map_err(db_fatal)?;

        // Drop any batched progress for the deleted row
        self.batch.lock().unwrap().entries.remove(&id);
        Ok(())
    }

    async fn snapshot(&self, min_version: Option<i64>) -> Result<Snapshot, EngineError> {
        let state_version = self.current_version().await?;
        let downloads = self.list().await?;
        let summary = QueueSummary::from_rows(&downloads);

        let has_active = downloads.iter().any(|row| row.state.is_active());
        let has_changes = match min_version {
            Some(min) => state_version > min || has_active,
            None => true,
        };

        Ok(Snapshot {
            state_version,
            downloads,
            summary,
            has_changes,
        })
    }

    async fn incremental_snapshot(
        &self,
        since: NaiveDateTime,
        min_version: Option<i64>,
    ) -> Result<IncrementalSnapshot, EngineError> {
        let state_version = self.current_version().await?;

        let updated: Vec<DownloadRow> =
            sqlx::query_as("SELECT * FROM downloads WHERE updated_at > ? ORDER BY updated_at ASC")
                .bind(since)
                .fetch_all(&self.pool)
                .await
                .map_err(db_fatal)?;

        let current_ids: Vec<(i64,)> = sqlx::query_as("SELECT id FROM downloads")
            .fetch_all(&self.pool)
            .await
            .map_err(db_fatal)?;

        let has_active = updated.iter().any(|row| row.state.is_active());
        let has_changes = match min_version {
            Some(min) => state_version > min || has_active,
            None => !updated.is_empty(),
        };

        Ok(IncrementalSnapshot {
            state_version,
            updated,
            current_ids: current_ids.into_iter().map(|(id,)| id).collect(),
            has_changes,
        })
    }

    async fn current_version(&self) -> Result<i64, EngineError> {
        let (version,): (i64,) = sqlx::query_as("SELECT version FROM state_version WHERE id = 1")
            .fetch_one(&self.pool)
            .await
            .map_err(db_fatal)?;
        Ok(version)
    }

    async fn create_chunks(
        &self,
        download_id: i64,
        chunks: Vec<NewChunk>,
    ) -> Result<Vec<ChunkRow>, EngineError> {
        let mut tx = self.pool.begin().await.map_err(db_fatal)?;

        for chunk in &chunks {
            sqlx::query(
                "INSERT INTO chunks
                     (download_id, chunk_index, start_byte, end_byte, state, temp_path)
                 VALUES (?, ?, ?, ?, 'pending', ?)",
            )
            .bind(download_id)
            .bind(chunk.chunk_index as i64)
            .bind(chunk.start_byte as i64)
            .bind(chunk.end_byte as i64)
            .bind(&chunk.temp_path)
            .execute(&mut *tx)
            .await
            .map_err(db_fatal)?;
        }

        tx.commit().await.map_err(db_fatal)?;
        self.get_chunks(download_id).await
    }

    async fn get_chunks(&self, download_id: i64) -> Result<Vec<ChunkRow>, EngineError> {
        sqlx::query_as("SELECT * FROM chunks WHERE download_id = ? ORDER BY chunk_index ASC")
            .bind(download_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_fatal)
    }

    async fn update_chunk(
        &self,
        download_id: i64,
        chunk_index: u32,
        patch: ChunkPatch,
    ) -> Result<(), EngineError> {
        let current: Option<ChunkRow> =
            sqlx::query_as("SELECT * FROM chunks WHERE download_id = ? AND chunk_index = ?")
                .bind(download_id)
                .bind(chunk_index as i64)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_fatal)?;

        let Some(current) = current else {
            return Err(EngineError::State(StateError::UnknownDownload {
                id: download_id,
            }));
        };

        let merged_hash = match patch.hash {
            Some(value) => value,
            None => current.hash,
        };
        let merged_tail_hash = match patch.tail_hash {
            Some(value) => value,
            None => current.tail_hash,
        };
        let merged_tail_size = match patch.tail_size {
            Some(value) => value,
            None => current.tail_size,
        };

        sqlx::query(
            "UPDATE chunks SET
                 downloaded_bytes = ?, state = ?, temp_path = ?,
                 hash = ?, tail_hash = ?, tail_size = ?
             WHERE download_id = ? AND chunk_index = ?",
        )
        .bind(patch.downloaded_bytes.unwrap_or(current.downloaded_bytes))
        .bind(patch.state.unwrap_or(current.state).as_db_str())
        .bind(patch.temp_path.unwrap_or(current.temp_path))
        .bind(merged_hash)
        .bind(merged_tail_hash)
        .bind(merged_tail_size)
        .bind(download_id)
        .bind(chunk_index as i64)
        .execute(&self.pool)
        .await
        .map_err(db_fatal)?;

        Ok(())
    }

    async fn delete_chunks(&self, download_id: i64) -> Result<(), EngineError> {
        sqlx::query("DELETE FROM chunks WHERE download_id = ?")
            .bind(download_id)
            .execute(&self.pool)
            .await
            .map_err(db_fatal)?;
        Ok(())
    }

    async fn record_attempt(&self, attempt: NewAttempt) -> Result<(), EngineError> {
        sqlx::query(
            "INSERT INTO attempts
                 (download_id, chunk_id, attempt_number, created_at,
                  error_text, error_code, bytes_transferred)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(attempt.download_id)
        .bind(attempt.chunk_id)
        .bind(attempt.attempt_number)
        .bind(now())
        .bind(&attempt.error_text)
        .bind(&attempt.error_code)
        .bind(attempt.bytes_transferred)
        .execute(&self.pool)
        .await
        .map_err(db_fatal)?;
        Ok(())
    }

    async fn attempts_for(&self, download_id: i64) -> Result<Vec<AttemptRow>, EngineError> {
        sqlx::query_as("SELECT * FROM attempts WHERE download_id = ? ORDER BY created_at ASC")
            .bind(download_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_fatal)
    }

    async fn record_history(&self, entry: NewHistory) -> Result<(), EngineError> {
        sqlx::query(
            "INSERT INTO history
                 (download_id, title, url, save_path, total_bytes, outcome,
                  duration_ms, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(entry.download_id)
        .bind(&entry.title)
        .bind(&entry.url)
        .bind(&entry.save_path)
        .bind(entry.total_bytes)
        .bind(&entry.outcome)
        .bind(entry.duration_ms)
        .bind(now())
        .execute(&self.pool)
        .await
        .map_err(db_fatal)?;
        Ok(())
    }

    async fn list_history(&self, limit: usize) -> Result<Vec<HistoryRow>, EngineError> {
        sqlx::query_as("SELECT * FROM history ORDER BY created_at DESC LIMIT ?")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db_fatal)
    }

    async fn clear_history(&self) -> Result<(), EngineError> {
        sqlx::query("DELETE FROM history")
            .execute(&self.pool)
            .await
            .map_err(db_fatal)?;
        Ok(())
    }

    async fn submit_progress(&self, id: i64, downloaded_bytes: i64, progress: f64) {
        let should_flush = {
            let mut batch = self.batch.lock().unwrap();
            batch.entries.insert(id, (downloaded_bytes, progress));
            batch.entries.len() >= BATCH_FLUSH_THRESHOLD
        };

        if should_flush {
            if let Err(e) = flush_batch(&self.pool, &self.batch).await {
                warn!("Threshold progress flush failed: {e}");
            }
        }
    }

    async fn flush_progress(&self) -> Result<(), EngineError> {
        flush_batch(&self.pool, &self.batch).await
    }

    async fn clear_finished(
        &self,
        states: &[DownloadState],
    ) -> Result<Vec<DownloadRow>, EngineError> {
        let mut removed = Vec::new();
        for state in states {
            if !state.is_terminal() {
                continue;
            }
            let rows = self.list_by_state(*state).await?;
            for row in rows {
                self.delete(row.id).await?;
                removed.push(row);
            }
        }
        Ok(removed)
    }

    fn set_transition_observer(&self, observer: Arc<dyn TransitionObserver>) {
        *self.observer.lock().unwrap() = Some(observer);
    }

    async fn close(&self) {
        if let Err(e) = self.flush_progress().await {
            error!("Final progress flush failed: {e}");
        }
        if let Some(handle) = self.flush_task.lock().unwrap().take() {
            handle.abort();
        }
        self.pool.close().await;
    }
}

/// Write out the batched progress entries in one transaction. On failure
/// the drained entries are merged back (newer submissions win) and a
/// single retry is scheduled.
async fn flush_batch(
    pool: &SqlitePool,
    batch: &Arc<Mutex<BatchInner>>,
) -> Result<(), EngineError> {
    let drained: HashMap<i64, (i64, f64)> = {
        let mut inner = batch.lock().unwrap();
        if inner.entries.is_empty() {
            return Ok(());
        }
        std::mem::take(&mut inner.entries)
    };

    match write_progress(pool, &drained).await {
        Ok(()) => Ok(()),
        Err(e) => {
            warn!(
                "Progress batch write failed ({} entries): {e}; scheduling retry",
                drained.len()
            );

            let schedule_retry = {
                let mut inner = batch.lock().unwrap();
                for (id, entry) in drained {
                    // Values submitted after the failed flush are newer
                    inner.entries.entry(id).or_insert(entry);
                }
                let first = !inner.retry_pending;
                inner.retry_pending = true;
                first
            };

            if schedule_retry {
                let pool = pool.clone();
                let batch = batch.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(BATCH_RETRY_DELAY).await;
                    let drained: HashMap<i64, (i64, f64)> = {
                        let mut inner = batch.lock().unwrap();
                        inner.retry_pending = false;
                        std::mem::take(&mut inner.entries)
                    };
                    if drained.is_empty() {
                        return;
                    }
                    if let Err(e) = write_progress(&pool, &drained).await {
                        error!("Progress batch retry failed: {e}");
                        let mut inner = batch.lock().unwrap();
                        for (id, entry) in drained {
                            inner.entries.entry(id).or_insert(entry);
                        }
                    }
                });
            }

            Err(e)
        }
    }
}

async fn write_progress(
    pool: &SqlitePool,
    entries: &HashMap<i64, (i64, f64)>,
) -> Result<(), EngineError> {
    let mut tx = pool.begin().await.map_err(db_fatal)?;
    let now = now();

    for (id, (downloaded, progress)) in entries {
        sqlx::query(
            "UPDATE downloads SET downloaded_bytes = ?, progress = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(downloaded)
        .bind(progress)
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(db_fatal)?;
    }

    tx.commit().await.map_err(db_fatal)?;
    Ok(())
}

fn now() -> NaiveDateTime {
    chrono::Utc::now().naive_utc()
}

fn db_fatal(err: sqlx::Error) -> EngineError {
    EngineError::Fatal(format!("database error: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::state_machine::ChunkState;
    use crate::engine::state_machine::DownloadState::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn open_store() -> SqliteStateStore {
        SqliteStateStore::open_in_memory(500, Duration::from_millis(50))
            .await
            .unwrap()
    }

    fn new_download(url: &str) -> NewDownload {
        NewDownload {
            title: "Test file".into(),
            url: url.into(),
            save_path: "/tmp/test.bin".into(),
            temp_base: "/tmp/depot".into(),
            total_bytes: 1024,
            priority: 2,
            force_overwrite: false,
            expected_hash: None,
            start_paused: false,
            skip_queue_limit: false,
        }
    }

    #[tokio::test]
    async fn test_add_and_get() {
        let store = open_store().await;
        let row = store.add(new_download("http://x/a")).await.unwrap();

        assert_eq!(row.state, Queued);
        assert_eq!(row.total_bytes, 1024);
        assert_eq!(row.queue_position, 1);

        let fetched = store.get(row.id).await.unwrap().unwrap();
        assert_eq!(fetched.url, "http://x/a");
        store.close().await;
    }

    #[tokio::test]
    async fn test_queue_positions_increment() {
        let store = open_store().await;
        let a = store.add(new_download("http://x/a")).await.unwrap();
        let b = store.add(new_download("http://x/b")).await.unwrap();
        assert_eq!(b.queue_position, a.queue_position + 1);
        store.close().await;
    }

    #[tokio::test]
    async fn test_queue_full() {
        let store = SqliteStateStore::open_in_memory(1, Duration::from_millis(50))
            .await
            .unwrap();
        store.add(new_download("http://x/a")).await.unwrap();

        let err = store.add(new_download("http://x/b")).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::State(StateError::QueueFull { max: 1 })
        ));

        // skip_queue_limit bypasses the check
        let mut bypass = new_download("http://x/c");
        bypass.skip_queue_limit = true;
        store.add(bypass).await.unwrap();
        store.close().await;
    }

    #[tokio::test]
    async fn test_duplicate_rejected() {
        let store = open_store().await;
        store.add(new_download("http://x/a")).await.unwrap();
        let err = store.add(new_download("http://x/a")).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::State(StateError::Duplicate { .. })
        ));
        store.close().await;
    }

    #[tokio::test]
    async fn test_transition_cas() {
        let store = open_store().await;
        let row = store.add(new_download("http://x/a")).await.unwrap();

        store.transition(row.id, Starting, Some(Queued)).await.unwrap();
        store.transition(row.id, Downloading, None).await.unwrap();

        // CAS mismatch
        let err = store
            .transition(row.id, Paused, Some(Queued))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::State(StateError::InvalidTransition { .. })
        ));

        // Disallowed edge
        let err = store
            .transition(row.id, Completed, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::State(StateError::InvalidTransition { .. })
        ));
        store.close().await;
    }

    #[tokio::test]
    async fn test_state_version_monotonic() {
        let store = open_store().await;
        let v0 = store.current_version().await.unwrap();

        let row = store.add(new_download("http://x/a")).await.unwrap();
        let v1 = store.current_version().await.unwrap();
        assert!(v1 > v0);

        store.transition(row.id, Starting, None).await.unwrap();
        let v2 = store.current_version().await.unwrap();
        assert!(v2 > v1);

        store.delete(row.id).await.unwrap();
        let v3 = store.current_version().await.unwrap();
        assert!(v3 > v2, "deletes must bump the version");
        store.close().await;
    }

    #[tokio::test]
    async fn test_snapshot_change_detection() {
        let store = open_store().await;
        store.add(new_download("http://x/a")).await.unwrap();

        let snap = store.snapshot(None).await.unwrap();
        assert!(snap.has_changes);
        assert_eq!(snap.downloads.len(), 1);
        assert_eq!(snap.summary.queued, 1);

        // Same version, nothing active: no changes
        let again = store.snapshot(Some(snap.state_version)).await.unwrap();
        assert!(!again.has_changes);

        // Active downloads always report changes
        store
            .transition(snap.downloads[0].id, Starting, None)
            .await
            .unwrap();
        let active = store.snapshot(Some(i64::MAX)).await.unwrap();
        assert!(active.has_changes);
        store.close().await;
    }

    #[tokio::test]
    async fn test_incremental_snapshot_reports_deletions() {
        let store = open_store().await;
        let a = store.add(new_download("http://x/a")).await.unwrap();
        let b = store.add(new_download("http://x/b")).await.unwrap();

        let since = chrono::Utc::now().naive_utc() + chrono::Duration::seconds(1);
        store.delete(a.id).await.unwrap();

        let inc = store.incremental_snapshot(since, None).await.unwrap();
        assert!(inc.updated.is_empty());
        assert_eq!(inc.current_ids, vec![b.id]);
        store.close().await;
    }

    #[tokio::test]
    async fn test_chunk_crud() {
        let store = open_store().await;
        let row = store.add(new_download("http://x/a")).await.unwrap();

        let chunks = store
            .create_chunks(
                row.id,
                vec![
                    NewChunk {
                        chunk_index: 0,
                        start_byte: 0,
                        end_byte: 511,
                        temp_path: "/tmp/depot/1/chunk_0".into(),
                    },
                    NewChunk {
                        chunk_index: 1,
                        start_byte: 512,
                        end_byte: 1023,
                        temp_path: "/tmp/depot/1/chunk_1".into(),
                    },
                ],
            )
            .await
            .unwrap();

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].state, ChunkState::Pending);
        assert_eq!(chunks[1].start_byte, 512);

        store
            .update_chunk(
                row.id,
                0,
                ChunkPatch {
                    downloaded_bytes: Some(512),
                    state: Some(ChunkState::Completed),
                    hash: Some(Some("abc123".into())),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let chunks = store.get_chunks(row.id).await.unwrap();
        assert_eq!(chunks[0].state, ChunkState::Completed);
        assert_eq!(chunks[0].downloaded_bytes, 512);
        assert_eq!(chunks[0].hash.as_deref(), Some("abc123"));

        store.delete_chunks(row.id).await.unwrap();
        assert!(store.get_chunks(row.id).await.unwrap().is_empty());
        store.close().await;
    }

    #[tokio::test]
    async fn test_progress_batching_lossless() {
        let store = open_store().await;
        let row = store.add(new_download("http://x/a")).await.unwrap();

        // Many submissions; only the last values must survive the flush
        for i in 1..=10 {
            store.submit_progress(row.id, i * 100, i as f64 / 10.0).await;
        }
        store.flush_progress().await.unwrap();

        let fetched = store.get(row.id).await.unwrap().unwrap();
        assert_eq!(fetched.downloaded_bytes, 1000);
        assert!((fetched.progress - 1.0).abs() < f64::EPSILON);
        store.close().await;
    }

    #[tokio::test]
    async fn test_progress_only_update_is_batched() {
        let store = open_store().await;
        let row = store.add(new_download("http://x/a")).await.unwrap();

        let merged = store
            .update(
                row.id,
                DownloadPatch {
                    downloaded_bytes: Some(200),
                    progress: Some(0.2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(merged.downloaded_bytes, 200);

        // Not yet on disk until a flush happens
        let on_disk = store.get(row.id).await.unwrap().unwrap();
        assert_eq!(on_disk.downloaded_bytes, 0);

        store.flush_progress().await.unwrap();
        let on_disk = store.get(row.id).await.unwrap().unwrap();
        assert_eq!(on_disk.downloaded_bytes, 200);
        store.close().await;
    }

    #[tokio::test]
    async fn test_non_progress_update_forces_flush() {
        let store = open_store().await;
        let row = store.add(new_download("http://x/a")).await.unwrap();

        store.submit_progress(row.id, 300, 0.3).await;
        store
            .update(
                row.id,
                DownloadPatch {
                    retry_count: Some(1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // The batched progress landed before the retry_count write
        let on_disk = store.get(row.id).await.unwrap().unwrap();
        assert_eq!(on_disk.downloaded_bytes, 300);
        assert_eq!(on_disk.retry_count, 1);
        store.close().await;
    }

    #[tokio::test]
    async fn test_recovery_requeues_active() {
        let store = open_store().await;
        let row = store.add(new_download("http://x/a")).await.unwrap();
        store.transition(row.id, Starting, None).await.unwrap();
        store.transition(row.id, Downloading, None).await.unwrap();

        // Simulate the crash-recovery pass
        store.recover().await.unwrap();

        let fetched = store.get(row.id).await.unwrap().unwrap();
        assert_eq!(fetched.state, Queued);
        store.close().await;
    }

    #[tokio::test]
    async fn test_attempts_log() {
        let store = open_store().await;
        let row = store.add(new_download("http://x/a")).await.unwrap();

        store
            .record_attempt(NewAttempt {
                download_id: row.id,
                chunk_id: None,
                attempt_number: 1,
                error_text: Some("connection reset".into()),
                error_code: Some("connection_reset".into()),
                bytes_transferred: 4096,
            })
            .await
            .unwrap();

        let attempts = store.attempts_for(row.id).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].error_code.as_deref(), Some("connection_reset"));
        store.close().await;
    }

    #[tokio::test]
    async fn test_transition_observer_fires() {
        struct Counting {
            exits: AtomicUsize,
            enters: AtomicUsize,
        }

        #[async_trait]
        impl TransitionObserver for Counting {
            async fn on_exit(&self, _download: &DownloadRow, _from: DownloadState) {
                self.exits.fetch_add(1, Ordering::SeqCst);
            }
            async fn on_enter(&self, _download: &DownloadRow, _to: DownloadState) {
                self.enters.fetch_add(1, Ordering::SeqCst);
            }
        }

        let store = open_store().await;
        let observer = Arc::new(Counting {
            exits: AtomicUsize::new(0),
            enters: AtomicUsize::new(0),
        });
        store.set_transition_observer(observer.clone());

        let row = store.add(new_download("http://x/a")).await.unwrap();
        store.transition(row.id, Starting, None).await.unwrap();

        assert_eq!(observer.exits.load(Ordering::SeqCst), 1);
        assert_eq!(observer.enters.load(Ordering::SeqCst), 1);
        store.close().await;
    }

    #[tokio::test]
    async fn test_clear_finished() {
        let store = open_store().await;
        let a = store.add(new_download("http://x/a")).await.unwrap();
        let b = store.add(new_download("http://x/b")).await.unwrap();

        store.transition(a.id, Failed, None).await.unwrap();

        let removed = store.clear_finished(&[Failed, Completed]).await.unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, a.id);
        assert!(store.get(a.id).await.unwrap().is_none());
        assert!(store.get(b.id).await.unwrap().is_some());
        store.close().await;
    }

    #[tokio::test]
    async fn test_history() {
        let store = open_store().await;
        store
            .record_history(NewHistory {
                download_id: 1,
                title: "t".into(),
                url: "http://x/a".into(),
                save_path: "/tmp/a".into(),
                total_bytes: 100,
                outcome: "completed".into(),
                duration_ms: Some(1200),
            })
            .await
            .unwrap();

        let rows = store.list_history(10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].outcome, "completed");

        store.clear_history().await.unwrap();
        assert!(store.list_history(10).await.unwrap().is_empty());
        store.close().await;
    }
}
