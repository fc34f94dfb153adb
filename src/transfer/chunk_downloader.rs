use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::db::models::{ChunkPatch, ChunkRow, DownloadRow, NewAttempt, NewChunk};
use crate::db::store::StateStore;
use crate::engine::concurrency::ConcurrencyController;
use crate::engine::session::{SessionRegistry, SessionToken};
use crate::engine::state_machine::ChunkState;
use crate::error::{EngineError, IntegrityKind, TimeoutKind};
use crate::events::{EngineEvent, EventBus};
use crate::transfer::assembler::IncrementalMerger;
use crate::transfer::buffer_pool::BufferPool;
use crate::transfer::checkpoint::{self, TailCheckpoint};
use crate::transfer::chunk_sizer;
use crate::transfer::chunk_store::ChunkStore;
use crate::transfer::metrics::{HostMetrics, host_of};
use crate::transfer::progress::ProgressAggregator;
use crate::transfer::response::{ChunkOutcome, ResponseHandler};
use crate::transfer::retry;

/// Pause between slot-acquisition attempts when the controller is saturated.
const SLOT_WAIT: Duration = Duration::from_millis(100);

/// How one download's chunk phase ended.
#[derive(Debug)]
pub enum DownloadOutcome {
    /// Every chunk is COMPLETED. Carries the incremental merge session when
    /// it kept up with completions; the engine finalizes or falls back to
    /// the post-hoc merger.
    ChunksDone {
        merger: Option<IncrementalMerger>,
    },
    /// The session was fenced out (pause/cancel); torn down quietly.
    Cancelled,
}

/// Orchestrates all chunks of a single download: reconcile or plan, run the
/// bounded worker loop, batch retries with a shared backoff, and keep the
/// incremental merge session fed.
#[derive(Clone)]
pub struct ChunkDownloader {
    config: Arc<EngineConfig>,
    store: Arc<dyn StateStore>,
    chunk_store: Arc<ChunkStore>,
    aggregator: Arc<ProgressAggregator>,
    metrics: Arc<HostMetrics>,
    sessions: Arc<SessionRegistry>,
    events: Arc<EventBus>,
    concurrency: Arc<ConcurrencyController>,
    buffer_pool: Arc<BufferPool>,
    client: reqwest::Client,
    handler: Arc<ResponseHandler>,
}

impl ChunkDownloader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<EngineConfig>,
        store: Arc<dyn StateStore>,
        chunk_store: Arc<ChunkStore>,
        aggregator: Arc<ProgressAggregator>,
        metrics: Arc<HostMetrics>,
        sessions: Arc<SessionRegistry>,
        events: Arc<EventBus>,
        concurrency: Arc<ConcurrencyController>,
        buffer_pool: Arc<BufferPool>,
        client: reqwest::Client,
    ) -> Self {
        let handler = Arc::new(ResponseHandler::new(
            config.clone(),
            store.clone(),
            aggregator.clone(),
            metrics.clone(),
            sessions.clone(),
            events.clone(),
        ));
        Self {
            config,
            store,
            chunk_store,
            aggregator,
            metrics,
            sessions,
            events,
            concurrency,
            buffer_pool,
            client,
            handler,
        }
    }

    /// Run the chunk phase for one download under the given session.
    pub async fn run(
        &self,
        download: &DownloadRow,
        token: &SessionToken,
    ) -> Result<DownloadOutcome, EngineError> {
        let host = host_of(&download.url).unwrap_or_default();

        let mut chunks = self.prepare_chunks(download).await?;
        self.seed_aggregator(download.id, &chunks).await;

        let mut merger = self.open_merge_session(download, chunks.len() as u32).await;

        let mut pending: VecDeque<u32> = chunks
            .iter()
            .filter(|c| c.state != ChunkState::Completed)
            .map(|c| c.chunk_index as u32)
            .collect();
        // Already-completed chunks (resume) still need to reach the merger
        let mut merged_complete = false;
        let mut merge_broken = false;
        if let Some(ref mut session) = merger {
            for chunk in chunks.iter().filter(|c| c.state == ChunkState::Completed) {
                match session
                    .on_chunk_completed(chunk.chunk_index as u32, Path::new(&chunk.temp_path))
                    .await
                {
                    Ok(done) => merged_complete = done,
                    Err(e) => {
                        warn!(
                            "Incremental merge failed for download {}: {e}; \
                             falling back to post-hoc",
                            download.id
                        );
                        merge_broken = true;
                        break;
                    }
                }
            }
        }
        if merge_broken {
            if let Some(session) = merger.take() {
                session.discard().await;
            }
        }

        let mut active: JoinSet<(u32, Result<ChunkOutcome, EngineError>)> = JoinSet::new();
        let mut retry_counts: HashMap<u32, u32> = HashMap::new();
        let mut retry_batch: Vec<(u32, EngineError)> = Vec::new();
        let max_retries = self.config.downloads.max_chunk_retries;
        let per_download_limit = self.config.downloads.max_concurrent;

        loop {
            if !self.sessions.is_current(token).await {
                active.abort_all();
                self.concurrency.release_all(download.id);
                return Ok(DownloadOutcome::Cancelled);
            }

            // Fill available slots from the pending queue
            while !pending.is_empty()
                && active.len() < per_download_limit
                && self.concurrency.acquire_chunk_slot(download.id, &host)
            {
                let index = pending.pop_front().unwrap();
                let worker = self.clone();
                let download = download.clone();
                let token = token.clone();
                let host = host.clone();
                active.spawn(async move {
                    let result = worker
                        .download_single_chunk(&download, index, &token, &host)
                        .await;
                    (index, result)
                });
            }

            if active.is_empty() {
                if !retry_batch.is_empty() {
                    let requeued = self
                        .run_retry_batch(download, token, &mut retry_batch, &retry_counts)
                        .await?;
                    if let Some(indices) = requeued {
                        pending.extend(indices);
                        continue;
                    }
                    // Session went stale during the backoff sleep
                    return Ok(DownloadOutcome::Cancelled);
                }
                if pending.is_empty() {
                    break;
                }
                // Slots exhausted engine-wide; wait for headroom
                tokio::time::sleep(SLOT_WAIT).await;
                continue;
            }

            let joined = active.join_next().await;
            let Some(joined) = joined else { continue };

            self.concurrency.release_chunk_slot(download.id, &host);

            let (index, result) = match joined {
                Ok(pair) => pair,
                Err(join_err) => {
                    if join_err.is_cancelled() {
                        continue;
                    }
                    return Err(EngineError::Fatal(format!(
                        "chunk worker panicked: {join_err}"
                    )));
                }
            };

            match result {
                Ok(ChunkOutcome::Completed { .. }) => {
                    self.events
                        .publish(EngineEvent::ChunkCompleted {
                            download_id: download.id,
                            chunk_index: index,
                        })
                        .await;

                    let mut merge_broken = false;
                    if let Some(ref mut session) = merger {
                        let path = self.chunk_store.chunk_path(download.id, index);
                        match session.on_chunk_completed(index, &path).await {
                            Ok(done) => {
                                if done {
                                    merged_complete = true;
                                }
                            }
                            Err(e) => {
                                warn!(
                                    "Incremental merge failed for download {}: {e}; \
                                     falling back to post-hoc",
                                    download.id
                                );
                                merge_broken = true;
                            }
                        }
                    }
                    if merge_broken {
                        if let Some(session) = merger.take() {
                            session.discard().await;
                        }
                    }
                }
                Ok(ChunkOutcome::SessionStale) => {
                    active.abort_all();
                    self.concurrency.release_all(download.id);
                    return Ok(DownloadOutcome::Cancelled);
                }
                Ok(ChunkOutcome::RangeIgnored) => {
                    // The server does not honor ranges for this resource;
                    // restart as a single direct download
                    info!(
                        "Download {}: server ignored Range; replanning as direct download",
                        download.id
                    );
                    active.abort_all();
                    while active.join_next().await.is_some() {}
                    self.concurrency.release_all(download.id);

                    if let Some(session) = merger.take() {
                        session.discard().await;
                    }

                    chunks = self.replan_single_chunk(download).await?;
                    self.seed_aggregator(download.id, &chunks).await;
                    merger = self.open_merge_session(download, 1).await;
                    pending = chunks.iter().map(|c| c.chunk_index as u32).collect();
                    retry_counts.clear();
                    retry_batch.clear();
                    merged_complete = false;
                }
                Err(err) => {
                    let retries = retry_counts.entry(index).or_insert(0);
                    *retries += 1;

                    let chunk_row_id = chunks
                        .iter()
                        .find(|c| c.chunk_index as u32 == index)
                        .map(|c| c.id);
                    let _ = self
                        .store
                        .record_attempt(NewAttempt {
                            download_id: download.id,
                            chunk_id: chunk_row_id,
                            attempt_number: *retries as i64,
                            error_text: Some(err.to_string()),
                            error_code: Some(err.code().to_string()),
                            bytes_transferred: self
                                .aggregator
                                .total_downloaded(download.id)
                                .await as i64,
                        })
                        .await;

                    let exhausted = *retries > max_retries;
                    let retryable = chunk_retryable(&err) && !exhausted;

                    self.events
                        .publish(EngineEvent::ChunkFailed {
                            download_id: download.id,
                            chunk_index: index,
                            error: err.to_string(),
                            will_retry: retryable,
                        })
                        .await;

                    if !retryable {
                        warn!(
                            "Download {} chunk {} failed terminally after {} attempt(s): {err}",
                            download.id, index, retries
                        );
                        active.abort_all();
                        self.concurrency.release_all(download.id);
                        return Err(if exhausted {
                            EngineError::Fatal(format!(
                                "chunk {index} exhausted {max_retries} retries: {err}"
                            ))
                        } else {
                            err
                        });
                    }

                    retry_batch.push((index, err));
                }
            }
        }

        if !self.aggregator.all_completed(download.id).await {
            // Belt-and-braces: the loop only exits cleanly when nothing is
            // pending, so every chunk must be complete by now
            return Err(EngineError::Fatal(format!(
                "download {} finished its loop with incomplete chunks",
                download.id
            )));
        }

        Ok(DownloadOutcome::ChunksDone {
            merger: if merged_complete { merger } else { None },
        })
    }

    /// Reconcile existing chunk rows against disk, or plan fresh ones.
    async fn prepare_chunks(
        &self,
        download: &DownloadRow,
    ) -> Result<Vec<ChunkRow>, EngineError> {
        let existing = self.store.get_chunks(download.id).await?;

        if existing.is_empty() {
            return self.plan_new_chunks(download).await;
        }

        let report = self
            .chunk_store
            .reconcile_chunks(download.id, &existing)
            .await
            .map_err(|e| EngineError::Disk(e.to_string()))?;

        for index in report.orphaned.iter() {
            // Files for unknown indices are stale garbage
            let _ = self.chunk_store.delete_chunk(download.id, *index).await;
        }

        for chunk in &existing {
            let index = chunk.chunk_index as u32;
            let canonical = self
                .chunk_store
                .chunk_path(download.id, index)
                .display()
                .to_string();

            let needs_reset = report.missing.contains(&index)
                || report.mismatched.contains(&index)
                || chunk.state == ChunkState::Downloading;
            let stale_path = chunk.temp_path != canonical;

            if needs_reset || stale_path {
                if needs_reset {
                    let _ = self.chunk_store.delete_chunk(download.id, index).await;
                }
                self.store
                    .update_chunk(
                        download.id,
                        index,
                        ChunkPatch {
                            state: needs_reset.then_some(ChunkState::Pending),
                            downloaded_bytes: needs_reset.then_some(0),
                            temp_path: stale_path.then_some(canonical),
                            ..Default::default()
                        },
                    )
                    .await?;
            }
        }

        self.chunk_store
            .create_chunk_dir(download.id)
            .await
            .map_err(|e| EngineError::Disk(e.to_string()))?;

        self.store.get_chunks(download.id).await
    }

    async fn plan_new_chunks(
        &self,
        download: &DownloadRow,
    ) -> Result<Vec<ChunkRow>, EngineError> {
        let host = host_of(&download.url).unwrap_or_default();
        let total = download.total_bytes as u64;

        let ranges = if self.config.downloads.disable_chunked_downloads {
            if total > 0 {
                vec![(0, total - 1)]
            } else {
                Vec::new()
            }
        } else {
            chunk_sizer::plan_chunks(
                &self.config.chunking,
                total,
                self.metrics.avg_speed_bps(&host),
                self.metrics.speed_samples(&host),
            )
        };

        self.chunk_store
            .create_chunk_dir(download.id)
            .await
            .map_err(|e| EngineError::Disk(e.to_string()))?;

        let news: Vec<NewChunk> = ranges
            .iter()
            .enumerate()
            .map(|(i, (start, end))| NewChunk {
                chunk_index: i as u32,
                start_byte: *start,
                end_byte: *end,
                temp_path: self
                    .chunk_store
                    .chunk_path(download.id, i as u32)
                    .display()
                    .to_string(),
            })
            .collect();

        info!(
            "Download {}: planned {} chunk(s) over {} bytes",
            download.id,
            news.len(),
            total
        );
        self.store.create_chunks(download.id, news).await
    }

    async fn replan_single_chunk(
        &self,
        download: &DownloadRow,
    ) -> Result<Vec<ChunkRow>, EngineError> {
        self.store.delete_chunks(download.id).await?;
        let _ = self.chunk_store.delete_all_chunks(download.id).await;
        self.chunk_store
            .create_chunk_dir(download.id)
            .await
            .map_err(|e| EngineError::Disk(e.to_string()))?;

        let total = download.total_bytes as u64;
        self.store
            .create_chunks(
                download.id,
                vec![NewChunk {
                    chunk_index: 0,
                    start_byte: 0,
                    end_byte: total.saturating_sub(1),
                    temp_path: self
                        .chunk_store
                        .chunk_path(download.id, 0)
                        .display()
                        .to_string(),
                }],
            )
            .await
    }

    async fn seed_aggregator(&self, download_id: i64, chunks: &[ChunkRow]) {
        let seed: Vec<(u32, u64, u64, ChunkState)> = chunks
            .iter()
            .map(|c| {
                (
                    c.chunk_index as u32,
                    c.size(),
                    c.downloaded_bytes as u64,
                    c.state,
                )
            })
            .collect();
        self.aggregator.init(download_id, &seed).await;
    }

    async fn open_merge_session(
        &self,
        download: &DownloadRow,
        total_chunks: u32,
    ) -> Option<IncrementalMerger> {
        match IncrementalMerger::create(
            download.id,
            &download.save_path,
            total_chunks,
            download.total_bytes as u64,
            self.buffer_pool.clone(),
        )
        .await
        {
            Ok(session) => Some(session),
            Err(e) => {
                warn!(
                    "Could not open incremental merge session for download {}: {e}; \
                     will merge post-hoc",
                    download.id
                );
                None
            }
        }
    }

    /// Sleep out the shared backoff for a failed batch and reset its chunks
    /// to pending. Returns None when the session went stale mid-sleep.
    async fn run_retry_batch(
        &self,
        download: &DownloadRow,
        token: &SessionToken,
        retry_batch: &mut Vec<(u32, EngineError)>,
        retry_counts: &HashMap<u32, u32>,
    ) -> Result<Option<Vec<u32>>, EngineError> {
        let batch = std::mem::take(retry_batch);
        let indices: Vec<u32> = batch.iter().map(|(i, _)| *i).collect();

        // 429/503 responses drive the delay from the server's own hint:
        // the maximum observed Retry-After, floored by the configured default
        let overload_delay = batch
            .iter()
            .filter_map(|(_, err)| match err {
                EngineError::HttpStatus { code: 429, retry_after_ms }
                | EngineError::HttpStatus { code: 503, retry_after_ms } => {
                    Some(retry_after_ms.unwrap_or(0))
                }
                _ => None,
            })
            .max()
            .map(|max_ms| {
                let floor = self.config.network.default_retry_after_secs * 1000;
                Duration::from_millis(max_ms.max(floor))
            });

        let delay = overload_delay.unwrap_or_else(|| {
            let round = indices
                .iter()
                .filter_map(|i| retry_counts.get(i))
                .copied()
                .max()
                .unwrap_or(1);
            let representative = batch.first().map(|(_, err)| err);
            retry::compute_delay(&self.config.retry, round.saturating_sub(1), representative)
        });

        info!(
            "Download {}: retrying {} chunk(s) in {:?}",
            download.id,
            indices.len(),
            delay
        );

        for index in &indices {
            let _ = self.chunk_store.delete_chunk(download.id, *index).await;
            self.aggregator.reset_chunk(download.id, *index).await;
            self.store
                .update_chunk(
                    download.id,
                    *index,
                    ChunkPatch {
                        state: Some(ChunkState::Pending),
                        downloaded_bytes: Some(0),
                        hash: Some(None),
                        ..Default::default()
                    },
                )
                .await?;
        }

        // The backoff is a cancellation point: sleep in steps so a fenced
        // session unwinds promptly instead of after the whole delay
        let deadline = tokio::time::Instant::now() + delay;
        loop {
            if !self.sessions.is_current(token).await {
                return Ok(None);
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            tokio::time::sleep(remaining.min(SLOT_WAIT)).await;
        }

        Ok(Some(indices))
    }

    /// Fetch one chunk: pre-checks, the ranged request, then the response
    /// handler. The whole operation runs under the chunk-operation budget.
    async fn download_single_chunk(
        &self,
        download: &DownloadRow,
        chunk_index: u32,
        token: &SessionToken,
        host: &str,
    ) -> Result<ChunkOutcome, EngineError> {
        let budget =
            Duration::from_secs(self.config.downloads.chunk_operation_timeout_minutes * 60);
        match tokio::time::timeout(
            budget,
            self.download_single_chunk_inner(download, chunk_index, token, host),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout(TimeoutKind::Operation)),
        }
    }

    async fn download_single_chunk_inner(
        &self,
        download: &DownloadRow,
        chunk_index: u32,
        token: &SessionToken,
        host: &str,
    ) -> Result<ChunkOutcome, EngineError> {
        if !self.sessions.is_current(token).await {
            return Ok(ChunkOutcome::SessionStale);
        }

        let chunks = self.store.get_chunks(download.id).await?;
        let mut chunk = chunks
            .into_iter()
            .find(|c| c.chunk_index as u32 == chunk_index)
            .ok_or_else(|| {
                EngineError::Fatal(format!(
                    "chunk {chunk_index} of download {} vanished",
                    download.id
                ))
            })?;

        let expected = chunk.size();
        let path = Path::new(&chunk.temp_path).to_path_buf();

        // A chunk already marked complete only needs its file verified
        if chunk.state == ChunkState::Completed {
            let on_disk = tokio::fs::metadata(&path).await.map(|m| m.len()).ok();
            if on_disk == Some(expected) {
                self.aggregator.mark_completed(download.id, chunk_index).await;
                return Ok(ChunkOutcome::Completed { hash: chunk.hash });
            }
            debug!(
                "Download {} chunk {} marked complete but file is {:?}; resetting",
                download.id, chunk_index, on_disk
            );
            self.reset_chunk(download.id, &mut chunk, &path).await?;
        }

        let on_disk = tokio::fs::metadata(&path).await.map(|m| m.len()).ok();
        match on_disk {
            Some(size) if size > expected => {
                // Overlong partials cannot be trusted
                self.reset_chunk(download.id, &mut chunk, &path).await?;
            }
            Some(size) if size > 0 && size < expected => {
                if let (Some(hash), Some(tail_size)) = (&chunk.tail_hash, chunk.tail_size) {
                    let stored = TailCheckpoint {
                        hash: hash.clone(),
                        size: tail_size as u64,
                    };
                    let ok = checkpoint::verify_tail_checkpoint(&path, &stored)
                        .await
                        .unwrap_or(false);
                    if !ok {
                        debug!(
                            "Download {} chunk {} failed its tail checkpoint; restarting",
                            download.id, chunk_index
                        );
                        self.reset_chunk(download.id, &mut chunk, &path).await?;
                    } else if chunk.downloaded_bytes as u64 != size {
                        // Bring the recorded offset in line with the
                        // verified on-disk bytes
                        chunk.downloaded_bytes = size as i64;
                        self.store
                            .update_chunk(
                                download.id,
                                chunk_index,
                                ChunkPatch {
                                    downloaded_bytes: Some(size as i64),
                                    ..Default::default()
                                },
                            )
                            .await?;
                    }
                }
            }
            _ => {}
        }

        if chunk.downloaded_bytes as u64 >= expected {
            self.store
                .update_chunk(
                    download.id,
                    chunk_index,
                    ChunkPatch {
                        state: Some(ChunkState::Completed),
                        ..Default::default()
                    },
                )
                .await?;
            self.aggregator.mark_completed(download.id, chunk_index).await;
            return Ok(ChunkOutcome::Completed { hash: chunk.hash });
        }

        self.store
            .update_chunk(
                download.id,
                chunk_index,
                ChunkPatch {
                    state: Some(ChunkState::Downloading),
                    ..Default::default()
                },
            )
            .await?;
        self.aggregator
            .update_state(download.id, chunk_index, ChunkState::Downloading)
            .await;

        let range_start = chunk.start_byte as u64 + chunk.downloaded_bytes as u64;
        let origin = url::Url::parse(&download.url)
            .ok()
            .map(|u| format!("{}://{}/", u.scheme(), u.host_str().unwrap_or_default()));

        let mut request = self
            .client
            .get(&download.url)
            .header(reqwest::header::RANGE, format!("bytes={}-{}", range_start, chunk.end_byte))
            .header(reqwest::header::ACCEPT, "*/*")
            .header(reqwest::header::CONNECTION, "keep-alive")
            .header(reqwest::header::CACHE_CONTROL, "no-store");
        if let Some(origin) = origin {
            request = request.header(reqwest::header::REFERER, origin);
        }

        let response_budget = Duration::from_secs(self.config.network.response_timeout_secs);
        let response = match tokio::time::timeout(response_budget, request.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                return Err(EngineError::TransientNetwork {
                    category: retry::classify_reqwest(&err),
                    message: err.to_string(),
                    retry_after_ms: None,
                });
            }
            Err(_) => return Err(EngineError::Timeout(TimeoutKind::Response)),
        };

        self.handler
            .consume(token, download, &chunk, host, response)
            .await
    }

    async fn reset_chunk(
        &self,
        download_id: i64,
        chunk: &mut ChunkRow,
        path: &Path,
    ) -> Result<(), EngineError> {
        if path.exists() {
            tokio::fs::remove_file(path).await?;
        }
        chunk.downloaded_bytes = 0;
        chunk.state = ChunkState::Pending;
        chunk.hash = None;
        chunk.tail_hash = None;
        chunk.tail_size = None;
        self.aggregator
            .reset_chunk(download_id, chunk.chunk_index as u32)
            .await;
        self.store
            .update_chunk(
                download_id,
                chunk.chunk_index as u32,
                ChunkPatch {
                    state: Some(ChunkState::Pending),
                    downloaded_bytes: Some(0),
                    hash: Some(None),
                    tail_hash: Some(None),
                    tail_size: Some(None),
                    ..Default::default()
                },
            )
            .await
    }

    /// Persist a tail checkpoint for every chunk currently DOWNLOADING.
    /// Runs before a pause so resume can prove the partials are intact.
    pub async fn save_checkpoints_for_pause(&self, download_id: i64) -> Result<(), EngineError> {
        let chunks = self.store.get_chunks(download_id).await?;
        for chunk in chunks {
            if chunk.state != ChunkState::Downloading {
                continue;
            }
            let path = Path::new(&chunk.temp_path);
            if !path.exists() {
                continue;
            }
            match checkpoint::compute_tail_checkpoint(path).await {
                Ok(cp) => {
                    self.store
                        .update_chunk(
                            download_id,
                            chunk.chunk_index as u32,
                            ChunkPatch {
                                state: Some(ChunkState::Pending),
                                downloaded_bytes: Some(cp.size as i64),
                                tail_hash: Some(Some(cp.hash)),
                                tail_size: Some(Some(cp.size as i64)),
                                ..Default::default()
                            },
                        )
                        .await?;
                }
                Err(e) => {
                    warn!(
                        "Could not checkpoint chunk {} of download {}: {e}",
                        chunk.chunk_index, download_id
                    );
                }
            }
        }
        Ok(())
    }
}

/// Whether an error takes the standard chunk retry path. Short reads are
/// retried with a fresh file alongside the transient categories.
fn chunk_retryable(err: &EngineError) -> bool {
    err.is_retryable()
        || matches!(
            err,
            EngineError::Integrity(IntegrityKind::ChunkIncomplete { .. })
        )
}
