use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::db::models::{ChunkRow, DownloadRow};
use crate::db::store::StateStore;
use crate::engine::session::{SessionRegistry, SessionToken};
use crate::engine::state_machine::ChunkState;
use crate::error::{EngineError, IntegrityKind};
use crate::transfer::buffer_pool::BufferPool;
use crate::transfer::progress::ProgressAggregator;

/// Post-hoc copy loop reads this much per read call.
const MERGE_READ_BUF: usize = 16 * 1024 * 1024;

/// Bytes accumulated before the post-hoc loop flushes and yields.
const MERGE_FLUSH_BATCH: usize = 8 * 1024 * 1024;

const ASSEMBLY_EMA_ALPHA: f64 = 0.3;

pub fn staging_path(save_path: &str) -> PathBuf {
    PathBuf::from(format!("{save_path}.staging"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Completed,
    /// The session was invalidated mid-merge; the caller owns cleanup
    Cancelled,
}

/// Strategy seam for producing the final artifact from completed chunks.
/// The engine picks the incremental session when one ran to completion and
/// falls back to the post-hoc merger otherwise.
#[async_trait]
pub trait Assembler: Send {
    async fn assemble(
        &mut self,
        download: &DownloadRow,
        chunks: &[ChunkRow],
    ) -> Result<MergeOutcome, EngineError>;
}

/// Per-download incremental merge session. Chunks are appended to the
/// staging file in index order as they complete; out-of-order completions
/// queue until the cursor reaches them.
#[derive(Debug)]
pub struct IncrementalMerger {
    download_id: i64,
    staging: PathBuf,
    file: Option<tokio::fs::File>,
    next_index: u32,
    total_chunks: u32,
    total_bytes: u64,
    written: u64,
    /// Completed-but-out-of-order chunk files keyed by index
    ready: HashMap<u32, PathBuf>,
    pool: Arc<BufferPool>,
}

impl IncrementalMerger {
    pub async fn create(
        download_id: i64,
        save_path: &str,
        total_chunks: u32,
        total_bytes: u64,
        pool: Arc<BufferPool>,
    ) -> Result<Self, EngineError> {
        let staging = staging_path(save_path);
        if let Some(parent) = staging.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&staging)
            .await?;

        debug!(
            "Incremental merge session for download {} -> {:?}",
            download_id, staging
        );

        Ok(Self {
            download_id,
            staging,
            file: Some(file),
            next_index: 0,
            total_chunks,
            total_bytes,
            written: 0,
            ready: HashMap::new(),
            pool,
        })
    }

    pub fn is_complete(&self) -> bool {
        self.next_index >= self.total_chunks
    }

    pub fn staging(&self) -> &Path {
        &self.staging
    }

    /// Record a completed chunk. Appends immediately when the chunk is next
    /// in order, then drains any queued successors. Returns true once every
    /// chunk has been appended.
    pub async fn on_chunk_completed(
        &mut self,
        chunk_index: u32,
        chunk_path: &Path,
    ) -> Result<bool, EngineError> {
        self.ready.insert(chunk_index, chunk_path.to_path_buf());

        while let Some(path) = self.ready.remove(&self.next_index) {
            self.append_file(&path).await?;
            self.next_index += 1;
        }

        if self.is_complete() && self.written != self.total_bytes {
            return Err(EngineError::Integrity(IntegrityKind::SizeMismatch {
                expected: self.total_bytes,
                actual: self.written,
            }));
        }

        Ok(self.is_complete())
    }

    async fn append_file(&mut self, path: &Path) -> Result<(), EngineError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| EngineError::Fatal("merge session already finalized".into()))?;

        let mut source = tokio::fs::File::open(path).await?;
        let mut buf = self.pool.acquire();

        loop {
            let read = source.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            file.write_all(&buf[..read]).await?;
            self.written += read as u64;
        }

        self.pool.release(buf);
        Ok(())
    }

    /// Rename staging into place. With `force_overwrite` an existing target
    /// is deleted first; without it an existing target is an error.
    pub async fn finalize(
        &mut self,
        save_path: &str,
        force_overwrite: bool,
    ) -> Result<(), EngineError> {
        if !self.is_complete() {
            return Err(EngineError::Fatal(format!(
                "merge session incomplete: {} of {} chunks appended",
                self.next_index, self.total_chunks
            )));
        }

        if let Some(mut file) = self.file.take() {
            file.flush().await?;
        }

        let target = Path::new(save_path);
        if target.exists() {
            if force_overwrite {
                tokio::fs::remove_file(target).await?;
            } else {
                return Err(EngineError::Disk(format!(
                    "target {save_path} already exists"
                )));
            }
        }

        tokio::fs::rename(&self.staging, target).await?;
        info!(
            "Download {} assembled incrementally into {}",
            self.download_id, save_path
        );
        Ok(())
    }

    /// Delete the staging file and drop the session.
    pub async fn discard(mut self) {
        self.file.take();
        if self.staging.exists() {
            if let Err(e) = tokio::fs::remove_file(&self.staging).await {
                warn!("Failed to remove staging file {:?}: {e}", self.staging);
            }
        }
    }
}

#[async_trait]
impl Assembler for IncrementalMerger {
    async fn assemble(
        &mut self,
        download: &DownloadRow,
        chunks: &[ChunkRow],
    ) -> Result<MergeOutcome, EngineError> {
        // Late arrivals that completed after the last on_chunk_completed call
        for chunk in chunks {
            let index = chunk.chunk_index as u32;
            if index >= self.next_index && !self.ready.contains_key(&index) {
                self.ready.insert(index, PathBuf::from(&chunk.temp_path));
            }
        }
        while let Some(path) = self.ready.remove(&self.next_index) {
            self.append_file(&path).await?;
            self.next_index += 1;
        }

        self.finalize(&download.save_path, download.force_overwrite)
            .await?;
        Ok(MergeOutcome::Completed)
    }
}

/// Progress of a post-hoc merge: fraction assembled plus an EMA of the
/// assembly speed.
#[derive(Debug, Clone, Copy)]
pub struct AssemblyProgress {
    pub fraction: f64,
    pub speed_bps: u64,
}

/// Worker-backed merge over the full ordered chunk list: pre-checks, hash
/// re-verification, bounded stream-copy into the target, final size check.
pub struct PostHocMerger {
    store: Arc<dyn StateStore>,
    aggregator: Arc<ProgressAggregator>,
    sessions: Arc<SessionRegistry>,
    token: SessionToken,
    progress_tx: Option<tokio::sync::mpsc::UnboundedSender<AssemblyProgress>>,
}

impl PostHocMerger {
    pub fn new(
        store: Arc<dyn StateStore>,
        aggregator: Arc<ProgressAggregator>,
        sessions: Arc<SessionRegistry>,
        token: SessionToken,
    ) -> Self {
        Self {
            store,
            aggregator,
            sessions,
            token,
            progress_tx: None,
        }
    }

    pub fn with_progress(
        mut self,
        tx: tokio::sync::mpsc::UnboundedSender<AssemblyProgress>,
    ) -> Self {
        self.progress_tx = Some(tx);
        self
    }

    async fn failure_reason(&self, download_id: i64) -> Option<String> {
        let attempts = self.store.attempts_for(download_id).await.ok()?;
        attempts.into_iter().rev().find_map(|a| a.error_text)
    }

    async fn pre_check(
        &self,
        download: &DownloadRow,
        chunks: &[ChunkRow],
    ) -> Result<(), EngineError> {
        for chunk in chunks {
            if chunk.state != ChunkState::Completed {
                let reason = self
                    .failure_reason(download.id)
                    .await
                    .unwrap_or_else(|| "unknown cause".to_string());
                return Err(EngineError::Fatal(format!(
                    "cannot merge download {}: chunk {} is {} ({})",
                    download.id,
                    chunk.chunk_index,
                    chunk.state.as_db_str(),
                    reason
                )));
            }

            let path = Path::new(&chunk.temp_path);
            let actual = match tokio::fs::metadata(path).await {
                Ok(m) => m.len(),
                Err(_) => {
                    return Err(EngineError::Fatal(format!(
                        "cannot merge download {}: chunk {} file missing at {:?}",
                        download.id, chunk.chunk_index, path
                    )));
                }
            };
            if actual != chunk.size() {
                return Err(EngineError::Integrity(IntegrityKind::SizeMismatch {
                    expected: chunk.size(),
                    actual,
                }));
            }
        }
        Ok(())
    }

    /// Recompute the hash of chunks whose streaming hash is known. Hashing
    /// runs on the blocking pool so the scheduler stays responsive.
    async fn verify_chunk_hashes(
        &self,
        download: &DownloadRow,
        chunks: &[ChunkRow],
    ) -> Result<(), EngineError> {
        for chunk in chunks {
            let index = chunk.chunk_index as u32;
            let expected = match self.aggregator.get_hash(download.id, index).await {
                Some(hash) => hash,
                None => match &chunk.hash {
                    Some(hash) => hash.clone(),
                    None => continue,
                },
            };

            let path = PathBuf::from(&chunk.temp_path);
            let actual = tokio::task::spawn_blocking(move || sha256_file_blocking(&path))
                .await
                .map_err(|e| EngineError::Fatal(format!("hash worker panicked: {e}")))?
                .map_err(|e| EngineError::Disk(e.to_string()))?;

            if actual != expected {
                return Err(EngineError::Integrity(IntegrityKind::HashMismatch {
                    expected,
                    actual,
                }));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Assembler for PostHocMerger {
    async fn assemble(
        &mut self,
        download: &DownloadRow,
        chunks: &[ChunkRow],
    ) -> Result<MergeOutcome, EngineError> {
        self.pre_check(download, chunks).await?;

        let stale_staging = staging_path(&download.save_path);
        if stale_staging.exists() {
            tokio::fs::remove_file(&stale_staging).await?;
        }

        self.verify_chunk_hashes(download, chunks).await?;

        if !self.sessions.is_current(&self.token).await {
            return Ok(MergeOutcome::Cancelled);
        }

        let target = Path::new(&download.save_path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut out = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(target)
            .await?;

        let total = download.total_bytes as u64;
        let mut assembled = 0u64;
        let mut speed_ema = 0.0f64;
        let mut batch_started = Instant::now();
        let mut read_buf = vec![0u8; MERGE_READ_BUF];
        let mut pending_flush = 0usize;

        let mut ordered: Vec<&ChunkRow> = chunks.iter().collect();
        ordered.sort_by_key(|c| c.chunk_index);

        for chunk in ordered {
            let mut source = tokio::fs::File::open(&chunk.temp_path).await?;
            loop {
                let read = source.read(&mut read_buf).await?;
                if read == 0 {
                    break;
                }
                out.write_all(&read_buf[..read]).await?;
                assembled += read as u64;
                pending_flush += read;

                if pending_flush >= MERGE_FLUSH_BATCH {
                    out.flush().await?;
                    pending_flush = 0;

                    let elapsed = batch_started.elapsed().as_secs_f64().max(0.001);
                    let speed = MERGE_FLUSH_BATCH as f64 / elapsed;
                    speed_ema = if speed_ema == 0.0 {
                        speed
                    } else {
                        ASSEMBLY_EMA_ALPHA * speed + (1.0 - ASSEMBLY_EMA_ALPHA) * speed_ema
                    };
                    batch_started = Instant::now();

                    let progress = AssemblyProgress {
                        fraction: assembled as f64 / total.max(1) as f64,
                        speed_bps: speed_ema as u64,
                    };
                    debug!(
                        "Merge progress for download {}: {:.1}% at {} B/s",
                        download.id,
                        progress.fraction * 100.0,
                        progress.speed_bps
                    );
                    if let Some(ref tx) = self.progress_tx {
                        let _ = tx.send(progress);
                    }

                    if !self.sessions.is_current(&self.token).await {
                        return Ok(MergeOutcome::Cancelled);
                    }
                    tokio::task::yield_now().await;
                }
            }
        }

        out.flush().await?;
        drop(out);

        let final_size = tokio::fs::metadata(target).await?.len();
        if final_size != total {
            return Err(EngineError::Integrity(IntegrityKind::SizeMismatch {
                expected: total,
                actual: final_size,
            }));
        }

        info!(
            "Download {} assembled into {} ({} bytes)",
            download.id, download.save_path, final_size
        );
        Ok(MergeOutcome::Completed)
    }
}

fn sha256_file_blocking(path: &Path) -> std::io::Result<String> {
    use sha2::{Digest, Sha256};
    use std::io::Read;

    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(crate::transfer::checkpoint::encode_hex(&hasher.finalize()))
}
