use futures::StreamExt;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::db::models::{ChunkPatch, ChunkRow, DownloadRow};
use crate::db::store::StateStore;
use crate::engine::session::{SessionRegistry, SessionToken};
use crate::engine::state_machine::ChunkState;
use crate::error::{EngineError, IntegrityKind, TimeoutKind};
use crate::events::{EngineEvent, EventBus};
use crate::transfer::checkpoint::encode_hex;
use crate::transfer::metrics::HostMetrics;
use crate::transfer::progress::ProgressAggregator;
use crate::transfer::retry::{classify_reqwest, parse_retry_after};
use crate::transfer::write_buffer;

/// Cadence of aggregator updates and progress events.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Database writes are coalesced to at most one per this interval.
const DB_WRITE_INTERVAL: Duration = Duration::from_secs(1);

/// Cadence of the idle watchdog.
const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// How a single chunk response ended, short of an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    Completed { hash: Option<String> },
    /// The session changed under us; everything was torn down quietly
    SessionStale,
    /// The server answered 200 to a ranged request for a non-first chunk;
    /// the caller falls back to a single-range plan
    RangeIgnored,
}

/// Consumes one chunk's HTTP response into its temp file: status handling,
/// append-mode verification, streaming hash, progress ticks, and the idle
/// watchdog. Every await point re-checks the session token.
pub struct ResponseHandler {
    config: Arc<EngineConfig>,
    store: Arc<dyn StateStore>,
    aggregator: Arc<ProgressAggregator>,
    metrics: Arc<HostMetrics>,
    sessions: Arc<SessionRegistry>,
    events: Arc<EventBus>,
}

impl ResponseHandler {
    pub fn new(
        config: Arc<EngineConfig>,
        store: Arc<dyn StateStore>,
        aggregator: Arc<ProgressAggregator>,
        metrics: Arc<HostMetrics>,
        sessions: Arc<SessionRegistry>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            store,
            aggregator,
            metrics,
            sessions,
            events,
        }
    }

    pub async fn consume(
        &self,
        token: &SessionToken,
        download: &DownloadRow,
        chunk: &ChunkRow,
        host: &str,
        response: reqwest::Response,
    ) -> Result<ChunkOutcome, EngineError> {
        if !self.sessions.is_current(token).await {
            return Ok(ChunkOutcome::SessionStale);
        }

        let chunk_index = chunk.chunk_index as u32;
        let status = response.status();

        match status {
            StatusCode::PARTIAL_CONTENT | StatusCode::OK => {}
            StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
                let retry_after_ms = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| parse_retry_after(v, &self.config.network))
                    .map(|d| d.as_millis() as u64);

                self.metrics.record_transient_retry(host);
                self.set_chunk_state(download.id, chunk_index, ChunkState::Pending)
                    .await;

                return Err(EngineError::HttpStatus {
                    code: status.as_u16(),
                    retry_after_ms,
                });
            }
            other => {
                self.set_chunk_state(download.id, chunk_index, ChunkState::Failed)
                    .await;
                return Err(EngineError::HttpStatus {
                    code: other.as_u16(),
                    retry_after_ms: None,
                });
            }
        }

        // A 200 means the server ignored the Range header. Only the first
        // chunk can absorb that by restarting from byte zero; any other
        // chunk would overlap its siblings.
        let range_ignored = status == StatusCode::OK;
        if range_ignored && chunk.chunk_index > 0 {
            return Ok(ChunkOutcome::RangeIgnored);
        }

        let expected_size = chunk.size();
        let path = Path::new(&chunk.temp_path).to_path_buf();

        // Resume is only sound when the server honored the range and the
        // partial file is exactly as long as the recorded progress.
        let mut start_offset = 0u64;
        if chunk.downloaded_bytes > 0 && !range_ignored {
            let on_disk = tokio::fs::metadata(&path).await.map(|m| m.len()).ok();
            if on_disk == Some(chunk.downloaded_bytes as u64) {
                start_offset = chunk.downloaded_bytes as u64;
            } else {
                debug!(
                    "Chunk {}/{} resume mismatch (recorded {}, on disk {:?}); restarting",
                    download.id, chunk_index, chunk.downloaded_bytes, on_disk
                );
            }
        }

        let mut file = if start_offset > 0 {
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(&path)
                .await?
        } else {
            tokio::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)
                .await?
        };

        // Streaming hash only makes sense from a clean start
        let mut hasher = if start_offset == 0 {
            Some(Sha256::new())
        } else {
            None
        };

        let write_high_water =
            write_buffer::recommend(&self.config.buffers, &self.metrics, Some(host));
        let mut buffer: Vec<u8> = Vec::with_capacity(write_high_water);

        let mut written = start_offset;
        let mut last_progress_update = Instant::now();
        let mut last_db_write = Instant::now();
        let mut bytes_since_progress = 0u64;
        let mut last_activity = Instant::now();
        let idle_budget = Duration::from_secs(self.config.network.chunk_idle_timeout_secs);

        let mut stream = response.bytes_stream();
        let mut idle_ticker = tokio::time::interval(IDLE_CHECK_INTERVAL);
        idle_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        idle_ticker.tick().await;

        loop {
            tokio::select! {
                next = stream.next() => {
                    match next {
                        Some(Ok(bytes)) => {
                            if !self.sessions.is_current(token).await {
                                return Ok(ChunkOutcome::SessionStale);
                            }

                            if let Some(ref mut hasher) = hasher {
                                // Never hash past the expected extent; any
                                // surplus is truncated at completion
                                let received = written + buffer.len() as u64;
                                let hashable = expected_size.saturating_sub(received) as usize;
                                hasher.update(&bytes[..bytes.len().min(hashable)]);
                            }

                            buffer.extend_from_slice(&bytes);
                            last_activity = Instant::now();

                            if buffer.len() >= write_high_water {
                                file.write_all(&buffer).await?;
                                written += buffer.len() as u64;
                                bytes_since_progress += buffer.len() as u64;
                                buffer.clear();
                            }

                            let now = Instant::now();
                            if now.duration_since(last_progress_update) >= PROGRESS_INTERVAL {
                                let unflushed = buffer.len() as u64;
                                self.tick_progress(
                                    token,
                                    download,
                                    chunk_index,
                                    host,
                                    written + unflushed,
                                    bytes_since_progress + unflushed,
                                    now.duration_since(last_progress_update),
                                    &mut last_db_write,
                                )
                                .await;
                                last_progress_update = now;
                                bytes_since_progress = 0;
                                if unflushed > 0 {
                                    file.write_all(&buffer).await?;
                                    written += unflushed;
                                    buffer.clear();
                                }
                            }
                        }
                        Some(Err(err)) => {
                            // Transport died mid-stream: transient, chunk
                            // back to pending for the retry batch
                            self.set_chunk_state(download.id, chunk_index, ChunkState::Pending)
                                .await;
                            return Err(EngineError::TransientNetwork {
                                category: classify_reqwest(&err),
                                message: err.to_string(),
                                retry_after_ms: None,
                            });
                        }
                        None => break,
                    }
                }
                _ = idle_ticker.tick() => {
                    if !self.sessions.is_current(token).await {
                        return Ok(ChunkOutcome::SessionStale);
                    }
                    if last_activity.elapsed() >= idle_budget {
                        warn!(
                            "Chunk {}/{} made no progress for {:?}; aborting",
                            download.id, chunk_index, idle_budget
                        );
                        self.set_chunk_state(download.id, chunk_index, ChunkState::Failed)
                            .await;
                        return Err(EngineError::Timeout(TimeoutKind::Inactivity));
                    }
                }
            }
        }

        if !buffer.is_empty() {
            file.write_all(&buffer).await?;
        }
        file.flush().await?;
        drop(file);

        if !self.sessions.is_current(token).await {
            return Ok(ChunkOutcome::SessionStale);
        }

        let actual = tokio::fs::metadata(&path).await?.len();
        if actual < expected_size {
            self.set_chunk_state(download.id, chunk_index, ChunkState::Failed)
                .await;
            return Err(EngineError::Integrity(IntegrityKind::ChunkIncomplete {
                expected: expected_size,
                actual,
            }));
        }
        if actual > expected_size {
            debug!(
                "Chunk {}/{} overshot by {} bytes; clamping",
                download.id,
                chunk_index,
                actual - expected_size
            );
            let file = tokio::fs::OpenOptions::new().write(true).open(&path).await?;
            file.set_len(expected_size).await?;
        }

        let hash = hasher.map(|h| encode_hex(&h.finalize()));

        self.aggregator.mark_completed(download.id, chunk_index).await;
        if let Some(ref hash) = hash {
            self.aggregator
                .set_hash(download.id, chunk_index, hash.clone())
                .await;
        }
        self.store
            .update_chunk(
                download.id,
                chunk_index,
                ChunkPatch {
                    downloaded_bytes: Some(expected_size as i64),
                    state: Some(ChunkState::Completed),
                    hash: Some(hash.clone()),
                    ..Default::default()
                },
            )
            .await?;

        self.metrics.record_completed(host);

        Ok(ChunkOutcome::Completed { hash })
    }

    #[allow(clippy::too_many_arguments)]
    async fn tick_progress(
        &self,
        token: &SessionToken,
        download: &DownloadRow,
        chunk_index: u32,
        host: &str,
        chunk_downloaded: u64,
        delta_bytes: u64,
        elapsed: Duration,
        last_db_write: &mut Instant,
    ) {
        if !self.sessions.is_current(token).await {
            return;
        }

        self.aggregator
            .update_bytes(download.id, chunk_index, chunk_downloaded)
            .await;
        self.metrics.record_progress(host, delta_bytes, elapsed);

        let total_downloaded = self.aggregator.total_downloaded(download.id).await;
        let total_bytes = download.total_bytes as u64;
        let progress = if total_bytes > 0 {
            total_downloaded as f64 / total_bytes as f64
        } else {
            0.0
        };

        self.events
            .publish(EngineEvent::DownloadProgress {
                download_id: download.id,
                downloaded_bytes: total_downloaded,
                total_bytes,
                progress,
                speed_bps: self.metrics.avg_speed_bps(host).unwrap_or(0),
            })
            .await;

        if last_db_write.elapsed() >= DB_WRITE_INTERVAL {
            self.store
                .submit_progress(download.id, total_downloaded as i64, progress)
                .await;
            let _ = self
                .store
                .update_chunk(
                    download.id,
                    chunk_index,
                    ChunkPatch {
                        downloaded_bytes: Some(chunk_downloaded as i64),
                        ..Default::default()
                    },
                )
                .await;
            *last_db_write = Instant::now();
        }
    }

    async fn set_chunk_state(&self, download_id: i64, chunk_index: u32, state: ChunkState) {
        self.aggregator
            .update_state(download_id, chunk_index, state)
            .await;
        if state == ChunkState::Pending {
            self.aggregator.reset_chunk(download_id, chunk_index).await;
        }
        let _ = self
            .store
            .update_chunk(
                download_id,
                chunk_index,
                ChunkPatch {
                    state: Some(state),
                    downloaded_bytes: if state == ChunkState::Pending {
                        Some(0)
                    } else {
                        None
                    },
                    ..Default::default()
                },
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{NewChunk, NewDownload};
    use crate::db::store::SqliteStateStore;
    use tempfile::TempDir;

    struct Fixture {
        handler: ResponseHandler,
        store: Arc<dyn StateStore>,
        sessions: Arc<SessionRegistry>,
        aggregator: Arc<ProgressAggregator>,
        _dir: TempDir,
        dir_path: std::path::PathBuf,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let dir_path = dir.path().to_path_buf();
        let store: Arc<dyn StateStore> = Arc::new(
            SqliteStateStore::open_in_memory(100, Duration::from_millis(50))
                .await
                .unwrap(),
        );
        let aggregator = Arc::new(ProgressAggregator::default());
        let sessions = Arc::new(SessionRegistry::new());
        let handler = ResponseHandler::new(
            Arc::new(EngineConfig::default()),
            store.clone(),
            aggregator.clone(),
            Arc::new(HostMetrics::default()),
            sessions.clone(),
            Arc::new(EventBus::new(64)),
        );
        Fixture {
            handler,
            store,
            sessions,
            aggregator,
            _dir: dir,
            dir_path,
        }
    }

    async fn seed_download(
        fixture: &Fixture,
        url: &str,
        total: u64,
        chunk_end: u64,
    ) -> (DownloadRow, ChunkRow) {
        let download = fixture
            .store
            .add(NewDownload {
                title: "t".into(),
                url: url.into(),
                save_path: fixture.dir_path.join("out.bin").display().to_string(),
                temp_base: fixture.dir_path.display().to_string(),
                total_bytes: total,
                priority: 2,
                force_overwrite: false,
                expected_hash: None,
                start_paused: false,
                skip_queue_limit: false,
            })
            .await
            .unwrap();

        let temp_path = fixture.dir_path.join("chunk_0").display().to_string();
        let chunks = fixture
            .store
            .create_chunks(
                download.id,
                vec![NewChunk {
                    chunk_index: 0,
                    start_byte: 0,
                    end_byte: chunk_end,
                    temp_path,
                }],
            )
            .await
            .unwrap();

        fixture
            .aggregator
            .init(
                download.id,
                &[(0, chunk_end + 1, 0, ChunkState::Pending)],
            )
            .await;

        (download, chunks[0].clone())
    }

    #[tokio::test]
    async fn test_consume_206_to_completion() {
        let mut server = mockito::Server::new_async().await;
        let body = vec![0x5Au8; 1024];
        let mock = server
            .mock("GET", "/file.bin")
            .with_status(206)
            .with_body(&body)
            .create_async()
            .await;

        let fixture = fixture().await;
        let url = format!("{}/file.bin", server.url());
        let (download, chunk) = seed_download(&fixture, &url, 1024, 1023).await;
        let token = fixture.sessions.begin(download.id).await;

        let response = reqwest::get(&url).await.unwrap();
        let outcome = fixture
            .handler
            .consume(&token, &download, &chunk, "test.host", response)
            .await
            .unwrap();

        match outcome {
            ChunkOutcome::Completed { hash } => assert!(hash.is_some()),
            other => panic!("unexpected outcome {other:?}"),
        }

        let on_disk = tokio::fs::read(&chunk.temp_path).await.unwrap();
        assert_eq!(on_disk, body);

        let rows = fixture.store.get_chunks(download.id).await.unwrap();
        assert_eq!(rows[0].state, ChunkState::Completed);
        assert_eq!(rows[0].downloaded_bytes, 1024);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_short_body_is_chunk_incomplete() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/file.bin")
            .with_status(206)
            .with_body(vec![1u8; 100])
            .create_async()
            .await;

        let fixture = fixture().await;
        let url = format!("{}/file.bin", server.url());
        let (download, chunk) = seed_download(&fixture, &url, 1024, 1023).await;
        let token = fixture.sessions.begin(download.id).await;

        let response = reqwest::get(&url).await.unwrap();
        let err = fixture
            .handler
            .consume(&token, &download, &chunk, "test.host", response)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            EngineError::Integrity(IntegrityKind::ChunkIncomplete {
                expected: 1024,
                actual: 100
            })
        ));

        let rows = fixture.store.get_chunks(download.id).await.unwrap();
        assert_eq!(rows[0].state, ChunkState::Failed);
    }

    #[tokio::test]
    async fn test_429_attaches_retry_after_and_resets_chunk() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/file.bin")
            .with_status(429)
            .with_header("retry-after", "2")
            .create_async()
            .await;

        let fixture = fixture().await;
        let url = format!("{}/file.bin", server.url());
        let (download, chunk) = seed_download(&fixture, &url, 1024, 1023).await;
        let token = fixture.sessions.begin(download.id).await;

        let response = reqwest::get(&url).await.unwrap();
        let err = fixture
            .handler
            .consume(&token, &download, &chunk, "test.host", response)
            .await
            .unwrap_err();

        match err {
            EngineError::HttpStatus {
                code: 429,
                retry_after_ms,
            } => assert_eq!(retry_after_ms, Some(2000)),
            other => panic!("unexpected error {other:?}"),
        }

        let rows = fixture.store.get_chunks(download.id).await.unwrap();
        assert_eq!(rows[0].state, ChunkState::Pending);
    }

    #[tokio::test]
    async fn test_404_fails_chunk() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/file.bin")
            .with_status(404)
            .create_async()
            .await;

        let fixture = fixture().await;
        let url = format!("{}/file.bin", server.url());
        let (download, chunk) = seed_download(&fixture, &url, 1024, 1023).await;
        let token = fixture.sessions.begin(download.id).await;

        let response = reqwest::get(&url).await.unwrap();
        let err = fixture
            .handler
            .consume(&token, &download, &chunk, "test.host", response)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            EngineError::HttpStatus {
                code: 404,
                retry_after_ms: None
            }
        ));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_stale_session_bails_without_side_effects() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/file.bin")
            .with_status(206)
            .with_body(vec![0u8; 64])
            .create_async()
            .await;

        let fixture = fixture().await;
        let url = format!("{}/file.bin", server.url());
        let (download, chunk) = seed_download(&fixture, &url, 1024, 1023).await;
        let token = fixture.sessions.begin(download.id).await;
        // Supersede before the handler runs
        fixture.sessions.begin(download.id).await;

        let response = reqwest::get(&url).await.unwrap();
        let outcome = fixture
            .handler
            .consume(&token, &download, &chunk, "test.host", response)
            .await
            .unwrap();

        assert_eq!(outcome, ChunkOutcome::SessionStale);
        let rows = fixture.store.get_chunks(download.id).await.unwrap();
        assert_eq!(rows[0].state, ChunkState::Pending);
        assert_eq!(rows[0].downloaded_bytes, 0);
    }

    #[tokio::test]
    async fn test_200_on_non_first_chunk_reports_range_ignored() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/file.bin")
            .with_status(200)
            .with_body(vec![0u8; 2048])
            .create_async()
            .await;

        let fixture = fixture().await;
        let url = format!("{}/file.bin", server.url());
        let (download, _) = seed_download(&fixture, &url, 2048, 1023).await;
        let chunk1 = fixture
            .store
            .create_chunks(
                download.id,
                vec![NewChunk {
                    chunk_index: 1,
                    start_byte: 1024,
                    end_byte: 2047,
                    temp_path: fixture.dir_path.join("chunk_1").display().to_string(),
                }],
            )
            .await
            .unwrap()
            .into_iter()
            .find(|c| c.chunk_index == 1)
            .unwrap();
        let token = fixture.sessions.begin(download.id).await;

        let response = reqwest::get(&url).await.unwrap();
        let outcome = fixture
            .handler
            .consume(&token, &download, &chunk1, "test.host", response)
            .await
            .unwrap();

        assert_eq!(outcome, ChunkOutcome::RangeIgnored);
        // Nothing was written for that chunk
        assert!(!fixture.dir_path.join("chunk_1").exists());
    }

    #[tokio::test]
    async fn test_200_on_first_chunk_restarts_from_zero() {
        let mut server = mockito::Server::new_async().await;
        let body = vec![9u8; 1024];
        let _mock = server
            .mock("GET", "/file.bin")
            .with_status(200)
            .with_body(&body)
            .create_async()
            .await;

        let fixture = fixture().await;
        let url = format!("{}/file.bin", server.url());
        let (download, mut chunk) = seed_download(&fixture, &url, 1024, 1023).await;

        // Pretend half the chunk was already there; a 200 ignores it
        tokio::fs::write(&chunk.temp_path, vec![1u8; 512]).await.unwrap();
        chunk.downloaded_bytes = 512;
        let token = fixture.sessions.begin(download.id).await;

        let response = reqwest::get(&url).await.unwrap();
        let outcome = fixture
            .handler
            .consume(&token, &download, &chunk, "test.host", response)
            .await
            .unwrap();

        assert!(matches!(outcome, ChunkOutcome::Completed { .. }));
        let on_disk = tokio::fs::read(&chunk.temp_path).await.unwrap();
        assert_eq!(on_disk, body);
    }

    #[tokio::test]
    async fn test_excess_bytes_clamped() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/file.bin")
            .with_status(206)
            .with_body(vec![3u8; 1500])
            .create_async()
            .await;

        let fixture = fixture().await;
        let url = format!("{}/file.bin", server.url());
        let (download, chunk) = seed_download(&fixture, &url, 1024, 1023).await;
        let token = fixture.sessions.begin(download.id).await;

        let response = reqwest::get(&url).await.unwrap();
        let outcome = fixture
            .handler
            .consume(&token, &download, &chunk, "test.host", response)
            .await
            .unwrap();

        assert!(matches!(outcome, ChunkOutcome::Completed { .. }));
        let size = tokio::fs::metadata(&chunk.temp_path).await.unwrap().len();
        assert_eq!(size, 1024);
    }
}
