use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::engine::state_machine::ChunkState;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(600);

/// Hot-path view of one chunk's progress.
#[derive(Debug, Clone)]
pub struct ChunkProgress {
    pub downloaded: u64,
    pub state: ChunkState,
    pub hash: Option<String>,
}

#[derive(Debug)]
struct DownloadCache {
    chunks: HashMap<u32, ChunkProgress>,
    /// Expected size per chunk, fixed at init
    sizes: HashMap<u32, u64>,
    last_activity: Instant,
}

impl DownloadCache {
    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

/// In-memory per-chunk progress cache. The state store stays authoritative;
/// workers read and write here on the hot path so progress ticks never hit
/// the database. Caches idle past the TTL are purged.
pub struct ProgressAggregator {
    caches: RwLock<HashMap<i64, DownloadCache>>,
    ttl: Duration,
}

impl ProgressAggregator {
    pub fn new(ttl: Duration) -> Self {
        Self {
            caches: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Seed the cache for a download from its persisted chunk rows. Runs a
    /// TTL purge over the other caches while it holds the write lock.
    pub async fn init(&self, download_id: i64, chunks: &[(u32, u64, u64, ChunkState)]) {
        let mut caches = self.caches.write().await;

        let cutoff = Instant::now();
        caches.retain(|id, cache| {
            let keep = *id == download_id
                || cutoff.duration_since(cache.last_activity) < self.ttl;
            if !keep {
                debug!("Purging idle progress cache for download {}", id);
            }
            keep
        });

        let mut chunk_map = HashMap::new();
        let mut sizes = HashMap::new();
        for (index, size, downloaded, state) in chunks {
            chunk_map.insert(
                *index,
                ChunkProgress {
                    downloaded: *downloaded,
                    state: *state,
                    hash: None,
                },
            );
            sizes.insert(*index, *size);
        }

        caches.insert(
            download_id,
            DownloadCache {
                chunks: chunk_map,
                sizes,
                last_activity: Instant::now(),
            },
        );
    }

    pub async fn update_bytes(&self, download_id: i64, chunk_index: u32, downloaded: u64) {
        let mut caches = self.caches.write().await;
        if let Some(cache) = caches.get_mut(&download_id) {
            if let Some(chunk) = cache.chunks.get_mut(&chunk_index) {
                chunk.downloaded = downloaded;
            }
            cache.touch();
        }
    }

    pub async fn update_state(&self, download_id: i64, chunk_index: u32, state: ChunkState) {
        let mut caches = self.caches.write().await;
        if let Some(cache) = caches.get_mut(&download_id) {
            if let Some(chunk) = cache.chunks.get_mut(&chunk_index) {
                trace!(
                    "Chunk {}/{} state {:?} -> {:?}",
                    download_id, chunk_index, chunk.state, state
                );
                chunk.state = state;
            }
            cache.touch();
        }
    }

    /// Mark a chunk complete with its full byte count.
    pub async fn mark_completed(&self, download_id: i64, chunk_index: u32) {
        let mut caches = self.caches.write().await;
        if let Some(cache) = caches.get_mut(&download_id) {
            let size = cache.sizes.get(&chunk_index).copied();
            if let Some(chunk) = cache.chunks.get_mut(&chunk_index) {
                chunk.state = ChunkState::Completed;
                if let Some(size) = size {
                    chunk.downloaded = size;
                }
            }
            cache.touch();
        }
    }

    /// Reset a chunk to pending with zero bytes (retry path).
    pub async fn reset_chunk(&self, download_id: i64, chunk_index: u32) {
        let mut caches = self.caches.write().await;
        if let Some(cache) = caches.get_mut(&download_id) {
            if let Some(chunk) = cache.chunks.get_mut(&chunk_index) {
                chunk.downloaded = 0;
                chunk.state = ChunkState::Pending;
                chunk.hash = None;
            }
            cache.touch();
        }
    }

    pub async fn set_hash(&self, download_id: i64, chunk_index: u32, hash: String) {
        let mut caches = self.caches.write().await;
        if let Some(cache) = caches.get_mut(&download_id) {
            if let Some(chunk) = cache.chunks.get_mut(&chunk_index) {
                chunk.hash = Some(hash);
            }
            cache.touch();
        }
    }

    pub async fn get_hash(&self, download_id: i64, chunk_index: u32) -> Option<String> {
        let caches = self.caches.read().await;
        caches
            .get(&download_id)
            .and_then(|cache| cache.chunks.get(&chunk_index))
            .and_then(|chunk| chunk.hash.clone())
    }

    /// Sum of downloaded bytes across all chunks of a download.
    pub async fn total_downloaded(&self, download_id: i64) -> u64 {
        let caches = self.caches.read().await;
        caches
            .get(&download_id)
            .map(|cache| cache.chunks.values().map(|c| c.downloaded).sum())
            .unwrap_or(0)
    }

    /// True when every chunk of the download is completed.
    pub async fn all_completed(&self, download_id: i64) -> bool {
        let caches = self.caches.read().await;
        caches
            .get(&download_id)
            .map(|cache| {
                !cache.chunks.is_empty()
                    && cache
                        .chunks
                        .values()
                        .all(|c| c.state == ChunkState::Completed)
            })
            .unwrap_or(false)
    }

    /// Per-chunk progress ordered by chunk index.
    pub async fn progress_array(&self, download_id: i64) -> Vec<(u32, ChunkProgress)> {
        let caches = self.caches.read().await;
        let mut entries: Vec<(u32, ChunkProgress)> = caches
            .get(&download_id)
            .map(|cache| {
                cache
                    .chunks
                    .iter()
                    .map(|(index, progress)| (*index, progress.clone()))
                    .collect()
            })
            .unwrap_or_default();
        entries.sort_by_key(|(index, _)| *index);
        entries
    }

    /// Drop the cache for a download (completion, cancel).
    pub async fn clear(&self, download_id: i64) {
        self.caches.write().await.remove(&download_id);
    }

    /// Drop caches idle longer than `max_age`. Returns the purge count.
    pub async fn purge_expired(&self, max_age: Duration) -> usize {
        let mut caches = self.caches.write().await;
        let before = caches.len();
        let cutoff = Instant::now();
        caches.retain(|_, cache| cutoff.duration_since(cache.last_activity) < max_age);
        before - caches.len()
    }
}

impl Default for ProgressAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed() -> Vec<(u32, u64, u64, ChunkState)> {
        vec![
            (0, 100, 0, ChunkState::Pending),
            (1, 100, 0, ChunkState::Pending),
            (2, 50, 0, ChunkState::Pending),
        ]
    }

    #[tokio::test]
    async fn test_total_downloaded() {
        let agg = ProgressAggregator::default();
        agg.init(1, &seed()).await;

        agg.update_bytes(1, 0, 40).await;
        agg.update_bytes(1, 1, 60).await;
        assert_eq!(agg.total_downloaded(1).await, 100);

        // Unknown download reads as zero
        assert_eq!(agg.total_downloaded(99).await, 0);
    }

    #[tokio::test]
    async fn test_all_completed() {
        let agg = ProgressAggregator::default();
        agg.init(1, &seed()).await;
        assert!(!agg.all_completed(1).await);

        agg.mark_completed(1, 0).await;
        agg.mark_completed(1, 1).await;
        assert!(!agg.all_completed(1).await);

        agg.mark_completed(1, 2).await;
        assert!(agg.all_completed(1).await);
    }

    #[tokio::test]
    async fn test_mark_completed_sets_full_size() {
        let agg = ProgressAggregator::default();
        agg.init(1, &seed()).await;

        agg.update_bytes(1, 2, 10).await;
        agg.mark_completed(1, 2).await;
        assert_eq!(agg.total_downloaded(1).await, 50);
    }

    #[tokio::test]
    async fn test_reset_chunk() {
        let agg = ProgressAggregator::default();
        agg.init(1, &seed()).await;

        agg.update_bytes(1, 0, 80).await;
        agg.set_hash(1, 0, "abc".into()).await;
        agg.reset_chunk(1, 0).await;

        assert_eq!(agg.total_downloaded(1).await, 0);
        assert_eq!(agg.get_hash(1, 0).await, None);
    }

    #[tokio::test]
    async fn test_progress_array_ordered() {
        let agg = ProgressAggregator::default();
        agg.init(1, &seed()).await;
        agg.update_bytes(1, 2, 25).await;

        let entries = agg.progress_array(1).await;
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].0, 0);
        assert_eq!(entries[2].0, 2);
        assert_eq!(entries[2].1.downloaded, 25);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let agg = ProgressAggregator::new(Duration::from_millis(10));
        agg.init(1, &seed()).await;
        agg.init(2, &seed()).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        agg.update_bytes(2, 0, 1).await;

        // Download 1 went idle past the TTL; 2 was just touched
        let purged = agg.purge_expired(Duration::from_millis(20)).await;
        assert_eq!(purged, 1);
        assert_eq!(agg.total_downloaded(2).await, 1);
    }

    #[tokio::test]
    async fn test_clear() {
        let agg = ProgressAggregator::default();
        agg.init(1, &seed()).await;
        agg.clear(1).await;
        assert!(!agg.all_completed(1).await);
        assert_eq!(agg.progress_array(1).await.len(), 0);
    }
}
