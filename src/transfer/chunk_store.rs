use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::db::models::ChunkRow;
use crate::engine::state_machine::ChunkState;

/// Result of comparing on-disk chunk files against the database's view.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Chunks the database claims completed whose files are gone
    pub missing: Vec<u32>,
    /// Completed chunks whose on-disk size disagrees with their extent
    pub mismatched: Vec<u32>,
    /// Files on disk for chunk indices the database does not know
    pub orphaned: Vec<u32>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.mismatched.is_empty() && self.orphaned.is_empty()
    }
}

/// Owns the per-chunk temporary files under a deterministic layout:
/// `<base>/<download_id>/chunk_<index>`.
pub struct ChunkStore {
    base_dir: PathBuf,
}

impl ChunkStore {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn download_dir(&self, download_id: i64) -> PathBuf {
        self.base_dir.join(download_id.to_string())
    }

    pub fn chunk_path(&self, download_id: i64, chunk_index: u32) -> PathBuf {
        self.download_dir(download_id)
            .join(format!("chunk_{chunk_index}"))
    }

    /// Create the temp directory for a download.
    pub async fn create_chunk_dir(&self, download_id: i64) -> Result<PathBuf> {
        let dir = self.download_dir(download_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create chunk directory {:?}", dir))?;
        Ok(dir)
    }

    pub async fn delete_chunk(&self, download_id: i64, chunk_index: u32) -> Result<()> {
        let path = self.chunk_path(download_id, chunk_index);
        if path.exists() {
            tokio::fs::remove_file(&path)
                .await
                .with_context(|| format!("Failed to delete chunk file {:?}", path))?;
            debug!("Deleted chunk file {:?}", path);
        }
        Ok(())
    }

    /// Remove the whole temp directory for a download.
    pub async fn delete_all_chunks(&self, download_id: i64) -> Result<()> {
        let dir = self.download_dir(download_id);
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir)
                .await
                .with_context(|| format!("Failed to delete chunk directory {:?}", dir))?;
            info!("Deleted chunk directory {:?}", dir);
        }
        Ok(())
    }

    pub async fn chunk_size_on_disk(&self, download_id: i64, chunk_index: u32) -> Option<u64> {
        let path = self.chunk_path(download_id, chunk_index);
        tokio::fs::metadata(&path).await.ok().map(|m| m.len())
    }

    /// Compare disk state against the database's chunk rows.
    ///
    /// Chunks the store claims COMPLETED must exist with exactly their
    /// extent's size; files for unknown indices are orphaned. Idempotent:
    /// reconcile mutates nothing.
    pub async fn reconcile_chunks(
        &self,
        download_id: i64,
        db_chunks: &[ChunkRow],
    ) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for chunk in db_chunks {
            if chunk.state != ChunkState::Completed {
                continue;
            }
            let index = chunk.chunk_index as u32;
            match self.chunk_size_on_disk(download_id, index).await {
                None => report.missing.push(index),
                Some(size) if size != chunk.size() => report.mismatched.push(index),
                Some(_) => {}
            }
        }

        let known: HashSet<u32> = db_chunks.iter().map(|c| c.chunk_index as u32).collect();
        let dir = self.download_dir(download_id);
        if dir.exists() {
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .with_context(|| format!("Failed to read chunk directory {:?}", dir))?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                let Some(index_str) = name.strip_prefix("chunk_") else {
                    continue;
                };
                if let Ok(index) = index_str.parse::<u32>() {
                    if !known.contains(&index) {
                        report.orphaned.push(index);
                    }
                }
            }
        }

        report.missing.sort_unstable();
        report.mismatched.sort_unstable();
        report.orphaned.sort_unstable();

        if !report.is_clean() {
            warn!(
                "Chunk reconcile for download {}: {} missing, {} mismatched, {} orphaned",
                download_id,
                report.missing.len(),
                report.mismatched.len(),
                report.orphaned.len()
            );
        }

        Ok(report)
    }

}
