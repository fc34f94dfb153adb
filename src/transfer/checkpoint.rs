use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};

/// Window hashed for a partial-integrity checkpoint. Files smaller than
/// the window are hashed in full.
pub const TAIL_WINDOW: u64 = 64 * 1024;

const READ_BUF: usize = 1024 * 1024;

/// Tail checkpoint of a partial file: hash over the last window plus the
/// file size at checkpoint time. Matching both on resume proves the bytes
/// we would append after were the bytes we wrote before.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailCheckpoint {
    pub hash: String,
    pub size: u64,
}

pub fn encode_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Compute the tail checkpoint of a file as it exists right now.
pub async fn compute_tail_checkpoint(path: &Path) -> Result<TailCheckpoint> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open {:?} for checkpointing", path))?;
    let size = file
        .metadata()
        .await
        .with_context(|| format!("Failed to stat {:?}", path))?
        .len();

    let start = size.saturating_sub(TAIL_WINDOW);
    file.seek(SeekFrom::Start(start))
        .await
        .with_context(|| format!("Failed to seek in {:?}", path))?;

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUF.min(TAIL_WINDOW as usize)];
    loop {
        let read = file
            .read(&mut buf)
            .await
            .with_context(|| format!("Failed to read tail of {:?}", path))?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }

    Ok(TailCheckpoint {
        hash: encode_hex(&hasher.finalize()),
        size,
    })
}

/// Verify a stored checkpoint against the file on disk. The sizes must
/// match exactly; a smaller, larger, or differently-hashed file fails.
pub async fn verify_tail_checkpoint(path: &Path, stored: &TailCheckpoint) -> Result<bool> {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(m) => m,
        Err(_) => return Ok(false),
    };
    if metadata.len() != stored.size {
        return Ok(false);
    }

    let current = compute_tail_checkpoint(path).await?;
    Ok(current.hash == stored.hash)
}

/// SHA-256 of a whole file, streamed.
pub async fn sha256_file(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open {:?} for hashing", path))?;

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUF];
    loop {
        let read = file
            .read(&mut buf)
            .await
            .with_context(|| format!("Failed to read {:?}", path))?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }

    Ok(encode_hex(&hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_tail_checkpoint_small_file_hashes_everything() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("small");
        tokio::fs::write(&path, b"hello world").await.unwrap();

        let checkpoint = compute_tail_checkpoint(&path).await.unwrap();
        assert_eq!(checkpoint.size, 11);
        assert_eq!(checkpoint.hash, sha256_file(&path).await.unwrap());
    }

    #[tokio::test]
    async fn test_tail_checkpoint_large_file_hashes_window() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("large");
        let data = vec![0xABu8; (TAIL_WINDOW + 1000) as usize];
        tokio::fs::write(&path, &data).await.unwrap();

        let checkpoint = compute_tail_checkpoint(&path).await.unwrap();
        assert_eq!(checkpoint.size, TAIL_WINDOW + 1000);
        // Differs from the whole-file hash because only the tail is hashed
        // over different leading bytes
        let mut altered = data.clone();
        altered[0] = 0xCD;
        tokio::fs::write(&path, &altered).await.unwrap();
        let after = compute_tail_checkpoint(&path).await.unwrap();
        assert_eq!(checkpoint.hash, after.hash, "leading bytes are outside the window");
    }

    #[tokio::test]
    async fn test_verify_detects_flip_in_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data");
        let mut data = vec![7u8; 4096];
        tokio::fs::write(&path, &data).await.unwrap();

        let checkpoint = compute_tail_checkpoint(&path).await.unwrap();
        assert!(verify_tail_checkpoint(&path, &checkpoint).await.unwrap());

        // Flip the last byte
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        tokio::fs::write(&path, &data).await.unwrap();
        assert!(!verify_tail_checkpoint(&path, &checkpoint).await.unwrap());
    }

    #[tokio::test]
    async fn test_verify_detects_size_change() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data");
        tokio::fs::write(&path, vec![1u8; 1000]).await.unwrap();

        let checkpoint = compute_tail_checkpoint(&path).await.unwrap();
        tokio::fs::write(&path, vec![1u8; 999]).await.unwrap();
        assert!(!verify_tail_checkpoint(&path, &checkpoint).await.unwrap());
    }

    #[tokio::test]
    async fn test_verify_missing_file() {
        let dir = TempDir::new().unwrap();
        let checkpoint = TailCheckpoint {
            hash: "00".into(),
            size: 10,
        };
        assert!(
            !verify_tail_checkpoint(&dir.path().join("absent"), &checkpoint)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_sha256_known_value() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("abc");
        tokio::fs::write(&path, b"abc").await.unwrap();

        assert_eq!(
            sha256_file(&path).await.unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
