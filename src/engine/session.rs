use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Ownership token for one run of a download. Workers hold a token and
/// re-check it at every suspension point; pause/cancel/resume mints a new
/// session, so stale tasks see the mismatch and tear down without side
/// effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken {
    pub download_id: i64,
    pub session_id: Uuid,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<i64, Uuid>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a fresh session for a download, fencing out all prior tokens.
    pub async fn begin(&self, download_id: i64) -> SessionToken {
        let session_id = Uuid::new_v4();
        self.sessions.write().await.insert(download_id, session_id);
        debug!("Session {} begun for download {}", session_id, download_id);
        SessionToken {
            download_id,
            session_id,
        }
    }

    /// Invalidate the current session without starting a new one.
    pub async fn invalidate(&self, download_id: i64) {
        if self.sessions.write().await.remove(&download_id).is_some() {
            debug!("Session invalidated for download {}", download_id);
        }
    }

    /// Whether the token still owns its download's run.
    pub async fn is_current(&self, token: &SessionToken) -> bool {
        self.sessions
            .read()
            .await
            .get(&token.download_id)
            .map(|current| *current == token.session_id)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_begin_and_check() {
        let registry = SessionRegistry::new();
        let token = registry.begin(1).await;
        assert!(registry.is_current(&token).await);
    }

    #[tokio::test]
    async fn test_new_session_fences_old_token() {
        let registry = SessionRegistry::new();
        let old = registry.begin(1).await;
        let new = registry.begin(1).await;

        assert!(!registry.is_current(&old).await);
        assert!(registry.is_current(&new).await);
    }

    #[tokio::test]
    async fn test_invalidate() {
        let registry = SessionRegistry::new();
        let token = registry.begin(1).await;
        registry.invalidate(1).await;
        assert!(!registry.is_current(&token).await);
    }

    #[tokio::test]
    async fn test_sessions_are_per_download() {
        let registry = SessionRegistry::new();
        let a = registry.begin(1).await;
        let b = registry.begin(2).await;

        registry.invalidate(1).await;
        assert!(!registry.is_current(&a).await);
        assert!(registry.is_current(&b).await);
    }
}
