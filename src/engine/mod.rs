pub mod concurrency;
pub mod scheduler;
pub mod session;
pub mod state_machine;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::db::models::{
    DownloadPatch, DownloadRow, NewDownload, NewHistory, Snapshot,
};
use crate::db::store::{SqliteStateStore, StateStore, TransitionObserver};
use crate::engine::concurrency::ConcurrencyController;
use crate::engine::session::SessionRegistry;
use crate::engine::state_machine::DownloadState;
use crate::error::{EngineError, IntegrityKind, StateError};
use crate::events::{EngineEvent, EventBus, EventKind, EventSubscriber};
use crate::transfer::assembler::{Assembler, MergeOutcome, PostHocMerger, staging_path};
use crate::transfer::buffer_pool::BufferPool;
use crate::transfer::checkpoint;
use crate::transfer::chunk_downloader::{ChunkDownloader, DownloadOutcome};
use crate::transfer::chunk_store::ChunkStore;
use crate::transfer::metrics::{HostMetrics, host_of};
use crate::transfer::progress::ProgressAggregator;

/// Debounce window for state-changed events.
const STATE_CHANGED_DEBOUNCE: Duration = Duration::from_millis(50);

/// Fallback scheduler wakeup when no notification arrives.
const SCHEDULER_TICK: Duration = Duration::from_millis(500);

/// Cadence of the aggregator TTL purge.
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Parameters for enqueuing a download from the catalog.
#[derive(Debug, Clone)]
pub struct AddDownloadParams {
    pub title: String,
    pub url: String,
    pub save_path: String,
    pub total_bytes: u64,
    pub priority: i64,
    pub force_overwrite: bool,
    pub expected_hash: Option<String>,
    pub start_paused: bool,
}

/// Aggregate view for the embedding application's status surface.
#[derive(Debug, Clone, Default)]
pub struct SessionMetrics {
    pub active_downloads: usize,
    pub queued_downloads: usize,
    pub paused_downloads: usize,
    pub completed_downloads: usize,
    pub failed_downloads: usize,
    pub total_bytes: i64,
    pub downloaded_bytes: i64,
    pub tracked_hosts: usize,
}

/// Top-level download engine: public operations, scheduling, event
/// emission. Owns every in-memory collaborator; the embedding application
/// holds an `Arc<Engine>` and an event subscription.
pub struct Engine {
    config: Arc<EngineConfig>,
    store: Arc<dyn StateStore>,
    chunk_store: Arc<ChunkStore>,
    aggregator: Arc<ProgressAggregator>,
    metrics: Arc<HostMetrics>,
    sessions: Arc<SessionRegistry>,
    events: Arc<EventBus>,
    concurrency: Arc<ConcurrencyController>,
    downloader: ChunkDownloader,
    scheduler_wake: Arc<Notify>,
    state_dirty: Arc<Notify>,
    active_runs: Arc<AsyncMutex<HashMap<i64, JoinHandle<()>>>>,
    background_tasks: AsyncMutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// Transition hook wired into the state store: leaving an active state
/// releases every concurrency slot the download holds, entering the queue
/// nudges the scheduler.
struct SlotHook {
    concurrency: Arc<ConcurrencyController>,
    scheduler_wake: Arc<Notify>,
}

#[async_trait]
impl TransitionObserver for SlotHook {
    async fn on_exit(&self, download: &DownloadRow, from: DownloadState) {
        if from.is_active() {
            self.concurrency.release_all(download.id);
        }
    }

    async fn on_enter(&self, _download: &DownloadRow, to: DownloadState) {
        if to == DownloadState::Queued {
            self.scheduler_wake.notify_one();
        }
    }
}

impl Engine {
    /// Open the engine over its configured state database and temp layout.
    pub async fn new(config: EngineConfig) -> Result<Arc<Self>, EngineError> {
        config
            .validate()
            .map_err(|e| EngineError::Fatal(format!("invalid configuration: {e:#}")))?;

        let store = SqliteStateStore::open(
            &config
                .state_db_path()
                .map_err(|e| EngineError::Fatal(e.to_string()))?,
            config.downloads.max_queue_size,
            Duration::from_millis(config.downloads.progress_batch_delay_ms),
        )
        .await?;

        let temp_dir = config
            .temp_dir()
            .map_err(|e| EngineError::Fatal(e.to_string()))?;

        Self::assemble(config, Arc::new(store), temp_dir).await
    }

    /// Wire the engine over an already-open store; the path for tests.
    pub async fn with_store(
        config: EngineConfig,
        store: Arc<dyn StateStore>,
        temp_dir: std::path::PathBuf,
    ) -> Result<Arc<Self>, EngineError> {
        Self::assemble(config, store, temp_dir).await
    }

    async fn assemble(
        config: EngineConfig,
        store: Arc<dyn StateStore>,
        temp_dir: std::path::PathBuf,
    ) -> Result<Arc<Self>, EngineError> {
        let config = Arc::new(config);
        let chunk_store = Arc::new(ChunkStore::new(temp_dir));
        let aggregator = Arc::new(ProgressAggregator::default());
        let metrics = Arc::new(HostMetrics::default());
        let sessions = Arc::new(SessionRegistry::new());
        let events = Arc::new(EventBus::new(256));
        let scheduler_wake = Arc::new(Notify::new());
        let state_dirty = Arc::new(Notify::new());

        let (global, per_host) = if config.downloads.turbo_download {
            (1, 1)
        } else {
            (
                config.downloads.max_concurrent,
                config.downloads.max_concurrent_per_host,
            )
        };
        let concurrency = Arc::new(ConcurrencyController::new(global, per_host));

        store.set_transition_observer(Arc::new(SlotHook {
            concurrency: concurrency.clone(),
            scheduler_wake: scheduler_wake.clone(),
        }));

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.network.connect_timeout_secs))
            .user_agent(concat!("depot/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| EngineError::Fatal(format!("failed to build http client: {e}")))?;

        let buffer_pool = Arc::new(if config.buffers.pool.pre_allocate {
            BufferPool::pre_allocated(
                config.buffers.pool.buffer_bytes,
                config.buffers.pool.max_pooled,
            )
        } else {
            BufferPool::new(
                config.buffers.pool.buffer_bytes,
                config.buffers.pool.max_pooled,
            )
        });

        let downloader = ChunkDownloader::new(
            config.clone(),
            store.clone(),
            chunk_store.clone(),
            aggregator.clone(),
            metrics.clone(),
            sessions.clone(),
            events.clone(),
            concurrency.clone(),
            buffer_pool,
            client,
        );

        let engine = Arc::new(Self {
            config,
            store,
            chunk_store,
            aggregator,
            metrics,
            sessions,
            events,
            concurrency,
            downloader,
            scheduler_wake,
            state_dirty,
            active_runs: Arc::new(AsyncMutex::new(HashMap::new())),
            background_tasks: AsyncMutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        Self::spawn_background_tasks(&engine).await;
        info!("Download engine ready");
        Ok(engine)
    }

    async fn spawn_background_tasks(engine: &Arc<Self>) {
        let mut tasks = engine.background_tasks.lock().await;

        // Scheduler loop
        {
            let engine = engine.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = engine.scheduler_wake.notified() => {}
                        _ = tokio::time::sleep(SCHEDULER_TICK) => {}
                    }
                    if engine.closed.load(Ordering::SeqCst) {
                        break;
                    }
                    if let Err(e) = Self::schedule_next(&engine).await {
                        warn!("Scheduler pass failed: {e}");
                    }
                }
            }));
        }

        // State-changed debouncer
        {
            let engine = engine.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    engine.state_dirty.notified().await;
                    tokio::time::sleep(STATE_CHANGED_DEBOUNCE).await;
                    if engine.closed.load(Ordering::SeqCst) {
                        break;
                    }
                    if let Ok(version) = engine.store.current_version().await {
                        engine
                            .events
                            .publish(EngineEvent::StateChanged {
                                state_version: version,
                            })
                            .await;
                    }
                }
            }));
        }

        // Aggregator TTL purge
        {
            let aggregator = engine.aggregator.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(PURGE_INTERVAL);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let purged = aggregator
                        .purge_expired(crate::transfer::progress::DEFAULT_CACHE_TTL)
                        .await;
                    if purged > 0 {
                        debug!("Purged {purged} idle progress cache(s)");
                    }
                }
            }));
        }

        // Adaptive concurrency evaluator
        if engine.config.downloads.adaptive_concurrency.enabled
            && !engine.config.downloads.turbo_download
        {
            tasks.push(concurrency::spawn_adaptive_evaluator(
                engine.concurrency.clone(),
                engine.metrics.clone(),
                engine.config.downloads.adaptive_concurrency.clone(),
                engine.config.downloads.max_concurrent,
            ));
        }
    }

    fn signal_state_changed(&self) {
        self.state_dirty.notify_one();
    }

    // ---- public operations -------------------------------------------------

    /// Validate and enqueue a download. When the target file already exists
    /// and overwrite was not requested, the download is parked PAUSED and a
    /// needs-confirmation event asks the user to decide.
    pub async fn add_download(&self, params: AddDownloadParams) -> Result<Snapshot, EngineError> {
        let host = host_of(&params.url).ok_or_else(|| {
            EngineError::State(StateError::HostNotAllowed {
                host: params.url.clone(),
            })
        })?;
        if !self.config.host_allowed(&host) {
            return Err(EngineError::State(StateError::HostNotAllowed { host }));
        }
        if params.save_path.is_empty() {
            return Err(EngineError::Fatal("save_path must not be empty".into()));
        }
        let priority = params.priority.clamp(1, 3);

        let target_exists = std::path::Path::new(&params.save_path).exists();
        let needs_confirmation = target_exists && !params.force_overwrite;

        let row = self
            .store
            .add(NewDownload {
                title: params.title,
                url: params.url,
                save_path: params.save_path.clone(),
                temp_base: self.chunk_store.base_dir().display().to_string(),
                total_bytes: params.total_bytes,
                priority,
                force_overwrite: params.force_overwrite,
                expected_hash: params.expected_hash,
                start_paused: params.start_paused || needs_confirmation,
                skip_queue_limit: false,
            })
            .await?;

        if needs_confirmation {
            self.events
                .publish(EngineEvent::NeedsConfirmation {
                    download_id: row.id,
                    save_path: params.save_path,
                })
                .await;
        }

        self.signal_state_changed();
        self.scheduler_wake.notify_one();
        self.store.snapshot(None).await
    }

    /// Pause an active or queued download. Chunk checkpoints are persisted
    /// before the session is fenced so resume can trust the partial files.
    pub async fn pause_download(&self, id: i64) -> Result<Snapshot, EngineError> {
        let row = self.fetch(id).await?;
        if !row.state.is_active() && row.state != DownloadState::Queued {
            return Err(EngineError::State(StateError::InvalidTransition {
                from: row.state,
                to: DownloadState::Paused,
            }));
        }

        if row.state.is_active() {
            self.downloader.save_checkpoints_for_pause(id).await?;
        }

        self.store
            .transition(id, DownloadState::Paused, None)
            .await?;
        self.sessions.invalidate(id).await;
        self.reap_run(id).await;

        self.signal_state_changed();
        self.store.snapshot(None).await
    }

    /// Resume a paused or failed download back into the queue.
    pub async fn resume_download(&self, id: i64) -> Result<Snapshot, EngineError> {
        let row = self.fetch(id).await?;
        match row.state {
            DownloadState::Paused | DownloadState::Failed | DownloadState::Cancelled => {
                self.store
                    .transition(id, DownloadState::Queued, Some(row.state))
                    .await?;
            }
            other => {
                return Err(EngineError::State(StateError::InvalidTransition {
                    from: other,
                    to: DownloadState::Queued,
                }));
            }
        }

        self.signal_state_changed();
        self.scheduler_wake.notify_one();
        self.store.snapshot(None).await
    }

    /// Cancel a download and schedule its temp artifacts for deletion.
    pub async fn cancel_download(&self, id: i64) -> Result<Snapshot, EngineError> {
        let row = self.fetch(id).await?;
        self.store
            .transition(id, DownloadState::Cancelled, None)
            .await?;
        self.sessions.invalidate(id).await;
        self.reap_run(id).await;
        self.aggregator.clear(id).await;

        let _ = self.chunk_store.delete_all_chunks(id).await;
        let staging = staging_path(&row.save_path);
        if staging.exists() {
            let _ = tokio::fs::remove_file(&staging).await;
        }

        self.signal_state_changed();
        self.store.snapshot(None).await
    }

    /// User's answer to a needs-confirmation event: allow overwriting and
    /// put the download in the queue.
    pub async fn confirm_overwrite(&self, id: i64) -> Result<Snapshot, EngineError> {
        self.store
            .update(
                id,
                DownloadPatch {
                    force_overwrite: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        let row = self.fetch(id).await?;
        if row.state == DownloadState::Paused {
            self.store
                .transition(id, DownloadState::Queued, Some(DownloadState::Paused))
                .await?;
        }

        self.signal_state_changed();
        self.scheduler_wake.notify_one();
        self.store.snapshot(None).await
    }

    pub async fn pause_all(&self) -> Result<Snapshot, EngineError> {
        let rows = self.store.list().await?;
        for row in rows {
            if row.state.is_active() || row.state == DownloadState::Queued {
                if let Err(e) = self.pause_download(row.id).await {
                    warn!("pause_all: download {} not paused: {e}", row.id);
                }
            }
        }
        self.store.snapshot(None).await
    }

    pub async fn resume_all(&self) -> Result<Snapshot, EngineError> {
        let rows = self.store.list().await?;
        for row in rows {
            if matches!(row.state, DownloadState::Paused | DownloadState::Failed) {
                if let Err(e) = self.resume_download(row.id).await {
                    warn!("resume_all: download {} not resumed: {e}", row.id);
                }
            }
        }
        self.store.snapshot(None).await
    }

    pub async fn cancel_all(&self) -> Result<Snapshot, EngineError> {
        let rows = self.store.list().await?;
        for row in rows {
            if !row.state.is_terminal() {
                if let Err(e) = self.cancel_download(row.id).await {
                    warn!("cancel_all: download {} not cancelled: {e}", row.id);
                }
            }
        }
        self.store.snapshot(None).await
    }

    /// Re-queue failed or completed downloads with overwrite forced.
    pub async fn restart_stopped_with_overwrite(
        &self,
        ids: Option<Vec<i64>>,
    ) -> Result<Snapshot, EngineError> {
        let rows = self.store.list().await?;
        for row in rows {
            if let Some(ref ids) = ids {
                if !ids.contains(&row.id) {
                    continue;
                }
            }
            if !matches!(row.state, DownloadState::Failed | DownloadState::Completed) {
                continue;
            }
            self.store
                .update(
                    row.id,
                    DownloadPatch {
                        force_overwrite: Some(true),
                        ..Default::default()
                    },
                )
                .await?;
            self.store
                .transition(row.id, DownloadState::Queued, None)
                .await?;
        }

        self.signal_state_changed();
        self.scheduler_wake.notify_one();
        self.store.snapshot(None).await
    }

    /// Remove terminal downloads in the given states along with their
    /// chunks and temp files.
    pub async fn clear_finished(
        &self,
        states: &[DownloadState],
    ) -> Result<Snapshot, EngineError> {
        let removed = self.store.clear_finished(states).await?;
        for row in &removed {
            let _ = self.chunk_store.delete_all_chunks(row.id).await;
            self.aggregator.clear(row.id).await;
        }
        self.signal_state_changed();
        self.store.snapshot(None).await
    }

    pub async fn get_snapshot(&self, min_version: Option<i64>) -> Result<Snapshot, EngineError> {
        self.store.snapshot(min_version).await
    }

    pub async fn get_session_metrics(&self) -> Result<SessionMetrics, EngineError> {
        let snapshot = self.store.snapshot(None).await?;
        Ok(SessionMetrics {
            active_downloads: snapshot.summary.active,
            queued_downloads: snapshot.summary.queued,
            paused_downloads: snapshot.summary.paused,
            completed_downloads: snapshot.summary.completed,
            failed_downloads: snapshot.summary.failed,
            total_bytes: snapshot.summary.total_bytes,
            downloaded_bytes: snapshot.summary.downloaded_bytes,
            tracked_hosts: self.metrics.host_count(),
        })
    }

    pub fn subscribe(&self) -> EventSubscriber {
        self.events.subscribe()
    }

    pub fn subscribe_to(&self, kinds: Vec<EventKind>) -> EventSubscriber {
        self.events.subscribe_to(kinds)
    }

    /// Drain the scheduler, stop timers, fence every session, and close the
    /// store. The engine is unusable afterwards.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Closing download engine");

        self.scheduler_wake.notify_one();
        self.state_dirty.notify_one();

        let runs: Vec<(i64, JoinHandle<()>)> =
            self.active_runs.lock().await.drain().collect();
        for (id, _) in &runs {
            self.sessions.invalidate(*id).await;
        }
        for (id, handle) in runs {
            if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
                warn!("Download {} did not stop in time; aborting", id);
            }
        }

        for task in self.background_tasks.lock().await.drain(..) {
            task.abort();
        }

        self.store.close().await;
    }

    // ---- scheduling and the per-download pipeline --------------------------

    async fn fetch(&self, id: i64) -> Result<DownloadRow, EngineError> {
        self.store
            .get(id)
            .await?
            .ok_or(EngineError::State(StateError::UnknownDownload { id }))
    }

    /// One scheduler pass: start queued downloads while run slots remain.
    async fn schedule_next(engine: &Arc<Self>) -> Result<(), EngineError> {
        loop {
            {
                let runs = engine.active_runs.lock().await;
                let limit = if engine.config.downloads.turbo_download {
                    1
                } else {
                    engine.config.downloads.max_concurrent
                };
                if runs.len() >= limit {
                    return Ok(());
                }
            }

            let queued = engine.store.list_by_state(DownloadState::Queued).await?;
            let next = scheduler::pick_next(
                &engine.config.scheduler,
                engine.config.downloads.turbo_download,
                &queued,
                chrono::Utc::now().naive_utc(),
            );
            let Some(id) = next else { return Ok(()) };

            Self::start_download(engine, id).await?;
        }
    }

    async fn start_download(engine: &Arc<Self>, id: i64) -> Result<(), EngineError> {
        engine
            .store
            .transition(id, DownloadState::Starting, Some(DownloadState::Queued))
            .await?;
        engine.signal_state_changed();

        let worker = engine.clone();
        let handle = tokio::spawn(async move {
            worker.run_download(id).await;
            worker.active_runs.lock().await.remove(&id);
        });
        engine.active_runs.lock().await.insert(id, handle);
        Ok(())
    }

    async fn reap_run(&self, id: i64) {
        if let Some(handle) = self.active_runs.lock().await.remove(&id) {
            // The session is already fenced; the run unwinds at its next
            // suspension point
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }
    }

    /// The whole pipeline for one download: chunk phase, merge with the
    /// single silent retry, verification, terminal bookkeeping.
    async fn run_download(&self, id: i64) {
        let row = match self.fetch(id).await {
            Ok(row) => row,
            Err(e) => {
                error!("Download {id} vanished before start: {e}");
                return;
            }
        };

        let token = self.sessions.begin(id).await;

        if let Err(e) = self
            .store
            .transition(id, DownloadState::Downloading, Some(DownloadState::Starting))
            .await
        {
            debug!("Download {id} no longer starting: {e}");
            return;
        }
        self.signal_state_changed();

        match self.downloader.run(&row, &token).await {
            Ok(DownloadOutcome::Cancelled) => {
                debug!("Download {id} run fenced out (pause/cancel)");
            }
            Ok(DownloadOutcome::ChunksDone { merger }) => {
                self.merge_and_verify(row, merger, token).await;
            }
            Err(err) => {
                self.fail_download(&row, &err, false).await;
            }
        }
    }

    async fn merge_and_verify(
        &self,
        row: DownloadRow,
        merger: Option<crate::transfer::assembler::IncrementalMerger>,
        token: crate::engine::session::SessionToken,
    ) {
        let id = row.id;

        if self
            .store
            .transition(id, DownloadState::Merging, Some(DownloadState::Downloading))
            .await
            .is_err()
        {
            debug!("Download {id} left downloading before merge; dropping");
            if let Some(session) = merger {
                session.discard().await;
            }
            return;
        }
        self.signal_state_changed();
        self.events
            .publish(EngineEvent::MergeStarted { download_id: id })
            .await;

        // Refetch so the merge sees post-download fields (force_overwrite
        // confirmed mid-run, say)
        let row = match self.fetch(id).await {
            Ok(row) => row,
            Err(e) => {
                error!("Download {id} vanished before merge: {e}");
                return;
            }
        };
        let chunks = match self.store.get_chunks(id).await {
            Ok(chunks) => chunks,
            Err(e) => {
                self.fail_download(&row, &e, true).await;
                return;
            }
        };

        let mut assembler: Box<dyn Assembler> = match merger {
            Some(session) => Box::new(session),
            None => Box::new(PostHocMerger::new(
                self.store.clone(),
                self.aggregator.clone(),
                self.sessions.clone(),
                token.clone(),
            )),
        };

        let first = assembler.assemble(&row, &chunks).await;
        let outcome = match first {
            Ok(outcome) => Ok(outcome),
            Err(EngineError::Integrity(IntegrityKind::HashMismatch { expected, actual })) => {
                // Corrupt chunk bytes cannot be healed by re-merging
                Err(EngineError::Integrity(IntegrityKind::HashMismatch {
                    expected,
                    actual,
                }))
            }
            Err(first_err) => {
                warn!(
                    "Merge failed for download {id} ({first_err}); retrying once silently"
                );
                // Cancellation between the failure and the retry wins
                if !self.sessions.is_current(&token).await {
                    self.cleanup_cancelled_merge(&row).await;
                    return;
                }
                let mut second = PostHocMerger::new(
                    self.store.clone(),
                    self.aggregator.clone(),
                    self.sessions.clone(),
                    token.clone(),
                );
                second.assemble(&row, &chunks).await
            }
        };

        match outcome {
            Ok(MergeOutcome::Completed) => {}
            Ok(MergeOutcome::Cancelled) => {
                self.cleanup_cancelled_merge(&row).await;
                return;
            }
            Err(err) => {
                self.fail_download(&row, &err, true).await;
                return;
            }
        }

        if self
            .store
            .transition(id, DownloadState::Verifying, Some(DownloadState::Merging))
            .await
            .is_err()
        {
            return;
        }
        self.signal_state_changed();

        match self.verify(&row).await {
            Ok(actual_hash) => {
                self.complete_download(&row, actual_hash).await;
            }
            Err(err) => {
                self.fail_download(&row, &err, false).await;
            }
        }
    }

    /// Final size and (optional) hash check of the assembled artifact.
    async fn verify(&self, row: &DownloadRow) -> Result<Option<String>, EngineError> {
        let metadata = tokio::fs::metadata(&row.save_path).await?;
        if metadata.len() != row.total_bytes as u64 {
            return Err(EngineError::Integrity(IntegrityKind::SizeMismatch {
                expected: row.total_bytes as u64,
                actual: metadata.len(),
            }));
        }

        if self.config.downloads.skip_verification {
            return Ok(None);
        }

        let path = std::path::PathBuf::from(&row.save_path);
        let actual = checkpoint::sha256_file(&path)
            .await
            .map_err(|e| EngineError::Disk(e.to_string()))?;

        if let Some(ref expected) = row.expected_hash {
            if !expected.eq_ignore_ascii_case(&actual) {
                return Err(EngineError::Integrity(IntegrityKind::HashMismatch {
                    expected: expected.clone(),
                    actual,
                }));
            }
        }

        Ok(Some(actual))
    }

    async fn complete_download(&self, row: &DownloadRow, actual_hash: Option<String>) {
        let id = row.id;

        let _ = self
            .store
            .update(
                id,
                DownloadPatch {
                    downloaded_bytes: Some(row.total_bytes),
                    progress: Some(1.0),
                    actual_hash: Some(actual_hash),
                    verified: Some(!self.config.downloads.skip_verification),
                    last_error: Some(None),
                    ..Default::default()
                },
            )
            .await;

        if let Err(e) = self
            .store
            .transition(id, DownloadState::Completed, Some(DownloadState::Verifying))
            .await
        {
            error!("Download {id} could not reach completed: {e}");
            return;
        }

        let _ = self.store.delete_chunks(id).await;
        let _ = self.chunk_store.delete_all_chunks(id).await;
        self.aggregator.clear(id).await;
        self.sessions.invalidate(id).await;

        let duration_ms = row
            .started_at
            .map(|started| (chrono::Utc::now().naive_utc() - started).num_milliseconds());
        let _ = self
            .store
            .record_history(NewHistory {
                download_id: id,
                title: row.title.clone(),
                url: row.url.clone(),
                save_path: row.save_path.clone(),
                total_bytes: row.total_bytes,
                outcome: "completed".into(),
                duration_ms,
            })
            .await;

        self.signal_state_changed();
        self.events
            .publish(EngineEvent::DownloadCompleted {
                download_id: id,
                save_path: row.save_path.clone(),
            })
            .await;
        info!("Download {id} completed into {}", row.save_path);
    }

    async fn fail_download(&self, row: &DownloadRow, err: &EngineError, during_merge: bool) {
        let id = row.id;
        warn!("Download {id} failed: {err}");

        let _ = self
            .store
            .update(
                id,
                DownloadPatch {
                    last_error: Some(Some(err.to_string())),
                    retry_count: Some(row.retry_count + 1),
                    ..Default::default()
                },
            )
            .await;

        // The download may have been paused or cancelled in the meantime;
        // in that case the terminal transition loses and that is correct
        if let Err(e) = self.store.transition(id, DownloadState::Failed, None).await {
            debug!("Download {id} not moved to failed: {e}");
            return;
        }
        self.sessions.invalidate(id).await;

        let _ = self
            .store
            .record_history(NewHistory {
                download_id: id,
                title: row.title.clone(),
                url: row.url.clone(),
                save_path: row.save_path.clone(),
                total_bytes: row.total_bytes,
                outcome: "failed".into(),
                duration_ms: None,
            })
            .await;

        self.signal_state_changed();
        self.events
            .publish(EngineEvent::DownloadFailed {
                download_id: id,
                error: err.to_string(),
                failed_during_merge: during_merge,
            })
            .await;
    }

    /// Cancellation arrived mid-merge: remove the staging file, the chunk
    /// temp files, and the (possibly partial) target; raise nothing.
    async fn cleanup_cancelled_merge(&self, row: &DownloadRow) {
        info!("Download {} cancelled during merge; cleaning up", row.id);
        let staging = staging_path(&row.save_path);
        if staging.exists() {
            let _ = tokio::fs::remove_file(&staging).await;
        }
        let _ = self.chunk_store.delete_all_chunks(row.id).await;
        if std::path::Path::new(&row.save_path).exists() {
            let _ = tokio::fs::remove_file(&row.save_path).await;
        }
        self.aggregator.clear(row.id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::store::SqliteStateStore;
    use tempfile::TempDir;

    async fn engine_with_tempdir() -> (Arc<Engine>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn StateStore> = Arc::new(
            SqliteStateStore::open_in_memory(10, Duration::from_millis(50))
                .await
                .unwrap(),
        );
        let mut config = EngineConfig::default();
        config.downloads.max_chunk_retries = 1;
        config.retry.unknown.base_delay_ms = 10;
        config.retry.unknown.max_delay_ms = 20;
        let engine = Engine::with_store(config, store, dir.path().join("tmp"))
            .await
            .unwrap();
        (engine, dir)
    }

    fn params(url: &str, save: &str, total: u64) -> AddDownloadParams {
        AddDownloadParams {
            title: "Test".into(),
            url: url.into(),
            save_path: save.into(),
            total_bytes: total,
            priority: 2,
            force_overwrite: false,
            expected_hash: None,
            start_paused: true,
        }
    }

    #[tokio::test]
    async fn test_add_validates_host() {
        let (engine, dir) = engine_with_tempdir().await;
        let save = dir.path().join("f.bin").display().to_string();

        let err = engine
            .add_download(params("not a url", &save, 10))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::State(StateError::HostNotAllowed { .. })
        ));
        engine.close().await;
    }

    #[tokio::test]
    async fn test_add_paused_then_cancel_and_resume() {
        let (engine, dir) = engine_with_tempdir().await;
        let save = dir.path().join("f.bin").display().to_string();

        let snapshot = engine
            .add_download(params("http://files.example.com/f.bin", &save, 10))
            .await
            .unwrap();
        assert_eq!(snapshot.downloads.len(), 1);
        let id = snapshot.downloads[0].id;
        assert_eq!(snapshot.downloads[0].state, DownloadState::Paused);

        let snapshot = engine.cancel_download(id).await.unwrap();
        assert_eq!(snapshot.downloads[0].state, DownloadState::Cancelled);

        // Resuming re-queues it; the scheduler may already be driving it,
        // so only the direction of travel is asserted
        let snapshot = engine.resume_download(id).await.unwrap();
        let state = snapshot.downloads[0].state;
        assert!(!state.is_terminal() && state != DownloadState::Paused);
        engine.close().await;
    }

    #[tokio::test]
    async fn test_existing_target_needs_confirmation() {
        let (engine, dir) = engine_with_tempdir().await;
        let save = dir.path().join("exists.bin");
        tokio::fs::write(&save, b"already here").await.unwrap();
        let save = save.display().to_string();

        let mut confirmations = engine.subscribe_to(vec![EventKind::NeedsConfirmation]);

        let mut p = params("http://files.example.com/f.bin", &save, 10);
        p.start_paused = false;
        let snapshot = engine.add_download(p).await.unwrap();
        let id = snapshot.downloads[0].id;
        // Parked paused until the user answers
        assert_eq!(snapshot.downloads[0].state, DownloadState::Paused);

        let event = confirmations.recv().await.unwrap();
        assert_eq!(event.download_id(), Some(id));

        let snapshot = engine.confirm_overwrite(id).await.unwrap();
        let state = snapshot.downloads[0].state;
        assert!(state != DownloadState::Paused && !state.is_terminal());
        assert!(snapshot.downloads[0].force_overwrite);
        engine.close().await;
    }

    #[tokio::test]
    async fn test_allow_list_enforced() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn StateStore> = Arc::new(
            SqliteStateStore::open_in_memory(10, Duration::from_millis(50))
                .await
                .unwrap(),
        );
        let mut config = EngineConfig::default();
        config.paths.allowed_hosts = vec!["files.example.com".into()];
        let engine = Engine::with_store(config, store, dir.path().join("tmp"))
            .await
            .unwrap();

        let save = dir.path().join("f.bin").display().to_string();
        let err = engine
            .add_download(params("http://evil.example.org/f.bin", &save, 10))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::State(StateError::HostNotAllowed { .. })
        ));

        engine
            .add_download(params("http://files.example.com/f.bin", &save, 10))
            .await
            .unwrap();
        engine.close().await;
    }

    #[tokio::test]
    async fn test_session_metrics() {
        let (engine, dir) = engine_with_tempdir().await;
        let save = dir.path().join("f.bin").display().to_string();
        engine
            .add_download(params("http://files.example.com/f.bin", &save, 128))
            .await
            .unwrap();

        let metrics = engine.get_session_metrics().await.unwrap();
        assert_eq!(metrics.paused_downloads, 1);
        assert_eq!(metrics.total_bytes, 128);
        engine.close().await;
    }

    #[tokio::test]
    async fn test_restart_stopped_with_overwrite() {
        let (engine, dir) = engine_with_tempdir().await;
        let save = dir.path().join("f.bin").display().to_string();
        let snapshot = engine
            .add_download(params("http://files.example.com/f.bin", &save, 10))
            .await
            .unwrap();
        let id = snapshot.downloads[0].id;

        // Drive the row into FAILED through the store
        engine
            .store
            .transition(id, DownloadState::Queued, None)
            .await
            .unwrap();
        engine
            .store
            .transition(id, DownloadState::Failed, None)
            .await
            .unwrap();

        let snapshot = engine.restart_stopped_with_overwrite(None).await.unwrap();
        let state = snapshot.downloads[0].state;
        assert!(state != DownloadState::Failed);
        assert!(snapshot.downloads[0].force_overwrite);
        engine.close().await;
    }

    #[tokio::test]
    async fn test_clear_finished_removes_rows() {
        let (engine, dir) = engine_with_tempdir().await;
        let save = dir.path().join("f.bin").display().to_string();
        let snapshot = engine
            .add_download(params("http://files.example.com/f.bin", &save, 10))
            .await
            .unwrap();
        let id = snapshot.downloads[0].id;
        engine.cancel_download(id).await.unwrap();

        let snapshot = engine
            .clear_finished(&[DownloadState::Cancelled])
            .await
            .unwrap();
        assert!(snapshot.downloads.is_empty());
        engine.close().await;
    }
}
