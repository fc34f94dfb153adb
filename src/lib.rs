// Chunked download engine: persistent queue, ranged transfers, resumable
// assembly. The embedding application talks to `engine::Engine`; everything
// else is plumbing behind it.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod events;
pub mod transfer;

pub use config::EngineConfig;
pub use db::models::{DownloadRow, QueueSummary, Snapshot};
pub use engine::state_machine::{ChunkState, DownloadState};
pub use engine::{AddDownloadParams, Engine, SessionMetrics};
pub use error::{EngineError, RetryCategory};
pub use events::{EngineEvent, EventBus, EventKind, EventSubscriber};
