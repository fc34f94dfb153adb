pub mod connection;
pub mod models;
pub mod store;

pub use models::{
    AttemptRow, ChunkPatch, ChunkRow, DownloadPatch, DownloadRow, HistoryRow, IncrementalSnapshot,
    NewAttempt, NewChunk, NewDownload, NewHistory, QueueSummary, Snapshot,
};
pub use store::{SqliteStateStore, StateStore, TransitionObserver};
