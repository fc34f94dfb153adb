pub mod assembler;
pub mod buffer_pool;
pub mod checkpoint;
pub mod chunk_downloader;
pub mod chunk_sizer;
pub mod chunk_store;
pub mod metrics;
pub mod progress;
pub mod response;
pub mod retry;
pub mod write_buffer;

pub use assembler::{Assembler, IncrementalMerger, MergeOutcome, PostHocMerger};
pub use buffer_pool::{BufferPool, BufferPoolStats};
pub use chunk_downloader::{ChunkDownloader, DownloadOutcome};
pub use chunk_store::{ChunkStore, ReconcileReport};
pub use metrics::HostMetrics;
pub use progress::ProgressAggregator;
pub use response::{ChunkOutcome, ResponseHandler};
