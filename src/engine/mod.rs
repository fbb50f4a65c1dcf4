//! 下载引擎：队列调度、分块扇出、暂停恢复、合并与持久化

mod assembler;
mod chunk;
mod entry;
mod error;
mod events;
mod manager;
mod persistence;
mod supervisor;
mod types;

pub use error::EngineError;
pub use events::DownloadEvent;
pub use manager::DownloadManager;
pub use persistence::{load_store, save_store, PersistedChunk, PersistedEntry};
pub use types::{
    chunk_ranges, ChunkSnapshot, ChunkStatus, DownloadId, DownloadSnapshot, DownloadStatus,
    ProgressUpdate,
};
