//! multifetch：多连接 HTTP 下载引擎
//!
//! 把单个资源拆成多个字节区间并行拉取，每个分块的进度随分块文件落盘，
//! 进程重启后可断点续传；同时处于下载中的条目数由队列调度器限制，
//! 引擎状态经由类型化事件通道对外广播。

pub mod config;
pub mod engine;
pub mod network;

pub use config::EngineConfig;
pub use engine::{
    ChunkSnapshot, ChunkStatus, DownloadEvent, DownloadId, DownloadManager, DownloadSnapshot,
    DownloadStatus, EngineError, ProgressUpdate,
};
pub use network::{NetworkError, ProbeResult};
