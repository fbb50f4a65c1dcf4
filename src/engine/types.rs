use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub type DownloadId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Queued,
    Downloading,
    Paused,
    Assembling,
    Complete,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    Downloading,
    Paused,
    Complete,
    Error,
}

/// 静态分块：大小 S 均分为 n 块，块长取上整。
/// 恒定返回 n 个区间（两端含）；S < n 时尾部出现 end < start 的空块，
/// 空块不发请求、不产生分块文件。
pub fn chunk_ranges(total_size: u64, num_chunks: usize) -> Vec<(u64, u64)> {
    if total_size == 0 || num_chunks == 0 {
        return Vec::new();
    }
    let n = num_chunks as u64;
    let size = total_size.div_ceil(n);
    (0..n)
        .map(|i| {
            let start = i * size;
            let end = ((i + 1) * size - 1).min(total_size - 1);
            (start, end)
        })
        .collect()
}

/// 对外展示的分块状态
#[derive(Debug, Clone, Serialize)]
pub struct ChunkSnapshot {
    pub id: u32,
    pub start: u64,
    pub end: u64,
    pub status: ChunkStatus,
    pub downloaded: u64,
    pub speed_bps: u64,
}

/// 对外展示的下载条目快照
#[derive(Debug, Clone, Serialize)]
pub struct DownloadSnapshot {
    pub id: DownloadId,
    pub url: String,
    pub filename: String,
    pub final_path: PathBuf,
    pub temp_dir: Option<PathBuf>,
    pub total_size: u64,
    pub downloaded_size: u64,
    pub status: DownloadStatus,
    pub current_speed: u64,
    pub eta_secs: Option<u64>,
    pub error: Option<String>,
    pub created_at: i64,
    pub chunks: Vec<ChunkSnapshot>,
}

/// 周期广播的进度载荷
#[derive(Debug, Clone, Serialize)]
pub struct ProgressUpdate {
    pub id: DownloadId,
    /// 百分比，0.0 - 100.0
    pub progress: f64,
    pub downloaded: u64,
    pub total_size: u64,
    pub speed: u64,
    pub eta_secs: Option<u64>,
    pub filename: String,
    pub status: DownloadStatus,
    pub error: Option<String>,
}

impl ProgressUpdate {
    pub fn from_snapshot(s: &DownloadSnapshot) -> Self {
        let progress = if s.total_size == 0 {
            100.0
        } else {
            s.downloaded_size as f64 / s.total_size as f64 * 100.0
        };
        Self {
            id: s.id.clone(),
            progress,
            downloaded: s.downloaded_size,
            total_size: s.total_size,
            speed: s.current_speed,
            eta_secs: s.eta_secs,
            filename: s.filename.clone(),
            status: s.status,
            error: s.error.clone(),
        }
    }
}
